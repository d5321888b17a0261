pub mod cache;
pub mod catalog;
pub mod config;
pub mod facet;
pub mod filter;
pub mod migrate;
pub mod paginate;
pub mod record;
pub mod remote;
pub mod render;
pub mod runtime;
pub mod store;
