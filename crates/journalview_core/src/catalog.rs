use std::path::Path;

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{debug, info};

use crate::cache::{KeyValueStore, SyncOptions, SyncReport, load_cached_articles, sync_full_cache};
use crate::facet::{self, Facet};
use crate::filter::{FilterCriteria, filter};
use crate::paginate::{PageRequest, PageSlice, paginate};
use crate::record::{Article, sort_default};
use crate::remote::ArticleApi;
use crate::store::ArticleStore;

/// A queryable article collection.
pub trait Catalog {
    fn source(&self) -> SourceKind;
    fn search(&mut self, criteria: &FilterCriteria, request: PageRequest)
    -> Result<PageSlice<Article>>;
    fn journals(&mut self) -> Result<Vec<Facet>>;
    fn types(&mut self) -> Result<Vec<Facet>> {
        bail!("type facets are not available from the {} source", self.source().as_str())
    }
    fn tags(&mut self) -> Result<Vec<Facet>> {
        bail!("tag facets are not available from the {} source", self.source().as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Database,
    Cache,
    Remote,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Cache => "cache",
            Self::Remote => "remote",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SourcePreference {
    #[default]
    Auto,
    Database,
    Cache,
    Remote,
}

impl SourcePreference {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Some(Self::Auto),
            "db" | "database" => Some(Self::Database),
            "cache" => Some(Self::Cache),
            "remote" | "api" => Some(Self::Remote),
            _ => None,
        }
    }
}

pub struct DatabaseCatalog {
    store: ArticleStore,
}

impl DatabaseCatalog {
    pub fn new(store: ArticleStore) -> Self {
        Self { store }
    }
}

impl Catalog for DatabaseCatalog {
    fn source(&self) -> SourceKind {
        SourceKind::Database
    }

    fn search(
        &mut self,
        criteria: &FilterCriteria,
        request: PageRequest,
    ) -> Result<PageSlice<Article>> {
        self.store.search(criteria, request)
    }

    fn journals(&mut self) -> Result<Vec<Facet>> {
        self.store.journal_facets()
    }

    fn types(&mut self) -> Result<Vec<Facet>> {
        self.store.type_facets()
    }

    fn tags(&mut self) -> Result<Vec<Facet>> {
        self.store.tag_facets()
    }
}

/// In-memory copy of the full record set, kept in default order.
pub struct MemoryCatalog {
    records: Vec<Article>,
}

impl MemoryCatalog {
    pub fn new(mut records: Vec<Article>) -> Self {
        sort_default(&mut records);
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Catalog for MemoryCatalog {
    fn source(&self) -> SourceKind {
        SourceKind::Cache
    }

    fn search(
        &mut self,
        criteria: &FilterCriteria,
        request: PageRequest,
    ) -> Result<PageSlice<Article>> {
        let subset: Vec<&Article> = filter(&self.records, criteria);
        Ok(paginate(&subset, request).map(Article::clone))
    }

    fn journals(&mut self) -> Result<Vec<Facet>> {
        Ok(facet::journal_facets(&self.records))
    }

    fn types(&mut self) -> Result<Vec<Facet>> {
        Ok(facet::type_facets(&self.records))
    }

    fn tags(&mut self) -> Result<Vec<Facet>> {
        Ok(facet::tag_facets(&self.records))
    }
}

/// Server-side filtering and pagination over the REST backend.
pub struct RemoteCatalog<A: ArticleApi> {
    api: A,
}

impl<A: ArticleApi> RemoteCatalog<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }
}

impl<A: ArticleApi> Catalog for RemoteCatalog<A> {
    fn source(&self) -> SourceKind {
        SourceKind::Remote
    }

    fn search(
        &mut self,
        criteria: &FilterCriteria,
        request: PageRequest,
    ) -> Result<PageSlice<Article>> {
        let request = PageRequest::new(request.page, request.page_size);
        let mut remote = self.api.fetch_page(criteria, request)?;
        // Without a total the best known bound is what has been seen so far.
        let total = remote.total.unwrap_or_else(|| {
            (request.page - 1)
                .saturating_mul(request.page_size)
                .saturating_add(remote.items.len())
        });
        let (page, total_pages, offset) = request.resolve(total);
        if page != request.page {
            debug!(requested = request.page, clamped = page, "refetching clamped page");
            remote = self
                .api
                .fetch_page(criteria, PageRequest::new(page, request.page_size))?;
        }
        let mut items = remote.items;
        items.truncate(request.page_size);
        Ok(PageSlice {
            items,
            page,
            page_size: request.page_size,
            total,
            total_pages,
            offset,
        })
    }

    fn journals(&mut self) -> Result<Vec<Facet>> {
        let mut facets = self.api.journals()?;
        facet::sort_facets(&mut facets);
        Ok(facets)
    }
}

/// Result of [`resolve_catalog`]: the chosen catalog plus the sync report
/// when a sync ran on the way.
pub struct ResolvedCatalog {
    pub catalog: Box<dyn Catalog>,
    pub sync: Option<SyncReport>,
}

/// Pick a catalog.
///
/// `Auto` prefers an existing database file. Otherwise, with an API available,
/// it runs the daily cache sync and serves from the cache, falling back to
/// remote queries when the cache is still empty. Without an API it serves
/// whatever the cache holds.
pub fn resolve_catalog<A>(
    preference: SourcePreference,
    db_path: Option<&Path>,
    cache: &mut dyn KeyValueStore,
    api: Option<A>,
    sync_options: &SyncOptions,
    today: &str,
) -> Result<ResolvedCatalog>
where
    A: ArticleApi + 'static,
{
    match preference {
        SourcePreference::Database => {
            let Some(path) = db_path else {
                bail!("no article database configured (set [source].db_path)");
            };
            let store = ArticleStore::open(path)?;
            Ok(ResolvedCatalog {
                catalog: Box::new(DatabaseCatalog::new(store)),
                sync: None,
            })
        }
        SourcePreference::Cache => {
            let records = load_cached_articles(&*cache)?;
            if records.is_empty() {
                bail!("article cache is empty; run `journalview sync` first");
            }
            Ok(ResolvedCatalog {
                catalog: Box::new(MemoryCatalog::new(records)),
                sync: None,
            })
        }
        SourcePreference::Remote => {
            let Some(api) = api else {
                bail!("no REST backend configured (set [source].api_url)");
            };
            Ok(ResolvedCatalog {
                catalog: Box::new(RemoteCatalog::new(api)),
                sync: None,
            })
        }
        SourcePreference::Auto => {
            if let Some(path) = db_path
                && path.exists()
            {
                debug!(path = %path.display(), "using article database");
                let store = ArticleStore::open(path)?;
                return Ok(ResolvedCatalog {
                    catalog: Box::new(DatabaseCatalog::new(store)),
                    sync: None,
                });
            }

            let Some(mut api) = api else {
                let records = load_cached_articles(&*cache)?;
                if records.is_empty() {
                    bail!(
                        "no article source available: configure [source].db_path or [source].api_url"
                    );
                }
                return Ok(ResolvedCatalog {
                    catalog: Box::new(MemoryCatalog::new(records)),
                    sync: None,
                });
            };

            let report = sync_full_cache(&mut api, &mut *cache, sync_options, today)?;
            let records = load_cached_articles(&*cache)?;
            let catalog: Box<dyn Catalog> = if records.is_empty() {
                info!("article cache unavailable; querying the REST backend directly");
                Box::new(RemoteCatalog::new(api))
            } else {
                Box::new(MemoryCatalog::new(records))
            };
            Ok(ResolvedCatalog {
                catalog,
                sync: Some(report),
            })
        }
    }
}
