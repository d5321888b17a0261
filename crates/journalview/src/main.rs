use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use journalview_core::cache::{
    CacheState, MemoryKvStore, SqliteKvStore, SyncOptions, SyncOutcome, SyncReport,
    sync_full_cache, today_marker,
};
use journalview_core::catalog::{Catalog, ResolvedCatalog, SourcePreference, resolve_catalog};
use journalview_core::config::{
    JournalConfig, SourceConfigPatch, load_config, patch_source_config,
};
use journalview_core::facet::Facet;
use journalview_core::filter::FilterCriteria;
use journalview_core::paginate::{PageRequest, PageSlice};
use journalview_core::record::{Article, DisplayLang};
use journalview_core::remote::{RestClient, RestClientConfig};
use journalview_core::render::{QueryLinker, export_pages, render_page_document, render_text};
use journalview_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, ensure_runtime_ready,
    init_layout, inspect_runtime, resolve_paths,
};
use journalview_core::store::ArticleStore;
use serde::Serialize;
use tracing::warn;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(
    name = "journalview",
    version,
    about = "Browse, filter, and page through journal article records"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(short, long, global = true, help = "Log progress to stderr")]
    verbose: bool,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the .journalview/ layout and a default config
    Init(InitArgs),
    /// Show resolved paths, database and cache state
    Status,
    /// Filter and page through articles
    Search(SearchArgs),
    /// List journals with article counts
    Journals(FacetArgs),
    /// List article types with counts
    Types(FacetArgs),
    /// List topic tags with article counts
    Tags(FacetArgs),
    /// Refresh the local full cache (at most once per day)
    Sync(SyncArgs),
    /// Load articles from a JSON array into the article database
    Import(ImportArgs),
    /// Write the filtered result set as static HTML pages
    Export(ExportArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing config.toml")]
    no_config: bool,
    #[arg(
        long,
        value_name = "PATH",
        conflicts_with = "no_config",
        help = "Record [source].db_path in config.toml"
    )]
    db_path: Option<String>,
    #[arg(
        long,
        value_name = "URL",
        conflicts_with = "no_config",
        help = "Record [source].api_url in config.toml"
    )]
    api_url: Option<String>,
}

impl InitArgs {
    fn source_patch(&self) -> SourceConfigPatch {
        SourceConfigPatch {
            set_db_path: self.db_path.clone(),
            set_api_url: self.api_url.clone(),
        }
    }
}

#[derive(Debug, Args)]
struct FilterArgs {
    #[arg(short = 'q', long = "query", value_name = "KEYWORDS")]
    query: Option<String>,
    #[arg(long)]
    journal: Option<String>,
    #[arg(long, value_name = "YYYY-MM-DD")]
    from: Option<String>,
    #[arg(long, value_name = "YYYY-MM-DD")]
    to: Option<String>,
    #[arg(long = "type", value_name = "TYPE")]
    types: Vec<String>,
    #[arg(long = "tag", value_name = "TAG")]
    tags: Vec<String>,
}

impl FilterArgs {
    fn criteria(&self) -> FilterCriteria {
        FilterCriteria {
            keyword: self.query.clone().unwrap_or_default(),
            journal: self.journal.clone(),
            date_from: self.from.clone(),
            date_to: self.to.clone(),
            types: self.types.clone(),
            tags: self.tags.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceArg {
    Auto,
    #[value(alias = "database")]
    Db,
    Cache,
    Remote,
}

impl From<SourceArg> for SourcePreference {
    fn from(value: SourceArg) -> Self {
        match value {
            SourceArg::Auto => Self::Auto,
            SourceArg::Db => Self::Database,
            SourceArg::Cache => Self::Cache,
            SourceArg::Remote => Self::Remote,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LangArg {
    Auto,
    Zh,
    En,
}

impl From<LangArg> for DisplayLang {
    fn from(value: LangArg) -> Self {
        match value {
            LangArg::Auto => Self::Auto,
            LangArg::Zh => Self::Zh,
            LangArg::En => Self::En,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
    Html,
}

#[derive(Debug, Args)]
struct SearchArgs {
    #[command(flatten)]
    filters: FilterArgs,
    #[arg(long, default_value_t = 1)]
    page: usize,
    #[arg(long)]
    page_size: Option<usize>,
    #[arg(long, value_enum)]
    lang: Option<LangArg>,
    #[arg(long, value_enum, default_value = "auto")]
    source: SourceArg,
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,
}

#[derive(Debug, Args)]
struct FacetArgs {
    #[arg(long, value_enum, default_value = "auto")]
    source: SourceArg,
    #[arg(long, help = "Print JSON instead of text")]
    json: bool,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long, help = "Download even if the cache was synced today")]
    force: bool,
    #[arg(long, help = "Print JSON instead of text")]
    json: bool,
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[arg(value_name = "JSON_FILE")]
    path: PathBuf,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[command(flatten)]
    filters: FilterArgs,
    #[arg(long, value_name = "DIR")]
    out: Option<PathBuf>,
    #[arg(long)]
    page_size: Option<usize>,
    #[arg(long, value_enum)]
    lang: Option<LangArg>,
    #[arg(long, value_enum, default_value = "auto")]
    source: SourceArg,
}

struct Workspace {
    paths: ResolvedPaths,
    config: JournalConfig,
}

impl Workspace {
    fn db_path(&self) -> PathBuf {
        self.config
            .db_path(&self.paths.project_root)
            .unwrap_or_else(|| self.paths.db_path.clone())
    }

    fn sync_options(&self, force: bool) -> SyncOptions {
        SyncOptions {
            page_size: self.config.sync_page_size(),
            max_pages: self.config.sync_max_pages(),
            force,
        }
    }

    fn rest_client(&self) -> Result<Option<RestClient>> {
        if self.config.api_url().is_none() {
            return Ok(None);
        }
        let client = RestClient::new(RestClientConfig::from_config(&self.config)?)?;
        Ok(Some(client))
    }

    fn open_catalog(&self, source: SourceArg) -> Result<ResolvedCatalog> {
        let preference = SourcePreference::from(source);
        let api = match preference {
            SourcePreference::Auto | SourcePreference::Remote => self.rest_client()?,
            SourcePreference::Database | SourcePreference::Cache => None,
        };
        let db_path = self.db_path();
        let sync_options = self.sync_options(false);
        let today = today_marker();
        let resolved = match preference {
            SourcePreference::Auto | SourcePreference::Cache => {
                let mut cache = SqliteKvStore::open(&self.paths.cache_path)?;
                resolve_catalog(
                    preference,
                    Some(&db_path),
                    &mut cache,
                    api,
                    &sync_options,
                    &today,
                )?
            }
            SourcePreference::Database | SourcePreference::Remote => {
                let mut cache = MemoryKvStore::default();
                resolve_catalog(
                    preference,
                    Some(&db_path),
                    &mut cache,
                    api,
                    &sync_options,
                    &today,
                )?
            }
        };
        if let Some(report) = &resolved.sync
            && let SyncOutcome::Aborted { reason } = &report.outcome
        {
            warn!(%reason, "daily cache sync failed; results may come from the REST backend");
        }
        Ok(resolved)
    }
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Search(args)) => run_search(&runtime, args),
        Some(Commands::Journals(args)) => run_facets(&runtime, args, FacetKind::Journals),
        Some(Commands::Types(args)) => run_facets(&runtime, args, FacetKind::Types),
        Some(Commands::Tags(args)) => run_facets(&runtime, args, FacetKind::Tags),
        Some(Commands::Sync(args)) => run_sync(&runtime, args),
        Some(Commands::Import(args)) => run_import(&runtime, args),
        Some(Commands::Export(args)) => run_export(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "journalview=info,journalview_core=info"
    } else {
        "journalview=warn,journalview_core=warn"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;
    let patched_config = patch_source_config(&paths.config_path, &args.source_patch())?;

    println!("Initialized journalview runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("cache_path: {}", normalize_path(&paths.cache_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("patched_config: {patched_config}");
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let workspace = load_workspace(runtime)?;
    let paths = &workspace.paths;
    let db_path = workspace.db_path();
    let status = inspect_runtime(paths, &db_path)?;

    println!("runtime status");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!(
        "project_root_exists: {}",
        format_flag(status.project_root_exists)
    );
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("data_dir_exists: {}", format_flag(status.data_dir_exists));
    println!("config_exists: {}", format_flag(status.config_exists));
    println!("db_path: {}", normalize_path(&db_path));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!("db_size_bytes: {}", format_size(status.db_size_bytes));
    if status.db_exists {
        let opened = ArticleStore::open(&db_path)
            .and_then(|store| Ok((store.stats()?, store.pending_migrations()?)));
        match opened {
            Ok((stats, pending)) => {
                println!("db.articles: {}", stats.articles);
                println!("db.pending_migrations: {pending}");
                println!("db.journals: {}", stats.journals);
                println!(
                    "db.newest_update: {}",
                    stats.newest_update.as_deref().unwrap_or("n/a")
                );
            }
            Err(error) => println!("db.error: {error:#}"),
        }
    }
    println!("cache_path: {}", normalize_path(&paths.cache_path));
    println!("cache_exists: {}", format_flag(status.cache_exists));
    println!("cache_size_bytes: {}", format_size(status.cache_size_bytes));
    if status.cache_exists {
        let cache = SqliteKvStore::open(&paths.cache_path)?;
        let state = CacheState::load(&cache)?;
        println!("cache.records: {}", state.record_count);
        println!(
            "cache.last_sync_day: {}",
            state.last_sync_day.as_deref().unwrap_or("never")
        );
        println!(
            "cache.last_sync_at: {}",
            state.last_sync_at.as_deref().unwrap_or("n/a")
        );
    }
    println!(
        "api_url: {}",
        workspace.config.api_url().as_deref().unwrap_or("<unset>")
    );
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

#[derive(Serialize)]
struct SearchOutput<'a> {
    source: &'static str,
    lang: &'static str,
    #[serde(flatten)]
    page: &'a PageSlice<Article>,
}

fn run_search(runtime: &RuntimeOptions, args: SearchArgs) -> Result<()> {
    let workspace = load_workspace(runtime)?;
    let criteria = args.filters.criteria();
    let lang = args
        .lang
        .map(DisplayLang::from)
        .unwrap_or_else(|| workspace.config.display_lang());
    let page_size = args
        .page_size
        .unwrap_or_else(|| workspace.config.page_size());

    let mut resolved = workspace.open_catalog(args.source)?;
    let slice = resolved
        .catalog
        .search(&criteria, PageRequest::new(args.page, page_size))?;

    match args.format {
        OutputFormat::Text => print!("{}", render_text(&slice, lang)),
        OutputFormat::Json => {
            let output = SearchOutput {
                source: resolved.catalog.source().as_str(),
                lang: lang.as_str(),
                page: &slice,
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&output).context("failed to encode results")?
            );
        }
        OutputFormat::Html => {
            let linker = QueryLinker {
                criteria: &criteria,
                page_size,
            };
            print!(
                "{}",
                render_page_document(&slice, lang, "Journal articles", &linker)
            );
        }
    }
    if runtime.diagnostics {
        eprintln!("source: {}", resolved.catalog.source().as_str());
        eprintln!("\n[diagnostics]\n{}", workspace.paths.diagnostics());
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum FacetKind {
    Journals,
    Types,
    Tags,
}

fn run_facets(runtime: &RuntimeOptions, args: FacetArgs, kind: FacetKind) -> Result<()> {
    let workspace = load_workspace(runtime)?;
    let mut resolved = workspace.open_catalog(args.source)?;
    let facets = match kind {
        FacetKind::Journals => resolved.catalog.journals()?,
        FacetKind::Types => resolved.catalog.types()?,
        FacetKind::Tags => resolved.catalog.tags()?,
    };
    print_facets(&facets, args.json)?;
    if runtime.diagnostics {
        eprintln!("source: {}", resolved.catalog.source().as_str());
    }
    Ok(())
}

fn print_facets(facets: &[Facet], json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(facets).context("failed to encode facets")?
        );
        return Ok(());
    }
    if facets.is_empty() {
        println!("<empty>");
    }
    for facet in facets {
        println!("{:>6}  {}", facet.count, facet.value);
    }
    Ok(())
}

fn run_sync(runtime: &RuntimeOptions, args: SyncArgs) -> Result<()> {
    let workspace = load_workspace(runtime)?;
    let status = inspect_runtime(&workspace.paths, &workspace.db_path())?;
    ensure_runtime_ready(&workspace.paths, &status)?;

    let mut client = RestClient::new(RestClientConfig::from_config(&workspace.config)?)?;
    let mut cache = SqliteKvStore::open(&workspace.paths.cache_path)?;
    let report = sync_full_cache(
        &mut client,
        &mut cache,
        &workspace.sync_options(args.force),
        &today_marker(),
    )?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to encode sync report")?
        );
    } else {
        print_sync_report(client.api_url(), &report);
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", workspace.paths.diagnostics());
    }
    Ok(())
}

fn print_sync_report(api_url: &str, report: &SyncReport) {
    println!("sync.api_url: {api_url}");
    println!("sync.day: {}", report.day);
    match &report.outcome {
        SyncOutcome::Skipped { reason } => {
            println!("sync.status: skipped");
            println!("sync.reason: {reason:?}");
        }
        SyncOutcome::Downloaded {
            reason,
            records,
            pages,
            last_sync_at,
        } => {
            println!("sync.status: downloaded");
            println!("sync.reason: {reason:?}");
            println!("sync.records: {records}");
            println!("sync.pages: {pages}");
            println!(
                "sync.last_sync_at: {}",
                last_sync_at.as_deref().unwrap_or("n/a")
            );
        }
        SyncOutcome::Aborted { reason } => {
            println!("sync.status: aborted");
            println!("sync.reason: {reason}");
        }
    }
    println!("sync.requests: {}", report.request_count);
}

fn run_import(runtime: &RuntimeOptions, args: ImportArgs) -> Result<()> {
    let workspace = load_workspace(runtime)?;
    let db_path = workspace.db_path();
    let status = inspect_runtime(&workspace.paths, &db_path)?;
    ensure_runtime_ready(&workspace.paths, &status)?;

    let mut store = ArticleStore::open_or_create(&db_path)?;
    let report = store.import_json(&args.path)?;
    let stats = store.stats()?;

    println!("import.source: {}", normalize_path(&args.path));
    println!("import.db_path: {}", normalize_path(&db_path));
    println!("import.read: {}", report.read);
    println!("import.imported: {}", report.imported);
    println!("import.skipped: {}", report.skipped);
    println!("db.articles: {}", stats.articles);
    println!("db.journals: {}", stats.journals);
    Ok(())
}

fn run_export(runtime: &RuntimeOptions, args: ExportArgs) -> Result<()> {
    let workspace = load_workspace(runtime)?;
    let criteria = args.filters.criteria();
    let lang = args
        .lang
        .map(DisplayLang::from)
        .unwrap_or_else(|| workspace.config.display_lang());
    let page_size = args
        .page_size
        .unwrap_or_else(|| workspace.config.page_size());
    let out_dir = args
        .out
        .clone()
        .unwrap_or_else(|| workspace.paths.exports_dir.clone());

    let mut resolved = workspace.open_catalog(args.source)?;
    let report = export_pages(
        resolved.catalog.as_mut(),
        &criteria,
        lang,
        page_size,
        &out_dir,
    )?;

    println!("export.source: {}", resolved.catalog.source().as_str());
    println!("export.out_dir: {}", normalize_path(&report.out_dir));
    println!("export.pages: {}", report.pages);
    println!("export.records: {}", report.records);
    Ok(())
}

fn load_workspace(runtime: &RuntimeOptions) -> Result<Workspace> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    Ok(Workspace { paths, config })
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

fn format_size(value: Option<u64>) -> String {
    value
        .map(|size| size.to_string())
        .unwrap_or_else(|| "n/a".to_string())
}
