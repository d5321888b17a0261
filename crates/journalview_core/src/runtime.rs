use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::config::{DEFAULT_SYNC_MAX_PAGES, DEFAULT_SYNC_PAGE_SIZE, DEFAULT_USER_AGENT};
use crate::paginate::DEFAULT_PAGE_SIZE;

pub const STATE_DIR_NAME: &str = ".journalview";
pub const ARTICLE_DB_FILENAME: &str = "articles.db";
pub const CACHE_DB_FILENAME: &str = "cache.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub executable_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let executable_dir = env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        Ok(Self {
            cwd,
            executable_dir,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Default article database; `[source].db_path` takes precedence.
    pub db_path: PathBuf,
    pub cache_path: PathBuf,
    pub exports_dir: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\ndata_dir={} ({})\ndb_path={}\ncache_path={}\nconfig_path={} ({})",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.data_dir),
            self.data_source.as_str(),
            normalize_for_display(&self.db_path),
            normalize_for_display(&self.cache_path),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub project_root_exists: bool,
    pub state_dir_exists: bool,
    pub data_dir_exists: bool,
    pub db_exists: bool,
    pub db_size_bytes: Option<u64>,
    pub cache_exists: bool,
    pub cache_size_bytes: Option<u64>,
    pub config_exists: bool,
    pub warnings: Vec<String>,
}

/// Inspect the layout. `db_path` is the effective article database, which may
/// live outside the data directory when configured.
pub fn inspect_runtime(paths: &ResolvedPaths, db_path: &Path) -> Result<RuntimeStatus> {
    let state_dir_exists = paths.state_dir.exists();
    let db_size_bytes = file_size(db_path)?;
    let cache_size_bytes = file_size(&paths.cache_path)?;
    let config_exists = paths.config_path.exists();

    let mut warnings = Vec::new();
    if !state_dir_exists {
        warnings.push(format!(
            "{STATE_DIR_NAME}/ is missing; run `journalview init` first"
        ));
    }
    if db_size_bytes.is_none() && cache_size_bytes.is_none() {
        warnings.push(
            "no article database or cache found; run `journalview import` or `journalview sync`"
                .to_string(),
        );
    }

    Ok(RuntimeStatus {
        project_root_exists: paths.project_root.exists(),
        state_dir_exists,
        data_dir_exists: paths.data_dir.exists(),
        db_exists: db_size_bytes.is_some(),
        db_size_bytes,
        cache_exists: cache_size_bytes.is_some(),
        cache_size_bytes,
        config_exists,
        warnings,
    })
}

pub fn ensure_runtime_ready(paths: &ResolvedPaths, status: &RuntimeStatus) -> Result<()> {
    if !status.state_dir_exists {
        bail!(
            "Runtime layout is not initialized.\nMissing required path:\n  - {}/ (missing)\nRun: journalview init --project-root {}",
            STATE_DIR_NAME,
            normalize_for_display(&paths.project_root)
        );
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub materialize_config: bool,
    pub force: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            materialize_config: true,
            force: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env)
        .context("failed to resolve project root")?;
    let state_dir = project_root.join(STATE_DIR_NAME);

    let (data_dir, data_source) = layered_path(
        overrides.data_dir.as_deref(),
        lookup_env("JOURNALVIEW_DATA_DIR"),
        state_dir.join("data"),
        &project_root,
    );
    let (config_path, config_source) = layered_path(
        overrides.config.as_deref(),
        lookup_env("JOURNALVIEW_CONFIG"),
        state_dir.join("config.toml"),
        &project_root,
    );

    Ok(ResolvedPaths {
        db_path: data_dir.join(ARTICLE_DB_FILENAME),
        cache_path: data_dir.join(CACHE_DB_FILENAME),
        exports_dir: state_dir.join("exports"),
        project_root,
        state_dir,
        data_dir,
        config_path,
        root_source,
        data_source,
        config_source,
    })
}

fn layered_path(
    flag: Option<&Path>,
    env_value: Option<String>,
    default: PathBuf,
    project_root: &Path,
) -> (PathBuf, ValueSource) {
    if let Some(path) = flag {
        return (absolutize(path, project_root), ValueSource::Flag);
    }
    if let Some(value) = env_value.filter(|value| !value.trim().is_empty()) {
        return (
            absolutize(Path::new(value.trim()), project_root),
            ValueSource::Env,
        );
    }
    (default, ValueSource::Default)
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    for dir in [&paths.state_dir, &paths.data_dir, &paths.exports_dir] {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = if options.materialize_config {
        write_text_file(
            &paths.config_path,
            &render_materialized_config(paths),
            options.force,
        )?
    } else {
        false
    };

    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

pub fn render_materialized_config(paths: &ResolvedPaths) -> String {
    let db_path = normalize_for_display(&paths.db_path);
    format!(
        "# journalview configuration (materialized by `journalview init`)\n\n[source]\n# Article database; defaults to {db_path}\n# db_path = \"data/rss_state.db\"\n# REST backend used by `journalview sync` and remote queries\n# api_url = \"https://articles.example.org/api\"\n# user_agent = \"{DEFAULT_USER_AGENT}\"\n\n[browse]\npage_size = {DEFAULT_PAGE_SIZE}\n# auto | zh | en\nlang = \"auto\"\n\n[sync]\npage_size = {DEFAULT_SYNC_PAGE_SIZE}\nmax_pages = {DEFAULT_SYNC_MAX_PAGES}\n# timeout_ms = 30000\n# retries = 2\n# retry_delay_ms = 500\n# rate_limit_ms = 200\n",
    )
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> Result<(PathBuf, ValueSource)>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return Ok((absolutize(path, &context.cwd), ValueSource::Flag));
    }

    if let Some(value) = lookup_env("JOURNALVIEW_PROJECT_ROOT")
        && !value.trim().is_empty()
    {
        return Ok((
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        ));
    }

    match detect_project_root_heuristic(&context.cwd, context.executable_dir.as_deref()) {
        Some(root) => Ok((root, ValueSource::Heuristic)),
        None => Ok((context.cwd.clone(), ValueSource::Default)),
    }
}

fn detect_project_root_heuristic(cwd: &Path, executable_dir: Option<&Path>) -> Option<PathBuf> {
    let mut seen = HashSet::new();
    for candidate in candidate_roots(cwd, executable_dir) {
        let key = normalize_for_display(&candidate);
        if !seen.insert(key) {
            continue;
        }
        if candidate.join(STATE_DIR_NAME).is_dir() {
            return Some(candidate);
        }
    }
    None
}

fn candidate_roots(cwd: &Path, executable_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = cwd.ancestors().map(Path::to_path_buf).collect();
    if let Some(exe_dir) = executable_dir {
        out.extend(exe_dir.ancestors().map(Path::to_path_buf));
    }
    out
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn file_size(path: &Path) -> Result<Option<u64>> {
    if !path.exists() {
        return Ok(None);
    }
    let metadata =
        fs::metadata(path).with_context(|| format!("failed to inspect {}", path.display()))?;
    Ok(Some(metadata.len()))
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
