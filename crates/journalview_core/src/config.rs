use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use toml::Value;

use crate::paginate::DEFAULT_PAGE_SIZE;
use crate::record::DisplayLang;

pub const DEFAULT_USER_AGENT: &str = "journalview/0.1";
pub const DEFAULT_SYNC_PAGE_SIZE: usize = 500;
pub const DEFAULT_SYNC_MAX_PAGES: usize = 1_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RETRIES: usize = 2;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;
pub const DEFAULT_RATE_LIMIT_MS: u64 = 200;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct JournalConfig {
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub browse: BrowseSection,
    #[serde(default)]
    pub sync: SyncSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SourceSection {
    pub db_path: Option<String>,
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BrowseSection {
    pub page_size: Option<usize>,
    pub lang: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SyncSection {
    pub page_size: Option<usize>,
    pub max_pages: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
    pub rate_limit_ms: Option<u64>,
}

impl JournalConfig {
    /// REST backend base URL: env JOURNALVIEW_API_URL > config > None.
    pub fn api_url(&self) -> Option<String> {
        self.api_url_with(process_env)
    }

    pub fn api_url_with<F: Fn(&str) -> Option<String>>(&self, lookup: F) -> Option<String> {
        lookup_override(&lookup, "JOURNALVIEW_API_URL")
            .or_else(|| non_blank(self.source.api_url.as_deref()))
            .map(|url| url.trim_end_matches('/').to_string())
    }

    /// Article database path: env JOURNALVIEW_DB_PATH > config > None.
    /// Relative paths resolve against `project_root`.
    pub fn db_path(&self, project_root: &Path) -> Option<PathBuf> {
        self.db_path_with(project_root, process_env)
    }

    pub fn db_path_with<F: Fn(&str) -> Option<String>>(
        &self,
        project_root: &Path,
        lookup: F,
    ) -> Option<PathBuf> {
        lookup_override(&lookup, "JOURNALVIEW_DB_PATH")
            .or_else(|| non_blank(self.source.db_path.as_deref()))
            .map(|value| {
                let path = PathBuf::from(value);
                if path.is_absolute() {
                    path
                } else {
                    project_root.join(path)
                }
            })
    }

    /// Resolve user agent: env JOURNALVIEW_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        self.user_agent_with(process_env)
    }

    pub fn user_agent_with<F: Fn(&str) -> Option<String>>(&self, lookup: F) -> String {
        lookup_override(&lookup, "JOURNALVIEW_USER_AGENT")
            .or_else(|| non_blank(self.source.user_agent.as_deref()))
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn page_size(&self) -> usize {
        self.browse
            .page_size
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_PAGE_SIZE)
    }

    /// Unknown language values fall back to `auto`.
    pub fn display_lang(&self) -> DisplayLang {
        self.browse
            .lang
            .as_deref()
            .and_then(DisplayLang::parse)
            .unwrap_or_default()
    }

    pub fn sync_page_size(&self) -> usize {
        self.sync
            .page_size
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_SYNC_PAGE_SIZE)
    }

    pub fn sync_max_pages(&self) -> usize {
        self.sync
            .max_pages
            .filter(|pages| *pages > 0)
            .unwrap_or(DEFAULT_SYNC_MAX_PAGES)
    }
}

/// Load and parse a JournalConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<JournalConfig> {
    if !config_path.exists() {
        return Ok(JournalConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: JournalConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[derive(Debug, Clone, Default)]
pub struct SourceConfigPatch {
    pub set_db_path: Option<String>,
    pub set_api_url: Option<String>,
}

/// Update selected keys under `[source]` while preserving all other config sections.
/// Returns `true` when a write occurred.
pub fn patch_source_config(config_path: &Path, patch: &SourceConfigPatch) -> Result<bool> {
    if patch.set_db_path.is_none() && patch.set_api_url.is_none() {
        return Ok(false);
    }

    let mut root = if config_path.exists() {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        toml::from_str::<Value>(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?
    } else {
        Value::Table(Default::default())
    };
    let original = root.clone();

    let root_table = root.as_table_mut().ok_or_else(|| {
        anyhow::anyhow!(
            "top-level TOML must be a table in {}",
            config_path.display()
        )
    })?;
    let source_entry = root_table
        .entry("source".to_string())
        .or_insert_with(|| Value::Table(Default::default()));
    let source_table = source_entry.as_table_mut().ok_or_else(|| {
        anyhow::anyhow!("[source] must be a table in {}", config_path.display())
    })?;

    if let Some(db_path) = &patch.set_db_path {
        if db_path.trim().is_empty() {
            bail!("db_path cannot be empty");
        }
        source_table.insert("db_path".to_string(), Value::String(db_path.clone()));
    }
    if let Some(api_url) = &patch.set_api_url {
        if api_url.trim().is_empty() {
            bail!("api_url cannot be empty");
        }
        source_table.insert("api_url".to_string(), Value::String(api_url.clone()));
    }

    if root == original {
        return Ok(false);
    }

    let parent = config_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("config path has no parent: {}", config_path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    let rendered = toml::to_string_pretty(&root).context("failed to serialize config TOML")?;
    fs::write(config_path, rendered)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    Ok(true)
}

/// Reads a variable from the process environment.
pub fn process_env(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn lookup_override<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str) -> Option<String> {
    lookup(key).and_then(|value| non_blank(Some(&value)))
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_uses_builtin_values() {
        let config = JournalConfig::default();
        assert!(config.source.api_url.is_none());
        assert_eq!(config.page_size(), DEFAULT_PAGE_SIZE);
        assert_eq!(config.sync_page_size(), DEFAULT_SYNC_PAGE_SIZE);
        assert_eq!(config.display_lang(), DisplayLang::Auto);
    }

    #[test]
    fn env_values_win_over_config_file() {
        let config = JournalConfig {
            source: SourceSection {
                api_url: Some("https://file.example.org/api/".to_string()),
                db_path: Some("data/articles.db".to_string()),
                user_agent: Some("file-agent".to_string()),
            },
            ..JournalConfig::default()
        };
        let env: std::collections::HashMap<&str, &str> = [
            ("JOURNALVIEW_API_URL", "https://env.example.org/v2/"),
            ("JOURNALVIEW_DB_PATH", "/srv/articles.db"),
            ("JOURNALVIEW_USER_AGENT", "env-agent"),
        ]
        .into_iter()
        .collect();
        let lookup = |key: &str| env.get(key).map(|value| value.to_string());
        let root = Path::new("/work");

        assert_eq!(
            config.api_url_with(lookup).as_deref(),
            Some("https://env.example.org/v2")
        );
        assert_eq!(
            config.db_path_with(root, lookup),
            Some(PathBuf::from("/srv/articles.db"))
        );
        assert_eq!(config.user_agent_with(lookup), "env-agent");

        let blank = |_: &str| Some("   ".to_string());
        assert_eq!(
            config.api_url_with(blank).as_deref(),
            Some("https://file.example.org/api")
        );
        assert_eq!(
            config.db_path_with(root, blank),
            Some(root.join("data/articles.db"))
        );
        assert_eq!(config.user_agent_with(blank), "file-agent");

        let unset = |_: &str| None;
        assert!(JournalConfig::default().api_url_with(unset).is_none());
        assert!(JournalConfig::default().db_path_with(root, unset).is_none());
        assert_eq!(
            JournalConfig::default().user_agent_with(unset),
            DEFAULT_USER_AGENT
        );
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config, JournalConfig::default());
    }

    #[test]
    fn load_config_parses_all_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[source]
db_path = "data/rss_state.db"
api_url = "https://articles.example.org/api/"
user_agent = "test-agent/1.0"

[browse]
page_size = 20
lang = "en"

[sync]
page_size = 100
max_pages = 7
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(
            config.source.db_path.as_deref(),
            Some("data/rss_state.db")
        );
        assert_eq!(
            config.db_path(Path::new("/project")),
            Some(PathBuf::from("/project/data/rss_state.db"))
        );
        assert_eq!(config.source.user_agent.as_deref(), Some("test-agent/1.0"));
        assert_eq!(config.page_size(), 20);
        assert_eq!(config.display_lang(), DisplayLang::En);
        assert_eq!(config.sync_page_size(), 100);
        assert_eq!(config.sync_max_pages(), 7);
    }

    #[test]
    fn zero_sizes_fall_back_to_defaults() {
        let config = JournalConfig {
            browse: BrowseSection {
                page_size: Some(0),
                lang: Some("klingon".to_string()),
            },
            ..JournalConfig::default()
        };
        assert_eq!(config.page_size(), DEFAULT_PAGE_SIZE);
        assert_eq!(config.display_lang(), DisplayLang::Auto);
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[source\napi_url = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn patch_source_config_preserves_other_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[browse]\npage_size = 12\n").expect("write config");

        let wrote = patch_source_config(
            &config_path,
            &SourceConfigPatch {
                set_db_path: Some("data/articles.db".to_string()),
                set_api_url: Some("https://articles.example.org/api".to_string()),
            },
        )
        .expect("patch");
        assert!(wrote);

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.browse.page_size, Some(12));
        assert_eq!(config.source.db_path.as_deref(), Some("data/articles.db"));
        assert_eq!(
            config.source.api_url.as_deref(),
            Some("https://articles.example.org/api")
        );

        let again = patch_source_config(
            &config_path,
            &SourceConfigPatch {
                set_db_path: Some("data/articles.db".to_string()),
                set_api_url: None,
            },
        )
        .expect("patch again");
        assert!(!again);
    }

    #[test]
    fn patch_source_config_rejects_blank_values() {
        let temp = tempdir().expect("tempdir");
        let error = patch_source_config(
            &temp.path().join("config.toml"),
            &SourceConfigPatch {
                set_db_path: None,
                set_api_url: Some("  ".to_string()),
            },
        )
        .expect_err("must fail");
        assert!(error.to_string().contains("api_url cannot be empty"));
    }
}
