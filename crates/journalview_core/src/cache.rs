//! Local full copy of the article set, kept in a key-value store and
//! refreshed by a once-a-day sync against the REST backend.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::filter::FilterCriteria;
use crate::paginate::PageRequest;
use crate::record::{Article, sort_default};
use crate::remote::ArticleApi;

pub const KEY_RECORDS: &str = "articles.records";
pub const KEY_RECORD_COUNT: &str = "articles.count";
pub const KEY_LAST_SYNC_AT: &str = "articles.last_sync_at";
pub const KEY_LAST_SYNC_DAY: &str = "articles.last_sync_day";
pub const KEY_CHECKSUM: &str = "articles.checksum";

const KV_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS cache_kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at_unix INTEGER NOT NULL
);
"#;

pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
    /// Write several entries so that either all or none are visible.
    fn set_many(&mut self, entries: &[(&str, String)]) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<()>;
}

pub struct SqliteKvStore {
    connection: Connection,
}

impl SqliteKvStore {
    pub fn open(path: &Path) -> Result<Self> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("cache path has no parent: {}", path.display()))?;
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create cache parent directory {}", parent.display())
        })?;
        let connection =
            Connection::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL journal mode")?;
        connection
            .execute_batch(KV_SCHEMA_SQL)
            .context("failed to initialize cache schema")?;
        Ok(Self { connection })
    }
}

impl KeyValueStore for SqliteKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.connection
            .query_row(
                "SELECT value FROM cache_kv WHERE key = ?1 LIMIT 1",
                [key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read cache key {key}"))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.set_many(&[(key, value.to_string())])
    }

    fn set_many(&mut self, entries: &[(&str, String)]) -> Result<()> {
        let now = i64::try_from(unix_timestamp()?).context("timestamp does not fit into i64")?;
        let transaction = self
            .connection
            .transaction()
            .context("failed to start cache write transaction")?;
        for (key, value) in entries {
            transaction
                .execute(
                    "INSERT INTO cache_kv (key, value, updated_at_unix) VALUES (?1, ?2, ?3)
                    ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        updated_at_unix = excluded.updated_at_unix",
                    params![key, value, now],
                )
                .with_context(|| format!("failed to write cache key {key}"))?;
        }
        transaction
            .commit()
            .context("failed to commit cache write transaction")
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.connection
            .execute("DELETE FROM cache_kv WHERE key = ?1", [key])
            .with_context(|| format!("failed to remove cache key {key}"))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryKvStore {
    entries: BTreeMap<String, String>,
}

impl KeyValueStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn set_many(&mut self, entries: &[(&str, String)]) -> Result<()> {
        for (key, value) in entries {
            self.entries.insert((*key).to_string(), value.clone());
        }
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheState {
    pub record_count: usize,
    pub last_sync_at: Option<String>,
    pub last_sync_day: Option<String>,
    pub checksum: Option<String>,
}

impl CacheState {
    pub fn load<S: KeyValueStore + ?Sized>(store: &S) -> Result<Self> {
        let record_count = store
            .get(KEY_RECORD_COUNT)?
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        Ok(Self {
            record_count,
            last_sync_at: store.get(KEY_LAST_SYNC_AT)?,
            last_sync_day: store.get(KEY_LAST_SYNC_DAY)?,
            checksum: store.get(KEY_CHECKSUM)?,
        })
    }

    pub fn has_records(&self) -> bool {
        self.record_count > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadySyncedToday,
    UpToDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadReason {
    Forced,
    EmptyCache,
    ServerChanged,
    NoServerTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPlan {
    Skip(SkipReason),
    CheckServer,
    Download(DownloadReason),
}

/// First gate: the day marker. No network is needed to skip here.
pub fn plan_sync(state: &CacheState, today: &str, force: bool) -> SyncPlan {
    if force {
        return SyncPlan::Download(DownloadReason::Forced);
    }
    if state.last_sync_day.as_deref() == Some(today) {
        return SyncPlan::Skip(SkipReason::AlreadySyncedToday);
    }
    SyncPlan::CheckServer
}

/// Outcome of the second gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCheck {
    UpToDate,
    Download(DownloadReason),
}

/// Second gate: compare the server's data timestamp with the cached one.
/// `payload_valid` is false when the stored records no longer load.
pub fn plan_after_check(
    state: &CacheState,
    payload_valid: bool,
    server_timestamp: Option<&str>,
) -> ServerCheck {
    if !state.has_records() || !payload_valid {
        return ServerCheck::Download(DownloadReason::EmptyCache);
    }
    match server_timestamp {
        None => ServerCheck::Download(DownloadReason::NoServerTimestamp),
        Some(remote) if state.last_sync_at.as_deref() == Some(remote) => ServerCheck::UpToDate,
        Some(_) => ServerCheck::Download(DownloadReason::ServerChanged),
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub page_size: usize,
    pub max_pages: usize,
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Skipped {
        reason: SkipReason,
    },
    Downloaded {
        reason: DownloadReason,
        records: usize,
        pages: usize,
        last_sync_at: Option<String>,
    },
    Aborted {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub day: String,
    pub outcome: SyncOutcome,
    pub request_count: usize,
}

/// Today's local calendar day, used as the sync day marker.
pub fn today_marker() -> String {
    chrono::Local::now().date_naive().format("%Y-%m-%d").to_string()
}

/// Run the daily full-cache sync.
///
/// Network failures end the sync with [`SyncOutcome::Aborted`] and leave every
/// cache key untouched; only local store failures are returned as errors.
pub fn sync_full_cache<A, S>(
    api: &mut A,
    store: &mut S,
    options: &SyncOptions,
    today: &str,
) -> Result<SyncReport>
where
    A: ArticleApi + ?Sized,
    S: KeyValueStore + ?Sized,
{
    let state = CacheState::load(&*store)?;
    let finish = |outcome: SyncOutcome, api: &A| SyncReport {
        day: today.to_string(),
        outcome,
        request_count: api.request_count(),
    };

    let mut server_timestamp = None;
    let reason = match plan_sync(&state, today, options.force) {
        SyncPlan::Skip(reason) => {
            info!(?reason, day = today, "cache sync skipped");
            return Ok(finish(SyncOutcome::Skipped { reason }, &*api));
        }
        SyncPlan::Download(reason) => {
            server_timestamp = api.server_timestamp().ok().flatten();
            reason
        }
        SyncPlan::CheckServer => {
            let remote = match api.server_timestamp() {
                Ok(remote) => remote,
                Err(error) => {
                    warn!(error = %format!("{error:#}"), "cache sync aborted: server timestamp unavailable");
                    return Ok(finish(
                        SyncOutcome::Aborted {
                            reason: format!("{error:#}"),
                        },
                        &*api,
                    ));
                }
            };
            let payload_valid =
                state.has_records() && !load_cached_articles(&*store)?.is_empty();
            if state.has_records() && !payload_valid {
                warn!("cached records no longer load; downloading a fresh copy");
            }
            match plan_after_check(&state, payload_valid, remote.as_deref()) {
                ServerCheck::Download(reason) => {
                    server_timestamp = remote;
                    reason
                }
                ServerCheck::UpToDate => {
                    let reason = SkipReason::UpToDate;
                    store.set(KEY_LAST_SYNC_DAY, today)?;
                    info!(?reason, day = today, "cache already matches server");
                    return Ok(finish(SyncOutcome::Skipped { reason }, &*api));
                }
            }
        }
    };

    info!(?reason, page_size = options.page_size, "downloading full article set");
    let (records, pages) = match download_all(api, options) {
        Ok(result) => result,
        Err(error) => {
            warn!(error = %format!("{error:#}"), "cache sync aborted; previous cache kept");
            return Ok(finish(
                SyncOutcome::Aborted {
                    reason: format!("{error:#}"),
                },
                &*api,
            ));
        }
    };

    let last_sync_at = server_timestamp.or_else(|| {
        records
            .iter()
            .filter_map(|article| article.last_updated_at.clone())
            .max()
    });
    let payload = serde_json::to_string(&records).context("failed to serialize article cache")?;
    let mut entries = vec![
        (KEY_RECORD_COUNT, records.len().to_string()),
        (KEY_CHECKSUM, compute_checksum(&payload)),
        (KEY_LAST_SYNC_DAY, today.to_string()),
        (KEY_RECORDS, payload),
    ];
    if let Some(timestamp) = &last_sync_at {
        entries.push((KEY_LAST_SYNC_AT, timestamp.clone()));
    }
    store.set_many(&entries)?;
    if last_sync_at.is_none() {
        store.remove(KEY_LAST_SYNC_AT)?;
    }

    info!(records = records.len(), pages, "article cache refreshed");
    Ok(finish(
        SyncOutcome::Downloaded {
            reason,
            records: records.len(),
            pages,
            last_sync_at,
        },
        &*api,
    ))
}

/// Fetch every page in order. Stops on a short page or once `total` is
/// reached; running into `max_pages` with pages still full is an error.
fn download_all<A: ArticleApi + ?Sized>(
    api: &mut A,
    options: &SyncOptions,
) -> Result<(Vec<Article>, usize)> {
    let page_size = options.page_size.max(1);
    let criteria = FilterCriteria::default();
    let mut by_uid: BTreeMap<String, Article> = BTreeMap::new();
    let mut pages = 0usize;

    for page in 1..=options.max_pages.max(1) {
        let remote = api
            .fetch_page(&criteria, PageRequest::new(page, page_size))
            .with_context(|| format!("failed to download page {page}"))?;
        pages += 1;
        let received = remote.items.len();
        for article in remote.items {
            if article.uid.trim().is_empty() {
                continue;
            }
            by_uid.insert(article.uid.clone(), article);
        }

        let reached_total = remote
            .total
            .is_some_and(|total| page.saturating_mul(page_size) >= total);
        if received < page_size || reached_total {
            let mut records: Vec<Article> = by_uid.into_values().collect();
            sort_default(&mut records);
            return Ok((records, pages));
        }
    }

    anyhow::bail!(
        "download did not finish within {} pages of {page_size}",
        options.max_pages.max(1)
    )
}

/// Read the cached record set. A missing, malformed, or checksum-mismatched
/// payload reads as an empty cache.
pub fn load_cached_articles<S: KeyValueStore + ?Sized>(store: &S) -> Result<Vec<Article>> {
    let payload = match store.get(KEY_RECORDS)? {
        Some(payload) => payload,
        None => return Ok(Vec::new()),
    };
    if let Some(expected) = store.get(KEY_CHECKSUM)?
        && expected != compute_checksum(&payload)
    {
        warn!("article cache checksum mismatch; ignoring cached records");
        return Ok(Vec::new());
    }
    match serde_json::from_str::<Vec<Article>>(&payload) {
        Ok(records) => Ok(records),
        Err(error) => {
            warn!(%error, "article cache payload is malformed; ignoring cached records");
            Ok(Vec::new())
        }
    }
}

fn compute_checksum(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn unix_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")
        .map(|duration| duration.as_secs())
}
