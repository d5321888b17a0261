use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, Row, params, params_from_iter};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::facet::{Facet, sort_facets, tag_facets};
use crate::filter::FilterCriteria;
use crate::migrate::{pending_migration_count, run_migrations};
use crate::paginate::{PageRequest, PageSlice};
use crate::record::{Article, parse_tags};

const ARTICLE_COLUMNS: &str = "uid, journal, title_en, title_cn, type, pub_date, doi, article_url, \
     abstract_en, abstract_cn, topic_tag, fetched_at, last_updated_at";

const DEFAULT_ORDER_SQL: &str = "ORDER BY pub_date DESC, uid DESC";

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub articles: usize,
    pub journals: usize,
    pub newest_update: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub read: usize,
    pub imported: usize,
    pub skipped: usize,
}

/// SQLite article database with the `articles` table.
pub struct ArticleStore {
    connection: Connection,
}

impl ArticleStore {
    /// Open an existing database without touching its schema.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("article database not found: {}", path.display());
        }
        let connection =
            Connection::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        register_functions(&connection)?;
        if !table_exists(&connection, "articles")? {
            bail!("{} has no articles table", path.display());
        }
        Ok(Self { connection })
    }

    /// Open or create a database and apply pending migrations.
    pub fn open_or_create(path: &Path) -> Result<Self> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("db path has no parent: {}", path.display()))?;
        fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create database parent directory {}",
                parent.display()
            )
        })?;
        let connection =
            Connection::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL journal mode")?;
        register_functions(&connection)?;
        run_migrations(&connection)?;
        Ok(Self { connection })
    }

    #[cfg(test)]
    pub(crate) fn open_in_memory() -> Result<Self> {
        let connection = Connection::open_in_memory().context("failed to open memory db")?;
        register_functions(&connection)?;
        run_migrations(&connection)?;
        Ok(Self { connection })
    }

    /// Migrations an `open`ed database is still missing; `import` applies them.
    pub fn pending_migrations(&self) -> Result<usize> {
        pending_migration_count(&self.connection)
    }

    pub fn count(&self, criteria: &FilterCriteria) -> Result<usize> {
        let clause = criteria.to_where_clause();
        let sql = format!("SELECT COUNT(*) FROM articles {}", clause.sql);
        debug!(%sql, "count query");
        let count: i64 = self
            .connection
            .query_row(&sql, params_from_iter(clause.params.iter()), |row| {
                row.get(0)
            })
            .context("failed to count articles")?;
        usize::try_from(count).context("count does not fit into usize")
    }

    /// Count, clamp the page, then fetch it in default order.
    pub fn search(
        &self,
        criteria: &FilterCriteria,
        request: PageRequest,
    ) -> Result<PageSlice<Article>> {
        let total = self.count(criteria)?;
        let (page, total_pages, offset) = request.resolve(total);
        let page_size = request.page_size.max(1);

        let clause = criteria.to_where_clause();
        let mut params = clause.params;
        params.push(SqlValue::Integer(
            i64::try_from(page_size).context("page size does not fit into i64")?,
        ));
        let limit_index = params.len();
        params.push(SqlValue::Integer(
            i64::try_from(offset).context("offset does not fit into i64")?,
        ));
        let offset_index = params.len();

        let sql = format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles {} {DEFAULT_ORDER_SQL} LIMIT ?{limit_index} OFFSET ?{offset_index}",
            clause.sql
        );
        debug!(%sql, page, offset, "page query");
        let items = self.query_articles(&sql, &params)?;

        Ok(PageSlice {
            items,
            page,
            page_size,
            total,
            total_pages,
            offset,
        })
    }

    pub fn all_articles(&self) -> Result<Vec<Article>> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles {DEFAULT_ORDER_SQL}");
        self.query_articles(&sql, &[])
    }

    pub fn journal_facets(&self) -> Result<Vec<Facet>> {
        self.facet_query(
            "SELECT journal AS j, COUNT(*) AS c
             FROM articles
             WHERE journal IS NOT NULL AND TRIM(journal) <> ''
             GROUP BY journal
             ORDER BY c DESC, j ASC",
        )
    }

    pub fn type_facets(&self) -> Result<Vec<Facet>> {
        self.facet_query(
            "SELECT TRIM(type) AS t, COUNT(*) AS c
             FROM articles
             WHERE type IS NOT NULL AND TRIM(type) <> ''
             GROUP BY TRIM(type)
             ORDER BY c DESC, t ASC",
        )
    }

    pub fn tag_facets(&self) -> Result<Vec<Facet>> {
        let mut statement = self
            .connection
            .prepare("SELECT topic_tag FROM articles WHERE topic_tag IS NOT NULL")
            .context("failed to prepare tag query")?;
        let rows = statement
            .query_map([], |row| text_column(row, 0))
            .context("failed to run tag query")?;
        let mut carriers = Vec::new();
        for row in rows {
            let topic_tag = row.context("failed to decode tag row")?;
            carriers.push(Article {
                topic_tag,
                ..Article::default()
            });
        }
        Ok(tag_facets(&carriers))
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let (articles, journals, newest_update): (i64, i64, Option<String>) = self
            .connection
            .query_row(
                "SELECT COUNT(*), COUNT(DISTINCT journal), MAX(last_updated_at) FROM articles",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, text_column(row, 2)?)),
            )
            .context("failed to read article stats")?;
        Ok(StoreStats {
            articles: usize::try_from(articles).context("count does not fit into usize")?,
            journals: usize::try_from(journals).context("count does not fit into usize")?,
            newest_update,
        })
    }

    /// Insert or replace rows by `uid` in a single transaction.
    pub fn upsert_articles(&mut self, articles: &[Article]) -> Result<usize> {
        let transaction = self
            .connection
            .transaction()
            .context("failed to start article upsert transaction")?;
        let mut written = 0usize;
        {
            let mut statement = transaction
                .prepare(
                    "INSERT INTO articles (
                        uid, journal, title_en, title_cn, type, pub_date, doi, article_url,
                        abstract_en, abstract_cn, topic_tag, fetched_at, last_updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                    ON CONFLICT(uid) DO UPDATE SET
                        journal = excluded.journal,
                        title_en = excluded.title_en,
                        title_cn = excluded.title_cn,
                        type = excluded.type,
                        pub_date = excluded.pub_date,
                        doi = excluded.doi,
                        article_url = excluded.article_url,
                        abstract_en = excluded.abstract_en,
                        abstract_cn = excluded.abstract_cn,
                        topic_tag = excluded.topic_tag,
                        fetched_at = excluded.fetched_at,
                        last_updated_at = excluded.last_updated_at",
                )
                .context("failed to prepare article upsert")?;
            for article in articles {
                statement
                    .execute(params![
                        article.uid,
                        article.journal,
                        article.title_en,
                        article.title_cn,
                        article.article_type,
                        article.pub_date,
                        article.doi,
                        article.article_url,
                        article.abstract_en,
                        article.abstract_cn,
                        article.topic_tag,
                        article.fetched_at,
                        article.last_updated_at,
                    ])
                    .with_context(|| format!("failed to upsert article {}", article.uid))?;
                written += 1;
            }
        }
        transaction
            .commit()
            .context("failed to commit article upsert transaction")?;
        Ok(written)
    }

    /// Seed the database from a JSON array of articles.
    pub fn import_json(&mut self, path: &Path) -> Result<ImportReport> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let parsed: Vec<Article> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        let read = parsed.len();
        let (valid, invalid): (Vec<Article>, Vec<Article>) = parsed
            .into_iter()
            .partition(|article| !article.uid.trim().is_empty());
        if !invalid.is_empty() {
            warn!(skipped = invalid.len(), "skipping articles without uid");
        }
        let imported = self.upsert_articles(&valid)?;
        info!(imported, path = %path.display(), "imported articles");
        Ok(ImportReport {
            read,
            imported,
            skipped: invalid.len(),
        })
    }

    fn query_articles(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Article>> {
        let mut statement = self
            .connection
            .prepare(sql)
            .context("failed to prepare article query")?;
        let rows = statement
            .query_map(params_from_iter(params.iter()), row_to_article)
            .context("failed to run article query")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode article row")?);
        }
        Ok(out)
    }

    fn facet_query(&self, sql: &str) -> Result<Vec<Facet>> {
        let mut statement = self
            .connection
            .prepare(sql)
            .context("failed to prepare facet query")?;
        let rows = statement
            .query_map([], |row| {
                let value = text_column(row, 0)?.unwrap_or_default();
                let count: i64 = row.get(1)?;
                Ok((value, count))
            })
            .context("failed to run facet query")?;
        let mut out = Vec::new();
        for row in rows {
            let (value, count) = row.context("failed to read facet row")?;
            let count = usize::try_from(count).context("facet count does not fit into usize")?;
            out.push(Facet { value, count });
        }
        sort_facets(&mut out);
        Ok(out)
    }
}

/// Register `casefold(text)` and `has_tag(topic_tag, tag)`, used by
/// [`FilterCriteria::to_where_clause`].
pub fn register_functions(connection: &Connection) -> Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;
    connection
        .create_scalar_function("casefold", 1, flags, |ctx| {
            Ok(value_ref_text(ctx.get_raw(0)).map(|value| value.to_lowercase()))
        })
        .context("failed to register casefold function")?;
    connection
        .create_scalar_function("has_tag", 2, flags, |ctx| {
            let raw = value_ref_text(ctx.get_raw(0));
            let wanted = value_ref_text(ctx.get_raw(1))
                .map(|tag| tag.trim().to_lowercase())
                .unwrap_or_default();
            let found = match raw {
                Some(raw) if !wanted.is_empty() => parse_tags(&raw)
                    .iter()
                    .any(|tag| tag.to_lowercase() == wanted),
                _ => false,
            };
            Ok(i64::from(found))
        })
        .context("failed to register has_tag function")?;
    Ok(())
}

fn row_to_article(row: &Row<'_>) -> rusqlite::Result<Article> {
    Ok(Article {
        uid: text_column(row, 0)?.unwrap_or_default(),
        journal: text_column(row, 1)?,
        title_en: text_column(row, 2)?,
        title_cn: text_column(row, 3)?,
        article_type: text_column(row, 4)?,
        pub_date: text_column(row, 5)?,
        doi: text_column(row, 6)?,
        article_url: text_column(row, 7)?,
        abstract_en: text_column(row, 8)?,
        abstract_cn: text_column(row, 9)?,
        topic_tag: text_column(row, 10)?,
        fetched_at: text_column(row, 11)?,
        last_updated_at: text_column(row, 12)?,
    })
}

/// Read any column affinity as optional text.
fn text_column(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<String>> {
    Ok(value_ref_text(row.get_ref(index)?))
}

fn value_ref_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(number) => Some(number.to_string()),
        ValueRef::Real(number) => Some(number.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn table_exists(connection: &Connection, table_name: &str) -> Result<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to check sqlite_master for table {table_name}"))?;
    Ok(exists == 1)
}
