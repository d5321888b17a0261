use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use tracing::debug;

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "articles",
        sql: include_str!("migrations/v001_articles.sql"),
    },
    Migration {
        version: 2,
        name: "browse_indexes",
        sql: include_str!("migrations/v002_browse_indexes.sql"),
    },
];

/// Report returned after running migrations.
#[derive(Debug, Clone)]
pub struct MigrateReport {
    pub applied: Vec<AppliedMigration>,
    pub current_version: u32,
}

#[derive(Debug, Clone)]
pub struct AppliedMigration {
    pub version: u32,
    pub name: String,
}

/// Apply every pending migration to an open article database.
pub fn run_migrations(connection: &Connection) -> Result<MigrateReport> {
    ensure_schema_migrations_table(connection)?;

    let current = current_version(connection)?;
    let mut applied = Vec::new();

    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        apply_migration(connection, migration).with_context(|| {
            format!(
                "failed to apply migration v{:03}_{}",
                migration.version, migration.name
            )
        })?;
        debug!(version = migration.version, name = migration.name, "applied migration");
        applied.push(AppliedMigration {
            version: migration.version,
            name: migration.name.to_string(),
        });
    }

    let final_version = current_version(connection)?;
    Ok(MigrateReport {
        applied,
        current_version: final_version,
    })
}

/// Number of migrations not yet applied to this database.
pub fn pending_migration_count(connection: &Connection) -> Result<usize> {
    if !schema_migrations_exists(connection)? {
        return Ok(MIGRATIONS.len());
    }
    let current = current_version(connection)?;
    Ok(MIGRATIONS.iter().filter(|m| m.version > current).count())
}

/// Returns the highest applied migration version, or 0 if none applied.
pub fn current_version(connection: &Connection) -> Result<u32> {
    let version: i64 = connection
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .context("failed to read current migration version")?;
    u32::try_from(version).context("migration version does not fit into u32")
}

fn schema_migrations_exists(connection: &Connection) -> Result<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations')",
            [],
            |row| row.get(0),
        )
        .context("failed to check sqlite_master for schema_migrations")?;
    Ok(exists == 1)
}

fn ensure_schema_migrations_table(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at_unix INTEGER NOT NULL
            );",
        )
        .context("failed to create schema_migrations table")
}

fn apply_migration(connection: &Connection, migration: &Migration) -> Result<()> {
    connection
        .execute_batch("SAVEPOINT migration_apply")
        .context("failed to create savepoint")?;

    let result = (|| -> Result<()> {
        connection
            .execute_batch(migration.sql)
            .with_context(|| format!("SQL execution failed for v{:03}", migration.version))?;

        let now_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system clock error")?
            .as_secs();

        connection
            .execute(
                "INSERT INTO schema_migrations (version, name, applied_at_unix) VALUES (?1, ?2, ?3)",
                params![
                    i64::from(migration.version),
                    migration.name,
                    i64::try_from(now_unix).context("timestamp does not fit into i64")?,
                ],
            )
            .context("failed to record migration")?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            connection
                .execute_batch("RELEASE SAVEPOINT migration_apply")
                .context("failed to release savepoint")?;
            Ok(())
        }
        Err(err) => {
            let _ = connection.execute_batch("ROLLBACK TO SAVEPOINT migration_apply");
            let _ = connection.execute_batch("RELEASE SAVEPOINT migration_apply");
            Err(err)
        }
    }
}
