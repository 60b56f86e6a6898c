use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use sqlx::migrate::{AppliedMigration, Migrate, Migrator};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use uuid::Uuid;

use super::Db;
use crate::Result;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const FILE_POOL_CONNECTIONS: u32 = 5;
const POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MigrationLabel {
    pub version: i64,
    pub description: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MigrationSnapshot {
    pub latest_applied: Option<i64>,
    pub latest_available: Option<i64>,
    pub pending: Vec<MigrationLabel>,
}

#[derive(Debug, Clone)]
pub struct MigrationRunOutcome {
    pub snapshot: MigrationSnapshot,
    pub applied: Vec<MigrationLabel>,
}

/// Open the hub database.
///
/// `sqlite::memory:` is mapped to a throwaway file so that every pooled
/// connection sees the same schema.
pub async fn init_pool(database_url: &str) -> Result<Db> {
    let in_memory = database_url.starts_with("sqlite::memory");
    let url = if in_memory {
        let path = std::env::temp_dir().join(format!("fleet-hub-{}.sqlite", Uuid::new_v4()));
        format!("sqlite://{}", path.display())
    } else {
        ensure_db_dir(database_url)?;
        database_url.to_string()
    };

    let opts = SqliteConnectOptions::from_str(&url)
        .with_context(|| format!("invalid database url {database_url}"))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(FILE_POOL_CONNECTIONS)
        .acquire_timeout(POOL_ACQUIRE_TIMEOUT)
        .connect_with(opts)
        .await
        .context("connect to database")?;
    Ok(pool)
}

fn ensure_db_dir(database_url: &str) -> Result<()> {
    let Some(path) = database_url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let path = path.split('?').next().unwrap_or(path);
    if let Some(parent) = Path::new(path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create database directory {}", parent.display()))?;
    }
    Ok(())
}

pub fn latest_migration_version() -> Option<i64> {
    MIGRATOR.iter().map(|m| m.version).max()
}

pub async fn migration_snapshot(pool: &Db) -> Result<MigrationSnapshot> {
    let applied: HashSet<i64> = fetch_applied_migrations(pool)
        .await?
        .iter()
        .map(|m| m.version)
        .collect();
    let pending = MIGRATOR
        .iter()
        .filter(|m| !applied.contains(&m.version))
        .map(|m| MigrationLabel {
            version: m.version,
            description: m.description.to_string(),
        })
        .collect();

    Ok(MigrationSnapshot {
        latest_applied: applied.iter().copied().max(),
        latest_available: latest_migration_version(),
        pending,
    })
}

/// Refuse to start against a schema this binary does not know.
pub async fn validate_migrations(pool: &Db) -> Result<()> {
    let known: HashMap<i64, &sqlx::migrate::Migration> =
        MIGRATOR.iter().map(|m| (m.version, m)).collect();

    for applied in fetch_applied_migrations(pool).await? {
        let Some(defined) = known.get(&applied.version) else {
            anyhow::bail!(
                "database has unknown migration version {}",
                applied.version
            );
        };
        if defined.checksum != applied.checksum {
            anyhow::bail!(
                "migration {} checksum mismatch between database and binary",
                applied.version
            );
        }
    }
    Ok(())
}

pub async fn run_migrations(pool: &Db) -> Result<MigrationRunOutcome> {
    validate_migrations(pool).await?;
    let before = migration_snapshot(pool).await?;
    if before.pending.is_empty() {
        return Ok(MigrationRunOutcome {
            snapshot: before,
            applied: Vec::new(),
        });
    }

    MIGRATOR
        .run(pool)
        .await
        .context("applying database migrations failed")?;

    Ok(MigrationRunOutcome {
        snapshot: migration_snapshot(pool).await?,
        applied: before.pending,
    })
}

async fn fetch_applied_migrations(pool: &Db) -> Result<Vec<AppliedMigration>> {
    let mut conn = pool.acquire().await?;
    conn.ensure_migrations_table()
        .await
        .context("ensure migrations table exists")?;
    if let Some(version) = conn.dirty_version().await? {
        anyhow::bail!("database is in a dirty migration state at version {version}");
    }
    let applied = conn
        .list_applied_migrations()
        .await
        .context("list applied migrations")?;
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_db_dir_creates_parent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("nested").join("hub.sqlite");
        ensure_db_dir(&format!("sqlite://{}?mode=rwc", db_path.display())).expect("ensure");
        assert!(db_path.parent().expect("parent").exists());
    }

    #[tokio::test]
    async fn fresh_database_reports_every_migration_pending() {
        let pool = init_pool("sqlite::memory:").await.expect("pool");
        let snapshot = migration_snapshot(&pool).await.expect("snapshot");
        assert_eq!(snapshot.latest_applied, None);
        assert_eq!(snapshot.pending.len(), MIGRATOR.iter().count());
        assert_eq!(snapshot.latest_available, latest_migration_version());
    }

    #[tokio::test]
    async fn run_migrations_is_idempotent() {
        let pool = init_pool("sqlite::memory:").await.expect("pool");
        let first = run_migrations(&pool).await.expect("first run");
        assert!(!first.applied.is_empty());
        assert!(first.snapshot.pending.is_empty());

        let second = run_migrations(&pool).await.expect("second run");
        assert!(second.applied.is_empty());
        assert_eq!(second.snapshot.latest_applied, latest_migration_version());
    }

    #[tokio::test]
    async fn validate_rejects_unknown_version() {
        let pool = init_pool("sqlite::memory:").await.expect("pool");
        let mut conn = pool.acquire().await.expect("conn");
        conn.ensure_migrations_table().await.expect("table");
        sqlx::query(
            "INSERT INTO _sqlx_migrations \
             (version, description, installed_on, success, checksum, execution_time) \
             VALUES (?1, 'future', CURRENT_TIMESTAMP, 1, ?2, 0)",
        )
        .bind(latest_migration_version().unwrap_or(0) + 100)
        .bind(vec![0_u8; 32])
        .execute(&mut *conn)
        .await
        .expect("insert");
        drop(conn);

        let err = validate_migrations(&pool).await.expect_err("unknown");
        assert!(err.to_string().contains("unknown migration version"));
    }
}
