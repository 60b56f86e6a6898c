use chrono::{DateTime, Utc};
use sqlx::{FromRow, Sqlite, Transaction};

use super::Db;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, FromRow)]
pub struct NodeRecord {
    pub id: String,
    pub user_id: Option<i64>,
    pub bound: bool,
    pub hostname: Option<String>,
    pub agent_version: Option<String>,
    pub status: NodeStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NodeRecord {
    /// Owner of a bound node.
    pub fn owner(&self) -> Option<i64> {
        if self.bound { self.user_id } else { None }
    }
}

/// Identity reported by a node when its tunnel opens.
#[derive(Debug, Clone)]
pub struct NodeHello {
    pub id: String,
    pub hostname: Option<String>,
    pub agent_version: String,
}

const NODE_COLUMNS: &str = r#"
    id,
    user_id,
    bound,
    hostname,
    agent_version,
    status,
    last_seen,
    created_at,
    updated_at
"#;

/// Record a handshake. Ownership and binding of a known node are left
/// untouched.
pub async fn upsert_on_connect(pool: &Db, hello: &NodeHello, now: DateTime<Utc>) -> Result<NodeRecord> {
    sqlx::query(
        r#"
        INSERT INTO nodes (id, hostname, agent_version, status, last_seen, created_at, updated_at)
        VALUES (?1, ?2, ?3, 'online', ?4, ?4, ?4)
        ON CONFLICT (id) DO UPDATE SET
            hostname = excluded.hostname,
            agent_version = excluded.agent_version,
            status = 'online',
            last_seen = excluded.last_seen,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&hello.id)
    .bind(&hello.hostname)
    .bind(&hello.agent_version)
    .bind(now)
    .execute(pool)
    .await?;

    get_node(pool, &hello.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("node upsert did not return row"))
}

pub async fn get_node(pool: &Db, id: &str) -> Result<Option<NodeRecord>> {
    let record = sqlx::query_as::<_, NodeRecord>(&format!(
        "SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn get_node_tx(tx: &mut Transaction<'_, Sqlite>, id: &str) -> Result<Option<NodeRecord>> {
    let record = sqlx::query_as::<_, NodeRecord>(&format!(
        "SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(record)
}

pub async fn list_nodes_for_user(pool: &Db, user_id: i64) -> Result<Vec<NodeRecord>> {
    let rows = sqlx::query_as::<_, NodeRecord>(&format!(
        "SELECT {NODE_COLUMNS} FROM nodes WHERE user_id = ?1 AND bound = 1 ORDER BY created_at, id"
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn list_nodes(pool: &Db, limit: u32, offset: u32) -> Result<Vec<NodeRecord>> {
    let rows = sqlx::query_as::<_, NodeRecord>(&format!(
        "SELECT {NODE_COLUMNS} FROM nodes ORDER BY created_at, id LIMIT ?1 OFFSET ?2"
    ))
    .bind(limit as i64)
    .bind(offset as i64)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn count_nodes(pool: &Db) -> Result<i64> {
    let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM nodes")
        .fetch_one(pool)
        .await?;
    Ok(total)
}

pub async fn update_node_status(
    pool: &Db,
    id: &str,
    status: NodeStatus,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE nodes
        SET status = ?2, last_seen = ?3, updated_at = ?3
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(status)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn touch_last_seen(pool: &Db, id: &str, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("UPDATE nodes SET last_seen = ?2 WHERE id = ?1")
        .bind(id)
        .bind(now)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn bind_node_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE nodes
        SET user_id = ?2, bound = 1, updated_at = ?3
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(user_id)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}

/// Clear ownership. With `owner` set, only a node bound to that user is
/// touched.
pub async fn unbind_node(
    pool: &Db,
    id: &str,
    owner: Option<i64>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE nodes
        SET user_id = NULL, bound = 0, updated_at = ?3
        WHERE id = ?1 AND (?2 IS NULL OR (user_id = ?2 AND bound = 1))
        "#,
    )
    .bind(id)
    .bind(owner)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn unbind_nodes_for_user_tx(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE nodes SET user_id = NULL, bound = 0, updated_at = ?2 WHERE user_id = ?1",
    )
    .bind(user_id)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}

/// Remove a node together with its accrual checkpoint. Tasks are kept.
pub async fn delete_node(pool: &Db, id: &str) -> Result<u64> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM accrual_checkpoints WHERE node_id = ?1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    let result = sqlx::query("DELETE FROM nodes WHERE id = ?1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(result.rows_affected())
}
