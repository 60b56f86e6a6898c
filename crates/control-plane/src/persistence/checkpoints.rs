use chrono::{DateTime, Utc};
use sqlx::{FromRow, Sqlite, Transaction};

use crate::Result;

/// Accrual progress of one node.
#[derive(Debug, Clone, FromRow)]
pub struct CheckpointRecord {
    pub node_id: String,
    pub last_credited_at: DateTime<Utc>,
    /// Online time already observed but not yet worth a full credit unit.
    pub carry_ms: i64,
}

pub async fn get_checkpoint_tx(
    tx: &mut Transaction<'_, Sqlite>,
    node_id: &str,
) -> Result<Option<CheckpointRecord>> {
    let record = sqlx::query_as::<_, CheckpointRecord>(
        r#"
        SELECT node_id, last_credited_at, carry_ms
        FROM accrual_checkpoints
        WHERE node_id = ?1
        "#,
    )
    .bind(node_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(record)
}

pub async fn upsert_checkpoint_tx(
    tx: &mut Transaction<'_, Sqlite>,
    node_id: &str,
    last_credited_at: DateTime<Utc>,
    carry_ms: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO accrual_checkpoints (node_id, last_credited_at, carry_ms)
        VALUES (?1, ?2, ?3)
        ON CONFLICT (node_id) DO UPDATE SET
            last_credited_at = excluded.last_credited_at,
            carry_ms = excluded.carry_ms
        "#,
    )
    .bind(node_id)
    .bind(last_credited_at)
    .bind(carry_ms)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
