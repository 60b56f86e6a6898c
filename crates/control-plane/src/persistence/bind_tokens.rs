use chrono::{DateTime, Utc};
use sqlx::{Sqlite, Transaction};

use super::Db;
use crate::Result;

pub async fn create_bind_token(
    pool: &Db,
    token_hash: &str,
    user_id: i64,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO bind_tokens (token_hash, user_id, expires_at, created_at)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(token_hash)
    .bind(user_id)
    .bind(expires_at)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark an unused, unexpired token as used by `node_id` and return the user
/// that issued it.
pub async fn consume_bind_token_tx(
    tx: &mut Transaction<'_, Sqlite>,
    token_hash: &str,
    node_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<i64>> {
    let user_id = sqlx::query_scalar::<_, i64>(
        r#"
        UPDATE bind_tokens
        SET used_at = ?3, used_by_node = ?2
        WHERE token_hash = ?1 AND used_at IS NULL AND expires_at > ?3
        RETURNING user_id
        "#,
    )
    .bind(token_hash)
    .bind(node_id)
    .bind(now)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(user_id)
}
