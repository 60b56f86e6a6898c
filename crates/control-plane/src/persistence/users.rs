use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::{Db, nodes};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum UserRole {
    User,
    Admin,
}

impl From<common::api::UserRole> for UserRole {
    fn from(role: common::api::UserRole) -> Self {
        match role {
            common::api::UserRole::User => UserRole::User,
            common::api::UserRole::Admin => UserRole::Admin,
        }
    }
}

impl From<UserRole> for common::api::UserRole {
    fn from(role: UserRole) -> Self {
        match role {
            UserRole::User => common::api::UserRole::User,
            UserRole::Admin => common::api::UserRole::Admin,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct UserRecord {
    pub id: i64,
    pub email: String,
    pub role: UserRole,
    pub credits: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const USER_COLUMNS: &str = "id, email, role, credits, created_at, updated_at";

pub async fn create_user(pool: &Db, email: &str, role: UserRole) -> Result<UserRecord> {
    let now = Utc::now();
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO users (email, role, credits, created_at, updated_at)
        VALUES (?1, ?2, 0, ?3, ?3)
        RETURNING id
        "#,
    )
    .bind(email)
    .bind(role)
    .bind(now)
    .fetch_one(pool)
    .await?;

    get_user(pool, id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("user insert did not return row"))
}

pub async fn get_user(pool: &Db, id: i64) -> Result<Option<UserRecord>> {
    let record = sqlx::query_as::<_, UserRecord>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn get_user_by_email(pool: &Db, email: &str) -> Result<Option<UserRecord>> {
    let record = sqlx::query_as::<_, UserRecord>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE email = ?1"
    ))
    .bind(email)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn list_users(pool: &Db, limit: u32, offset: u32) -> Result<Vec<UserRecord>> {
    let rows = sqlx::query_as::<_, UserRecord>(&format!(
        "SELECT {USER_COLUMNS} FROM users ORDER BY id LIMIT ?1 OFFSET ?2"
    ))
    .bind(limit as i64)
    .bind(offset as i64)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn count_users(pool: &Db) -> Result<i64> {
    let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users")
        .fetch_one(pool)
        .await?;
    Ok(total)
}

pub async fn update_role(pool: &Db, id: i64, role: UserRole) -> Result<u64> {
    let result = sqlx::query("UPDATE users SET role = ?2, updated_at = ?3 WHERE id = ?1")
        .bind(id)
        .bind(role)
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Delete a user with their tasks, ledger and bind tokens. Their nodes are
/// kept but left unbound.
pub async fn delete_user(pool: &Db, id: i64) -> Result<u64> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    for statement in [
        "DELETE FROM tasks WHERE user_id = ?1",
        "DELETE FROM credit_transactions WHERE user_id = ?1",
        "DELETE FROM bind_tokens WHERE user_id = ?1",
    ] {
        sqlx::query(statement).bind(id).execute(&mut *tx).await?;
    }
    nodes::unbind_nodes_for_user_tx(&mut tx, id, now).await?;

    let result = sqlx::query("DELETE FROM users WHERE id = ?1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(result.rows_affected())
}
