use chrono::{DateTime, Utc};
use sqlx::{FromRow, Sqlite, Transaction};

use super::Db;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum LedgerReason {
    OnlineAccrual,
    AdminAdjustment,
}

impl LedgerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerReason::OnlineAccrual => "online_accrual",
            LedgerReason::AdminAdjustment => "admin_adjustment",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct LedgerRecord {
    pub id: i64,
    pub user_id: i64,
    pub amount: i64,
    pub reason: LedgerReason,
    pub node_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub async fn append_entry_tx(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: i64,
    amount: i64,
    reason: LedgerReason,
    node_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO credit_transactions (user_id, amount, reason, node_id, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        RETURNING id
        "#,
    )
    .bind(user_id)
    .bind(amount)
    .bind(reason)
    .bind(node_id)
    .bind(now)
    .fetch_one(&mut **tx)
    .await?;
    Ok(id)
}

/// Move a user's balance by `amount` and record the matching ledger entry.
///
/// Returns the new balance, or `None` when the user does not exist. Both
/// writes land in the caller's transaction.
pub async fn apply_credit_tx(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: i64,
    amount: i64,
    reason: LedgerReason,
    node_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Option<i64>> {
    let balance = sqlx::query_scalar::<_, i64>(
        r#"
        UPDATE users
        SET credits = credits + ?2, updated_at = ?3
        WHERE id = ?1
        RETURNING credits
        "#,
    )
    .bind(user_id)
    .bind(amount)
    .bind(now)
    .fetch_optional(&mut **tx)
    .await?;

    if balance.is_some() {
        append_entry_tx(tx, user_id, amount, reason, node_id, now).await?;
    }
    Ok(balance)
}

pub async fn apply_credit(
    pool: &Db,
    user_id: i64,
    amount: i64,
    reason: LedgerReason,
) -> Result<Option<i64>> {
    let mut tx = pool.begin().await?;
    let balance = apply_credit_tx(&mut tx, user_id, amount, reason, None, Utc::now()).await?;
    tx.commit().await?;
    Ok(balance)
}

pub async fn list_entries_for_user(pool: &Db, user_id: i64, limit: u32) -> Result<Vec<LedgerRecord>> {
    let rows = sqlx::query_as::<_, LedgerRecord>(
        r#"
        SELECT id, user_id, amount, reason, node_id, created_at
        FROM credit_transactions
        WHERE user_id = ?1
        ORDER BY id DESC
        LIMIT ?2
        "#,
    )
    .bind(user_id)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn sum_for_user(pool: &Db, user_id: i64) -> Result<i64> {
    let total = sqlx::query_scalar::<_, i64>(
        "SELECT COALESCE(SUM(amount), 0) FROM credit_transactions WHERE user_id = ?1",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await?;
    Ok(total)
}

pub async fn count_entries(pool: &Db) -> Result<i64> {
    let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM credit_transactions")
        .fetch_one(pool)
        .await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations;
    use crate::persistence::users::{self, UserRole};

    async fn setup() -> Db {
        let pool = migrations::init_pool("sqlite::memory:").await.expect("pool");
        migrations::run_migrations(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn balance_matches_ledger_sum() {
        let pool = setup().await;
        let user = users::create_user(&pool, "ledger@example.com", UserRole::User)
            .await
            .expect("user");

        assert_eq!(
            apply_credit(&pool, user.id, 10, LedgerReason::AdminAdjustment)
                .await
                .expect("credit"),
            Some(10)
        );
        assert_eq!(
            apply_credit(&pool, user.id, -3, LedgerReason::AdminAdjustment)
                .await
                .expect("debit"),
            Some(7)
        );

        let stored = users::get_user(&pool, user.id).await.expect("get").expect("row");
        assert_eq!(stored.credits, 7);
        assert_eq!(sum_for_user(&pool, user.id).await.expect("sum"), 7);

        let entries = list_entries_for_user(&pool, user.id, 10).await.expect("entries");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].amount, -3);
        assert_eq!(entries[0].reason, LedgerReason::AdminAdjustment);
    }

    #[tokio::test]
    async fn unknown_user_writes_nothing() {
        let pool = setup().await;
        let balance = apply_credit(&pool, 4242, 5, LedgerReason::AdminAdjustment)
            .await
            .expect("apply");
        assert_eq!(balance, None);
        assert_eq!(count_entries(&pool).await.expect("count"), 0);
    }
}
