use sqlx::FromRow;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, Default, FromRow)]
pub struct SystemCounts {
    pub users: i64,
    pub nodes: i64,
    pub bound_nodes: i64,
    pub tasks: i64,
    pub transactions: i64,
    pub total_credits: i64,
}

pub async fn system_counts(pool: &Db) -> Result<SystemCounts> {
    let counts = sqlx::query_as::<_, SystemCounts>(
        r#"
        SELECT
            (SELECT COUNT(*) FROM users) AS users,
            (SELECT COUNT(*) FROM nodes) AS nodes,
            (SELECT COUNT(*) FROM nodes WHERE bound = 1) AS bound_nodes,
            (SELECT COUNT(*) FROM tasks) AS tasks,
            (SELECT COUNT(*) FROM credit_transactions) AS transactions,
            (SELECT COALESCE(SUM(credits), 0) FROM users) AS total_credits
        "#,
    )
    .fetch_one(pool)
    .await?;
    Ok(counts)
}
