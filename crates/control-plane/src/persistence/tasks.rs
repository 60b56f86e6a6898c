use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, QueryBuilder, Sqlite};

use super::Db;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl From<TaskStatus> for common::api::TaskStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Pending => common::api::TaskStatus::Pending,
            TaskStatus::Running => common::api::TaskStatus::Running,
            TaskStatus::Completed => common::api::TaskStatus::Completed,
            TaskStatus::Failed => common::api::TaskStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum TaskOrigin {
    Call,
    Job,
}

impl From<TaskOrigin> for common::api::TaskOrigin {
    fn from(origin: TaskOrigin) -> Self {
        match origin {
            TaskOrigin::Call => common::api::TaskOrigin::Call,
            TaskOrigin::Job => common::api::TaskOrigin::Job,
        }
    }
}

/// Header columns only; list reads never load payloads.
#[derive(Debug, Clone, FromRow)]
pub struct TaskHeader {
    pub id: i64,
    pub task_type: String,
    pub origin: TaskOrigin,
    pub node_id: String,
    pub user_id: i64,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskRecord {
    #[sqlx(flatten)]
    pub header: TaskHeader,
    pub payload: Option<Json<Value>>,
    pub result: Option<Json<Value>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewTask<'a> {
    pub task_type: &'a str,
    pub origin: TaskOrigin,
    pub node_id: &'a str,
    pub user_id: i64,
    pub payload: &'a Value,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub user_id: Option<i64>,
    pub node_id: Option<String>,
}

const HEADER_COLUMNS: &str =
    "id, task_type, origin, node_id, user_id, status, created_at, updated_at";

pub async fn create_task(pool: &Db, task: &NewTask<'_>) -> Result<TaskHeader> {
    let now = Utc::now();
    let header = sqlx::query_as::<_, TaskHeader>(&format!(
        r#"
        INSERT INTO tasks (task_type, origin, node_id, user_id, status, payload, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?6)
        RETURNING {HEADER_COLUMNS}
        "#
    ))
    .bind(task.task_type)
    .bind(task.origin)
    .bind(task.node_id)
    .bind(task.user_id)
    .bind(Json(task.payload))
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(header)
}

/// `pending -> running`. Returns false when the task already moved on.
pub async fn mark_task_running(pool: &Db, id: i64) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'running', updated_at = ?2
        WHERE id = ?1 AND status = 'pending'
        "#,
    )
    .bind(id)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Terminal success. Returns false when the task is already terminal.
pub async fn complete_task(pool: &Db, id: i64, result: &Value) -> Result<bool> {
    let updated = sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'completed', result = ?2, error = NULL, updated_at = ?3
        WHERE id = ?1 AND status IN ('pending', 'running')
        "#,
    )
    .bind(id)
    .bind(Json(result))
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(updated.rows_affected() == 1)
}

/// Terminal failure. Returns false when the task is already terminal.
pub async fn fail_task(pool: &Db, id: i64, error: &str) -> Result<bool> {
    let updated = sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'failed', error = ?2, updated_at = ?3
        WHERE id = ?1 AND status IN ('pending', 'running')
        "#,
    )
    .bind(id)
    .bind(error)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(updated.rows_affected() == 1)
}

/// Fail accepted jobs whose last transition is older than `cutoff`.
pub async fn fail_stale_jobs(
    pool: &Db,
    cutoff: DateTime<Utc>,
    error: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let updated = sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'failed', error = ?2, updated_at = ?3
        WHERE origin = 'job' AND status = 'running' AND updated_at < ?1
        "#,
    )
    .bind(cutoff)
    .bind(error)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(updated.rows_affected())
}

pub async fn get_task(pool: &Db, id: i64) -> Result<Option<TaskRecord>> {
    let record = sqlx::query_as::<_, TaskRecord>(&format!(
        "SELECT {HEADER_COLUMNS}, payload, result, error FROM tasks WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

fn push_filter<'a>(builder: &mut QueryBuilder<'a, Sqlite>, filter: &'a TaskFilter) {
    builder.push(" WHERE 1 = 1");
    if let Some(user_id) = filter.user_id {
        builder.push(" AND user_id = ").push_bind(user_id);
    }
    if let Some(node_id) = filter.node_id.as_deref() {
        builder.push(" AND node_id = ").push_bind(node_id);
    }
}

pub async fn list_task_headers(
    pool: &Db,
    filter: &TaskFilter,
    limit: u32,
    offset: u32,
) -> Result<Vec<TaskHeader>> {
    let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {HEADER_COLUMNS} FROM tasks"));
    push_filter(&mut builder, filter);
    builder
        .push(" ORDER BY created_at DESC, id DESC LIMIT ")
        .push_bind(limit as i64)
        .push(" OFFSET ")
        .push_bind(offset as i64);

    let rows = builder
        .build_query_as::<TaskHeader>()
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn count_tasks(pool: &Db, filter: &TaskFilter) -> Result<i64> {
    let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM tasks");
    push_filter(&mut builder, filter);
    let total = builder
        .build_query_scalar::<i64>()
        .fetch_one(pool)
        .await?;
    Ok(total)
}

pub async fn delete_task(pool: &Db, id: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM tasks WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
