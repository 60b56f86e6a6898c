//! Task lifecycle around node calls.
//!
//! A remote call is persisted as `pending`, moves to `running` once the call
//! frame is on the node's link, and becomes terminal in the same step that
//! resolves the call. An async job is acknowledged the same way but stays
//! `running` until the node sends a separate `completion` frame.

use common::api::{
    AsyncJobRequest, RemoteCallRequest, TaskDetail, TaskPage, TaskStatus as ApiTaskStatus,
    TaskSummary,
};
use common::protocol::{CallPayload, is_valid_node_id};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{
    app_state::AppState,
    auth::Caller,
    correlator::{CallError, CallReply},
    persistence::{
        NewTask, TaskFilter, TaskHeader, TaskOrigin, TaskRecord, nodes as node_store,
        tasks as task_store,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    Invalid(String),
    /// Unknown task, or one owned by another user.
    #[error("task not found")]
    NotFound,
    /// Unknown node, or one the caller does not own.
    #[error("node not found")]
    NodeNotFound,
    #[error("task store unavailable")]
    StoreUnavailable(#[source] anyhow::Error),
}

/// Final state of a synchronous remote call.
#[derive(Debug, Clone)]
pub struct RemoteCallOutcome {
    pub task_id: i64,
    pub status: ApiTaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Set when the call failed at the transport level.
    pub failure: Option<CallError>,
}

/// Acknowledgement state of an async job.
#[derive(Debug, Clone)]
pub struct AsyncJobOutcome {
    pub task_id: i64,
    pub status: ApiTaskStatus,
    pub error: Option<String>,
    pub failure: Option<CallError>,
}

/// What happened to a `completion` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Applied,
    UnknownTask,
    NodeMismatch,
    NotAJob,
    AlreadyFinal,
}

#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub user_id: Option<i64>,
    pub node_id: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

fn store_err(err: anyhow::Error) -> TaskError {
    TaskError::StoreUnavailable(err)
}

async fn resolve_target(state: &AppState, caller: &Caller, node_id: &str) -> Result<(), TaskError> {
    if !is_valid_node_id(node_id) {
        return Err(TaskError::Invalid("invalid node_id".into()));
    }
    let node = node_store::get_node(&state.db, node_id)
        .await
        .map_err(store_err)?
        .ok_or(TaskError::NodeNotFound)?;
    if !caller.is_admin() && node.owner() != Some(caller.user_id) {
        return Err(TaskError::NodeNotFound);
    }
    Ok(())
}

fn validate_action(action: &str, field: &str) -> Result<(), TaskError> {
    let action = action.trim();
    if action.is_empty() || action.len() > 128 {
        return Err(TaskError::Invalid(format!("{field} must be 1-128 characters")));
    }
    Ok(())
}

/// Mark a task failed. Only a store error is reported; a task that is
/// already terminal is left alone.
async fn record_failure(state: &AppState, task_id: i64, error: &str) -> Result<(), TaskError> {
    if !task_store::fail_task(&state.db, task_id, error)
        .await
        .map_err(store_err)?
    {
        warn!(task_id, "task already terminal; failure not recorded");
    }
    Ok(())
}

pub async fn submit_remote_call(
    state: &AppState,
    caller: &Caller,
    req: RemoteCallRequest,
) -> Result<RemoteCallOutcome, TaskError> {
    validate_action(&req.action, "action")?;
    resolve_target(state, caller, &req.node_id).await?;

    let task = task_store::create_task(
        &state.db,
        &NewTask {
            task_type: req.action.trim(),
            origin: TaskOrigin::Call,
            node_id: &req.node_id,
            user_id: caller.user_id,
            payload: &req.data,
        },
    )
    .await
    .map_err(store_err)?;

    let deadline = Instant::now() + state.calls.effective_timeout(req.timeout_ms);
    let payload = CallPayload {
        action: req.action.trim().to_string(),
        data: req.data,
        task_id: None,
    };

    let state = state.clone();
    let (task_id, node_id) = (task.id, req.node_id);
    settle_detached(async move {
        run_remote_call(&state, task_id, &node_id, payload, deadline).await
    })
    .await
}

/// Run `fut` on its own task. A caller that goes away mid-call (its own
/// deadline, or a dropped HTTP request) still leaves the task terminal.
async fn settle_detached<T, F>(fut: F) -> Result<T, TaskError>
where
    F: Future<Output = Result<T, TaskError>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|err| TaskError::StoreUnavailable(anyhow::Error::new(err)))?
}

async fn run_remote_call(
    state: &AppState,
    task_id: i64,
    node_id: &str,
    payload: CallPayload,
    deadline: Instant,
) -> Result<RemoteCallOutcome, TaskError> {
    let pending = match state.correlator.start_call(node_id, payload, deadline).await {
        Ok(pending) => pending,
        Err(err) => {
            record_failure(state, task_id, &err.to_string()).await?;
            return Ok(failed_call(task_id, err));
        }
    };
    if let Err(err) = task_store::mark_task_running(&state.db, task_id).await {
        warn!(task_id, ?err, "failed to mark task running");
    }

    match pending.wait().await {
        Ok(CallReply {
            success: true,
            data,
            ..
        }) => {
            if !task_store::complete_task(&state.db, task_id, &data)
                .await
                .map_err(store_err)?
            {
                warn!(task_id, "task already terminal; result not recorded");
            }
            Ok(RemoteCallOutcome {
                task_id,
                status: ApiTaskStatus::Completed,
                result: Some(data),
                error: None,
                failure: None,
            })
        }
        Ok(CallReply { error, .. }) => {
            let error = error.unwrap_or_else(|| "remote call failed".to_string());
            record_failure(state, task_id, &error).await?;
            Ok(RemoteCallOutcome {
                task_id,
                status: ApiTaskStatus::Failed,
                result: None,
                error: Some(error),
                failure: None,
            })
        }
        Err(err) => {
            record_failure(state, task_id, &err.to_string()).await?;
            Ok(failed_call(task_id, err))
        }
    }
}

fn failed_call(task_id: i64, err: CallError) -> RemoteCallOutcome {
    RemoteCallOutcome {
        task_id,
        status: ApiTaskStatus::Failed,
        result: None,
        error: Some(err.to_string()),
        failure: Some(err),
    }
}

pub async fn submit_async_job(
    state: &AppState,
    caller: &Caller,
    req: AsyncJobRequest,
) -> Result<AsyncJobOutcome, TaskError> {
    validate_action(&req.kind, "kind")?;
    resolve_target(state, caller, &req.node_id).await?;

    let task = task_store::create_task(
        &state.db,
        &NewTask {
            task_type: req.kind.trim(),
            origin: TaskOrigin::Job,
            node_id: &req.node_id,
            user_id: caller.user_id,
            payload: &req.params,
        },
    )
    .await
    .map_err(store_err)?;

    let deadline = Instant::now() + state.calls.job_ack_timeout();
    let payload = CallPayload {
        action: req.kind.trim().to_string(),
        data: req.params,
        task_id: Some(task.id),
    };

    let state = state.clone();
    let (task_id, node_id) = (task.id, req.node_id);
    settle_detached(async move {
        run_async_job(&state, task_id, &node_id, payload, deadline).await
    })
    .await
}

async fn run_async_job(
    state: &AppState,
    task_id: i64,
    node_id: &str,
    payload: CallPayload,
    deadline: Instant,
) -> Result<AsyncJobOutcome, TaskError> {
    let failure = |err: CallError| AsyncJobOutcome {
        task_id,
        status: ApiTaskStatus::Failed,
        error: Some(err.to_string()),
        failure: Some(err),
    };

    let pending = match state.correlator.start_call(node_id, payload, deadline).await {
        Ok(pending) => pending,
        Err(err) => {
            record_failure(state, task_id, &err.to_string()).await?;
            return Ok(failure(err));
        }
    };
    if let Err(err) = task_store::mark_task_running(&state.db, task_id).await {
        warn!(task_id, ?err, "failed to mark job running");
    }

    match pending.wait().await {
        Ok(CallReply { success: true, .. }) => {
            info!(task_id, node_id, "job accepted by node");
            Ok(AsyncJobOutcome {
                task_id,
                status: ApiTaskStatus::Running,
                error: None,
                failure: None,
            })
        }
        Ok(CallReply { error, .. }) => {
            let error = error.unwrap_or_else(|| "job rejected by node".to_string());
            record_failure(state, task_id, &error).await?;
            Ok(AsyncJobOutcome {
                task_id,
                status: ApiTaskStatus::Failed,
                error: Some(error),
                failure: None,
            })
        }
        Err(err) => {
            record_failure(state, task_id, &err.to_string()).await?;
            Ok(failure(err))
        }
    }
}

/// Apply an out-of-band completion sent by `node_id`.
pub async fn complete_async_job(
    state: &AppState,
    node_id: &str,
    task_id: i64,
    success: bool,
    result: Value,
    error: Option<String>,
) -> crate::Result<CompletionOutcome> {
    let Some(task) = task_store::get_task(&state.db, task_id).await? else {
        return Ok(CompletionOutcome::UnknownTask);
    };
    if task.header.node_id != node_id {
        return Ok(CompletionOutcome::NodeMismatch);
    }
    if task.header.origin != TaskOrigin::Job {
        return Ok(CompletionOutcome::NotAJob);
    }

    let applied = if success {
        task_store::complete_task(&state.db, task_id, &result).await?
    } else {
        let error = error.unwrap_or_else(|| "job failed".to_string());
        task_store::fail_task(&state.db, task_id, &error).await?
    };
    Ok(if applied {
        CompletionOutcome::Applied
    } else {
        CompletionOutcome::AlreadyFinal
    })
}

pub async fn get_task(state: &AppState, caller: &Caller, task_id: i64) -> Result<TaskDetail, TaskError> {
    let task = task_store::get_task(&state.db, task_id)
        .await
        .map_err(store_err)?
        .ok_or(TaskError::NotFound)?;
    if !caller.is_admin() && task.header.user_id != caller.user_id {
        return Err(TaskError::NotFound);
    }
    Ok(to_detail(task))
}

pub async fn list_tasks(state: &AppState, caller: &Caller, query: TaskQuery) -> Result<TaskPage, TaskError> {
    if let Some(node_id) = query.node_id.as_deref()
        && !is_valid_node_id(node_id)
    {
        return Err(TaskError::Invalid("invalid node_id".into()));
    }
    let filter = TaskFilter {
        user_id: caller.scope().or(query.user_id),
        node_id: query.node_id,
    };
    let total = task_store::count_tasks(&state.db, &filter)
        .await
        .map_err(store_err)?;
    let items = task_store::list_task_headers(&state.db, &filter, query.limit, query.offset)
        .await
        .map_err(store_err)?
        .into_iter()
        .map(to_summary)
        .collect();
    Ok(TaskPage {
        limit: query.limit,
        offset: query.offset,
        total,
        items,
    })
}

pub async fn delete_task(state: &AppState, task_id: i64) -> Result<(), TaskError> {
    let deleted = task_store::delete_task(&state.db, task_id)
        .await
        .map_err(store_err)?;
    if deleted == 0 {
        return Err(TaskError::NotFound);
    }
    Ok(())
}

fn to_summary(header: TaskHeader) -> TaskSummary {
    TaskSummary {
        id: header.id,
        task_type: header.task_type,
        origin: header.origin.into(),
        node_id: header.node_id,
        user_id: header.user_id,
        status: header.status.into(),
        created_at: header.created_at,
        updated_at: header.updated_at,
    }
}

fn to_detail(task: TaskRecord) -> TaskDetail {
    TaskDetail {
        summary: to_summary(task.header),
        payload: task.payload.map(|p| p.0),
        result: task.result.map(|r| r.0),
        error: task.error,
    }
}
