use super::*;
use crate::services::tasks::TaskQuery;

pub fn router() -> Router<AppState> {
    Router::<AppState>::new()
        .route("/api/calls", post(submit_call))
        .route("/api/jobs", post(submit_job))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/{task_id}", get(get_task))
}

#[utoipa::path(
    post,
    path = "/api/calls",
    request_body = api::RemoteCallRequest,
    responses(
        (status = 200, description = "Call resolved; `status` tells whether the node succeeded", body = api::RemoteCallResponse),
        (status = 404, description = "Node not found", body = ErrorResponse),
        (status = 409, description = "Node offline", body = api::RemoteCallResponse),
        (status = 502, description = "Node disconnected before replying", body = api::RemoteCallResponse),
        (status = 503, description = "Task store unavailable", body = ErrorResponse),
        (status = 504, description = "Node did not reply in time", body = api::RemoteCallResponse)
    ),
    security(("gatewayBearer" = [])),
    tag = "tasks"
)]
pub(crate) async fn submit_call(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<api::RemoteCallRequest>,
) -> ApiResult<(StatusCode, Json<api::RemoteCallResponse>)> {
    let outcome = services::tasks::submit_remote_call(&state, &caller, req).await?;
    let status = outcome
        .failure
        .map(call_error_status)
        .unwrap_or(StatusCode::OK);
    Ok((
        status,
        Json(api::RemoteCallResponse {
            task_id: outcome.task_id,
            status: outcome.status,
            result: outcome.result,
            error: outcome.error,
            code: outcome.failure.map(|err| err.code().to_string()),
        }),
    ))
}

#[utoipa::path(
    post,
    path = "/api/jobs",
    request_body = api::AsyncJobRequest,
    responses(
        (status = 202, description = "Job accepted by the node", body = api::AsyncJobResponse),
        (status = 200, description = "Job rejected by the node", body = api::AsyncJobResponse),
        (status = 404, description = "Node not found", body = ErrorResponse),
        (status = 409, description = "Node offline", body = api::AsyncJobResponse),
        (status = 502, description = "Node disconnected", body = api::AsyncJobResponse),
        (status = 504, description = "Node did not acknowledge in time", body = api::AsyncJobResponse)
    ),
    security(("gatewayBearer" = [])),
    tag = "tasks"
)]
pub(crate) async fn submit_job(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<api::AsyncJobRequest>,
) -> ApiResult<(StatusCode, Json<api::AsyncJobResponse>)> {
    let outcome = services::tasks::submit_async_job(&state, &caller, req).await?;
    let status = match (outcome.failure, outcome.status) {
        (Some(err), _) => call_error_status(err),
        (None, api::TaskStatus::Running) => StatusCode::ACCEPTED,
        (None, _) => StatusCode::OK,
    };
    Ok((
        status,
        Json(api::AsyncJobResponse {
            task_id: outcome.task_id,
            status: outcome.status,
            error: outcome.error,
            code: outcome.failure.map(|err| err.code().to_string()),
        }),
    ))
}

pub(super) async fn task_page(
    state: &AppState,
    caller: &Caller,
    params: TaskListParams,
) -> ApiResult<api::TaskPage> {
    let (limit, offset) = parse_limit_offset(params.limit, params.offset, &state.limits)?;
    let page = services::tasks::list_tasks(
        state,
        caller,
        TaskQuery {
            user_id: params.user_id,
            node_id: params.node_id,
            limit,
            offset,
        },
    )
    .await?;
    Ok(page)
}

#[utoipa::path(
    get,
    path = "/api/tasks",
    params(TaskListParams),
    responses(
        (status = 200, description = "Task headers, newest first", body = api::TaskPage),
        (status = 400, description = "Invalid pagination", body = ErrorResponse)
    ),
    security(("gatewayBearer" = [])),
    tag = "tasks"
)]
pub(crate) async fn list_tasks(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<TaskListParams>,
) -> ApiResult<Json<api::TaskPage>> {
    Ok(Json(task_page(&state, &caller, params).await?))
}

#[utoipa::path(
    get,
    path = "/api/tasks/{task_id}",
    params(("task_id" = i64, Path, description = "Task identifier")),
    responses(
        (status = 200, description = "Full task", body = api::TaskDetail),
        (status = 404, description = "Task not found", body = ErrorResponse)
    ),
    security(("gatewayBearer" = [])),
    tag = "tasks"
)]
pub(crate) async fn get_task(
    State(state): State<AppState>,
    caller: Caller,
    Path(task_id): Path<i64>,
) -> ApiResult<Json<api::TaskDetail>> {
    let task = services::tasks::get_task(&state, &caller, task_id).await?;
    Ok(Json(task))
}
