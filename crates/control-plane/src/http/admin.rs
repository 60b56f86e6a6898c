use super::*;
use crate::persistence::UserRole;

pub fn router() -> Router<AppState> {
    Router::<AppState>::new()
        .route("/api/admin/users", get(list_users).post(create_user))
        .route("/api/admin/users/{user_id}", delete(delete_user))
        .route("/api/admin/users/{user_id}/credits", post(adjust_credits))
        .route("/api/admin/users/{user_id}/role", post(update_role))
        .route("/api/admin/stats", get(system_stats))
        .route("/api/admin/nodes", get(list_nodes))
        .route("/api/admin/nodes/{node_id}", delete(delete_node))
        .route("/api/admin/nodes/{node_id}/unbind", post(unbind_node))
        .route("/api/admin/tasks", get(list_tasks))
        .route("/api/admin/tasks/{task_id}", delete(delete_task))
        .route_layer(middleware::from_fn(require_admin))
}

/// Node page plus the registry's view of live and recent sessions.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub(crate) struct AdminNodesResponse {
    #[serde(flatten)]
    pub nodes: api::NodePage,
    pub sessions: api::SessionsResponse,
}

#[utoipa::path(
    get,
    path = "/api/admin/users",
    params(ListParams),
    responses((status = 200, description = "Users", body = api::UserPage)),
    security(("gatewayBearer" = [])),
    tag = "admin"
)]
pub(crate) async fn list_users(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<api::UserPage>> {
    let (limit, offset) = parse_limit_offset(params.limit, params.offset, &state.limits)?;
    Ok(Json(services::users::list_users(&state, limit, offset).await?))
}

#[utoipa::path(
    post,
    path = "/api/admin/users",
    request_body = api::CreateUserRequest,
    responses(
        (status = 201, description = "User provisioned", body = api::UserSummary),
        (status = 409, description = "Email already in use", body = ErrorResponse)
    ),
    security(("gatewayBearer" = [])),
    tag = "admin"
)]
pub(crate) async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<api::CreateUserRequest>,
) -> ApiResult<(StatusCode, Json<api::UserSummary>)> {
    let user = services::users::create_user(&state, req).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[utoipa::path(
    post,
    path = "/api/admin/users/{user_id}/credits",
    params(("user_id" = i64, Path, description = "User identifier")),
    request_body = api::CreditAdjustmentRequest,
    responses(
        (status = 200, description = "New balance", body = api::CreditAdjustmentResponse),
        (status = 400, description = "Zero adjustment", body = ErrorResponse),
        (status = 404, description = "User not found", body = ErrorResponse)
    ),
    security(("gatewayBearer" = [])),
    tag = "admin"
)]
pub(crate) async fn adjust_credits(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Json(req): Json<api::CreditAdjustmentRequest>,
) -> ApiResult<Json<api::CreditAdjustmentResponse>> {
    Ok(Json(
        services::credits::adjust(&state, user_id, req.adjustment).await?,
    ))
}

#[utoipa::path(
    post,
    path = "/api/admin/users/{user_id}/role",
    params(("user_id" = i64, Path, description = "User identifier")),
    request_body = api::RoleUpdateRequest,
    responses(
        (status = 200, description = "Updated user", body = api::UserSummary),
        (status = 404, description = "User not found", body = ErrorResponse)
    ),
    security(("gatewayBearer" = [])),
    tag = "admin"
)]
pub(crate) async fn update_role(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Json(req): Json<api::RoleUpdateRequest>,
) -> ApiResult<Json<api::UserSummary>> {
    let user = services::users::update_role(&state, user_id, UserRole::from(req.role)).await?;
    Ok(Json(user))
}

#[utoipa::path(
    delete,
    path = "/api/admin/users/{user_id}",
    params(("user_id" = i64, Path, description = "User identifier")),
    responses(
        (status = 204, description = "User deleted"),
        (status = 400, description = "Caller tried to delete itself", body = ErrorResponse),
        (status = 404, description = "User not found", body = ErrorResponse)
    ),
    security(("gatewayBearer" = [])),
    tag = "admin"
)]
pub(crate) async fn delete_user(
    State(state): State<AppState>,
    caller: Caller,
    Path(user_id): Path<i64>,
) -> ApiResult<StatusCode> {
    services::users::delete_user(&state, &caller, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/api/admin/stats",
    responses((status = 200, description = "Fleet-wide counters", body = api::SystemStats)),
    security(("gatewayBearer" = [])),
    tag = "admin"
)]
pub(crate) async fn system_stats(State(state): State<AppState>) -> ApiResult<Json<api::SystemStats>> {
    Ok(Json(services::users::system_stats(&state).await?))
}

#[utoipa::path(
    get,
    path = "/api/admin/nodes",
    params(ListParams),
    responses((status = 200, description = "All nodes with session status", body = AdminNodesResponse)),
    security(("gatewayBearer" = [])),
    tag = "admin"
)]
pub(crate) async fn list_nodes(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<AdminNodesResponse>> {
    let (limit, offset) = parse_limit_offset(params.limit, params.offset, &state.limits)?;
    let nodes = services::nodes::list_all_nodes(&state, limit, offset).await?;
    let sessions = services::nodes::sessions(&state).await;
    Ok(Json(AdminNodesResponse { nodes, sessions }))
}

#[utoipa::path(
    post,
    path = "/api/admin/nodes/{node_id}/unbind",
    params(("node_id" = String, Path, description = "Node identifier")),
    responses(
        (status = 200, description = "Node released", body = api::OkResponse),
        (status = 404, description = "Node not found", body = ErrorResponse)
    ),
    security(("gatewayBearer" = [])),
    tag = "admin"
)]
pub(crate) async fn unbind_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> ApiResult<Json<api::OkResponse>> {
    services::nodes::unbind_node(&state, &node_id, None).await?;
    Ok(Json(api::OkResponse { ok: true }))
}

#[utoipa::path(
    delete,
    path = "/api/admin/nodes/{node_id}",
    params(("node_id" = String, Path, description = "Node identifier")),
    responses(
        (status = 204, description = "Node deleted and disconnected"),
        (status = 404, description = "Node not found", body = ErrorResponse)
    ),
    security(("gatewayBearer" = [])),
    tag = "admin"
)]
pub(crate) async fn delete_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> ApiResult<StatusCode> {
    services::nodes::delete_node(&state, &node_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/api/admin/tasks",
    params(TaskListParams),
    responses((status = 200, description = "Tasks across all users", body = api::TaskPage)),
    security(("gatewayBearer" = [])),
    tag = "admin"
)]
pub(crate) async fn list_tasks(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<TaskListParams>,
) -> ApiResult<Json<api::TaskPage>> {
    Ok(Json(super::tasks::task_page(&state, &caller, params).await?))
}

#[utoipa::path(
    delete,
    path = "/api/admin/tasks/{task_id}",
    params(("task_id" = i64, Path, description = "Task identifier")),
    responses(
        (status = 204, description = "Task deleted"),
        (status = 404, description = "Task not found", body = ErrorResponse)
    ),
    security(("gatewayBearer" = [])),
    tag = "admin"
)]
pub(crate) async fn delete_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> ApiResult<StatusCode> {
    services::tasks::delete_task(&state, task_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
