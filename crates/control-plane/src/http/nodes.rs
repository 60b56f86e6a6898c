use super::*;

pub fn router() -> Router<AppState> {
    Router::<AppState>::new()
        .route("/api/nodes", get(list_nodes))
        .route("/api/nodes/bind-token", post(create_bind_token))
        .route("/api/nodes/{node_id}/unbind", post(unbind_node))
        .route("/api/credits", get(credit_balance))
}

#[utoipa::path(
    get,
    path = "/api/nodes",
    responses((status = 200, description = "Nodes bound to the caller", body = [api::NodeSummary])),
    security(("gatewayBearer" = [])),
    tag = "nodes"
)]
pub(crate) async fn list_nodes(
    State(state): State<AppState>,
    caller: Caller,
) -> ApiResult<Json<Vec<api::NodeSummary>>> {
    Ok(Json(services::nodes::list_my_nodes(&state, &caller).await?))
}

#[utoipa::path(
    post,
    path = "/api/nodes/bind-token",
    responses((status = 201, description = "One-time bind token", body = api::BindTokenResponse)),
    security(("gatewayBearer" = [])),
    tag = "nodes"
)]
pub(crate) async fn create_bind_token(
    State(state): State<AppState>,
    caller: Caller,
) -> ApiResult<(StatusCode, Json<api::BindTokenResponse>)> {
    let token = services::nodes::create_bind_token(&state, &caller).await?;
    Ok((StatusCode::CREATED, Json(token)))
}

#[utoipa::path(
    post,
    path = "/api/nodes/{node_id}/unbind",
    params(("node_id" = String, Path, description = "Node identifier")),
    responses(
        (status = 200, description = "Node released", body = api::OkResponse),
        (status = 404, description = "Node not bound to the caller", body = ErrorResponse)
    ),
    security(("gatewayBearer" = [])),
    tag = "nodes"
)]
pub(crate) async fn unbind_node(
    State(state): State<AppState>,
    caller: Caller,
    Path(node_id): Path<String>,
) -> ApiResult<Json<api::OkResponse>> {
    services::nodes::unbind_node(&state, &node_id, Some(caller.user_id)).await?;
    Ok(Json(api::OkResponse { ok: true }))
}

#[utoipa::path(
    get,
    path = "/api/credits",
    responses((status = 200, description = "Balance and recent ledger entries", body = api::CreditBalance)),
    security(("gatewayBearer" = [])),
    tag = "nodes"
)]
pub(crate) async fn credit_balance(
    State(state): State<AppState>,
    caller: Caller,
) -> ApiResult<Json<api::CreditBalance>> {
    Ok(Json(services::credits::balance(&state, caller.user_id).await?))
}
