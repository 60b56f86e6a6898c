use super::*;

pub fn router() -> Router<AppState> {
    Router::<AppState>::new().route("/healthz", get(healthz))
}

pub fn metrics_router() -> Router<AppState> {
    Router::<AppState>::new().route("/metrics", get(metrics))
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub(crate) struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub git_sha: &'static str,
    pub built_at: &'static str,
    pub schema_version: Option<i64>,
    pub pending_migrations: usize,
    /// Nodes with a live tunnel.
    pub online_nodes: usize,
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Health check", body = HealthResponse)),
    tag = "system"
)]
pub(crate) async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: crate::version::VERSION,
        git_sha: crate::version::GIT_SHA,
        built_at: crate::version::BUILD_TIMESTAMP,
        schema_version: state.schema.latest_applied,
        pending_migrations: state.schema.pending.len(),
        online_nodes: state.registry.len().await,
    })
}

#[utoipa::path(
    get,
    path = "/metrics",
    responses((status = 200, description = "Prometheus metrics", content_type = "text/plain")),
    tag = "system"
)]
pub(crate) async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics_handle.run_upkeep();
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        state.metrics_handle.render(),
    )
}
