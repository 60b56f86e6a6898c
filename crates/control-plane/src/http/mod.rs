use crate::{
    app_state::AppState,
    auth::{Caller, require_admin, require_gateway_auth},
    config::LimitsConfig,
    error::{ApiResult, AppError},
    metrics::HttpMetricsLayer,
    services,
};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderName, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
};
use common::api;
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
};
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};

mod admin;
mod error_mapper;
mod nodes;
mod system;
mod tasks;

pub(crate) use error_mapper::call_error_status;

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub(crate) struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Default, Deserialize, utoipa::IntoParams, utoipa::ToSchema)]
#[into_params(parameter_in = Query)]
pub(crate) struct ListParams {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Default, Deserialize, utoipa::IntoParams, utoipa::ToSchema)]
#[into_params(parameter_in = Query)]
pub(crate) struct TaskListParams {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub node_id: Option<String>,
    /// Honoured for admins only.
    pub user_id: Option<i64>,
}

/// Public API router. Everything under `/api` sits behind the gateway check.
pub fn build_router(state: AppState) -> Router<AppState> {
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);
    let middleware_stack = ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
        .layer(PropagateRequestIdLayer::new(request_id))
        .layer(HttpMetricsLayer)
        .layer(RequestBodyLimitLayer::new(state.limits.max_body_bytes));

    let api = Router::<AppState>::new()
        .merge(tasks::router())
        .merge(nodes::router())
        .merge(admin::router())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_gateway_auth,
        ));

    Router::<AppState>::new()
        .merge(system::router())
        .merge(api)
        .layer(middleware_stack)
}

pub fn build_metrics_router() -> Router<AppState> {
    system::metrics_router()
}

pub fn parse_limit_offset(
    limit: Option<u32>,
    offset: Option<u32>,
    limits: &LimitsConfig,
) -> ApiResult<(u32, u32)> {
    let limit = limit.unwrap_or(limits.default_page_limit);
    if limit == 0 || limit > limits.max_page_limit {
        return Err(AppError::bad_request(format!(
            "limit must be between 1 and {}",
            limits.max_page_limit
        )));
    }
    Ok((limit, offset.unwrap_or(0)))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        system::healthz,
        system::metrics,
        tasks::submit_call,
        tasks::submit_job,
        tasks::list_tasks,
        tasks::get_task,
        nodes::list_nodes,
        nodes::create_bind_token,
        nodes::unbind_node,
        nodes::credit_balance,
        admin::list_users,
        admin::create_user,
        admin::adjust_credits,
        admin::update_role,
        admin::delete_user,
        admin::system_stats,
        admin::list_nodes,
        admin::unbind_node,
        admin::delete_node,
        admin::list_tasks,
        admin::delete_task,
    ),
    components(schemas(
        api::RemoteCallRequest,
        api::RemoteCallResponse,
        api::AsyncJobRequest,
        api::AsyncJobResponse,
        api::TaskStatus,
        api::TaskOrigin,
        api::TaskSummary,
        api::TaskDetail,
        api::TaskPage,
        api::NodeStatus,
        api::NodeSummary,
        api::NodePage,
        api::SessionStatus,
        api::SessionsResponse,
        api::BindTokenResponse,
        api::LedgerEntry,
        api::CreditBalance,
        api::UserRole,
        api::UserSummary,
        api::UserPage,
        api::CreateUserRequest,
        api::CreditAdjustmentRequest,
        api::CreditAdjustmentResponse,
        api::RoleUpdateRequest,
        api::SystemStats,
        api::OkResponse,
        admin::AdminNodesResponse,
        system::HealthResponse,
        ErrorResponse,
        ListParams,
        TaskListParams,
    )),
    tags(
        (name = "system", description = "Health and metrics"),
        (name = "tasks", description = "Remote calls, async jobs and their tasks"),
        (name = "nodes", description = "Owned nodes, binding and credits"),
        (name = "admin", description = "Operator surface"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.info.title = "Fleet Hub API".to_string();
        openapi.info.version = crate::version::FULL_VERSION.to_string();

        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_schemes_from_iter([(
            "gatewayBearer",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("opaque")
                    .description(Some(
                        "Shared gateway token; the authenticated user id travels in the configured user header.",
                    ))
                    .build(),
            ),
        )]);
    }
}
