#![allow(dead_code)]

use axum::{
    Router,
    body::Body,
    http::{Request as HttpRequest, StatusCode},
};
use fleet_hub::{
    app_state::AppState,
    config::{
        AccrualConfig, AppConfig, BindConfig, CallsConfig, DatabaseConfig, GatewayConfig,
        LimitsConfig, MetricsConfig, ServerConfig, TunnelConfig,
    },
    metrics::init_metrics_recorder,
    persistence::{NodeHello, UserRecord, UserRole, migrations, nodes, users},
    routes::build_router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

pub const GATEWAY_TOKEN: &str = "test-gateway-token";
pub const USER_HEADER: &str = "x-fleet-user-id";

pub fn test_config() -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
        },
        metrics: MetricsConfig {
            host: "127.0.0.1".into(),
            port: 0,
        },
        tunnel: TunnelConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..TunnelConfig::default()
        },
        database: DatabaseConfig {
            url: "sqlite::memory:".into(),
        },
        gateway: GatewayConfig {
            tokens: vec![GATEWAY_TOKEN.into()],
            user_header: USER_HEADER.into(),
        },
        calls: CallsConfig {
            default_timeout_ms: 2_000,
            max_timeout_ms: 5_000,
            job_ack_timeout_ms: 2_000,
            job_ttl_secs: 3_600,
            job_sweep_interval_secs: 60,
        },
        accrual: AccrualConfig {
            enabled: false,
            ..AccrualConfig::default()
        },
        limits: LimitsConfig {
            default_page_limit: 2,
            max_page_limit: 50,
            ..LimitsConfig::default()
        },
        bind: BindConfig {
            token_ttl_secs: 600,
        },
    }
}

pub async fn setup_state_with_config(config: AppConfig) -> AppState {
    let db = migrations::init_pool(&config.database.url)
        .await
        .expect("pool");
    let outcome = migrations::run_migrations(&db).await.expect("migrations");
    AppState::new(db, &config, init_metrics_recorder(), outcome.snapshot)
}

pub async fn setup_state() -> AppState {
    setup_state_with_config(test_config()).await
}

pub async fn setup_app() -> (Router, AppState) {
    let state = setup_state().await;
    let app = build_router(state.clone()).with_state(state.clone());
    (app, state)
}

pub async fn create_user(state: &AppState, email: &str, role: UserRole) -> UserRecord {
    users::create_user(&state.db, email, role)
        .await
        .expect("create user")
}

/// Persist a node as if it had connected once, optionally bound to `owner`.
pub async fn register_node(state: &AppState, node_id: &str, owner: Option<i64>) {
    let now = chrono::Utc::now();
    nodes::upsert_on_connect(
        &state.db,
        &NodeHello {
            id: node_id.to_string(),
            hostname: Some(format!("{node_id}.local")),
            agent_version: "1.0.0".into(),
        },
        now,
    )
    .await
    .expect("upsert node");
    if let Some(user_id) = owner {
        let mut tx = state.db.begin().await.expect("begin");
        let bound = nodes::bind_node_tx(&mut tx, node_id, user_id, now)
            .await
            .expect("bind");
        assert_eq!(bound, 1);
        tx.commit().await.expect("commit");
    }
}

/// Request as the gateway would forward it for `user_id`.
pub fn gateway_request(method: &str, uri: &str, user_id: i64, body: Option<Value>) -> HttpRequest<Body> {
    let builder = HttpRequest::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {GATEWAY_TOKEN}"))
        .header(USER_HEADER, user_id.to_string());
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    }
}

/// Drive one request through the router and decode the JSON body, if any.
pub async fn send(app: &Router, request: HttpRequest<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, body)
}
