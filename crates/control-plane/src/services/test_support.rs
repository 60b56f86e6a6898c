use crate::app_state::AppState;
use crate::config::AppConfig;
use crate::persistence::{UserRecord, UserRole, users};

pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        server: crate::config::ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
        },
        metrics: crate::config::MetricsConfig {
            host: "127.0.0.1".into(),
            port: 0,
        },
        tunnel: crate::config::TunnelConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..crate::config::TunnelConfig::default()
        },
        database: crate::config::DatabaseConfig {
            url: "sqlite::memory:".into(),
        },
        gateway: crate::config::GatewayConfig {
            tokens: vec!["gw-token".into()],
            user_header: "x-fleet-user-id".into(),
        },
        calls: crate::config::CallsConfig {
            default_timeout_ms: 1_000,
            max_timeout_ms: 5_000,
            job_ack_timeout_ms: 1_000,
            job_ttl_secs: 3_600,
            job_sweep_interval_secs: 60,
        },
        accrual: crate::config::AccrualConfig::default(),
        limits: crate::config::LimitsConfig::default(),
        bind: crate::config::BindConfig {
            token_ttl_secs: 600,
        },
    }
}

pub(crate) async fn setup_state() -> AppState {
    let db = crate::persistence::migrations::init_pool("sqlite::memory:")
        .await
        .expect("pool");
    let migration_outcome = crate::persistence::migrations::run_migrations(&db)
        .await
        .expect("migrations");
    let metrics_handle = crate::metrics::init_metrics_recorder();
    AppState::new(
        db,
        &test_config(),
        metrics_handle,
        migration_outcome.snapshot,
    )
}

pub(crate) async fn create_user(state: &AppState, email: &str, role: UserRole) -> UserRecord {
    users::create_user(&state.db, email, role)
        .await
        .expect("create user")
}
