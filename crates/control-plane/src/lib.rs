pub mod app_state;
pub mod auth;
pub mod config;
pub mod correlator;
pub mod error;
pub mod http;
pub mod metrics;
pub mod openapi;
pub mod persistence;
pub mod registry;
pub mod routes;
pub mod services;
pub mod tasks;
pub mod telemetry;
pub mod tokens;
pub mod version;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

use std::{env, future::Future, net::SocketAddr, time::Duration};

use axum::Router;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::app_state::AppState;
use crate::metrics::{init_metrics_recorder, record_build_info};
use crate::persistence::{Db, UserRole, users};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandMode {
    Serve,
    Migrate,
    CreateAdmin { email: String },
}

pub fn parse_command() -> Result<CommandMode> {
    parse_args(env::args().skip(1))
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<CommandMode> {
    let Some(first) = args.next() else {
        return Ok(CommandMode::Serve);
    };

    match first.as_str() {
        "serve" => Ok(CommandMode::Serve),
        "migrate" => Ok(CommandMode::Migrate),
        "create-admin" => match args.next() {
            Some(email) if !email.trim().is_empty() => Ok(CommandMode::CreateAdmin { email }),
            _ => anyhow::bail!("create-admin requires an email address"),
        },
        "--help" | "-h" => {
            println!(
                "Usage: fleet-hub [serve|migrate|create-admin <email>]\n\
                 Run without arguments to start the server."
            );
            std::process::exit(0);
        }
        other => anyhow::bail!("unknown argument: {other}"),
    }
}

/// Boot the hub using the provided command mode.
pub async fn run(mode: CommandMode) -> Result<()> {
    run_with_shutdown(mode, shutdown_signal()).await
}

async fn open_database(app_config: &config::AppConfig) -> Result<(Db, persistence::MigrationSnapshot)> {
    let db_pool = persistence::migrations::init_pool(&app_config.database.url).await?;
    let outcome = persistence::migrations::run_migrations(&db_pool).await?;
    if outcome.applied.is_empty() {
        info!(
            current_version = outcome.snapshot.latest_applied,
            target_version = outcome.snapshot.latest_available,
            "database schema is up to date"
        );
    } else {
        for mig in &outcome.applied {
            info!(
                version = mig.version,
                description = mig.description,
                "applied database migration"
            );
        }
    }
    Ok((db_pool, outcome.snapshot))
}

async fn create_admin(db: &Db, email: &str) -> Result<()> {
    let email = services::users::normalize_email(email)
        .map_err(|err| anyhow::anyhow!("{}", err.message))?;
    match users::get_user_by_email(db, &email).await? {
        Some(existing) => {
            if users::update_role(db, existing.id, UserRole::Admin).await? == 0 {
                anyhow::bail!("user {email} disappeared during promotion");
            }
            info!(user_id = existing.id, %email, "promoted existing user to admin");
        }
        None => {
            let user = users::create_user(db, &email, UserRole::Admin).await?;
            info!(user_id = user.id, %email, "created admin user");
        }
    }
    Ok(())
}

pub async fn run_with_shutdown<S>(mode: CommandMode, shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let app_config = config::load()?;
    let (db_pool, schema) = open_database(&app_config).await?;

    match mode {
        CommandMode::Migrate => {
            info!("migrations applied; exiting");
            return Ok(());
        }
        CommandMode::CreateAdmin { email } => return create_admin(&db_pool, &email).await,
        CommandMode::Serve => {}
    }

    let metrics_handle = init_metrics_recorder();
    record_build_info(&schema);
    let state = AppState::new(db_pool, &app_config, metrics_handle, schema);

    let api_addr: SocketAddr = format!("{}:{}", app_config.server.host, app_config.server.port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid listen address: {}", err))?;
    let metrics_addr: SocketAddr =
        format!("{}:{}", app_config.metrics.host, app_config.metrics.port)
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid metrics listen address: {}", err))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let accrual_task = tasks::accrual::spawn_accrual_worker(state.clone(), shutdown_rx.clone());
    let expiry_task = tasks::job_expiry::spawn_job_expiry_worker(
        state.db.clone(),
        state.calls.clone(),
        shutdown_rx.clone(),
    );
    let tunnel_task = services::tunnel::serve(state.clone()).await?;

    let app: Router = routes::build_router(state.clone()).with_state(state.clone());
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    let metrics_app = routes::build_metrics_router().with_state(state.clone());
    let metrics_service = metrics_app.into_make_service_with_connect_info::<SocketAddr>();

    let api_listener = tokio::net::TcpListener::bind(api_addr).await?;
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    info!(%api_addr, "fleet hub listening");
    info!(%metrics_addr, "fleet hub metrics listening");

    let shutdown_tx_for_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown.await;
        let _ = shutdown_tx_for_signal.send(true);
    });

    let mut api_shutdown = shutdown_rx.clone();
    let mut metrics_shutdown = shutdown_rx.clone();

    let mut api_task = tokio::spawn(async move {
        axum::serve(api_listener, make_service)
            .with_graceful_shutdown(async move {
                let _ = api_shutdown.changed().await;
            })
            .await
    });

    let mut metrics_task = tokio::spawn(async move {
        axum::serve(metrics_listener, metrics_service)
            .with_graceful_shutdown(async move {
                let _ = metrics_shutdown.changed().await;
            })
            .await
    });

    let (api_res, metrics_res) = tokio::select! {
        res = &mut api_task => {
            let _ = shutdown_tx.send(true);
            (res, metrics_task.await)
        }
        res = &mut metrics_task => {
            let _ = shutdown_tx.send(true);
            (api_task.await, res)
        }
    };

    tunnel_task.abort();
    let closed = state.registry.close_all("shutdown").await;
    info!(closed, "closed node links");
    if let Some(handle) = accrual_task
        && let Err(err) = handle.await
    {
        warn!(error = %err, "accrual worker ended abnormally");
    }
    if let Some(handle) = expiry_task
        && let Err(err) = handle.await
    {
        warn!(error = %err, "job expiry worker ended abnormally");
    }

    api_res
        .map_err(|err| anyhow::anyhow!("api task failed: {err}"))?
        .map_err(|err| anyhow::anyhow!("api server failed: {err}"))?;
    metrics_res
        .map_err(|err| anyhow::anyhow!("metrics task failed: {err}"))?
        .map_err(|err| anyhow::anyhow!("metrics server failed: {err}"))?;

    Ok(())
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                None
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn parses_commands() {
        assert_eq!(parse_args(args(&[])).unwrap(), CommandMode::Serve);
        assert_eq!(parse_args(args(&["serve"])).unwrap(), CommandMode::Serve);
        assert_eq!(parse_args(args(&["migrate"])).unwrap(), CommandMode::Migrate);
        assert_eq!(
            parse_args(args(&["create-admin", "ops@example.com"])).unwrap(),
            CommandMode::CreateAdmin {
                email: "ops@example.com".into()
            }
        );
        assert!(parse_args(args(&["create-admin"])).is_err());
        assert!(parse_args(args(&["bogus"])).is_err());
    }

    #[tokio::test]
    async fn create_admin_promotes_existing_user() {
        let db = persistence::migrations::init_pool("sqlite::memory:")
            .await
            .expect("pool");
        persistence::migrations::run_migrations(&db)
            .await
            .expect("migrate");
        let user = users::create_user(&db, "ops@example.com", UserRole::User)
            .await
            .expect("user");

        create_admin(&db, "  OPS@example.com ").await.expect("promote");
        let fetched = users::get_user(&db, user.id).await.expect("get").expect("exists");
        assert_eq!(fetched.role, UserRole::Admin);

        create_admin(&db, "new@example.com").await.expect("create");
        let created = users::get_user_by_email(&db, "new@example.com")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(created.role, UserRole::Admin);
    }
}
