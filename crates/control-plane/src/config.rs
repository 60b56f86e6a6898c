use std::time::Duration;

use serde::{Deserialize, Deserializer};

pub const ENV_PREFIX: &str = "FLEET_HUB";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub metrics: MetricsConfig,
    pub tunnel: TunnelConfig,
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub calls: CallsConfig,
    pub accrual: AccrualConfig,
    pub limits: LimitsConfig,
    pub bind: BindConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Address the node-facing h2 listener binds to.
    pub host: String,
    pub port: u16,
    /// Expected heartbeat cadence; slower nodes are logged at handshake.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Silence after which a link is dropped.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    /// Fleet-wide secret nodes must present on CONNECT. Open when unset.
    #[serde(default)]
    pub shared_secret: Option<String>,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Capacity of each link's outbound frame queue.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Bearer tokens accepted from the fronting auth gateway.
    #[serde(deserialize_with = "deserialize_string_or_vec")]
    pub tokens: Vec<String>,
    /// Header carrying the authenticated user id.
    pub user_header: String,
}

fn deserialize_string_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match StringOrVec::deserialize(deserializer)? {
        StringOrVec::String(value) => Ok(value.split(',').map(|s| s.to_string()).collect()),
        StringOrVec::Vec(values) => Ok(values),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallsConfig {
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    /// How long an async job waits for the node to accept it.
    pub job_ack_timeout_ms: u64,
    /// Accepted jobs with no completion after this long are failed; 0 keeps
    /// them running indefinitely.
    pub job_ttl_secs: u64,
    pub job_sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccrualConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub credits_per_unit: i64,
    pub unit_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    pub default_page_limit: u32,
    pub max_page_limit: u32,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BindConfig {
    pub token_ttl_secs: u64,
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_heartbeat_timeout_secs() -> u64 {
    90
}

fn default_max_frame_bytes() -> usize {
    common::protocol::DEFAULT_MAX_FRAME_BYTES
}

fn default_outbound_queue() -> usize {
    64
}

impl TunnelConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.trim().is_empty() {
            anyhow::bail!("tunnel.host cannot be empty");
        }
        if self.heartbeat_interval_secs == 0 {
            anyhow::bail!("tunnel.heartbeat_interval_secs must be > 0");
        }
        if self.heartbeat_timeout_secs <= self.heartbeat_interval_secs {
            anyhow::bail!("tunnel.heartbeat_timeout_secs must exceed heartbeat interval");
        }
        if self.max_frame_bytes < 1024 {
            anyhow::bail!("tunnel.max_frame_bytes must be at least 1024");
        }
        if self.outbound_queue == 0 {
            anyhow::bail!("tunnel.outbound_queue must be > 0");
        }
        if let Some(secret) = &self.shared_secret
            && secret.trim().is_empty()
        {
            anyhow::bail!("tunnel.shared_secret cannot be empty when set");
        }
        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 7443,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            shared_secret: None,
            max_frame_bytes: default_max_frame_bytes(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tokens.is_empty() {
            anyhow::bail!("gateway.tokens cannot be empty");
        }
        if self.user_header.trim().is_empty() {
            anyhow::bail!("gateway.user_header cannot be empty");
        }
        Ok(())
    }
}

impl CallsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_timeout_ms == 0 || self.job_ack_timeout_ms == 0 {
            anyhow::bail!("calls timeouts must be > 0");
        }
        if self.default_timeout_ms > self.max_timeout_ms {
            anyhow::bail!("calls.default_timeout_ms must be <= calls.max_timeout_ms");
        }
        if self.job_ttl_secs > 0 && self.job_sweep_interval_secs == 0 {
            anyhow::bail!("calls.job_sweep_interval_secs must be > 0 when job expiry is enabled");
        }
        Ok(())
    }

    /// Requested timeout capped to the configured maximum.
    pub fn effective_timeout(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .filter(|ms| *ms > 0)
            .unwrap_or(self.default_timeout_ms)
            .min(self.max_timeout_ms);
        Duration::from_millis(ms)
    }

    pub fn job_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.job_ack_timeout_ms)
    }

    pub fn job_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.job_sweep_interval_secs.max(1))
    }
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_timeout_ms: 120_000,
            job_ack_timeout_ms: 10_000,
            job_ttl_secs: 86_400,
            job_sweep_interval_secs: 300,
        }
    }
}

impl AccrualConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval_secs == 0 {
            anyhow::bail!("accrual.interval_secs must be > 0");
        }
        if self.unit_secs == 0 {
            anyhow::bail!("accrual.unit_secs must be > 0");
        }
        if self.credits_per_unit < 0 {
            anyhow::bail!("accrual.credits_per_unit cannot be negative");
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for AccrualConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            credits_per_unit: 1,
            unit_secs: 60,
        }
    }
}

impl LimitsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_page_limit == 0 || self.max_page_limit == 0 {
            anyhow::bail!("limits page sizes must be > 0");
        }
        if self.default_page_limit > self.max_page_limit {
            anyhow::bail!("limits.default_page_limit must be <= limits.max_page_limit");
        }
        if self.max_body_bytes == 0 {
            anyhow::bail!("limits.max_body_bytes must be > 0");
        }
        Ok(())
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_page_limit: 50,
            max_page_limit: 100,
            max_body_bytes: 256 * 1024,
        }
    }
}

impl BindConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.token_ttl_secs == 0 {
            anyhow::bail!("bind.token_ttl_secs must be > 0");
        }
        Ok(())
    }
}

impl AppConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.tunnel.validate()?;
        self.gateway.validate()?;
        self.calls.validate()?;
        self.accrual.validate()?;
        self.limits.validate()?;
        self.bind.validate()?;
        Ok(())
    }
}

pub fn load() -> anyhow::Result<AppConfig> {
    let env = config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        // Keep try_parsing disabled so numeric secrets are not coerced.
        .try_parsing(false);

    let builder = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .add_source(env)
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8080)?
        .set_default("metrics.host", "0.0.0.0")?
        .set_default("metrics.port", 9090)?
        .set_default("tunnel.host", "0.0.0.0")?
        .set_default("tunnel.port", 7443)?
        .set_default(
            "tunnel.heartbeat_interval_secs",
            default_heartbeat_interval_secs(),
        )?
        .set_default(
            "tunnel.heartbeat_timeout_secs",
            default_heartbeat_timeout_secs(),
        )?
        .set_default("tunnel.max_frame_bytes", default_max_frame_bytes() as u64)?
        .set_default("tunnel.outbound_queue", default_outbound_queue() as u64)?
        .set_default("database.url", "sqlite://data/fleet-hub.db")?
        .set_default("gateway.tokens", vec!["dev-gateway-token"])?
        .set_default("gateway.user_header", "x-fleet-user-id")?
        .set_default("calls.default_timeout_ms", 30_000u64)?
        .set_default("calls.max_timeout_ms", 120_000u64)?
        .set_default("calls.job_ack_timeout_ms", 10_000u64)?
        .set_default("calls.job_ttl_secs", 86_400u64)?
        .set_default("calls.job_sweep_interval_secs", 300u64)?
        .set_default("accrual.enabled", true)?
        .set_default("accrual.interval_secs", 60u64)?
        .set_default("accrual.credits_per_unit", 1i64)?
        .set_default("accrual.unit_secs", 60u64)?
        .set_default("limits.default_page_limit", 50u32)?
        .set_default("limits.max_page_limit", 100u32)?
        .set_default("limits.max_body_bytes", 256 * 1024u64)?
        .set_default("bind.token_ttl_secs", 600u64)?;

    let cfg = builder.build()?;
    let mut app: AppConfig = cfg.try_deserialize()?;
    app.gateway.tokens = app
        .gateway
        .tokens
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    app.gateway.user_header = app.gateway.user_header.trim().to_ascii_lowercase();
    app.validate()?;
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, panic, sync::Mutex};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_hub_env(vars: &[(&str, &str)], test: impl FnOnce() + panic::UnwindSafe) {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let prefix = format!("{}__", ENV_PREFIX);

        let existing: Vec<(String, String)> = env::vars()
            .filter(|(key, _)| key.starts_with(&prefix))
            .collect();

        // SAFETY: tests touching the environment are serialised by ENV_LOCK.
        unsafe {
            for (key, _) in &existing {
                env::remove_var(key);
            }
            for (key, value) in vars {
                env::set_var(key, value);
            }
        }

        let result = panic::catch_unwind(test);

        unsafe {
            for (key, _) in vars {
                env::remove_var(key);
            }
            for (key, value) in existing {
                env::set_var(key, value);
            }
        }

        if let Err(panic) = result {
            panic::resume_unwind(panic);
        }
    }

    #[test]
    fn defaults_load_and_validate() {
        with_hub_env(&[], || {
            let cfg = load().expect("config loads");
            assert_eq!(cfg.server.port, 8080);
            assert_eq!(cfg.tunnel.port, 7443);
            assert_eq!(cfg.accrual.interval_secs, 60);
            assert_eq!(cfg.accrual.credits_per_unit, 1);
            assert_eq!(cfg.gateway.tokens, vec!["dev-gateway-token".to_string()]);
            assert!(cfg.tunnel.shared_secret.is_none());
        });
    }

    #[test]
    fn numeric_secrets_remain_strings() {
        with_hub_env(
            &[
                ("FLEET_HUB__GATEWAY__TOKENS", "1111, 2222"),
                ("FLEET_HUB__TUNNEL__SHARED_SECRET", "000123"),
            ],
            || {
                let cfg = load().expect("config loads");
                assert_eq!(
                    cfg.gateway.tokens,
                    vec!["1111".to_string(), "2222".to_string()]
                );
                assert_eq!(cfg.tunnel.shared_secret.as_deref(), Some("000123"));
            },
        );
    }

    #[test]
    fn numeric_and_bool_env_values_still_parse() {
        with_hub_env(
            &[
                ("FLEET_HUB__SERVER__PORT", "9191"),
                ("FLEET_HUB__ACCRUAL__ENABLED", "false"),
                ("FLEET_HUB__ACCRUAL__INTERVAL_SECS", "30"),
                ("FLEET_HUB__CALLS__DEFAULT_TIMEOUT_MS", "500"),
            ],
            || {
                let cfg = load().expect("config loads");
                assert_eq!(cfg.server.port, 9191);
                assert!(!cfg.accrual.enabled);
                assert_eq!(cfg.accrual.interval_secs, 30);
                assert_eq!(cfg.calls.default_timeout_ms, 500);
            },
        );
    }

    #[test]
    fn invalid_heartbeat_window_is_rejected() {
        with_hub_env(
            &[
                ("FLEET_HUB__TUNNEL__HEARTBEAT_INTERVAL_SECS", "60"),
                ("FLEET_HUB__TUNNEL__HEARTBEAT_TIMEOUT_SECS", "30"),
            ],
            || {
                let err = load().expect_err("invalid window");
                assert!(err.to_string().contains("heartbeat_timeout_secs"));
            },
        );
    }

    #[test]
    fn effective_timeout_is_capped() {
        let calls = CallsConfig {
            default_timeout_ms: 1_000,
            max_timeout_ms: 5_000,
            job_ack_timeout_ms: 1_000,
            ..CallsConfig::default()
        };
        assert_eq!(calls.effective_timeout(None), Duration::from_millis(1_000));
        assert_eq!(calls.effective_timeout(Some(0)), Duration::from_millis(1_000));
        assert_eq!(calls.effective_timeout(Some(50)), Duration::from_millis(50));
        assert_eq!(
            calls.effective_timeout(Some(60_000)),
            Duration::from_millis(5_000)
        );
    }
}
