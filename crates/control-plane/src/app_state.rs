use metrics_exporter_prometheus::PrometheusHandle;

use crate::{
    config::{AccrualConfig, BindConfig, CallsConfig, GatewayConfig, LimitsConfig, TunnelConfig},
    correlator::CallCorrelator,
    persistence,
    registry::ConnectionRegistry,
};

/// Shared application state passed into handlers, the tunnel listener and
/// the accrual worker.
#[derive(Clone)]
pub struct AppState {
    pub db: persistence::Db,
    pub registry: ConnectionRegistry,
    pub correlator: CallCorrelator,
    pub gateway: GatewayConfig,
    pub tunnel: TunnelConfig,
    pub calls: CallsConfig,
    pub accrual: AccrualConfig,
    pub limits: LimitsConfig,
    pub bind: BindConfig,
    pub metrics_handle: PrometheusHandle,
    pub schema: persistence::MigrationSnapshot,
}

impl AppState {
    pub fn new(
        db: persistence::Db,
        config: &crate::config::AppConfig,
        metrics_handle: PrometheusHandle,
        schema: persistence::MigrationSnapshot,
    ) -> Self {
        let registry = ConnectionRegistry::new();
        Self {
            db,
            correlator: CallCorrelator::new(registry.clone()),
            registry,
            gateway: config.gateway.clone(),
            tunnel: config.tunnel.clone(),
            calls: config.calls.clone(),
            accrual: config.accrual.clone(),
            limits: config.limits.clone(),
            bind: config.bind.clone(),
            metrics_handle,
            schema,
        }
    }
}

#[allow(dead_code)]
fn _assert_app_state_bounds() {
    fn assert_bounds<T: Clone + Send + Sync + 'static>() {}
    assert_bounds::<AppState>();
}
