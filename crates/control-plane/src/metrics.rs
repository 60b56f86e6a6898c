use std::{
    convert::Infallible,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Instant,
};

use axum::{
    extract::MatchedPath,
    http::{Request, Response as HttpResponse},
};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tower::{Layer, Service};
use tracing::warn;

static METRICS_HANDLE: std::sync::OnceLock<PrometheusHandle> = std::sync::OnceLock::new();

/// Install the Prometheus recorder once and return its render handle.
pub fn init_metrics_recorder() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new()
                .add_global_label("app_version", crate::version::VERSION)
                .build_recorder();
            let handle = recorder.handle();
            if let Err(err) = metrics::set_global_recorder(recorder) {
                warn!(%err, "metrics recorder already installed; exporting an empty registry");
            }
            handle
        })
        .clone()
}

pub fn record_build_info(snapshot: &crate::persistence::MigrationSnapshot) {
    let schema_version = snapshot
        .latest_applied
        .map(|v| v.to_string())
        .unwrap_or_else(|| "none".to_string());

    gauge!(
        "fleet_hub_info",
        "version" => crate::version::VERSION,
        "git_sha" => crate::version::GIT_SHA,
        "schema_version" => schema_version
    )
    .set(1.0);
    gauge!("fleet_hub_migrations_pending").set(snapshot.pending.len() as f64);
}

/// Tower layer recording request counts and latency per matched route.
#[derive(Clone, Default)]
pub struct HttpMetricsLayer;

impl<S> Layer<S> for HttpMetricsLayer {
    type Service = HttpMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpMetricsService { inner }
    }
}

#[derive(Clone)]
pub struct HttpMetricsService<S> {
    inner: S,
}

impl<S, B, ResBody> Service<Request<B>> for HttpMetricsService<S>
where
    S: Service<Request<B>, Response = HttpResponse<ResBody>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let method = req.method().to_string();
        // Unmatched paths share one label to keep cardinality bounded.
        let path = req
            .extensions()
            .get::<MatchedPath>()
            .map(|p| p.as_str().to_owned())
            .unwrap_or_else(|| "unmatched".to_string());
        let start = Instant::now();
        let fut = self.inner.call(req);

        Box::pin(async move {
            let result = fut.await;
            let status = match &result {
                Ok(response) => response.status().as_u16().to_string(),
                Err(_) => "error".to_string(),
            };
            counter!(
                "fleet_hub_http_requests_total",
                "method" => method.clone(),
                "path" => path.clone(),
                "status" => status
            )
            .increment(1);
            histogram!(
                "fleet_hub_http_request_duration_seconds",
                "method" => method,
                "path" => path
            )
            .record(start.elapsed().as_secs_f64());
            result
        })
    }
}
