//! Prometheus metrics and the probe endpoints
//!
//! One registry per operator instance, served on `--metrics-addr` next to
//! `/healthz` and `/readyz`.

use crate::error::ControllerError;
use crate::reconciler::applier::ApplyOutcome;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Operator metrics
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    reconcile_total: IntCounterVec,
    reconcile_errors_total: IntCounterVec,
    applied_objects_total: IntCounterVec,
    state_duration_seconds: Histogram,
}

impl Metrics {
    /// Registers every metric in a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconcile_total = IntCounterVec::new(
            Opts::new("sro_reconcile_total", "SpecialResource reconciles by result"),
            &["result"],
        )?;
        registry.register(Box::new(reconcile_total.clone()))?;

        let reconcile_errors_total = IntCounterVec::new(
            Opts::new("sro_reconcile_errors_total", "Failed SpecialResource reconciles by error kind"),
            &["reason"],
        )?;
        registry.register(Box::new(reconcile_errors_total.clone()))?;

        let applied_objects_total = IntCounterVec::new(
            Opts::new("sro_applied_objects_total", "Objects applied by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(applied_objects_total.clone()))?;

        let state_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("sro_state_duration_seconds", "Time to apply a state and wait for it to be ready")
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        )?;
        registry.register(Box::new(state_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            reconcile_total,
            reconcile_errors_total,
            applied_objects_total,
            state_duration_seconds,
        })
    }

    /// Counts a finished reconcile (`ready`, `awaiting_parent`, `failed`, `torn_down`)
    pub fn record_reconcile(&self, result: &str) {
        self.reconcile_total.with_label_values(&[result]).inc();
    }

    /// Counts a failed reconcile by taxonomy reason
    pub fn record_error(&self, reason: &str) {
        self.reconcile_errors_total.with_label_values(&[reason]).inc();
    }

    /// Counts one applied object
    pub fn record_apply(&self, outcome: ApplyOutcome) {
        self.applied_objects_total.with_label_values(&[outcome.as_str()]).inc();
    }

    /// Records how long a state took
    pub fn observe_state(&self, elapsed: Duration) {
        self.state_duration_seconds.observe(elapsed.as_secs_f64());
    }

    /// Text exposition of every metric
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Readiness flag flipped once the controller is running
#[derive(Debug, Clone, Default)]
pub struct Health {
    ready: Arc<AtomicBool>,
}

impl Health {
    /// Marks the operator ready (or not)
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Current readiness
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct AppState {
    metrics: Arc<Metrics>,
    health: Health,
}

/// `/metrics`, `/healthz` and `/readyz`
pub fn router(metrics: Arc<Metrics>, health: Health) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { metrics, health })
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn readyz_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.health.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Serves the router on `addr` until `shutdown` is cancelled
pub async fn serve(addr: SocketAddr, router: Router, shutdown: CancellationToken) -> Result<(), ControllerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::Config(format!("cannot bind metrics address {addr}: {e}")))?;
    info!("Serving metrics and probes on {}", addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| ControllerError::Watch(format!("metrics server failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    #[test]
    fn test_render_includes_recorded_values() {
        let metrics = Metrics::new().unwrap();
        metrics.record_reconcile("ready");
        metrics.record_error("RenderError");
        metrics.record_apply(ApplyOutcome::Created);
        metrics.observe_state(Duration::from_millis(250));

        let text = metrics.render();
        assert!(text.contains(r#"sro_reconcile_total{result="ready"} 1"#));
        assert!(text.contains(r#"sro_reconcile_errors_total{reason="RenderError"} 1"#));
        assert!(text.contains(r#"sro_applied_objects_total{outcome="created"} 1"#));
        assert!(text.contains("sro_state_duration_seconds_count 1"));
    }

    #[tokio::test]
    async fn test_probes() {
        let health = Health::default();
        let app = router(Arc::new(Metrics::new().unwrap()), health.clone());

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        health.set_ready(true);
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }
}
