//! Prometheus metrics for the enforcement loop

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, Encoder, HistogramVec, IntCounter, IntCounterVec,
    Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

/// Enforcement metrics for Prometheus
#[derive(Clone)]
pub struct EnforcerMetrics {
    /// Every event drained from the stream, by action
    pub events_total: IntCounterVec,
    /// Adjudication results by label, see `Adjudication::label`
    pub adjudications_total: IntCounterVec,
    pub verification_seconds: HistogramVec,
    /// Containers left running after a failed stop
    pub remediation_failures_total: IntCounter,
    pub reconnects_total: IntCounter,

    registry: Arc<Registry>,
}

impl EnforcerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let events_total = register_int_counter_vec_with_registry!(
            "sigward_events_total",
            "Total number of engine events received by action",
            &["action"],
            registry
        )?;

        let adjudications_total = register_int_counter_vec_with_registry!(
            "sigward_adjudications_total",
            "Total number of adjudicated events by result",
            &["result"],
            registry
        )?;

        let verification_seconds = register_histogram_vec_with_registry!(
            "sigward_verification_seconds",
            "Signature verification duration in seconds by outcome",
            &["outcome"],
            vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
            registry
        )?;

        let remediation_failures_total = register_int_counter_with_registry!(
            "sigward_remediation_failures_total",
            "Total number of containers that failed verification and could not be stopped",
            registry
        )?;

        let reconnects_total = register_int_counter_with_registry!(
            "sigward_reconnects_total",
            "Total number of event subscription reconnect attempts",
            registry
        )?;

        Ok(Self {
            events_total,
            adjudications_total,
            verification_seconds,
            remediation_failures_total,
            reconnects_total,
            registry: Arc::new(registry),
        })
    }

    pub fn observe_verification(&self, outcome: &str, duration: Duration) {
        self.verification_seconds
            .with_label_values(&[outcome])
            .observe(duration.as_secs_f64());
    }

    /// Text exposition of all metrics
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

async fn metrics_handler(State(metrics): State<Arc<EnforcerMetrics>>) -> Response {
    match metrics.export() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

pub fn router(metrics: Arc<EnforcerMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(metrics)
}

/// Serve /metrics and /health until the listener fails
pub async fn serve(addr: SocketAddr, metrics: Arc<EnforcerMetrics>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics listener on {}", addr))?;
    info!("[BOOT] Metrics endpoint on http://{}/metrics", addr);

    axum::serve(listener, router(metrics))
        .await
        .context("Metrics server error")
}
