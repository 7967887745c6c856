//! Prometheus metrics for the gateway.
//!
//! Each [`Metrics`] owns its own registry, so independent gateways (tests)
//! never share counters. The daemon serves [`router`] on `metrics_listen`.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::tracing::prelude::*;

/// Latency histogram bucket bounds, in seconds.
pub const LATENCY_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

pub struct Metrics {
    registry: Registry,
    commands: IntCounterVec,
    errors: IntCounterVec,
    latency: Histogram,
    temperature: Gauge,
    setpoint: Gauge,
    running: Gauge,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let commands = IntCounterVec::new(
            Opts::new("julabo_commands_total", "Commands processed, by name"),
            &["command"],
        )?;
        let errors = IntCounterVec::new(
            Opts::new("julabo_commands_errors_total", "Failed requests, by error kind"),
            &["type"],
        )?;
        let latency = Histogram::with_opts(
            HistogramOpts::new(
                "julabo_command_latency_seconds",
                "Time from request parse to response",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )?;
        let temperature = Gauge::new(
            "julabo_temperature_celsius",
            "Last reported process temperature",
        )?;
        let setpoint = Gauge::new("julabo_setpoint_celsius", "Last reported setpoint")?;
        let running = Gauge::new("julabo_pump_running", "1 when circulation was last seen running")?;

        registry.register(Box::new(commands.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        registry.register(Box::new(temperature.clone()))?;
        registry.register(Box::new(setpoint.clone()))?;
        registry.register(Box::new(running.clone()))?;

        Ok(Self {
            registry,
            commands,
            errors,
            latency,
            temperature,
            setpoint,
            running,
        })
    }

    pub fn record_command(&self, command: &str, latency: Duration) {
        self.commands.with_label_values(&[command]).inc();
        self.latency.observe(latency.as_secs_f64());
    }

    pub fn record_error(&self, kind: &str) {
        self.errors.with_label_values(&[kind]).inc();
    }

    pub fn command_count(&self, command: &str) -> u64 {
        self.commands.with_label_values(&[command]).get()
    }

    pub fn error_count(&self, kind: &str) -> u64 {
        self.errors.with_label_values(&[kind]).get()
    }

    /// Update the last-known readings from a `status_all` style result.
    pub fn cache_status(&self, result: &Value) {
        if let Some(t) = result.get("temperature").and_then(Value::as_f64) {
            self.temperature.set(t);
        }
        if let Some(sp) = result.get("setpoint").and_then(Value::as_f64) {
            self.setpoint.set(sp);
        }
        if let Some(running) = result.get("is_running").and_then(Value::as_bool) {
            self.running.set(if running { 1.0 } else { 0.0 });
        }
    }

    /// Prometheus text exposition of every metric.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            error!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4; charset=utf-8")],
        metrics.render(),
    )
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// `GET /metrics` and `GET /health`.
pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(metrics)
}

/// Serve the metrics endpoint until cancelled.
pub async fn serve(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    running: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Metrics endpoint listening");
    }
    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move { running.cancelled().await })
        .await
}
