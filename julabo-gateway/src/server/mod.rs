//! TCP gateway exposing registered chillers to network clients.
//!
//! A [`Gateway`] is a cheap handle (an `Arc`) onto the state every
//! connection worker shares: the device registry, the runtime settings, the
//! rate limiter, the audit log, metrics and the schedule table. Nothing here
//! is global, so tests can run several gateways side by side.
//!
//! Request pipeline, in order:
//!
//! 1. rate limit per client IP (before JSON parsing, see [`connection`])
//! 2. auth token
//! 3. `command` present
//! 4. read-only gate
//! 5. `ping` fast path (no device access)
//! 6. device lookup, then the watchdog's online flag
//! 7. execute under the device lock, auditing mutating commands

pub mod connection;
pub mod protocol;
pub mod registry;
pub mod schedules;
pub mod tls;

use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::audit::{AuditLog, AuditRecord, AuditSink};
use crate::config::RuntimeSettings;
use crate::device::Chiller;
use crate::dispatch::{self, Command};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::rate_limit::{RateLimiter, DEFAULT_WINDOW};
use crate::schedule::SetpointSchedule;
use crate::tracing::prelude::*;

use protocol::{Request, Response};
use registry::{Registry, SharedDevice, DEFAULT_DEVICE_ID};
use schedules::Schedules;

/// Schedule commands that change device state over time.
pub const SCHEDULE_WRITE_COMMANDS: [&str; 2] = ["load_schedule", "stop_schedule"];

/// Startup options for a [`Gateway`].
pub struct GatewayOptions {
    pub auth_token: Option<String>,
    pub settings: RuntimeSettings,
    pub audit: AuditLog,
    pub metrics: Option<Arc<Metrics>>,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            auth_token: None,
            settings: RuntimeSettings::default(),
            audit: AuditLog::new(),
            metrics: None,
        }
    }
}

struct Inner {
    registry: Registry,
    auth_token: Option<String>,
    settings: RwLock<RuntimeSettings>,
    rate_limiter: RwLock<Option<Arc<RateLimiter>>>,
    audit: AuditLog,
    metrics: Option<Arc<Metrics>>,
    schedules: Schedules,
    shutting_down: AtomicBool,
    active_connections: AtomicUsize,
}

#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    /// Create a gateway serving `chiller` as the default device.
    pub fn new(chiller: impl Chiller + 'static, options: GatewayOptions) -> Self {
        let registry = Registry::new();
        registry.insert(SharedDevice::new(DEFAULT_DEVICE_ID, chiller));
        let rate_limiter = limiter_for(&options.settings);

        Self {
            inner: Arc::new(Inner {
                registry,
                auth_token: options.auth_token.filter(|t| !t.is_empty()),
                settings: RwLock::new(options.settings),
                rate_limiter: RwLock::new(rate_limiter),
                audit: options.audit,
                metrics: options.metrics,
                schedules: Schedules::default(),
                shutting_down: AtomicBool::new(false),
                active_connections: AtomicUsize::new(0),
            }),
        }
    }

    /// Register another device under `id`.
    pub fn add_device(&self, id: &str, chiller: impl Chiller + 'static) -> SharedDevice {
        let device = SharedDevice::new(id, chiller);
        self.inner.registry.insert(device.clone());
        info!(device = %id, "Registered device");
        device
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.inner.metrics.as_ref()
    }

    pub fn settings(&self) -> RuntimeSettings {
        self.inner.settings.read().clone()
    }

    /// Apply new runtime settings.
    pub fn reload(&self, settings: RuntimeSettings) {
        let mut current = self.inner.settings.write();
        if current.rate_limit != settings.rate_limit {
            *self.inner.rate_limiter.write() = limiter_for(&settings);
            info!(rate_limit = ?settings.rate_limit, "Reloaded rate limit");
        }
        if current.read_only != settings.read_only {
            info!(read_only = settings.read_only, "Reloaded read-only mode");
        }
        if current.idle_timeout != settings.idle_timeout {
            info!(idle_timeout = ?settings.idle_timeout, "Reloaded idle timeout");
        }
        *current = settings;
    }

    /// Count a request from `client_ip` against its rate budget.
    pub fn check_rate(&self, client_ip: &str) -> Result<()> {
        let limiter = self.inner.rate_limiter.read().clone();
        match limiter {
            Some(limiter) if !limiter.allow(client_ip) => Err(Error::RateLimited),
            _ => Ok(()),
        }
    }

    /// Stop admitting connections.
    pub fn begin_shutdown(&self) {
        if !self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            info!(
                active = self.active_connections(),
                "Beginning shutdown with active connection(s)"
            );
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    pub fn active_connections(&self) -> usize {
        self.inner.active_connections.load(Ordering::SeqCst)
    }

    /// Admit a connection; `None` once shutdown has begun. The connection
    /// counts as active until the guard drops.
    pub fn admit(&self) -> Option<ConnectionGuard> {
        if self.is_shutting_down() {
            return None;
        }
        self.inner.active_connections.fetch_add(1, Ordering::SeqCst);
        Some(ConnectionGuard {
            gateway: self.clone(),
        })
    }

    /// Stop schedules and wait for their tickers.
    pub async fn shutdown_schedules(&self) {
        self.inner.schedules.shutdown().await;
    }

    /// Handle one request line that already passed the rate limit.
    pub async fn handle_line(&self, line: &str, client_ip: &str) -> Response {
        let result = match Request::parse(line) {
            Ok(request) => self.process(request, client_ip).await,
            Err(e) => Err(e),
        };
        self.respond(result, client_ip)
    }

    /// Build the reply for a result, logging and counting failures.
    pub fn respond(&self, result: Result<Value>, client_ip: &str) -> Response {
        match result {
            Ok(value) => Response::ok(value),
            Err(e) => {
                warn!(client = %client_ip, kind = e.kind(), error = %e, "Request failed");
                if let Some(metrics) = &self.inner.metrics {
                    metrics.record_error(e.kind());
                }
                Response::error(&e)
            }
        }
    }

    /// Run one parsed request.
    pub async fn process(&self, request: Request, client_ip: &str) -> Result<Value> {
        let started = Instant::now();

        if let Some(expected) = &self.inner.auth_token {
            if request.token.as_deref() != Some(expected.as_str()) {
                return Err(Error::Permission);
            }
        }

        let name = request
            .command
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::Validation("Missing 'command' in request payload".into()))?;

        let read_only = self.inner.settings.read().read_only;
        if read_only && (dispatch::is_mutating(name) || SCHEDULE_WRITE_COMMANDS.contains(&name)) {
            return Err(Error::ReadOnly);
        }

        if name == "ping" {
            self.record(name, started, None);
            return Ok(json!("pong"));
        }

        let device = self.inner.registry.resolve(request.chiller_id.as_deref())?;
        device.ensure_online()?;

        let result = match name {
            "load_schedule" => {
                let csv = request.csv.as_deref().filter(|c| !c.is_empty()).ok_or_else(|| {
                    Error::Validation("'load_schedule' requires a 'csv' string".into())
                })?;
                let schedule = SetpointSchedule::from_csv(csv)?;
                info!(client = %client_ip, device = %device.id(), "Loading schedule");
                self.inner.schedules.load(device.clone(), schedule)
            }
            "stop_schedule" => {
                if self.inner.schedules.stop(device.id()) {
                    info!(client = %client_ip, device = %device.id(), "Schedule stopped");
                }
                json!("stopped")
            }
            "schedule_status" => self.inner.schedules.status(device.id()),
            _ => {
                let command = Command::parse(name, request.value.as_ref())?;
                self.execute(&device, &command, client_ip).await?
            }
        };

        self.record(name, started, Some(&result));
        Ok(result)
    }

    async fn execute(&self, device: &SharedDevice, command: &Command, client_ip: &str) -> Result<Value> {
        let mut guard = device.chiller().lock().await;
        // The watchdog may have taken the device down while we waited.
        device.ensure_online()?;
        let chiller: &mut dyn Chiller = &mut **guard;

        if !command.is_mutating() {
            return command.execute(chiller).await.map_err(recovering);
        }

        let old_value = prior_value(command, chiller).await;
        let result = command.execute(chiller).await.map_err(recovering)?;
        self.inner.audit.record(&AuditRecord::new(
            client_ip,
            device.id(),
            command.name(),
            old_value,
            result.to_string(),
        ));
        Ok(result)
    }

    fn record(&self, command: &str, started: Instant, result: Option<&Value>) {
        let latency = started.elapsed();
        debug!(command, latency_ms = latency.as_secs_f64() * 1000.0, "Processed command");
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_command(command, latency);
            if command == "status_all" {
                if let Some(result) = result {
                    metrics.cache_status(result);
                }
            }
        }
    }
}

/// A link that is closed or was never opened is a device awaiting recovery.
fn recovering(e: Error) -> Error {
    match e {
        Error::NotConnected => Error::Reconnecting,
        other => other,
    }
}

/// Best-effort read of the state a mutating command is about to change.
async fn prior_value(command: &Command, chiller: &mut dyn Chiller) -> Option<String> {
    match command {
        Command::SetSetpoint(_) => chiller.setpoint().await.ok().map(|v| v.to_string()),
        Command::Start | Command::Stop | Command::SetRunning(_) => {
            chiller.is_running().await.ok().map(|v| v.to_string())
        }
        _ => None,
    }
}

fn limiter_for(settings: &RuntimeSettings) -> Option<Arc<RateLimiter>> {
    settings
        .rate_limit
        .map(|max| Arc::new(RateLimiter::new(max, DEFAULT_WINDOW)))
}

/// Marks a connection active while alive.
pub struct ConnectionGuard {
    gateway: Gateway,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.gateway
            .inner
            .active_connections
            .fetch_sub(1, Ordering::SeqCst);
    }
}

/// Accept clients until `running` is cancelled, then wait for open
/// connections to finish their in-flight request.
pub async fn serve(
    gateway: Gateway,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    running: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, tls = tls.is_some(), "Gateway listening");
    }
    let tracker = TaskTracker::new();

    loop {
        let (socket, peer) = tokio::select! {
            _ = running.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            },
        };

        let Some(guard) = gateway.admit() else {
            debug!(peer = %peer, "Rejecting connection during shutdown");
            continue;
        };
        let gateway = gateway.clone();
        let tls = tls.clone();
        let running = running.clone();

        tracker.spawn(async move {
            let _guard = guard;
            let client_ip = peer.ip().to_string();
            debug!(client = %client_ip, "Client connected");

            let result = match tls {
                Some(acceptor) => match acceptor.accept(socket).await {
                    Ok(stream) => {
                        connection::handle_connection(&gateway, stream, &client_ip, running).await
                    }
                    Err(e) => {
                        warn!(client = %client_ip, error = %e, "TLS handshake failed");
                        return;
                    }
                },
                None => connection::handle_connection(&gateway, socket, &client_ip, running).await,
            };

            match result {
                Ok(()) => debug!(client = %client_ip, "Client disconnected"),
                Err(e) => debug!(client = %client_ip, error = %e, "Connection closed with error"),
            }
        });
    }

    gateway.begin_shutdown();
    tracker.close();
    tracker.wait().await;
    info!("Gateway stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::SimulatedChiller;
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<AuditRecord>>>);

    impl AuditSink for Collect {
        fn record(&self, record: &AuditRecord) {
            self.0.lock().push(record.clone());
        }
    }

    async fn sim() -> SimulatedChiller {
        let mut chiller = SimulatedChiller::default();
        chiller.connect().await.unwrap();
        chiller
    }

    async fn gateway(options: GatewayOptions) -> Gateway {
        Gateway::new(sim().await, options)
    }

    async fn call(gateway: &Gateway, line: &str) -> Response {
        gateway.handle_line(line, "127.0.0.1").await
    }

    #[tokio::test]
    async fn test_ping() {
        let gw = gateway(GatewayOptions::default()).await;
        let response = call(&gw, r#"{"command":"ping"}"#).await;
        assert_eq!(response, Response::ok(json!("pong")));
    }

    #[tokio::test]
    async fn test_set_and_read_setpoint() {
        let gw = gateway(GatewayOptions::default()).await;
        let response = call(&gw, r#"{"command":"set_setpoint","value":30}"#).await;
        assert_eq!(response.result(), Some(&json!(30.0)));
        let response = call(&gw, r#"{"command":"get_setpoint"}"#).await;
        assert_eq!(response.result(), Some(&json!(30.0)));
    }

    #[tokio::test]
    async fn test_read_only() {
        let gw = gateway(GatewayOptions {
            settings: RuntimeSettings {
                read_only: true,
                ..RuntimeSettings::default()
            },
            ..GatewayOptions::default()
        })
        .await;

        for line in [
            r#"{"command":"set_setpoint","value":30}"#,
            r#"{"command":"start"}"#,
            r#"{"command":"stop"}"#,
            r#"{"command":"set_running","value":true}"#,
            r#"{"command":"load_schedule","csv":"0,20\n10,30"}"#,
            r#"{"command":"stop_schedule"}"#,
        ] {
            let response = call(&gw, line).await;
            assert_eq!(response.error_message(), Some("Server is in read-only mode"), "{line}");
        }
        assert!(call(&gw, r#"{"command":"ping"}"#).await.is_ok());
        assert!(call(&gw, r#"{"command":"status"}"#).await.is_ok());
        assert!(call(&gw, r#"{"command":"schedule_status"}"#).await.is_ok());
    }

    #[tokio::test]
    async fn test_auth_token() {
        let gw = gateway(GatewayOptions {
            auth_token: Some("s3cret".into()),
            ..GatewayOptions::default()
        })
        .await;

        for line in [
            r#"{"command":"ping"}"#,
            r#"{"command":"ping","token":"wrong"}"#,
        ] {
            let response = call(&gw, line).await;
            assert_eq!(response.error_message(), Some("Authentication failed"));
        }
        assert!(call(&gw, r#"{"command":"ping","token":"s3cret"}"#).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_device_and_command() {
        let gw = gateway(GatewayOptions::default()).await;
        let response = call(&gw, r#"{"command":"status","chiller_id":"ghost"}"#).await;
        assert!(response.error_message().unwrap().contains("Unknown chiller_id"));

        let response = call(&gw, r#"{"command":"load_schedule","chiller_id":"ghost","csv":"0,20"}"#).await;
        assert!(response.error_message().unwrap().contains("Unknown chiller_id"));

        let response = call(&gw, r#"{"command":"reboot"}"#).await;
        assert!(response.error_message().unwrap().contains("Unsupported command"));
    }

    #[tokio::test]
    async fn test_process_typed_request() {
        let gw = gateway(GatewayOptions {
            auth_token: Some("s3cret".into()),
            ..GatewayOptions::default()
        })
        .await;
        gw.add_device("bath2", sim().await);

        let request = Request::new("set_setpoint")
            .with_value(json!("18.5"))
            .with_chiller("bath2")
            .with_token("s3cret");
        assert_eq!(gw.process(request, "127.0.0.1").await.unwrap(), json!(18.5));

        let request = Request::new("get_setpoint").with_chiller("bath2");
        assert!(matches!(
            gw.process(request, "127.0.0.1").await,
            Err(Error::Permission)
        ));
    }

    #[tokio::test]
    async fn test_missing_command_and_bad_json() {
        let gw = gateway(GatewayOptions::default()).await;
        let response = call(&gw, r#"{"value":1}"#).await;
        assert_eq!(
            response.error_message(),
            Some("Invalid request: Missing 'command' in request payload")
        );
        let response = call(&gw, "{oops").await;
        assert!(response.error_message().unwrap().starts_with("Invalid request"));
    }

    #[tokio::test]
    async fn test_multiple_devices() {
        let gw = gateway(GatewayOptions::default()).await;
        gw.add_device("bath2", sim().await);

        call(&gw, r#"{"command":"set_setpoint","value":12.5,"chiller_id":"bath2"}"#).await;
        let default = call(&gw, r#"{"command":"get_setpoint"}"#).await;
        let bath2 = call(&gw, r#"{"command":"get_setpoint","chiller_id":"bath2"}"#).await;
        assert_eq!(default.result(), Some(&json!(20.0)));
        assert_eq!(bath2.result(), Some(&json!(12.5)));
    }

    #[tokio::test]
    async fn test_audit_records_mutations_only() {
        let collect = Collect::default();
        let gw = gateway(GatewayOptions {
            audit: AuditLog::new().with_sink(collect.clone()),
            ..GatewayOptions::default()
        })
        .await;

        call(&gw, r#"{"command":"status"}"#).await;
        call(&gw, r#"{"command":"set_setpoint","value":35}"#).await;
        call(&gw, r#"{"command":"start"}"#).await;
        // Failed commands are not audited.
        call(&gw, r#"{"command":"set_setpoint","value":999}"#).await;

        let records = collect.0.lock().clone();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].command, "set_setpoint");
        assert_eq!(records[0].old_value, "20");
        assert_eq!(records[0].new_value, "35.0");
        assert_eq!(records[0].client_ip, "127.0.0.1");
        assert_eq!(records[1].command, "start");
        assert_eq!(records[1].old_value, "false");
        assert_eq!(records[1].new_value, "true");
    }

    #[tokio::test]
    async fn test_offline_device_fails_fast_except_ping() {
        let gw = gateway(GatewayOptions::default()).await;
        gw.registry().resolve(None).unwrap().set_online(false);

        let response = call(&gw, r#"{"command":"status"}"#).await;
        assert_eq!(
            response.error_message(),
            Some("Serial connection lost, reconnecting...")
        );
        assert!(call(&gw, r#"{"command":"ping"}"#).await.is_ok());
    }

    #[tokio::test]
    async fn test_device_taken_down_while_request_queued() {
        let gw = gateway(GatewayOptions::default()).await;
        let device = gw.registry().resolve(None).unwrap();
        let mut guard = device.chiller().lock().await;

        let pending = tokio::spawn({
            let gw = gw.clone();
            async move { call(&gw, r#"{"command":"status"}"#).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        // What the watchdog does on a failed health check.
        device.set_online(false);
        guard.close().await.unwrap();
        drop(guard);

        let response = pending.await.unwrap();
        assert_eq!(
            response.error_message(),
            Some("Serial connection lost, reconnecting...")
        );
    }

    #[tokio::test]
    async fn test_unopened_device_reports_reconnecting() {
        let gw = Gateway::new(SimulatedChiller::default(), GatewayOptions::default());
        let response = call(&gw, r#"{"command":"temperature"}"#).await;
        assert_eq!(
            response.error_message(),
            Some("Serial connection lost, reconnecting...")
        );
    }

    #[tokio::test]
    async fn test_device_timeout_is_sanitized() {
        let chiller = sim().await;
        let fault = chiller.fault_switch();
        let metrics = Arc::new(Metrics::new().unwrap());
        let gw = Gateway::new(
            chiller,
            GatewayOptions {
                metrics: Some(metrics.clone()),
                ..GatewayOptions::default()
            },
        );

        fault.store(true, Ordering::SeqCst);
        let response = call(&gw, r#"{"command":"temperature"}"#).await;
        assert_eq!(response.error_message(), Some("Device timeout"));
        assert_eq!(metrics.error_count("timeout"), 1);
    }

    #[tokio::test]
    async fn test_metrics_recorded() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let gw = gateway(GatewayOptions {
            metrics: Some(metrics.clone()),
            ..GatewayOptions::default()
        })
        .await;

        call(&gw, r#"{"command":"ping"}"#).await;
        call(&gw, r#"{"command":"status_all"}"#).await;
        assert_eq!(metrics.command_count("ping"), 1);
        assert_eq!(metrics.command_count("status_all"), 1);
        assert!(metrics.render().contains("julabo_setpoint_celsius 20"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_commands() {
        let gw = gateway(GatewayOptions::default()).await;

        let response = call(&gw, r#"{"command":"load_schedule"}"#).await;
        assert!(response.error_message().unwrap().contains("requires a 'csv' string"));

        let response = call(
            &gw,
            r#"{"command":"load_schedule","csv":"elapsed_minutes,temperature_c\n0,20\n10,30"}"#,
        )
        .await;
        assert_eq!(
            response.result(),
            Some(&json!({"steps": 2, "duration_minutes": 10.0}))
        );

        tokio::time::sleep(std::time::Duration::from_secs(300)).await;
        let status = call(&gw, r#"{"command":"schedule_status"}"#).await;
        let status = status.result().unwrap();
        assert_eq!(status["running"], json!(true));
        assert_eq!(status["total_minutes"], json!(10.0));
        assert_eq!(status["elapsed_minutes"], json!(5.0));
        assert_eq!(status["current_target"], json!(25.0));
        assert_eq!(status["progress_pct"], json!(50.0));

        let response = call(&gw, r#"{"command":"stop_schedule"}"#).await;
        assert_eq!(response.result(), Some(&json!("stopped")));
        let status = call(&gw, r#"{"command":"schedule_status"}"#).await;
        assert_eq!(status.result(), Some(&json!({"running": false})));
    }

    #[test]
    fn test_reload_applies_runtime_settings() {
        let gw = Gateway::new(SimulatedChiller::default(), GatewayOptions::default());
        assert!(gw.check_rate("10.0.0.1").is_ok());

        gw.reload(RuntimeSettings {
            rate_limit: Some(1),
            read_only: true,
            ..RuntimeSettings::default()
        });
        assert!(gw.settings().read_only);
        assert!(gw.check_rate("10.0.0.1").is_ok());
        assert!(matches!(gw.check_rate("10.0.0.1"), Err(Error::RateLimited)));

        gw.reload(RuntimeSettings::default());
        assert!(gw.check_rate("10.0.0.1").is_ok());
    }

    #[test]
    fn test_admission_stops_at_shutdown() {
        let gw = Gateway::new(SimulatedChiller::default(), GatewayOptions::default());
        let first = gw.admit().unwrap();
        let second = gw.admit().unwrap();
        assert_eq!(gw.active_connections(), 2);
        drop(first);
        assert_eq!(gw.active_connections(), 1);

        gw.begin_shutdown();
        assert!(gw.admit().is_none());
        drop(second);
        assert_eq!(gw.active_connections(), 0);
    }

    #[test]
    fn test_empty_token_disables_auth() {
        let gw = Gateway::new(
            SimulatedChiller::default(),
            GatewayOptions {
                auth_token: Some(String::new()),
                ..GatewayOptions::default()
            },
        );
        assert!(gw.inner.auth_token.is_none());
    }
}
