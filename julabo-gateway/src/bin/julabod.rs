use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{self, SignalKind};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use julabo_gateway::audit::{AuditLog, FileAudit};
use julabo_gateway::config::Config;
use julabo_gateway::device::link::DeviceLink;
use julabo_gateway::device::sim::SimulatedChiller;
use julabo_gateway::device::Chiller;
use julabo_gateway::metrics::{self, Metrics};
use julabo_gateway::serial::SerialConnector;
use julabo_gateway::server::{self, tls, Gateway, GatewayOptions};
use julabo_gateway::tracing::{self, prelude::*};
use julabo_gateway::watchdog::{Watchdog, WatchdogPolicy};

/// Open the controller on `port`. A device that fails to answer at startup
/// is still served; the watchdog keeps trying to bring it up.
async fn open_device(config: &Config, id: &str, port: &str) -> Box<dyn Chiller> {
    let mut chiller: Box<dyn Chiller> = if config.serial.simulate {
        Box::new(SimulatedChiller::default())
    } else {
        let settings = config.serial_settings(port);
        let timeout = settings.timeout;
        Box::new(DeviceLink::new(SerialConnector::new(settings), timeout))
    };

    let probe = async {
        chiller.connect().await?;
        chiller.identify().await
    };
    match probe.await {
        Ok(identity) => info!(device = %id, port, identity = %identity, "Device ready"),
        Err(e) => warn!(device = %id, port, error = %e, "Device not responding at startup"),
    }
    chiller
}

fn audit_log(config: &Config) -> anyhow::Result<AuditLog> {
    let log = AuditLog::new();
    Ok(match &config.server.audit_log {
        Some(path) => {
            let sink = FileAudit::open(path)
                .with_context(|| format!("opening audit log {}", path.display()))?;
            info!(path = %path.display(), "Audit logging enabled");
            log.with_sink(sink)
        }
        None => log,
    })
}

/// Re-read the config file and apply what can change at runtime.
fn reload(path: &Path, current: &Config, gateway: &Gateway) {
    let fresh = match Config::load_or_default(path) {
        Ok(fresh) => fresh,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Config reload failed");
            return;
        }
    };
    for key in current.immutable_changes(&fresh) {
        warn!(key, "Config reload: setting cannot be changed at runtime");
    }
    gateway.reload(fresh.server.runtime());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    let config_path: PathBuf = Config::path(std::env::args().nth(1));
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    info!(path = %config_path.display(), "Configuration loaded");

    let metrics = match config.server.metrics_addr()? {
        Some(_) => Some(Arc::new(
            Metrics::new().map_err(|e| anyhow::anyhow!("creating metrics registry: {e}"))?,
        )),
        None => None,
    };

    let mut ports = config.device_ports().into_iter();
    let (default_id, default_port) = ports
        .next()
        .context("no default device configured")?;
    let gateway = Gateway::new(
        open_device(&config, &default_id, &default_port).await,
        GatewayOptions {
            auth_token: config.server.auth_token.clone(),
            settings: config.server.runtime(),
            audit: audit_log(&config)?,
            metrics: metrics.clone(),
        },
    );
    for (id, port) in ports {
        gateway.add_device(&id, open_device(&config, &id, &port).await);
    }

    let tls = match (&config.server.tls_cert, &config.server.tls_key) {
        (Some(cert), Some(key)) => Some(tls::load_acceptor(cert, key)?),
        _ => None,
    };
    let listen = config.server.listen_addr()?;
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;

    // Connections stop on `running`; watchdogs and the metrics endpoint
    // outlive them on `background` until the last request has drained.
    let running = CancellationToken::new();
    let background = CancellationToken::new();
    let tracker = TaskTracker::new();

    if config.server.watchdog {
        for device in gateway.registry().devices() {
            let watchdog = Watchdog::new(device, WatchdogPolicy::default());
            tracker.spawn(watchdog.run(background.clone()));
        }
    }

    if let (Some(addr), Some(metrics)) = (config.server.metrics_addr()?, metrics) {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding metrics endpoint {addr}"))?;
        let background = background.clone();
        tracker.spawn(async move {
            if let Err(e) = metrics::serve(listener, metrics, background).await {
                error!(error = %e, "Metrics endpoint failed");
            }
        });
    }

    let server = tokio::spawn(server::serve(
        gateway.clone(),
        listener,
        tls,
        running.clone(),
    ));
    tracker.close();
    info!("Started.");

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    let mut sighup = unix::signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            _ = sighup.recv() => {
                info!("SIGHUP received, reloading configuration");
                reload(&config_path, &config, &gateway);
            }
        }
    }

    trace!("Shutting down.");
    gateway.begin_shutdown();
    running.cancel();

    // Connections finish their in-flight request; each is bounded by the
    // serial timeout, so this cannot hang for long.
    if tokio::time::timeout(Duration::from_secs(30), server).await.is_err() {
        warn!("Timed out waiting for connections to close");
    }
    gateway.shutdown_schedules().await;
    background.cancel();
    tracker.wait().await;

    for device in gateway.registry().devices() {
        if let Err(e) = device.chiller().lock().await.close().await {
            debug!(device = %device.id(), error = %e, "Error closing device");
        }
    }
    info!("Exiting.");
    Ok(())
}
