//! Simulated temperature controller.
//!
//! The bath follows a first-order thermal model: while circulating, the
//! process temperature approaches the setpoint, otherwise it relaxes to
//! ambient, both as `T += (target - T) * (1 - exp(-k * dt))`. There is no
//! noise, so the model is deterministic for a given sequence of clock
//! readings (tokio's clock, which tests can pause).
//!
//! Two ways in:
//!
//! - [`SimulatedChiller`] implements [`Chiller`] directly.
//! - [`SimulatedConnector`] serves the ASCII protocol over an in-memory
//!   stream, so the real [`DeviceLink`](super::link::DeviceLink) can drive it.

use async_trait::async_trait;
use futures::SinkExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

use super::codec::AsciiCodec;
use super::link::Connector;
use super::{validate_setpoint, Chiller, SETPOINT_MAX, SETPOINT_MIN};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Temperature the bath drifts to when not circulating, in °C.
pub const AMBIENT: f64 = 22.0;

/// Approach rate constant, per second.
pub const DRIFT_RATE: f64 = 0.1;

/// State of the simulated bath.
#[derive(Debug, Clone)]
pub struct ThermalModel {
    pub setpoint: f64,
    pub temperature: f64,
    pub running: bool,
    pub identity: String,
    pub drift_rate: f64,
    last_update: Instant,
}

impl Default for ThermalModel {
    fn default() -> Self {
        Self::new(20.0)
    }
}

impl ThermalModel {
    pub fn new(initial_temperature: f64) -> Self {
        Self {
            setpoint: 20.0,
            temperature: initial_temperature,
            running: false,
            identity: "JULABO FL1703 Simulator".to_string(),
            drift_rate: DRIFT_RATE,
            last_update: Instant::now(),
        }
    }

    /// Advance the model to the current instant.
    pub fn update(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_update).as_secs_f64();
        self.last_update = now;

        let target = if self.running { self.setpoint } else { AMBIENT };
        let approach = 1.0 - (-self.drift_rate * dt).exp();
        self.temperature += (target - self.temperature) * approach;
    }

    pub fn status(&self) -> String {
        if self.running {
            "03 REMOTE START".to_string()
        } else {
            "02 REMOTE STOP".to_string()
        }
    }

    /// Answer one protocol line. `None` means the command has no reply.
    pub fn respond(&mut self, line: &str) -> Option<String> {
        let mut parts = line.trim().splitn(2, char::is_whitespace);
        let command = parts.next().unwrap_or("").to_ascii_lowercase();
        let arg = parts.next().unwrap_or("").trim();

        match command.as_str() {
            "" => Some("ERROR: empty command".to_string()),
            "version" => Some(self.identity.clone()),
            "status" => Some(self.status()),
            "in_sp_00" => Some(format!("{:.2}", self.setpoint)),
            "in_pv_00" => {
                self.update();
                Some(format!("{:.2}", self.temperature))
            }
            "in_mode_05" => Some(if self.running { "1" } else { "0" }.to_string()),
            "out_sp_00" => match arg.parse::<f64>() {
                Ok(v) if (SETPOINT_MIN..=SETPOINT_MAX).contains(&v) => {
                    self.update();
                    self.setpoint = v;
                    None
                }
                Ok(_) => Some("ERROR: setpoint out of range".to_string()),
                Err(_) => Some("ERROR: invalid setpoint value".to_string()),
            },
            "out_mode_05" => {
                self.update();
                self.running = arg == "1";
                None
            }
            other => Some(format!("ERROR: unknown command '{other}'")),
        }
    }
}

/// Serve the ASCII protocol on `stream` until it closes.
pub async fn serve<S>(stream: S, model: Arc<Mutex<ThermalModel>>) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, AsciiCodec);
    while let Some(line) = framed.next().await {
        let line = line?;
        let reply = model.lock().respond(&line);
        if let Some(reply) = reply {
            framed.send(reply.as_str()).await?;
        }
    }
    Ok(())
}

/// Connector that spawns an in-process ASCII simulator per connection.
///
/// All connections share one [`ThermalModel`], so reconnecting keeps the
/// bath's state.
#[derive(Clone, Default)]
pub struct SimulatedConnector {
    model: Arc<Mutex<ThermalModel>>,
}

impl SimulatedConnector {
    pub fn new(model: ThermalModel) -> Self {
        Self {
            model: Arc::new(Mutex::new(model)),
        }
    }

    pub fn model(&self) -> Arc<Mutex<ThermalModel>> {
        self.model.clone()
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    type Stream = DuplexStream;

    async fn open(&self) -> Result<DuplexStream> {
        let (near, far) = tokio::io::duplex(1024);
        let model = self.model.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(far, model).await {
                debug!(error = %e, "Simulator stream ended");
            }
        });
        Ok(near)
    }

    fn describe(&self) -> String {
        "simulator".to_string()
    }
}

/// In-process [`Chiller`] backed by a [`ThermalModel`].
///
/// The fault switch makes every operation time out, standing in for an
/// unplugged cable.
#[derive(Default)]
pub struct SimulatedChiller {
    model: ThermalModel,
    connected: bool,
    offline: Arc<AtomicBool>,
}

impl SimulatedChiller {
    pub fn new(model: ThermalModel) -> Self {
        Self {
            model,
            connected: false,
            offline: Arc::default(),
        }
    }

    /// Shared flag; set it to make the device unreachable.
    pub fn fault_switch(&self) -> Arc<AtomicBool> {
        self.offline.clone()
    }

    pub fn model(&self) -> &ThermalModel {
        &self.model
    }

    fn reachable(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Timeout);
        }
        if !self.connected {
            return Err(Error::NotConnected);
        }
        Ok(())
    }
}

#[async_trait]
impl Chiller for SimulatedChiller {
    async fn connect(&mut self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "simulated device unplugged",
            )));
        }
        self.connected = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn identify(&mut self) -> Result<String> {
        self.reachable()?;
        Ok(self.model.identity.clone())
    }

    async fn status(&mut self) -> Result<String> {
        self.reachable()?;
        Ok(self.model.status())
    }

    async fn temperature(&mut self) -> Result<f64> {
        self.reachable()?;
        self.model.update();
        Ok(self.model.temperature)
    }

    async fn setpoint(&mut self) -> Result<f64> {
        self.reachable()?;
        Ok(self.model.setpoint)
    }

    async fn is_running(&mut self) -> Result<bool> {
        self.reachable()?;
        Ok(self.model.running)
    }

    async fn set_setpoint(&mut self, value: f64) -> Result<()> {
        validate_setpoint(value)?;
        self.reachable()?;
        self.model.update();
        self.model.setpoint = value;
        Ok(())
    }

    async fn set_running(&mut self, start: bool) -> Result<bool> {
        self.reachable()?;
        self.model.update();
        self.model.running = start;
        Ok(start)
    }

    async fn raw_command(&mut self, command: &str) -> Result<String> {
        self.reachable()?;
        match self.model.respond(command) {
            Some(reply) if reply.starts_with("ERROR") => Err(Error::Protocol(reply)),
            Some(reply) => Ok(reply),
            None => Ok(String::new()),
        }
    }
}
