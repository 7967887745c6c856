//! Protocol driver for the controller's ASCII command set.
//!
//! # Protocol
//!
//! | Command          | Reply            | Meaning                   |
//! |------------------|------------------|---------------------------|
//! | `version`        | identity string  | identify                  |
//! | `status`         | status line      | status                    |
//! | `in_sp_00`       | `25.00`          | active setpoint           |
//! | `in_pv_00`       | `24.87`          | process temperature       |
//! | `in_mode_05`     | `1` / `0`        | circulation running       |
//! | `out_sp_00 25.0` | *(none)*         | set setpoint              |
//! | `out_mode_05 1`  | *(none)*         | start (1) / stop (0)      |
//!
//! A reply starting with `ERROR` is a protocol error. Write commands are
//! never acknowledged, so every write is followed by read-backs until the
//! device reports the requested value (see [`DeviceLink::set_setpoint`]).
//!
//! The controller's RS-232 turnaround is slow; commands are paced at least
//! [`MIN_COMMAND_INTERVAL`] apart.

use async_trait::async_trait;
use futures::SinkExt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{self, Instant};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

use super::codec::AsciiCodec;
use super::{validate_setpoint, Chiller, SETPOINT_TOLERANCE};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Minimum spacing between two commands on the wire.
pub const MIN_COMMAND_INTERVAL: Duration = Duration::from_millis(100);

/// Read-backs attempted after a write before giving up.
pub const VERIFY_ATTEMPTS: usize = 3;

/// Pause between two read-backs.
pub const VERIFY_DELAY: Duration = Duration::from_millis(100);

/// Produces the byte stream a [`DeviceLink`] talks over.
///
/// Implemented for the serial port and for in-memory simulators, so the
/// driver can be exercised without hardware.
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn open(&self) -> Result<Self::Stream>;

    /// Human-readable endpoint for logs (port path, "simulator", ...).
    fn describe(&self) -> String;
}

/// What a verified write expects to read back.
#[derive(Debug, Clone, Copy)]
enum Expected {
    Setpoint(f64),
    Running(bool),
}

impl Expected {
    fn describe(&self) -> String {
        match self {
            Expected::Setpoint(v) => format!("{v:.2} °C"),
            Expected::Running(r) => running_label(*r).to_string(),
        }
    }
}

fn running_label(running: bool) -> &'static str {
    if running {
        "running"
    } else {
        "stopped"
    }
}

/// Driver owning the live connection to one controller.
pub struct DeviceLink<C: Connector> {
    connector: C,
    timeout: Duration,
    framed: Option<Framed<C::Stream, AsciiCodec>>,
    last_command: Option<Instant>,
}

impl<C: Connector> DeviceLink<C> {
    /// Create a closed link; call [`Chiller::connect`] before use.
    pub fn new(connector: C, timeout: Duration) -> Self {
        Self {
            connector,
            timeout,
            framed: None,
            last_command: None,
        }
    }

    // Sleep off whatever remains of the minimum command interval.
    async fn pace(&mut self) {
        if let Some(last) = self.last_command {
            let ready_at = last + MIN_COMMAND_INTERVAL;
            if Instant::now() < ready_at {
                trace!("Pacing serial command");
                time::sleep_until(ready_at).await;
            }
        }
        self.last_command = Some(Instant::now());
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        self.pace().await;
        let framed = self.framed.as_mut().ok_or(Error::NotConnected)?;
        // Anything still buffered is a late reply to a command that already
        // timed out; it must not be taken as the answer to this one.
        framed.read_buffer_mut().clear();
        trace!(command, "Serial TX");
        framed.send(command).await?;
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        self.write(command).await?;
        let timeout = self.timeout;
        let framed = self.framed.as_mut().ok_or(Error::NotConnected)?;
        let reply = match time::timeout(timeout, framed.next()).await {
            Err(_) => return Err(Error::Timeout),
            Ok(None) => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "device stream closed",
                )))
            }
            Ok(Some(line)) => line?,
        };
        trace!(command, reply = %reply, "Serial RX");

        if reply.is_empty() {
            return Err(Error::Timeout);
        }
        if reply.to_ascii_lowercase().starts_with("error") {
            return Err(Error::Protocol(reply));
        }
        Ok(reply)
    }

    async fn query_f64(&mut self, command: &str) -> Result<f64> {
        let reply = self.query(command).await?;
        reply.trim().parse::<f64>().map_err(|_| {
            Error::Protocol(format!("Unparseable reply to {command}: {reply:?}"))
        })
    }

    async fn observe(&mut self, expected: Expected) -> Result<(bool, String)> {
        match expected {
            Expected::Setpoint(target) => {
                let actual = self.query_f64("in_sp_00").await?;
                Ok((
                    (actual - target).abs() <= SETPOINT_TOLERANCE,
                    format!("{actual:.2} °C"),
                ))
            }
            Expected::Running(target) => {
                let actual = self.query("in_mode_05").await? == "1";
                Ok((actual == target, running_label(actual).to_string()))
            }
        }
    }

    // Read back until the device reports `expected`.
    //
    // Timeouts count as failed attempts; any other error ends verification.
    // If no attempt produced a reading the outcome is unknown, otherwise the
    // write was not acknowledged.
    async fn verify(&mut self, expected: Expected) -> Result<()> {
        let mut last_observed = None;
        for attempt in 1..=VERIFY_ATTEMPTS {
            if attempt > 1 {
                time::sleep(VERIFY_DELAY).await;
            }
            match self.observe(expected).await {
                Ok((true, _)) => return Ok(()),
                Ok((false, observed)) => {
                    debug!(attempt, expected = %expected.describe(), observed = %observed, "Read-back mismatch");
                    last_observed = Some(observed);
                }
                Err(Error::Timeout) => {
                    debug!(attempt, "Read-back timed out");
                }
                Err(e) => return Err(e),
            }
        }

        let what = match expected {
            Expected::Setpoint(_) => "setpoint",
            Expected::Running(_) => "circulation state",
        };
        match last_observed {
            Some(observed) => Err(Error::Unacknowledged(format!(
                "Device did not acknowledge the requested {what}. Expected {} but read back {observed}.",
                expected.describe()
            ))),
            None => Err(Error::StateUnknown(format!(
                "Device state unknown: no read-back of the {what} after {VERIFY_ATTEMPTS} attempts; {} may or may not have been applied.",
                expected.describe()
            ))),
        }
    }
}

#[async_trait]
impl<C: Connector> Chiller for DeviceLink<C> {
    async fn connect(&mut self) -> Result<()> {
        if self.framed.is_none() {
            let stream = self.connector.open().await?;
            self.framed = Some(Framed::new(stream, AsciiCodec));
            self.last_command = None;
            info!(device = %self.connector.describe(), "Device link opened");
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.framed.take().is_some() {
            info!(device = %self.connector.describe(), "Device link closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.framed.is_some()
    }

    async fn identify(&mut self) -> Result<String> {
        self.query("version").await
    }

    async fn status(&mut self) -> Result<String> {
        self.query("status").await
    }

    async fn temperature(&mut self) -> Result<f64> {
        self.query_f64("in_pv_00").await
    }

    async fn setpoint(&mut self) -> Result<f64> {
        self.query_f64("in_sp_00").await
    }

    async fn is_running(&mut self) -> Result<bool> {
        Ok(self.query("in_mode_05").await? == "1")
    }

    /// Write the setpoint, then confirm it by reading it back.
    ///
    /// Fails with [`Error::Validation`] before touching the wire when the value
    /// is out of range, [`Error::Unacknowledged`] when read-backs disagree, and
    /// [`Error::StateUnknown`] when every read-back timed out.
    async fn set_setpoint(&mut self, value: f64) -> Result<()> {
        validate_setpoint(value)?;
        self.write(&format!("out_sp_00 {value:.1}")).await?;
        self.verify(Expected::Setpoint(value)).await
    }

    async fn set_running(&mut self, start: bool) -> Result<bool> {
        self.write(&format!("out_mode_05 {}", u8::from(start))).await?;
        self.verify(Expected::Running(start)).await?;
        Ok(start)
    }

    async fn raw_command(&mut self, command: &str) -> Result<String> {
        self.query(command).await
    }
}
