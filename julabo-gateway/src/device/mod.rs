//! Temperature controller abstraction.
//!
//! [`Chiller`] is the operation set every device backend offers: the real
//! serial driver ([`link::DeviceLink`]) and the simulated bath
//! ([`sim::SimulatedChiller`]). The gateway only ever holds
//! `Box<dyn Chiller>`, so backends are chosen at construction time.
//!
//! Methods take `&mut self`. Exclusive access is what keeps exactly one
//! command in flight per device; callers share a device through
//! [`DeviceHandle`], a mutex around the boxed backend.

pub mod codec;
pub mod link;
pub mod sim;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Lowest setpoint accepted by the controller, in °C.
pub const SETPOINT_MIN: f64 = -50.0;

/// Highest setpoint accepted by the controller, in °C.
pub const SETPOINT_MAX: f64 = 200.0;

/// Read-back tolerance for verified writes, in °C.
pub const SETPOINT_TOLERANCE: f64 = 0.05;

/// Shared, lockable device.
pub type DeviceHandle = Arc<Mutex<Box<dyn Chiller>>>;

/// Wrap a backend for sharing between workers.
pub fn handle(chiller: impl Chiller + 'static) -> DeviceHandle {
    Arc::new(Mutex::new(Box::new(chiller)))
}

/// Operations supported by a Julabo-style temperature controller.
#[async_trait]
pub trait Chiller: Send {
    /// Open the transport. No-op when already open.
    async fn connect(&mut self) -> Result<()>;

    /// Release the transport. No-op when already closed.
    async fn close(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Controller identification string.
    async fn identify(&mut self) -> Result<String>;

    /// Raw status line, e.g. `"01 MANUAL START"`.
    async fn status(&mut self) -> Result<String>;

    /// Measured process temperature in °C.
    async fn temperature(&mut self) -> Result<f64>;

    /// Active setpoint in °C.
    async fn setpoint(&mut self) -> Result<f64>;

    async fn is_running(&mut self) -> Result<bool>;

    /// Change the setpoint and confirm the device took it.
    async fn set_setpoint(&mut self, value: f64) -> Result<()>;

    /// Start or stop circulation; returns the confirmed state.
    async fn set_running(&mut self, start: bool) -> Result<bool>;

    async fn start(&mut self) -> Result<bool> {
        self.set_running(true).await
    }

    async fn stop(&mut self) -> Result<bool> {
        self.set_running(false).await
    }

    /// Send an unmapped command and return the reply line.
    async fn raw_command(&mut self, command: &str) -> Result<String>;
}

/// Lets a backend chosen at runtime go wherever a concrete one can.
#[async_trait]
impl<C: Chiller + ?Sized> Chiller for Box<C> {
    async fn connect(&mut self) -> Result<()> {
        (**self).connect().await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    async fn identify(&mut self) -> Result<String> {
        (**self).identify().await
    }

    async fn status(&mut self) -> Result<String> {
        (**self).status().await
    }

    async fn temperature(&mut self) -> Result<f64> {
        (**self).temperature().await
    }

    async fn setpoint(&mut self) -> Result<f64> {
        (**self).setpoint().await
    }

    async fn is_running(&mut self) -> Result<bool> {
        (**self).is_running().await
    }

    async fn set_setpoint(&mut self, value: f64) -> Result<()> {
        (**self).set_setpoint(value).await
    }

    async fn set_running(&mut self, start: bool) -> Result<bool> {
        (**self).set_running(start).await
    }

    async fn start(&mut self) -> Result<bool> {
        (**self).start().await
    }

    async fn stop(&mut self) -> Result<bool> {
        (**self).stop().await
    }

    async fn raw_command(&mut self, command: &str) -> Result<String> {
        (**self).raw_command(command).await
    }
}

/// Reject setpoints outside the controller's range.
pub fn validate_setpoint(value: f64) -> Result<()> {
    if !value.is_finite() || !(SETPOINT_MIN..=SETPOINT_MAX).contains(&value) {
        return Err(Error::Validation(format!(
            "Setpoint {value} °C is outside the allowed range [{SETPOINT_MIN}, {SETPOINT_MAX}]"
        )));
    }
    Ok(())
}
