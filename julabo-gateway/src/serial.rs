//! RS-232 transport for the controller.
//!
//! Julabo controllers speak 4800 baud, 7 data bits, even parity, one stop
//! bit, with RTS/CTS hardware handshake. [`SerialConnector`] opens a port
//! with those settings for [`DeviceLink`](crate::device::link::DeviceLink).

use async_trait::async_trait;
use std::time::Duration;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::device::link::Connector;
use crate::error::Result;
use crate::tracing::prelude::*;

pub const DEFAULT_BAUDRATE: u32 = 4800;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Serial line parameters. Fixed once a link is built.
#[derive(Debug, Clone, PartialEq)]
pub struct SerialSettings {
    pub port: String,
    pub baudrate: u32,
    /// Bound on waiting for a reply line.
    pub timeout: Duration,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
}

impl SerialSettings {
    /// Julabo defaults for the given device path.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baudrate: DEFAULT_BAUDRATE,
            timeout: DEFAULT_TIMEOUT,
            data_bits: DataBits::Seven,
            parity: Parity::Even,
            stop_bits: StopBits::One,
            flow_control: FlowControl::Hardware,
        }
    }

    pub fn with_baudrate(mut self, baudrate: u32) -> Self {
        self.baudrate = baudrate;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Opens the configured serial device.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    settings: SerialSettings,
}

impl SerialConnector {
    pub fn new(settings: SerialSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    type Stream = SerialStream;

    async fn open(&self) -> Result<SerialStream> {
        let s = &self.settings;
        debug!(
            port = %s.port,
            baudrate = s.baudrate,
            "Opening serial port"
        );
        let stream = tokio_serial::new(&s.port, s.baudrate)
            .data_bits(s.data_bits)
            .parity(s.parity)
            .stop_bits(s.stop_bits)
            .flow_control(s.flow_control)
            .timeout(s.timeout)
            .open_native_async()?;
        Ok(stream)
    }

    fn describe(&self) -> String {
        self.settings.port.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_julabo_defaults() {
        let settings = SerialSettings::new("/dev/ttyUSB0");
        assert_eq!(settings.baudrate, 4800);
        assert_eq!(settings.data_bits, DataBits::Seven);
        assert_eq!(settings.parity, Parity::Even);
        assert_eq!(settings.stop_bits, StopBits::One);
        assert_eq!(settings.flow_control, FlowControl::Hardware);
        assert_eq!(settings.timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_builder_overrides() {
        let settings = SerialSettings::new("/dev/ttyUSB1")
            .with_baudrate(9600)
            .with_timeout(Duration::from_millis(500));
        assert_eq!(settings.baudrate, 9600);
        assert_eq!(settings.timeout, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let connector = SerialConnector::new(SerialSettings::new("/dev/julabo-does-not-exist"));
        assert!(connector.open().await.is_err());
        assert_eq!(connector.describe(), "/dev/julabo-does-not-exist");
    }
}
