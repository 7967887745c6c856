//! Common error types for julabo-gateway.
//!
//! This module provides a centralized Error enum using thiserror. Every
//! failure a client can observe maps to exactly one variant, so the gateway
//! can turn any error into a sanitized reply without inspecting strings.

use thiserror::Error;

/// Main error type for julabo-gateway operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad or missing parameters, out-of-range values
    #[error("{0}")]
    Validation(String),

    /// The device answered with its error token
    #[error("{0}")]
    Protocol(String),

    /// No response from the device within the read timeout
    #[error("No response from device (timeout)")]
    Timeout,

    /// Missing or incorrect authentication token
    #[error("Invalid or missing authentication token")]
    Permission,

    /// Client exceeded its request budget
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Mutating command sent to a read-only gateway
    #[error("Server is in read-only mode")]
    ReadOnly,

    /// Command name not in the dispatch table
    #[error("Unsupported command: {0}")]
    UnknownCommand(String),

    /// Request named a device id that is not registered
    #[error("Unknown chiller_id: {0}")]
    UnknownDevice(String),

    /// Write went out on the wire but the read-back never matched
    #[error("{0}")]
    Unacknowledged(String),

    /// Write was issued but could not be verified either way
    #[error("{0}")]
    StateUnknown(String),

    /// Device was marked down by the watchdog
    #[error("Serial connection lost, reconnecting...")]
    Reconnecting,

    /// Operation attempted before `connect()`
    #[error("Serial connection has not been opened")]
    NotConnected,

    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port errors
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Schedule CSV errors
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS setup errors
    #[error("TLS error: {0}")]
    Tls(String),
}

impl Error {
    /// Stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Protocol(_) => "protocol",
            Error::Timeout => "timeout",
            Error::Permission => "permission",
            Error::RateLimited => "rate_limited",
            Error::ReadOnly => "read_only",
            Error::UnknownCommand(_) => "unknown_command",
            Error::UnknownDevice(_) => "unknown_device",
            Error::Unacknowledged(_) => "unacknowledged",
            Error::StateUnknown(_) => "state_unknown",
            Error::Reconnecting => "reconnecting",
            Error::NotConnected => "not_connected",
            Error::Io(_) => "io",
            Error::Serial(_) => "serial",
            Error::Csv(_) => "csv",
            Error::Config(_) => "config",
            Error::Tls(_) => "tls",
        }
    }

    /// Message safe to send to a network client.
    ///
    /// Internal failures collapse to a generic message; the full error is
    /// expected to be logged by the caller. The result is always one line.
    pub fn client_message(&self) -> String {
        let message = match self {
            Error::Validation(msg) => format!("Invalid request: {msg}"),
            Error::UnknownCommand(_) | Error::UnknownDevice(_) | Error::Csv(_) => {
                format!("Invalid request: {self}")
            }
            Error::Protocol(msg) => format!("Device error: {msg}"),
            Error::Unacknowledged(msg) | Error::StateUnknown(msg) => {
                format!("Device error: {msg}")
            }
            Error::Timeout => "Device timeout".to_string(),
            Error::Permission => "Authentication failed".to_string(),
            Error::RateLimited | Error::ReadOnly | Error::Reconnecting => self.to_string(),
            Error::NotConnected
            | Error::Io(_)
            | Error::Serial(_)
            | Error::Config(_)
            | Error::Tls(_) => "Internal server error".to_string(),
        };
        message.replace(['\r', '\n'], " ")
    }
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Error::Timeout, "Device timeout" ; "timeout")]
    #[test_case(Error::Permission, "Authentication failed" ; "permission")]
    #[test_case(Error::ReadOnly, "Server is in read-only mode" ; "read only")]
    #[test_case(Error::Config("secret path".into()), "Internal server error" ; "config hidden")]
    #[test_case(Error::NotConnected, "Internal server error" ; "not connected hidden")]
    fn test_client_message(error: Error, expected: &str) {
        assert_eq!(error.client_message(), expected);
    }

    #[test]
    fn test_unknown_device_message() {
        let msg = Error::UnknownDevice("ghost".into()).client_message();
        assert!(msg.contains("Unknown chiller_id"));
        assert!(msg.contains("ghost"));
    }

    #[test]
    fn test_newlines_sanitized() {
        let error = Error::Protocol("ERROR\r\nline two".into());
        let msg = error.client_message();
        assert!(!msg.contains('\n'));
        assert!(!msg.contains('\r'));
    }

    #[test]
    fn test_io_error_hidden() {
        let error = Error::from(std::io::Error::other("/dev/ttyUSB0 vanished"));
        assert_eq!(error.client_message(), "Internal server error");
        assert_eq!(error.kind(), "io");
    }
}
