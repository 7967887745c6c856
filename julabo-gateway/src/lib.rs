//! Network gateway for serial-attached Julabo temperature controllers.
//!
//! The `julabod` daemon owns one or more controllers (real serial links or
//! simulated baths) and serves them to clients over newline-delimited JSON
//! on TCP, optionally behind TLS. A watchdog per device recovers lost serial
//! links, and setpoint schedules run in the background.

pub mod audit;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod rate_limit;
pub mod schedule;
pub mod serial;
pub mod server;
pub mod tracing;
pub mod watchdog;

pub use error::{Error, Result};
