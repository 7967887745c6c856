//! Configuration management for julabod.
//!
//! Configuration is a single TOML file (default [`DEFAULT_CONFIG_PATH`]).
//! Every field has a default, so an empty or missing file yields a working
//! loopback gateway on `/dev/ttyUSB0`. `JULABO_AUTH_TOKEN` overrides the
//! file's `auth_token`.
//!
//! Only [`RuntimeSettings`] can change while the daemon runs (SIGHUP).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::serial::{SerialSettings, DEFAULT_BAUDRATE};
use crate::server::registry::DEFAULT_DEVICE_ID;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/julabo/julabod.toml";

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "JULABO_CONFIG";

/// Environment variable that overrides `server.auth_token`.
pub const AUTH_TOKEN_ENV: &str = "JULABO_AUTH_TOKEN";

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub serial: SerialConfig,
    pub server: ServerConfig,
    /// Devices beyond `"default"`.
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SerialConfig {
    /// Device path of the default controller
    pub port: String,
    pub baudrate: u32,
    pub timeout_ms: u64,
    /// Use simulated controllers instead of serial ports
    pub simulate: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baudrate: DEFAULT_BAUDRATE,
            timeout_ms: 2000,
            simulate: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: String,
    pub auth_token: Option<String>,
    /// Requests per client IP per minute; 0 disables
    pub rate_limit: usize,
    pub read_only: bool,
    /// Seconds of silence before a client is dropped; 0 disables
    pub idle_timeout_secs: u64,
    pub watchdog: bool,
    pub log_traffic: bool,
    pub audit_log: Option<PathBuf>,
    pub metrics_listen: Option<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8765".to_string(),
            auth_token: None,
            rate_limit: 0,
            read_only: false,
            idle_timeout_secs: 0,
            watchdog: true,
            log_traffic: false,
            audit_log: None,
            metrics_listen: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub id: String,
    pub port: String,
}

/// Settings that may change at runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    /// Requests per client per window; `None` disables limiting.
    pub rate_limit: Option<usize>,
    pub read_only: bool,
    pub idle_timeout: Option<Duration>,
    pub log_traffic: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        ServerConfig::default().runtime()
    }
}

impl ServerConfig {
    pub fn runtime(&self) -> RuntimeSettings {
        RuntimeSettings {
            rate_limit: (self.rate_limit > 0).then_some(self.rate_limit),
            read_only: self.read_only,
            idle_timeout: (self.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.idle_timeout_secs)),
            log_traffic: self.log_traffic,
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .map_err(|e| Error::Config(format!("invalid listen address '{}': {e}", self.listen)))
    }

    pub fn metrics_addr(&self) -> Result<Option<SocketAddr>> {
        self.metrics_listen
            .as_deref()
            .map(|addr| {
                addr.parse()
                    .map_err(|e| Error::Config(format!("invalid metrics address '{addr}': {e}")))
            })
            .transpose()
    }
}

impl Config {
    /// Config file path: explicit argument, then `JULABO_CONFIG`, then the
    /// default location.
    pub fn path(arg: Option<String>) -> PathBuf {
        arg.or_else(|| env::var(CONFIG_ENV).ok())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Parse and validate TOML text. No environment overrides.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path`, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let mut config = Self::from_toml(&text)?;
        config.apply_env();
        Ok(config)
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let mut config = Self::default();
            config.apply_env();
            Ok(config)
        }
    }

    fn apply_env(&mut self) {
        if let Ok(token) = env::var(AUTH_TOKEN_ENV) {
            if !token.is_empty() {
                self.server.auth_token = Some(token);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.server.listen_addr()?;
        self.server.metrics_addr()?;

        if self.serial.timeout_ms == 0 {
            return Err(Error::Config("serial.timeout_ms must be positive".into()));
        }
        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            return Err(Error::Config(
                "tls_cert and tls_key must be configured together".into(),
            ));
        }

        let mut seen = HashSet::from([DEFAULT_DEVICE_ID]);
        for device in &self.devices {
            if device.id.is_empty() {
                return Err(Error::Config("device id must not be empty".into()));
            }
            if !seen.insert(device.id.as_str()) {
                return Err(Error::Config(format!("duplicate device id '{}'", device.id)));
            }
        }
        Ok(())
    }

    /// Device id and serial port of every configured controller, default first.
    pub fn device_ports(&self) -> Vec<(String, String)> {
        std::iter::once((DEFAULT_DEVICE_ID.to_string(), self.serial.port.clone()))
            .chain(self.devices.iter().map(|d| (d.id.clone(), d.port.clone())))
            .collect()
    }

    pub fn serial_settings(&self, port: &str) -> SerialSettings {
        SerialSettings::new(port)
            .with_baudrate(self.serial.baudrate)
            .with_timeout(Duration::from_millis(self.serial.timeout_ms))
    }

    /// Names of startup-only settings that differ in `other`.
    pub fn immutable_changes(&self, other: &Config) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.server.listen != other.server.listen {
            changed.push("listen");
        }
        if self.serial != other.serial {
            changed.push("serial");
        }
        if self.devices != other.devices {
            changed.push("devices");
        }
        if self.server.tls_cert != other.server.tls_cert
            || self.server.tls_key != other.server.tls_key
        {
            changed.push("tls");
        }
        if self.server.auth_token != other.server.auth_token {
            changed.push("auth_token");
        }
        if self.server.audit_log != other.server.audit_log {
            changed.push("audit_log");
        }
        if self.server.metrics_listen != other.server.metrics_listen {
            changed.push("metrics_listen");
        }
        if self.server.watchdog != other.server.watchdog {
            changed.push("watchdog");
        }
        changed
    }
}
