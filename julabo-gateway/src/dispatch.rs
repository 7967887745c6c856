//! Command table mapping wire command names onto [`Chiller`] operations.
//!
//! The gateway parses a request into a [`Command`] first, then executes it.
//! Parsing validates names and parameters, so a rejected request never
//! reaches the device.

use serde_json::{json, Value};
use strum::{EnumString, IntoStaticStr};

use crate::device::Chiller;
use crate::error::{Error, Result};

/// Names of every command that changes device state.
pub const MUTATING_COMMANDS: [&str; 4] = ["set_setpoint", "start", "stop", "set_running"];

/// Device commands known to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum CommandName {
    Identify,
    Status,
    GetSetpoint,
    SetSetpoint,
    Temperature,
    IsRunning,
    Start,
    Stop,
    SetRunning,
    StatusAll,
    Ping,
}

/// A validated device command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Identify,
    Status,
    GetSetpoint,
    SetSetpoint(f64),
    Temperature,
    IsRunning,
    Start,
    Stop,
    SetRunning(bool),
    /// Status, temperature, setpoint and run state in one object.
    StatusAll,
    /// Liveness check; never touches the device.
    Ping,
}

impl Command {
    /// Build a command from its wire name and optional `value` parameter.
    pub fn parse(name: &str, value: Option<&Value>) -> Result<Self> {
        let name: CommandName = name
            .parse()
            .map_err(|_| Error::UnknownCommand(name.to_string()))?;

        Ok(match name {
            CommandName::Identify => Command::Identify,
            CommandName::Status => Command::Status,
            CommandName::GetSetpoint => Command::GetSetpoint,
            CommandName::SetSetpoint => {
                let value = value.filter(|v| !v.is_null()).ok_or_else(|| {
                    Error::Validation("'set_setpoint' requires a numeric 'value'".into())
                })?;
                Command::SetSetpoint(parse_number(value)?)
            }
            CommandName::Temperature => Command::Temperature,
            CommandName::IsRunning => Command::IsRunning,
            CommandName::Start => Command::Start,
            CommandName::Stop => Command::Stop,
            CommandName::SetRunning => {
                let value = value.filter(|v| !v.is_null()).ok_or_else(|| {
                    Error::Validation("'set_running' requires a boolean 'value'".into())
                })?;
                Command::SetRunning(parse_bool(value)?)
            }
            CommandName::StatusAll => Command::StatusAll,
            CommandName::Ping => Command::Ping,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Identify => "identify",
            Command::Status => "status",
            Command::GetSetpoint => "get_setpoint",
            Command::SetSetpoint(_) => "set_setpoint",
            Command::Temperature => "temperature",
            Command::IsRunning => "is_running",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::SetRunning(_) => "set_running",
            Command::StatusAll => "status_all",
            Command::Ping => "ping",
        }
    }

    pub fn is_mutating(&self) -> bool {
        MUTATING_COMMANDS.contains(&self.name())
    }

    /// Run the command against a device.
    pub async fn execute(&self, chiller: &mut dyn Chiller) -> Result<Value> {
        Ok(match *self {
            Command::Identify => json!(chiller.identify().await?),
            Command::Status => json!(chiller.status().await?),
            Command::GetSetpoint => json!(chiller.setpoint().await?),
            Command::SetSetpoint(value) => {
                chiller.set_setpoint(value).await?;
                json!(chiller.setpoint().await?)
            }
            Command::Temperature => json!(chiller.temperature().await?),
            Command::IsRunning => json!(chiller.is_running().await?),
            Command::Start => json!(chiller.start().await?),
            Command::Stop => json!(chiller.stop().await?),
            Command::SetRunning(start) => json!(chiller.set_running(start).await?),
            Command::StatusAll => json!({
                "status": chiller.status().await?,
                "temperature": chiller.temperature().await?,
                "setpoint": chiller.setpoint().await?,
                "is_running": chiller.is_running().await?,
            }),
            Command::Ping => json!("pong"),
        })
    }
}

/// Whether a wire command name mutates device state.
pub fn is_mutating(name: &str) -> bool {
    MUTATING_COMMANDS.contains(&name)
}

fn parse_number(value: &Value) -> Result<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|v| v.is_finite())
        .ok_or_else(|| Error::Validation(format!("'value' must be a number, got {value}")))
}

/// Interpret the flexible boolean forms accepted by `set_running`.
pub fn parse_bool(value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => return Ok(*b),
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                return Ok(f != 0.0);
            }
        }
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" | "start" | "run" => return Ok(true),
            "0" | "false" | "off" | "stop" | "halt" => return Ok(false),
            _ => {}
        },
        _ => {}
    }
    Err(Error::Validation(
        "Unable to interpret 'value' for set_running. Use a boolean, number, or supported string."
            .into(),
    ))
}
