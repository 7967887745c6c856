//! Client wire format: newline-delimited JSON objects.
//!
//! ```text
//! -> {"command": "set_setpoint", "value": 25.0, "chiller_id": "bath2", "token": "..."}
//! <- {"status": "ok", "result": 25.0, "protocol_version": 2}
//! <- {"status": "error", "error": "Device timeout", "protocol_version": 2}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Bumped on incompatible changes to the envelope or command set.
pub const PROTOCOL_VERSION: u32 = 2;

/// Longest accepted request line, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Request {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub chiller_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Schedule text for `load_schedule`
    #[serde(default)]
    pub csv: Option<String>,
}

impl Request {
    pub fn new(command: &str) -> Self {
        Self {
            command: Some(command.to_string()),
            ..Self::default()
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_chiller(mut self, id: &str) -> Self {
        self.chiller_id = Some(id.to_string());
        self
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| Error::Validation(format!("Malformed JSON: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response {
    Ok { result: Value, protocol_version: u32 },
    Error { error: String, protocol_version: u32 },
}

impl Response {
    pub fn ok(result: Value) -> Self {
        Response::Ok {
            result,
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Sanitized error reply.
    pub fn error(error: &Error) -> Self {
        Response::Error {
            error: error.client_message(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok { .. })
    }

    /// The result, if successful.
    pub fn result(&self) -> Option<&Value> {
        match self {
            Response::Ok { result, .. } => Some(result),
            Response::Error { .. } => None,
        }
    }

    /// The error message, if failed.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Response::Ok { .. } => None,
            Response::Error { error, .. } => Some(error),
        }
    }

    /// Serialized form without the trailing newline.
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"status":"error","error":"Internal server error","protocol_version":{PROTOCOL_VERSION}}}"#
            )
        })
    }
}
