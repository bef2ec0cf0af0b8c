//! Wire protocol for the control plane.

use std::time::Duration;

use node_core::ConfigError;
use node_session::ProcessState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Log stream closed: malformed query.
pub const CLOSE_BAD_QUERY: u16 = 4400;
/// Log stream closed: session unknown or invalidated.
pub const CLOSE_INVALID_SESSION: u16 = 4403;
/// Log stream closed: the core instance ended or was replaced.
pub const CLOSE_INSTANCE_ENDED: u16 = 4410;
/// Log stream closed: transport failure on our side.
pub const CLOSE_INTERNAL: u16 = 1011;

/// Delivery interval used when the query omits one.
pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_millis(100);
/// Longest accepted delivery interval, in seconds.
pub const MAX_LOG_INTERVAL_SECS: f64 = 10.0;

/// Body of every session-scoped request without further payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub session_id: Uuid,
}

/// A config as sent by the control plane: either a JSON object or the same
/// object encoded as a JSON string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigPayload {
    Encoded(String),
    Document(Value),
}

impl ConfigPayload {
    /// Decode into a JSON value; shape is checked by the transformer.
    ///
    /// # Errors
    /// Returns error if an encoded payload is not valid JSON.
    pub fn into_value(self) -> Result<Value, ConfigError> {
        match self {
            Self::Encoded(text) => Ok(serde_json::from_str(&text)?),
            Self::Document(value) => Ok(value),
        }
    }
}

/// Body of `/start` and `/restart`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub session_id: Uuid,
    pub config: ConfigPayload,
}

/// Status answer shared by most endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    /// A control-plane session is open.
    pub connected: bool,
    /// The core is running.
    pub started: bool,
    pub core_version: Option<String>,
    /// Only set in the answer to `/connect`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    /// Detailed core state.
    pub state: ProcessState,
}

/// Raw query of the log stream. Fields stay strings so that a bad value
/// closes the socket with [`CLOSE_BAD_QUERY`] instead of failing the upgrade.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogsQuery {
    pub session_id: Option<String>,
    pub interval: Option<String>,
}

impl LogsQuery {
    /// Validate into a session id and delivery interval.
    ///
    /// # Errors
    /// Returns a human-readable reason when a field is missing or invalid.
    pub fn parse(&self) -> Result<(Uuid, Duration), String> {
        let session_id = self
            .session_id
            .as_deref()
            .ok_or_else(|| "session_id is required".to_string())?;
        let session_id = Uuid::parse_str(session_id)
            .map_err(|_| "session_id should be a valid UUID".to_string())?;

        let interval = match self.interval.as_deref() {
            None => DEFAULT_LOG_INTERVAL,
            Some(raw) => {
                let secs: f64 = raw
                    .parse()
                    .map_err(|_| "interval must be a number".to_string())?;
                if !(0.0..=MAX_LOG_INTERVAL_SECS).contains(&secs) {
                    return Err(format!(
                        "interval must be between 0 and {MAX_LOG_INTERVAL_SECS} seconds"
                    ));
                }
                Duration::from_secs_f64(secs)
            }
        };

        Ok((session_id, interval))
    }
}
