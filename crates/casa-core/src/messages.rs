//! Signaling wire envelope
//!
//! JSON frames exchanged over the persistent signaling socket. Clients send
//! `{ action, data? }`; the relay broadcasts `{ action, data, timestamp,
//! connection_id }` to every live socket.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, WireErrorCode};
use crate::ids::unix_millis;

/// Commands recognized by the signaling relay
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamAction {
    /// Begin a camera live stream
    StartLiveStream,

    /// End a camera live stream
    StopLiveStream,

    /// Begin a doorbell stream
    StartDoorbellStream,

    /// End a doorbell stream
    StopDoorbellStream,

    /// Keepalive probe
    Ping,
}

impl StreamAction {
    /// Parse an action name, rejecting anything outside the supported set
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start_live_stream" => Some(Self::StartLiveStream),
            "stop_live_stream" => Some(Self::StopLiveStream),
            "start_doorbell_stream" => Some(Self::StartDoorbellStream),
            "stop_doorbell_stream" => Some(Self::StopDoorbellStream),
            "ping" => Some(Self::Ping),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartLiveStream => "start_live_stream",
            Self::StopLiveStream => "stop_live_stream",
            Self::StartDoorbellStream => "start_doorbell_stream",
            Self::StopDoorbellStream => "stop_doorbell_stream",
            Self::Ping => "ping",
        }
    }
}

/// Client -> relay frame. The action stays a plain string until the relay
/// validates it against [`StreamAction`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboundCommand {
    pub action: String,

    #[serde(default)]
    pub data: Value,
}

impl InboundCommand {
    pub fn new(action: StreamAction, data: Value) -> Self {
        Self {
            action: action.as_str().to_string(),
            data,
        }
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Relay -> client broadcast envelope
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamCommand {
    pub action: StreamAction,

    pub data: Value,

    /// Milliseconds since the Unix epoch, stamped at send time
    pub timestamp: u64,

    /// Connection the command originated from
    #[serde(rename = "connectionId")]
    pub connection_id: String,
}

impl StreamCommand {
    /// Construct an envelope stamped with the current time
    pub fn new(action: StreamAction, data: Value, connection_id: impl Into<String>) -> Self {
        Self {
            action,
            data,
            timestamp: unix_millis(),
            connection_id: connection_id.into(),
        }
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Client-visible rejection of an inbound frame. Never broadcast.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: WireErrorCode,
    pub message: String,
}

impl ErrorReply {
    pub fn new(code: WireErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: code,
            message: message.into(),
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}
