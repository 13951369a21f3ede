//! Error types for the Casa signaling protocol

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol-level errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unsupported action: {0}")]
    UnsupportedAction(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::InvalidMessage(e.to_string())
    }
}

/// Wire error codes (sent to clients)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireErrorCode {
    /// Action is not in the supported set
    UnsupportedAction,

    /// Frame was not a valid command
    InvalidMessage,

    /// Internal relay error
    InternalError,
}

impl From<&ProtocolError> for WireErrorCode {
    fn from(e: &ProtocolError) -> Self {
        match e {
            ProtocolError::InvalidMessage(_) => WireErrorCode::InvalidMessage,
            ProtocolError::UnsupportedAction(_) => WireErrorCode::UnsupportedAction,
            ProtocolError::Serialization(_) => WireErrorCode::InternalError,
            ProtocolError::FrameTooLarge { .. } => WireErrorCode::InvalidMessage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let err = ProtocolError::UnsupportedAction("reboot_camera".into());
        assert_eq!(WireErrorCode::from(&err), WireErrorCode::UnsupportedAction);

        let err = ProtocolError::InvalidMessage("not json".into());
        assert_eq!(WireErrorCode::from(&err), WireErrorCode::InvalidMessage);
    }
}
