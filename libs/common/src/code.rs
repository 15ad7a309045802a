//! Error taxonomy shared with clients through the control channel.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind tag carried by every hub error and by control frames on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MehCode {
    /// Malformed envelope, unknown channel, handshake timeout.
    BadInput,
    /// Resolver rejected the public token, or no token was presented.
    Unauthorized,
    /// Gate not found.
    NotFound,
    /// WebSocket I/O failure or unexpected close.
    #[serde(rename = "WSCommunication")]
    WsCommunication,
    /// Resolver failure, marshalling failure, inconsistent configuration.
    Internal,
}

impl MehCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadInput => "BadInput",
            Self::Unauthorized => "Unauthorized",
            Self::NotFound => "NotFound",
            Self::WsCommunication => "WSCommunication",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for MehCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a `_control` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlError {
    pub code: MehCode,
    pub message: String,
    pub details: Value,
}

impl ControlError {
    pub fn new(code: MehCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Value::Object(Default::default()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_to_wire_names() {
        let all = [
            MehCode::BadInput,
            MehCode::Unauthorized,
            MehCode::NotFound,
            MehCode::WsCommunication,
            MehCode::Internal,
        ];
        for code in all {
            let json = serde_json::to_value(code).unwrap();
            assert_eq!(json, Value::String(code.to_string()));
        }
        assert_eq!(MehCode::WsCommunication.as_str(), "WSCommunication");
    }

    #[test]
    fn control_error_defaults_to_empty_details() {
        let err = ControlError::new(MehCode::BadInput, "unknown channel");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "code": "BadInput", "message": "unknown channel", "details": {} })
        );
    }
}
