//! Error codes surfaced to clients in `ERROR` events and failed acks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable error code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No agent can take the visitor or the call.
    AgentUnavailable,
    /// The connection has no registered visitor.
    VisitorNotFound,
    /// The referenced agent is not connected.
    AgentNotFound,
    /// The referenced request or call does not exist (or is not yours).
    CallNotFound,
    /// Agent token verification failed.
    AuthInvalidToken,
    /// Unexpected server-side failure.
    InternalError,
    /// The frame could not be parsed.
    InvalidMessage,
}

impl ErrorCode {
    /// Wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentUnavailable => "AGENT_UNAVAILABLE",
            Self::VisitorNotFound => "VISITOR_NOT_FOUND",
            Self::AgentNotFound => "AGENT_NOT_FOUND",
            Self::CallNotFound => "CALL_NOT_FOUND",
            Self::AuthInvalidToken => "AUTH_INVALID_TOKEN",
            Self::InternalError => "INTERNAL_ERROR",
            Self::InvalidMessage => "INVALID_MESSAGE",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_matches_as_str() {
        for code in [
            ErrorCode::AgentUnavailable,
            ErrorCode::VisitorNotFound,
            ErrorCode::AgentNotFound,
            ErrorCode::CallNotFound,
            ErrorCode::AuthInvalidToken,
            ErrorCode::InternalError,
            ErrorCode::InvalidMessage,
        ] {
            let json = serde_json::to_value(code).unwrap();
            assert_eq!(json, code.as_str());
        }
    }

    #[test]
    fn display_uses_wire_form() {
        assert_eq!(ErrorCode::CallNotFound.to_string(), "CALL_NOT_FOUND");
    }
}
