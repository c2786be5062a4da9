//! Router error type.

use greeter_core::ErrorCode;
use greeter_registry::RegistryError;

use crate::collaborators::CollaboratorError;

/// Why an inbound event could not be applied.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Structural failure from the registry.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// The connection has not joined as a visitor.
    #[error("connection has not joined as a visitor")]
    NotAVisitor,
    /// The connection has not logged in as an agent.
    #[error("connection has not logged in as an agent")]
    NotAnAgent,
    /// The sender has no call (or ringing request) to act on.
    #[error("no active call")]
    NoActiveCall,
    /// Agent credentials were refused.
    #[error("invalid agent token: {0}")]
    AuthInvalidToken(String),
    /// No agent can take the visitor or the call.
    #[error("{0}")]
    Unavailable(String),
    /// The event does not make sense from this sender.
    #[error("{0}")]
    InvalidMessage(String),
    /// A visitor from a blocked country. Never surfaced to the client.
    #[error("visitor refused")]
    Blocked,
    /// A collaborator failed on an awaited path.
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RouterError {
    /// Wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Registry(e) => e.code(),
            Self::NotAVisitor => ErrorCode::VisitorNotFound,
            Self::NotAnAgent => ErrorCode::AgentNotFound,
            Self::NoActiveCall => ErrorCode::CallNotFound,
            Self::AuthInvalidToken(_) => ErrorCode::AuthInvalidToken,
            Self::Unavailable(_) => ErrorCode::AgentUnavailable,
            Self::InvalidMessage(_) => ErrorCode::InvalidMessage,
            Self::Blocked | Self::Collaborator(_) | Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Whether the client should hear about this error.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::Blocked)
    }
}

/// Result alias for router operations.
pub type Result<T> = std::result::Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;
    use greeter_core::AgentId;

    #[test]
    fn registry_codes_pass_through() {
        let err: RouterError = RegistryError::AgentNotFound(AgentId::from_raw("a")).into();
        assert_eq!(err.code(), ErrorCode::AgentNotFound);
        assert_eq!(err.to_string(), "agent not found: a");
    }

    #[test]
    fn collaborator_failures_are_internal() {
        let err: RouterError = CollaboratorError::NotFound("agent a".into()).into();
        assert_eq!(err.code(), ErrorCode::InternalError);
        assert!(!err.is_silent());
    }

    #[test]
    fn sender_role_errors() {
        assert_eq!(RouterError::NotAVisitor.code(), ErrorCode::VisitorNotFound);
        assert_eq!(RouterError::NotAnAgent.code(), ErrorCode::AgentNotFound);
        assert_eq!(RouterError::NoActiveCall.code(), ErrorCode::CallNotFound);
    }

    #[test]
    fn blocked_is_silent() {
        assert!(RouterError::Blocked.is_silent());
        assert_eq!(
            RouterError::AuthInvalidToken("bad".into()).code(),
            ErrorCode::AuthInvalidToken
        );
    }
}
