//! Registry error type.

use greeter_core::{AgentId, CallId, ErrorCode, PoolId, RequestId, VisitorId};

/// Structural failures detected synchronously by the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No visitor with this id is registered.
    #[error("visitor not found: {0}")]
    VisitorNotFound(VisitorId),
    /// No agent session with this id exists.
    #[error("agent not found: {0}")]
    AgentNotFound(AgentId),
    /// No live request with this id exists.
    #[error("call request not found: {0}")]
    RequestNotFound(RequestId),
    /// No active call with this id exists.
    #[error("call not found: {0}")]
    CallNotFound(CallId),
    /// The agent already shows its simulation to as many visitors as it can.
    #[error("agent {agent_id} is at capacity ({max} simulations)")]
    AgentAtCapacity {
        /// Agent.
        agent_id: AgentId,
        /// Its limit.
        max: usize,
    },
    /// The request is not in a state that allows this transition.
    #[error("request {request_id}: cannot {action} while {state}")]
    InvalidTransition {
        /// Request.
        request_id: RequestId,
        /// Attempted transition.
        action: &'static str,
        /// Current state.
        state: &'static str,
    },
    /// Visitor or agent is already on another call.
    #[error("{0} already has an active call")]
    AlreadyInCall(String),
    /// A routing rule pattern failed to compile.
    #[error("pool {pool_id}: invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        /// Pool that owns the rule.
        pool_id: PoolId,
        /// Offending pattern.
        pattern: String,
        /// Compiler error.
        #[source]
        source: globset::Error,
    },
}

impl RegistryError {
    /// Wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::VisitorNotFound(_) => ErrorCode::VisitorNotFound,
            Self::AgentNotFound(_) => ErrorCode::AgentNotFound,
            Self::RequestNotFound(_) | Self::CallNotFound(_) | Self::InvalidTransition { .. } => {
                ErrorCode::CallNotFound
            }
            Self::AgentAtCapacity { .. } | Self::AlreadyInCall(_) => ErrorCode::AgentUnavailable,
            Self::InvalidPattern { .. } => ErrorCode::InternalError,
        }
    }
}

/// Result alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_taxonomy() {
        assert_eq!(
            RegistryError::VisitorNotFound(VisitorId::from_raw("v")).code(),
            ErrorCode::VisitorNotFound
        );
        assert_eq!(
            RegistryError::InvalidTransition {
                request_id: RequestId::from_raw("r"),
                action: "accept",
                state: "cancelled",
            }
            .code(),
            ErrorCode::CallNotFound
        );
        assert_eq!(
            RegistryError::AgentAtCapacity {
                agent_id: AgentId::from_raw("a"),
                max: 1
            }
            .code(),
            ErrorCode::AgentUnavailable
        );
    }

    #[test]
    fn transition_message_is_readable() {
        let err = RegistryError::InvalidTransition {
            request_id: RequestId::from_raw("req_1"),
            action: "accept",
            state: "missed",
        };
        assert_eq!(err.to_string(), "request req_1: cannot accept while missed");
    }
}
