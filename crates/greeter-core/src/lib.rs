//! # greeter-core
//!
//! Types shared by every greeter crate:
//!
//! - [`ids`]: branded string identifiers for visitors, agents, requests, calls
//! - [`protocol`]: the WebSocket wire format (inbound events, outbound events, acks)
//! - [`errors`]: the error-code taxonomy surfaced to clients
//! - [`logging`]: `tracing` subscriber bootstrap

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod protocol;

pub use errors::ErrorCode;
pub use ids::{AgentId, CallId, ConnectionId, OrgId, PoolId, RequestId, VisitorId};
