//! # greeter-registry
//!
//! Authoritative in-memory state for the greeting router: connected
//! visitors and agents, pool routing rules, outstanding call requests and
//! active calls. Everything here is synchronous and free of I/O; callers
//! supply the clock.
//!
//! - [`SessionRegistry`]: the state and its operations
//! - [`model`]: entities and operation outcomes
//! - [`matching`]: wildcard URL matching for routing rules

#![deny(unsafe_code)]

mod calls;
pub mod error;
pub mod matching;
pub mod model;
mod registry;

pub use error::{RegistryError, Result};
pub use model::{
    Accepted, ActiveCall, AgentProfile, AgentRegistration, AgentSession, CallRequest,
    CallRequestState, InteractionState, Party, Pool, PoolConfig, PoolMembership, Reassignment,
    RuleConfig, Visitor,
};
pub use registry::{AgentMatch, NewVisitor, PendingDisconnect, SessionRegistry};
