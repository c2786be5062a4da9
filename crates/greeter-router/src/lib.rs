//! # greeter-router
//!
//! Event router and timer subsystem for the greeter session engine.
//!
//! - [`EventRouter`]: inbound events → registry mutations → outbound frames
//! - [`TimerSet`]: keyed cancellable timers (ring-no-answer, disconnect grace)
//! - Staleness sweep: [`EventRouter::spawn_staleness_sweep`]
//! - [`collaborators`]: narrow async contracts to external services
//! - [`side_effects`]: bounded fire-and-forget queue for analytics and logging
//! - [`StaticBackend`]: JSON-file implementation of every collaborator

#![deny(unsafe_code)]

pub mod collaborators;
pub mod error;
pub mod metrics;
pub mod notifier;
mod router;
pub mod side_effects;
pub mod static_backend;
pub mod timers;

pub use collaborators::{
    ActivityRecorder, AgentAuthenticator, CallLogEntry, CallLogStore, CollabResult, CollaboratorError,
    Collaborators, EngagementTracker, PoolDirectory, TokenVerification, VisitorIntel, WidgetSettingsStore,
};
pub use error::{Result, RouterError};
pub use notifier::{Notifier, Outbound};
pub use router::{ClientInfo, EventRouter, RouterCounts};
pub use side_effects::SideEffect;
pub use static_backend::{Directory, StaticBackend};
pub use timers::TimerSet;
