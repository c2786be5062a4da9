//! WebSocket transport: upgrade, per-socket state, liveness, session loop.

pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod session;
