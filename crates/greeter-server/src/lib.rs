//! # greeter-server
//!
//! Axum HTTP + WebSocket transport for the greeter session engine.
//!
//! - `GET /ws`: one WebSocket per visitor or agent; frames go to the
//!   [`EventRouter`](greeter_router::EventRouter) in arrival order
//! - [`ConnectionHub`]: the router's [`Notifier`](greeter_router::Notifier),
//!   one bounded outbound queue per socket
//! - `GET /health`, `GET /metrics`
//! - Graceful shutdown through [`ShutdownCoordinator`]

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod hub;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use hub::ConnectionHub;
pub use server::GreeterServer;
pub use shutdown::ShutdownCoordinator;
