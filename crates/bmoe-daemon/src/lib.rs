//! TCP server for the Biomine object exchange.
//!
//! Wraps the routing engine from `bmoe-core` in a tokio event loop: it
//! accepts clients, dials and redials configured servers, runs the
//! announce and keepalive timers and shuts down gracefully.

mod config;
mod connection;
mod daemon;

pub use config::{ConfigError, DaemonConfig};
pub use daemon::{Daemon, DaemonEvent};
