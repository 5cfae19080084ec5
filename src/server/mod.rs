// src/server/mod.rs

//! The daemon: a listening socket and one protocol session per client.

pub mod daemon;
mod output;
pub mod session;

pub use daemon::{Daemon, DaemonError, default_registry};
pub use session::{DaemonSession, SessionLimits, TransportState};
