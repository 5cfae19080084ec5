// src/client/mod.rs

//! The thin client: sends lines to the daemon and relays what comes back.

pub mod session;

pub use session::{ClientError, ClientSession, ExecOutcome};
