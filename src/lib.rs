//! # kshell
//!
//! An IOS-style command shell split in two: `kshelld` loads a scheme of
//! views and commands and executes command lines as pipelines of plugin
//! actions, and `kshell` is the thin client that sends it lines over a Unix
//! socket and relays the output.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
pub type CancellationToken = Arc<AtomicBool>;

pub mod cli;
pub mod client;
pub mod constants;
pub mod core;
pub mod dev_utils;
pub mod models;
pub mod protocol;
pub mod server;
pub mod system;
