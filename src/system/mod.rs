//! # System Interaction Layer
//!
//! The boundary between the shell's core and the operating system.
//!
//! ## Modules
//!
//! - **`daemon_config`**: Loads and validates `kshelld.toml`, and resolves the
//!   socket, scheme and shell paths it names.
//! - **`process`**: Runs `/bin/sh` scripts for the script plugin, with their
//!   output streamed or captured and `Ctrl+C`-style cancellation.

pub mod daemon_config;
pub mod process;
