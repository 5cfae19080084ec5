// src/cli/args.rs
use crate::constants::{DEFAULT_SOCKET_PATH, SOCKET_ENV_VAR};
use crate::models::DaemonConfig;
use clap::Parser;
use std::path::PathBuf;

/// kshelld: executes command pipelines for kshell clients.
#[derive(Parser, Debug, Default)]
#[command(author, version, about, styles = super::styles())]
pub struct DaemonArgs {
    /// Daemon configuration file. Defaults to `~/.config/kshell/kshelld.toml`.
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Listen on this socket instead of the configured one.
    #[arg(long, short)]
    pub socket: Option<String>,

    /// Load this scheme file instead of the configured one.
    #[arg(long)]
    pub scheme: Option<String>,

    /// The view new sessions start in.
    #[arg(long)]
    pub start_entry: Option<String>,

    /// Only invoke actions marked permanent.
    #[arg(long)]
    pub dry_run: bool,

    /// Log at debug level.
    #[arg(long, short)]
    pub verbose: bool,
}

impl DaemonArgs {
    /// Lays the command-line overrides over a loaded configuration.
    pub fn apply(&self, mut config: DaemonConfig) -> DaemonConfig {
        if let Some(socket) = &self.socket {
            config.socket_path.clone_from(socket);
        }
        if let Some(scheme) = &self.scheme {
            config.scheme = Some(scheme.clone());
        }
        if let Some(entry) = &self.start_entry {
            config.start_entry = Some(entry.clone());
        }
        config.dry_run |= self.dry_run;
        config
    }
}

/// kshell: an interactive client for kshelld.
#[derive(Parser, Debug)]
#[command(author, version, about, styles = super::styles())]
pub struct ClientArgs {
    /// Daemon socket.
    #[arg(long, short, env = SOCKET_ENV_VAR, default_value = DEFAULT_SOCKET_PATH)]
    pub socket: PathBuf,

    /// Execute these lines and exit instead of starting the interactive loop.
    #[arg(long = "command", short = 'c', num_args = 1..)]
    pub commands: Vec<String>,

    /// Print the completions for LINE and exit.
    #[arg(long, value_name = "LINE", conflicts_with = "commands")]
    pub complete: Option<String>,

    /// Log at debug level.
    #[arg(long, short)]
    pub verbose: bool,
}
