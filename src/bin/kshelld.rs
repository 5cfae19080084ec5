// src/bin/kshelld.rs

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use kshell::cli::DaemonArgs;
use kshell::server::Daemon;
use kshell::system::daemon_config::load_daemon_config;

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();
}

fn run(args: DaemonArgs) -> Result<()> {
    let config = load_daemon_config(args.config.as_deref()).context("Failed to load the daemon configuration")?;
    let config = args.apply(config).validated()?;
    log::debug!("Effective configuration: {:?}", config);

    let daemon = Daemon::from_config(&config)?;

    // Sessions share `Rc` state, so everything runs on one thread.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, daemon.run())?;
    Ok(())
}

fn main() {
    let args = DaemonArgs::parse();
    init_logging(args.verbose);

    if let Err(e) = run(args) {
        eprintln!("\n{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}
