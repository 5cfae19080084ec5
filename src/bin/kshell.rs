// src/bin/kshell.rs

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use kshell::cli::{self, ClientArgs};
use kshell::client::{ClientSession, ExecOutcome};
use kshell::constants::CANCELED_RETCODE;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();
}

/// Reads the terminal size the shell exported, if any.
fn terminal_size() -> Option<(u16, u16)> {
    let width = std::env::var("COLUMNS").ok()?.parse().ok()?;
    let height = std::env::var("LINES").ok()?.parse().ok()?;
    Some((width, height))
}

fn report(outcome: &ExecOutcome) {
    if let Some(error) = &outcome.error {
        eprintln!("{} {}", "%".red().bold(), error);
    } else if outcome.is_canceled() {
        eprintln!("{}", "^C".dimmed());
    }
}

fn exit_code(outcome: &ExecOutcome) -> i32 {
    if outcome.is_canceled() { CANCELED_RETCODE } else { outcome.retcode }
}

async fn execute(
    client: &mut ClientSession,
    line: &str,
    interrupts: &mut mpsc::UnboundedReceiver<()>,
) -> Result<ExecOutcome> {
    // A Ctrl+C pressed at the prompt must not cancel the next line.
    while interrupts.try_recv().is_ok() {}
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let outcome = client.execute(line, &mut stdout, &mut stderr, interrupts).await?;
    report(&outcome);
    Ok(outcome)
}

async fn interactive(client: &mut ClientSession, interrupts: &mut mpsc::UnboundedReceiver<()>) -> Result<i32> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last = 0;
    loop {
        let prompt = client.prompt().await?;
        print!("{prompt}");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };
        if let Some(partial) = cli::help_request(&line) {
            print!("{}", cli::render_help(&client.help(partial).await?));
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }

        let outcome = execute(client, &line, interrupts).await?;
        last = exit_code(&outcome);
        if outcome.is_exit() {
            return Ok(last);
        }
    }
    Ok(last)
}

async fn run(args: ClientArgs) -> Result<i32> {
    let mut client = ClientSession::connect(&args.socket).await?;

    let (tx, mut interrupts) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(()).is_err() {
                break;
            }
        }
    });

    if let Some((width, height)) = terminal_size() {
        client.resize(width, height).await?;
    }

    if let Some(line) = &args.complete {
        print!("{}", cli::render_completion(&client.complete(line).await?));
        client.close().await?;
        return Ok(0);
    }

    let code = if args.commands.is_empty() {
        interactive(&mut client, &mut interrupts).await?
    } else {
        let mut code = 0;
        for line in &args.commands {
            let outcome = execute(&mut client, line, &mut interrupts).await?;
            code = exit_code(&outcome);
            if outcome.is_exit() {
                return Ok(code);
            }
            if outcome.is_error() || outcome.is_canceled() {
                break;
            }
        }
        code
    };

    client.close().await.context("Failed to close the session")?;
    Ok(code)
}

fn main() {
    let args = ClientArgs::parse();
    init_logging(args.verbose);

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            std::process::exit(1);
        }
    };
    match runtime.block_on(run(args)) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{}: {:#}", "Error".red().bold(), e);
            std::process::exit(1);
        }
    }
}
