// src/cli/mod.rs

//! Command-line surfaces of the two binaries and the client's rendering.

use crate::protocol::messages::{CompletionReply, HelpReply};
use clap::builder::Styles;
use clap::builder::styling::AnsiColor;
use colored::Colorize;

pub mod args;

pub use args::{ClientArgs, DaemonArgs};

pub(crate) fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default().bold())
        .usage(AnsiColor::Yellow.on_default().bold())
        .literal(AnsiColor::Cyan.on_default().bold())
        .placeholder(AnsiColor::Green.on_default())
}

/// Splits a line ending in `?` into the line to ask help for.
///
/// `show ?` asks for the words after `show`; `sh?` asks about the word
/// being typed.
pub fn help_request(line: &str) -> Option<&str> {
    line.trim_end().strip_suffix('?')
}

/// Two aligned columns, one help item per line.
pub fn render_help(reply: &HelpReply) -> String {
    let width = reply.items.iter().map(|i| i.item.len()).max().unwrap_or(0);
    let mut out = String::new();
    for item in &reply.items {
        out.push_str(&format!(
            "  {}  {}\n",
            format!("{:<width$}", item.item).cyan().bold(),
            item.text
        ));
    }
    out
}

pub fn render_completion(reply: &CompletionReply) -> String {
    let mut out = String::new();
    for candidate in &reply.candidates {
        out.push_str(candidate);
        out.push('\n');
    }
    out
}
