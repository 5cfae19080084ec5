// src/core/builtins.rs

//! # Builtin handlers
//!
//! The two plugins every daemon registers:
//!
//! * `builtin`: printing, prompts, navigation and the standard ptypes.
//! * `script`: runs the action's script through a shell.

use crate::constants::{CANCELED_RETCODE, DEFAULT_SHELL, EXEC_FAILURE_RETCODE, PARAM_ENV_PREFIX};
use crate::core::action::Tri;
use crate::core::context::Context;
use crate::core::scheme::Entry;
use crate::core::session::{NavError, Session};
use crate::core::symbol::{HandlerFn, Plugin, Symbol};
use crate::system::process::{self, ExecutionError, ScriptIo, ScriptRequest};
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub const BUILTIN_PLUGIN: &str = "builtin";
pub const SCRIPT_PLUGIN: &str = "script";

/// The `builtin` plugin.
pub fn builtin_plugin() -> Plugin {
    let sync_silent = |name: &str, handler: HandlerFn| {
        Symbol::new(name, handler)
            .with_sync(Tri::True)
            .with_silent(true)
    };
    // Navigation runs in-process and even in dry runs, or the path change
    // would be lost.
    let navigation = |name: &str, handler: HandlerFn| sync_silent(name, handler).with_permanent(Tri::True);

    Plugin::new(BUILTIN_PLUGIN)
        .with_symbol(sync_silent("nop", nop))
        .with_symbol(sync_silent("tsym", tsym))
        .with_symbol(sync_silent("print", print))
        .with_symbol(sync_silent("printl", printl))
        .with_symbol(sync_silent("prompt", prompt))
        .with_symbol(sync_silent("syslog", syslog))
        .with_symbol(navigation("nav", nav))
        .with_symbol(navigation("pwd", pwd))
        .with_symbol(sync_silent("COMMAND", ptype_command))
        .with_symbol(sync_silent("COMMAND_CASE", ptype_command_case))
        .with_symbol(sync_silent("completion_COMMAND", completion_command))
        .with_symbol(sync_silent("help_COMMAND", help_command))
        .with_symbol(sync_silent("INT", ptype_int))
        .with_symbol(sync_silent("UINT", ptype_uint))
        .with_symbol(sync_silent("STRING", ptype_string))
}

// --- Misc ---

fn nop(_ctx: &mut Context<'_>) -> i32 {
    0
}

/// Echoes its script in brackets; fails on an empty one.
fn tsym(ctx: &mut Context<'_>) -> i32 {
    let script = ctx.script();
    if script.is_empty() {
        ctx.println("[<empty>]");
        ctx.eprintln("Empty item");
        return -1;
    }
    ctx.println(&format!("[{script}]"));
    0
}

fn print(ctx: &mut Context<'_>) -> i32 {
    let script = ctx.script();
    ctx.print(script);
    0
}

fn printl(ctx: &mut Context<'_>) -> i32 {
    let script = ctx.script();
    ctx.println(script);
    0
}

fn syslog(ctx: &mut Context<'_>) -> i32 {
    log::info!(target: "kshell::syslog", "{}", ctx.script());
    0
}

fn prompt(ctx: &mut Context<'_>) -> i32 {
    let user = ctx.session().and_then(Session::user).map(str::to_string);
    let host = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok());
    let text = expand_prompt(ctx.script(), user.as_deref(), host.as_deref());
    ctx.print(&text);
    0
}

/// Expands prompt macros. `%` and `\` both introduce a macro:
/// `u` user, `h` host, `e` escape, `xHH` a byte, `%` and `\` themselves.
/// Unknown macros expand to nothing.
pub fn expand_prompt(template: &str, user: Option<&str>, host: Option<&str>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' && c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('\\') => out.push('\\'),
            Some('e') => out.push('\x1b'),
            Some('u') => out.push_str(user.unwrap_or_default()),
            Some('h') => out.push_str(host.unwrap_or_default()),
            Some('x') => {
                let hex: String = chars.by_ref().take(2).collect();
                if let Some(byte) = u8::from_str_radix(&hex, 16).ok().filter(|_| hex.len() == 2) {
                    out.push(char::from(byte));
                }
            }
            _ => {}
        }
    }
    out
}

// --- Navigation ---

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NavCommandError {
    #[error(transparent)]
    View(#[from] NavError),
    #[error("Unknown navigation command '{0}'.")]
    Unknown(String),
}

/// Applies `nav` script commands, one per line or separated by `;`.
pub fn apply_nav(session: &mut Session, script: &str) -> Result<(), NavCommandError> {
    let commands = script
        .lines()
        .flat_map(|line| line.split(';'))
        .map(str::trim)
        .filter(|c| !c.is_empty());
    for command in commands {
        let mut words = command.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some("push"), Some(view), None) => session.push_view(view)?,
            (Some("replace"), Some(view), None) => session.replace_view(view)?,
            (Some("pop"), None, None) => session.pop_view(),
            (Some("top"), None, None) => session.top_view(),
            (Some("exit"), None, None) => {
                session.path_mut().truncate(0);
                session.set_done(true);
            }
            _ => return Err(NavCommandError::Unknown(command.to_string())),
        }
    }
    Ok(())
}

fn nav(ctx: &mut Context<'_>) -> i32 {
    let script = ctx.script();
    let result = match ctx.session_mut() {
        Some(session) => apply_nav(session, script),
        None => {
            ctx.eprintln("nav: no session to navigate");
            return -1;
        }
    };
    match result {
        Ok(()) => 0,
        Err(e) => {
            ctx.eprintln(&format!("nav: {e}"));
            -1
        }
    }
}

fn pwd(ctx: &mut Context<'_>) -> i32 {
    let Some(path) = ctx.session().map(Session::pwd) else {
        return -1;
    };
    ctx.println(&path);
    0
}

// --- PTYPEs ---

/// The word a command entry matches, parsed once from `value` or `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CommandWord {
    word: String,
    min_len: usize,
}

impl CommandWord {
    fn from_entry(entry: &Entry) -> Result<Self, std::num::ParseIntError> {
        match entry.value() {
            Some(value) => match value.split_once(' ') {
                Some((word, min)) => {
                    let min = min.trim().parse::<u8>()?;
                    Ok(Self {
                        word: word.to_string(),
                        min_len: usize::from(min).min(word.len()),
                    })
                }
                None => Ok(Self {
                    word: value.to_string(),
                    min_len: value.len(),
                }),
            },
            None => Ok(Self {
                word: entry.name().to_string(),
                min_len: entry.name().len(),
            }),
        }
    }
}

fn command_word<'a>(ctx: &Context<'a>) -> Option<&'a CommandWord> {
    let entry: &'a Arc<Entry> = ctx.candidate_entry()?;
    entry
        .udata_or_try_init(CommandWord::from_entry)
        .map_err(|e| log::warn!("Bad command value for '{}': {}", entry.name(), e))
        .ok()
        .flatten()
}

fn match_command(ctx: &mut Context<'_>, case_sensitive: bool) -> i32 {
    let (Some(command), Some(value)) = (command_word(ctx), ctx.candidate_value()) else {
        return -1;
    };
    if value.len() < command.min_len || value.len() > command.word.len() {
        return -1;
    }
    let Some(head) = command.word.get(..value.len()) else {
        return -1;
    };
    let matched = if case_sensitive {
        head == value
    } else {
        head.eq_ignore_ascii_case(value)
    };
    if !matched {
        return -1;
    }
    ctx.print(&command.word);
    0
}

fn ptype_command(ctx: &mut Context<'_>) -> i32 {
    match_command(ctx, false)
}

fn ptype_command_case(ctx: &mut Context<'_>) -> i32 {
    match_command(ctx, true)
}

fn completion_command(ctx: &mut Context<'_>) -> i32 {
    let Some(command) = command_word(ctx) else {
        return -1;
    };
    ctx.println(&command.word);
    0
}

fn help_command(ctx: &mut Context<'_>) -> i32 {
    let (Some(command), Some(entry)) = (command_word(ctx), ctx.candidate_entry()) else {
        return -1;
    };
    let text = entry
        .help()
        .or(entry.value())
        .unwrap_or(entry.name());
    ctx.println(&command.word);
    ctx.println(text);
    0
}

/// Parses an integer the way `strtoll` with base 0 does: `0x` hex,
/// leading `0` octal, otherwise decimal.
fn parse_signed(text: &str) -> Option<i64> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let magnitude = i128::from(parse_unsigned(digits)?);
    let value = if negative { -magnitude } else { magnitude };
    i64::try_from(value).ok()
}

fn parse_unsigned(text: &str) -> Option<u64> {
    let text = text.trim();
    if text.is_empty() || text.starts_with(['-', '+']) {
        return None;
    }
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok();
    }
    if text.len() > 1 && text.starts_with('0') {
        return u64::from_str_radix(text.get(1..)?, 8).ok();
    }
    text.parse().ok()
}

/// Optional `min max` bounds read from a ptype script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bounds<T> {
    min: Option<T>,
    max: Option<T>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BadBound(String);

impl<T: PartialOrd + Copy> Bounds<T> {
    fn parse(script: &str, parse: fn(&str) -> Option<T>) -> Result<Self, BadBound> {
        let mut words = script.split_whitespace();
        let mut bound = || {
            words
                .next()
                .map(|w| parse(w).ok_or_else(|| BadBound(w.to_string())))
                .transpose()
        };
        let min = bound()?;
        let max = bound()?;
        Ok(Self { min, max })
    }

    fn contains(&self, value: T) -> bool {
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }
}

fn check_range<T>(ctx: &Context<'_>, parse: fn(&str) -> Option<T>) -> i32
where
    T: PartialOrd + Copy + Send + Sync + 'static,
{
    let Some(value) = ctx.candidate_value().and_then(parse) else {
        return -1;
    };
    let Some(action) = ctx.action() else {
        return 0;
    };
    match action.udata_or_try_init(|a| Bounds::parse(a.script(), parse)) {
        Ok(Some(bounds)) if bounds.contains(value) => 0,
        Ok(_) => -1,
        Err(BadBound(word)) => {
            log::warn!("Invalid range bound '{}' in '{}' ptype", word, action.sym_ref());
            -1
        }
    }
}

fn ptype_int(ctx: &mut Context<'_>) -> i32 {
    check_range(ctx, parse_signed)
}

fn ptype_uint(ctx: &mut Context<'_>) -> i32 {
    check_range(ctx, parse_unsigned)
}

/// Any string, or one matching the regular expression in the script.
fn ptype_string(ctx: &mut Context<'_>) -> i32 {
    let Some(value) = ctx.candidate_value() else {
        return -1;
    };
    let Some(action) = ctx.action() else {
        return 0;
    };
    let compiled = action.udata_or_try_init(|a| match a.script().trim() {
        "" => Ok(None),
        pattern => Regex::new(pattern).map(Some),
    });
    match compiled {
        Ok(Some(None)) => 0,
        Ok(Some(Some(regex))) if regex.is_match(value) => 0,
        Ok(_) => -1,
        Err(e) => {
            log::warn!("Invalid STRING pattern: {}", e);
            -1
        }
    }
}

// --- Script plugin ---

/// Settings the `script` plugin shares with its handler.
#[derive(Debug, Clone)]
pub struct ScriptSettings {
    pub shell: PathBuf,
}

/// The `script` plugin. Its handler declares no sync policy, so it is run
/// in a child task unless the action says otherwise.
pub fn script_plugin(shell: impl Into<PathBuf>) -> Plugin {
    Plugin::new(SCRIPT_PLUGIN)
        .with_data(Arc::new(ScriptSettings {
            shell: shell.into(),
        }))
        .with_init(script_init)
        .with_symbol(Symbol::new("script", script))
}

fn script_shell(ctx: &Context<'_>) -> PathBuf {
    ctx.plugin_data::<ScriptSettings>()
        .map_or_else(|| PathBuf::from(DEFAULT_SHELL), |s| s.shell.clone())
}

fn script_init(ctx: &mut Context<'_>) -> i32 {
    let shell = script_shell(ctx);
    if process::shell_exists(&shell) {
        ctx.println(&format!("using shell {}", shell.display()));
        0
    } else {
        ctx.eprintln(&format!("shell '{}' not found", shell.display()));
        -1
    }
}

/// `KSHELL_PARAM_<name>` for every parameter; names are reduced to
/// `[A-Za-z0-9_]`.
fn param_env(ctx: &Context<'_>) -> Vec<(String, String)> {
    ctx.pargv()
        .map(|pargv| {
            pargv
                .params()
                .map(|parg| {
                    let name: String = parg
                        .entry()
                        .name()
                        .chars()
                        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                        .collect();
                    (format!("{PARAM_ENV_PREFIX}{name}"), parg.value().to_string())
                })
                .collect()
        })
        .unwrap_or_default()
}

fn script(ctx: &mut Context<'_>) -> i32 {
    let shell = script_shell(ctx);
    let request = ScriptRequest {
        shell: &shell,
        script: ctx.script(),
        env: param_env(ctx),
        own_process_group: ctx.action().is_some_and(|a| a.interrupt()),
    };
    let io = if ctx.is_capturing() {
        ScriptIo::Capture
    } else {
        ScriptIo::Streams(ctx.take_io())
    };

    match process::run_script(&request, io, &ctx.cancel_token().clone()) {
        Ok(outcome) => {
            if let Err(e) = ctx.write_out(&outcome.stdout).and_then(|()| ctx.write_err(&outcome.stderr)) {
                log::debug!("Could not forward script output: {}", e);
            }
            outcome.code
        }
        Err(ExecutionError::Cancelled) => CANCELED_RETCODE,
        Err(e) => {
            ctx.eprintln(&e.to_string());
            EXEC_FAILURE_RETCODE
        }
    }
}
