// src/models.rs

use crate::constants::{
    DEFAULT_DRAIN_TIMEOUT_MS, DEFAULT_LOCK_TIMEOUT_MS, DEFAULT_MAX_CHILDREN, DEFAULT_MAX_PAYLOAD,
    DEFAULT_SHELL, DEFAULT_SOCKET_PATH,
};
use crate::core::action::{ExecOn, IoMode};
use serde::{Deserialize, Serialize};

// --- COMMAND TREE MODELS (what is read from scheme.toml) ---

/// An `in`/`out` setting as written in the scheme. Accepts both `true`/`false`
/// and the mode names (`"tty"`).
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(untagged)]
pub enum IoSetting {
    Flag(bool),
    Mode(IoMode),
}

impl From<IoSetting> for IoMode {
    fn from(setting: IoSetting) -> Self {
        match setting {
            IoSetting::Flag(true) => IoMode::True,
            IoSetting::Flag(false) => IoMode::False,
            IoSetting::Mode(mode) => mode,
        }
    }
}

/// One `ACTION` as declared in the scheme.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionConfig {
    /// Symbol reference, `sym` or `sym@plugin`.
    pub sym: String,
    #[serde(default)]
    pub lock: Option<String>,
    #[serde(default)]
    pub interrupt: bool,
    #[serde(default, rename = "in")]
    pub input: Option<IoSetting>,
    #[serde(default, rename = "out")]
    pub output: Option<IoSetting>,
    #[serde(default)]
    pub exec_on: ExecOn,
    #[serde(default)]
    pub update_retcode: Option<bool>,
    /// Left unset unless the scheme author wrote it explicitly.
    #[serde(default)]
    pub permanent: Option<bool>,
    #[serde(default)]
    pub sync: Option<bool>,
    #[serde(default)]
    pub script: String,
}

/// A node of the command tree: a view, a command or a parameter, depending
/// on where it appears.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryConfig {
    pub name: String,
    /// Overrides the word matched for a command. `"environment 3"` means the
    /// word is `environment` and three characters are enough to match it.
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub help: Option<String>,
    /// Only meaningful for parameters: the action that validates a value.
    #[serde(default)]
    pub ptype: Option<ActionConfig>,
    /// Alternative sub-commands.
    #[serde(default)]
    pub command: Vec<EntryConfig>,
    /// Sequential parameters.
    #[serde(default)]
    pub param: Vec<EntryConfig>,
    #[serde(default)]
    pub action: Vec<ActionConfig>,
    /// Actions printing completion candidates, one per line.
    #[serde(default)]
    pub completion: Vec<ActionConfig>,
    /// Views only: actions printing the prompt.
    #[serde(default)]
    pub prompt: Vec<ActionConfig>,
}

/// The deserialized structure of a `scheme.toml` file.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemeConfig {
    /// The view new sessions start in.
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub view: Vec<EntryConfig>,
    /// Commands usable after a `|`.
    #[serde(default)]
    pub filter: Vec<EntryConfig>,
}

// --- DAEMON CONFIG MODEL (what is read from kshelld.toml) ---

/// Daemon settings. Every key is optional in the file.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: String,
    /// Path of the command tree. `None` means `<config_dir>/kshell/scheme.toml`.
    pub scheme: Option<String>,
    pub start_entry: Option<String>,
    pub dry_run: bool,
    pub lock_timeout_ms: u64,
    pub max_children: usize,
    pub max_payload: u32,
    pub drain_timeout_ms: u64,
    pub shell: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            scheme: None,
            start_entry: None,
            dry_run: false,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            max_children: DEFAULT_MAX_CHILDREN,
            max_payload: DEFAULT_MAX_PAYLOAD,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
            shell: DEFAULT_SHELL.to_string(),
        }
    }
}
