// src/core/scheme.rs

//! # Scheme
//!
//! The compiled command tree. A [`Scheme`] is built once from the TOML model
//! in [`crate::models`] and then shared read-only by every session. Views hold
//! commands, commands hold alternative sub-commands and sequential parameters,
//! and every node keeps its actions as shared [`Action`]s so pipelines can
//! reference them without copying.

use crate::constants::DEFAULT_START_ENTRY;
use crate::core::action::{Action, UserData};
use crate::core::symbol::PluginRegistry;
use crate::models::{ActionConfig, EntryConfig, SchemeConfig};
use std::any::Any;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchemeError {
    #[error("Could not read scheme file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid TOML in scheme file '{path}': {source}")]
    Toml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("View '{0}' is defined more than once.")]
    DuplicateView(String),
    #[error("View '{0}' does not exist.")]
    UnknownView(String),
    #[error("Invalid entry '{name}': {reason}")]
    InvalidEntry { name: String, reason: String },
    #[error("The scheme defines no views.")]
    NoViews,
}

/// Where an entry sits in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    View,
    Command,
    Param,
}

/// A node of the command tree.
#[derive(Debug)]
pub struct Entry {
    name: String,
    value: Option<String>,
    help: Option<String>,
    kind: EntryKind,
    ptype: Vec<Arc<Action>>,
    commands: Vec<Arc<Entry>>,
    params: Vec<Arc<Entry>>,
    actions: Vec<Arc<Action>>,
    completion: Vec<Arc<Action>>,
    help_actions: Vec<Arc<Action>>,
    prompt: Vec<Arc<Action>>,
    udata: UserData,
}

fn compile_actions(configs: &[ActionConfig]) -> Vec<Arc<Action>> {
    configs
        .iter()
        .map(|config| Arc::new(Action::from_config(config)))
        .collect()
}

impl Entry {
    /// Builds an entry of the given kind, recursively compiling its children.
    pub fn compile(config: &EntryConfig, kind: EntryKind) -> Result<Arc<Self>, SchemeError> {
        let name = config.name.trim();
        if name.is_empty() {
            return Err(SchemeError::InvalidEntry {
                name: "<unnamed>".to_string(),
                reason: "an entry needs a non-empty 'name'".to_string(),
            });
        }
        if name.chars().any(char::is_whitespace) && kind != EntryKind::View {
            return Err(SchemeError::InvalidEntry {
                name: name.to_string(),
                reason: "command and parameter names cannot contain whitespace".to_string(),
            });
        }

        let ptype = match (kind, &config.ptype) {
            (EntryKind::View, _) => Vec::new(),
            (_, Some(ptype)) => vec![Arc::new(Action::from_config(ptype))],
            (EntryKind::Command, None) => vec![Arc::new(Action::new("COMMAND"))],
            (EntryKind::Param, None) => vec![Arc::new(Action::new("STRING"))],
        };

        let completion = if config.completion.is_empty() && kind == EntryKind::Command {
            vec![Arc::new(Action::new("completion_COMMAND"))]
        } else {
            compile_actions(&config.completion)
        };

        let help_actions = if kind == EntryKind::Command {
            vec![Arc::new(Action::new("help_COMMAND"))]
        } else {
            Vec::new()
        };

        // Parameters are leaves.
        let (commands, params) = if kind == EntryKind::Param {
            if !config.command.is_empty() || !config.param.is_empty() {
                log::warn!("Ignoring children of parameter '{}'.", name);
            }
            (Vec::new(), Vec::new())
        } else {
            let commands = config
                .command
                .iter()
                .map(|c| Self::compile(c, EntryKind::Command))
                .collect::<Result<Vec<_>, _>>()?;
            let params = if kind == EntryKind::View {
                Vec::new()
            } else {
                config
                    .param
                    .iter()
                    .map(|p| Self::compile(p, EntryKind::Param))
                    .collect::<Result<Vec<_>, _>>()?
            };
            (commands, params)
        };

        Ok(Arc::new(Self {
            name: name.to_string(),
            value: config.value.clone(),
            help: config.help.clone(),
            kind,
            ptype,
            commands,
            params,
            actions: compile_actions(&config.action),
            completion,
            help_actions,
            prompt: compile_actions(&config.prompt),
            udata: UserData::default(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The matching override, e.g. `"environment 3"`.
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn help(&self) -> Option<&str> {
        self.help.as_deref()
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn ptype(&self) -> &[Arc<Action>] {
        &self.ptype
    }

    pub fn commands(&self) -> &[Arc<Entry>] {
        &self.commands
    }

    pub fn params(&self) -> &[Arc<Entry>] {
        &self.params
    }

    pub fn actions(&self) -> &[Arc<Action>] {
        &self.actions
    }

    pub fn completion(&self) -> &[Arc<Action>] {
        &self.completion
    }

    pub fn help_actions(&self) -> &[Arc<Action>] {
        &self.help_actions
    }

    pub fn prompt(&self) -> &[Arc<Action>] {
        &self.prompt
    }

    /// A command with no actions only groups sub-commands.
    pub fn is_executable(&self) -> bool {
        !self.actions.is_empty()
    }

    pub fn udata<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.udata.get::<T>()
    }

    /// Lazily computes handler data from this entry, once.
    pub fn udata_or_try_init<T, E, F>(&self, init: F) -> Result<Option<&T>, E>
    where
        T: Any + Send + Sync,
        F: FnOnce(&Self) -> Result<T, E>,
    {
        self.udata.get_or_try_init(|| init(self))
    }

    fn all_actions(&self) -> Vec<&Arc<Action>> {
        let mut out: Vec<&Arc<Action>> = self
            .ptype
            .iter()
            .chain(&self.actions)
            .chain(&self.completion)
            .chain(&self.help_actions)
            .chain(&self.prompt)
            .collect();
        for child in self.commands.iter().chain(&self.params) {
            out.extend(child.all_actions());
        }
        out
    }
}

/// The whole command tree.
#[derive(Debug)]
pub struct Scheme {
    views: Vec<Arc<Entry>>,
    filters: Vec<Arc<Entry>>,
    start: Option<String>,
}

impl Scheme {
    pub fn from_config(config: &SchemeConfig) -> Result<Self, SchemeError> {
        if config.view.is_empty() {
            return Err(SchemeError::NoViews);
        }

        let mut seen = HashSet::new();
        let mut views = Vec::with_capacity(config.view.len());
        for view in &config.view {
            let entry = Entry::compile(view, EntryKind::View)?;
            if !seen.insert(entry.name().to_string()) {
                return Err(SchemeError::DuplicateView(entry.name().to_string()));
            }
            views.push(entry);
        }

        let filters = config
            .filter
            .iter()
            .map(|f| Entry::compile(f, EntryKind::Command))
            .collect::<Result<Vec<_>, _>>()?;

        let scheme = Self {
            views,
            filters,
            start: config.start.clone(),
        };
        if let Some(start) = &scheme.start {
            if scheme.view(start).is_none() {
                return Err(SchemeError::UnknownView(start.clone()));
            }
        }

        log::debug!(
            "Compiled scheme: {} view(s), {} filter(s)",
            scheme.views.len(),
            scheme.filters.len()
        );
        Ok(scheme)
    }

    /// Reads and compiles a TOML scheme file.
    pub fn load(path: &Path) -> Result<Self, SchemeError> {
        let content = fs::read_to_string(path).map_err(|source| SchemeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: SchemeConfig = toml::from_str(&content).map_err(|source| SchemeError::Toml {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_config(&config)
    }

    pub fn view(&self, name: &str) -> Option<&Arc<Entry>> {
        self.views.iter().find(|v| v.name() == name)
    }

    pub fn views(&self) -> &[Arc<Entry>] {
        &self.views
    }

    pub fn filters(&self) -> &[Arc<Entry>] {
        &self.filters
    }

    /// The view new sessions start in: the explicit override, else the
    /// scheme's `start`, else `main`.
    pub fn start_view(&self, requested: Option<&str>) -> Result<&Arc<Entry>, SchemeError> {
        let name = requested
            .or(self.start.as_deref())
            .unwrap_or(DEFAULT_START_ENTRY);
        self.view(name)
            .ok_or_else(|| SchemeError::UnknownView(name.to_string()))
    }

    /// Symbol references no registered plugin provides. They only fail
    /// when an action using them actually runs.
    pub fn unresolved_symbols(&self, registry: &PluginRegistry) -> Vec<String> {
        let mut missing: Vec<String> = self
            .views
            .iter()
            .chain(&self.filters)
            .flat_map(|entry| entry.all_actions())
            .filter(|action| registry.resolve(action.sym_ref()).is_none())
            .map(|action| action.sym_ref().to_string())
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }
}
