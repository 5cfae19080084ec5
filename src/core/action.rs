// src/core/action.rs

//! # Actions
//!
//! An [`Action`] is one execution step of a command: a symbolic reference to
//! a handler, the condition under which it runs, its sync/permanent policy and
//! an opaque script handed to the handler.
//!
//! Policy fields are tri-state. The handler symbol may mandate a value (for
//! example navigation must always run in-process), the scheme author may
//! declare one, and otherwise the hard default applies.

use crate::core::symbol::{Binding, PluginRegistry};
use crate::models::ActionConfig;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

/// A policy value with an explicit "not declared" state.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Tri {
    #[default]
    Unset,
    False,
    True,
}

impl Tri {
    /// Returns `self` when declared, otherwise `fallback`.
    pub fn or(self, fallback: Self) -> Self {
        match self {
            Self::Unset => fallback,
            declared => declared,
        }
    }

    /// Collapses to a boolean, treating `Unset` as `false`.
    pub fn is_true(self) -> bool {
        self == Self::True
    }
}

impl From<bool> for Tri {
    fn from(value: bool) -> Self {
        if value { Self::True } else { Self::False }
    }
}

impl From<Option<bool>> for Tri {
    fn from(value: Option<bool>) -> Self {
        value.map_or(Self::Unset, Self::from)
    }
}

/// Resolves a policy: the handler's declaration wins over the action's,
/// which wins over the default of `false`.
pub fn resolve_policy(handler: Tri, action: Tri) -> bool {
    handler.or(action).is_true()
}

/// When an action runs relative to the stage's current return code.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExecOn {
    Always,
    #[default]
    Success,
    Failure,
    Never,
}

/// Whether an action consumes (`in`) or produces (`out`) a stream in a pipe chain.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum IoMode {
    #[default]
    False,
    True,
    Tty,
}

impl IoMode {
    pub fn is_enabled(self) -> bool {
        self != Self::False
    }
}

/// A lazily initialised, type-erased slot where a handler memoizes whatever it
/// parsed out of its action or entry. The value is dropped with its owner.
#[derive(Default)]
pub struct UserData(OnceLock<Box<dyn Any + Send + Sync>>);

impl UserData {
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.get().and_then(|data| data.downcast_ref::<T>())
    }

    /// Initialises the slot on first use. Yields `Ok(None)` if the slot
    /// already holds data of another type.
    pub fn get_or_try_init<T, E, F>(&self, init: F) -> Result<Option<&T>, E>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T, E>,
    {
        if self.0.get().is_none() {
            let data = init()?;
            let _ = self.0.set(Box::new(data));
        }
        Ok(self.get::<T>())
    }
}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UserData")
            .field(&if self.0.get().is_some() { "set" } else { "empty" })
            .finish()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("Symbol '{0}' could not be resolved to a handler.")]
    UnresolvedSymbol(String),
}

/// One execution step. Immutable after load except for the lazily resolved
/// handler binding and the handler's memoized user data.
pub struct Action {
    sym_ref: String,
    binding: OnceLock<Binding>,
    lock: Option<String>,
    interrupt: bool,
    input: IoMode,
    output: IoMode,
    exec_on: ExecOn,
    update_retcode: bool,
    permanent: Tri,
    sync: Tri,
    script: String,
    udata: UserData,
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("sym_ref", &self.sym_ref)
            .field("bound", &self.binding.get().is_some())
            .field("lock", &self.lock)
            .field("interrupt", &self.interrupt)
            .field("exec_on", &self.exec_on)
            .field("update_retcode", &self.update_retcode)
            .field("permanent", &self.permanent)
            .field("sync", &self.sync)
            .field("script", &self.script)
            .finish_non_exhaustive()
    }
}

impl Action {
    /// Creates an action with the scheme defaults: runs on success, updates the
    /// return code, produces output, consumes none, policy unset.
    pub fn new(sym_ref: impl Into<String>) -> Self {
        Self {
            sym_ref: sym_ref.into(),
            binding: OnceLock::new(),
            lock: None,
            interrupt: false,
            input: IoMode::False,
            output: IoMode::True,
            exec_on: ExecOn::Success,
            update_retcode: true,
            permanent: Tri::Unset,
            sync: Tri::Unset,
            script: String::new(),
            udata: UserData::default(),
        }
    }

    pub fn from_config(config: &ActionConfig) -> Self {
        let mut action = Self::new(config.sym.trim())
            .with_exec_on(config.exec_on)
            .with_permanent(Tri::from(config.permanent))
            .with_sync(Tri::from(config.sync))
            .with_interrupt(config.interrupt)
            .with_update_retcode(config.update_retcode.unwrap_or(true))
            .with_script(config.script.clone());
        if let Some(lock) = config.lock.as_deref().filter(|l| !l.is_empty()) {
            action = action.with_lock(lock);
        }
        if let Some(input) = config.input {
            action.input = input.into();
        }
        if let Some(output) = config.output {
            action.output = output.into();
        }
        action
    }

    // --- Builder methods ---

    pub fn with_exec_on(mut self, exec_on: ExecOn) -> Self {
        self.exec_on = exec_on;
        self
    }

    pub fn with_permanent(mut self, permanent: Tri) -> Self {
        self.permanent = permanent;
        self
    }

    pub fn with_sync(mut self, sync: Tri) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_lock(mut self, lock: impl Into<String>) -> Self {
        self.lock = Some(lock.into());
        self
    }

    pub fn with_interrupt(mut self, interrupt: bool) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn with_update_retcode(mut self, update_retcode: bool) -> Self {
        self.update_retcode = update_retcode;
        self
    }

    pub fn with_io(mut self, input: IoMode, output: IoMode) -> Self {
        self.input = input;
        self.output = output;
        self
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = script.into();
        self
    }

    // --- Accessors ---

    pub fn sym_ref(&self) -> &str {
        &self.sym_ref
    }

    pub fn lock(&self) -> Option<&str> {
        self.lock.as_deref()
    }

    pub fn interrupt(&self) -> bool {
        self.interrupt
    }

    pub fn input(&self) -> IoMode {
        self.input
    }

    pub fn output(&self) -> IoMode {
        self.output
    }

    pub fn exec_on(&self) -> ExecOn {
        self.exec_on
    }

    pub fn update_retcode(&self) -> bool {
        self.update_retcode
    }

    pub fn declared_permanent(&self) -> Tri {
        self.permanent
    }

    pub fn declared_sync(&self) -> Tri {
        self.sync
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    /// The handler binding, if the reference was already resolved.
    pub fn binding(&self) -> Option<&Binding> {
        self.binding.get()
    }

    /// Resolves the symbolic reference on first use and memoizes the result.
    pub fn bind(&self, registry: &PluginRegistry) -> Result<&Binding, ActionError> {
        if let Some(binding) = self.binding.get() {
            return Ok(binding);
        }
        let resolved = registry
            .resolve(&self.sym_ref)
            .ok_or_else(|| ActionError::UnresolvedSymbol(self.sym_ref.clone()))?;
        // Another thread may have won the race; both bindings are identical.
        let _ = self.binding.set(resolved);
        self.binding
            .get()
            .ok_or_else(|| ActionError::UnresolvedSymbol(self.sym_ref.clone()))
    }

    /// Returns true iff the action must run given the stage's running return code.
    pub fn meets_condition(&self, current_retcode: i32) -> bool {
        match self.exec_on {
            ExecOn::Always => true,
            ExecOn::Success => current_retcode == 0,
            ExecOn::Failure => current_retcode != 0,
            ExecOn::Never => false,
        }
    }

    /// Effective "permanent" policy: runs even during a dry run.
    pub fn is_permanent(&self) -> bool {
        let handler = self
            .binding
            .get()
            .map_or(Tri::Unset, |b| b.symbol.permanent());
        resolve_policy(handler, self.permanent)
    }

    /// Effective "sync" policy: runs in-process instead of in a child task.
    pub fn is_sync(&self) -> bool {
        let handler = self.binding.get().map_or(Tri::Unset, |b| b.symbol.sync());
        resolve_policy(handler, self.sync)
    }

    /// Whether the bound handler asks for its output to be captured.
    pub fn is_silent(&self) -> bool {
        self.binding.get().is_some_and(|b| b.symbol.silent())
    }

    // --- User data ---

    /// Returns the handler's memoized data for this action, initialising it
    /// on first use. Data is dropped together with the action.
    ///
    /// Yields `Ok(None)` if the slot already holds data of another type.
    pub fn udata_or_try_init<T, E, F>(&self, init: F) -> Result<Option<&T>, E>
    where
        T: Any + Send + Sync,
        F: FnOnce(&Self) -> Result<T, E>,
    {
        self.udata.get_or_try_init(|| init(self))
    }

    pub fn udata<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.udata.get::<T>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::Context;
    use crate::core::symbol::{Plugin, Symbol};

    fn handler_ok(_ctx: &mut Context<'_>) -> i32 {
        0
    }

    fn registry_with(symbol: Symbol) -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        registry.register(Plugin::new("test").with_symbol(symbol));
        registry
    }

    #[test]
    fn test_meets_condition_table() {
        let cases = [
            (ExecOn::Always, 0, true),
            (ExecOn::Always, 1, true),
            (ExecOn::Success, 0, true),
            (ExecOn::Success, 2, false),
            (ExecOn::Failure, 0, false),
            (ExecOn::Failure, -1, true),
            (ExecOn::Never, 0, false),
            (ExecOn::Never, 1, false),
        ];
        for (exec_on, retcode, expected) in cases {
            let action = Action::new("nop").with_exec_on(exec_on);
            assert_eq!(
                action.meets_condition(retcode),
                expected,
                "{exec_on:?} with retcode {retcode}"
            );
        }
    }

    #[test]
    fn test_effective_sync_handler_overrides_action() {
        let registry = registry_with(Symbol::new("mandated", handler_ok).with_sync(Tri::False));
        let action = Action::new("mandated").with_sync(Tri::True);
        action.bind(&registry).unwrap();
        assert!(!action.is_sync());
        // Repeated queries give the same answer.
        assert!(!action.is_sync());
    }

    #[test]
    fn test_effective_sync_falls_back_to_action_then_default() {
        let registry = registry_with(Symbol::new("free", handler_ok));

        let declared = Action::new("free").with_sync(Tri::True);
        declared.bind(&registry).unwrap();
        assert!(declared.is_sync());

        let undeclared = Action::new("free");
        undeclared.bind(&registry).unwrap();
        assert!(!undeclared.is_sync());
        assert!(!undeclared.is_permanent());
    }

    #[test]
    fn test_policy_is_pure_over_all_combinations() {
        let values = [Tri::Unset, Tri::False, Tri::True];
        for handler in values {
            for declared in values {
                let registry = registry_with(
                    Symbol::new("sym", handler_ok)
                        .with_sync(handler)
                        .with_permanent(handler),
                );
                let action = Action::new("sym")
                    .with_sync(declared)
                    .with_permanent(declared);
                action.bind(&registry).unwrap();
                let expected = match handler {
                    Tri::Unset => declared == Tri::True,
                    other => other == Tri::True,
                };
                assert_eq!(action.is_sync(), expected);
                assert_eq!(action.is_permanent(), expected);
            }
        }
    }

    #[test]
    fn test_bind_unknown_symbol_fails() {
        let registry = PluginRegistry::new();
        let action = Action::new("missing");
        let err = action.bind(&registry).unwrap_err();
        assert_eq!(err, ActionError::UnresolvedSymbol("missing".to_string()));
        assert!(action.binding().is_none());
    }

    #[test]
    fn test_udata_is_initialised_once() {
        let action = Action::new("nop").with_script("10 20");
        let mut calls = 0;
        for _ in 0..3 {
            let value: &usize = action
                .udata_or_try_init(|a| {
                    calls += 1;
                    Ok::<_, ()>(a.script().len())
                })
                .unwrap()
                .unwrap();
            assert_eq!(*value, 5);
        }
        assert_eq!(calls, 1);
        assert_eq!(action.udata::<usize>(), Some(&5));
    }

    #[test]
    fn test_from_config() {
        let config: ActionConfig = toml::from_str(
            r#"
            sym = "script"
            lock = "cfg"
            exec_on = "always"
            sync = false
            update_retcode = false
            in = true
            script = "echo hi"
            "#,
        )
        .unwrap();
        let action = Action::from_config(&config);
        assert_eq!(action.sym_ref(), "script");
        assert_eq!(action.lock(), Some("cfg"));
        assert_eq!(action.exec_on(), ExecOn::Always);
        assert_eq!(action.declared_sync(), Tri::False);
        assert_eq!(action.declared_permanent(), Tri::Unset);
        assert!(!action.update_retcode());
        assert_eq!(action.input(), IoMode::True);
        assert_eq!(action.output(), IoMode::True);
        assert_eq!(action.script(), "echo hi");
    }
}
