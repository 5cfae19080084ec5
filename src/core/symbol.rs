// src/core/symbol.rs

//! Handler symbols and the plugins that provide them.
//!
//! Loading native or scripted plugins from disk is outside of this crate; a
//! [`Plugin`] here is simply a named table of [`Symbol`]s registered at
//! daemon start-up. Symbol references in the command tree are either `sym`
//! (first plugin defining it wins) or `sym@plugin`.

use crate::core::action::Tri;
use crate::core::context::Context;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Plugin-wide data shared by every handler of the plugin.
pub type PluginData = Arc<dyn Any + Send + Sync>;

/// The handler contract: receives its execution context and returns a status.
pub type HandlerFn = fn(&mut Context<'_>) -> i32;

/// A callable handler plus the policy its author mandates.
#[derive(Debug, Clone)]
pub struct Symbol {
    name: String,
    handler: HandlerFn,
    permanent: Tri,
    sync: Tri,
    silent: bool,
}

impl Symbol {
    pub fn new(name: impl Into<String>, handler: HandlerFn) -> Self {
        Self {
            name: name.into(),
            handler,
            permanent: Tri::Unset,
            sync: Tri::Unset,
            silent: false,
        }
    }

    pub fn with_permanent(mut self, permanent: Tri) -> Self {
        self.permanent = permanent;
        self
    }

    pub fn with_sync(mut self, sync: Tri) -> Self {
        self.sync = sync;
        self
    }

    /// A silent symbol's output is captured when it runs in-process as the
    /// last pipeline stage, instead of being written to the stream.
    pub fn with_silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn permanent(&self) -> Tri {
        self.permanent
    }

    pub fn sync(&self) -> Tri {
        self.sync
    }

    pub fn silent(&self) -> bool {
        self.silent
    }

    pub fn invoke(&self, context: &mut Context<'_>) -> i32 {
        (self.handler)(context)
    }
}

/// A resolved symbol reference: the symbol and the plugin that owns it.
#[derive(Clone)]
pub struct Binding {
    pub symbol: Arc<Symbol>,
    pub plugin: Arc<str>,
    pub plugin_data: Option<PluginData>,
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("symbol", &self.symbol.name())
            .field("plugin", &self.plugin)
            .finish_non_exhaustive()
    }
}

/// A named collection of symbols with optional lifecycle hooks.
pub struct Plugin {
    name: Arc<str>,
    symbols: Vec<Arc<Symbol>>,
    init: Option<HandlerFn>,
    fini: Option<HandlerFn>,
    data: Option<PluginData>,
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("symbols", &self.symbols.len())
            .field("has_data", &self.data.is_some())
            .finish_non_exhaustive()
    }
}

impl Plugin {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            symbols: Vec::new(),
            init: None,
            fini: None,
            data: None,
        }
    }

    /// Attaches data every handler of this plugin can read back through
    /// [`Context::plugin_data`].
    pub fn with_data(mut self, data: PluginData) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_symbol(mut self, symbol: Symbol) -> Self {
        self.symbols.push(Arc::new(symbol));
        self
    }

    pub fn with_init(mut self, init: HandlerFn) -> Self {
        self.init = Some(init);
        self
    }

    pub fn with_fini(mut self, fini: HandlerFn) -> Self {
        self.fini = Some(fini);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn init(&self) -> Option<HandlerFn> {
        self.init
    }

    pub fn fini(&self) -> Option<HandlerFn> {
        self.fini
    }

    pub fn data(&self) -> Option<&PluginData> {
        self.data.as_ref()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter().map(Arc::as_ref)
    }

    fn find(&self, sym: &str) -> Option<Binding> {
        self.symbols
            .iter()
            .find(|s| s.name() == sym)
            .map(|symbol| Binding {
                symbol: Arc::clone(symbol),
                plugin: Arc::clone(&self.name),
                plugin_data: self.data.clone(),
            })
    }
}

/// Resolves symbolic references to handlers.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: Vec<Plugin>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a plugin. A plugin registered under an existing name replaces it.
    pub fn register(&mut self, plugin: Plugin) {
        if let Some(existing) = self.plugins.iter_mut().find(|p| p.name() == plugin.name()) {
            log::warn!("Plugin '{}' registered twice, replacing.", plugin.name());
            *existing = plugin;
        } else {
            log::debug!("Registered plugin '{}'", plugin.name());
            self.plugins.push(plugin);
        }
    }

    pub fn plugins(&self) -> impl Iterator<Item = &Plugin> {
        self.plugins.iter()
    }

    /// Resolves `sym` or `sym@plugin`.
    pub fn resolve(&self, sym_ref: &str) -> Option<Binding> {
        match sym_ref.split_once('@') {
            Some((sym, plugin)) => self
                .plugins
                .iter()
                .find(|p| p.name() == plugin)
                .and_then(|p| p.find(sym)),
            None => self.plugins.iter().find_map(|p| p.find(sym_ref)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(_ctx: &mut Context<'_>) -> i32 {
        1
    }

    fn two(_ctx: &mut Context<'_>) -> i32 {
        2
    }

    #[test]
    fn test_resolve_plain_reference_takes_first_plugin() {
        let mut registry = PluginRegistry::new();
        registry.register(Plugin::new("alpha").with_symbol(Symbol::new("run", one)));
        registry.register(Plugin::new("beta").with_symbol(Symbol::new("run", two)));

        let binding = registry.resolve("run").unwrap();
        assert_eq!(&*binding.plugin, "alpha");
    }

    #[test]
    fn test_resolve_qualified_reference() {
        let mut registry = PluginRegistry::new();
        registry.register(Plugin::new("alpha").with_symbol(Symbol::new("run", one)));
        registry.register(Plugin::new("beta").with_symbol(Symbol::new("run", two)));

        let binding = registry.resolve("run@beta").unwrap();
        assert_eq!(&*binding.plugin, "beta");
        assert!(registry.resolve("run@gamma").is_none());
        assert!(registry.resolve("walk").is_none());
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = PluginRegistry::new();
        registry.register(Plugin::new("alpha").with_symbol(Symbol::new("run", one)));
        registry.register(Plugin::new("alpha").with_symbol(Symbol::new("walk", two)));

        assert_eq!(registry.plugins().count(), 1);
        assert!(registry.resolve("run").is_none());
        assert!(registry.resolve("walk").is_some());
    }
}
