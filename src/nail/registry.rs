//! Name → nail mapping, populated at startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::nail::Nail;
use crate::{AppError, Result};

/// Registered commands and aliases.
#[derive(Default, Clone)]
pub struct CommandRegistry {
    commands: BTreeMap<String, Arc<dyn Nail>>,
    aliases: BTreeMap<String, String>,
}

impl CommandRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in nails.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        super::builtins::register_all(&mut registry);
        registry
    }

    /// Register `nail` under `name`, replacing any previous registration.
    pub fn register(&mut self, name: impl Into<String>, nail: impl Nail + 'static) {
        let name = name.into();
        debug!(command = %name, "registering command");
        self.commands.insert(name, Arc::new(nail));
    }

    /// Make `alias` resolve to the registered command `target`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `target` is not registered.
    pub fn alias(&mut self, alias: impl Into<String>, target: &str) -> Result<()> {
        if !self.commands.contains_key(target) {
            return Err(AppError::Config(format!(
                "alias target '{target}' is not a registered command"
            )));
        }
        self.aliases.insert(alias.into(), target.to_owned());
        Ok(())
    }

    /// Look up a command, checking aliases first.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Nail>> {
        let target = self.aliases.get(name).map_or(name, String::as_str);
        self.commands.get(target).map(Arc::clone)
    }

    /// Registered command names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    /// `(alias, target)` pairs, sorted by alias.
    pub fn aliases(&self) -> impl Iterator<Item = (&str, &str)> {
        self.aliases
            .iter()
            .map(|(alias, target)| (alias.as_str(), target.as_str()))
    }

    /// Description of a registered command.
    #[must_use]
    pub fn description(&self, name: &str) -> Option<&str> {
        self.commands.get(name).map(|nail| nail.description())
    }
}
