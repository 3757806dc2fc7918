//! Command catalog.
//!
//! Commands are small policy objects run inside the worker. They are looked
//! up by name (or alias) in a [`CommandRegistry`] that the server builds once
//! and passes around explicitly.

pub mod builtin;
pub mod host;

use std::collections::HashMap;
use std::sync::Arc;

pub use host::{CommandHost, ExecHost, PreloadError};

// ─── Command types ───────────────────────────────────────────

/// Per-type command configuration.
///
/// A derived type starts with a copy of its parent's current preload list.
/// Later changes on either side stay local.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandType {
    name: String,
    preloads: Vec<String>,
}

impl CommandType {
    /// The base type every command derives from. Preloads nothing.
    pub fn root() -> Self {
        Self {
            name: "command".to_string(),
            preloads: Vec::new(),
        }
    }

    pub fn derive(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            preloads: self.preloads.clone(),
        }
    }

    pub fn with_preload(mut self, resource: impl Into<String>) -> Self {
        self.preloads.push(resource.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn preloads(&self) -> &[String] {
        &self.preloads
    }

    pub fn preloads_mut(&mut self) -> &mut Vec<String> {
        &mut self.preloads
    }

    pub fn set_preloads(&mut self, preloads: Vec<String>) {
        self.preloads = preloads;
    }
}

// ─── Command trait ───────────────────────────────────────────

pub trait Command: Send + Sync {
    fn command_type(&self) -> &CommandType;

    /// Prepare the host, loading this command's preloads.
    fn setup(&self, host: &mut dyn CommandHost) -> anyhow::Result<()> {
        preload_resources(self.command_type(), host)
    }

    fn call(&self, args: &[String], host: &mut dyn CommandHost) -> anyhow::Result<()>;

    /// Environment implied by the arguments after the command name.
    fn env(&self, _tail: &[String]) -> Option<String> {
        None
    }

    fn description(&self) -> &str;
}

/// Require every preload of `ty`. Missing resources only produce a warning.
pub fn preload_resources(ty: &CommandType, host: &mut dyn CommandHost) -> anyhow::Result<()> {
    for resource in ty.preloads() {
        if let Err(PreloadError::NotFound(_)) = host.require(resource) {
            tracing::warn!("{} command: preload '{}' not found", ty.name(), resource);
            host.warn(&missing_preload_message(ty.name(), resource));
        }
    }
    Ok(())
}

fn missing_preload_message(command: &str, resource: &str) -> String {
    format!(
        "The {command} command tried to preload {resource} but could not find it.\n\
         You can configure what to preload in your config with:\n  \
         [commands.{command}] preloads = [\"files\", \"to\", \"preload\"]\n"
    )
}

// ─── Registry ────────────────────────────────────────────────

/// Name → command mapping, aliases included.
#[derive(Default, Clone)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<dyn Command>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, command: Arc<dyn Command>, alias: Option<&str>) {
        if let Some(alias) = alias {
            self.commands.insert(alias.to_string(), Arc::clone(&command));
        }
        self.commands.insert(name.to_string(), command);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Command>> {
        self.commands.get(name)
    }

    /// Registered names, aliases included, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Each distinct command once, in name order.
    pub fn distinct(&self) -> Vec<&Arc<dyn Command>> {
        let mut seen: Vec<&Arc<dyn Command>> = Vec::new();
        for name in self.names() {
            if let Some(command) = self.commands.get(name) {
                if !seen.iter().any(|c| Arc::ptr_eq(c, command)) {
                    seen.push(command);
                }
            }
        }
        seen
    }
}
