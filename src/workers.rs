//! Compiled-in worker behaviors, registered by name for the CLI.

use std::collections::HashMap;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::command::{
    CommandContext, CommandFuture, CommandRegistry, CommandReply, WorkerBehavior,
};
use crate::worker::WorkerHandle;

type BehaviorConstructor = Box<dyn Fn(&toml::Table) -> Box<dyn WorkerBehavior> + Send + Sync>;

/// Registry of worker behaviors constructible by type name.
///
/// The CLI consults it for `--worker <type>`; embedding applications extend
/// it with their own behaviors before starting workers. Each constructor
/// receives the worker's section of the `[workers]` config table.
pub struct WorkerFactory {
    constructors: HashMap<String, BehaviorConstructor>,
}

impl WorkerFactory {
    pub fn new() -> Self {
        let mut factory = Self {
            constructors: HashMap::new(),
        };
        factory.register("echo", |_settings| Box::new(Echo));
        factory
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&toml::Table) -> Box<dyn WorkerBehavior> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Box::new(constructor));
    }

    pub fn construct(&self, name: &str, settings: &toml::Table) -> Option<Box<dyn WorkerBehavior>> {
        self.constructors
            .get(name)
            .map(|constructor| constructor(settings))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for WorkerFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal demo behavior: the built-in `ping` already echoes, and `reverse`
/// shows user command registration.
pub struct Echo;

#[async_trait]
impl WorkerBehavior for Echo {
    fn name(&self) -> &'static str {
        "Echo"
    }

    fn register_commands(&self, registry: &mut CommandRegistry) {
        registry.register("reverse", cmd_reverse);
    }
}

fn cmd_reverse<'a>(ctx: &'a mut CommandContext, _worker: &'a WorkerHandle) -> CommandFuture<'a> {
    Box::pin(async move {
        debug!("reversing payload {}", ctx.data);
        let reversed = reverse_payload(&ctx.data)?;
        Ok(CommandReply::Value(reversed))
    })
}

fn reverse_payload(data: &Value) -> anyhow::Result<Value> {
    let text = data
        .as_str()
        .ok_or_else(|| anyhow!("reverse expects a string payload"))?;
    Ok(Value::String(text.chars().rev().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_factory_knows_echo() {
        let factory = WorkerFactory::new();
        let settings = toml::Table::new();
        assert_eq!(factory.names(), vec!["echo".to_string()]);
        assert!(factory.construct("echo", &settings).is_some());
        assert!(factory.construct("missing", &settings).is_none());
    }

    #[test]
    fn test_factory_register_custom() {
        let mut factory = WorkerFactory::new();
        factory.register("quiet", |_settings| Box::new(Echo));
        assert_eq!(factory.names(), vec!["echo".to_string(), "quiet".to_string()]);
    }

    #[test]
    fn test_reverse_payload() {
        assert_eq!(reverse_payload(&json!("abc")).unwrap(), json!("cba"));
        assert!(reverse_payload(&json!(42)).is_err());
    }

    #[test]
    fn test_echo_registers_reverse() {
        let mut registry = CommandRegistry::new();
        Echo.register_commands(&mut registry);
        assert!(registry.get("reverse").is_some());
    }
}
