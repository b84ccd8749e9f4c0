//! Command dispatch: the per-message reply context, the name → handler
//! registry and the behavior seam workers are composed from.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tracing::{error, warn};

use crate::client::{Client, ReplyPayload, ReplyStream};
use crate::worker::WorkerHandle;

/// What a handler produced.
///
/// `None` means the handler either replied through the context already or
/// left the reply to the dispatcher's auto-success. A `Value` becomes one
/// single-shot reply; a `Stream` is framed with the stream counter.
pub enum CommandReply {
    None,
    Value(Value),
    Stream(ReplyStream),
}

pub type CommandFuture<'a> = BoxFuture<'a, Result<CommandReply>>;

/// A registered command implementation.
pub type CommandHandler =
    Box<dyn for<'a> Fn(&'a mut CommandContext, &'a WorkerHandle) -> CommandFuture<'a> + Send + Sync>;

/// Mapping from command names to handlers.
///
/// The worker populates it with the built-ins at construction; behaviors
/// extend it and may override built-ins by registering the same name.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, CommandHandler>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: for<'a> Fn(&'a mut CommandContext, &'a WorkerHandle) -> CommandFuture<'a>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(name.into(), Box::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<&CommandHandler> {
        self.handlers.get(name)
    }

    /// Registered command names, sorted for stable `info` replies.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Reply helper bound to one incoming message.
///
/// Tracks whether a reply was emitted so the dispatcher can guarantee the
/// caller's wait loop observes exactly one terminal reply per request.
pub struct CommandContext {
    client: Client,
    origin: String,
    pub correlation: Option<String>,
    pub data: Value,
    did_reply: bool,
}

impl CommandContext {
    pub fn new(
        client: Client,
        origin: impl Into<String>,
        correlation: Option<String>,
        data: Value,
    ) -> Self {
        Self {
            client,
            origin: origin.into(),
            correlation,
            data,
            did_reply: false,
        }
    }

    pub fn did_reply(&self) -> bool {
        self.did_reply
    }

    /// Bus client for handlers that issue their own requests.
    pub fn client(&mut self) -> &mut Client {
        &mut self.client
    }

    /// Push a reply for this message's correlation.
    pub async fn reply(&mut self, payload: ReplyPayload) -> Result<()> {
        let Some(correlation) = self.correlation.clone() else {
            // Nothing to route a reply to; suppress the auto-success as well.
            warn!("dropping reply for message without correlation id");
            self.did_reply = true;
            return Ok(());
        };
        self.client.reply(&self.origin, &correlation, payload).await?;
        self.did_reply = true;
        Ok(())
    }

    pub async fn reply_success(&mut self, msg: &str) -> Result<()> {
        self.reply(ReplyPayload::Value(json!({"success": true, "msg": msg})))
            .await
    }

    /// Success reply with extra fields merged beside `success` and `msg`.
    pub async fn reply_success_with(
        &mut self,
        msg: &str,
        fields: Map<String, Value>,
    ) -> Result<()> {
        let mut data = Map::new();
        data.insert("success".into(), json!(true));
        data.insert("msg".into(), json!(msg));
        data.extend(fields);
        self.reply(ReplyPayload::Value(Value::Object(data))).await
    }

    pub async fn reply_failure(&mut self, msg: &str) -> Result<()> {
        error!("command failed: {}", msg);
        self.reply(ReplyPayload::Value(json!({"success": false, "msg": msg})))
            .await
    }
}

/// Capabilities a worker is composed from.
///
/// Implementations hold their own state; commands that need to share state
/// with the tick path capture it behind `Arc`s when registering.
#[async_trait]
pub trait WorkerBehavior: Send {
    /// Behavior name reported in the presence info document.
    fn name(&self) -> &'static str {
        "worker"
    }

    /// Extend (or override entries of) the base command registry.
    fn register_commands(&self, _registry: &mut CommandRegistry) {}

    /// Whether the `download`/`download_dir` commands are allowed.
    fn allow_downloads(&self) -> bool {
        false
    }

    /// Extra fields merged into the presence info document.
    fn info(&self) -> Map<String, Value> {
        Map::new()
    }

    /// Files advertised in the presence info document.
    fn files(&self) -> Vec<String> {
        Vec::new()
    }

    async fn startup(&mut self, _worker: &WorkerHandle) -> Result<()> {
        Ok(())
    }

    async fn tick(&mut self, _worker: &WorkerHandle, _elapsed: Duration) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self, _worker: &WorkerHandle) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd_echo<'a>(ctx: &'a mut CommandContext, _worker: &'a WorkerHandle) -> CommandFuture<'a> {
        Box::pin(async move { Ok(CommandReply::Value(ctx.data.clone())) })
    }

    fn cmd_quiet<'a>(_ctx: &'a mut CommandContext, _worker: &'a WorkerHandle) -> CommandFuture<'a> {
        Box::pin(async move { Ok(CommandReply::None) })
    }

    #[test]
    fn test_registry_register_and_names() {
        let mut registry = CommandRegistry::new();
        registry.register("ping", cmd_echo);
        registry.register("info", cmd_quiet);

        assert!(registry.get("ping").is_some());
        assert!(registry.get("pong").is_none());
        assert_eq!(registry.names(), vec!["info".to_string(), "ping".to_string()]);
    }

    #[test]
    fn test_registry_override_replaces_handler() {
        let mut registry = CommandRegistry::new();
        registry.register("ping", cmd_quiet);
        registry.register("ping", cmd_echo);
        assert_eq!(registry.names().len(), 1);
    }
}
