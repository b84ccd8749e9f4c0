//! Worker runtime: lifecycle loop, presence/discovery keys and the built-in
//! commands.
//!
//! A worker drains its direct and group request queues through a `Monitor`,
//! drains site broadcasts through a `Subscription`, dispatches each envelope
//! to a registered command handler and keeps its presence records fresh on a
//! maintenance cadence.

use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::client::{Client, ReplyPayload};
use crate::command::{CommandContext, CommandFuture, CommandRegistry, CommandReply, WorkerBehavior};
use crate::envelope::{uid_tail, Envelope};
use crate::keys;
use crate::log_sink::LogHandler;
use crate::monitor::Monitor;
use crate::subscription::Subscription;
use crate::transfer;

/// Presence and log-sink refresh cadence.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);

/// Presence keys outlive the refresh cadence by this margin.
const PRESENCE_TTL_SECS: u64 = MAINTENANCE_INTERVAL.as_secs() + 3;

/// Default tick interval in seconds.
pub const DEFAULT_WORKER_INTERVAL: f64 = 0.4;

/// Generate a worker id as `<ipv4>:<pid>:<uid-tail>`. Never recycled within
/// a process lifetime.
pub fn generate_worker_id() -> String {
    format!("{}:{}:{}", local_ipv4(), std::process::id(), uid_tail())
}

/// Split a worker id back into host, pid and uid tail.
pub fn parse_worker_id(worker_id: &str) -> Option<(String, u32, String)> {
    let mut parts = worker_id.splitn(3, ':');
    let host = parts.next()?.to_string();
    let pid = parts.next()?.parse().ok()?;
    let uid = parts.next()?.to_string();
    Some((host, pid, uid))
}

fn local_ipv4() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    (host.as_str(), 0u16)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.find(|a| a.is_ipv4()))
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

/// Configuration for one worker instance.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Site namespace for discovery, group routing and broadcast.
    pub site: String,
    /// Worker type name, shared by interchangeable workers.
    pub worker_type: String,
    /// Path for file operations, can differ from the working directory.
    pub worker_path: PathBuf,
    /// Tick interval in seconds.
    pub worker_interval: f64,
    /// Id of the spawner that started this worker, if any.
    pub spawner: Option<String>,
    /// Fixed worker id; generated when absent.
    pub worker_id: Option<String>,
}

impl WorkerConfig {
    pub fn new(site: impl Into<String>, worker_type: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            worker_type: worker_type.into(),
            worker_path: PathBuf::from("."),
            worker_interval: DEFAULT_WORKER_INTERVAL,
            spawner: None,
            worker_id: None,
        }
    }
}

/// Cheaply cloneable view of a running worker, shared with command handlers.
#[derive(Clone)]
pub struct WorkerHandle {
    pub id: String,
    pub site: String,
    pub worker_type: String,
    /// Behavior name reported as `type` in the info document.
    pub behavior_name: String,
    pub worker_path: PathBuf,
    pub interval: f64,
    allow_downloads: bool,
    files: Vec<String>,
    started: Instant,
    active: Arc<AtomicBool>,
    spawner: Arc<Mutex<Option<String>>>,
    commands: Arc<Mutex<Vec<String>>>,
    log_files: Arc<Mutex<Vec<String>>>,
    extra_info: Arc<Mutex<Map<String, Value>>>,
    conn: MultiplexedConnection,
}

impl WorkerHandle {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Request a graceful stop; the loop exits at the current tick.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn allow_downloads(&self) -> bool {
        self.allow_downloads
    }

    pub fn spawner(&self) -> Option<String> {
        self.spawner.lock().expect("spawner lock poisoned").clone()
    }

    pub fn set_spawner(&self, spawner: Option<String>) {
        *self.spawner.lock().expect("spawner lock poisoned") = spawner;
    }

    /// Names of every registered command.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("commands lock poisoned").clone()
    }

    fn set_commands(&self, names: Vec<String>) {
        *self.commands.lock().expect("commands lock poisoned") = names;
    }

    pub fn add_log_file(&self, path: impl Into<String>) {
        self.log_files
            .lock()
            .expect("log files lock poisoned")
            .push(path.into());
    }

    /// Merge a field into the presence info document.
    pub fn set_info_field(&self, key: impl Into<String>, value: Value) {
        self.extra_info
            .lock()
            .expect("info lock poisoned")
            .insert(key.into(), value);
    }

    pub fn uptime(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn presence_key(&self) -> String {
        keys::presence(&self.site, &self.worker_type, &self.id)
    }

    /// The JSON document advertised under the presence key.
    pub fn info_document(&self) -> Value {
        let mut doc = Map::new();
        doc.insert("site".into(), json!(self.site));
        doc.insert("id".into(), json!(self.id));
        doc.insert("type".into(), json!(self.behavior_name));
        doc.insert("worker".into(), json!(self.worker_type));
        doc.insert("uptime".into(), json!(self.uptime()));
        doc.insert("path".into(), json!(self.worker_path.display().to_string()));
        doc.insert("spawner".into(), json!(self.spawner()));
        doc.insert(
            "cwd".into(),
            json!(std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_default()),
        );
        doc.insert(
            "username".into(),
            json!(std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .ok()),
        );
        doc.insert("interval".into(), json!(self.interval));
        doc.insert(
            "logs".into(),
            json!(self.log_files.lock().expect("log files lock poisoned").clone()),
        );
        doc.insert("files".into(), json!(self.files));
        for (key, value) in self.extra_info.lock().expect("info lock poisoned").iter() {
            doc.insert(key.clone(), value.clone());
        }
        Value::Object(doc)
    }

    /// Rewrite the discovery hash entry and the presence key with a fresh
    /// TTL.
    pub async fn update_presence(&self) -> Result<()> {
        let key = self.presence_key();
        let info = serde_json::to_string(&self.info_document())?;
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(keys::WORKERS_HASH, &key, &self.id)
            .await?;
        conn.set_ex::<_, _, ()>(&key, info, PRESENCE_TTL_SECS).await?;
        Ok(())
    }
}

/// A running worker instance.
pub struct Worker {
    handle: WorkerHandle,
    behavior: Box<dyn WorkerBehavior>,
    registry: CommandRegistry,
    monitor: Monitor,
    subscription: Subscription,
    conn: MultiplexedConnection,
    log_handler: Option<LogHandler>,
    last_tick: Instant,
    last_maintenance: Instant,
    tick_count: u64,
    presence_removed: bool,
}

impl Worker {
    /// Connect the worker: open its connections, start the monitor on the
    /// direct and group queues, subscribe to the site broadcast channel and
    /// build the command registry.
    pub async fn new(
        config: WorkerConfig,
        behavior: Box<dyn WorkerBehavior>,
        client: redis::Client,
    ) -> Result<Self> {
        let id = config.worker_id.clone().unwrap_or_else(generate_worker_id);
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis")?;

        let handle = WorkerHandle {
            id: id.clone(),
            site: config.site.clone(),
            worker_type: config.worker_type.clone(),
            behavior_name: behavior.name().to_string(),
            worker_path: config.worker_path.clone(),
            interval: config.worker_interval,
            allow_downloads: behavior.allow_downloads(),
            files: behavior.files(),
            started: Instant::now(),
            active: Arc::new(AtomicBool::new(true)),
            spawner: Arc::new(Mutex::new(config.spawner.clone())),
            commands: Arc::new(Mutex::new(Vec::new())),
            log_files: Arc::new(Mutex::new(Vec::new())),
            extra_info: Arc::new(Mutex::new(behavior.info())),
            conn: conn.clone(),
        };

        let monitor = Monitor::start(client.clone()).await?;
        monitor.add_queue(keys::direct(&id));
        monitor.add_queue(keys::group(&config.site, &config.worker_type));

        let subscription = Subscription::connect(
            client.clone(),
            vec![keys::broadcast_channel(&config.site)],
        )
        .await?;

        let mut registry = CommandRegistry::new();
        register_builtins(&mut registry);
        behavior.register_commands(&mut registry);
        handle.set_commands(registry.names());

        Ok(Self {
            handle,
            behavior,
            registry,
            monitor,
            subscription,
            conn,
            log_handler: None,
            last_tick: Instant::now(),
            last_maintenance: Instant::now(),
            tick_count: 0,
            presence_removed: false,
        })
    }

    pub fn handle(&self) -> &WorkerHandle {
        &self.handle
    }

    /// Attach the Redis log sink refreshed by the maintenance tick.
    pub fn set_log_handler(&mut self, log_handler: LogHandler) {
        self.log_handler = Some(log_handler);
    }

    /// Run the worker until it is stopped, interrupted or fails.
    ///
    /// Teardown (presence removal, behavior shutdown) runs on every exit
    /// path exactly once.
    pub async fn run(&mut self) -> Result<()> {
        let interrupt = {
            let handle = self.handle.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupted via keyboard");
                    handle.deactivate();
                }
            })
        };

        let result = self.run_loop().await;
        interrupt.abort();

        if let Err(e) = &result {
            error!("Worker execution failed: {:#}", e);
        }
        info!("worker_shutdown");
        self.remove_presence().await;
        if let Err(e) = self.behavior.shutdown(&self.handle).await {
            error!("worker shutdown hook failed: {:#}", e);
        }
        self.monitor.stop();
        result
    }

    async fn run_loop(&mut self) -> Result<()> {
        self.behavior
            .startup(&self.handle)
            .await
            .context("worker_startup failed")?;

        self.last_tick = Instant::now();
        // Backdated so the first loop iteration runs a full maintenance pass
        // and discovery sees the worker without waiting out the interval.
        self.last_maintenance = Instant::now()
            .checked_sub(MAINTENANCE_INTERVAL)
            .unwrap_or_else(Instant::now);
        info!("worker_startup complete");

        while self.handle.is_active() && self.monitor.is_active() {
            self.loop_inner().await?;
        }
        Ok(())
    }

    async fn loop_inner(&mut self) -> Result<()> {
        let now = Instant::now();
        let elapsed = now - self.last_tick;
        self.last_tick = now;

        self.read_direct_messages().await;
        self.read_broadcast_messages().await;
        self.behavior.tick(&self.handle, elapsed).await?;
        self.tick_count += 1;

        let interval = Duration::from_secs_f64(self.handle.interval);
        if interval > elapsed {
            tokio::time::sleep(interval - elapsed).await;
        }

        if now.duration_since(self.last_maintenance) > MAINTENANCE_INTERVAL {
            if let Some(log_handler) = &self.log_handler {
                if let Err(e) = log_handler.refresh_ttl().await {
                    warn!("failed to refresh log sink ttl: {}", e);
                }
            }
            if let Err(e) = self.handle.update_presence().await {
                warn!("failed to update presence: {}", e);
            }
            let window = now.duration_since(self.last_maintenance).as_secs_f64();
            debug!("tick rate {:.3}", self.tick_count as f64 / window);
            self.tick_count = 0;
            self.last_maintenance = Instant::now();
        }
        Ok(())
    }

    /// Drain everything the monitor has buffered.
    async fn read_direct_messages(&mut self) {
        loop {
            let Some(envelope) = self.monitor.pop() else {
                break;
            };
            self.process_message(envelope).await;
        }
    }

    /// Drain pending site broadcasts.
    async fn read_broadcast_messages(&mut self) {
        loop {
            let Some(envelope) = self.subscription.get_message().await else {
                break;
            };
            self.process_message(envelope).await;
        }
    }

    /// Dispatch one envelope to its command handler.
    ///
    /// Command-level failures are surfaced to the originator as failure
    /// replies, never as errors; a handler that completes without replying
    /// gets an auto-success so the caller's wait loop always observes one
    /// terminal reply.
    async fn process_message(&self, envelope: Envelope) {
        let command = envelope.command.clone().unwrap_or_default();
        debug!("calling command {} on {}", command, self.handle.id);

        let client = Client::new(self.conn.clone(), self.handle.site.clone());
        let mut ctx = CommandContext::new(
            client,
            self.handle.id.clone(),
            envelope.correlation.clone(),
            envelope.data.clone(),
        );

        let Some(handler) = self.registry.get(&command) else {
            let msg = unknown_command_message(&command, &self.handle.behavior_name);
            error!("{}", msg);
            error!("Message failed: {:?}", envelope);
            if !ctx.did_reply() {
                if let Err(e) = ctx.reply_failure(&msg).await {
                    error!("failed to push failure reply: {:#}", e);
                }
            }
            return;
        };

        match handler(&mut ctx, &self.handle).await {
            Ok(CommandReply::None) => {}
            Ok(CommandReply::Value(value)) => {
                if let Err(e) = ctx.reply(ReplyPayload::Value(value)).await {
                    error!("failed to push reply: {:#}", e);
                }
            }
            Ok(CommandReply::Stream(stream)) => {
                if let Err(e) = ctx.reply(ReplyPayload::Stream(stream)).await {
                    error!("failed to push streamed reply: {:#}", e);
                }
            }
            Err(e) => {
                let msg = handler_error_message(&command, &self.handle.behavior_name, &e);
                error!("{}", msg);
                error!("Message failed: {:?}", envelope);
                if !ctx.did_reply() {
                    if let Err(e) = ctx.reply_failure(&msg).await {
                        error!("failed to push failure reply: {:#}", e);
                    }
                }
                return;
            }
        }

        if !ctx.did_reply() {
            if let Err(e) = ctx.reply_success("OK").await {
                error!("failed to push auto-success reply: {:#}", e);
            }
        }
    }

    /// Remove the discovery hash entry and the presence key. Idempotent.
    async fn remove_presence(&mut self) {
        if self.presence_removed {
            return;
        }
        self.presence_removed = true;

        let key = self.handle.presence_key();
        let mut conn = self.conn.clone();
        let removal = async {
            conn.hdel::<_, _, ()>(keys::WORKERS_HASH, &key).await?;
            conn.del::<_, ()>(&key).await?;
            anyhow::Ok(())
        };
        if let Err(e) = removal.await {
            error!("Failed to remove worker info key {}: {}", key, e);
        }
    }
}

fn register_builtins(registry: &mut CommandRegistry) {
    registry.register("info", cmd_info);
    registry.register("stop", cmd_stop);
    registry.register("ping", cmd_ping);
    registry.register("download", cmd_download);
    registry.register("download_dir", cmd_download_dir);
    registry.register("update_spawner", cmd_update_spawner);
}

/// Reply with the presence info document extended with the command list.
fn cmd_info<'a>(_ctx: &'a mut CommandContext, worker: &'a WorkerHandle) -> CommandFuture<'a> {
    Box::pin(async move {
        let mut info = worker.info_document();
        if let Value::Object(doc) = &mut info {
            doc.insert("commands".into(), json!(worker.commands()));
            doc.insert("success".into(), json!(true));
        }
        Ok(CommandReply::Value(info))
    })
}

/// Reply success, then stop the worker loop.
fn cmd_stop<'a>(ctx: &'a mut CommandContext, worker: &'a WorkerHandle) -> CommandFuture<'a> {
    Box::pin(async move {
        ctx.reply_success("OK").await?;
        worker.deactivate();
        Ok(CommandReply::None)
    })
}

/// Echo the request payload back.
fn cmd_ping<'a>(ctx: &'a mut CommandContext, _worker: &'a WorkerHandle) -> CommandFuture<'a> {
    Box::pin(async move {
        info!("received ping with data {}", ctx.data);
        Ok(CommandReply::Value(ctx.data.clone()))
    })
}

fn cmd_download<'a>(ctx: &'a mut CommandContext, worker: &'a WorkerHandle) -> CommandFuture<'a> {
    Box::pin(async move {
        if !worker.allow_downloads() {
            ctx.reply_failure("Downloads disabled for this worker").await?;
            return Ok(CommandReply::None);
        }
        let full_path = worker.worker_path.join(ctx.data.as_str().unwrap_or_default());
        info!("Beginning download for {}", full_path.display());
        Ok(CommandReply::Stream(transfer::chunk_file(&full_path)?))
    })
}

fn cmd_download_dir<'a>(ctx: &'a mut CommandContext, worker: &'a WorkerHandle) -> CommandFuture<'a> {
    Box::pin(async move {
        if !worker.allow_downloads() {
            ctx.reply_failure("Downloads disabled for this worker").await?;
            return Ok(CommandReply::None);
        }
        let full_path = worker.worker_path.join(ctx.data.as_str().unwrap_or_default());
        info!(
            "Beginning directory compressed download for {}",
            full_path.display()
        );
        Ok(CommandReply::Stream(transfer::compress_and_chunk(&full_path)?))
    })
}

/// Replace the stored spawner id and refresh the presence record.
fn cmd_update_spawner<'a>(
    ctx: &'a mut CommandContext,
    worker: &'a WorkerHandle,
) -> CommandFuture<'a> {
    Box::pin(async move {
        worker.set_spawner(ctx.data.as_str().map(str::to_string));
        worker.update_presence().await?;
        ctx.reply_success("OK").await?;
        Ok(CommandReply::None)
    })
}

fn unknown_command_message(command: &str, behavior_name: &str) -> String {
    format!(
        "Unknown command function 'cmd_{}' for worker '{}' (no handler registered)",
        command, behavior_name
    )
}

fn handler_error_message(command: &str, behavior_name: &str, err: &anyhow::Error) -> String {
    format!(
        "An exception occurred while executing command function 'cmd_{}' for worker '{}' - {:#}",
        command, behavior_name, err
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_worker_id_shape() {
        let id = generate_worker_id();
        let (host, pid, uid) = parse_worker_id(&id).unwrap();
        assert!(!host.is_empty());
        assert_eq!(pid, std::process::id());
        assert!(!uid.is_empty());
        assert_ne!(id, generate_worker_id());
    }

    #[test]
    fn test_parse_worker_id_rejects_garbage() {
        assert!(parse_worker_id("only-one-part").is_none());
        assert!(parse_worker_id("host:notapid:uid").is_none());
    }

    #[test]
    fn test_unknown_command_message_prefix() {
        let msg = unknown_command_message("no_such", "Echo");
        assert!(msg.starts_with("Unknown command function 'cmd_no_such'"));
        assert!(msg.contains("Echo"));
    }

    #[test]
    fn test_handler_error_message_carries_chain() {
        let err = anyhow::anyhow!("root cause").context("outer");
        let msg = handler_error_message("ping", "Echo", &err);
        assert!(msg.contains("cmd_ping"));
        assert!(msg.contains("outer"));
        assert!(msg.contains("root cause"));
    }

    #[test]
    fn test_builtin_registry_names() {
        let mut registry = CommandRegistry::new();
        register_builtins(&mut registry);
        assert_eq!(
            registry.names(),
            vec![
                "download".to_string(),
                "download_dir".to_string(),
                "info".to_string(),
                "ping".to_string(),
                "stop".to_string(),
                "update_spawner".to_string(),
            ]
        );
    }
}
