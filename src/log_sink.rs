//! Ships log records to a capped, TTL-refreshed Redis list.
//!
//! A `tracing` layer forwards records at INFO and above over a channel to a
//! background task that pushes them onto `logs:<type>:<id>`, keeping only
//! the most recent entries. The worker's maintenance tick keeps the key
//! alive through `refresh_ttl` while the worker runs.

use anyhow::Result;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::queue::Queue;

/// Log sink keys live for one day unless refreshed.
const LOG_TTL_SECS: i64 = 60 * 60 * 24;

/// Only the most recent entries are retained.
const LOG_MAX_ELEMENTS: isize = 200;

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

#[derive(Debug, Serialize)]
struct LogRecord {
    time: String,
    worker_id: String,
    message: String,
    target: String,
    line: Option<u32>,
    level: String,
}

/// Handle to one worker's Redis log sink.
pub struct LogHandler {
    key: String,
    conn: MultiplexedConnection,
    tx: mpsc::UnboundedSender<LogRecord>,
    worker_id: String,
    task: JoinHandle<()>,
}

impl LogHandler {
    pub fn new(key: impl Into<String>, worker_id: impl Into<String>, conn: MultiplexedConnection) -> Self {
        let key = key.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(forward_records(Queue::new(key.clone(), conn.clone()), rx));
        Self {
            key,
            conn,
            tx,
            worker_id: worker_id.into(),
            task,
        }
    }

    /// The `tracing` layer feeding this sink.
    pub fn layer(&self) -> RedisLogLayer {
        RedisLogLayer {
            tx: self.tx.clone(),
            worker_id: self.worker_id.clone(),
        }
    }

    /// Keep the sink key alive for another TTL window.
    pub async fn refresh_ttl(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(&self.key, LOG_TTL_SECS).await?;
        Ok(())
    }
}

impl Drop for LogHandler {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn forward_records(mut queue: Queue, mut rx: mpsc::UnboundedReceiver<LogRecord>) {
    while let Some(record) = rx.recv().await {
        if let Err(e) = queue
            .push_constrained(&record, LOG_TTL_SECS, -LOG_MAX_ELEMENTS, -1)
            .await
        {
            // The layer skips this module's own events, so this cannot loop
            // back through the sink.
            tracing::warn!("failed to ship log record to {}: {}", queue.name(), e);
        }
    }
}

/// `tracing` layer that forwards INFO+ events to the sink channel.
pub struct RedisLogLayer {
    tx: mpsc::UnboundedSender<LogRecord>,
    worker_id: String,
}

impl<S: Subscriber> Layer<S> for RedisLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > Level::INFO || metadata.target().starts_with("redisbus::log_sink")
        {
            return;
        }

        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);

        let record = LogRecord {
            time: Utc::now().format(ISO_FORMAT).to_string(),
            worker_id: self.worker_id.clone(),
            message: visitor.0,
            target: metadata.target().to_string(),
            line: metadata.line(),
            level: metadata.level().to_string(),
        };
        let _ = self.tx.send(record);
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{:?}", value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.0 = value.to_string();
        }
    }
}
