//! Background fan-in of multiple blocking Redis-list pops into one channel.
//!
//! Redis blocking pops cannot be cancelled cheaply, so a single background
//! task issues a bounded multi-key BRPOP against the registered queue names
//! and forwards decoded envelopes to the main task over a channel. One
//! blocking pop over all keys is cheaper than a connection per queue and
//! keeps fairness across sources.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::envelope::Envelope;

/// Timeout for each blocking multi-key pop.
const POP_TIMEOUT_SECS: f64 = 3.0;

/// Sleep while no queue names are registered yet.
const IDLE_SLEEP: Duration = Duration::from_millis(200);

/// Consecutive reconnect attempts before the monitor gives up.
const MAX_RECONNECTS: u32 = 3;

/// Monitors a set of request queues from a background task.
pub struct Monitor {
    queue_names: Arc<Mutex<Vec<String>>>,
    active: Arc<AtomicBool>,
    rx: mpsc::UnboundedReceiver<Envelope>,
    handle: JoinHandle<()>,
}

impl Monitor {
    /// Connect and start the background pop loop.
    pub async fn start(client: redis::Client) -> Result<Self> {
        let conn = client.get_multiplexed_async_connection().await?;
        let queue_names = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(pop_loop(
            client,
            conn,
            queue_names.clone(),
            active.clone(),
            tx,
        ));

        Ok(Self {
            queue_names,
            active,
            rx,
            handle,
        })
    }

    /// Register another queue name; takes effect on the next pop cycle.
    pub fn add_queue(&self, queue_name: impl Into<String>) {
        self.queue_names
            .lock()
            .expect("queue name lock poisoned")
            .push(queue_name.into());
    }

    /// Next buffered envelope, if any. Never blocks.
    pub fn pop(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// False once the background loop has stopped or lost its connection
    /// beyond repair.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Ask the background loop to exit at its next timeout.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        self.handle.abort();
    }
}

async fn pop_loop(
    client: redis::Client,
    mut conn: MultiplexedConnection,
    queue_names: Arc<Mutex<Vec<String>>>,
    active: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Envelope>,
) {
    let mut failures = 0u32;

    while active.load(Ordering::SeqCst) {
        let names: Vec<String> = queue_names
            .lock()
            .expect("queue name lock poisoned")
            .clone();

        if names.is_empty() {
            tokio::time::sleep(IDLE_SLEEP).await;
            continue;
        }

        match conn
            .brpop::<_, Option<(String, String)>>(&names, POP_TIMEOUT_SECS)
            .await
        {
            Ok(Some((queue, raw))) => {
                failures = 0;
                match serde_json::from_str::<Envelope>(&raw) {
                    Ok(envelope) => {
                        debug!("monitor popped message from {}", queue);
                        if tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("monitor dropped undecodable message on {}: {}", queue, e),
                }
            }
            Ok(None) => {
                failures = 0;
            }
            Err(e) => {
                failures += 1;
                warn!(
                    "monitor BRPOP failed ({}/{}): {}. Reconnecting...",
                    failures, MAX_RECONNECTS, e
                );
                if failures >= MAX_RECONNECTS {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(3)).await;
                match client.get_multiplexed_async_connection().await {
                    Ok(new_conn) => conn = new_conn,
                    Err(e) => warn!("monitor reconnect failed: {}", e),
                }
            }
        }
    }

    active.store(false, Ordering::SeqCst);
}
