//! Pub/sub channel binding with auto-reconnect on transport failure.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use tracing::{error, warn};

use crate::envelope::Envelope;

/// How long `get_message` waits for a pending frame before reporting none.
const POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Reconnect-and-resubscribe attempts before a read gives up.
const MAX_RETRIES: u32 = 3;

/// A pub/sub binding to a fixed set of channels.
///
/// Subscription acknowledgements never surface here; the message stream only
/// yields payload frames.
pub struct Subscription {
    client: redis::Client,
    channel_names: Vec<String>,
    pubsub: redis::aio::PubSub,
}

impl Subscription {
    pub async fn connect(client: redis::Client, channel_names: Vec<String>) -> Result<Self> {
        let pubsub = establish(&client, &channel_names).await?;
        Ok(Self {
            client,
            channel_names,
            pubsub,
        })
    }

    /// Next pending envelope, or `None` when nothing is waiting.
    ///
    /// A closed message stream means the transport dropped; up to three
    /// reconnect-and-resubscribe attempts are made before giving up.
    /// Malformed payloads are logged and dropped.
    pub async fn get_message(&mut self) -> Option<Envelope> {
        let mut retry = 0;
        while retry < MAX_RETRIES {
            let next = tokio::time::timeout(POLL_TIMEOUT, self.pubsub.on_message().next()).await;
            match next {
                // Nothing pending.
                Err(_) => return None,
                Ok(Some(msg)) => {
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            error!("broadcast payload was not a string: {}", e);
                            return None;
                        }
                    };
                    match serde_json::from_str::<Envelope>(&payload) {
                        Ok(envelope) => return Some(envelope),
                        Err(e) => {
                            error!("Decode failed for {} ({})", payload, e);
                            return None;
                        }
                    }
                }
                // Stream ended: the connection is gone.
                Ok(None) => {
                    warn!("pub/sub connection lost, resubscribing...");
                    match establish(&self.client, &self.channel_names).await {
                        Ok(pubsub) => self.pubsub = pubsub,
                        Err(e) => warn!("pub/sub reconnect failed: {}", e),
                    }
                    retry += 1;
                }
            }
        }
        None
    }

    pub async fn unsubscribe(&mut self) -> Result<()> {
        self.pubsub
            .unsubscribe(&self.channel_names)
            .await
            .context("Failed to unsubscribe")?;
        Ok(())
    }
}

async fn establish(
    client: &redis::Client,
    channel_names: &[String],
) -> Result<redis::aio::PubSub> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .context("Failed to get pub/sub connection")?;
    for channel in channel_names {
        pubsub
            .subscribe(channel)
            .await
            .with_context(|| format!("Failed to subscribe to channel: {}", channel))?;
    }
    Ok(pubsub)
}
