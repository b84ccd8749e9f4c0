//! Thin list abstraction over Redis with TTL, trim and blocking pop.

use anyhow::Result;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// Wrapper for one Redis list used as a mailbox.
///
/// A failed pop marks the queue inactive so its owner can detect transport
/// loss; decode failures are logged and swallowed so a malformed element on a
/// shared channel cannot kill a consumer.
pub struct Queue {
    name: String,
    conn: MultiplexedConnection,
    active: bool,
}

impl Queue {
    pub fn new(name: impl Into<String>, conn: MultiplexedConnection) -> Self {
        Self {
            name: name.into(),
            conn,
            active: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// False once a pop has failed at the transport level.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Append a JSON-encoded element to the right of the list.
    pub async fn push<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.conn.rpush::<_, _, ()>(&self.name, json).await?;
        Ok(())
    }

    /// Push, refresh the TTL and trim to a window, pipelined in one round
    /// trip (non-transactional).
    pub async fn push_constrained<T: Serialize>(
        &mut self,
        value: &T,
        ttl_seconds: i64,
        trim_start: isize,
        trim_end: isize,
    ) -> Result<()> {
        let json = serde_json::to_string(value)?;
        redis::pipe()
            .rpush(&self.name, json)
            .ignore()
            .expire(&self.name, ttl_seconds)
            .ignore()
            .ltrim(&self.name, trim_start, trim_end)
            .ignore()
            .query_async::<()>(&mut self.conn)
            .await?;
        Ok(())
    }

    /// Pop the next element from the left of the list.
    ///
    /// Blocks up to `wait_seconds` when positive, otherwise pops without
    /// blocking. Returns `None` on an empty list, on transport failure
    /// (marking the queue inactive) and on a decode failure.
    pub async fn pop<T: DeserializeOwned>(&mut self, wait_seconds: f64) -> Option<T> {
        let raw = if wait_seconds > 0.0 {
            match self
                .conn
                .blpop::<_, Option<(String, String)>>(&self.name, wait_seconds)
                .await
            {
                Ok(hit) => hit.map(|(_, value)| value),
                Err(e) => {
                    self.active = false;
                    warn!("Failed pop() with key {}: {}", self.name, e);
                    return None;
                }
            }
        } else {
            match self.conn.lpop::<_, Option<String>>(&self.name, None).await {
                Ok(hit) => hit,
                Err(e) => {
                    self.active = false;
                    warn!("Failed pop() with key {}: {}", self.name, e);
                    return None;
                }
            }
        };

        let raw = raw?;
        match serde_json::from_str(&raw) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!("Failed pop() while decoding message: {} ({})", e, raw);
                None
            }
        }
    }

    pub async fn len(&mut self) -> Result<usize> {
        Ok(self.conn.llen(&self.name).await?)
    }

    pub async fn expire(&mut self, seconds: i64) -> Result<()> {
        self.conn.expire::<_, ()>(&self.name, seconds).await?;
        Ok(())
    }

    /// Trim to a one-element range, then pop the survivor.
    pub async fn clear(&mut self) -> Result<()> {
        self.conn.ltrim::<_, ()>(&self.name, 0, 0).await?;
        self.conn.lpop::<_, Option<String>>(&self.name, None).await?;
        Ok(())
    }
}
