//! Client-side RPC: request issuance across the four addressing modes and
//! reply collection with stream framing.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::envelope::{correlation_id, Envelope};
use crate::keys;
use crate::queue::Queue;

/// Request and single-shot reply keys live this long unless refreshed.
pub const DEFAULT_COMMAND_TTL: i64 = 10;

/// Blocking wait per pop while collecting replies.
const REPLY_POLL_SECS: f64 = 1.0;

/// A lazily produced sequence of reply elements.
///
/// An `Err` item aborts the stream; the consumer pushes a failure envelope
/// in place of the terminator.
pub type ReplyStream = Box<dyn Iterator<Item = Result<Value>> + Send>;

/// Payload for a reply: one value, or a lazy sequence framed with the
/// stream counter.
pub enum ReplyPayload {
    Value(Value),
    Stream(ReplyStream),
}

impl From<Value> for ReplyPayload {
    fn from(value: Value) -> Self {
        ReplyPayload::Value(value)
    }
}

/// Issues requests onto the bus and writes replies back to callers.
#[derive(Clone)]
pub struct Client {
    conn: MultiplexedConnection,
    site: String,
    command_ttl: i64,
}

impl Client {
    pub fn new(conn: MultiplexedConnection, site: impl Into<String>) -> Self {
        Self {
            conn,
            site: site.into(),
            command_ttl: DEFAULT_COMMAND_TTL,
        }
    }

    pub fn with_command_ttl(mut self, command_ttl: i64) -> Self {
        self.command_ttl = command_ttl;
        self
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    /// Request to one worker. Exactly one reply is expected.
    pub async fn call_direct(
        &mut self,
        src_id: &str,
        dst_id: &str,
        command: &str,
        data: Value,
    ) -> Result<(Queue, Option<usize>)> {
        let cid = correlation_id('c');
        let queue = self
            .call(src_id, &keys::direct(dst_id), command, data, &cid)
            .await?;
        Ok((queue, Some(1)))
    }

    /// Request to one worker type within this site. One worker of the group
    /// takes the message, so exactly one reply is expected.
    pub async fn call_group(
        &mut self,
        src_id: &str,
        worker_type: &str,
        command: &str,
        data: Value,
    ) -> Result<(Queue, Option<usize>)> {
        let cid = correlation_id('c');
        let key = keys::group(&self.site, worker_type);
        let queue = self.call(src_id, &key, command, data, &cid).await?;
        Ok((queue, Some(1)))
    }

    /// Site-wide broadcast over pub/sub. The number of repliers is unknown.
    pub async fn broadcast(
        &mut self,
        src_id: &str,
        command: &str,
        data: Value,
    ) -> Result<(Queue, Option<usize>)> {
        let cid = correlation_id('b');
        info!(
            "broadcast({}), data: '{}', correlation '{}'",
            command, data, cid
        );

        let envelope = Envelope::request(command, src_id, &cid, data);
        let channel = keys::broadcast_channel(&self.site);
        self.conn
            .publish::<_, _, ()>(&channel, serde_json::to_string(&envelope)?)
            .await
            .with_context(|| format!("Failed to publish on {}", channel))?;
        Ok((Queue::new(keys::reply(&cid), self.conn.clone()), None))
    }

    /// Read the discovery hash: presence key to worker id for every worker
    /// that has registered (live entries only survive their presence TTL).
    pub async fn list_workers(&mut self) -> Result<HashMap<String, String>> {
        let workers: HashMap<String, String> = self
            .conn
            .hgetall(keys::WORKERS_HASH)
            .await
            .context("Failed to read the workers hash")?;
        Ok(workers)
    }

    /// Pattern-matched multicast: scan presence keys and push one direct
    /// request per discovered worker, all sharing one correlation id.
    ///
    /// `/` separates alternative glob patterns; discovered worker ids are
    /// de-duplicated across alternatives.
    pub async fn multicast(
        &mut self,
        src_id: &str,
        pattern: &str,
        command: &str,
        data: Value,
    ) -> Result<(Queue, Option<usize>)> {
        let cid = correlation_id('m');
        info!("multicast({}), pattern: '{}'", command, pattern);

        let mut discovered = BTreeSet::new();
        for variant in pattern_variants(pattern) {
            let scan_pattern = keys::presence_pattern(&self.site, &variant);
            let mut cursor: u64 = 0;
            loop {
                let (next, found): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&scan_pattern)
                    .query_async(&mut self.conn)
                    .await
                    .context("Failed to scan presence keys")?;
                for presence_key in found {
                    if let Some(worker_id) = keys::worker_id_from_presence(&presence_key) {
                        discovered.insert(worker_id);
                    }
                }
                cursor = next;
                if cursor == 0 {
                    break;
                }
            }
        }

        let count = discovered.len();
        for worker_id in discovered {
            debug!("multicasting to {}", worker_id);
            self.call(src_id, &keys::direct(&worker_id), command, data.clone(), &cid)
                .await?;
        }
        Ok((Queue::new(keys::reply(&cid), self.conn.clone()), Some(count)))
    }

    /// Push a request envelope onto `key`, refresh its TTL and hand back the
    /// reply queue for the correlation.
    async fn call(
        &mut self,
        src_id: &str,
        key: &str,
        command: &str,
        data: Value,
        correlation: &str,
    ) -> Result<Queue> {
        info!(
            "call({}), key: '{}', data: '{}', correlation: '{}'",
            command, key, data, correlation
        );
        let mut queue = Queue::new(key, self.conn.clone());
        queue
            .push(&Envelope::request(command, src_id, correlation, data))
            .await?;
        queue.expire(self.command_ttl).await?;
        Ok(Queue::new(keys::reply(correlation), self.conn.clone()))
    }

    /// Write a reply for `correlation` onto its reply queue.
    ///
    /// A value becomes one single-shot envelope. A stream becomes one
    /// envelope per element with a monotonically increasing counter, closed
    /// by a terminator; the reply key's TTL grows with the element count. If
    /// the stream fails mid-iteration a failure envelope is pushed in place
    /// of the terminator.
    pub async fn reply(
        &mut self,
        src_id: &str,
        correlation: &str,
        payload: ReplyPayload,
    ) -> Result<()> {
        let mut reply_queue = Queue::new(keys::reply(correlation), self.conn.clone());
        match payload {
            ReplyPayload::Value(value) => {
                reply_queue
                    .push(&Envelope::reply(src_id, correlation, value))
                    .await?;
                reply_queue.expire(self.command_ttl).await?;
            }
            ReplyPayload::Stream(elements) => {
                let mut count: i64 = 0;
                for element in elements {
                    match element {
                        Ok(value) => {
                            reply_queue
                                .push(&Envelope::stream_element(src_id, correlation, value, count))
                                .await?;
                            count += 1;
                        }
                        Err(e) => {
                            let msg = format!(
                                "An exception occurred while replying to correlation {} - {:#}",
                                correlation, e
                            );
                            error!("{}", msg);
                            reply_queue
                                .push(&Envelope::reply(
                                    src_id,
                                    correlation,
                                    json!({"success": false, "msg": msg}),
                                ))
                                .await?;
                            reply_queue.expire(self.command_ttl).await?;
                            return Ok(());
                        }
                    }
                }
                reply_queue
                    .push(&Envelope::stream_terminator(src_id, correlation))
                    .await?;
                reply_queue
                    .expire((self.command_ttl * count).max(300))
                    .await?;
            }
        }
        Ok(())
    }
}

/// Arguments for one RPC issued from the CLI or another non-worker caller.
pub struct RpcRequest {
    pub call: String,
    pub data: Value,
    pub worker_id: Option<String>,
    pub worker_type: Option<String>,
    pub multicast: Option<String>,
    pub wait: f64,
}

/// Issue the request on the most specific addressing mode provided and
/// collect replies until the deadline, the expected reply count or a stream
/// terminator.
pub async fn perform_rpc(client: &mut Client, request: &RpcRequest) -> Result<Vec<Envelope>> {
    // Not originating from a worker.
    let src_id = "";

    let (mut reply_queue, wait_count) = if let Some(worker_id) = &request.worker_id {
        client
            .call_direct(src_id, worker_id, &request.call, request.data.clone())
            .await?
    } else if let Some(pattern) = &request.multicast {
        client
            .multicast(src_id, pattern, &request.call, request.data.clone())
            .await?
    } else if let Some(worker_type) = &request.worker_type {
        client
            .call_group(src_id, worker_type, &request.call, request.data.clone())
            .await?
    } else {
        client
            .broadcast(src_id, &request.call, request.data.clone())
            .await?
    };

    collect_replies(&mut reply_queue, request.wait, wait_count).await
}

/// Drain reply envelopes from `queue` until a termination condition.
///
/// The deadline is only enforced on empty pops; a mid-stream element skips
/// the reply-count check because more elements are coming.
pub async fn collect_replies(
    queue: &mut Queue,
    wait_seconds: f64,
    wait_count: Option<usize>,
) -> Result<Vec<Envelope>> {
    let deadline = Instant::now() + Duration::from_secs_f64(wait_seconds.max(0.0));
    let mut replies = Vec::new();

    loop {
        match queue.pop::<Envelope>(REPLY_POLL_SECS).await {
            Some(envelope) => {
                replies.push(envelope);
                if collection_done(replies.last(), replies.len(), wait_count) {
                    break;
                }
            }
            None => {
                if !queue.is_active() || Instant::now() >= deadline {
                    break;
                }
                if collection_done(None, replies.len(), wait_count) {
                    break;
                }
            }
        }
    }

    if replies.is_empty() {
        error!("failed to receive reply in {:.1} seconds", wait_seconds);
    } else {
        info!("received {} replies for {}", replies.len(), queue.name());
    }
    Ok(replies)
}

/// Decide whether collection is finished after one pop.
///
/// `delivered` is the envelope just popped, or `None` for an empty pop. A
/// terminator always finishes; a mid-stream element never does, because more
/// elements are coming for that responder and the reply count must not be
/// compared against `wait_count` yet.
fn collection_done(
    delivered: Option<&Envelope>,
    reply_count: usize,
    wait_count: Option<usize>,
) -> bool {
    if let Some(envelope) = delivered {
        if envelope.is_stream_terminator() {
            return true;
        }
        if envelope.is_stream_element() {
            return false;
        }
    }
    wait_count == Some(reply_count)
}

fn pattern_variants(pattern: &str) -> Vec<String> {
    pattern
        .split('/')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply_env(data: Value, stream: Option<i64>) -> Envelope {
        Envelope {
            command: None,
            origin: "w".into(),
            correlation: Some("c:1".into()),
            data,
            stream,
        }
    }

    #[test]
    fn test_single_shot_stops_at_wait_count() {
        let env = reply_env(json!({"hello": "world"}), None);
        assert!(collection_done(Some(&env), 1, Some(1)));
        assert!(!collection_done(Some(&env), 1, Some(3)));
        assert!(!collection_done(Some(&env), 1, None));
    }

    #[test]
    fn test_stream_elements_defer_wait_count() {
        // A four-element stream addressed to one worker: the element with
        // index 0 must not trip the wait_count == 1 check.
        for (i, z) in [0i64, 1, 2, 3].iter().enumerate() {
            let env = reply_env(json!(z + 1), Some(*z));
            assert!(!collection_done(Some(&env), i + 1, Some(1)));
        }
        let term = reply_env(Value::Null, Some(-1));
        assert!(collection_done(Some(&term), 5, Some(1)));
    }

    #[test]
    fn test_terminator_stops_without_wait_count() {
        let term = reply_env(Value::Null, Some(-1));
        assert!(collection_done(Some(&term), 3, None));
    }

    #[test]
    fn test_empty_pop_satisfies_zero_wait_count() {
        // A multicast that matched no workers finishes without waiting out
        // the full deadline.
        assert!(collection_done(None, 0, Some(0)));
        assert!(!collection_done(None, 0, Some(2)));
        assert!(!collection_done(None, 0, None));
    }

    #[test]
    fn test_pattern_variants_split_on_slash() {
        assert_eq!(
            pattern_variants("10.130.*/10.130.10.13:*"),
            vec!["10.130.*".to_string(), "10.130.10.13:*".to_string()]
        );
        assert_eq!(pattern_variants("*"), vec!["*".to_string()]);
        assert_eq!(pattern_variants("a//b"), vec!["a".to_string(), "b".to_string()]);
    }
}
