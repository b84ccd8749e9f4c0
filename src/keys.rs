//! Redis key and channel formats used across the bus.
//!
//! Every key the bus reads or writes is built here so that producers and
//! consumers (and in particular the presence write and delete paths) agree
//! byte-for-byte.

/// Hash mapping presence keys to worker ids for discovery.
pub const WORKERS_HASH: &str = "workers";

/// Request queue addressed to a single worker.
pub fn direct(worker_id: &str) -> String {
    format!("direct:{}", worker_id)
}

/// Request queue shared by all workers of one type within a site.
pub fn group(site: &str, worker_type: &str) -> String {
    format!("group:{}:{}", site, worker_type)
}

/// Reply queue for one correlation id.
pub fn reply(correlation: &str) -> String {
    format!("reply:{}", correlation)
}

/// Pub/sub channel for site-wide broadcast requests.
pub fn broadcast_channel(site: &str) -> String {
    format!("rpc:worker:{}", site)
}

/// TTL-bounded presence key advertising a live worker.
pub fn presence(site: &str, worker_type: &str, worker_id: &str) -> String {
    format!("worker:{}:{}:{}", site, worker_type, worker_id)
}

/// SCAN pattern matching presence keys for multicast resolution.
pub fn presence_pattern(site: &str, pattern: &str) -> String {
    format!("worker:{}:{}", site, pattern)
}

/// Log sink list for one worker.
pub fn log_sink(worker_type: &str, worker_id: &str) -> String {
    format!("logs:{}:{}", worker_type, worker_id)
}

/// Recover the worker id from a presence key.
///
/// Worker ids contain colons, so everything after the third segment belongs
/// to the id.
pub fn worker_id_from_presence(presence_key: &str) -> Option<String> {
    let parts: Vec<&str> = presence_key.split(':').collect();
    if parts.len() < 4 || parts[0] != "worker" {
        return None;
    }
    Some(parts[3..].join(":"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_formats() {
        assert_eq!(direct("10.0.0.1:42:abc"), "direct:10.0.0.1:42:abc");
        assert_eq!(group("test", "echo"), "group:test:echo");
        assert_eq!(reply("c:abc"), "reply:c:abc");
        assert_eq!(broadcast_channel("test"), "rpc:worker:test");
        assert_eq!(log_sink("echo", "10.0.0.1:42:abc"), "logs:echo:10.0.0.1:42:abc");
    }

    #[test]
    fn test_presence_roundtrip() {
        let id = "10.130.10.13:3124:9f3a1c0b7d2e";
        let key = presence("test", "echo", id);
        assert_eq!(key, "worker:test:echo:10.130.10.13:3124:9f3a1c0b7d2e");
        assert_eq!(worker_id_from_presence(&key).as_deref(), Some(id));
    }

    #[test]
    fn test_worker_id_from_presence_rejects_short_keys() {
        assert_eq!(worker_id_from_presence("worker:test:echo"), None);
        assert_eq!(worker_id_from_presence("group:test:echo:x"), None);
    }
}
