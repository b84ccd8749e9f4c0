//! Wire envelope exchanged between clients and workers.
//!
//! Envelopes are JSON objects with single-letter field names for compactness.
//! Unknown fields are ignored on decode; a missing payload means null and a
//! missing stream counter means a single-shot message.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Stream counter value marking the end of a streamed reply.
pub const STREAM_END: i64 = -1;

/// One message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Command name. Absent on replies.
    #[serde(rename = "x", default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Origin worker id, empty when the sender is not a worker.
    #[serde(rename = "i", default)]
    pub origin: String,

    /// Correlation id naming the reply queue for this conversation.
    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<String>,

    /// Data payload.
    #[serde(rename = "d", default)]
    pub data: Value,

    /// Stream counter: element index during a stream, -1 for the
    /// terminator, absent for a single-shot message.
    #[serde(rename = "z", default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<i64>,
}

impl Envelope {
    /// Build a request envelope for `command`.
    pub fn request(command: &str, origin: &str, correlation: &str, data: Value) -> Self {
        Self {
            command: Some(command.to_string()),
            origin: origin.to_string(),
            correlation: Some(correlation.to_string()),
            data,
            stream: None,
        }
    }

    /// Build a single-shot reply envelope.
    pub fn reply(origin: &str, correlation: &str, data: Value) -> Self {
        Self {
            command: None,
            origin: origin.to_string(),
            correlation: Some(correlation.to_string()),
            data,
            stream: None,
        }
    }

    /// Build the `index`-th element of a streamed reply.
    pub fn stream_element(origin: &str, correlation: &str, data: Value, index: i64) -> Self {
        Self {
            stream: Some(index),
            ..Self::reply(origin, correlation, data)
        }
    }

    /// Build the terminator envelope closing a streamed reply.
    pub fn stream_terminator(origin: &str, correlation: &str) -> Self {
        Self {
            stream: Some(STREAM_END),
            ..Self::reply(origin, correlation, Value::Null)
        }
    }

    /// True when this envelope is a mid-stream element (more to come).
    pub fn is_stream_element(&self) -> bool {
        matches!(self.stream, Some(z) if z >= 0)
    }

    /// True when this envelope terminates a streamed reply.
    pub fn is_stream_terminator(&self) -> bool {
        self.stream == Some(STREAM_END)
    }
}

/// Short suffix of a freshly generated UUID, unique enough within a TTL
/// window.
pub(crate) fn uid_tail() -> String {
    let id = Uuid::new_v4().to_string();
    id.rsplit('-').next().unwrap_or_default().to_string()
}

/// Generate a correlation id with a mode prefix (`c`, `b` or `m`) to aid
/// debugging.
pub fn correlation_id(prefix: char) -> String {
    format!("{}:{}", prefix, uid_tail())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_fields() {
        let env = Envelope::request("ping", "", "c:abc", json!({"hello": "world"}));
        let wire: Value = serde_json::from_str(&serde_json::to_string(&env).unwrap()).unwrap();
        assert_eq!(wire["x"], "ping");
        assert_eq!(wire["i"], "");
        assert_eq!(wire["c"], "c:abc");
        assert_eq!(wire["d"], json!({"hello": "world"}));
        assert!(wire.get("z").is_none());
    }

    #[test]
    fn test_reply_omits_command() {
        let env = Envelope::reply("10.0.0.1:42:abc", "c:abc", json!(1));
        let wire: Value = serde_json::from_str(&serde_json::to_string(&env).unwrap()).unwrap();
        assert!(wire.get("x").is_none());
        assert_eq!(wire["i"], "10.0.0.1:42:abc");
    }

    #[test]
    fn test_decode_defaults_and_unknown_fields() {
        let env: Envelope =
            serde_json::from_str(r#"{"x":"ping","c":"c:1","future_field":true}"#).unwrap();
        assert_eq!(env.command.as_deref(), Some("ping"));
        assert_eq!(env.data, Value::Null);
        assert_eq!(env.stream, None);
        assert_eq!(env.origin, "");
    }

    #[test]
    fn test_stream_markers() {
        let elem = Envelope::stream_element("w", "c:1", json!(3), 2);
        assert!(elem.is_stream_element());
        assert!(!elem.is_stream_terminator());

        let term = Envelope::stream_terminator("w", "c:1");
        assert!(term.is_stream_terminator());
        assert!(!term.is_stream_element());
        assert_eq!(term.data, Value::Null);
    }

    #[test]
    fn test_correlation_id_prefix() {
        let cid = correlation_id('m');
        assert!(cid.starts_with("m:"));
        assert!(cid.len() > 2);
        assert_ne!(correlation_id('c'), correlation_id('c'));
    }
}
