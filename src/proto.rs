//! Wire frames for the control-plane protocol.
//!
//! Framing is JSON over the WebSocket. Outbound traffic is always a
//! [`Msg`]; inbound frames come in three shapes, told apart by which
//! fields are present:
//!
//! ```text
//! reply          {"rid": "...", "result": {...}}
//! server action  {"realm": "machine", "action": "containers"}
//! pipe control   {"lid": "...", "event": "log", "filter": {...}}
//!                {"lid": "...", "close": true}
//! ```
//!
//! A frame that decodes but matches no shape is logged and dropped by the
//! reader; it is never fatal.

use serde::{Deserialize, Serialize};

/// Length of a request correlation id.
const RID_LEN: usize = 21;

/// An outbound request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Msg {
    /// Namespaced action, e.g. `machine.m1.containers`.
    pub action: String,
    /// Request parameters.
    pub params: serde_json::Value,
    /// Correlation id; the reply echoes it back.
    pub rid: String,
}

/// A reply to a prior outbound request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Reply {
    #[serde(default)]
    pub rid: String,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

/// Partial decode of any inbound frame, used only for shape routing.
///
/// The reader re-decodes the raw text with the shape-specific type once it
/// knows what it is looking at.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Incoming {
    pub realm: Option<String>,
    pub action: Option<String>,
    pub lid: Option<String>,
    pub close: Option<bool>,
    pub rid: Option<String>,
}

/// The three inbound frame shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Server-initiated action (`realm` + `action`, no `rid`).
    ServerAction,
    /// Pipe open or close (`lid`).
    PipeControl,
    /// Reply to an outbound request (`rid`).
    Reply,
    /// None of the above.
    Unknown,
}

impl Incoming {
    /// Classifies the frame. Server actions are checked first: they carry
    /// an `action` but never a `rid`, while replies carry a `rid` but
    /// never an `action`.
    pub fn shape(&self) -> Shape {
        if self.action.is_some() && self.rid.is_none() {
            Shape::ServerAction
        } else if self.lid.is_some() {
            Shape::PipeControl
        } else if self.rid.is_some() {
            Shape::Reply
        } else {
            Shape::Unknown
        }
    }
}

/// Generates a fresh correlation id.
///
/// 21 alphanumeric characters (62 symbols) give ~125 bits; collisions over
/// a connection's lifetime are not a practical concern, and the generator
/// is exercised against a million-id birthday check in the tests.
pub fn new_rid() -> String {
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(RID_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(text: &str) -> Incoming {
        serde_json::from_str(text).unwrap()
    }

    // =========================================================================
    // Shape routing
    // =========================================================================

    #[test]
    fn test_shape_reply() {
        let frame = decode(r#"{"rid":"abc123","result":{"machine":{"id":"m1"}}}"#);
        assert_eq!(frame.shape(), Shape::Reply);
    }

    #[test]
    fn test_shape_reply_without_result() {
        let frame = decode(r#"{"rid":"abc123"}"#);
        assert_eq!(frame.shape(), Shape::Reply);
    }

    #[test]
    fn test_shape_server_action() {
        let frame = decode(r#"{"realm":"machine","action":"containers"}"#);
        assert_eq!(frame.shape(), Shape::ServerAction);
    }

    #[test]
    fn test_shape_pipe_open() {
        let frame = decode(r#"{"lid":"L1","event":"log","filter":{"container":"x","limit":2}}"#);
        assert_eq!(frame.shape(), Shape::PipeControl);
    }

    #[test]
    fn test_shape_pipe_close() {
        let frame = decode(r#"{"lid":"L1","close":true}"#);
        assert_eq!(frame.shape(), Shape::PipeControl);
        assert_eq!(frame.close, Some(true));
    }

    #[test]
    fn test_shape_unknown() {
        let frame = decode(r#"{"noise":1}"#);
        assert_eq!(frame.shape(), Shape::Unknown);
    }

    #[test]
    fn test_outbound_with_rid_is_not_a_server_action() {
        // Our own frames echoed back would carry both action and rid; they
        // must not be treated as server actions.
        let frame = decode(r#"{"action":"machine.session","rid":"r1"}"#);
        assert_ne!(frame.shape(), Shape::ServerAction);
    }

    // =========================================================================
    // Msg serialization
    // =========================================================================

    #[test]
    fn test_msg_wire_fields() {
        let msg = Msg {
            action: "machine.session".to_string(),
            params: serde_json::json!({"key": "abc"}),
            rid: "R1".to_string(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["action"], "machine.session");
        assert_eq!(value["params"]["key"], "abc");
        assert_eq!(value["rid"], "R1");
    }

    #[test]
    fn test_reply_decode_missing_fields() {
        let reply: Reply = serde_json::from_str("{}").unwrap();
        assert!(reply.rid.is_empty());
        assert!(reply.result.is_none());
    }

    // =========================================================================
    // Correlation ids
    // =========================================================================

    #[test]
    fn test_rid_length_and_charset() {
        let rid = new_rid();
        assert_eq!(rid.len(), RID_LEN);
        assert!(rid.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_rid_birthday_one_million() {
        let mut seen = std::collections::HashSet::with_capacity(1_000_000);
        for _ in 0..1_000_000 {
            assert!(seen.insert(new_rid()), "rid collision");
        }
    }
}
