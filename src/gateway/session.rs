//! Per-connection session state and the client wire format.

use serde::Deserialize;
use serde_json::Value;

use crate::collab::Identity;

/// A frame received from the client: `{"type": "...", "payload": {}}`.
///
/// The envelope is accepted for any `type`; unknown types are answered
/// with an `error` event, never a close.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub payload: Value,
}

/// The closed set of client messages the server acts on.
pub const MSG_TYPING_START: &str = "typing_start";
pub const MSG_TYPING_STOP: &str = "typing_stop";
pub const MSG_HEARTBEAT: &str = "heartbeat";

/// What kind of channel this connection is attached to.
#[derive(Debug, Clone)]
pub enum SessionKind {
    /// Semi-public episode discussion; anyone may listen, a valid token
    /// unlocks typing messages.
    Discussion { episode_id: String },
    /// Private conversation; token and membership were verified before
    /// this value exists.
    Dm { conversation_id: String },
}

/// State for a single WebSocket connection, fixed at accept time.
pub struct Session {
    /// The room this connection is subscribed to.
    pub room: String,
    /// Authenticated identity; `None` only for anonymous discussion
    /// listeners.
    pub identity: Option<Identity>,
    pub kind: SessionKind,
}

impl Session {
    /// The conversation id, for DM sessions only.
    pub fn conversation_id(&self) -> Option<&str> {
        match &self.kind {
            SessionKind::Dm { conversation_id } => Some(conversation_id),
            SessionKind::Discussion { .. } => None,
        }
    }
}
