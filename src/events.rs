//! Event envelope, the closed event catalog, and room/key naming.
//!
//! Room and key names are the only cross-process addresses: every process
//! must derive the same name from the same id, so they are pure functions
//! of stable ids and nothing else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Closed enumeration of everything that can appear on the wire as `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // Domain events, published by the data API after a write commits.
    ThreadCreated,
    PostCreated,
    ReactionToggled,
    DmMessageCreated,
    DmReadUpdated,
    // Ephemeral events, produced by sessions.
    Typing,
    Presence,
    // Protocol events, addressed to a single client.
    Error,
    Subscribed,
    Unsubscribed,
}

/// The canonical server→client envelope: `{"type", "ts", "payload"}`.
///
/// Immutable once constructed; `ts` is construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub ts: DateTime<Utc>,
    pub payload: Value,
}

impl Event {
    fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            kind,
            ts: Utc::now(),
            payload,
        }
    }

    pub fn thread_created(episode_id: &str, thread: Value) -> Self {
        Self::new(
            EventKind::ThreadCreated,
            json!({ "episode_id": episode_id, "thread": thread }),
        )
    }

    pub fn post_created(episode_id: &str, post: Value) -> Self {
        Self::new(
            EventKind::PostCreated,
            json!({ "episode_id": episode_id, "post": post }),
        )
    }

    pub fn reaction_toggled(post_id: &str, user_id: &str, emoji: &str, active: bool) -> Self {
        Self::new(
            EventKind::ReactionToggled,
            json!({
                "post_id": post_id,
                "user_id": user_id,
                "emoji": emoji,
                "active": active,
            }),
        )
    }

    pub fn dm_message_created(conversation_id: &str, message: Value) -> Self {
        Self::new(
            EventKind::DmMessageCreated,
            json!({ "conversation_id": conversation_id, "message": message }),
        )
    }

    pub fn dm_read_updated(conversation_id: &str, user_id: &str, last_read_post_id: &str) -> Self {
        Self::new(
            EventKind::DmReadUpdated,
            json!({
                "conversation_id": conversation_id,
                "user_id": user_id,
                "last_read_post_id": last_read_post_id,
            }),
        )
    }

    pub fn typing(conversation_id: &str, user_id: &str, is_typing: bool) -> Self {
        Self::new(
            EventKind::Typing,
            json!({
                "conversation_id": conversation_id,
                "user_id": user_id,
                "is_typing": is_typing,
            }),
        )
    }

    pub fn presence(user_id: &str, online: bool) -> Self {
        Self::new(
            EventKind::Presence,
            json!({ "user_id": user_id, "online": online }),
        )
    }

    pub fn error(message: &str) -> Self {
        Self::new(EventKind::Error, json!({ "message": message }))
    }

    pub fn subscribed(room: &str) -> Self {
        Self::new(EventKind::Subscribed, json!({ "room": room }))
    }

    pub fn unsubscribed(room: &str) -> Self {
        Self::new(EventKind::Unsubscribed, json!({ "room": room }))
    }
}

/// Broadcast address for an episode's discussion.
pub fn discussion_room(episode_id: &str) -> String {
    format!("discussions:episode:{episode_id}")
}

/// Broadcast address for a DM conversation.
pub fn dm_room(conversation_id: &str) -> String {
    format!("dm:conversation:{conversation_id}")
}

/// Ephemeral typing marker for one user in one conversation.
pub fn typing_key(conversation_id: &str, user_id: &str) -> String {
    format!("typing:{conversation_id}:{user_id}")
}

/// Prefix covering every typing marker in a conversation.
pub fn typing_prefix(conversation_id: &str) -> String {
    format!("typing:{conversation_id}:")
}

/// Ephemeral presence marker for one user.
pub fn presence_key(user_id: &str) -> String {
    format!("presence:{user_id}")
}
