//! Per-identity count of live local connections.
//!
//! Local-process state only. Correct global presence under multi-instance
//! deployment relies on each instance publishing its own transitions
//! through the broker, with ephemeral TTL expiry as the fallback for
//! ungraceful process death.

use dashmap::DashMap;

pub struct ConnectionRegistry {
    connections: DashMap<String, usize>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Record a new live connection. Returns `true` if this is the
    /// identity's first local connection (a true online transition).
    pub fn connect(&self, user_id: &str) -> bool {
        let mut count = self.connections.entry(user_id.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Record a connection ending. Returns `true` if it was the identity's
    /// last local connection (a true offline transition, as opposed to
    /// "other tabs still open").
    pub fn disconnect(&self, user_id: &str) -> bool {
        let last = match self.connections.get_mut(user_id) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if last {
            self.connections.remove_if(user_id, |_, count| *count == 0);
        }
        last
    }

    /// Whether the identity has at least one live local connection.
    pub fn is_online(&self, user_id: &str) -> bool {
        self.connections.get(user_id).map_or(false, |c| *c > 0)
    }
}
