use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod collab;
pub mod config;
pub mod db;
pub mod delay;
pub mod dispatch;
pub mod error;
pub mod queue;
pub mod router;
pub mod server;
pub mod sim;
pub mod telemetry;
pub mod worker;

/// Position of a worker in the pool. Stable for the lifetime of the process
/// and used as the snapshot key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Photo => f.write_str("photo"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Deduplication key: the same post requested twice by the same user is one
/// piece of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub media_id: String,
    pub target_username: String,
}

impl IdentityKey {
    pub fn new(media_id: impl Into<String>, target_username: impl Into<String>) -> Self {
        IdentityKey {
            media_id: media_id.into(),
            target_username: target_username.into(),
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.media_id, self.target_username)
    }
}

/// A single media forward waiting in a worker queue.
///
/// `target_*` is the user the media is sent to; `origin_username` is the
/// account that posted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub priority: u32,
    pub source_url: String,
    pub item_id: String,
    pub media_kind: MediaKind,
    pub media_id: String,
    pub target_user_id: String,
    pub target_username: String,
    pub origin_username: String,
    pub enqueued_at: DateTime<Utc>,
    pub needs_trim: bool,
}

impl QueueItem {
    pub fn identity(&self) -> IdentityKey {
        IdentityKey::new(self.media_id.clone(), self.target_username.clone())
    }

    pub fn matches_user(&self, username: &str) -> bool {
        self.origin_username == username || self.target_username == username
    }

    /// Seconds between `enqueued_at` and `now`, never negative.
    pub fn latency_secs(&self, now: DateTime<Utc>) -> f64 {
        let millis = (now - self.enqueued_at).num_milliseconds().max(0);
        millis as f64 / 1000.0
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::*;

    #[test]
    fn identity_is_media_and_target() {
        let item = item("m1", "alice", 0, 0);
        assert_eq!(item.identity().to_string(), "m1@alice");
    }

    #[test]
    fn latency_is_clamped_at_zero() {
        let item = item("m1", "alice", 0, 10);
        assert_eq!(item.latency_secs(at(5)), 0.0);
        assert_eq!(item.latency_secs(at(40)), 30.0);
    }

    #[test]
    fn matches_either_side() {
        let item = item("m1", "alice", 0, 0);
        assert!(item.matches_user("alice"));
        assert!(item.matches_user("poster"));
        assert!(!item.matches_user("bob"));
    }
}
