//! Contracts for the collaborators the relay core depends on.
//!
//! Network transport, the user store and session persistence live outside
//! this crate; `sim` provides in-process implementations.

use anyhow::Error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{MediaKind, QueueItem, WorkerId};

/// Opaque session handle a worker sends with. Replaced after every failure.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub worker: WorkerId,
    pub session: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("worker", &self.worker)
            .field("session", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SendError {
    /// Upstream asked us to back off; the item stays queued.
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("send failed: {0}")]
    Other(String),
}

impl SendError {
    const RATE_LIMIT_MARKERS: [&'static str; 3] = ["few minutes", "try again later", "rate limit"];

    /// Classifies a raw upstream error message.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if Self::RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
            SendError::RateLimited(message)
        } else {
            SendError::Other(message)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SendError::RateLimited(_))
    }
}

/// Downloads the source media, trims it when asked, and transmits it to the
/// target user.
#[async_trait]
pub trait MediaSender: Send + Sync {
    async fn send(&self, credentials: &Credentials, item: &QueueItem) -> Result<(), SendError>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn reload(&self, worker: WorkerId) -> Result<Credentials, Error>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Creates the user record if it does not exist yet.
    async fn ensure_user(&self, user_id: &str, username: &str) -> Result<(), Error>;

    async fn priority(&self, user_id: &str) -> Result<u32, Error>;

    async fn has_prior_interaction(&self, user_id: &str) -> Result<bool, Error>;

    async fn record_interaction(
        &self,
        user_id: &str,
        username: &str,
        from_username: &str,
    ) -> Result<(), Error>;

    async fn notify(&self, user_id: &str, text: &str) -> Result<(), Error>;

    async fn latest_item_time(&self, user_id: &str) -> Result<Option<DateTime<Utc>>, Error>;

    async fn set_latest_item_time(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), Error>;

    /// Moves a user's tier by `delta`, saturating at 0, and returns the new tier.
    async fn adjust_priority(&self, username: &str, delta: i32) -> Result<u32, Error>;
}

/// Best-effort persistence of worker queues across restarts.
#[async_trait]
pub trait QueueSnapshotStore: Send + Sync {
    async fn save_snapshot(&self, worker: WorkerId, items: &[QueueItem]) -> Result<(), Error>;

    async fn load_snapshot(&self, worker: WorkerId) -> Result<Vec<QueueItem>, Error>;
}

/// Source of inbound direct messages.
#[async_trait]
pub trait InboxSource: Send + Sync {
    async fn fetch(&self, limit: usize) -> Result<InboxBatch, Error>;

    async fn fetch_pending(&self) -> Result<Vec<InboundMessage>, Error>;

    async fn approve(&self, thread_id: &str) -> Result<(), Error>;
}

#[derive(Debug, Clone, Default)]
pub struct InboxBatch {
    /// False when upstream served an outdated snapshot of the inbox.
    pub fresh: bool,
    pub pending_requests: usize,
    pub messages: Vec<InboundMessage>,
}

/// Latest message of one inbox thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub thread_id: String,
    pub item_id: String,
    pub sender_id: String,
    pub sender_username: String,
    pub timestamp: DateTime<Utc>,
    pub is_group: bool,
    pub payload: InboundPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundPayload {
    Text {
        text: String,
    },
    Link {
        text: String,
    },
    /// A shared post, story or clip with a single media.
    Media(SharedMedia),
    /// A multi-part post.
    Carousel {
        media_id: String,
        owner_username: String,
        parts: Vec<SharedMedia>,
    },
    ProfilePicture {
        username: String,
        url: String,
        anonymous: bool,
    },
    /// A share whose media can no longer be seen.
    Unavailable {
        message: String,
    },
    Unsupported {
        kind: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedMedia {
    pub media_id: String,
    pub owner_username: String,
    pub kind: MediaKind,
    pub url: String,
    pub duration_secs: Option<f64>,
}
