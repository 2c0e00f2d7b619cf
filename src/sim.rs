//! In-process collaborators.
//!
//! Used by the demo binary in place of a real messaging backend, and by the
//! tests to script failures and inspect side effects.

use anyhow::Error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::collab::{
    CredentialStore, Credentials, InboundMessage, InboxBatch, InboxSource, MediaSender,
    QueueSnapshotStore, SendError, UserDirectory,
};
use crate::{IdentityKey, QueueItem, WorkerId};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sender that pretends to transmit. Outcomes can be scripted per attempt;
/// once the script runs out every attempt succeeds, or fails for every
/// `fail_every`-th attempt when that is set.
#[derive(Debug, Default)]
pub struct SimulatedSender {
    script: Mutex<VecDeque<Result<(), SendError>>>,
    fail_every: Option<usize>,
    latency: Duration,
    attempts: AtomicUsize,
    delivered: Mutex<Vec<IdentityKey>>,
}

impl SimulatedSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(outcomes: Vec<Result<(), SendError>>) -> Self {
        SimulatedSender {
            script: Mutex::new(outcomes.into()),
            ..Self::default()
        }
    }

    /// Always succeeds after `latency`.
    pub fn slow(latency: Duration) -> Self {
        SimulatedSender {
            latency,
            ..Self::default()
        }
    }

    pub fn failing_every(n: usize, latency: Duration) -> Self {
        SimulatedSender {
            fail_every: Some(n.max(1)),
            latency,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<IdentityKey> {
        lock(&self.delivered).clone()
    }
}

#[async_trait]
impl MediaSender for SimulatedSender {
    async fn send(&self, credentials: &Credentials, item: &QueueItem) -> Result<(), SendError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        let scripted = lock(&self.script).pop_front();
        let result = match (scripted, self.fail_every) {
            (Some(result), _) => result,
            (None, Some(n)) if attempt % n == 0 => {
                Err(SendError::classify("Simulating failure, try again later"))
            }
            (None, _) => Ok(()),
        };

        if result.is_ok() {
            debug!(worker = %credentials.worker, item = %item.identity(), "Simulated send");
            lock(&self.delivered).push(item.identity());
        }
        result
    }
}

/// Hands out a fresh session string on every reload.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    reloads: AtomicUsize,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialStore for StaticCredentials {
    async fn reload(&self, worker: WorkerId) -> Result<Credentials, Error> {
        let generation = self.reloads.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Credentials {
            worker,
            session: format!("session-{}-{generation}", worker.0),
        })
    }
}

#[derive(Debug, Clone)]
struct UserRecord {
    username: String,
    priority: u32,
    latest_item_time: Option<DateTime<Utc>>,
    downloaded_from: Vec<String>,
}

/// User store held in memory. New users start at tier 1.
#[derive(Debug)]
pub struct MemoryDirectory {
    default_priority: u32,
    users: Mutex<HashMap<String, UserRecord>>,
    notifications: Mutex<Vec<(String, String)>>,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        MemoryDirectory {
            default_priority: 1,
            users: Mutex::default(),
            notifications: Mutex::default(),
        }
    }
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, user_id: &str, username: &str, priority: u32) -> Self {
        lock(&self.users).insert(
            user_id.to_string(),
            UserRecord {
                username: username.to_string(),
                priority,
                latest_item_time: None,
                downloaded_from: vec![],
            },
        );
        self
    }

    pub fn notifications(&self) -> Vec<(String, String)> {
        lock(&self.notifications).clone()
    }

    pub fn notifications_for(&self, user_id: &str) -> Vec<String> {
        lock(&self.notifications)
            .iter()
            .filter(|(id, _)| id == user_id)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn interactions(&self, user_id: &str) -> usize {
        lock(&self.users)
            .get(user_id)
            .map(|u| u.downloaded_from.len())
            .unwrap_or(0)
    }

    /// Key for a user known only by name, until `ensure_user` learns the id.
    fn pending_key(username: &str) -> String {
        format!("@{username}")
    }

    fn new_record(&self, username: &str) -> UserRecord {
        UserRecord {
            username: username.to_string(),
            priority: self.default_priority,
            latest_item_time: None,
            downloaded_from: vec![],
        }
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn ensure_user(&self, user_id: &str, username: &str) -> Result<(), Error> {
        let mut users = lock(&self.users);
        if !users.contains_key(user_id) {
            // Tier changes made before the user first wrote in.
            let record = users
                .remove(&Self::pending_key(username))
                .unwrap_or_else(|| self.new_record(username));
            users.insert(user_id.to_string(), record);
        }
        Ok(())
    }

    async fn priority(&self, user_id: &str) -> Result<u32, Error> {
        Ok(lock(&self.users)
            .get(user_id)
            .map(|u| u.priority)
            .unwrap_or(self.default_priority))
    }

    async fn has_prior_interaction(&self, user_id: &str) -> Result<bool, Error> {
        Ok(self.interactions(user_id) > 0)
    }

    async fn record_interaction(
        &self,
        user_id: &str,
        username: &str,
        from_username: &str,
    ) -> Result<(), Error> {
        let mut users = lock(&self.users);
        let record = users
            .entry(user_id.to_string())
            .or_insert_with(|| self.new_record(username));
        record.downloaded_from.push(from_username.to_string());
        Ok(())
    }

    async fn notify(&self, user_id: &str, text: &str) -> Result<(), Error> {
        info!(user_id, text, "Notify");
        lock(&self.notifications).push((user_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn latest_item_time(&self, user_id: &str) -> Result<Option<DateTime<Utc>>, Error> {
        Ok(lock(&self.users)
            .get(user_id)
            .and_then(|u| u.latest_item_time))
    }

    async fn set_latest_item_time(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), Error> {
        let mut users = lock(&self.users);
        let record = users
            .entry(user_id.to_string())
            .or_insert_with(|| self.new_record(""));
        record.latest_item_time = Some(at);
        Ok(())
    }

    async fn adjust_priority(&self, username: &str, delta: i32) -> Result<u32, Error> {
        let mut users = lock(&self.users);
        let key = users
            .iter()
            .find(|(_, u)| u.username == username)
            .map(|(id, _)| id.clone())
            .unwrap_or_else(|| Self::pending_key(username));
        let record = users
            .entry(key)
            .or_insert_with(|| self.new_record(username));
        record.priority = record.priority.saturating_add_signed(delta);
        Ok(record.priority)
    }
}

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<WorkerId, Vec<QueueItem>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(self, worker: WorkerId, items: Vec<QueueItem>) -> Self {
        lock(&self.snapshots).insert(worker, items);
        self
    }

    pub fn snapshot(&self, worker: WorkerId) -> Option<Vec<QueueItem>> {
        lock(&self.snapshots).get(&worker).cloned()
    }
}

#[async_trait]
impl QueueSnapshotStore for MemorySnapshotStore {
    async fn save_snapshot(&self, worker: WorkerId, items: &[QueueItem]) -> Result<(), Error> {
        lock(&self.snapshots).insert(worker, items.to_vec());
        Ok(())
    }

    async fn load_snapshot(&self, worker: WorkerId) -> Result<Vec<QueueItem>, Error> {
        Ok(self.snapshot(worker).unwrap_or_default())
    }
}

/// Inbox that replays queued batches, then reports an empty, fresh inbox.
#[derive(Debug, Default)]
pub struct ScriptedInbox {
    batches: Mutex<VecDeque<Result<InboxBatch, String>>>,
    pending: Mutex<VecDeque<Vec<InboundMessage>>>,
    approved: Mutex<Vec<String>>,
    limits: Mutex<Vec<usize>>,
}

impl ScriptedInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_batch(&self, batch: InboxBatch) {
        lock(&self.batches).push_back(Ok(batch));
    }

    pub fn push_error(&self, message: &str) {
        lock(&self.batches).push_back(Err(message.to_string()));
    }

    pub fn push_pending(&self, messages: Vec<InboundMessage>) {
        lock(&self.pending).push_back(messages);
    }

    pub fn approved(&self) -> Vec<String> {
        lock(&self.approved).clone()
    }

    /// Limits passed to each `fetch`, in call order.
    pub fn fetch_limits(&self) -> Vec<usize> {
        lock(&self.limits).clone()
    }
}

#[async_trait]
impl InboxSource for ScriptedInbox {
    async fn fetch(&self, limit: usize) -> Result<InboxBatch, Error> {
        lock(&self.limits).push(limit);
        match lock(&self.batches).pop_front() {
            Some(Ok(batch)) => Ok(batch),
            Some(Err(message)) => Err(anyhow::anyhow!(message)),
            None => Ok(InboxBatch {
                fresh: true,
                ..InboxBatch::default()
            }),
        }
    }

    async fn fetch_pending(&self) -> Result<Vec<InboundMessage>, Error> {
        Ok(lock(&self.pending).pop_front().unwrap_or_default())
    }

    async fn approve(&self, thread_id: &str) -> Result<(), Error> {
        lock(&self.approved).push(thread_id.to_string());
        Ok(())
    }
}
