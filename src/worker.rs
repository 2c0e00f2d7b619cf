use crate::collab::{CredentialStore, Credentials, MediaSender, SendError, UserDirectory};
use crate::config::PacingConfig;
use crate::delay::DelayTracker;
use crate::queue::SharedQueue;
use crate::{IdentityKey, QueueItem, WorkerId};
use chrono::Utc;
use rand::Rng;
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc::UnboundedSender, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::*;

#[derive(Debug)]
pub enum WorkMessage {
    ItemStarted(WorkerId, IdentityKey),
    ItemDelivered {
        worker: WorkerId,
        key: IdentityKey,
        latency_secs: f64,
    },
    /// Rate limited; the item stays queued for a later cycle.
    ItemRetained {
        worker: WorkerId,
        key: IdentityKey,
        error: String,
    },
    ItemDropped {
        worker: WorkerId,
        key: IdentityKey,
        error: String,
    },
    Stopped(WorkerId),
}

/// Inclusive range of whole seconds a worker sleeps before a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingWindow {
    pub min_secs: u64,
    pub max_secs: u64,
}

impl PacingWindow {
    pub const fn new(min_secs: u64, max_secs: u64) -> Self {
        PacingWindow { min_secs, max_secs }
    }

    pub fn draw(&self) -> Duration {
        let secs = if self.min_secs >= self.max_secs {
            self.min_secs
        } else {
            rand::thread_rng().gen_range(self.min_secs..=self.max_secs)
        };
        Duration::from_secs(secs)
    }
}

/// Collaborators shared by every worker in the pool.
#[derive(Clone)]
pub struct WorkerContext {
    pub sender: Arc<dyn MediaSender>,
    pub credentials: Arc<dyn CredentialStore>,
    pub users: Arc<dyn UserDirectory>,
    pub delay: Arc<DelayTracker>,
    pub welcome_message: String,
}

/// What one pass through the worker loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Idle,
    /// The item left the queue while the worker was sleeping.
    Skipped,
    Delivered,
    Retained,
    Dropped,
}

/// State carried from one cycle to the next.
#[derive(Debug)]
struct PacingState {
    window: PacingWindow,
    credentials: Credentials,
}

pub struct Worker {
    id: WorkerId,
    queue: SharedQueue,
    ctx: WorkerContext,
    pacing: PacingConfig,
    state: PacingState,
    events: UnboundedSender<WorkMessage>,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        queue: SharedQueue,
        ctx: WorkerContext,
        pacing: PacingConfig,
        credentials: Credentials,
        events: UnboundedSender<WorkMessage>,
    ) -> Self {
        let state = PacingState {
            window: pacing.initial,
            credentials,
        };
        Worker {
            id,
            queue,
            ctx,
            pacing,
            state,
            events,
        }
    }

    pub fn window(&self) -> PacingWindow {
        self.state.window
    }

    pub async fn start(mut self, cancel_token: CancellationToken) {
        debug!("Worker started");
        while !cancel_token.is_cancelled() {
            match self.cycle(&cancel_token).await {
                None => break,
                Some(CycleOutcome::Idle) => {}
                Some(_) => sleep(self.pacing.cooldown).await,
            }
        }
        self.report(WorkMessage::Stopped(self.id));
        info!("Worker stopped.");
    }

    /// Runs one pass of the pacing loop. Returns `None` when cancelled.
    pub async fn cycle(&mut self, cancel_token: &CancellationToken) -> Option<CycleOutcome> {
        let next = self.queue.lock().await.peek_highest().cloned();
        let Some(item) = next else {
            tokio::select! {
                _ = cancel_token.cancelled() => return None,
                _ = sleep(self.pacing.idle_interval) => {},
            }
            return Some(CycleOutcome::Idle);
        };

        let pause = self.pacing_for(&item).draw();
        trace!(pause_secs = pause.as_secs(), "Pacing before send");
        tokio::select! {
            _ = cancel_token.cancelled() => return None,
            _ = sleep(pause) => {},
        }

        let key = item.identity();
        if !self.queue.lock().await.contains(&key) {
            debug!(item = %key, "Item left the queue while pacing, skipping");
            return Some(CycleOutcome::Skipped);
        }

        self.report(WorkMessage::ItemStarted(self.id, key));
        let result = self.deliver(&item).await;
        Some(self.settle(item, result).await)
    }

    /// Picks the window for the upcoming sleep; high-priority items tighten it.
    fn pacing_for(&mut self, item: &QueueItem) -> PacingWindow {
        if item.priority > 1 {
            self.state.window = self.pacing.expedited;
        }
        self.state.window
    }

    #[instrument(skip_all, fields(item = %item.identity()))]
    async fn deliver(&self, item: &QueueItem) -> Result<(), SendError> {
        let first = self.ctx.sender.send(&self.state.credentials, item).await;
        let Err(err) = first else {
            return Ok(());
        };

        let wait = self.pacing.retry.draw();
        warn!(error = %err, wait_secs = wait.as_secs(), "Send failed, retrying once");
        sleep(wait).await;
        self.ctx.sender.send(&self.state.credentials, item).await
    }

    async fn settle(&mut self, item: QueueItem, result: Result<(), SendError>) -> CycleOutcome {
        let key = item.identity();
        match result {
            Ok(()) => {
                let latency_secs = item.latency_secs(Utc::now());
                self.ctx.delay.capture(item.priority, latency_secs);
                self.queue.lock().await.remove(&key);
                self.state.window = self.pacing.after_success;

                self.welcome_and_record(&item).await;
                info!(
                    target_user = %item.target_username,
                    origin = %item.origin_username,
                    kind = %item.media_kind,
                    latency_secs,
                    "Delivered"
                );
                self.report(WorkMessage::ItemDelivered {
                    worker: self.id,
                    key,
                    latency_secs,
                });
                CycleOutcome::Delivered
            }
            Err(err) => {
                error!(target_user = %item.target_username, error = %err, "Send failed");
                let outcome = if err.is_transient() {
                    self.report(WorkMessage::ItemRetained {
                        worker: self.id,
                        key,
                        error: err.to_string(),
                    });
                    CycleOutcome::Retained
                } else {
                    self.queue.lock().await.remove(&key);
                    self.report(WorkMessage::ItemDropped {
                        worker: self.id,
                        key,
                        error: err.to_string(),
                    });
                    CycleOutcome::Dropped
                };
                self.state.window = self.pacing.after_failure;
                self.reload_credentials().await;
                outcome
            }
        }
    }

    async fn welcome_and_record(&self, item: &QueueItem) {
        let users = &self.ctx.users;
        match users.has_prior_interaction(&item.target_user_id).await {
            Ok(false) => match users.notify(&item.target_user_id, &self.ctx.welcome_message).await {
                Ok(()) => info!(target_user = %item.target_username, "Welcomed"),
                Err(err) => warn!(error = %err, "Failed to send welcome message"),
            },
            Ok(true) => {}
            Err(err) => warn!(error = %err, "Failed to look up prior interactions"),
        }

        if let Err(err) = users
            .record_interaction(&item.target_user_id, &item.target_username, &item.origin_username)
            .await
        {
            warn!(error = %err, "Failed to record interaction");
        }
    }

    async fn reload_credentials(&mut self) {
        match self.ctx.credentials.reload(self.id).await {
            Ok(credentials) => {
                self.state.credentials = credentials;
                info!(worker = %self.id, "Reloaded credentials");
            }
            Err(err) => error!(worker = %self.id, error = %err, "Failed to reload credentials"),
        }
    }

    fn report(&self, msg: WorkMessage) {
        // The server loop may already be gone during shutdown.
        if let Err(err) = self.events.send(msg) {
            debug!(message = "Worker event not delivered", error = ?err);
        }
    }
}
