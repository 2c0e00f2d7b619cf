//! Assignment of new work to the worker pool.
//!
//! New items go to the worker with the shortest queue unless the caller pins
//! them to a worker (remaining parts of a multi-part post stay together).
//! The dispatcher is also the only place that looks across queues: duplicate
//! checks, totals, per-user purges and snapshots.

use std::collections::HashMap;

use anyhow::{bail, Context, Error};
use futures::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::collab::QueueSnapshotStore;
use crate::config::PoolConfig;
use crate::error::QueueError;
use crate::queue::{SharedQueue, WorkQueue};
use crate::worker::{WorkMessage, Worker, WorkerContext};
use crate::{IdentityKey, QueueItem, WorkerId};

struct WorkerSlot {
    id: WorkerId,
    queue: SharedQueue,
}

pub struct Dispatcher {
    slots: Vec<WorkerSlot>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// A dispatcher over existing queues with no workers attached.
    pub fn from_queues(queues: Vec<SharedQueue>) -> Self {
        let slots = queues
            .into_iter()
            .enumerate()
            .map(|(idx, queue)| WorkerSlot {
                id: WorkerId(idx),
                queue,
            })
            .collect();
        Dispatcher {
            slots,
            tasks: Mutex::new(vec![]),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawns the worker pool. Each queue is restored from its last snapshot
    /// when one can be loaded.
    pub async fn start(
        config: &PoolConfig,
        ctx: WorkerContext,
        snapshots: &dyn QueueSnapshotStore,
        cancel_token: CancellationToken,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WorkMessage>), Error> {
        if config.worker_count == 0 {
            bail!("worker pool needs at least one worker");
        }

        let pool_token = cancel_token.child_token();
        let (send_to_server, recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();
        let mut slots = Vec::with_capacity(config.worker_count);
        let mut tasks = Vec::with_capacity(config.worker_count);

        for idx in 0..config.worker_count {
            let id = WorkerId(idx);
            let restored = match snapshots.load_snapshot(id).await {
                Ok(items) => items,
                Err(err) => {
                    warn!(worker = %id, error = %err, "Could not load queue snapshot, starting empty");
                    vec![]
                }
            };
            let queue = WorkQueue::from_items(restored).shared();
            let queued = queue.lock().await.len();

            let credentials = match ctx
                .credentials
                .reload(id)
                .await
                .with_context(|| format!("loading credentials for worker {id}"))
            {
                Ok(credentials) => credentials,
                Err(err) => {
                    pool_token.cancel();
                    join_all(tasks).await;
                    return Err(err);
                }
            };

            let worker = Worker::new(
                id,
                queue.clone(),
                ctx.clone(),
                config.pacing.clone(),
                credentials,
                send_to_server.clone(),
            );
            let cancel_token = pool_token.child_token();
            let join_handle = tokio::spawn(
                async move {
                    worker.start(cancel_token).await;
                }
                .instrument(info_span!("worker", id = idx)),
            );
            info!(worker = %id, queued, "Started worker");

            slots.push(WorkerSlot { id, queue });
            tasks.push(join_handle);
        }

        let dispatcher = Dispatcher {
            slots,
            tasks: Mutex::new(tasks),
            cancel: pool_token,
        };
        Ok((dispatcher, recv_from_worker))
    }

    fn slot(&self, id: WorkerId) -> Option<&WorkerSlot> {
        self.slots.get(id.0)
    }

    /// The pinned worker when given, else the least-loaded one (first wins
    /// ties).
    pub async fn select_worker(&self, pinned: Option<WorkerId>) -> WorkerId {
        if let Some(pinned) = pinned {
            return pinned;
        }

        let mut best: Option<(WorkerId, usize)> = None;
        for slot in &self.slots {
            let len = slot.queue.lock().await.len();
            match best {
                Some((_, best_len)) if best_len <= len => {}
                _ => best = Some((slot.id, len)),
            }
        }
        best.map(|(id, _)| id).unwrap_or(WorkerId(0))
    }

    pub async fn is_already_queued(&self, media_id: &str, username: &str) -> bool {
        let key = IdentityKey::new(media_id, username);
        for slot in &self.slots {
            if slot.queue.lock().await.contains(&key) {
                return true;
            }
        }
        false
    }

    pub async fn enqueue(
        &self,
        item: QueueItem,
        pinned: Option<WorkerId>,
    ) -> Result<WorkerId, QueueError> {
        let id = self.select_worker(pinned).await;
        let slot = self.slot(id).ok_or(QueueError::UnknownWorker(id))?;
        let key = item.identity();
        slot.queue.lock().await.try_enqueue(item)?;
        debug!(worker = %id, item = %key, "Enqueued");
        Ok(id)
    }

    pub async fn total_queued(&self) -> usize {
        self.queue_lengths().await.iter().sum()
    }

    pub async fn queue_lengths(&self) -> Vec<usize> {
        let mut lengths = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            lengths.push(slot.queue.lock().await.len());
        }
        lengths
    }

    /// Origin accounts with the most queued items, most first. Equal counts
    /// keep the order they were first seen in.
    pub async fn top_queued_users(&self, n: usize) -> Vec<(String, usize)> {
        let mut counts: Vec<(String, usize)> = vec![];
        let mut index: HashMap<String, usize> = HashMap::new();
        for slot in &self.slots {
            let queue = slot.queue.lock().await;
            for item in queue.items() {
                match index.get(&item.origin_username) {
                    Some(&pos) => counts[pos].1 += 1,
                    None => {
                        index.insert(item.origin_username.clone(), counts.len());
                        counts.push((item.origin_username.clone(), 1));
                    }
                }
            }
        }
        counts.sort_by(|a, b| b.1.cmp(&a.1));
        counts.truncate(n);
        counts
    }

    pub async fn remove_all_for_user(&self, username: &str) -> usize {
        let mut total = 0;
        for slot in &self.slots {
            total += slot.queue.lock().await.remove_all_for_user(username);
        }
        info!(username, removed = total, "Removed queued items for user");
        total
    }

    /// Writes every queue to the store. Failures are logged per worker.
    pub async fn save_snapshots(&self, store: &dyn QueueSnapshotStore) {
        for slot in &self.slots {
            let items = slot.queue.lock().await.to_vec();
            if let Err(err) = store.save_snapshot(slot.id, &items).await {
                error!(worker = %slot.id, error = %err, "Failed to save queue snapshot");
            } else {
                trace!(worker = %slot.id, items = items.len(), "Saved queue snapshot");
            }
        }
    }

    /// Stops every worker and waits for them to finish their current cycle.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for result in join_all(tasks).await {
            if let Err(err) = result {
                error!(error = %err, "Worker task failed");
            }
        }
        info!("Worker pool stopped.");
    }
}
