use crate::collab::{InboundMessage, InboxSource, QueueSnapshotStore};
use crate::config::ServeOptions;
use crate::dispatch::Dispatcher;
use crate::router::InboxRouter;
use crate::worker::WorkMessage;
use crate::{IdentityKey, WorkerId};
use anyhow::Error;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::*;

#[derive(Debug)]
pub enum ServerEvent {
    Delivered {
        worker: WorkerId,
        key: IdentityKey,
        latency_secs: f64,
    },
    Retained {
        worker: WorkerId,
        key: IdentityKey,
        error: String,
    },
    Dropped {
        worker: WorkerId,
        key: IdentityKey,
        error: String,
    },
    WorkerStopped(WorkerId),
    InboxError(Error),
}

/// Everything the dispatch loop drives.
pub struct Relay {
    pub inbox: Arc<dyn InboxSource>,
    pub router: InboxRouter,
    pub dispatcher: Arc<Dispatcher>,
    pub snapshots: Arc<dyn QueueSnapshotStore>,
}

pub async fn serve(
    cancel_token: CancellationToken,
    options: ServeOptions,
    relay: Relay,
    mut recv_from_worker: mpsc::UnboundedReceiver<WorkMessage>,
    send_to_client: mpsc::UnboundedSender<ServerEvent>,
) -> Result<(), Error> {
    let Relay {
        inbox,
        mut router,
        dispatcher,
        snapshots,
    } = relay;

    let poll_timer = sleep(std::time::Duration::ZERO);
    tokio::pin!(poll_timer);
    let mut first_poll = true;

    loop {
        tokio::select! {
            // Handle cancellation
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break;
            },
            // Poll the inbox
            _ = &mut poll_timer => {
                let limit = if first_poll {
                    options.first_fetch_limit
                } else {
                    options.fetch_limit
                };
                first_poll = false;

                let wait = match poll_inbox(&*inbox, &mut router, limit).await {
                    Ok(None) => {
                        warn!(message = "Inbox snapshot is stale, polling again shortly");
                        options.stale_interval
                    },
                    Ok(Some(routed)) => {
                        let lengths = dispatcher.queue_lengths().await;
                        let total: usize = lengths.iter().sum();
                        info!(message = "Inbox handled", routed, total, queues = ?lengths);
                        dispatcher.save_snapshots(&*snapshots).await;
                        options.poll_interval
                    },
                    Err(err) => {
                        error!(message = "Handling inbox failed", error = %err);
                        if let Err(err) = send_to_client.send(ServerEvent::InboxError(err)) {
                            error!(message = "Failed to send response to client", error = ?err);
                            cancel_token.cancel();
                            break;
                        }
                        options.error_interval
                    },
                };
                poll_timer.as_mut().reset(Instant::now() + wait);
            },
            // Handle events from workers
            chan_msg = recv_from_worker.recv() => {
                let event = match chan_msg {
                    None => {
                        debug!("Worker channel closed unexpectedly, exiting");
                        cancel_token.cancel();
                        break;
                    },
                    Some(WorkMessage::ItemStarted(worker, key)) => {
                        debug!(message = "Sending item", worker = %worker, item = %key);
                        continue;
                    },
                    Some(WorkMessage::ItemDelivered { worker, key, latency_secs }) => {
                        ServerEvent::Delivered { worker, key, latency_secs }
                    },
                    Some(WorkMessage::ItemRetained { worker, key, error }) => {
                        ServerEvent::Retained { worker, key, error }
                    },
                    Some(WorkMessage::ItemDropped { worker, key, error }) => {
                        ServerEvent::Dropped { worker, key, error }
                    },
                    Some(WorkMessage::Stopped(worker)) => ServerEvent::WorkerStopped(worker),
                };
                if let Err(err) = send_to_client.send(event) {
                    error!(message = "Failed to send response to client", error = ?err);
                    cancel_token.cancel();
                    break;
                }
            }
        }
    }

    // Workers finish their current send first so its removal is persisted.
    dispatcher.shutdown().await;
    dispatcher.save_snapshots(&*snapshots).await;

    info!("Server stopped.");

    Ok(())
}

/// Fetches and routes one inbox page plus any pending requests. Returns
/// `None` when upstream served a stale inbox.
async fn poll_inbox(
    inbox: &dyn InboxSource,
    router: &mut InboxRouter,
    limit: usize,
) -> Result<Option<usize>, Error> {
    let batch = inbox.fetch(limit).await?;
    if !batch.fresh {
        return Ok(None);
    }

    let mut routed = route_all(router, &batch.messages).await;

    if batch.pending_requests > 0 {
        debug!(pending = batch.pending_requests, "Handling pending requests");
        let pending = inbox.fetch_pending().await?;
        for msg in &pending {
            if let Err(err) = inbox.approve(&msg.thread_id).await {
                warn!(thread = %msg.thread_id, error = %err, "Failed to approve thread");
            }
        }
        routed += route_all(router, &pending).await;
    }

    Ok(Some(routed))
}

async fn route_all(router: &mut InboxRouter, messages: &[InboundMessage]) -> usize {
    let mut routed = 0;
    for msg in messages {
        match router.route(msg).await {
            Ok(outcome) => {
                trace!(thread = %msg.thread_id, ?outcome, "Routed");
                routed += 1;
            }
            Err(err) => error!(thread = %msg.thread_id, error = %err, "Failed to route message"),
        }
    }
    routed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{InboundPayload, InboxBatch};
    use crate::config::{PacingConfig, PoolConfig, RouterConfig};
    use crate::delay::DelayTracker;
    use crate::sim::{MemoryDirectory, MemorySnapshotStore, ScriptedInbox, SimulatedSender, StaticCredentials};
    use crate::test_utils::{at, item};
    use crate::worker::{PacingWindow, WorkerContext};
    use std::time::Duration;

    fn text(thread: &str, ts: i64) -> InboundMessage {
        InboundMessage {
            thread_id: thread.into(),
            item_id: format!("{thread}-{ts}"),
            sender_id: format!("{thread}-user"),
            sender_username: thread.into(),
            timestamp: at(ts),
            is_group: false,
            payload: InboundPayload::Text { text: "hi".into() },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polls_with_backoff_and_approves_pending() {
        let inbox = Arc::new(ScriptedInbox::new());
        inbox.push_batch(InboxBatch {
            fresh: false,
            ..InboxBatch::default()
        });
        inbox.push_error("upstream 500");
        inbox.push_batch(InboxBatch {
            fresh: true,
            pending_requests: 1,
            messages: vec![text("a", 1)],
        });
        inbox.push_pending(vec![text("b", 2)]);

        let users = Arc::new(MemoryDirectory::new());
        let delay = Arc::new(DelayTracker::new());
        let ctx = WorkerContext {
            sender: Arc::new(SimulatedSender::new()),
            credentials: Arc::new(StaticCredentials::new()),
            users: users.clone(),
            delay: delay.clone(),
            welcome_message: "hi".into(),
        };
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let cancel = CancellationToken::new();
        let (dispatcher, recv_from_worker) =
            Dispatcher::start(&PoolConfig::default(), ctx, &*snapshots, cancel.clone())
                .await
                .unwrap();
        let dispatcher = Arc::new(dispatcher);
        let router = InboxRouter::new(RouterConfig::default(), dispatcher.clone(), delay, users);
        let relay = Relay {
            inbox: inbox.clone(),
            router,
            dispatcher,
            snapshots: snapshots.clone(),
        };
        let (send_to_client, mut recv_from_server) = mpsc::unbounded_channel();

        let server = tokio::spawn(serve(
            cancel.clone(),
            ServeOptions::default(),
            relay,
            recv_from_worker,
            send_to_client,
        ));

        // stale (10s) + error (10s) + fresh, then regular 15s polls
        sleep(Duration::from_secs(36)).await;
        cancel.cancel();
        server.await.unwrap().unwrap();

        assert_eq!(inbox.fetch_limits(), vec![50, 20, 20, 20]);
        assert_eq!(inbox.approved(), vec!["b".to_string()]);
        assert_eq!(snapshots.snapshot(WorkerId(0)), Some(vec![]));

        let mut saw_inbox_error = false;
        while let Ok(event) = recv_from_server.try_recv() {
            saw_inbox_error |= matches!(event, ServerEvent::InboxError(_));
        }
        assert!(saw_inbox_error);
    }

    #[tokio::test(start_paused = true)]
    async fn final_snapshot_waits_for_send_in_flight() {
        let snapshots = Arc::new(
            MemorySnapshotStore::new().with_snapshot(WorkerId(0), vec![item("m1", "alice", 0, 0)]),
        );
        let sender = Arc::new(SimulatedSender::slow(Duration::from_secs(5)));
        let users = Arc::new(MemoryDirectory::new());
        let delay = Arc::new(DelayTracker::new());
        let ctx = WorkerContext {
            sender: sender.clone(),
            credentials: Arc::new(StaticCredentials::new()),
            users: users.clone(),
            delay: delay.clone(),
            welcome_message: "hi".into(),
        };
        let config = PoolConfig {
            worker_count: 1,
            pacing: PacingConfig {
                initial: PacingWindow::new(0, 0),
                ..PacingConfig::default()
            },
        };
        let cancel = CancellationToken::new();
        let (dispatcher, recv_from_worker) =
            Dispatcher::start(&config, ctx, &*snapshots, cancel.clone())
                .await
                .unwrap();
        let dispatcher = Arc::new(dispatcher);
        let router = InboxRouter::new(RouterConfig::default(), dispatcher.clone(), delay, users);
        let relay = Relay {
            inbox: Arc::new(ScriptedInbox::new()),
            router,
            dispatcher,
            snapshots: snapshots.clone(),
        };
        let (send_to_client, _recv_from_server) = mpsc::unbounded_channel();

        let server = tokio::spawn(serve(
            cancel.clone(),
            ServeOptions::default(),
            relay,
            recv_from_worker,
            send_to_client,
        ));

        // The send started at t=0 and completes at t=5.
        sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        server.await.unwrap().unwrap();

        assert_eq!(sender.delivered(), vec![IdentityKey::new("m1", "alice")]);
        assert_eq!(snapshots.snapshot(WorkerId(0)), Some(vec![]));
    }
}
