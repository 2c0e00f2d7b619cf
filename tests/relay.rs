use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use relayq::collab::{InboundMessage, InboundPayload, InboxBatch, SharedMedia};
use relayq::config::{PoolConfig, RouterConfig, ServeOptions};
use relayq::delay::DelayTracker;
use relayq::dispatch::Dispatcher;
use relayq::router::{InboxRouter, RouteOutcome};
use relayq::server::{self, Relay, ServerEvent};
use relayq::sim::{MemoryDirectory, MemorySnapshotStore, ScriptedInbox, SimulatedSender, StaticCredentials};
use relayq::worker::WorkerContext;
use relayq::{IdentityKey, MediaKind, WorkerId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn share(user: &str, media_id: &str, ts: i64) -> InboundMessage {
    InboundMessage {
        thread_id: format!("thread-{user}"),
        item_id: format!("{user}-{ts}"),
        sender_id: format!("{user}-id"),
        sender_username: user.to_string(),
        timestamp: Utc.timestamp_opt(1_700_000_000 + ts, 0).unwrap(),
        is_group: false,
        payload: InboundPayload::Media(SharedMedia {
            media_id: media_id.to_string(),
            owner_username: "poster".into(),
            kind: MediaKind::Photo,
            url: format!("https://cdn.example/{media_id}.jpg"),
            duration_secs: None,
        }),
    }
}

struct Pool {
    dispatcher: Arc<Dispatcher>,
    events: mpsc::UnboundedReceiver<relayq::worker::WorkMessage>,
    sender: Arc<SimulatedSender>,
    users: Arc<MemoryDirectory>,
    delay: Arc<DelayTracker>,
    snapshots: Arc<MemorySnapshotStore>,
}

async fn pool(workers: usize, token: &CancellationToken) -> Pool {
    let sender = Arc::new(SimulatedSender::new());
    let users = Arc::new(MemoryDirectory::new());
    let delay = Arc::new(DelayTracker::new());
    let snapshots = Arc::new(MemorySnapshotStore::new());
    let ctx = WorkerContext {
        sender: sender.clone(),
        credentials: Arc::new(StaticCredentials::new()),
        users: users.clone(),
        delay: delay.clone(),
        welcome_message: "welcome".into(),
    };
    let config = PoolConfig {
        worker_count: workers,
        ..PoolConfig::default()
    };
    let (dispatcher, events) = Dispatcher::start(&config, ctx, &*snapshots, token.clone())
        .await
        .unwrap();
    Pool {
        dispatcher: Arc::new(dispatcher),
        events,
        sender,
        users,
        delay,
        snapshots,
    }
}

async fn wait_for_deliveries(sender: &SimulatedSender, count: usize) {
    for _ in 0..3600 {
        if sender.delivered().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("only {} of {count} items delivered", sender.delivered().len());
}

#[tokio::test(start_paused = true)]
async fn routed_media_is_spread_and_delivered() {
    let token = CancellationToken::new();
    let p = pool(2, &token).await;
    let mut router = InboxRouter::new(
        RouterConfig::default(),
        p.dispatcher.clone(),
        p.delay.clone(),
        p.users.clone(),
    );

    let first = router.route(&share("alice", "m1", 0)).await.unwrap();
    let second = router.route(&share("bob", "m2", 0)).await.unwrap();
    assert_eq!(
        first,
        RouteOutcome::Enqueued {
            worker: WorkerId(0),
            count: 1
        }
    );
    assert_eq!(
        second,
        RouteOutcome::Enqueued {
            worker: WorkerId(1),
            count: 1
        }
    );

    wait_for_deliveries(&p.sender, 2).await;

    let mut delivered = p.sender.delivered();
    delivered.sort();
    assert_eq!(
        delivered,
        vec![IdentityKey::new("m1", "alice"), IdentityKey::new("m2", "bob")]
    );
    assert_eq!(p.dispatcher.total_queued().await, 0);
    assert_eq!(p.delay.samples(1).len(), 2);
    assert_eq!(p.users.notifications_for("alice-id"), vec!["welcome".to_string()]);
    assert_eq!(p.users.notifications_for("bob-id"), vec!["welcome".to_string()]);

    p.dispatcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn repeated_share_is_not_queued_twice() {
    let token = CancellationToken::new();
    let p = pool(1, &token).await;
    // Cancelled up front so nothing drains the queue under the test.
    p.dispatcher.shutdown().await;

    let mut router = InboxRouter::new(
        RouterConfig::default(),
        p.dispatcher.clone(),
        p.delay.clone(),
        p.users.clone(),
    );

    router.route(&share("alice", "m1", 0)).await.unwrap();
    let again = router.route(&share("alice", "m1", 1)).await.unwrap();
    let stale = router.route(&share("alice", "m1", 1)).await.unwrap();

    assert_eq!(again, RouteOutcome::Duplicate);
    assert_eq!(stale, RouteOutcome::AlreadyHandled);
    assert_eq!(p.dispatcher.total_queued().await, 1);
    assert_eq!(
        p.users.notifications_for("alice-id"),
        vec![RouterConfig::default().notices.already_queued]
    );

    p.dispatcher.save_snapshots(&*p.snapshots).await;
    let saved = p.snapshots.snapshot(WorkerId(0)).unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].identity(), IdentityKey::new("m1", "alice"));
}

#[tokio::test(start_paused = true)]
async fn serve_polls_routes_and_reports_deliveries() {
    let token = CancellationToken::new();
    let p = pool(2, &token).await;
    let router = InboxRouter::new(
        RouterConfig::default(),
        p.dispatcher.clone(),
        p.delay.clone(),
        p.users.clone(),
    );

    let inbox = Arc::new(ScriptedInbox::new());
    inbox.push_batch(InboxBatch {
        fresh: true,
        pending_requests: 0,
        messages: vec![share("alice", "m1", 0), share("bob", "m2", 0)],
    });

    let relay = Relay {
        inbox: inbox.clone(),
        router,
        dispatcher: p.dispatcher.clone(),
        snapshots: p.snapshots.clone(),
    };
    let (send_to_client, mut recv_from_server) = mpsc::unbounded_channel();
    let handle = tokio::spawn(server::serve(
        token.clone(),
        ServeOptions::default(),
        relay,
        p.events,
        send_to_client,
    ));

    let mut delivered = vec![];
    while delivered.len() < 2 {
        match recv_from_server.recv().await {
            Some(ServerEvent::Delivered { key, .. }) => delivered.push(key),
            Some(_) => {}
            None => panic!("server stopped early"),
        }
    }
    delivered.sort();
    assert_eq!(
        delivered,
        vec![IdentityKey::new("m1", "alice"), IdentityKey::new("m2", "bob")]
    );

    token.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(inbox.fetch_limits()[0], 50);
    assert_eq!(p.snapshots.snapshot(WorkerId(0)), Some(vec![]));
    assert_eq!(p.snapshots.snapshot(WorkerId(1)), Some(vec![]));
}
