use anyhow::Error;
use chrono::Utc;
use clap::Parser;

use relayq::collab::{InboundMessage, InboundPayload, InboxBatch, QueueSnapshotStore, SharedMedia};
use relayq::config::{PacingConfig, PoolConfig, RouterConfig, ServeOptions, DEFAULT_WELCOME_MESSAGE};
use relayq::db::DbHandle;
use relayq::delay::DelayTracker;
use relayq::dispatch::Dispatcher;
use relayq::router::InboxRouter;
use relayq::server::{self, Relay};
use relayq::sim::{MemoryDirectory, MemorySnapshotStore, ScriptedInbox, SimulatedSender, StaticCredentials};
use relayq::telemetry;
use relayq::worker::WorkerContext;
use relayq::MediaKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, Instrument};
use uuid::Uuid;

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version)]
pub struct ConfigContext {
    #[arg(
        short = 'c',
        long = "connect_url",
        env = "RELAYQ_DATABASE_URL",
        help = "PostgreSQL Connection URL for queue snapshots (in-memory when unset)"
    )]
    connect_url: Option<String>,

    #[arg(
        short = 'n',
        long = "workers",
        env = "RELAYQ_WORKERS",
        help = "Number of upload workers",
        default_value = "2"
    )]
    workers: usize,

    #[arg(
        long = "admins",
        env = "RELAYQ_ADMINS",
        help = "Usernames allowed to run admin commands",
        value_delimiter = ' '
    )]
    admins: Vec<String>,

    #[arg(
        long = "welcome",
        env = "RELAYQ_WELCOME",
        help = "Message sent with a user's first delivery"
    )]
    welcome: Option<String>,

    #[arg(
        long = "slideshow_ceiling",
        help = "Queued items above which multi-part posts are refused",
        default_value = "2000"
    )]
    slideshow_ceiling: usize,

    #[arg(
        long = "poll_secs",
        help = "Seconds between inbox polls",
        default_value = "15"
    )]
    poll_secs: u64,

    #[arg(
        long = "jaeger_endpoint",
        env = "RELAYQ_JAEGER_ENDPOINT",
        help = "Jaeger collector endpoint, e.g. http://jaeger:14268/api/traces"
    )]
    jaeger_endpoint: Option<String>,

    #[arg(
        long = "demo_messages",
        help = "Number of simulated inbound messages to feed the relay",
        default_value = "10"
    )]
    demo_messages: usize,
}

fn demo_message(n: usize) -> InboundMessage {
    let user = format!("user{}", n % 4);
    InboundMessage {
        thread_id: Uuid::new_v4().to_string(),
        item_id: Uuid::new_v4().to_string(),
        sender_id: format!("{user}-id"),
        sender_username: user,
        timestamp: Utc::now(),
        is_group: false,
        payload: InboundPayload::Media(SharedMedia {
            media_id: Uuid::new_v4().to_string(),
            owner_username: format!("poster{}", n % 3),
            kind: if n % 2 == 0 {
                MediaKind::Photo
            } else {
                MediaKind::Video
            },
            url: format!("https://cdn.example/{n}"),
            duration_secs: (n % 2 == 1).then_some(30.0),
        }),
    }
}

#[instrument(skip_all)]
async fn setup(config: ConfigContext, cancel_token: CancellationToken) -> Result<(), Error> {
    let snapshots: Arc<dyn QueueSnapshotStore> = match &config.connect_url {
        Some(url) => Arc::new(DbHandle::new(url).await?),
        None => Arc::new(MemorySnapshotStore::new()),
    };

    let delay = Arc::new(DelayTracker::new());
    let users = Arc::new(MemoryDirectory::new());
    let ctx = WorkerContext {
        sender: Arc::new(SimulatedSender::failing_every(12, Duration::from_millis(100))),
        credentials: Arc::new(StaticCredentials::new()),
        users: users.clone(),
        delay: delay.clone(),
        welcome_message: config
            .welcome
            .clone()
            .unwrap_or_else(|| DEFAULT_WELCOME_MESSAGE.to_string()),
    };
    let pool_config = PoolConfig {
        worker_count: config.workers,
        pacing: PacingConfig::default(),
    };

    let (dispatcher, recv_from_worker) =
        Dispatcher::start(&pool_config, ctx, &*snapshots, cancel_token.clone()).await?;
    let dispatcher = Arc::new(dispatcher);

    let router_config = RouterConfig {
        admins: config.admins.clone(),
        slideshow_ceiling: config.slideshow_ceiling,
        ..RouterConfig::default()
    };
    let router = InboxRouter::new(router_config, dispatcher.clone(), delay, users);

    // Simulating inbound messages
    let inbox = Arc::new(ScriptedInbox::new());
    inbox.push_batch(InboxBatch {
        fresh: true,
        pending_requests: 0,
        messages: (0..config.demo_messages).map(demo_message).collect(),
    });
    debug!("Done setting messages");

    let options = ServeOptions {
        poll_interval: Duration::from_secs(config.poll_secs),
        ..ServeOptions::default()
    };
    let relay = Relay {
        inbox,
        router,
        dispatcher,
        snapshots,
    };

    // Channel for getting events from server
    let (send_to_client, mut recv_from_server) = mpsc::unbounded_channel();

    let server_spawn = {
        let cancel_token = cancel_token.clone();
        tokio::spawn(
            async move {
                if let Err(err) =
                    server::serve(cancel_token, options, relay, recv_from_worker, send_to_client)
                        .await
                {
                    error!("Error running server: {}", err);
                }
            }
            .instrument(info_span!("server")),
        )
    };

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Client Cancelled");
                break;
            },
            server_response = recv_from_server.recv() => {
                match server_response {
                    Some(msg) => {
                        info!(event = "Message", msg = ?msg);
                    },
                    None => {
                        debug!("Server connection closed unexpectedly, exiting");
                        break;
                    }
                }
            }
        }
    }

    println!("Waiting for server to shutdown...");
    server_spawn.await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigContext::parse();
    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(config, cloned_token));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {println!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {println!("Received SIGINT"); token.cancel()},
        }
    });
    app.await??;
    println!("Shutting down.");
    telemetry::shutdown();

    Ok(())
}
