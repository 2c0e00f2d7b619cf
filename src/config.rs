//! Typed configuration for the pool, the workers, the router and the server
//! loop. `main` fills these from command line / environment.

use std::time::Duration;

use crate::delay::AdvisoryThresholds;
use crate::worker::PacingWindow;

/// Sent once to users the first time something is delivered to them.
pub const DEFAULT_WELCOME_MESSAGE: &str = "Thanks for using the relay! Share a post with us any time.";

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub worker_count: usize,
    pub pacing: PacingConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            worker_count: 2,
            pacing: PacingConfig::default(),
        }
    }
}

/// Timing of a worker's cycle.
#[derive(Debug, Clone)]
pub struct PacingConfig {
    pub initial: PacingWindow,
    /// Used when the next item has priority above 1.
    pub expedited: PacingWindow,
    pub after_success: PacingWindow,
    pub after_failure: PacingWindow,
    /// Range for the wait before the single inline retry.
    pub retry: PacingWindow,
    pub idle_interval: Duration,
    pub cooldown: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        PacingConfig {
            initial: PacingWindow::new(0, 60),
            expedited: PacingWindow::new(5, 15),
            after_success: PacingWindow::new(10, 30),
            after_failure: PacingWindow::new(30, 120),
            retry: PacingWindow::new(1, 20),
            idle_interval: Duration::from_secs(1),
            cooldown: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub admins: Vec<String>,
    /// Carousels are refused while more than this many items are queued.
    pub slideshow_ceiling: usize,
    /// Videos at or above this length are refused.
    pub max_video_secs: f64,
    /// Videos at or above this length are trimmed before sending.
    pub trim_video_secs: f64,
    pub advisory: AdvisoryThresholds,
    pub notices: Notices,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            admins: vec![],
            slideshow_ceiling: 2000,
            max_video_secs: 70.0,
            trim_video_secs: 60.0,
            advisory: AdvisoryThresholds::default(),
            notices: Notices::default(),
        }
    }
}

impl RouterConfig {
    pub fn is_admin(&self, username: &str) -> bool {
        self.admins.iter().any(|a| a == username)
    }
}

/// User-facing texts. `{queued}` in `advisory` is replaced with the pool size.
#[derive(Debug, Clone)]
pub struct Notices {
    pub already_queued: String,
    pub advisory: String,
    pub video_too_long: String,
    pub overloaded: String,
    pub links_unsupported: String,
    pub unavailable: String,
    pub anonymous_profile: String,
}

impl Default for Notices {
    fn default() -> Self {
        Notices {
            already_queued: "That post is already in the queue.".into(),
            advisory: "There are {queued} people in the queue. Let an admin upgrade your priority"
                .into(),
            video_too_long: "That video is too long to forward.".into(),
            overloaded:
                "Slideposts are currently disabled due to heavy server load. Please come back later."
                    .into(),
            links_unsupported: "Links are not supported, share the post instead.".into(),
            unavailable: "That post is unavailable. It may be private or deleted.".into(),
            anonymous_profile: "That profile picture is anonymous".into(),
        }
    }
}

/// Timing of the inbox polling loop.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub first_fetch_limit: usize,
    pub fetch_limit: usize,
    pub poll_interval: Duration,
    pub error_interval: Duration,
    pub stale_interval: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        ServeOptions {
            first_fetch_limit: 50,
            fetch_limit: 20,
            poll_interval: Duration::from_secs(15),
            error_interval: Duration::from_secs(10),
            stale_interval: Duration::from_secs(10),
        }
    }
}
