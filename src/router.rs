//! Turns inbound messages into queue work and answers admin commands.
//!
//! The router runs on the single dispatch task; it is the only caller that
//! decides which worker new work goes to, so it also remembers the worker it
//! picked last for follow-ups that should stay on the same worker.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Error;
use tracing::{debug, info, instrument, warn};

use crate::collab::{InboundMessage, InboundPayload, SharedMedia, UserDirectory};
use crate::config::RouterConfig;
use crate::delay::{congestion_advisory, DelayTracker};
use crate::dispatch::Dispatcher;
use crate::error::{CommandError, QueueError};
use crate::{MediaKind, QueueItem, WorkerId};

#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Enqueued { worker: WorkerId, count: usize },
    /// The message was seen in an earlier poll.
    AlreadyHandled,
    Duplicate,
    Rejected(RejectReason),
    /// Multi-part posts are refused while the pool is over its ceiling.
    Overloaded,
    Admin(AdminReply),
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    VideoTooLong,
    LinkUnsupported,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Upgrade(String),
    Downgrade(String),
    Remove(String),
    ResetDelay,
    Total,
    Most(usize),
    Delay,
}

impl FromStr for AdminCommand {
    type Err = CommandError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let text = text.trim();
        let Some(body) = text.strip_prefix('!') else {
            return Err(CommandError::NotACommand(text.to_string()));
        };
        let mut words = body.split_whitespace();
        let name = words.next().unwrap_or_default();
        let arg = words.next();

        let user = |command: &'static str| {
            arg.map(|u| u.trim_start_matches('@').to_string())
                .filter(|u| !u.is_empty())
                .ok_or(CommandError::MissingUser(command))
        };

        match name {
            "upgrade" => Ok(AdminCommand::Upgrade(user("upgrade")?)),
            "downgrade" => Ok(AdminCommand::Downgrade(user("downgrade")?)),
            "remove" => Ok(AdminCommand::Remove(user("remove")?)),
            "reset" => Ok(AdminCommand::ResetDelay),
            "total" => Ok(AdminCommand::Total),
            "delay" => Ok(AdminCommand::Delay),
            "most" => match arg {
                None => Ok(AdminCommand::Most(10)),
                Some(n) => n
                    .parse()
                    .map(AdminCommand::Most)
                    .map_err(|_| CommandError::InvalidCount(n.to_string())),
            },
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdminReply {
    Priority { username: String, tier: u32 },
    Removed(usize),
    DelayReset,
    Total { total: usize, per_worker: Vec<usize> },
    TopQueued(Vec<(String, usize)>),
    Delays(Vec<(u32, f64)>),
}

impl fmt::Display for AdminReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminReply::Priority { username, tier } => {
                write!(f, "@{username} now has priority lvl {tier}")
            }
            AdminReply::Removed(n) => write!(f, "Removed {n} queue items from that user!"),
            AdminReply::DelayReset => f.write_str("Delay samples reset!"),
            AdminReply::Total { total, per_worker } => {
                let parts: Vec<String> = per_worker.iter().map(ToString::to_string).collect();
                write!(f, "{total} items queued ({})", parts.join(" / "))
            }
            AdminReply::TopQueued(users) if users.is_empty() => {
                f.write_str("Download queue is empty")
            }
            AdminReply::TopQueued(users) => {
                write!(f, "Top {} users in download queue:", users.len())?;
                for (idx, (user, count)) in users.iter().enumerate() {
                    write!(f, "\r\n{}. @{user} ({count} downloads in queue)", idx + 1)?;
                }
                Ok(())
            }
            AdminReply::Delays(tiers) if tiers.is_empty() => f.write_str("Delay is empty (no delay)"),
            AdminReply::Delays(tiers) => {
                for (idx, (tier, secs)) in tiers.iter().enumerate() {
                    if idx > 0 {
                        f.write_str("\r\n")?;
                    }
                    write!(f, "Priority Lv {tier} - {secs:.0}s")?;
                }
                Ok(())
            }
        }
    }
}

pub struct InboxRouter {
    config: RouterConfig,
    dispatcher: Arc<Dispatcher>,
    delay: Arc<DelayTracker>,
    users: Arc<dyn UserDirectory>,
    current: Option<WorkerId>,
}

impl InboxRouter {
    pub fn new(
        config: RouterConfig,
        dispatcher: Arc<Dispatcher>,
        delay: Arc<DelayTracker>,
        users: Arc<dyn UserDirectory>,
    ) -> Self {
        InboxRouter {
            config,
            dispatcher,
            delay,
            users,
            current: None,
        }
    }

    #[instrument(skip_all, fields(thread = %msg.thread_id, user = %msg.sender_username))]
    pub async fn route(&mut self, msg: &InboundMessage) -> Result<RouteOutcome, Error> {
        if msg.is_group {
            return Ok(RouteOutcome::Ignored);
        }
        self.users
            .ensure_user(&msg.sender_id, &msg.sender_username)
            .await?;

        if self.already_handled(msg).await? {
            return Ok(RouteOutcome::AlreadyHandled);
        }

        let is_admin = self.config.is_admin(&msg.sender_username);
        match &msg.payload {
            InboundPayload::Text { text } | InboundPayload::Link { text } if is_admin => {
                self.admin_text(msg, text).await
            }
            InboundPayload::Text { .. } => Ok(RouteOutcome::Ignored),
            InboundPayload::Link { .. } => {
                self.notify(msg, &self.config.notices.links_unsupported).await?;
                Ok(RouteOutcome::Rejected(RejectReason::LinkUnsupported))
            }
            InboundPayload::Media(media) => self.route_media(msg, media).await,
            InboundPayload::Carousel { parts, .. } => self.route_carousel(msg, parts).await,
            InboundPayload::ProfilePicture {
                username,
                url,
                anonymous,
            } => self.route_profile(msg, username, url, *anonymous).await,
            InboundPayload::Unavailable { message } => {
                debug!(message, "Shared media unavailable");
                self.notify(msg, &self.config.notices.unavailable).await?;
                Ok(RouteOutcome::Rejected(RejectReason::Unavailable))
            }
            InboundPayload::Unsupported { kind } => {
                debug!(kind, "Ignoring unsupported item");
                Ok(RouteOutcome::Ignored)
            }
        }
    }

    /// A thread whose latest item carries the timestamp we stored last time
    /// has nothing new. Anything else is recorded as the new latest item.
    async fn already_handled(&self, msg: &InboundMessage) -> Result<bool, Error> {
        let last = self.users.latest_item_time(&msg.sender_id).await?;
        if last == Some(msg.timestamp) {
            return Ok(true);
        }
        self.users
            .set_latest_item_time(&msg.sender_id, msg.timestamp)
            .await?;
        Ok(false)
    }

    async fn route_media(
        &mut self,
        msg: &InboundMessage,
        media: &SharedMedia,
    ) -> Result<RouteOutcome, Error> {
        if self
            .dispatcher
            .is_already_queued(&media.media_id, &msg.sender_username)
            .await
        {
            self.notify(msg, &self.config.notices.already_queued).await?;
            return Ok(RouteOutcome::Duplicate);
        }

        let priority = self.users.priority(&msg.sender_id).await?;
        self.advise(msg, priority).await?;

        let item = match self.build_item(msg, media, priority) {
            Ok(item) => item,
            Err(reason) => return self.reject(msg, reason).await,
        };

        let worker = self.dispatcher.select_worker(None).await;
        self.current = Some(worker);
        self.enqueue(item, worker).await
    }

    async fn route_carousel(
        &mut self,
        msg: &InboundMessage,
        parts: &[SharedMedia],
    ) -> Result<RouteOutcome, Error> {
        let queued = self.dispatcher.total_queued().await;
        if queued > self.config.slideshow_ceiling {
            warn!(queued, ceiling = self.config.slideshow_ceiling, "Refusing multi-part post");
            self.notify(msg, &self.config.notices.overloaded).await?;
            return Ok(RouteOutcome::Overloaded);
        }

        let priority = self.users.priority(&msg.sender_id).await?;
        let worker = self.dispatcher.select_worker(None).await;
        self.current = Some(worker);

        let mut count = 0;
        for part in parts {
            if self
                .dispatcher
                .is_already_queued(&part.media_id, &msg.sender_username)
                .await
            {
                debug!(media_id = %part.media_id, "Part already queued");
                continue;
            }
            let item = match self.build_item(msg, part, priority) {
                Ok(item) => item,
                Err(reason) => {
                    self.reject(msg, reason).await?;
                    continue;
                }
            };
            match self.dispatcher.enqueue(item, Some(worker)).await {
                Ok(_) => count += 1,
                Err(QueueError::Duplicate(key)) => debug!(item = %key, "Part already queued"),
                Err(err) => return Err(err.into()),
            }
        }

        info!(worker = %worker, parts = count, "Added multi-part post to queue");
        Ok(RouteOutcome::Enqueued { worker, count })
    }

    async fn route_profile(
        &mut self,
        msg: &InboundMessage,
        username: &str,
        url: &str,
        anonymous: bool,
    ) -> Result<RouteOutcome, Error> {
        if anonymous {
            self.notify(msg, &self.config.notices.anonymous_profile).await?;
        }

        let media = SharedMedia {
            media_id: format!("profile:{username}"),
            owner_username: username.to_string(),
            kind: MediaKind::Photo,
            url: url.to_string(),
            duration_secs: None,
        };
        if self
            .dispatcher
            .is_already_queued(&media.media_id, &msg.sender_username)
            .await
        {
            self.notify(msg, &self.config.notices.already_queued).await?;
            return Ok(RouteOutcome::Duplicate);
        }

        let priority = self.users.priority(&msg.sender_id).await?;
        let item = match self.build_item(msg, &media, priority) {
            Ok(item) => item,
            Err(reason) => return self.reject(msg, reason).await,
        };
        let worker = self.dispatcher.select_worker(self.current).await;
        self.current = Some(worker);
        self.enqueue(item, worker).await
    }

    fn build_item(
        &self,
        msg: &InboundMessage,
        media: &SharedMedia,
        priority: u32,
    ) -> Result<QueueItem, RejectReason> {
        let needs_trim = match (media.kind, media.duration_secs) {
            (MediaKind::Video, Some(secs)) if secs >= self.config.max_video_secs => {
                return Err(RejectReason::VideoTooLong)
            }
            (MediaKind::Video, Some(secs)) => secs >= self.config.trim_video_secs,
            _ => false,
        };

        Ok(QueueItem {
            priority,
            source_url: media.url.clone(),
            item_id: msg.item_id.clone(),
            media_kind: media.kind,
            media_id: media.media_id.clone(),
            target_user_id: msg.sender_id.clone(),
            target_username: msg.sender_username.clone(),
            origin_username: media.owner_username.clone(),
            enqueued_at: msg.timestamp,
            needs_trim,
        })
    }

    async fn enqueue(&self, item: QueueItem, worker: WorkerId) -> Result<RouteOutcome, Error> {
        let target = item.target_username.clone();
        match self.dispatcher.enqueue(item, Some(worker)).await {
            Ok(worker) => {
                info!(worker = %worker, user = %target, "Added to queue");
                Ok(RouteOutcome::Enqueued { worker, count: 1 })
            }
            Err(QueueError::Duplicate(_)) => Ok(RouteOutcome::Duplicate),
            Err(err) => Err(err.into()),
        }
    }

    async fn reject(
        &self,
        msg: &InboundMessage,
        reason: RejectReason,
    ) -> Result<RouteOutcome, Error> {
        let notices = &self.config.notices;
        let text = match reason {
            RejectReason::VideoTooLong => &notices.video_too_long,
            RejectReason::LinkUnsupported => &notices.links_unsupported,
            RejectReason::Unavailable => &notices.unavailable,
        };
        self.notify(msg, text).await?;
        Ok(RouteOutcome::Rejected(reason))
    }

    /// Suggests an upgrade when the sender's tier is congested and the next
    /// tier up is not.
    async fn advise(&self, msg: &InboundMessage, priority: u32) -> Result<(), Error> {
        let queued = self.dispatcher.total_queued().await;
        let thresholds = &self.config.advisory;
        if let Some(advisory) = congestion_advisory(&self.delay, thresholds, priority, queued) {
            info!(
                tier = advisory.tier,
                average_secs = advisory.average_secs,
                queued = advisory.queued,
                "Sending congestion advisory"
            );
            let text = self
                .config
                .notices
                .advisory
                .replace("{queued}", &advisory.queued.to_string());
            self.notify(msg, &text).await?;
        }
        Ok(())
    }

    async fn admin_text(&self, msg: &InboundMessage, text: &str) -> Result<RouteOutcome, Error> {
        let command = match text.parse::<AdminCommand>() {
            Ok(command) => command,
            Err(err) => {
                debug!(error = %err, "Admin text is not a command");
                return Ok(RouteOutcome::Ignored);
            }
        };
        info!(?command, "Admin command");
        let reply = self.execute(command).await?;
        self.notify(msg, &reply.to_string()).await?;
        Ok(RouteOutcome::Admin(reply))
    }

    pub async fn execute(&self, command: AdminCommand) -> Result<AdminReply, Error> {
        let reply = match command {
            AdminCommand::Upgrade(username) => {
                let tier = self.users.adjust_priority(&username, 1).await?;
                AdminReply::Priority { username, tier }
            }
            AdminCommand::Downgrade(username) => {
                let tier = self.users.adjust_priority(&username, -1).await?;
                AdminReply::Priority { username, tier }
            }
            AdminCommand::Remove(username) => {
                AdminReply::Removed(self.dispatcher.remove_all_for_user(&username).await)
            }
            AdminCommand::ResetDelay => {
                self.delay.reset();
                AdminReply::DelayReset
            }
            AdminCommand::Total => AdminReply::Total {
                total: self.dispatcher.total_queued().await,
                per_worker: self.dispatcher.queue_lengths().await,
            },
            AdminCommand::Most(n) => AdminReply::TopQueued(self.dispatcher.top_queued_users(n).await),
            AdminCommand::Delay => AdminReply::Delays(self.delay.active_tiers()),
        };
        Ok(reply)
    }

    async fn notify(&self, msg: &InboundMessage, text: &str) -> Result<(), Error> {
        self.users.notify(&msg.sender_id, text).await
    }
}
