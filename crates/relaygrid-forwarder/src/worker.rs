//! ForwardingWorker: the poll → deliver loop for one (job, channel) pair.
//!
//! ```text
//! Polling ─┬─ nothing new ─────────────────────────────────────┐
//!          └─ Parsing → RateGate → Delivering → CursorAdvance ─┤
//!                          ▲            │                      │
//!                          └ ErrorHandling ┘ (retry / skip)    ▼
//!                                                        CooldownWait
//! ```
//!
//! Workers own no shared state beyond the rate limiter and the cursor
//! store. Everything the supervisor needs to know travels over the
//! event channel.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use relay_core::{ChannelRef, DeliveryTarget, WorkerKey, config::WorkerConfig};
use relaygrid_ratelimit::{RateLimiter, RetryAfter, RouteKey};
use relaygrid_state::{Cursor, CursorStore};

use crate::message::SourceMessage;
use crate::sink::DeliverySink;
use crate::source::SourceFeed;

/// Widest gap filled with placeholders; wider gaps only log.
const MAX_PLACEHOLDERS: usize = 50;

/// Where a worker is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Polling,
    Parsing,
    RateGate,
    Delivering,
    ErrorHandling,
    CursorAdvance,
    CooldownWait,
    Stopped,
}

/// Something a worker reports to its supervisor.
#[derive(Debug, Clone)]
pub struct WorkerEvent {
    pub key: WorkerKey,
    /// Spawn generation of the reporting worker; stale generations are ignored.
    pub generation: u64,
    pub kind: WorkerEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEventKind {
    Heartbeat(WorkerPhase),
    /// A poll cycle completed.
    Progress { last_message_id: u64 },
    Delivered { message_id: u64 },
    /// A stand-in was posted for an id the source never showed.
    Placeholder { message_id: u64 },
    Retried { message_id: u64, reason: String },
    RateLimited { retry_after: Duration, global: bool },
    Skipped { message_id: u64, reason: String },
    SourceUnreachable { error: String, retry_in: Duration },
    Stopped,
}

/// Tunables shared by every worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub cooldown: Duration,
    pub delivery_attempts: u32,
    pub transient_delay: Duration,
    pub source_backoff_max: Duration,
    pub backfill: bool,
}

impl WorkerSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            cooldown: config.cooldown(),
            delivery_attempts: config.delivery_attempts.max(1),
            transient_delay: config.transient_delay(),
            source_backoff_max: config.source_backoff_max(),
            backfill: config.backfill,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

/// Collaborators handed to every worker.
#[derive(Clone)]
pub struct WorkerDeps {
    pub source: Arc<dyn SourceFeed>,
    pub sink: Arc<dyn DeliverySink>,
    pub limiter: Arc<RateLimiter>,
    pub cursors: Arc<dyn CursorStore>,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
    pub settings: WorkerSettings,
}

/// Cooldown that doubles while the source is failing.
#[derive(Debug)]
struct PollBackoff {
    base: Duration,
    current: Duration,
    max: Duration,
}

impl PollBackoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            current: base,
            max: max.max(base),
        }
    }

    fn success(&mut self) {
        self.current = self.base;
    }

    fn failure(&mut self) -> Duration {
        self.current = (self.current * 2).min(self.max);
        self.current
    }

    fn interval(&self) -> Duration {
        self.current
    }
}

enum Delivery {
    Delivered,
    Skipped(String),
    Cancelled,
}

pub struct ForwardingWorker {
    key: WorkerKey,
    channel: ChannelRef,
    target: DeliveryTarget,
    route: RouteKey,
    generation: u64,
    deps: WorkerDeps,
    phase: WorkerPhase,
    /// Ids above the cursor that belong to an album already seen.
    album_parts: BTreeSet<u64>,
}

impl ForwardingWorker {
    pub fn new(
        job: &str,
        channel: ChannelRef,
        target: DeliveryTarget,
        generation: u64,
        deps: WorkerDeps,
    ) -> Self {
        Self {
            key: WorkerKey::new(job, &channel.name),
            route: RouteKey::for_webhook(&target.webhook_url),
            channel,
            target,
            generation,
            deps,
            phase: WorkerPhase::Polling,
            album_parts: BTreeSet::new(),
        }
    }

    pub fn key(&self) -> &WorkerKey {
        &self.key
    }

    pub fn phase(&self) -> WorkerPhase {
        self.phase
    }

    /// Run until `cancel` flips to true or its sender is dropped.
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) {
        info!(job = %self.key.job, channel = %self.key.channel, generation = self.generation, "worker started");
        let mut cursor = self.load_cursor();
        let mut backoff = PollBackoff::new(
            self.deps.settings.cooldown,
            self.deps.settings.source_backoff_max,
        );

        loop {
            if *cancel.borrow() {
                break;
            }

            self.enter(WorkerPhase::Polling);
            match self.deps.source.fetch(&self.channel.name).await {
                Ok(messages) => {
                    backoff.success();
                    if self.process(messages, &mut cursor, &mut cancel).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let retry_in = backoff.failure();
                    warn!(
                        job = %self.key.job,
                        channel = %self.key.channel,
                        error = %e,
                        retry_in_secs = retry_in.as_secs(),
                        "source unreachable"
                    );
                    self.emit(WorkerEventKind::SourceUnreachable {
                        error: e.to_string(),
                        retry_in,
                    });
                }
            }

            self.enter(WorkerPhase::CooldownWait);
            tokio::select! {
                _ = sleep(backoff.interval()) => {}
                _ = stop_requested(&mut cancel) => break,
            }
        }

        self.phase = WorkerPhase::Stopped;
        self.emit(WorkerEventKind::Stopped);
        info!(job = %self.key.job, channel = %self.key.channel, "worker stopped");
    }

    /// Forward everything newer than the cursor. `Err` means stop was
    /// requested.
    async fn process(
        &mut self,
        mut messages: Vec<SourceMessage>,
        cursor: &mut Option<Cursor>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), ()> {
        self.enter(WorkerPhase::Parsing);
        messages.sort_by_key(|m| m.id);
        messages.dedup_by_key(|m| m.id);
        let now = epoch_secs();

        if cursor.is_none() {
            let start = match (self.channel.start_after, messages.last()) {
                (Some(id), _) => id,
                (None, _) if self.deps.settings.backfill => 0,
                (None, Some(newest)) => newest.id,
                (None, None) => {
                    // Without a post there is nothing to anchor "new" to yet.
                    debug!(job = %self.key.job, channel = %self.key.channel, "empty first page, baseline deferred");
                    self.emit(WorkerEventKind::Progress { last_message_id: 0 });
                    return Ok(());
                }
            };
            info!(
                job = %self.key.job,
                channel = %self.key.channel,
                start_after = start,
                "no cursor, starting from baseline"
            );
            let fresh = Cursor::new(&self.key, start, now);
            self.persist(&fresh);
            *cursor = Some(fresh);
        }
        let Some(current) = cursor.as_mut() else {
            return Ok(());
        };

        let floor = current.last_message_id;
        for message in &messages {
            self.album_parts.extend(message.album_parts());
        }
        self.album_parts = self.album_parts.split_off(&(floor + 1));

        let mut expected = floor + 1;
        for message in messages.into_iter().filter(|m| m.id > floor) {
            if *cancel.borrow() {
                return Err(());
            }
            if floor > 0 && message.id > expected {
                let missing: Vec<u64> = (expected..message.id)
                    .filter(|id| !self.album_parts.contains(id))
                    .collect();
                if missing.len() > MAX_PLACEHOLDERS {
                    warn!(
                        job = %self.key.job,
                        channel = %self.key.channel,
                        from = expected,
                        to = message.id - 1,
                        missing = missing.len(),
                        "gap in source ids too wide, not filling"
                    );
                } else {
                    for id in missing {
                        if !self.fill_gap(id, &message, current, cancel).await {
                            return Err(());
                        }
                    }
                }
            }
            expected = message.id + 1;

            if self.album_parts.contains(&message.id) {
                self.enter(WorkerPhase::CursorAdvance);
                debug!(job = %self.key.job, channel = %self.key.channel, message_id = message.id, "album item, already forwarded");
                current.advance(message.id, epoch_secs());
                self.persist(current);
                continue;
            }

            info!(job = %self.key.job, channel = %self.key.channel, message_id = message.id, link = %message.link, "new message");
            match self.deliver(&message, cancel).await {
                Delivery::Delivered => {
                    self.emit(WorkerEventKind::Delivered {
                        message_id: message.id,
                    });
                }
                Delivery::Skipped(reason) => {
                    warn!(
                        job = %self.key.job,
                        channel = %self.key.channel,
                        message_id = message.id,
                        %reason,
                        "message skipped"
                    );
                    self.emit(WorkerEventKind::Skipped {
                        message_id: message.id,
                        reason,
                    });
                }
                Delivery::Cancelled => return Err(()),
            }

            self.enter(WorkerPhase::CursorAdvance);
            current.advance(message.id, epoch_secs());
            self.persist(current);
        }

        current.touch(epoch_secs());
        self.persist(current);
        self.emit(WorkerEventKind::Progress {
            last_message_id: current.last_message_id,
        });
        Ok(())
    }

    /// Post a placeholder for an id the source skipped. `false` means stop
    /// was requested.
    async fn fill_gap(
        &mut self,
        id: u64,
        next: &SourceMessage,
        cursor: &mut Cursor,
        cancel: &mut watch::Receiver<bool>,
    ) -> bool {
        warn!(job = %self.key.job, channel = %self.key.channel, message_id = id, "message missing from source, sending placeholder");
        let placeholder = SourceMessage::missing(id, next);
        match self.deliver(&placeholder, cancel).await {
            Delivery::Delivered => self.emit(WorkerEventKind::Placeholder { message_id: id }),
            Delivery::Skipped(reason) => {
                warn!(job = %self.key.job, channel = %self.key.channel, message_id = id, %reason, "placeholder skipped");
                self.emit(WorkerEventKind::Skipped {
                    message_id: id,
                    reason,
                });
            }
            Delivery::Cancelled => return false,
        }
        self.enter(WorkerPhase::CursorAdvance);
        cursor.advance(id, epoch_secs());
        self.persist(cursor);
        true
    }

    /// Deliver one message, honoring rate limits and the retry budget.
    async fn deliver(
        &mut self,
        message: &SourceMessage,
        cancel: &mut watch::Receiver<bool>,
    ) -> Delivery {
        let attempts = self.deps.settings.delivery_attempts;
        let mut failures = 0u32;

        loop {
            self.enter(WorkerPhase::RateGate);
            tokio::select! {
                _ = self.deps.limiter.acquire(&self.route) => {}
                _ = stop_requested(cancel) => return Delivery::Cancelled,
            }

            self.enter(WorkerPhase::Delivering);
            let reason = match self.deps.sink.send(&self.target, message).await {
                Ok(resp) => {
                    self.deps.limiter.observe(&self.route, &resp.headers).await;
                    self.deps.limiter.record_status(resp.status).await;
                    match resp.status {
                        200..=299 => {
                            debug!(job = %self.key.job, channel = %self.key.channel, message_id = message.id, "message delivered");
                            return Delivery::Delivered;
                        }
                        429 => {
                            let retry = RetryAfter::parse(&resp.headers, &resp.body);
                            self.deps
                                .limiter
                                .on_429(&self.route, retry.after, retry.global)
                                .await;
                            self.emit(WorkerEventKind::RateLimited {
                                retry_after: retry.after,
                                global: retry.global,
                            });
                            continue;
                        }
                        500..=599 => format!("destination returned HTTP {}", resp.status),
                        status => {
                            return Delivery::Skipped(format!("destination rejected message with HTTP {status}"));
                        }
                    }
                }
                Err(e) if e.is_transient() => e.to_string(),
                Err(e) => return Delivery::Skipped(e.to_string()),
            };

            self.enter(WorkerPhase::ErrorHandling);
            failures += 1;
            if failures >= attempts {
                return Delivery::Skipped(format!("gave up after {failures} attempts: {reason}"));
            }
            let delay = self.deps.settings.transient_delay * failures;
            debug!(
                job = %self.key.job,
                channel = %self.key.channel,
                message_id = message.id,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                %reason,
                "delivery failed, retrying"
            );
            self.emit(WorkerEventKind::Retried {
                message_id: message.id,
                reason,
            });
            tokio::select! {
                _ = sleep(delay) => {}
                _ = stop_requested(cancel) => return Delivery::Cancelled,
            }
        }
    }

    fn load_cursor(&self) -> Option<Cursor> {
        match self.deps.cursors.load_cursor(&self.key) {
            Ok(cursor) => cursor,
            Err(e) => {
                error!(job = %self.key.job, channel = %self.key.channel, error = %e, "failed to load cursor");
                None
            }
        }
    }

    fn persist(&self, cursor: &Cursor) {
        if let Err(e) = self.deps.cursors.save_cursor(cursor) {
            error!(job = %self.key.job, channel = %self.key.channel, error = %e, "failed to persist cursor");
        }
    }

    fn enter(&mut self, phase: WorkerPhase) {
        self.phase = phase;
        self.emit(WorkerEventKind::Heartbeat(phase));
    }

    fn emit(&self, kind: WorkerEventKind) {
        // A closed channel means the supervisor is gone; the cancel
        // signal will follow.
        let _ = self.deps.events.send(WorkerEvent {
            key: self.key.clone(),
            generation: self.generation,
            kind,
        });
    }
}

async fn stop_requested(cancel: &mut watch::Receiver<bool>) {
    // Err means the sender is gone, which also means stop.
    let _ = cancel.wait_for(|stop| *stop).await;
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
