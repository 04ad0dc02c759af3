//! Supervisor: turns the job registry into running workers and keeps
//! them alive.
//!
//! One task owns the event loop. It reconciles whenever the job
//! registry's revision changes, applies worker events as they arrive,
//! and runs a health sweep on a fixed interval. Worker records are only
//! written from that loop (and from direct calls in tests).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use relay_core::{
    ChannelRef, DeliveryTarget, Job, RelayConfig, WorkerKey, ZombieScope, human_age,
};
use relaygrid_forwarder::{
    DeliverySink, ForwardingWorker, SourceFeed, WorkerDeps, WorkerEvent, WorkerEventKind,
    WorkerPhase, WorkerSettings,
};
use relaygrid_metrics::{Counter, ForwardMetrics};
use relaygrid_ratelimit::RateLimiter;
use relaygrid_state::{CursorStore, JobManager};

use crate::error::{SupervisorError, SupervisorResult};
use crate::health::{
    Freshness, HealthReport, HealthStatus, JobHealth, ProcessCounts, SourceHealth, overall_status,
};
use crate::record::{WorkerRecord, WorkerSnapshot, WorkerState};

/// Sweep and restart tunables.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub sweep_interval: Duration,
    /// Cooldown cycles without progress before a live worker is a zombie.
    pub zombie_cycles: u32,
    pub zombie_scope: ZombieScope,
    pub healthy_reset: Duration,
    pub stop_timeout: Duration,
    pub bucket_idle: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            sweep_interval: config.supervisor.sweep_interval(),
            zombie_cycles: config.supervisor.zombie_cycles.max(1),
            zombie_scope: config.supervisor.zombie_scope,
            healthy_reset: config.supervisor.healthy_reset(),
            stop_timeout: config.supervisor.stop_timeout(),
            bucket_idle: config.rate_limit.bucket_idle(),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}

/// Everything the supervisor hands to the workers it spawns.
pub struct SupervisorDeps {
    pub source: Arc<dyn SourceFeed>,
    pub sink: Arc<dyn DeliverySink>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: ForwardMetrics,
    pub worker: WorkerSettings,
    pub settings: SupervisorSettings,
}

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub started: Vec<WorkerKey>,
    pub stopped: Vec<WorkerKey>,
    /// Stopped and started again because the job's target changed.
    pub replaced: Vec<WorkerKey>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && self.replaced.is_empty()
    }
}

/// What one health sweep found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub dead: Vec<WorkerKey>,
    pub zombies: Vec<WorkerKey>,
    pub restarted: Vec<WorkerKey>,
    pub counters_reset: usize,
    pub evicted_buckets: usize,
    pub source_reachable: bool,
}

pub struct Supervisor {
    jobs: JobManager,
    source: Arc<dyn SourceFeed>,
    sink: Arc<dyn DeliverySink>,
    limiter: Arc<RateLimiter>,
    metrics: ForwardMetrics,
    worker_settings: WorkerSettings,
    settings: SupervisorSettings,
    workers: RwLock<HashMap<WorkerKey, WorkerRecord>>,
    generation: AtomicU64,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerEvent>>>,
    /// Result and time of the last connectivity probe.
    source_status: RwLock<Option<(bool, Instant)>>,
    started: Instant,
}

impl Supervisor {
    pub fn new(jobs: JobManager, deps: SupervisorDeps) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            jobs,
            source: deps.source,
            sink: deps.sink,
            limiter: deps.limiter,
            metrics: deps.metrics,
            worker_settings: deps.worker,
            settings: deps.settings,
            workers: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            source_status: RwLock::new(None),
            started: Instant::now(),
        }
    }

    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    pub fn metrics(&self) -> &ForwardMetrics {
        &self.metrics
    }

    /// Run the event loop until `shutdown` flips or its sender is dropped,
    /// then stop every worker.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> SupervisorResult<()> {
        let mut events = self
            .events_rx
            .lock()
            .await
            .take()
            .ok_or(SupervisorError::AlreadyRunning)?;
        let mut revisions = self.jobs.subscribe();
        let mut sweep = tokio::time::interval(self.settings.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            sweep_secs = self.settings.sweep_interval.as_secs(),
            zombie_scope = ?self.settings.zombie_scope,
            "supervisor started"
        );
        self.reconcile_logged().await;

        loop {
            tokio::select! {
                Ok(()) = revisions.changed() => {
                    let revision = *revisions.borrow_and_update();
                    debug!(revision, "job registry changed");
                    self.reconcile_logged().await;
                }
                _ = sweep.tick() => {
                    self.sweep().await;
                }
                Some(event) = events.recv() => {
                    self.handle_event(event).await;
                }
                _ = shutdown.changed() => break,
            }
        }

        self.stop_all().await;
        info!("supervisor stopped");
        Ok(())
    }

    // ── Reconciliation ────────────────────────────────────────────

    /// Bring running workers in line with the job registry.
    ///
    /// Stops workers whose pair disappeared, replaces workers whose
    /// delivery target changed and starts missing ones. A second call
    /// with no registry change does nothing.
    pub async fn reconcile(&self) -> SupervisorResult<ReconcileReport> {
        let jobs = self.jobs.list()?;
        let live_jobs: HashSet<&str> = jobs.iter().map(|j| j.name.as_str()).collect();

        let mut desired: BTreeMap<WorkerKey, (ChannelRef, DeliveryTarget)> = BTreeMap::new();
        for job in &jobs {
            let target = job.target();
            for channel in job.channel_refs() {
                desired
                    .entry(WorkerKey::new(&job.name, &channel.name))
                    .or_insert((channel, target.clone()));
            }
        }

        let outdated: Vec<WorkerRecord> = {
            let mut workers = self.workers.write().await;
            let keys: Vec<WorkerKey> = workers
                .iter()
                .filter(|(key, record)| match desired.get(*key) {
                    Some((_, target)) => *target != record.target,
                    None => true,
                })
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|k| workers.remove(k)).collect()
        };

        let mut report = ReconcileReport::default();
        let mut forgotten_jobs = HashSet::new();
        let stopped_keys: Vec<WorkerKey> = outdated.iter().map(|r| r.key.clone()).collect();
        self.stop_workers(outdated).await;
        for key in stopped_keys {
            if desired.contains_key(&key) {
                report.replaced.push(key);
                continue;
            }
            // The worker is gone, so nothing can write this mark back.
            if let Err(e) = self.jobs.store().delete_cursor(&key) {
                warn!(job = %key.job, channel = %key.channel, error = %e, "failed to drop cursor");
            }
            if !live_jobs.contains(key.job.as_str()) {
                forgotten_jobs.insert(key.job.clone());
            }
            info!(job = %key.job, channel = %key.channel, "worker removed");
            report.stopped.push(key);
        }
        for job in forgotten_jobs {
            self.metrics.unregister(&job).await;
        }

        let missing: Vec<(WorkerKey, ChannelRef, DeliveryTarget)> = {
            let workers = self.workers.read().await;
            desired
                .into_iter()
                .filter(|(key, _)| !workers.contains_key(key))
                .map(|(key, (channel, target))| (key, channel, target))
                .collect()
        };
        for (key, channel, target) in missing {
            let record = self.spawn(&key, channel, target, 0);
            self.workers.write().await.insert(key.clone(), record);
            if !report.replaced.contains(&key) {
                report.started.push(key);
            }
        }

        if !report.is_noop() {
            info!(
                started = report.started.len(),
                stopped = report.stopped.len(),
                replaced = report.replaced.len(),
                "reconciled workers"
            );
        }
        Ok(report)
    }

    async fn reconcile_logged(&self) {
        if let Err(e) = self.reconcile().await {
            error!(error = %e, "reconcile failed, retrying on next sweep");
        }
    }

    // ── Events ────────────────────────────────────────────────────

    /// Apply one worker event. Events from replaced generations are dropped.
    pub async fn handle_event(&self, event: WorkerEvent) {
        let now = Instant::now();
        let counter = {
            let mut workers = self.workers.write().await;
            let Some(record) = workers.get_mut(&event.key) else {
                return;
            };
            if record.generation != event.generation {
                debug!(
                    job = %event.key.job,
                    channel = %event.key.channel,
                    generation = event.generation,
                    "dropping event from replaced worker"
                );
                return;
            }

            record.last_heartbeat = now;
            if record.state == WorkerState::Starting {
                record.state = WorkerState::Running;
            }
            match event.kind {
                WorkerEventKind::Heartbeat(phase) => {
                    record.phase = phase;
                    None
                }
                WorkerEventKind::Progress { .. } => {
                    record.last_progress = now;
                    None
                }
                WorkerEventKind::Delivered { .. } => {
                    record.last_progress = now;
                    record.last_error = None;
                    Some(Counter::Delivered)
                }
                WorkerEventKind::Placeholder { .. } => {
                    record.last_progress = now;
                    Some(Counter::Placeholders)
                }
                WorkerEventKind::Retried { reason, .. } => {
                    record.last_error = Some(reason);
                    Some(Counter::Retried)
                }
                WorkerEventKind::RateLimited { retry_after, global } => {
                    // Every worker queued behind the same block waits as long.
                    let until = now + retry_after;
                    let webhook = record.target.webhook_url.clone();
                    for other in workers.values_mut() {
                        if global || other.target.webhook_url == webhook {
                            other.hold_until(until);
                        }
                    }
                    Some(Counter::RateLimited)
                }
                WorkerEventKind::Skipped { reason, .. } => {
                    record.last_progress = now;
                    record.last_error = Some(reason);
                    Some(Counter::Skipped)
                }
                // A failed fetch still completes a poll cycle.
                WorkerEventKind::SourceUnreachable { error, retry_in } => {
                    record.last_progress = now;
                    record.hold_until(now + retry_in);
                    record.last_error = Some(error);
                    Some(Counter::SourceErrors)
                }
                WorkerEventKind::Stopped => {
                    record.state = WorkerState::Stopped;
                    record.phase = WorkerPhase::Stopped;
                    None
                }
            }
        };
        if let Some(counter) = counter {
            self.metrics.record(&event.key.job, counter).await;
        }
    }

    // ── Health sweep ──────────────────────────────────────────────

    /// Restart dead and stalled workers, reset counters of workers that
    /// have been healthy long enough, probe the source, evict idle rate
    /// limit buckets and retry anything reconciliation missed.
    pub async fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let stall_after = self.stall_threshold();
        let mut report = SweepReport::default();
        let mut restarts: BTreeMap<WorkerKey, String> = BTreeMap::new();

        {
            let mut workers = self.workers.write().await;
            for record in workers.values_mut() {
                let idle = now.saturating_duration_since(record.progress_reference());
                if record.handle.is_finished() {
                    record.state = WorkerState::Dead;
                    error!(job = %record.key.job, channel = %record.key.channel, "worker task terminated unexpectedly");
                    report.dead.push(record.key.clone());
                    restarts.insert(record.key.clone(), "worker task terminated".to_string());
                } else if idle >= stall_after {
                    record.state = WorkerState::Zombie;
                    warn!(
                        job = %record.key.job,
                        channel = %record.key.channel,
                        idle = %human_age(idle),
                        phase = ?record.phase,
                        "worker stalled"
                    );
                    report.zombies.push(record.key.clone());
                } else if record.state == WorkerState::Running
                    && record.restart_count > 0
                    && now.saturating_duration_since(record.started_at) >= self.settings.healthy_reset
                {
                    debug!(
                        job = %record.key.job,
                        channel = %record.key.channel,
                        restarts = record.restart_count,
                        "restart counter reset"
                    );
                    record.restart_count = 0;
                    report.counters_reset += 1;
                }
            }

            for zombie in &report.zombies {
                let reason = format!("no progress on {zombie} for {}", human_age(stall_after));
                match self.settings.zombie_scope {
                    ZombieScope::Channel => {
                        restarts.entry(zombie.clone()).or_insert(reason);
                    }
                    ZombieScope::Job => {
                        for key in workers.keys().filter(|k| k.job == zombie.job) {
                            restarts.entry(key.clone()).or_insert_with(|| reason.clone());
                        }
                    }
                }
            }
        }

        report.restarted = self.restart(restarts).await;

        report.source_reachable = self.probe_source().await;
        report.evicted_buckets = self.limiter.evict_idle(self.settings.bucket_idle).await;
        if report.evicted_buckets > 0 {
            debug!(evicted = report.evicted_buckets, "evicted idle rate limit buckets");
        }

        self.reconcile_logged().await;
        self.publish_gauges().await;
        report
    }

    async fn probe_source(&self) -> bool {
        let reachable = self.source.probe().await;
        let previous = self
            .source_status
            .write()
            .await
            .replace((reachable, Instant::now()))
            .map(|(r, _)| r);
        match (previous, reachable) {
            (Some(true) | None, false) => warn!("source unreachable"),
            (Some(false), true) => info!("source reachable again"),
            _ => debug!(reachable, "source probe"),
        }
        reachable
    }

    async fn publish_gauges(&self) {
        let jobs = match self.jobs.list() {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "failed to list jobs for gauges");
                return;
            }
        };
        let counts: Vec<(String, usize, usize)> = {
            let workers = self.workers.read().await;
            jobs.iter()
                .map(|job| {
                    let keys = job.worker_keys();
                    let running = keys
                        .iter()
                        .filter(|k| workers.get(*k).is_some_and(|r| r.state.is_live()))
                        .count();
                    (job.name.clone(), running, keys.len())
                })
                .collect()
        };
        for (job, running, desired) in counts {
            self.metrics.set_workers(&job, running, desired).await;
        }
    }

    fn stall_threshold(&self) -> Duration {
        self.worker_settings
            .cooldown
            .saturating_mul(self.settings.zombie_cycles.max(1))
    }

    // ── Worker lifecycle ──────────────────────────────────────────

    fn spawn(
        &self,
        key: &WorkerKey,
        channel: ChannelRef,
        target: DeliveryTarget,
        restart_count: u32,
    ) -> WorkerRecord {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let worker = ForwardingWorker::new(
            &key.job,
            channel.clone(),
            target.clone(),
            generation,
            self.worker_deps(),
        );
        let handle = tokio::spawn(worker.run(cancel_rx));
        debug!(job = %key.job, channel = %key.channel, generation, "worker spawned");

        let now = Instant::now();
        WorkerRecord {
            key: key.clone(),
            channel,
            target,
            generation,
            state: WorkerState::Starting,
            phase: WorkerPhase::Polling,
            started_at: now,
            last_heartbeat: now,
            last_progress: now,
            quiet_until: None,
            restart_count,
            last_error: None,
            handle,
            cancel_tx,
        }
    }

    fn worker_deps(&self) -> WorkerDeps {
        let cursors: Arc<dyn CursorStore> = Arc::new(self.jobs.store().clone());
        WorkerDeps {
            source: self.source.clone(),
            sink: self.sink.clone(),
            limiter: self.limiter.clone(),
            cursors,
            events: self.events_tx.clone(),
            settings: self.worker_settings.clone(),
        }
    }

    /// Replace workers, bumping their consecutive restart counters. All
    /// old tasks are stopped together before the replacements start.
    async fn restart(&self, reasons: BTreeMap<WorkerKey, String>) -> Vec<WorkerKey> {
        let old: Vec<WorkerRecord> = {
            let mut workers = self.workers.write().await;
            reasons.keys().filter_map(|k| workers.remove(k)).collect()
        };
        let plans: Vec<(WorkerKey, ChannelRef, DeliveryTarget, u32)> = old
            .iter()
            .map(|r| {
                (
                    r.key.clone(),
                    r.channel.clone(),
                    r.target.clone(),
                    r.restart_count.saturating_add(1),
                )
            })
            .collect();
        self.stop_workers(old).await;

        let mut restarted = Vec::with_capacity(plans.len());
        for (key, channel, target, restarts) in plans {
            let fresh = self.spawn(&key, channel, target, restarts);
            warn!(
                job = %key.job,
                channel = %key.channel,
                reason = %reasons.get(&key).map_or("", String::as_str),
                restarts,
                generation = fresh.generation,
                "worker restarted"
            );
            self.workers.write().await.insert(key.clone(), fresh);
            self.metrics.record(&key.job, Counter::Restarts).await;
            restarted.push(key);
        }
        restarted
    }

    /// Wait for a cancelled worker to finish, aborting it at `deadline`.
    async fn await_stop(&self, mut record: WorkerRecord, deadline: Instant) {
        record.state = WorkerState::Stopping;
        let key = &record.key;
        match tokio::time::timeout_at(deadline, &mut record.handle).await {
            Ok(Ok(())) => debug!(job = %key.job, channel = %key.channel, "worker stopped"),
            Ok(Err(e)) if e.is_panic() => {
                error!(job = %key.job, channel = %key.channel, "worker panicked");
            }
            Ok(Err(_)) => debug!(job = %key.job, channel = %key.channel, "worker task cancelled"),
            Err(_) => {
                warn!(
                    job = %key.job,
                    channel = %key.channel,
                    timeout_secs = self.settings.stop_timeout.as_secs(),
                    "worker did not stop in time, aborting"
                );
                record.handle.abort();
                // Returns once the task is torn down, so no cursor write follows.
                let _ = (&mut record.handle).await;
            }
        }
    }

    /// Stop every worker (for graceful shutdown).
    pub async fn stop_all(&self) {
        let records: Vec<WorkerRecord> = self.workers.write().await.drain().map(|(_, r)| r).collect();
        let count = records.len();
        self.stop_workers(records).await;
        info!(workers = count, "all workers stopped");
    }

    /// Cancel every record first, then wait for all of them against one
    /// shared deadline.
    async fn stop_workers(&self, records: Vec<WorkerRecord>) {
        if records.is_empty() {
            return;
        }
        for record in &records {
            let _ = record.cancel_tx.send(true);
        }
        let deadline = Instant::now() + self.settings.stop_timeout;
        for record in records {
            self.await_stop(record, deadline).await;
        }
    }

    // ── Reporting ─────────────────────────────────────────────────

    pub async fn workers(&self) -> Vec<WorkerSnapshot> {
        let now = Instant::now();
        let mut out: Vec<WorkerSnapshot> = self
            .workers
            .read()
            .await
            .values()
            .map(|r| r.snapshot(now))
            .collect();
        out.sort_by(|a, b| (&a.job, &a.channel).cmp(&(&b.job, &b.channel)));
        out
    }

    pub async fn worker(&self, key: &WorkerKey) -> Option<WorkerSnapshot> {
        let now = Instant::now();
        self.workers.read().await.get(key).map(|r| r.snapshot(now))
    }

    /// Process-wide health. Never fails: registry errors degrade to an
    /// empty job list.
    pub async fn health_report(&self) -> HealthReport {
        let jobs = match self.jobs.list() {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "failed to list jobs for health report");
                Vec::new()
            }
        };
        let restart_totals = self.restart_totals().await;
        let now = Instant::now();
        let epoch = epoch_secs();

        let job_reports: Vec<JobHealth> = {
            let workers = self.workers.read().await;
            jobs.iter()
                .map(|job| self.job_report(job, &workers, &restart_totals, now, epoch))
                .collect()
        };

        let processes = ProcessCounts {
            total: job_reports.iter().map(|j| j.total).sum(),
            running: job_reports.iter().map(|j| j.running).sum(),
        };
        let freshness = Freshness::from_last_check(
            job_reports.iter().filter_map(|j| j.freshness.last_check).max(),
            epoch,
            self.stall_threshold(),
        );
        let source = self.source_health(now).await;
        let uptime = now.saturating_duration_since(self.started);

        HealthReport {
            status: overall_status(&processes, &freshness, &source, &job_reports),
            timestamp: chrono::Utc::now().to_rfc3339(),
            uptime_secs: uptime.as_secs(),
            uptime: human_age(uptime),
            restarts: job_reports.iter().map(|j| j.restarts).sum(),
            processes,
            source,
            freshness,
            rate_limiter: self.limiter.stats().await,
            jobs: job_reports,
        }
    }

    /// Health of one job; `NotFound` for unknown names.
    pub async fn job_health(&self, name: &str) -> SupervisorResult<JobHealth> {
        let job = self.jobs.get(name)?;
        let restart_totals = self.restart_totals().await;
        let workers = self.workers.read().await;
        Ok(self.job_report(&job, &workers, &restart_totals, Instant::now(), epoch_secs()))
    }

    fn job_report(
        &self,
        job: &Job,
        workers: &HashMap<WorkerKey, WorkerRecord>,
        restart_totals: &HashMap<String, u64>,
        now: Instant,
        epoch: u64,
    ) -> JobHealth {
        let keys = job.worker_keys();
        let snapshots: Vec<WorkerSnapshot> = keys
            .iter()
            .filter_map(|k| workers.get(k))
            .map(|r| r.snapshot(now))
            .collect();
        let running = snapshots.iter().filter(|s| s.state.is_live()).count();

        let last_check = match self.jobs.store().list_cursors_for_job(&job.name) {
            Ok(cursors) => cursors.iter().map(|c| c.checked_at).max(),
            Err(e) => {
                warn!(job = %job.name, error = %e, "failed to read cursors");
                None
            }
        };
        let freshness = Freshness::from_last_check(last_check, epoch, self.stall_threshold());

        JobHealth {
            name: job.name.clone(),
            status: HealthStatus::classify(keys.len(), running, &freshness),
            total: keys.len(),
            running,
            restarts: restart_totals.get(&job.name).copied().unwrap_or(0),
            freshness,
            workers: snapshots,
        }
    }

    async fn restart_totals(&self) -> HashMap<String, u64> {
        self.metrics
            .snapshot()
            .await
            .into_iter()
            .map(|s| (s.job, s.restarts))
            .collect()
    }

    async fn source_health(&self, now: Instant) -> SourceHealth {
        match *self.source_status.read().await {
            Some((reachable, at)) => SourceHealth {
                reachable: Some(reachable),
                checked_secs_ago: Some(now.saturating_duration_since(at).as_secs()),
            },
            None => SourceHealth {
                reachable: None,
                checked_secs_ago: None,
            },
        }
    }
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use async_trait::async_trait;
    use relay_core::{JobPatch, NewJob};
    use relaygrid_forwarder::{DeliveryError, DeliveryResponse, SourceError, SourceMessage};
    use relaygrid_state::{Cursor, JobError, StateStore};

    /// Empty channels, except `stuck` ones that never answer and
    /// `panic_once` ones that blow up on their first fetch. With `down`
    /// set every fetch fails.
    #[derive(Default)]
    struct FakeSource {
        stuck: Vec<String>,
        panic_once: std::sync::Mutex<Vec<String>>,
        unreachable: AtomicBool,
        down: bool,
        fetches: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SourceFeed for FakeSource {
        async fn fetch(&self, channel: &str) -> Result<Vec<SourceMessage>, SourceError> {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            if self.down {
                return Err(SourceError::Unreachable("connection refused".to_string()));
            }
            if self.stuck.iter().any(|c| c == channel) {
                std::future::pending::<()>().await;
            }
            let explode = {
                let mut once = self.panic_once.lock().unwrap();
                match once.iter().position(|c| c == channel) {
                    Some(i) => {
                        once.remove(i);
                        true
                    }
                    None => false,
                }
            };
            if explode {
                panic!("extractor bug on {channel}");
            }
            Ok(Vec::new())
        }

        async fn probe(&self) -> bool {
            !self.unreachable.load(Ordering::Relaxed)
        }
    }

    struct OkSink;

    #[async_trait]
    impl DeliverySink for OkSink {
        async fn send(
            &self,
            _target: &DeliveryTarget,
            _message: &SourceMessage,
        ) -> Result<DeliveryResponse, DeliveryError> {
            Ok(DeliveryResponse {
                status: 204,
                headers: Default::default(),
                body: Vec::new(),
            })
        }
    }

    fn worker_settings() -> WorkerSettings {
        WorkerSettings {
            cooldown: Duration::from_secs(10),
            delivery_attempts: 3,
            transient_delay: Duration::from_secs(1),
            source_backoff_max: Duration::from_secs(40),
            backfill: false,
        }
    }

    fn supervisor(source: FakeSource, scope: ZombieScope) -> (Arc<Supervisor>, JobManager) {
        supervisor_with(source, scope, worker_settings())
    }

    fn supervisor_with(
        source: FakeSource,
        scope: ZombieScope,
        worker: WorkerSettings,
    ) -> (Arc<Supervisor>, JobManager) {
        let jobs = JobManager::new(StateStore::open_in_memory().unwrap());
        let deps = SupervisorDeps {
            source: Arc::new(source),
            sink: Arc::new(OkSink),
            limiter: Arc::new(RateLimiter::new(50)),
            metrics: ForwardMetrics::new(),
            worker,
            settings: SupervisorSettings {
                sweep_interval: Duration::from_secs(5),
                zombie_cycles: 2,
                zombie_scope: scope,
                healthy_reset: Duration::from_secs(60),
                stop_timeout: Duration::from_secs(1),
                bucket_idle: Duration::from_secs(3600),
            },
        };
        (Arc::new(Supervisor::new(jobs.clone(), deps)), jobs)
    }

    fn new_job(name: &str, channels: &[&str]) -> NewJob {
        NewJob {
            name: name.to_string(),
            webhook_url: "https://discord.com/api/webhooks/1/tok".to_string(),
            channels: channels.iter().map(|c| c.to_string()).collect(),
            embed_color: None,
            thread_id: None,
        }
    }

    fn start(sup: &Arc<Supervisor>) -> (watch::Sender<bool>, tokio::task::JoinHandle<SupervisorResult<()>>) {
        let (tx, rx) = watch::channel(false);
        (tx, tokio::spawn(sup.clone().run(rx)))
    }

    async fn generations(sup: &Supervisor) -> Vec<(WorkerKey, u64)> {
        let mut out: Vec<(WorkerKey, u64)> = sup
            .workers
            .read()
            .await
            .values()
            .map(|r| (r.key.clone(), r.generation))
            .collect();
        out.sort();
        out
    }

    async fn restarts(sup: &Supervisor, job: &str, channel: &str) -> u32 {
        sup.worker(&WorkerKey::new(job, channel)).await.unwrap().restarts
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_is_idempotent() {
        let (sup, jobs) = supervisor(FakeSource::default(), ZombieScope::Job);
        jobs.create(new_job("j1", &["c1", "c2"])).unwrap();

        let first = sup.reconcile().await.unwrap();
        assert_eq!(
            first.started,
            vec![WorkerKey::new("j1", "c1"), WorkerKey::new("j1", "c2")]
        );
        let before = generations(&sup).await;

        let second = sup.reconcile().await.unwrap();
        assert!(second.is_noop());
        assert_eq!(generations(&sup).await, before);
        sup.stop_all().await;
        assert!(sup.workers().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn job_lifecycle_drives_workers() {
        let (sup, jobs) = supervisor(FakeSource::default(), ZombieScope::Job);
        let (shutdown, handle) = start(&sup);

        jobs.create(new_job("J1", &["c1", "c2"])).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let health = sup.job_health("J1").await.unwrap();
        assert_eq!(health.total, 2);
        assert_eq!(health.running, 2);
        assert_eq!(health.status, HealthStatus::Healthy);
        let before = generations(&sup).await;

        let patch = JobPatch {
            webhook_url: Some("https://discord.com/api/webhooks/2/rotated".to_string()),
            ..Default::default()
        };
        jobs.update("J1", &patch).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let after = generations(&sup).await;
        assert_eq!(after.len(), 2);
        for ((key, old), (_, new)) in before.iter().zip(&after) {
            assert!(new > old, "{key} was not replaced");
        }
        for record in sup.workers.read().await.values() {
            assert_eq!(record.target.webhook_url, "https://discord.com/api/webhooks/2/rotated");
            assert_eq!(record.restart_count, 0);
        }

        jobs.delete("J1").unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(sup.workers().await.is_empty());
        assert!(jobs.list().unwrap().is_empty());

        shutdown.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn removed_channel_drops_its_cursor() {
        let (sup, jobs) = supervisor(FakeSource::default(), ZombieScope::Job);
        jobs.create(new_job("j1", &["c1", "c2"])).unwrap();
        sup.reconcile().await.unwrap();
        let store = jobs.store().clone();
        for channel in ["c1", "c2"] {
            store
                .put_cursor(&Cursor::new(&WorkerKey::new("j1", channel), 7, 1))
                .unwrap();
        }

        let patch = JobPatch {
            channels: Some(vec!["c1".to_string()]),
            ..Default::default()
        };
        jobs.update("j1", &patch).unwrap();
        let report = sup.reconcile().await.unwrap();
        assert_eq!(report.stopped, vec![WorkerKey::new("j1", "c2")]);
        assert!(report.started.is_empty() && report.replaced.is_empty());
        assert!(store.get_cursor(&WorkerKey::new("j1", "c2")).unwrap().is_none());
        assert!(store.get_cursor(&WorkerKey::new("j1", "c1")).unwrap().is_some());
        sup.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_worker_restarts_its_whole_job() {
        let source = FakeSource {
            stuck: vec!["stuck".to_string()],
            ..Default::default()
        };
        let (sup, jobs) = supervisor(source, ZombieScope::Job);
        jobs.create(new_job("j1", &["stuck", "live"])).unwrap();
        jobs.create(new_job("j2", &["other"])).unwrap();
        let (shutdown, handle) = start(&sup);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(restarts(&sup, "j1", "stuck").await, 1);
        assert_eq!(restarts(&sup, "j1", "live").await, 1);
        assert_eq!(restarts(&sup, "j2", "other").await, 0);

        let snapshot = sup.metrics().snapshot().await;
        let j1 = snapshot.iter().find(|s| s.job == "j1").unwrap();
        assert_eq!(j1.restarts, 2);

        shutdown.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn channel_scope_restarts_only_the_stalled_worker() {
        let source = FakeSource {
            stuck: vec!["stuck".to_string()],
            ..Default::default()
        };
        let (sup, jobs) = supervisor(source, ZombieScope::Channel);
        jobs.create(new_job("j1", &["stuck", "live"])).unwrap();
        let (shutdown, handle) = start(&sup);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(restarts(&sup, "j1", "stuck").await, 1);
        assert_eq!(restarts(&sup, "j1", "live").await, 0);

        shutdown.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dead_worker_restarts_and_counter_resets_after_healthy_run() {
        let source = FakeSource {
            panic_once: std::sync::Mutex::new(vec!["boom".to_string()]),
            ..Default::default()
        };
        let (sup, jobs) = supervisor(source, ZombieScope::Job);
        jobs.create(new_job("j1", &["boom"])).unwrap();
        let (shutdown, handle) = start(&sup);

        tokio::time::sleep(Duration::from_secs(6)).await;
        let worker = sup.worker(&WorkerKey::new("j1", "boom")).await.unwrap();
        assert_eq!(worker.restarts, 1);
        assert_eq!(worker.state, WorkerState::Running);

        tokio::time::sleep(Duration::from_secs(70)).await;
        assert_eq!(restarts(&sup, "j1", "boom").await, 0);
        let health = sup.job_health("j1").await.unwrap();
        assert_eq!(health.restarts, 1);

        shutdown.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn health_report_reflects_workers_and_source() {
        let source = FakeSource::default();
        source.unreachable.store(true, Ordering::Relaxed);
        let (sup, jobs) = supervisor(source, ZombieScope::Job);
        jobs.create(new_job("j1", &["c1", "c2"])).unwrap();
        sup.reconcile().await.unwrap();

        let report = sup.health_report().await;
        assert_eq!(report.processes.total, 2);
        assert_eq!(report.processes.running, 2);
        assert_eq!(report.source.reachable, None);
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.rate_limiter.global_limit, 50);

        let sweep = sup.sweep().await;
        assert!(!sweep.source_reachable);
        let report = sup.health_report().await;
        assert_eq!(report.source.reachable, Some(false));
        assert_eq!(report.status, HealthStatus::Unhealthy);

        assert!(matches!(
            sup.job_health("nope").await,
            Err(SupervisorError::Job(JobError::NotFound(_)))
        ));
        sup.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn backing_off_worker_is_not_a_zombie() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let source = FakeSource {
            down: true,
            fetches: fetches.clone(),
            ..Default::default()
        };
        let mut worker = worker_settings();
        worker.source_backoff_max = Duration::from_secs(80);
        let (sup, jobs) = supervisor_with(source, ZombieScope::Job, worker);
        jobs.create(new_job("j1", &["dark"])).unwrap();
        let (shutdown, handle) = start(&sup);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(restarts(&sup, "j1", "dark").await, 0);
        let snapshot = sup.metrics().snapshot().await;
        assert_eq!(snapshot.iter().find(|s| s.job == "j1").unwrap().restarts, 0);
        // 0, 20, 60, 140, 220 and maybe 300: the backoff holds.
        assert!(fetches.load(Ordering::Relaxed) <= 6);

        shutdown.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_holds_every_worker_on_the_webhook() {
        let (sup, jobs) = supervisor(FakeSource::default(), ZombieScope::Channel);
        jobs.create(new_job("j1", &["c1", "c2"])).unwrap();
        let mut other = new_job("j2", &["c3"]);
        other.webhook_url = "https://discord.com/api/webhooks/2/other".to_string();
        jobs.create(other).unwrap();
        sup.reconcile().await.unwrap();

        let c1 = WorkerKey::new("j1", "c1");
        let generation = sup.workers.read().await[&c1].generation;
        sup.handle_event(WorkerEvent {
            key: c1,
            generation,
            kind: WorkerEventKind::RateLimited {
                retry_after: Duration::from_secs(120),
                global: false,
            },
        })
        .await;

        // No run loop: nothing else refreshes progress.
        tokio::time::sleep(Duration::from_secs(60)).await;
        let report = sup.sweep().await;
        assert_eq!(report.zombies, vec![WorkerKey::new("j2", "c3")]);
        assert_eq!(report.restarted, vec![WorkerKey::new("j2", "c3")]);
        sup.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn placeholders_count_as_progress() {
        let (sup, jobs) = supervisor(FakeSource::default(), ZombieScope::Channel);
        jobs.create(new_job("j1", &["c1"])).unwrap();
        sup.reconcile().await.unwrap();

        let c1 = WorkerKey::new("j1", "c1");
        let generation = sup.workers.read().await[&c1].generation;
        tokio::time::sleep(Duration::from_secs(15)).await;
        sup.handle_event(WorkerEvent {
            key: c1.clone(),
            generation,
            kind: WorkerEventKind::Placeholder { message_id: 8 },
        })
        .await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        let report = sup.sweep().await;
        assert!(report.zombies.is_empty());
        let snapshot = sup.metrics().snapshot().await;
        assert_eq!(snapshot[0].placeholders, 1);
        sup.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_job_loses_cursors_written_after_delete() {
        let (sup, jobs) = supervisor(FakeSource::default(), ZombieScope::Job);
        jobs.create(new_job("j1", &["c1"])).unwrap();
        sup.reconcile().await.unwrap();

        jobs.delete("j1").unwrap();
        // A worker finishing its cycle before it sees the cancel.
        let key = WorkerKey::new("j1", "c1");
        let store = jobs.store().clone();
        store.put_cursor(&Cursor::new(&key, 42, 1)).unwrap();

        let report = sup.reconcile().await.unwrap();
        assert_eq!(report.stopped, vec![key.clone()]);
        assert!(store.get_cursor(&key).unwrap().is_none());

        jobs.create(new_job("j1", &["c1"])).unwrap();
        assert!(store.get_cursor(&key).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_workers_share_one_stop_deadline() {
        let source = FakeSource {
            stuck: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            ..Default::default()
        };
        let (sup, jobs) = supervisor(source, ZombieScope::Job);
        jobs.create(new_job("j1", &["a", "b", "c"])).unwrap();
        sup.reconcile().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        jobs.delete("j1").unwrap();
        let started = Instant::now();
        let report = sup.reconcile().await.unwrap();
        assert_eq!(report.stopped.len(), 3);
        // stop_timeout is 1s; one at a time would take 3s.
        assert!(Instant::now() - started < Duration::from_secs(2));
        assert!(sup.workers().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_refuses_second_loop() {
        let (sup, _jobs) = supervisor(FakeSource::default(), ZombieScope::Job);
        let (shutdown, handle) = start(&sup);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (_tx, rx) = watch::channel(false);
        assert!(matches!(
            sup.clone().run(rx).await,
            Err(SupervisorError::AlreadyRunning)
        ));

        shutdown.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
