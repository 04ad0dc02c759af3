//! Supervisor-side bookkeeping for one worker task.

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use relay_core::{ChannelRef, DeliveryTarget, WorkerKey};
use relaygrid_forwarder::WorkerPhase;

/// Lifecycle of a supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Spawned, no heartbeat yet.
    Starting,
    Running,
    /// Cancellation sent, waiting for the task to finish.
    Stopping,
    Stopped,
    /// The task ended without being asked to (returned or panicked).
    Dead,
    /// The task is alive but has not completed a poll cycle in time.
    Zombie,
}

impl WorkerState {
    /// Counted as running in health reports.
    pub fn is_live(self) -> bool {
        matches!(self, WorkerState::Starting | WorkerState::Running)
    }
}

pub struct WorkerRecord {
    pub key: WorkerKey,
    pub channel: ChannelRef,
    pub target: DeliveryTarget,
    pub generation: u64,
    pub state: WorkerState,
    pub phase: WorkerPhase,
    pub started_at: Instant,
    pub last_heartbeat: Instant,
    /// Last completed poll cycle or delivery outcome.
    pub last_progress: Instant,
    /// The worker announced a deliberate wait (source backoff or a rate
    /// limit) lasting until this instant.
    pub quiet_until: Option<Instant>,
    /// Consecutive restarts; cleared after a sustained healthy run.
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub(crate) handle: JoinHandle<()>,
    pub(crate) cancel_tx: watch::Sender<bool>,
}

impl WorkerRecord {
    /// When progress was last seen or is next due, whichever is later.
    pub fn progress_reference(&self) -> Instant {
        match self.quiet_until {
            Some(until) => until.max(self.last_progress),
            None => self.last_progress,
        }
    }

    pub(crate) fn hold_until(&mut self, until: Instant) {
        self.quiet_until = Some(self.quiet_until.map_or(until, |current| current.max(until)));
    }

    pub fn snapshot(&self, now: Instant) -> WorkerSnapshot {
        WorkerSnapshot {
            job: self.key.job.clone(),
            channel: self.key.channel.clone(),
            state: self.state,
            phase: self.phase,
            generation: self.generation,
            restarts: self.restart_count,
            uptime_secs: now.saturating_duration_since(self.started_at).as_secs(),
            idle_secs: now.saturating_duration_since(self.last_progress).as_secs(),
            last_error: self.last_error.clone(),
        }
    }
}

/// Serializable view of a worker record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    pub job: String,
    pub channel: String,
    pub state: WorkerState,
    pub phase: WorkerPhase,
    pub generation: u64,
    pub restarts: u32,
    pub uptime_secs: u64,
    /// Seconds since the last progress report.
    pub idle_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
