//! relaygrid-supervisor: keeps one forwarding worker alive per
//! (job, channel) pair.
//!
//! # Architecture
//!
//! ```text
//! JobManager ──revision watch──▶ Supervisor::reconcile
//!                                   │ spawn / stop / replace
//!                                   ▼
//!                            ForwardingWorker tasks
//!                                   │ WorkerEvent (mpsc)
//!                                   ▼
//!                           Supervisor::handle_event ──▶ ForwardMetrics
//!
//! sweep (interval): dead + zombie detection, restart counter reset,
//!                   source probe, idle bucket eviction, reconcile retry
//! ```
//!
//! A worker that made no progress for `zombie_cycles × cooldown` is a
//! zombie. Depending on `zombie_scope` the whole job or only that worker
//! is restarted. There is no restart ceiling; the consecutive counter
//! resets after `healthy_reset` of uninterrupted running.

pub mod error;
pub mod health;
pub mod record;
pub mod supervisor;

pub use error::{SupervisorError, SupervisorResult};
pub use health::{
    Freshness, FreshnessVerdict, HealthReport, HealthStatus, JobHealth, ProcessCounts,
    SourceHealth,
};
pub use record::{WorkerSnapshot, WorkerState};
pub use supervisor::{ReconcileReport, Supervisor, SupervisorDeps, SupervisorSettings, SweepReport};
