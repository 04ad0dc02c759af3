//! relaygrid-metrics: forwarding counters for relaygrid jobs.
//!
//! # Architecture
//!
//! ```text
//! ForwardMetrics
//!   ├── record()      ← supervisor, per worker event
//!   ├── set_workers() ← supervisor, per sweep
//!   └── snapshot()    → Vec<JobMetricsSnapshot>
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{Counter, ForwardMetrics, JobMetricsSnapshot};
pub use prometheus::render_prometheus;
