//! relaygrid-state: durable state for relaygrid.
//!
//! Backed by [redb](https://docs.rs/redb). Holds the job registry (the
//! desired state the supervisor reconciles against) and the per-worker
//! cursors that let a restarted worker resume where it left off.
//!
//! # Architecture
//!
//! ```text
//! JobManager
//!   ├── create / get / update / delete / list
//!   ├── watch::Sender<u64> revision (bumped on every mutation)
//!   └── StateStore
//!         ├── jobs     table: {name}          → Job (JSON)
//!         └── cursors  table: {job}:{channel} → Cursor (JSON)
//! ```
//!
//! Every mutation is a single redb write transaction, so a check and
//! the write that depends on it commit together or not at all.

pub mod cursor;
pub mod error;
pub mod jobs;
pub mod store;
pub mod tables;

pub use cursor::{Cursor, CursorStore};
pub use error::{JobError, JobResult, StateError, StateResult};
pub use jobs::JobManager;
pub use store::{StateStore, UpdateOutcome};
