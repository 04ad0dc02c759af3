//! Per-worker high-water marks.

use relay_core::WorkerKey;
use serde::{Deserialize, Serialize};

use crate::error::StateResult;

/// Last processed source position for one (job, channel) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cursor {
    pub job: String,
    pub channel: String,
    /// Highest source message id forwarded or skipped.
    pub last_message_id: u64,
    /// Unix timestamp of the last advance.
    pub advanced_at: u64,
    /// Unix timestamp of the last completed poll cycle.
    pub checked_at: u64,
}

impl Cursor {
    pub fn new(key: &WorkerKey, last_message_id: u64, now: u64) -> Self {
        Self {
            job: key.job.clone(),
            channel: key.channel.clone(),
            last_message_id,
            advanced_at: now,
            checked_at: now,
        }
    }

    pub fn key(&self) -> WorkerKey {
        WorkerKey::new(&self.job, &self.channel)
    }

    pub fn table_key(&self) -> String {
        self.key().table_key()
    }

    /// Move the mark forward. Ids at or below the mark are ignored.
    pub fn advance(&mut self, message_id: u64, now: u64) -> bool {
        if message_id <= self.last_message_id {
            return false;
        }
        self.last_message_id = message_id;
        self.advanced_at = now;
        self.checked_at = now;
        true
    }

    /// Record a completed poll cycle without new content.
    pub fn touch(&mut self, now: u64) {
        self.checked_at = now;
    }
}

/// Persistence seam for cursors, so workers never see the database.
pub trait CursorStore: Send + Sync {
    fn load_cursor(&self, key: &WorkerKey) -> StateResult<Option<Cursor>>;
    fn save_cursor(&self, cursor: &Cursor) -> StateResult<()>;
}
