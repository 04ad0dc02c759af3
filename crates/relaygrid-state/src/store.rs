//! StateStore: redb-backed persistence for jobs and cursors.
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns.
//! The store supports both on-disk and in-memory backends (the latter
//! for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use relay_core::{Job, WorkerKey};

use crate::cursor::{Cursor, CursorStore};
use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Result of a read-modify-write on a job.
#[derive(Debug)]
pub enum UpdateOutcome<E> {
    Updated(Job),
    /// The closure refused the change; nothing was written.
    Rejected(E),
    Missing,
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.open_table(CURSORS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Insert a job unless one with the same name exists.
    ///
    /// The existence check and the insert share one write transaction.
    /// Returns false (and writes nothing) when the name is taken.
    pub fn insert_job(&self, job: &Job) -> StateResult<bool> {
        let value = serde_json::to_vec(job).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let inserted;
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            inserted = table
                .get(job.name.as_str())
                .map_err(map_err!(Read))?
                .is_none();
            if inserted {
                table
                    .insert(job.name.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        if inserted {
            txn.commit().map_err(map_err!(Transaction))?;
            debug!(job = %job.name, "job stored");
        } else {
            txn.abort().map_err(map_err!(Transaction))?;
        }
        Ok(inserted)
    }

    /// Get a job by name.
    pub fn get_job(&self, name: &str) -> StateResult<Option<Job>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let job: Job =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// List all jobs, ordered by name.
    pub fn list_jobs(&self) -> StateResult<Vec<Job>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let job: Job =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(job);
        }
        Ok(results)
    }

    /// Read-modify-write a job inside one write transaction.
    ///
    /// If `apply` fails the transaction is aborted and the stored job
    /// is unchanged.
    pub fn update_job<E>(
        &self,
        name: &str,
        apply: impl FnOnce(&mut Job) -> Result<(), E>,
    ) -> StateResult<UpdateOutcome<E>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let current: Option<Job> = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
            match current {
                None => UpdateOutcome::Missing,
                Some(mut job) => match apply(&mut job) {
                    Err(e) => UpdateOutcome::Rejected(e),
                    Ok(()) => {
                        let value = serde_json::to_vec(&job).map_err(map_err!(Serialize))?;
                        table
                            .insert(name, value.as_slice())
                            .map_err(map_err!(Write))?;
                        UpdateOutcome::Updated(job)
                    }
                },
            }
        };
        if matches!(outcome, UpdateOutcome::Updated(_)) {
            txn.commit().map_err(map_err!(Transaction))?;
            debug!(job = %name, "job updated");
        } else {
            txn.abort().map_err(map_err!(Transaction))?;
        }
        Ok(outcome)
    }

    /// Delete a job and all of its cursors. Returns true if it existed.
    pub fn delete_job(&self, name: &str) -> StateResult<bool> {
        let prefix = format!("{name}:");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            existed = jobs.remove(name).map_err(map_err!(Write))?.is_some();
        }
        let mut cursors_removed = 0;
        if existed {
            let mut cursors = txn.open_table(CURSORS).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in cursors.iter().map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                let k = key.value().to_string();
                if k.starts_with(&prefix) {
                    keys.push(k);
                }
            }
            for key in &keys {
                cursors.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            cursors_removed = keys.len();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(job = %name, existed, cursors_removed, "job deleted");
        Ok(existed)
    }

    // ── Cursors ────────────────────────────────────────────────────

    /// Insert or update a cursor.
    pub fn put_cursor(&self, cursor: &Cursor) -> StateResult<()> {
        let key = cursor.table_key();
        let value = serde_json::to_vec(cursor).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CURSORS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a cursor by worker key.
    pub fn get_cursor(&self, key: &WorkerKey) -> StateResult<Option<Cursor>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CURSORS).map_err(map_err!(Table))?;
        match table.get(key.table_key().as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let cursor: Cursor =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(cursor))
            }
            None => Ok(None),
        }
    }

    /// List all cursors belonging to a job.
    pub fn list_cursors_for_job(&self, job: &str) -> StateResult<Vec<Cursor>> {
        let prefix = format!("{job}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CURSORS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let cursor: Cursor =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(cursor);
            }
        }
        Ok(results)
    }

    /// Delete a single cursor. Returns true if it existed.
    pub fn delete_cursor(&self, key: &WorkerKey) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(CURSORS).map_err(map_err!(Table))?;
            existed = table
                .remove(key.table_key().as_str())
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}

impl CursorStore for StateStore {
    fn load_cursor(&self, key: &WorkerKey) -> StateResult<Option<Cursor>> {
        self.get_cursor(key)
    }

    fn save_cursor(&self, cursor: &Cursor) -> StateResult<()> {
        self.put_cursor(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::NewJob;

    fn test_job(name: &str) -> Job {
        NewJob {
            name: name.to_string(),
            webhook_url: "https://discord.com/api/webhooks/1/abc".to_string(),
            channels: vec!["news".to_string(), "updates".to_string()],
            embed_color: None,
            thread_id: None,
        }
        .into_job(1000)
        .unwrap()
    }

    // ── Job CRUD ───────────────────────────────────────────────────

    #[test]
    fn job_insert_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let job = test_job("j1");

        assert!(store.insert_job(&job).unwrap());
        assert_eq!(store.get_job("j1").unwrap(), Some(job));
        assert_eq!(store.get_job("missing").unwrap(), None);
    }

    #[test]
    fn job_insert_refuses_existing_name() {
        let store = StateStore::open_in_memory().unwrap();
        let job = test_job("j1");
        assert!(store.insert_job(&job).unwrap());

        let mut other = test_job("j1");
        other.webhook_url = "https://example.com/other".to_string();
        assert!(!store.insert_job(&other).unwrap());

        // The original record is untouched.
        assert_eq!(store.get_job("j1").unwrap(), Some(job));
    }

    #[test]
    fn jobs_list_in_name_order() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_job(&test_job("zeta")).unwrap();
        store.insert_job(&test_job("alpha")).unwrap();

        let names: Vec<String> = store
            .list_jobs()
            .unwrap()
            .into_iter()
            .map(|j| j.name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn update_job_applies_and_persists() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_job(&test_job("j1")).unwrap();

        let outcome = store
            .update_job::<()>("j1", |job| {
                job.thread_id = Some("99".to_string());
                Ok(())
            })
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Updated(ref j) if j.thread_id.as_deref() == Some("99")));
        assert_eq!(
            store.get_job("j1").unwrap().unwrap().thread_id.as_deref(),
            Some("99")
        );
    }

    #[test]
    fn update_job_rejection_writes_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        let job = test_job("j1");
        store.insert_job(&job).unwrap();

        let outcome = store
            .update_job("j1", |job| {
                job.webhook_url = "mutated".to_string();
                Err("nope")
            })
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Rejected("nope")));
        assert_eq!(store.get_job("j1").unwrap(), Some(job));
    }

    #[test]
    fn update_missing_job() {
        let store = StateStore::open_in_memory().unwrap();
        let outcome = store.update_job::<()>("nope", |_| Ok(())).unwrap();
        assert!(matches!(outcome, UpdateOutcome::Missing));
    }

    #[test]
    fn delete_job_removes_its_cursors_only() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_job(&test_job("j1")).unwrap();
        store.insert_job(&test_job("j10")).unwrap();

        let k1 = WorkerKey::new("j1", "news");
        let k10 = WorkerKey::new("j10", "news");
        store.put_cursor(&Cursor::new(&k1, 5, 1000)).unwrap();
        store.put_cursor(&Cursor::new(&k10, 7, 1000)).unwrap();

        assert!(store.delete_job("j1").unwrap());
        assert!(!store.delete_job("j1").unwrap());

        assert_eq!(store.get_cursor(&k1).unwrap(), None);
        assert_eq!(store.get_cursor(&k10).unwrap().unwrap().last_message_id, 7);
    }

    // ── Cursors ────────────────────────────────────────────────────

    #[test]
    fn cursor_put_get_and_list() {
        let store = StateStore::open_in_memory().unwrap();
        let a = WorkerKey::new("j1", "a");
        let b = WorkerKey::new("j1", "b");
        store.put_cursor(&Cursor::new(&a, 1, 1000)).unwrap();
        store.put_cursor(&Cursor::new(&b, 2, 1000)).unwrap();

        let mut updated = store.load_cursor(&a).unwrap().unwrap();
        updated.advance(10, 2000);
        store.save_cursor(&updated).unwrap();

        assert_eq!(store.get_cursor(&a).unwrap().unwrap().last_message_id, 10);
        assert_eq!(store.list_cursors_for_job("j1").unwrap().len(), 2);
        assert!(store.delete_cursor(&b).unwrap());
        assert_eq!(store.list_cursors_for_job("j1").unwrap().len(), 1);
    }

    #[test]
    fn on_disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.redb");

        {
            let store = StateStore::open(&path).unwrap();
            store.insert_job(&test_job("j1")).unwrap();
            store
                .put_cursor(&Cursor::new(&WorkerKey::new("j1", "news"), 42, 1000))
                .unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        assert!(store.get_job("j1").unwrap().is_some());
        assert_eq!(
            store
                .get_cursor(&WorkerKey::new("j1", "news"))
                .unwrap()
                .unwrap()
                .last_message_id,
            42
        );
    }
}
