//! JobManager: the job registry the supervisor reconciles against.
//!
//! Every mutation is a single redb write transaction. Successful
//! mutations bump a revision counter published on a watch channel.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use relay_core::{Job, JobPatch, NewJob};

use crate::error::{JobError, JobResult};
use crate::store::{StateStore, UpdateOutcome};

#[derive(Clone)]
pub struct JobManager {
    store: StateStore,
    revision: Arc<watch::Sender<u64>>,
}

impl JobManager {
    pub fn new(store: StateStore) -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            store,
            revision: Arc::new(tx),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Receiver that changes after every committed mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    pub fn create(&self, new_job: NewJob) -> JobResult<Job> {
        let job = new_job.into_job(epoch_secs())?;
        if !self.store.insert_job(&job)? {
            return Err(JobError::DuplicateName(job.name));
        }
        self.bump();
        info!(job = %job.name, channels = job.channels.len(), "job created");
        Ok(job)
    }

    pub fn get(&self, name: &str) -> JobResult<Job> {
        self.store
            .get_job(name)?
            .ok_or_else(|| JobError::NotFound(name.to_string()))
    }

    /// Apply a partial update. Validation failures leave the stored job as it was.
    pub fn update(&self, name: &str, patch: &JobPatch) -> JobResult<Job> {
        let now = epoch_secs();
        match self.store.update_job(name, |job| patch.apply(job, now))? {
            UpdateOutcome::Updated(job) => {
                self.bump();
                info!(job = %name, "job updated");
                Ok(job)
            }
            UpdateOutcome::Rejected(e) => Err(e.into()),
            UpdateOutcome::Missing => Err(JobError::NotFound(name.to_string())),
        }
    }

    /// Remove a job together with its cursors.
    pub fn delete(&self, name: &str) -> JobResult<()> {
        if !self.store.delete_job(name)? {
            return Err(JobError::NotFound(name.to_string()));
        }
        self.bump();
        info!(job = %name, "job deleted");
        Ok(())
    }

    pub fn list(&self) -> JobResult<Vec<Job>> {
        Ok(self.store.list_jobs()?)
    }

    pub fn exists(&self, name: &str) -> JobResult<bool> {
        Ok(self.store.get_job(name)?.is_some())
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
