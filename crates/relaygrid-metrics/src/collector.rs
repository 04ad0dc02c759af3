//! Per-job forwarding counters.
//!
//! Counters are plain atomics; the map of jobs sits behind one RwLock
//! that is only written when a job is first seen or forgotten.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

/// A counted forwarding outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Delivered,
    Skipped,
    Placeholders,
    Retried,
    RateLimited,
    SourceErrors,
    Restarts,
}

#[derive(Default)]
struct JobCounters {
    delivered: AtomicU64,
    skipped: AtomicU64,
    placeholders: AtomicU64,
    retried: AtomicU64,
    rate_limited: AtomicU64,
    source_errors: AtomicU64,
    restarts: AtomicU64,
    /// Workers currently running (set externally).
    running_workers: AtomicU64,
    /// Workers the job should have (set externally).
    desired_workers: AtomicU64,
}

impl JobCounters {
    fn counter(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Delivered => &self.delivered,
            Counter::Skipped => &self.skipped,
            Counter::Placeholders => &self.placeholders,
            Counter::Retried => &self.retried,
            Counter::RateLimited => &self.rate_limited,
            Counter::SourceErrors => &self.source_errors,
            Counter::Restarts => &self.restarts,
        }
    }
}

/// Point-in-time copy of one job's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobMetricsSnapshot {
    pub job: String,
    pub delivered: u64,
    pub skipped: u64,
    /// Placeholder posts sent for message ids the source never showed.
    pub placeholders: u64,
    pub retried: u64,
    pub rate_limited: u64,
    pub source_errors: u64,
    pub restarts: u64,
    pub running_workers: u64,
    pub desired_workers: u64,
}

/// Collects forwarding metrics across all jobs.
#[derive(Clone, Default)]
pub struct ForwardMetrics {
    jobs: Arc<RwLock<HashMap<String, Arc<JobCounters>>>>,
}

impl ForwardMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment one counter for a job, registering the job on first use.
    pub async fn record(&self, job: &str, counter: Counter) {
        self.counters(job)
            .await
            .counter(counter)
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Update the worker gauges for a job.
    pub async fn set_workers(&self, job: &str, running: usize, desired: usize) {
        let counters = self.counters(job).await;
        counters
            .running_workers
            .store(running as u64, Ordering::Relaxed);
        counters
            .desired_workers
            .store(desired as u64, Ordering::Relaxed);
    }

    /// Forget a deleted job.
    pub async fn unregister(&self, job: &str) {
        if self.jobs.write().await.remove(job).is_some() {
            debug!(%job, "metrics unregistered");
        }
    }

    /// All jobs' counters, ordered by job name.
    pub async fn snapshot(&self) -> Vec<JobMetricsSnapshot> {
        let jobs = self.jobs.read().await;
        let mut out: Vec<JobMetricsSnapshot> = jobs
            .iter()
            .map(|(job, c)| JobMetricsSnapshot {
                job: job.clone(),
                delivered: c.delivered.load(Ordering::Relaxed),
                skipped: c.skipped.load(Ordering::Relaxed),
                placeholders: c.placeholders.load(Ordering::Relaxed),
                retried: c.retried.load(Ordering::Relaxed),
                rate_limited: c.rate_limited.load(Ordering::Relaxed),
                source_errors: c.source_errors.load(Ordering::Relaxed),
                restarts: c.restarts.load(Ordering::Relaxed),
                running_workers: c.running_workers.load(Ordering::Relaxed),
                desired_workers: c.desired_workers.load(Ordering::Relaxed),
            })
            .collect();
        out.sort_by(|a, b| a.job.cmp(&b.job));
        out
    }

    async fn counters(&self, job: &str) -> Arc<JobCounters> {
        if let Some(c) = self.jobs.read().await.get(job) {
            return c.clone();
        }
        self.jobs
            .write()
            .await
            .entry(job.to_string())
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counters_accumulate_per_job() {
        let metrics = ForwardMetrics::new();
        metrics.record("b", Counter::Delivered).await;
        metrics.record("a", Counter::Delivered).await;
        metrics.record("a", Counter::Delivered).await;
        metrics.record("a", Counter::Skipped).await;
        metrics.record("a", Counter::Placeholders).await;
        metrics.record("a", Counter::Restarts).await;
        metrics.set_workers("a", 1, 2).await;

        let snap = metrics.snapshot().await;
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].job, "a");
        assert_eq!(snap[0].delivered, 2);
        assert_eq!(snap[0].skipped, 1);
        assert_eq!(snap[0].placeholders, 1);
        assert_eq!(snap[0].restarts, 1);
        assert_eq!(snap[0].running_workers, 1);
        assert_eq!(snap[0].desired_workers, 2);
        assert_eq!(snap[1].delivered, 1);
    }

    #[tokio::test]
    async fn unregister_drops_job() {
        let metrics = ForwardMetrics::new();
        metrics.record("a", Counter::RateLimited).await;
        metrics.unregister("a").await;
        assert!(metrics.snapshot().await.is_empty());
    }
}
