//! Health report types and the status rules behind them.

use std::time::Duration;

use serde::Serialize;

use relay_core::human_age;
use relaygrid_ratelimit::RateLimiterStats;

use crate::record::WorkerSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Status from worker counts and cursor freshness.
    pub fn classify(total: usize, running: usize, freshness: &Freshness) -> Self {
        if total > 0 && running == 0 {
            HealthStatus::Unhealthy
        } else if running < total || freshness.verdict == FreshnessVerdict::Stale {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    fn worst(self, other: Self) -> Self {
        use HealthStatus::*;
        match (self, other) {
            (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
            (Degraded, _) | (_, Degraded) => Degraded,
            _ => Healthy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessVerdict {
    Fresh,
    Stale,
    /// No poll cycle has completed yet.
    Unknown,
}

/// How recently a poll cycle completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Freshness {
    pub verdict: FreshnessVerdict,
    /// Unix timestamp of the newest completed poll cycle.
    pub last_check: Option<u64>,
    pub age_secs: Option<u64>,
    /// Age as operators read it, e.g. `"3.5 minutes"`.
    pub age: Option<String>,
}

impl Freshness {
    pub fn from_last_check(last_check: Option<u64>, now: u64, stale_after: Duration) -> Self {
        let Some(checked) = last_check else {
            return Self {
                verdict: FreshnessVerdict::Unknown,
                last_check: None,
                age_secs: None,
                age: None,
            };
        };
        let age_secs = now.saturating_sub(checked);
        let verdict = if age_secs > stale_after.as_secs() {
            FreshnessVerdict::Stale
        } else {
            FreshnessVerdict::Fresh
        };
        Self {
            verdict,
            last_check: Some(checked),
            age_secs: Some(age_secs),
            age: Some(human_age(Duration::from_secs(age_secs))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    /// `None` until the first connectivity probe.
    pub reachable: Option<bool>,
    pub checked_secs_ago: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessCounts {
    /// Desired (job, channel) pairs.
    pub total: usize,
    pub running: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobHealth {
    pub name: String,
    pub status: HealthStatus,
    pub total: usize,
    pub running: usize,
    pub restarts: u64,
    pub freshness: Freshness,
    pub workers: Vec<WorkerSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// RFC 3339 time the report was produced.
    pub timestamp: String,
    pub uptime_secs: u64,
    pub uptime: String,
    pub processes: ProcessCounts,
    pub restarts: u64,
    pub source: SourceHealth,
    pub freshness: Freshness,
    pub rate_limiter: RateLimiterStats,
    pub jobs: Vec<JobHealth>,
}

/// Overall status: any unreachable source is unhealthy, otherwise the
/// worst of the aggregate and per-job verdicts.
pub fn overall_status(
    processes: &ProcessCounts,
    freshness: &Freshness,
    source: &SourceHealth,
    jobs: &[JobHealth],
) -> HealthStatus {
    if source.reachable == Some(false) {
        return HealthStatus::Unhealthy;
    }
    jobs.iter().fold(
        HealthStatus::classify(processes.total, processes.running, freshness),
        |acc, job| acc.worst(job.status),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Freshness {
        Freshness::from_last_check(Some(100), 110, Duration::from_secs(60))
    }

    #[test]
    fn freshness_verdicts() {
        assert_eq!(fresh().verdict, FreshnessVerdict::Fresh);
        assert_eq!(fresh().age.as_deref(), Some("10s"));

        let stale = Freshness::from_last_check(Some(100), 400, Duration::from_secs(60));
        assert_eq!(stale.verdict, FreshnessVerdict::Stale);
        assert_eq!(stale.age.as_deref(), Some("5.0 minutes"));

        let unknown = Freshness::from_last_check(None, 400, Duration::from_secs(60));
        assert_eq!(unknown.verdict, FreshnessVerdict::Unknown);
    }

    #[test]
    fn classify_from_counts() {
        assert_eq!(HealthStatus::classify(2, 2, &fresh()), HealthStatus::Healthy);
        assert_eq!(HealthStatus::classify(2, 1, &fresh()), HealthStatus::Degraded);
        assert_eq!(HealthStatus::classify(2, 0, &fresh()), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::classify(0, 0, &fresh()), HealthStatus::Healthy);

        let stale = Freshness::from_last_check(Some(0), 1000, Duration::from_secs(60));
        assert_eq!(HealthStatus::classify(2, 2, &stale), HealthStatus::Degraded);
    }

    #[test]
    fn unreachable_source_is_unhealthy() {
        let processes = ProcessCounts { total: 1, running: 1 };
        let down = SourceHealth {
            reachable: Some(false),
            checked_secs_ago: Some(3),
        };
        assert_eq!(
            overall_status(&processes, &fresh(), &down, &[]),
            HealthStatus::Unhealthy
        );

        let up = SourceHealth {
            reachable: Some(true),
            checked_secs_ago: Some(3),
        };
        assert_eq!(
            overall_status(&processes, &fresh(), &up, &[]),
            HealthStatus::Healthy
        );
    }
}
