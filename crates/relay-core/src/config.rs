//! relay.toml configuration parser.
//!
//! Every key has a default, so an empty file (or no file at all) yields
//! a runnable configuration. Durations are kept as strings in the file
//! model and resolved through the accessor methods after `validate()`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::duration::parse_duration;
use crate::error::ConfigError;
use crate::types::parse_color;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Directory holding `relay.redb` and the rotated `relay.log.*` files.
    pub data_dir: PathBuf,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub worker: WorkerConfig,
    pub supervisor: SupervisorConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Bearer token expected on protected routes.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Pause between poll cycles, shared by every worker.
    pub cooldown: String,
    /// Timeout for a single source fetch or webhook call.
    pub request_timeout: String,
    /// Attempts per message before it is skipped (429s do not count).
    pub delivery_attempts: u32,
    /// Base delay between transient delivery retries.
    pub transient_delay: String,
    /// Upper bound for the cooldown while the source is unreachable.
    pub source_backoff_max: String,
    /// Forward everything visible on the first poll of a fresh channel.
    pub backfill: bool,
    /// Embed color for jobs without one.
    pub default_embed_color: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub sweep_interval: String,
    /// Missed cooldown cycles before a live worker is considered a zombie.
    pub zombie_cycles: u32,
    pub zombie_scope: ZombieScope,
    /// Sustained healthy time after which the restart counter resets.
    pub healthy_reset: String,
    /// Grace period for a worker to stop before it is aborted.
    pub stop_timeout: String,
}

/// Which workers a zombie detection restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ZombieScope {
    /// Every worker of the affected job.
    #[default]
    Job,
    /// Only the stale worker.
    Channel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Global requests-per-second ceiling across all routes.
    pub global_per_second: u32,
    /// Buckets unused for this long are evicted.
    pub bucket_idle: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            worker: WorkerConfig::default(),
            supervisor: SupervisorConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cooldown: "300s".to_string(),
            request_timeout: "30s".to_string(),
            delivery_attempts: 5,
            transient_delay: "2s".to_string(),
            source_backoff_max: "10m".to_string(),
            backfill: false,
            default_embed_color: None,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: "30s".to_string(),
            zombie_cycles: 4,
            zombie_scope: ZombieScope::Job,
            healthy_reset: "10m".to_string(),
            stop_timeout: "10s".to_string(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_per_second: 50,
            bucket_idle: "1h".to_string(),
        }
    }
}

impl RelayConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RelayConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check every duration and numeric bound.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("worker.cooldown", &self.worker.cooldown),
            ("worker.request_timeout", &self.worker.request_timeout),
            ("worker.transient_delay", &self.worker.transient_delay),
            ("worker.source_backoff_max", &self.worker.source_backoff_max),
            ("supervisor.sweep_interval", &self.supervisor.sweep_interval),
            ("supervisor.healthy_reset", &self.supervisor.healthy_reset),
            ("supervisor.stop_timeout", &self.supervisor.stop_timeout),
            ("rate_limit.bucket_idle", &self.rate_limit.bucket_idle),
        ];
        for (key, value) in durations {
            if parse_duration(value).is_none() {
                return Err(ConfigError::InvalidDuration {
                    key,
                    value: value.clone(),
                });
            }
        }

        if self.worker.delivery_attempts == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "worker.delivery_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.supervisor.zombie_cycles < 2 {
            return Err(ConfigError::InvalidSetting {
                key: "supervisor.zombie_cycles",
                reason: "must be at least 2".to_string(),
            });
        }
        // A worker backing off from a dead source must not look stalled.
        let stall_after = self
            .worker
            .cooldown()
            .saturating_mul(self.supervisor.zombie_cycles);
        if self.worker.source_backoff_max() >= stall_after {
            return Err(ConfigError::InvalidSetting {
                key: "worker.source_backoff_max",
                reason: format!(
                    "must be shorter than cooldown x zombie_cycles ({}s)",
                    stall_after.as_secs()
                ),
            });
        }
        if self.rate_limit.global_per_second == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "rate_limit.global_per_second",
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(color) = &self.worker.default_embed_color {
            parse_color(color)?;
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("relay.redb")
    }

    /// Base name of the operator log; rotated files append a date.
    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("relay.log")
    }
}

impl WorkerConfig {
    pub fn cooldown(&self) -> Duration {
        duration_or(&self.cooldown, 300)
    }

    pub fn request_timeout(&self) -> Duration {
        duration_or(&self.request_timeout, 30)
    }

    pub fn transient_delay(&self) -> Duration {
        duration_or(&self.transient_delay, 2)
    }

    pub fn source_backoff_max(&self) -> Duration {
        duration_or(&self.source_backoff_max, 600)
    }

    pub fn default_embed_color(&self) -> Option<u32> {
        self.default_embed_color
            .as_deref()
            .and_then(|c| parse_color(c).ok())
    }
}

impl SupervisorConfig {
    pub fn sweep_interval(&self) -> Duration {
        duration_or(&self.sweep_interval, 30)
    }

    pub fn healthy_reset(&self) -> Duration {
        duration_or(&self.healthy_reset, 600)
    }

    pub fn stop_timeout(&self) -> Duration {
        duration_or(&self.stop_timeout, 10)
    }
}

impl RateLimitConfig {
    pub fn bucket_idle(&self) -> Duration {
        duration_or(&self.bucket_idle, 3600)
    }
}

fn duration_or(value: &str, default_secs: u64) -> Duration {
    parse_duration(value).unwrap_or(Duration::from_secs(default_secs))
}
