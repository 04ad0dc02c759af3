//! Validation errors for job definitions and configuration.

use thiserror::Error;

/// A job definition or configuration value was rejected.
///
/// Raised synchronously before anything is persisted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid job name {0:?}: use 1-64 characters from [A-Za-z0-9_.-]")]
    InvalidName(String),

    #[error("webhook url is required")]
    MissingWebhook,

    #[error("invalid webhook url {url:?}: {reason}")]
    InvalidWebhook { url: String, reason: String },

    #[error("at least one source channel is required")]
    NoChannels,

    #[error("invalid source channel {0:?}")]
    InvalidChannel(String),

    #[error("invalid embed color {0:?}: expected a hex value like #5865f2")]
    InvalidColor(String),

    #[error("invalid thread id {0:?}: expected a numeric id")]
    InvalidThreadId(String),

    #[error("no updates provided")]
    EmptyPatch,

    #[error("invalid duration for {key}: {value:?}")]
    InvalidDuration { key: &'static str, value: String },

    #[error("invalid setting {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },
}
