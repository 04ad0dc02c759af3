//! Domain types shared across relaygrid crates.
//!
//! A `Job` binds an ordered set of source channels to one webhook
//! destination. Every (job, channel) pair is served by one worker,
//! identified by a `WorkerKey`.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ConfigError;

/// Unique name of a job (primary key in the job registry).
pub type JobName = String;

/// Embed color used when a job does not pick one.
pub const DEFAULT_EMBED_COLOR: u32 = 0x5865F2;

const PREVIEW_PREFIXES: [&str; 4] = ["https://t.me/", "http://t.me/", "t.me/", "@"];

// ── Job ───────────────────────────────────────────────────────────

/// A persisted forwarding configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    pub name: JobName,
    /// Destination webhook URL.
    pub webhook_url: String,
    /// Normalized channel identifiers (`name` or `name/<start id>`).
    pub channels: Vec<String>,
    /// Embed color as `#rrggbb`.
    #[serde(default)]
    pub embed_color: Option<String>,
    /// Destination thread binding.
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Unix timestamp (seconds) when the job was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last modification.
    pub updated_at: u64,
}

impl Job {
    /// The destination binding every worker of this job delivers to.
    pub fn target(&self) -> DeliveryTarget {
        DeliveryTarget {
            webhook_url: self.webhook_url.clone(),
            thread_id: self.thread_id.clone(),
            embed_color: self
                .embed_color
                .as_deref()
                .and_then(|c| parse_color(c).ok()),
        }
    }

    /// Parsed channel references, in job order.
    pub fn channel_refs(&self) -> Vec<ChannelRef> {
        self.channels
            .iter()
            .filter_map(|c| ChannelRef::parse(c).ok())
            .collect()
    }

    /// One worker key per channel of this job.
    pub fn worker_keys(&self) -> Vec<WorkerKey> {
        self.channel_refs()
            .into_iter()
            .map(|c| WorkerKey::new(&self.name, &c.name))
            .collect()
    }
}

/// Where and how a worker delivers.
///
/// Two workers with equal targets can be left running across a job
/// update; any difference forces a replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTarget {
    pub webhook_url: String,
    pub thread_id: Option<String>,
    pub embed_color: Option<u32>,
}

// ── Create / patch requests ───────────────────────────────────────

/// Fields accepted when creating a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewJob {
    pub name: JobName,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub embed_color: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
}

impl NewJob {
    /// Validate and stamp a new job.
    pub fn into_job(self, now: u64) -> Result<Job, ConfigError> {
        validate_name(&self.name)?;
        let webhook_url = validate_webhook(&self.webhook_url)?;
        let channels = normalize_channels(&self.channels)?;
        let embed_color = self.embed_color.as_deref().map(normalize_color).transpose()?;
        let thread_id = normalize_thread_id(self.thread_id.as_deref())?;

        Ok(Job {
            name: self.name,
            webhook_url,
            channels,
            embed_color,
            thread_id,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Partial update of a job. Absent fields are left untouched.
///
/// `embed_color` and `thread_id` distinguish "absent" from an explicit
/// `null`, which clears the value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<String>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub embed_color: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub thread_id: Option<Option<String>>,
}

impl JobPatch {
    pub fn is_empty(&self) -> bool {
        self.webhook_url.is_none()
            && self.channels.is_none()
            && self.embed_color.is_none()
            && self.thread_id.is_none()
    }

    /// Validate the patch and merge it into `job`.
    ///
    /// `job` is left untouched when validation fails.
    pub fn apply(&self, job: &mut Job, now: u64) -> Result<(), ConfigError> {
        if self.is_empty() {
            return Err(ConfigError::EmptyPatch);
        }

        let webhook_url = self.webhook_url.as_deref().map(validate_webhook).transpose()?;
        let channels = self.channels.as_deref().map(normalize_channels).transpose()?;
        let embed_color = match &self.embed_color {
            Some(Some(c)) => Some(Some(normalize_color(c)?)),
            Some(None) => Some(None),
            None => None,
        };
        let thread_id = match &self.thread_id {
            Some(t) => Some(normalize_thread_id(t.as_deref())?),
            None => None,
        };

        if let Some(url) = webhook_url {
            job.webhook_url = url;
        }
        if let Some(channels) = channels {
            job.channels = channels;
        }
        if let Some(color) = embed_color {
            job.embed_color = color;
        }
        if let Some(thread) = thread_id {
            job.thread_id = thread;
        }
        job.updated_at = now;
        Ok(())
    }
}

fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

// ── Channels ──────────────────────────────────────────────────────

/// A source channel, optionally pinned to start after a message id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelRef {
    pub name: String,
    pub start_after: Option<u64>,
}

impl ChannelRef {
    /// Accepts `name`, `@name`, `name/123`, and public preview links
    /// such as `https://t.me/name`, `https://t.me/s/name` or
    /// `https://t.me/name/123`.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidChannel(raw.to_string());

        let mut rest = raw.trim();
        for prefix in PREVIEW_PREFIXES {
            if let Some(stripped) = rest.strip_prefix(prefix) {
                rest = stripped;
                break;
            }
        }
        let rest = rest.strip_prefix("s/").unwrap_or(rest);
        let rest = rest.split(['?', '#']).next().unwrap_or_default();
        let mut parts = rest.trim_end_matches('/').split('/');

        let name = parts.next().filter(|n| is_channel_name(n)).ok_or_else(invalid)?;
        let start_after = match parts.next() {
            Some(id) => Some(id.parse::<u64>().map_err(|_| invalid())?),
            None => None,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self {
            name: name.to_string(),
            start_after,
        })
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.start_after {
            Some(id) => write!(f, "{}/{}", self.name, id),
            None => f.write_str(&self.name),
        }
    }
}

fn is_channel_name(s: &str) -> bool {
    !s.is_empty() && s.len() <= 64 && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ── Worker identity ───────────────────────────────────────────────

/// Identity of one forwarding worker: a (job, channel) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerKey {
    pub job: JobName,
    pub channel: String,
}

impl WorkerKey {
    pub fn new(job: &str, channel: &str) -> Self {
        Self {
            job: job.to_string(),
            channel: channel.to_string(),
        }
    }

    /// Composite key for tables keyed per worker.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.job, self.channel)
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job, self.channel)
    }
}

// ── Validation helpers ────────────────────────────────────────────

fn validate_name(name: &str) -> Result<(), ConfigError> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidName(name.to_string()))
    }
}

fn validate_webhook(raw: &str) -> Result<String, ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ConfigError::MissingWebhook);
    }
    let invalid = |reason: &str| ConfigError::InvalidWebhook {
        url: raw.to_string(),
        reason: reason.to_string(),
    };
    let parsed = url::Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if parsed.host_str().is_none() {
        return Err(invalid("missing host"));
    }
    Ok(raw.to_string())
}

fn normalize_channels(raw: &[String]) -> Result<Vec<String>, ConfigError> {
    let mut seen = Vec::<String>::new();
    let mut out = Vec::new();
    for entry in raw {
        let channel = ChannelRef::parse(entry)?;
        if seen.contains(&channel.name) {
            continue;
        }
        seen.push(channel.name.clone());
        out.push(channel.to_string());
    }
    if out.is_empty() {
        return Err(ConfigError::NoChannels);
    }
    Ok(out)
}

/// Parse `#rrggbb`, `0xrrggbb` or `rrggbb` into an RGB integer.
pub fn parse_color(raw: &str) -> Result<u32, ConfigError> {
    let trimmed = raw.trim();
    let hex = trimmed
        .strip_prefix('#')
        .or_else(|| trimmed.strip_prefix("0x"))
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if hex.is_empty() || hex.len() > 6 {
        return Err(ConfigError::InvalidColor(raw.to_string()));
    }
    u32::from_str_radix(hex, 16).map_err(|_| ConfigError::InvalidColor(raw.to_string()))
}

fn normalize_color(raw: &str) -> Result<String, ConfigError> {
    parse_color(raw).map(|c| format!("#{c:06x}"))
}

fn normalize_thread_id(raw: Option<&str>) -> Result<Option<String>, ConfigError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(id) if id.chars().all(|c| c.is_ascii_digit()) => Ok(Some(id.to_string())),
        Some(id) => Err(ConfigError::InvalidThreadId(id.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job(name: &str) -> NewJob {
        NewJob {
            name: name.to_string(),
            webhook_url: "https://discord.com/api/webhooks/123/abc".to_string(),
            channels: vec!["news".to_string(), "https://t.me/s/updates".to_string()],
            embed_color: None,
            thread_id: None,
        }
    }

    #[test]
    fn new_job_is_stamped_and_normalized() {
        let job = new_job("j1").into_job(1000).unwrap();
        assert_eq!(job.channels, vec!["news", "updates"]);
        assert_eq!(job.created_at, 1000);
        assert_eq!(job.updated_at, 1000);
    }

    #[test]
    fn new_job_rejects_bad_fields() {
        let mut bad = new_job("has space");
        assert!(matches!(bad.clone().into_job(0), Err(ConfigError::InvalidName(_))));

        bad.name = "ok".to_string();
        bad.channels.clear();
        assert_eq!(bad.clone().into_job(0), Err(ConfigError::NoChannels));

        bad.channels = vec!["news".to_string()];
        bad.webhook_url = String::new();
        assert_eq!(bad.clone().into_job(0), Err(ConfigError::MissingWebhook));

        bad.webhook_url = "ftp://example.com/hook".to_string();
        assert!(matches!(bad.into_job(0), Err(ConfigError::InvalidWebhook { .. })));
    }

    #[test]
    fn duplicate_channels_keep_first_occurrence() {
        let mut req = new_job("j1");
        req.channels = vec![
            "b".to_string(),
            "@a".to_string(),
            "https://t.me/b/44".to_string(),
        ];
        let job = req.into_job(0).unwrap();
        assert_eq!(job.channels, vec!["b", "a"]);
    }

    #[test]
    fn channel_ref_accepts_preview_forms() {
        assert_eq!(ChannelRef::parse("news").unwrap().name, "news");
        assert_eq!(ChannelRef::parse("@news").unwrap().name, "news");
        assert_eq!(ChannelRef::parse("https://t.me/s/news").unwrap().name, "news");

        let pinned = ChannelRef::parse("https://t.me/news/120").unwrap();
        assert_eq!(pinned.start_after, Some(120));
        assert_eq!(pinned.to_string(), "news/120");
    }

    #[test]
    fn channel_ref_rejects_garbage() {
        assert!(ChannelRef::parse("").is_err());
        assert!(ChannelRef::parse("news/abc").is_err());
        assert!(ChannelRef::parse("a/1/2").is_err());
        assert!(ChannelRef::parse("bad-name").is_err());
    }

    #[test]
    fn colors_are_normalized() {
        assert_eq!(parse_color("#5865F2").unwrap(), 0x5865F2);
        assert_eq!(parse_color("0xff0000").unwrap(), 0xFF0000);
        assert_eq!(normalize_color("FF00AA").unwrap(), "#ff00aa");
        assert!(parse_color("#1234567").is_err());
        assert!(parse_color("blue").is_err());
    }

    #[test]
    fn patch_applies_only_supplied_fields() {
        let mut job = new_job("j1").into_job(1000).unwrap();
        job.thread_id = Some("42".to_string());

        let patch = JobPatch {
            embed_color: Some(Some("#00ff00".to_string())),
            ..JobPatch::default()
        };
        patch.apply(&mut job, 2000).unwrap();

        assert_eq!(job.embed_color.as_deref(), Some("#00ff00"));
        assert_eq!(job.thread_id.as_deref(), Some("42"));
        assert_eq!(job.channels, vec!["news", "updates"]);
        assert_eq!(job.created_at, 1000);
        assert_eq!(job.updated_at, 2000);
    }

    #[test]
    fn patch_null_clears_optional_fields() {
        let mut job = new_job("j1").into_job(1000).unwrap();
        job.thread_id = Some("42".to_string());

        let patch: JobPatch = serde_json::from_str(r#"{"thread_id": null}"#).unwrap();
        assert_eq!(patch.thread_id, Some(None));
        assert_eq!(patch.embed_color, None);

        patch.apply(&mut job, 2000).unwrap();
        assert_eq!(job.thread_id, None);
    }

    #[test]
    fn invalid_patch_leaves_job_untouched() {
        let mut job = new_job("j1").into_job(1000).unwrap();
        let before = job.clone();

        let patch = JobPatch {
            webhook_url: Some("https://example.com/new".to_string()),
            channels: Some(vec![]),
            ..JobPatch::default()
        };
        assert_eq!(patch.apply(&mut job, 2000), Err(ConfigError::NoChannels));
        assert_eq!(job, before);

        assert_eq!(JobPatch::default().apply(&mut job, 2000), Err(ConfigError::EmptyPatch));
    }

    #[test]
    fn target_changes_with_destination_fields() {
        let job = new_job("j1").into_job(0).unwrap();
        let mut other = job.clone();
        other.embed_color = Some("#010203".to_string());
        assert_ne!(job.target(), other.target());
        assert_eq!(other.target().embed_color, Some(0x010203));
    }

    #[test]
    fn worker_keys_follow_channel_order() {
        let job = new_job("j1").into_job(0).unwrap();
        let keys = job.worker_keys();
        assert_eq!(keys, vec![WorkerKey::new("j1", "news"), WorkerKey::new("j1", "updates")]);
        assert_eq!(keys[0].table_key(), "j1:news");
        assert_eq!(keys[0].to_string(), "j1/news");
    }
}
