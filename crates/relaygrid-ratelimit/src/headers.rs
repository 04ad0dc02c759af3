//! Parsing of rate-limit response metadata.

use std::time::Duration;

use http::HeaderMap;
use serde::Deserialize;

const LIMIT: &str = "x-ratelimit-limit";
const REMAINING: &str = "x-ratelimit-remaining";
const RESET_AFTER: &str = "x-ratelimit-reset-after";
const BUCKET: &str = "x-ratelimit-bucket";
const GLOBAL: &str = "x-ratelimit-global";
const RETRY_AFTER: &str = "retry-after";

/// Wait applied when a 429 carries no usable retry hint.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// The `X-RateLimit-*` headers of one response. Missing or malformed
/// headers come back as `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_after: Option<Duration>,
    pub bucket: Option<String>,
}

impl RateLimitHeaders {
    pub fn parse(headers: &HeaderMap) -> Self {
        Self {
            limit: header_str(headers, LIMIT).and_then(|v| v.parse().ok()),
            remaining: header_str(headers, REMAINING).and_then(|v| v.parse().ok()),
            reset_after: header_str(headers, RESET_AFTER).and_then(secs_f64),
            bucket: header_str(headers, BUCKET)
                .filter(|v| !v.is_empty())
                .map(str::to_string),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// How long a 429 asks us to wait, and whether the block is global.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryAfter {
    pub after: Duration,
    pub global: bool,
}

#[derive(Deserialize)]
struct RateLimitedBody {
    retry_after: Option<f64>,
    #[serde(default)]
    global: bool,
}

impl RetryAfter {
    /// Read the JSON body first, then the `Retry-After` header, then
    /// fall back to one second.
    pub fn parse(headers: &HeaderMap, body: &[u8]) -> Self {
        let header_global = header_str(headers, GLOBAL) == Some("true");

        if let Ok(parsed) = serde_json::from_slice::<RateLimitedBody>(body) {
            if let Some(after) = parsed.retry_after.and_then(duration_from_secs) {
                return Self {
                    after,
                    global: parsed.global || header_global,
                };
            }
        }

        let after = header_str(headers, RETRY_AFTER)
            .and_then(secs_f64)
            .unwrap_or(DEFAULT_RETRY_AFTER);
        Self {
            after,
            global: header_global,
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn secs_f64(raw: &str) -> Option<Duration> {
    raw.parse::<f64>().ok().and_then(duration_from_secs)
}

fn duration_from_secs(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}
