use std::fmt;

use serde::Serialize;

/// Identity of a destination route before the server assigns a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RouteKey(String);

impl RouteKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derive the default key from a webhook URL.
    ///
    /// `https://host/api/webhooks/{id}/{token}` maps to `webhook:{id}`.
    /// Anything else falls back to `url:{host}{path}`, ignoring the query.
    pub fn for_webhook(raw: &str) -> Self {
        let Ok(parsed) = url::Url::parse(raw) else {
            return Self(format!("url:{raw}"));
        };
        let mut segments = parsed.path_segments().into_iter().flatten();
        while let Some(segment) = segments.next() {
            if segment == "webhooks" {
                if let Some(id) = segments.next().filter(|id| !id.is_empty()) {
                    return Self(format!("webhook:{id}"));
                }
            }
        }
        Self(format!(
            "url:{}{}",
            parsed.host_str().unwrap_or_default(),
            parsed.path()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_urls_key_by_id() {
        let key = RouteKey::for_webhook("https://discord.com/api/webhooks/1234/secret-token?wait=true");
        assert_eq!(key.as_str(), "webhook:1234");

        let versioned = RouteKey::for_webhook("https://discord.com/api/v10/webhooks/1234/other");
        assert_eq!(versioned, key);
    }

    #[test]
    fn other_urls_fall_back_to_host_and_path() {
        let key = RouteKey::for_webhook("http://127.0.0.1:9000/hook?x=1");
        assert_eq!(key.as_str(), "url:127.0.0.1/hook");
        assert_eq!(RouteKey::for_webhook("not a url").as_str(), "url:not a url");
    }
}
