//! Destination side: Discord-style webhook delivery.

use std::time::Duration;

use async_trait::async_trait;
use http::HeaderMap;
use serde::Serialize;

use relay_core::{DEFAULT_EMBED_COLOR, DeliveryTarget};

use crate::error::DeliveryError;
use crate::message::SourceMessage;

const EMBED_TITLE: &str = "Message Link";
const MAX_DESCRIPTION: usize = 4096;
const MAX_USERNAME: usize = 80;

/// Raw HTTP outcome of one delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl DeliveryResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Something a worker can deliver messages to.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn send(
        &self,
        target: &DeliveryTarget,
        message: &SourceMessage,
    ) -> Result<DeliveryResponse, DeliveryError>;
}

/// Posts one embed per message to a webhook URL.
pub struct DiscordWebhook {
    client: reqwest::Client,
    default_color: u32,
}

impl DiscordWebhook {
    pub fn new(timeout: Duration, default_color: Option<u32>) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("relaygrid/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DeliveryError::Network(e.to_string()))?;
        Ok(Self {
            client,
            default_color: default_color.unwrap_or(DEFAULT_EMBED_COLOR),
        })
    }

    /// The URL a message for `target` is posted to.
    pub fn delivery_url(target: &DeliveryTarget) -> Result<url::Url, DeliveryError> {
        let mut url = url::Url::parse(&target.webhook_url)
            .map_err(|e| DeliveryError::InvalidUrl(e.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("wait", "true");
            if let Some(thread) = &target.thread_id {
                query.append_pair("thread_id", thread);
            }
        }
        Ok(url)
    }

    pub fn payload(&self, target: &DeliveryTarget, message: &SourceMessage) -> WebhookPayload {
        build_payload(message, target.embed_color.unwrap_or(self.default_color))
    }
}

#[async_trait]
impl DeliverySink for DiscordWebhook {
    async fn send(
        &self,
        target: &DeliveryTarget,
        message: &SourceMessage,
    ) -> Result<DeliveryResponse, DeliveryError> {
        let url = Self::delivery_url(target)?;
        let payload = self.payload(target, message);

        let resp = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout(e.to_string())
                } else {
                    DeliveryError::Network(e.to_string())
                }
            })?;

        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
        Ok(DeliveryResponse {
            status,
            headers,
            body,
        })
    }
}

// ── Payload ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WebhookPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Embed {
    pub title: String,
    pub url: String,
    pub color: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<EmbedAuthor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<EmbedImage>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EmbedAuthor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EmbedImage {
    pub url: String,
}

/// Build the webhook body for a message.
///
/// Posts with neither text nor image (video, documents, polls) are sent
/// as a plain link instead of an empty embed.
pub fn build_payload(message: &SourceMessage, color: u32) -> WebhookPayload {
    let username = message.author.as_deref().map(|a| truncate(a, MAX_USERNAME));
    let avatar_url = message.author_icon.clone();

    if !message.has_content() {
        return WebhookPayload {
            username,
            avatar_url,
            content: Some(format!(
                "Unable to parse the message due to attached media and/or document. [Message Link]({})",
                message.link
            )),
            embeds: Vec::new(),
        };
    }

    let author = message.author.as_ref().map(|name| EmbedAuthor {
        name: truncate(name, MAX_USERNAME),
        icon_url: message.author_icon.clone(),
        url: message.link.clone(),
    });
    let embed = Embed {
        title: EMBED_TITLE.to_string(),
        url: message.link.clone(),
        color,
        author,
        description: message.text.as_deref().map(|t| truncate(t, MAX_DESCRIPTION)),
        timestamp: message.timestamp.map(|t| t.to_rfc3339()),
        image: message.image.clone().map(|url| EmbedImage { url }),
    };
    WebhookPayload {
        username,
        avatar_url,
        content: None,
        embeds: vec![embed],
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
