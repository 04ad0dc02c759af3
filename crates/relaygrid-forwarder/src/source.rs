//! Source side: reading posts from public channel preview pages.

use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use regex::{Captures, Regex};
use tracing::debug;

use crate::error::SourceError;
use crate::message::SourceMessage;

/// A readable stream of channel posts.
#[async_trait]
pub trait SourceFeed: Send + Sync {
    /// Posts currently visible on the channel, in any order.
    async fn fetch(&self, channel: &str) -> Result<Vec<SourceMessage>, SourceError>;

    /// Whether the source platform answers at all.
    async fn probe(&self) -> bool;
}

/// Reads `https://t.me/s/{channel}` preview pages.
pub struct TelegramPreview {
    client: reqwest::Client,
    base_url: String,
    extractor: PreviewExtractor,
}

impl TelegramPreview {
    pub const DEFAULT_BASE_URL: &'static str = "https://t.me";

    pub fn new(timeout: Duration) -> Result<Self, SourceError> {
        Self::with_base_url(Self::DEFAULT_BASE_URL, timeout)
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("relaygrid/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SourceError::Init(e.to_string()))?;
        let extractor = PreviewExtractor::new().map_err(|e| SourceError::Init(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            extractor,
        })
    }
}

#[async_trait]
impl SourceFeed for TelegramPreview {
    async fn fetch(&self, channel: &str) -> Result<Vec<SourceMessage>, SourceError> {
        let url = format!("{}/s/{channel}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SourceError::Unreachable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(SourceError::Status(resp.status().as_u16()));
        }
        let html = resp
            .text()
            .await
            .map_err(|e| SourceError::Unreachable(e.to_string()))?;
        let messages = self.extractor.extract(channel, &html);
        debug!(%channel, count = messages.len(), "preview page parsed");
        Ok(messages)
    }

    async fn probe(&self) -> bool {
        match self.client.get(format!("{}/", self.base_url)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "source probe failed");
                false
            }
        }
    }
}

/// Minimal extractor for preview page markup.
///
/// Reads the post id, author, author icon, text, first image, timestamp
/// and media count of every post block. Anything it cannot find is left
/// empty.
pub struct PreviewExtractor {
    post: Regex,
    author: Regex,
    icon: Regex,
    text: Regex,
    image: Regex,
    time: Regex,
    media: Regex,
    markup: Markup,
}

impl PreviewExtractor {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            post: Regex::new(r#"data-post="([A-Za-z0-9_]+)/(\d+)""#)?,
            author: Regex::new(r#"(?s)class="tgme_widget_message_owner_name"[^>]*>(.*?)</a>"#)?,
            icon: Regex::new(r#"(?s)tgme_widget_message_user_photo[^>]*>\s*<img src="([^"]+)""#)?,
            text: Regex::new(r#"(?s)<div class="tgme_widget_message_text[^"]*"[^>]*>(.*?)</div>"#)?,
            image: Regex::new(r#"tgme_widget_message_photo_wrap[^>]*?background-image:url\('([^']+)'\)"#)?,
            time: Regex::new(r#"<time[^>]*datetime="([^"]+)""#)?,
            media: Regex::new(
                r#"class="(?:[^"]*\s)?(?:tgme_widget_message_photo_wrap|tgme_widget_message_video)[\s"]"#,
            )?,
            markup: Markup::new()?,
        })
    }

    /// Extract every post of `channel` from a preview page.
    pub fn extract(&self, channel: &str, html: &str) -> Vec<SourceMessage> {
        let posts: Vec<_> = self.post.captures_iter(html).collect();
        let mut messages = Vec::with_capacity(posts.len());

        for (i, caps) in posts.iter().enumerate() {
            let (Some(whole), Some(name), Some(id)) = (caps.get(0), caps.get(1), caps.get(2)) else {
                continue;
            };
            if !name.as_str().eq_ignore_ascii_case(channel) {
                continue;
            }
            let Ok(id) = id.as_str().parse::<u64>() else {
                continue;
            };
            let end = posts
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map_or(html.len(), |m| m.start());
            let block = &html[whole.start()..end];

            let mut message = SourceMessage::bare(name.as_str(), id);
            message.author = capture(&self.author, block)
                .map(|a| self.markup.plain(a))
                .filter(|a| !a.is_empty());
            message.author_icon = capture(&self.icon, block).map(decode_entities);
            message.text = capture(&self.text, block)
                .map(|t| self.markup.render(t))
                .filter(|t| !t.trim().is_empty());
            message.image = capture(&self.image, block).map(decode_entities);
            message.timestamp = capture(&self.time, block)
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok());
            message.media_count = self.media.find_iter(block).count();
            messages.push(message);
        }
        messages
    }
}

fn capture<'a>(re: &Regex, block: &'a str) -> Option<&'a str> {
    re.captures(block).and_then(|c| c.get(1)).map(|m| m.as_str())
}

/// Converts post HTML into Discord markdown.
struct Markup {
    line_break: Regex,
    wrappers: Vec<(Regex, &'static str, &'static str)>,
    anchor: Regex,
    blockquote: Regex,
    tag: Regex,
    numeric_entity: Regex,
}

impl Markup {
    fn new() -> Result<Self, regex::Error> {
        let wrap = |tags: &str| {
            Regex::new(&format!(r"(?s)<(?:{tags})(?:\s[^>]*)?>(.*?)</(?:{tags})>"))
        };
        Ok(Self {
            line_break: Regex::new(r"<br\s*/?>")?,
            wrappers: vec![
                (wrap("pre")?, "```", "```"),
                (wrap("code")?, "`", "`"),
                (wrap("b|strong")?, "**", "**"),
                (wrap("i|em")?, "*", "*"),
                (wrap("u")?, "__", "__"),
                (wrap("s|strike|del")?, "~~", "~~"),
                (wrap("tg-spoiler")?, "||", "||"),
            ],
            anchor: Regex::new(r#"(?s)<a\s[^>]*?href="([^"]*)"[^>]*>(.*?)</a>"#)?,
            blockquote: Regex::new(r"(?s)<blockquote(?:\s[^>]*)?>(.*?)</blockquote>")?,
            tag: Regex::new(r"<[^>]+>")?,
            numeric_entity: Regex::new(r"&#(x[0-9A-Fa-f]+|\d+);")?,
        })
    }

    fn render(&self, html: &str) -> String {
        let mut out = self.line_break.replace_all(html, "\n").into_owned();
        for (re, open, close) in &self.wrappers {
            out = re
                .replace_all(&out, |c: &Captures| format!("{open}{}{close}", &c[1]))
                .into_owned();
        }
        out = self
            .anchor
            .replace_all(&out, |c: &Captures| {
                let href = decode_entities(&c[1]);
                let label = self.plain(&c[2]);
                if label.is_empty() || label == href {
                    href
                } else {
                    format!("[{label}]({href})")
                }
            })
            .into_owned();
        out = self
            .blockquote
            .replace_all(&out, |c: &Captures| {
                let quoted: Vec<String> = c[1].lines().map(|l| format!("> {l}")).collect();
                format!("{}\n", quoted.join("\n"))
            })
            .into_owned();
        let stripped = self.tag.replace_all(&out, "");
        self.decode(&stripped).trim().to_string()
    }

    /// Tag-free text with entities decoded.
    fn plain(&self, html: &str) -> String {
        let stripped = self.tag.replace_all(html, "");
        self.decode(&stripped).trim().to_string()
    }

    fn decode(&self, text: &str) -> String {
        let numeric = self.numeric_entity.replace_all(text, |c: &Captures| {
            let raw = &c[1];
            let code = match raw.strip_prefix('x') {
                Some(hex) => u32::from_str_radix(hex, 16).ok(),
                None => raw.parse().ok(),
            };
            code.and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_default()
        });
        decode_entities(&numeric)
    }
}

fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
<div class="tgme_widget_message_wrap js-widget_message_wrap"><div class="tgme_widget_message js-widget_message" data-post="news/41" data-view="x">
  <div class="tgme_widget_message_user"><a href="https://t.me/news"><i class="tgme_widget_message_user_photo bgcolor1" data-content="N"><img src="https://cdn.example/icon.jpg"></i></a></div>
  <div class="tgme_widget_message_author accent_color"><a class="tgme_widget_message_owner_name" href="https://t.me/news"><span dir="auto">News &amp; Views</span></a></div>
  <div class="tgme_widget_message_text js-message_text" dir="auto">Hello <b>world</b><br/>see <a href="https://example.com/a" target="_blank">this</a> and <a href="https://example.com/b">https://example.com/b</a></div>
  <a class="tgme_widget_message_date" href="https://t.me/news/41"><time datetime="2024-03-01T10:00:00+00:00" class="time">10:00</time></a>
</div></div>
<div class="tgme_widget_message_wrap js-widget_message_wrap"><div class="tgme_widget_message js-widget_message" data-post="news/42">
  <div class="tgme_widget_message_author accent_color"><a class="tgme_widget_message_owner_name" href="https://t.me/news"><span dir="auto">News &amp; Views</span></a></div>
  <a class="tgme_widget_message_photo_wrap 1 2" href="https://t.me/news/42" style="width:800px;background-image:url('https://cdn.example/photo.jpg')"></a>
  <a class="tgme_widget_message_date" href="https://t.me/news/42"><time datetime="2024-03-01T11:30:00+02:00" class="time">11:30</time></a>
</div></div>
<div class="tgme_widget_message_wrap js-widget_message_wrap"><div class="tgme_widget_message js-widget_message" data-post="news/43">
  <div class="tgme_widget_message_text js-message_text" dir="auto"><blockquote>quoted<br/>twice</blockquote><tg-spoiler>secret</tg-spoiler> &#33; &#x263A; 1 &lt; 2</div>
</div></div>
<div class="tgme_widget_message_wrap js-widget_message_wrap"><div class="tgme_widget_message js-widget_message" data-post="news/44">
  <div class="tgme_widget_message_grouped_wrap js-message_grouped_wrap"><div class="tgme_widget_message_grouped js-message_grouped">
    <a class="tgme_widget_message_photo_wrap grouped_media_wrap blured js-message_photo" href="https://t.me/news/44?single" style="width:400px;background-image:url('https://cdn.example/a.jpg')"></a>
    <a class="tgme_widget_message_photo_wrap grouped_media_wrap blured js-message_photo" href="https://t.me/news/45?single" style="width:400px;background-image:url('https://cdn.example/b.jpg')"></a>
    <a class="tgme_widget_message_video_player grouped_media_wrap blured js-message_video_player" href="https://t.me/news/46?single"><video class="tgme_widget_message_video js-message_video" src="https://cdn.example/c.mp4"></video></a>
  </div></div>
</div></div>
"#;

    #[test]
    fn extracts_posts_in_page_order() {
        let extractor = PreviewExtractor::new().unwrap();
        let messages = extractor.extract("news", PAGE);

        let ids: Vec<u64> = messages.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![41, 42, 43, 44]);

        let first = &messages[0];
        assert_eq!(first.link, "https://t.me/news/41");
        assert_eq!(first.author.as_deref(), Some("News & Views"));
        assert_eq!(first.author_icon.as_deref(), Some("https://cdn.example/icon.jpg"));
        assert_eq!(
            first.text.as_deref(),
            Some("Hello **world**\nsee [this](https://example.com/a) and https://example.com/b")
        );
        assert_eq!(first.image, None);
        assert_eq!(
            first.timestamp.unwrap().to_rfc3339(),
            "2024-03-01T10:00:00+00:00"
        );
    }

    #[test]
    fn extracts_images_and_formatting() {
        let extractor = PreviewExtractor::new().unwrap();
        let messages = extractor.extract("news", PAGE);

        let photo = &messages[1];
        assert_eq!(photo.text, None);
        assert_eq!(photo.image.as_deref(), Some("https://cdn.example/photo.jpg"));
        assert!(photo.has_content());

        let quoted = &messages[2];
        assert_eq!(
            quoted.text.as_deref(),
            Some("> quoted\n> twice\n||secret|| ! \u{263A} 1 < 2")
        );
    }

    #[test]
    fn counts_album_media() {
        let extractor = PreviewExtractor::new().unwrap();
        let messages = extractor.extract("news", PAGE);
        let counts: Vec<usize> = messages.iter().map(|m| m.media_count).collect();
        assert_eq!(counts, vec![0, 1, 0, 3]);

        let album = &messages[3];
        assert_eq!(album.image.as_deref(), Some("https://cdn.example/a.jpg"));
        assert_eq!(album.album_parts().collect::<Vec<_>>(), vec![45, 46]);
    }

    #[test]
    fn ignores_posts_from_other_channels() {
        let extractor = PreviewExtractor::new().unwrap();
        assert!(extractor.extract("other", PAGE).is_empty());
        assert_eq!(extractor.extract("NEWS", PAGE).len(), 4);
    }

    #[tokio::test]
    async fn fetch_reads_preview_page_and_maps_errors() {
        use axum::{Router, http::StatusCode, routing::get};

        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .route("/s/news", get(|| async { PAGE }))
            .route("/s/gone", get(|| async { StatusCode::NOT_FOUND }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let base = format!("http://{addr}");
        let source = TelegramPreview::with_base_url(&base, Duration::from_secs(5)).unwrap();
        assert!(source.probe().await);
        assert_eq!(source.fetch("news").await.unwrap().len(), 4);
        assert_eq!(source.fetch("gone").await, Err(SourceError::Status(404)));
    }
}
