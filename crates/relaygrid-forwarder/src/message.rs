use chrono::{DateTime, FixedOffset};

/// One post read from a source channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceMessage {
    /// Per-channel sequence number; strictly increasing over time.
    pub id: u64,
    pub channel: String,
    /// Public link to the post.
    pub link: String,
    pub author: Option<String>,
    pub author_icon: Option<String>,
    /// Post text rendered as Discord markdown.
    pub text: Option<String>,
    /// First attached image.
    pub image: Option<String>,
    pub timestamp: Option<DateTime<FixedOffset>>,
    /// Photos and videos in the post. An album of `n` items takes the
    /// `n - 1` ids after this one, which never show up on their own.
    pub media_count: usize,
}

/// Text posted in place of a message the source skipped over.
pub const MISSING_TEXT: &str =
    "This message could not be read from the channel. Open the link to view it.";

impl SourceMessage {
    /// A message with no content beyond its id.
    pub fn bare(channel: &str, id: u64) -> Self {
        Self {
            id,
            channel: channel.to_string(),
            link: format!("https://t.me/{channel}/{id}"),
            author: None,
            author_icon: None,
            text: None,
            image: None,
            timestamp: None,
            media_count: 0,
        }
    }

    /// Stand-in for a post that never appeared between two visible ones,
    /// attributed like the post that followed it.
    pub fn missing(id: u64, neighbour: &SourceMessage) -> Self {
        let mut message = Self::bare(&neighbour.channel, id);
        message.author = neighbour.author.clone();
        message.author_icon = neighbour.author_icon.clone();
        message.timestamp = neighbour.timestamp;
        message.text = Some(MISSING_TEXT.to_string());
        message
    }

    /// Ids of the album items folded into this post.
    pub fn album_parts(&self) -> std::ops::Range<u64> {
        let extra = self.media_count.saturating_sub(1) as u64;
        self.id.saturating_add(1)..self.id.saturating_add(1).saturating_add(extra)
    }

    pub fn has_content(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.trim().is_empty()) || self.image.is_some()
    }
}
