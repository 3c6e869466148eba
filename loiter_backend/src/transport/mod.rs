//! Chat platform boundary.
//!
//! Platform adapters translate their native updates into [`InboundEvent`]s and
//! implement [`Transport`] for everything the engine sends back out.

pub mod error;
pub mod telegram;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use error::{TransportError, TransportResult};

pub type UserId = i64;
pub type MessageId = i64;
pub type ChannelId = i64;

const IMAGE_CONTENT_TYPES: [&str; 5] = ["png", "jpeg", "jpg", "webp", "gif"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundAuthor {
    pub id: UserId,
    pub name: String,
    pub is_bot: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub content_type: Option<String>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        match self.content_type.as_deref() {
            Some(ct) => {
                let ct = ct.to_ascii_lowercase();
                IMAGE_CONTENT_TYPES
                    .iter()
                    .any(|kind| ct == format!("image/{}", kind))
            }
            None => {
                let path = self.url.split('?').next().unwrap_or_default().to_ascii_lowercase();
                IMAGE_CONTENT_TYPES
                    .iter()
                    .any(|kind| path.ends_with(&format!(".{}", kind)))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedKind {
    Image,
    Gifv,
    Video,
    Link,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEmbed {
    pub kind: EmbedKind,
    pub image_url: Option<String>,
    pub thumbnail_url: Option<String>,
}

impl InboundEmbed {
    /// Still frame worth describing, if this embed is visual.
    pub fn image_source(&self) -> Option<&str> {
        match self.kind {
            EmbedKind::Image | EmbedKind::Gifv => self
                .image_url
                .as_deref()
                .or(self.thumbnail_url.as_deref()),
            EmbedKind::Video | EmbedKind::Link => None,
        }
    }
}

/// The message being replied to, as far as the platform embeds it in the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyReference {
    pub message_id: MessageId,
    pub author_id: Option<UserId>,
    pub author_name: Option<String>,
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author: InboundAuthor,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub reply_reference: Option<ReplyReference>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub embeds: Vec<InboundEmbed>,
}

impl InboundMessage {
    /// First analyzable image: attachments win over embeds.
    pub fn first_image_url(&self) -> Option<&str> {
        self.attachments
            .iter()
            .find(|a| a.is_image())
            .map(|a| a.url.as_str())
            .or_else(|| self.embeds.iter().find_map(|e| e.image_source()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingStarted {
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    Message(InboundMessage),
    TypingStarted(TypingStarted),
}

impl InboundEvent {
    pub fn channel_id(&self) -> ChannelId {
        match self {
            Self::Message(msg) => msg.channel_id,
            Self::TypingStarted(typing) => typing.channel_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmbed {
    pub title: String,
    pub body: String,
    pub color: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub user_id: UserId,
    pub display_name: String,
    /// Admins, owners and other protected roles.
    pub privileged: bool,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    async fn send_plain(&self, channel: ChannelId, text: &str) -> TransportResult<MessageId>;

    async fn reply_to(
        &self,
        channel: ChannelId,
        entry_id: MessageId,
        text: &str,
    ) -> TransportResult<MessageId>;

    async fn send_embed(
        &self,
        channel: ChannelId,
        embed: &OutboundEmbed,
    ) -> TransportResult<MessageId>;

    async fn restrict_user(
        &self,
        channel: ChannelId,
        user: UserId,
        duration: Duration,
    ) -> TransportResult<()>;

    async fn unrestrict_user(&self, channel: ChannelId, user: UserId) -> TransportResult<()>;

    async fn show_typing(&self, channel: ChannelId) -> TransportResult<()>;

    async fn fetch_member(&self, channel: ChannelId, user: UserId) -> TransportResult<MemberInfo>;

    /// Platform-native mention markup for a user.
    fn mention(&self, user: UserId, display_name: &str) -> String;
}

/// Lift a restriction once `after` has elapsed.
pub fn schedule_unrestrict(
    transport: Arc<dyn Transport>,
    channel: ChannelId,
    user: UserId,
    after: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        match transport.unrestrict_user(channel, user).await {
            Ok(()) => tracing::info!("Restriction lifted for user {}", user),
            Err(e) => tracing::warn!("Failed to lift restriction for user {}: {}", user, e),
        }
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(url: &str, content_type: Option<&str>) -> Attachment {
        Attachment {
            url: url.to_string(),
            content_type: content_type.map(str::to_string),
        }
    }

    #[test]
    fn attachment_image_detection_uses_content_type_then_extension() {
        assert!(attachment("https://x/a", Some("image/png")).is_image());
        assert!(attachment("https://x/a", Some("IMAGE/JPEG")).is_image());
        assert!(!attachment("https://x/a.png", Some("video/mp4")).is_image());
        assert!(attachment("https://x/cat.webp?size=2", None).is_image());
        assert!(!attachment("https://x/notes.txt", None).is_image());
    }

    #[test]
    fn first_image_prefers_attachments_over_embeds() {
        let msg = InboundMessage {
            id: 1,
            channel_id: 9,
            author: InboundAuthor {
                id: 2,
                name: "ana".to_string(),
                is_bot: false,
            },
            text: String::new(),
            created_at: Utc::now(),
            reply_reference: None,
            attachments: vec![attachment("https://x/a.gif", Some("image/gif"))],
            embeds: vec![InboundEmbed {
                kind: EmbedKind::Gifv,
                image_url: None,
                thumbnail_url: Some("https://x/thumb.png".to_string()),
            }],
        };
        assert_eq!(msg.first_image_url(), Some("https://x/a.gif"));

        let embed_only = InboundMessage {
            attachments: Vec::new(),
            ..msg
        };
        assert_eq!(embed_only.first_image_url(), Some("https://x/thumb.png"));
    }

    #[test]
    fn link_embeds_are_not_images() {
        let embed = InboundEmbed {
            kind: EmbedKind::Link,
            image_url: Some("https://x/preview.png".to_string()),
            thumbnail_url: None,
        };
        assert_eq!(embed.image_source(), None);
    }
}
