//! Telegram Bot API adapter.
//!
//! Long-polls `getUpdates` and forwards adapted messages to the engine over a
//! flume channel. Outbound calls map onto `sendMessage`, `restrictChatMember`,
//! `sendChatAction` and `getChatMember`.
//!
//! The Bot API has no typing notifications, so this adapter never produces
//! [`InboundEvent::TypingStarted`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex_lite::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{
    Attachment, ChannelId, EmbedKind, InboundAuthor, InboundEmbed, InboundEvent, InboundMessage,
    MemberInfo, MessageId, OutboundEmbed, ReplyReference, Transport, TransportError,
    TransportResult, UserId,
};

const MAX_MESSAGE_CHARS: usize = 4096;
const POLL_TIMEOUT_SECS: u64 = 30;
const POLL_RETRY_SECS: u64 = 5;

#[derive(Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct Update {
    update_id: i64,
    message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Deserialize)]
struct TelegramMessage {
    message_id: i64,
    chat: TelegramChat,
    #[serde(default)]
    from: Option<TelegramUser>,
    date: i64,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    photo: Option<Vec<PhotoSize>>,
    #[serde(default)]
    animation: Option<Animation>,
    #[serde(default)]
    reply_to_message: Option<Box<TelegramMessage>>,
}

impl TelegramMessage {
    fn body(&self) -> String {
        self.text
            .clone()
            .or_else(|| self.caption.clone())
            .unwrap_or_default()
    }

    fn largest_photo(&self) -> Option<&PhotoSize> {
        self.photo
            .as_ref()?
            .iter()
            .max_by_key(|p| p.width * p.height)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TelegramChat {
    id: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct TelegramUser {
    id: i64,
    #[serde(default)]
    is_bot: bool,
    first_name: String,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

impl TelegramUser {
    fn display_name(&self) -> String {
        match &self.last_name {
            Some(last) if !last.trim().is_empty() => format!("{} {}", self.first_name, last),
            _ if !self.first_name.trim().is_empty() => self.first_name.clone(),
            _ => self.username.clone().unwrap_or_else(|| self.id.to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PhotoSize {
    file_id: String,
    width: i64,
    height: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct Animation {
    #[serde(default)]
    thumbnail: Option<PhotoSize>,
}

#[derive(Deserialize)]
struct TelegramFile {
    #[serde(default)]
    file_path: Option<String>,
}

#[derive(Deserialize)]
struct ChatMember {
    status: String,
    user: TelegramUser,
}

#[derive(Deserialize)]
struct SentMessage {
    message_id: i64,
}

/// Download URLs resolved for a message's images.
#[derive(Debug, Default, Clone)]
struct ResolvedImages {
    photo: Option<String>,
    animation_thumbnail: Option<String>,
    reply_photo: Option<String>,
}

pub struct TelegramTransport {
    api_base: String,
    file_base: String,
    client: reqwest::Client,
}

impl TelegramTransport {
    pub fn new(token: &str) -> Self {
        Self {
            api_base: format!("https://api.telegram.org/bot{}", token),
            file_base: format!("https://api.telegram.org/file/bot{}", token),
            client: reqwest::Client::new(),
        }
    }

    /// Build from `TELEGRAM_BOT_TOKEN`, if set.
    pub fn from_env() -> Option<Self> {
        match std::env::var("TELEGRAM_BOT_TOKEN") {
            Ok(token) if !token.trim().is_empty() => Some(Self::new(token.trim())),
            _ => None,
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> TransportResult<T> {
        let url = format!("{}/{}", self.api_base, method);
        let response = self.client.post(&url).json(&params).send().await?;
        let body: TelegramResponse<T> = response
            .json()
            .await
            .map_err(|e| TransportError::Decode(format!("{}: {}", method, e)))?;

        if !body.ok {
            return Err(TransportError::from_api(
                body.error_code.unwrap_or(0),
                body.description
                    .unwrap_or_else(|| format!("{} returned ok=false", method)),
            ));
        }
        body.result
            .ok_or_else(|| TransportError::Decode(format!("{}: missing result", method)))
    }

    async fn file_url(&self, file_id: &str) -> Option<String> {
        match self
            .call::<TelegramFile>("getFile", serde_json::json!({ "file_id": file_id }))
            .await
        {
            Ok(TelegramFile {
                file_path: Some(path),
            }) => Some(format!("{}/{}", self.file_base, path)),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("Telegram getFile failed for {}: {}", file_id, e);
                None
            }
        }
    }

    async fn resolve_images(&self, msg: &TelegramMessage) -> ResolvedImages {
        let mut resolved = ResolvedImages::default();
        if let Some(photo) = msg.largest_photo() {
            resolved.photo = self.file_url(&photo.file_id).await;
        }
        if let Some(thumb) = msg.animation.as_ref().and_then(|a| a.thumbnail.as_ref()) {
            resolved.animation_thumbnail = self.file_url(&thumb.file_id).await;
        }
        if let Some(photo) = msg.reply_to_message.as_ref().and_then(|r| r.largest_photo()) {
            resolved.reply_photo = self.file_url(&photo.file_id).await;
        }
        resolved
    }

    /// Spawn the long-polling task. Adapted messages go to `inbound_tx`.
    pub fn spawn_polling(
        self: Arc<Self>,
        inbound_tx: flume::Sender<InboundEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Telegram polling started");
            let mut offset: i64 = 0;
            loop {
                let params = serde_json::json!({
                    "offset": offset,
                    "timeout": POLL_TIMEOUT_SECS,
                    "allowed_updates": ["message"]
                });
                let updates = match self.call::<Vec<Update>>("getUpdates", params).await {
                    Ok(updates) => updates,
                    Err(e) => {
                        tracing::warn!("Telegram getUpdates error: {}", e);
                        tokio::time::sleep(Duration::from_secs(POLL_RETRY_SECS)).await;
                        continue;
                    }
                };

                for update in updates {
                    offset = update.update_id + 1;
                    let Some(msg) = update.message else {
                        continue;
                    };
                    let images = self.resolve_images(&msg).await;
                    let Some(inbound) = adapt_message(&msg, &images) else {
                        continue;
                    };
                    tracing::debug!(
                        "Telegram [chat {}] {}: {:?}",
                        inbound.channel_id,
                        inbound.author.name,
                        inbound.text
                    );
                    if inbound_tx.send(InboundEvent::Message(inbound)).is_err() {
                        tracing::warn!("Engine inbound channel closed, stopping Telegram polling");
                        return;
                    }
                }
            }
        })
    }

    async fn send_message(
        &self,
        channel: ChannelId,
        html: String,
        reply_to: Option<MessageId>,
    ) -> TransportResult<MessageId> {
        let mut params = serde_json::json!({
            "chat_id": channel,
            "text": html,
            "parse_mode": "HTML",
        });
        if let Some(message_id) = reply_to {
            params["reply_parameters"] = serde_json::json!({
                "message_id": message_id,
                "allow_sending_without_reply": true,
            });
        }
        let sent: SentMessage = self.call("sendMessage", params).await?;
        Ok(sent.message_id)
    }
}

fn adapt_message(msg: &TelegramMessage, images: &ResolvedImages) -> Option<InboundMessage> {
    let from = msg.from.as_ref()?;

    let attachments = images
        .photo
        .iter()
        .map(|url| Attachment {
            url: url.clone(),
            content_type: Some("image/jpeg".to_string()),
        })
        .collect();

    let embeds = match (&msg.animation, &images.animation_thumbnail) {
        (Some(_), thumbnail) => vec![InboundEmbed {
            kind: EmbedKind::Gifv,
            image_url: None,
            thumbnail_url: thumbnail.clone(),
        }],
        (None, _) => Vec::new(),
    };

    let reply_reference = msg.reply_to_message.as_ref().map(|reply| ReplyReference {
        message_id: reply.message_id,
        author_id: reply.from.as_ref().map(|u| u.id),
        author_name: reply.from.as_ref().map(|u| u.display_name()),
        text: Some(reply.body()).filter(|t| !t.is_empty()),
        attachments: images
            .reply_photo
            .iter()
            .map(|url| Attachment {
                url: url.clone(),
                content_type: Some("image/jpeg".to_string()),
            })
            .collect(),
    });

    Some(InboundMessage {
        id: msg.message_id,
        channel_id: msg.chat.id,
        author: InboundAuthor {
            id: from.id,
            name: from.display_name(),
            is_bot: from.is_bot,
        },
        text: msg.body(),
        created_at: DateTime::from_timestamp(msg.date, 0).unwrap_or_else(Utc::now),
        reply_reference,
        attachments,
        embeds,
    })
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Escape `text` for HTML parse mode, leaving mention anchors intact.
fn escape_keeping_mentions(text: &str) -> String {
    let Ok(re) = Regex::new(r#"<a href="tg://user\?id=\d+">[^<]*</a>"#) else {
        return escape_html(text);
    };
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for m in re.find_iter(text) {
        out.push_str(&escape_html(&text[last..m.start()]));
        out.push_str(m.as_str());
        last = m.end();
    }
    out.push_str(&escape_html(&text[last..]));
    out
}

fn truncate_message(text: &str) -> String {
    match text.char_indices().nth(MAX_MESSAGE_CHARS) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

fn permissions(allowed: bool) -> serde_json::Value {
    serde_json::json!({
        "can_send_messages": allowed,
        "can_send_audios": allowed,
        "can_send_documents": allowed,
        "can_send_photos": allowed,
        "can_send_videos": allowed,
        "can_send_video_notes": allowed,
        "can_send_voice_notes": allowed,
        "can_send_polls": allowed,
        "can_send_other_messages": allowed,
        "can_add_web_page_previews": allowed,
    })
}

#[async_trait]
impl Transport for TelegramTransport {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send_plain(&self, channel: ChannelId, text: &str) -> TransportResult<MessageId> {
        self.send_message(channel, truncate_message(&escape_keeping_mentions(text)), None)
            .await
    }

    async fn reply_to(
        &self,
        channel: ChannelId,
        entry_id: MessageId,
        text: &str,
    ) -> TransportResult<MessageId> {
        self.send_message(
            channel,
            truncate_message(&escape_keeping_mentions(text)),
            Some(entry_id),
        )
        .await
    }

    async fn send_embed(
        &self,
        channel: ChannelId,
        embed: &OutboundEmbed,
    ) -> TransportResult<MessageId> {
        let html = format!(
            "<b>{}</b>\n{}",
            escape_html(&embed.title),
            escape_keeping_mentions(&embed.body)
        );
        self.send_message(channel, truncate_message(&html), None).await
    }

    async fn restrict_user(
        &self,
        channel: ChannelId,
        user: UserId,
        duration: Duration,
    ) -> TransportResult<()> {
        let until = Utc::now().timestamp() + duration.as_secs() as i64;
        let _: bool = self
            .call(
                "restrictChatMember",
                serde_json::json!({
                    "chat_id": channel,
                    "user_id": user,
                    "permissions": permissions(false),
                    "until_date": until,
                }),
            )
            .await?;
        Ok(())
    }

    async fn unrestrict_user(&self, channel: ChannelId, user: UserId) -> TransportResult<()> {
        let _: bool = self
            .call(
                "restrictChatMember",
                serde_json::json!({
                    "chat_id": channel,
                    "user_id": user,
                    "permissions": permissions(true),
                }),
            )
            .await?;
        Ok(())
    }

    async fn show_typing(&self, channel: ChannelId) -> TransportResult<()> {
        let _: bool = self
            .call(
                "sendChatAction",
                serde_json::json!({ "chat_id": channel, "action": "typing" }),
            )
            .await?;
        Ok(())
    }

    async fn fetch_member(&self, channel: ChannelId, user: UserId) -> TransportResult<MemberInfo> {
        let member: ChatMember = self
            .call(
                "getChatMember",
                serde_json::json!({ "chat_id": channel, "user_id": user }),
            )
            .await?;
        Ok(MemberInfo {
            user_id: member.user.id,
            display_name: member.user.display_name(),
            privileged: matches!(member.status.as_str(), "creator" | "administrator"),
        })
    }

    fn mention(&self, user: UserId, display_name: &str) -> String {
        format!(
            "<a href=\"tg://user?id={}\">{}</a>",
            user,
            escape_html(display_name)
        )
    }
}
