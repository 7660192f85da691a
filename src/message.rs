//! Inbound chat callback payloads.
//!
//! The provider posts a loosely shaped JSON object. [`WebhookMessage::parse`]
//! decodes it in one strict step into a tagged union, failing closed with
//! `MalformedMessage` when a required field is missing or mistyped:
//!
//! - `Text`: no images, nobody mentioned
//! - `Image`: carries image references, nobody mentioned
//! - `Mention`: at least one recipient mentioned, with or without images
//!
//! Required fields: `msgId`, `conversationType`, `senderId`. The
//! `images.downloadCode` list is parallel to `images.imageUrl` and may not be
//! longer than it.

use serde::Deserialize;
use std::collections::BTreeSet;

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCallback {
    msg_id: String,
    conversation_type: String,
    sender_id: String,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    conversation_title: Option<String>,
    #[serde(default)]
    sender_nick: Option<String>,
    #[serde(default)]
    chatbot_user_id: Option<String>,
    #[serde(default)]
    session_webhook: Option<String>,
    #[serde(default)]
    session_webhook_expired_time: Option<i64>,
    #[serde(default)]
    text: Option<RawText>,
    #[serde(default)]
    images: Option<RawImages>,
    #[serde(default)]
    at_users: Option<RawAtUsers>,
}

#[derive(Debug, Deserialize)]
struct RawText {
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawImages {
    #[serde(default)]
    image_url: Vec<String>,
    #[serde(default)]
    download_code: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAtUsers {
    #[serde(default)]
    dingtalk_id: Vec<String>,
}

/// Reply endpoint scoped to one conversation, valid until `expires_at_ms`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionWebhook {
    pub url: String,
    pub expires_at_ms: Option<i64>,
}

impl SessionWebhook {
    pub fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms.map_or(true, |exp| exp > now_ms)
    }
}

/// Fields common to every message kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub msg_id: String,
    pub conversation_type: String,
    pub conversation_id: Option<String>,
    pub conversation_title: Option<String>,
    pub sender_id: String,
    pub sender_nick: Option<String>,
    pub chatbot_user_id: Option<String>,
    pub text: Option<String>,
    pub session_webhook: Option<SessionWebhook>,
}

impl Envelope {
    /// Group identifier recorded with stored detections.
    pub fn group_id(&self) -> Option<&str> {
        self.conversation_id
            .as_deref()
            .or(self.conversation_title.as_deref())
    }
}

/// One image attached to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub url: String,
    pub download_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookMessage {
    Text {
        envelope: Envelope,
    },
    Image {
        envelope: Envelope,
        images: Vec<ImageRef>,
    },
    Mention {
        envelope: Envelope,
        images: Vec<ImageRef>,
        mentioned: BTreeSet<String>,
    },
}

fn malformed(msg: impl Into<String>) -> PipelineError {
    PipelineError::MalformedMessage(msg.into())
}

impl WebhookMessage {
    pub fn parse(body: &[u8]) -> PipelineResult<Self> {
        let raw: RawCallback =
            serde_json::from_slice(body).map_err(|e| malformed(e.to_string()))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawCallback) -> PipelineResult<Self> {
        if raw.msg_id.trim().is_empty() {
            return Err(malformed("msgId must not be empty"));
        }
        if raw.sender_id.trim().is_empty() {
            return Err(malformed("senderId must not be empty"));
        }

        let images = match raw.images {
            Some(imgs) => {
                if imgs.download_code.len() > imgs.image_url.len() {
                    return Err(malformed("images.downloadCode is longer than images.imageUrl"));
                }
                let mut refs = Vec::with_capacity(imgs.image_url.len());
                for (i, url) in imgs.image_url.into_iter().enumerate() {
                    if url.trim().is_empty() {
                        return Err(malformed(format!("images.imageUrl[{}] is empty", i)));
                    }
                    let download_token = imgs
                        .download_code
                        .get(i)
                        .filter(|c| !c.is_empty())
                        .cloned();
                    refs.push(ImageRef {
                        url,
                        download_token,
                    });
                }
                refs
            }
            None => Vec::new(),
        };

        let mentioned: BTreeSet<String> = raw
            .at_users
            .map(|a| a.dingtalk_id.into_iter().filter(|id| !id.is_empty()).collect())
            .unwrap_or_default();

        let session_webhook = raw
            .session_webhook
            .filter(|url| !url.is_empty())
            .map(|url| SessionWebhook {
                url,
                expires_at_ms: raw.session_webhook_expired_time.filter(|t| *t > 0),
            });

        let envelope = Envelope {
            msg_id: raw.msg_id,
            conversation_type: raw.conversation_type,
            conversation_id: raw.conversation_id.filter(|s| !s.is_empty()),
            conversation_title: raw.conversation_title.filter(|s| !s.is_empty()),
            sender_id: raw.sender_id,
            sender_nick: raw.sender_nick.filter(|s| !s.is_empty()),
            chatbot_user_id: raw.chatbot_user_id.filter(|s| !s.is_empty()),
            text: raw.text.map(|t| t.content),
            session_webhook,
        };

        Ok(if !mentioned.is_empty() {
            WebhookMessage::Mention {
                envelope,
                images,
                mentioned,
            }
        } else if !images.is_empty() {
            WebhookMessage::Image { envelope, images }
        } else {
            WebhookMessage::Text { envelope }
        })
    }

    pub fn envelope(&self) -> &Envelope {
        match self {
            WebhookMessage::Text { envelope }
            | WebhookMessage::Image { envelope, .. }
            | WebhookMessage::Mention { envelope, .. } => envelope,
        }
    }

    pub fn images(&self) -> &[ImageRef] {
        match self {
            WebhookMessage::Text { .. } => &[],
            WebhookMessage::Image { images, .. } | WebhookMessage::Mention { images, .. } => images,
        }
    }

    pub fn mentions(&self, id: &str) -> bool {
        match self {
            WebhookMessage::Mention { mentioned, .. } => mentioned.contains(id),
            _ => false,
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.envelope().text.as_deref()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WebhookMessage::Text { .. } => "text",
            WebhookMessage::Image { .. } => "image",
            WebhookMessage::Mention { .. } => "mention",
        }
    }
}
