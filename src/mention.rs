//! Decides whether an inbound chat message is addressed to the bot.

use crate::config::DingTalkConfig;
use crate::message::{ImageRef, WebhookMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MentionOutcome {
    /// Not addressed to the bot; no side effects.
    Ignore,
    /// Addressed, but carries no images.
    Acknowledge,
    /// Addressed, with images to analyze.
    Process(Vec<ImageRef>),
}

#[derive(Debug, Clone)]
pub struct MentionDetector {
    bot_id: String,
    display_token: String,
    ack_without_image: bool,
}

impl MentionDetector {
    pub fn new(bot_id: &str, display_token: &str, ack_without_image: bool) -> Self {
        Self {
            bot_id: bot_id.trim().to_string(),
            display_token: display_token.trim().to_lowercase(),
            ack_without_image,
        }
    }

    pub fn from_config(config: &DingTalkConfig) -> Self {
        Self::new(
            &config.app_key,
            &config.bot_display_token,
            config.ack_without_image,
        )
    }

    /// True when the message mentions the bot by id or by display token.
    ///
    /// The callback's own `chatbotUserId` counts as the bot's id too, so a
    /// bot whose configured key differs from its chat identity still
    /// recognizes itself in `atUsers`.
    pub fn is_addressed(&self, message: &WebhookMessage) -> bool {
        if !self.bot_id.is_empty() && message.mentions(&self.bot_id) {
            return true;
        }
        if let Some(own) = message.envelope().chatbot_user_id.as_deref() {
            if message.mentions(own) {
                return true;
            }
        }
        if self.display_token.is_empty() {
            return false;
        }
        message
            .text()
            .map(|t| t.to_lowercase().contains(&self.display_token))
            .unwrap_or(false)
    }

    pub fn evaluate(&self, message: &WebhookMessage) -> MentionOutcome {
        if !self.is_addressed(message) {
            return MentionOutcome::Ignore;
        }
        let images = message.images();
        if images.is_empty() {
            if self.ack_without_image {
                MentionOutcome::Acknowledge
            } else {
                MentionOutcome::Ignore
            }
        } else {
            MentionOutcome::Process(images.to_vec())
        }
    }
}
