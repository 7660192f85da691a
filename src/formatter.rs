//! Chat message rendering for detection results and notices.
//!
//! Pure functions only: nothing here performs I/O. The produced payloads use
//! the markdown message shape accepted by DingTalk robot webhooks:
//!
//! ```json
//! {"msgtype": "markdown", "markdown": {"title": "...", "text": "..."}}
//! ```

use serde::Serialize;
use serde_json::{json, Value};

use crate::models::DetectionResult;

pub const RESULT_TITLE: &str = "Lock Detection Result";
pub const ACK_TITLE: &str = "Image Required";
pub const DOWNLOAD_FAILED_TITLE: &str = "Image Download Failed";
pub const ERROR_TITLE: &str = "Processing Error";

/// One unlocked lock as listed in a result message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnlockedItem {
    /// 1-based position among all detected locks.
    pub index: usize,
    pub lock_type: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultMessage {
    pub title: String,
    pub total_locks: u32,
    pub locked_locks: u32,
    pub unlocked_locks: u32,
    pub is_safe: bool,
    pub unlocked: Vec<UnlockedItem>,
    pub text: String,
}

impl ResultMessage {
    pub fn to_payload(&self) -> Value {
        markdown_payload(&self.title, &self.text)
    }
}

/// A text notice (acknowledgement, failure) ready to dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub title: String,
    pub text: String,
}

impl Notice {
    pub fn to_payload(&self) -> Value {
        markdown_payload(&self.title, &self.text)
    }
}

pub fn markdown_payload(title: &str, text: &str) -> Value {
    json!({
        "msgtype": "markdown",
        "markdown": {
            "title": title,
            "text": text,
        }
    })
}

fn greeting(sender_nick: Option<&str>) -> String {
    match sender_nick {
        Some(nick) if !nick.is_empty() => format!("@{}\n\n", nick),
        _ => String::new(),
    }
}

/// Verdict block: counts, safety state and, when unsafe, the unlocked list.
pub fn verdict_text(result: &DetectionResult) -> String {
    if result.is_safe() {
        return format!(
            "✅ **All clear**\n\n\
             - Locks detected: {}\n\
             - All locks are locked\n\n\
             🔒 **Status: SAFE**",
            result.total_locks()
        );
    }

    let mut text = format!(
        "⚠️ **Unlocked locks found**\n\n\
         - Locks detected: {}\n\
         - Locked: {}\n\
         - Unlocked: {} ❌\n\n\
         🔓 **Status: WARNING**\n\n\
         **Unlocked locks:**\n",
        result.total_locks(),
        result.locked_locks(),
        result.unlocked_locks()
    );
    for (index, detail) in result.unlocked_details() {
        text.push_str(&format!(
            "\n{}. {} (confidence: {:.2})",
            index, detail.lock_type, detail.confidence
        ));
    }
    text.push_str("\n\n**Action:** secure every unlocked lock now.");
    text
}

/// Format one classified image for chat.
///
/// `image_base64` is an annotated JPEG embedded as a data URI when given.
pub fn format_result(
    result: &DetectionResult,
    sender_nick: Option<&str>,
    image_base64: Option<&str>,
) -> ResultMessage {
    let unlocked = result
        .unlocked_details()
        .map(|(index, d)| UnlockedItem {
            index,
            lock_type: d.lock_type.clone(),
            confidence: d.confidence,
        })
        .collect();

    let mut text = greeting(sender_nick);
    text.push_str("## 🔒 Lock Detection Result\n\n");
    text.push_str(&verdict_text(result));
    text.push_str(&format!(
        "\n\n### Details\n\
         - Detected at: {}\n\
         - Confidence: {:.2}\n",
        result.detection_time().format("%Y-%m-%d %H:%M:%S UTC"),
        result.confidence_score()
    ));
    if let Some(b64) = image_base64.filter(|b| !b.is_empty()) {
        text.push_str(&format!(
            "\n![detection](data:image/jpeg;base64,{})\n",
            b64
        ));
    }

    ResultMessage {
        title: RESULT_TITLE.to_string(),
        total_locks: result.total_locks(),
        locked_locks: result.locked_locks(),
        unlocked_locks: result.unlocked_locks(),
        is_safe: result.is_safe(),
        unlocked,
        text,
    }
}

/// Reply to a mention that carried no image.
pub fn acknowledgement(sender_nick: Option<&str>) -> Notice {
    Notice {
        title: ACK_TITLE.to_string(),
        text: format!(
            "{}You mentioned me but the message has no image.\n\n\
             Send a photo of the locks together with the mention and I will \
             check whether each one is locked.",
            greeting(sender_nick)
        ),
    }
}

/// Sent when every image in a message failed to download.
pub fn download_failed(sender_nick: Option<&str>) -> Notice {
    Notice {
        title: DOWNLOAD_FAILED_TITLE.to_string(),
        text: format!(
            "{}Sorry, the image could not be downloaded.\n\n\
             Check the image format or try again later.",
            greeting(sender_nick)
        ),
    }
}

/// Sent when images were downloaded but none could be analyzed.
pub fn processing_failed(sender_nick: Option<&str>) -> Notice {
    Notice {
        title: ERROR_TITLE.to_string(),
        text: format!(
            "{}Sorry, the image could not be analyzed.\n\nPlease try again later.",
            greeting(sender_nick)
        ),
    }
}
