//! Outbound delivery of chat messages.
//!
//! Dispatch is best-effort: one attempt per message, failures are returned
//! to the caller for logging and never retried.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::message::SessionWebhook;

#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Post one message payload to `target`.
    async fn send(&self, target: &str, payload: &Value) -> Result<()>;
}

/// Posts JSON payloads to DingTalk robot webhooks.
pub struct WebhookSink {
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self { client })
    }
}

#[derive(Debug, Deserialize)]
struct WebhookReply {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

#[async_trait]
impl MessageSink for WebhookSink {
    async fn send(&self, target: &str, payload: &Value) -> Result<()> {
        let resp = self
            .client
            .post(target)
            .json(payload)
            .send()
            .await
            .context("Webhook request failed")?;

        let status = resp.status();
        if !status.is_success() {
            bail!("Webhook returned HTTP {}", status);
        }

        let reply: WebhookReply = resp.json().await.context("Invalid webhook reply")?;
        if reply.errcode != 0 {
            bail!("Webhook rejected message: {} {}", reply.errcode, reply.errmsg);
        }
        Ok(())
    }
}

/// Pick where replies for one request go.
///
/// A live session webhook wins over the configured robot URL. Returns `None`
/// when neither is usable.
pub fn resolve_target(
    session: Option<&SessionWebhook>,
    configured: &str,
    now_ms: i64,
) -> Option<String> {
    if let Some(hook) = session {
        if hook.is_live(now_ms) {
            return Some(hook.url.clone());
        }
        tracing::debug!("session webhook expired, falling back to configured url");
    }
    (!configured.is_empty()).then(|| configured.to_string())
}
