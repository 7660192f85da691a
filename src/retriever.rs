//! Image download for chat attachments.
//!
//! [`ImageFetcher`] is the seam the orchestrator retrieves images through;
//! [`HttpImageRetriever`] is the production implementation. One attempt per
//! image, no retries. Every failure is reported as `RetrievalFailed`.

use async_trait::async_trait;
use std::time::Duration;

use crate::config::RetrievalConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::message::ImageRef;

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, image: &ImageRef) -> PipelineResult<Vec<u8>>;
}

pub struct HttpImageRetriever {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpImageRetriever {
    pub fn new(config: &RetrievalConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            max_bytes: config.max_image_bytes,
        })
    }
}

fn failed(msg: impl Into<String>) -> PipelineError {
    PipelineError::RetrievalFailed(msg.into())
}

/// Append the download token as the `downloadCode` query parameter.
pub fn download_url(image: &ImageRef) -> PipelineResult<reqwest::Url> {
    let mut url = reqwest::Url::parse(&image.url)
        .map_err(|e| failed(format!("invalid image url '{}': {}", image.url, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(failed(format!("unsupported url scheme '{}'", url.scheme())));
    }
    if let Some(token) = image.download_token.as_deref() {
        url.query_pairs_mut().append_pair("downloadCode", token);
    }
    Ok(url)
}

#[async_trait]
impl ImageFetcher for HttpImageRetriever {
    async fn fetch(&self, image: &ImageRef) -> PipelineResult<Vec<u8>> {
        let url = download_url(image)?;

        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failed(format!("request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(failed(format!("HTTP {}", resp.status())));
        }

        if let Some(len) = resp.content_length() {
            if len > self.max_bytes as u64 {
                return Err(failed(format!(
                    "image is {} bytes, limit is {}",
                    len, self.max_bytes
                )));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| failed(format!("read failed: {}", e)))?
        {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(failed(format!("image exceeds {} bytes", self.max_bytes)));
            }
            body.extend_from_slice(&chunk);
        }

        if body.is_empty() {
            return Err(failed("empty response body"));
        }

        tracing::debug!(bytes = body.len(), "downloaded image");
        Ok(body)
    }
}
