//! Object detector abstraction and providers.
//!
//! The detection model itself is a black box: given a decoded image it
//! returns `(label, confidence, bbox)` tuples. This module defines the
//! [`ObjectDetector`] trait and concrete providers:
//!
//! - **[`DisabledDetector`]**: always fails; used when no model is configured.
//! - **[`HttpDetector`]**: posts the image to an inference sidecar and parses
//!   its JSON detections.
//!
//! # Sidecar protocol
//!
//! ```text
//! POST <detector.endpoint>
//! {"image": "<base64 PNG>"}
//!
//! 200 OK
//! {"detections": [{"name": "locked_lock", "confidence": 0.91,
//!                  "xmin": 10, "ymin": 12, "xmax": 80, "ymax": 96}]}
//! ```
//!
//! # Lifecycle
//!
//! The detector is loaded once at startup through [`ModelHandle`] and then
//! shared read-only by every request as `Arc<dyn ObjectDetector>`. It is
//! never reloaded mid-request.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use image::DynamicImage;
use serde::Deserialize;
use std::io::Cursor;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::config::DetectorConfig;
use crate::models::{BoundingBox, RawDetection};

/// Runs the object-detection model over one image.
#[async_trait]
pub trait ObjectDetector: Send + Sync {
    /// Provider name used in logs and health output.
    fn name(&self) -> &str;

    /// Return every detection in the image.
    ///
    /// Errors are surfaced by the classifier as `DetectionFailed`.
    async fn detect(&self, image: &DynamicImage) -> Result<Vec<RawDetection>>;
}

// ============ Disabled Provider ============

/// A detector that always returns an error.
///
/// Used when `detector.provider = "disabled"`.
pub struct DisabledDetector;

#[async_trait]
impl ObjectDetector for DisabledDetector {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn detect(&self, _image: &DynamicImage) -> Result<Vec<RawDetection>> {
        bail!("Object detector is disabled")
    }
}

// ============ HTTP Provider ============

/// Detector backed by an external inference service.
pub struct HttpDetector {
    endpoint: String,
    client: reqwest::Client,
    confidence_threshold: f64,
}

impl HttpDetector {
    pub fn new(config: &DetectorConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| anyhow!("detector.endpoint required for http provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            endpoint,
            client,
            confidence_threshold: config.confidence_threshold,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SidecarResponse {
    detections: Vec<SidecarDetection>,
}

#[derive(Debug, Deserialize)]
struct SidecarDetection {
    name: String,
    confidence: f64,
    xmin: f64,
    ymin: f64,
    xmax: f64,
    ymax: f64,
}

#[async_trait]
impl ObjectDetector for HttpDetector {
    fn name(&self) -> &str {
        "http"
    }

    async fn detect(&self, image: &DynamicImage) -> Result<Vec<RawDetection>> {
        let image = image.clone();
        let encoded = tokio::task::spawn_blocking(move || -> Result<String> {
            let mut png = Vec::new();
            image
                .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
                .context("Failed to encode image for detector")?;
            Ok(base64::engine::general_purpose::STANDARD.encode(&png))
        })
        .await??;
        let body = serde_json::json!({ "image": encoded });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .context("Detector request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Detector error {}: {}", status, text);
        }

        let parsed: SidecarResponse = response
            .json()
            .await
            .context("Invalid detector response")?;
        parse_detections(parsed, self.confidence_threshold)
    }
}

fn parse_detections(resp: SidecarResponse, threshold: f64) -> Result<Vec<RawDetection>> {
    let mut out = Vec::with_capacity(resp.detections.len());
    for d in resp.detections {
        if !d.confidence.is_finite() || !(0.0..=1.0).contains(&d.confidence) {
            bail!("Detector returned confidence out of range: {}", d.confidence);
        }
        if d.confidence < threshold {
            continue;
        }
        let bbox = BoundingBox::new(
            d.xmin.round() as i32,
            d.ymin.round() as i32,
            d.xmax.round() as i32,
            d.ymax.round() as i32,
        )
        .map_err(|e| anyhow!(e))?;
        out.push(RawDetection::new(d.name, d.confidence, bbox));
    }
    Ok(out)
}

/// Create the appropriate [`ObjectDetector`] based on configuration.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledDetector`] |
/// | `"http"` | [`HttpDetector`] |
pub fn create_detector(config: &DetectorConfig) -> Result<Arc<dyn ObjectDetector>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledDetector)),
        "http" => Ok(Arc::new(HttpDetector::new(config)?)),
        other => bail!("Unknown detector provider: {}", other),
    }
}

/// Init-once holder for the process-wide detector.
#[derive(Default)]
pub struct ModelHandle {
    cell: OnceLock<Arc<dyn ObjectDetector>>,
}

impl ModelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the detector on first call; later calls return the same instance.
    pub fn get_or_init<F>(&self, init: F) -> Result<Arc<dyn ObjectDetector>>
    where
        F: FnOnce() -> Result<Arc<dyn ObjectDetector>>,
    {
        if let Some(existing) = self.cell.get() {
            return Ok(existing.clone());
        }
        let created = init()?;
        // A concurrent initializer may have won; keep whichever landed first.
        Ok(self.cell.get_or_init(|| created).clone())
    }

    pub fn get(&self) -> Option<Arc<dyn ObjectDetector>> {
        self.cell.get().cloned()
    }
}
