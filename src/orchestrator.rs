//! Callback pipeline for chat webhooks.
//!
//! Each inbound callback walks a fixed state machine:
//!
//! ```text
//! Received → SignatureChecked → Parsed ─┬─ Skipped
//!                                       └─ ImageFetched → Classified → Persisted → Dispatched
//! ```
//!
//! `Failed` is reachable from every stage before `Dispatched`. The visited
//! states are recorded in [`CallbackOutcome::trace`] so callers and tests can
//! see exactly how far a request got.
//!
//! Images in one message are fetched and classified concurrently on a
//! [`JoinSet`]; results are collected before anything is persisted. An image
//! whose fingerprint is already stored skips classification and reuses the
//! stored verdict (see [`intake`](crate::intake)). Replies
//! are best-effort: a failed send is logged and never rolls back what was
//! stored.
//!
//! Webhook settings can be changed at runtime through
//! [`configure`](CallbackOrchestrator::configure). Every request takes one
//! snapshot of them up front and uses it throughout.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinSet;

use crate::classifier::LockStateClassifier;
use crate::config::DingTalkConfig;
use crate::dispatch::{resolve_target, MessageSink};
use crate::error::{PipelineError, PipelineResult};
use crate::formatter::{self, Notice};
use crate::intake::{self, Prepared};
use crate::mention::{MentionDetector, MentionOutcome};
use crate::message::{Envelope, ImageRef, WebhookMessage};
use crate::models::{Provenance, StoredDetection};
use crate::render::{self, PreviewSource};
use crate::retriever::ImageFetcher;
use crate::signature::SignatureValidator;
use crate::store::DetectionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackState {
    Received,
    SignatureChecked,
    Parsed,
    Skipped,
    ImageFetched,
    Classified,
    Persisted,
    Dispatched,
    Failed,
}

/// Raw inputs of one webhook request.
#[derive(Debug, Clone, Default)]
pub struct CallbackContext {
    pub timestamp: Option<String>,
    pub signature: Option<String>,
    pub body: Vec<u8>,
}

/// What happened to one image reference.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImageReport {
    pub url: String,
    pub fingerprint: Option<String>,
    pub detection_id: Option<i64>,
    pub is_new: Option<bool>,
    pub is_safe: Option<bool>,
    pub dispatched: bool,
    /// Error code of the stage that failed for this image.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallbackOutcome {
    pub trace: Vec<CallbackState>,
    pub images: Vec<ImageReport>,
    pub http_status: u16,
    pub success: bool,
    pub message: String,
    /// Error code when the request ended in `Failed`.
    pub error: Option<String>,
}

impl CallbackOutcome {
    fn new() -> Self {
        Self {
            trace: vec![CallbackState::Received],
            images: Vec::new(),
            http_status: 200,
            success: true,
            message: String::new(),
            error: None,
        }
    }

    pub fn final_state(&self) -> CallbackState {
        self.trace.last().copied().unwrap_or(CallbackState::Received)
    }

    fn enter(&mut self, state: CallbackState) {
        self.trace.push(state);
    }

    fn finish(mut self, state: CallbackState, message: impl Into<String>) -> Self {
        self.enter(state);
        self.message = message.into();
        self
    }

    fn fail(mut self, err: &PipelineError) -> Self {
        self.enter(CallbackState::Failed);
        self.success = false;
        self.error = Some(err.code().to_string());
        self.http_status = match err {
            PipelineError::InvalidSignature => 401,
            _ => 200,
        };
        // Signature failures never reveal their cause.
        self.message = match err {
            PipelineError::InvalidSignature => "unauthorized".to_string(),
            other => other.to_string(),
        };
        self
    }
}

/// Result of a direct upload through the HTTP API or the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub stored: StoredDetection,
    pub is_new: bool,
    pub image_base64: Option<String>,
}

/// Per-image result collected from the JoinSet.
struct ImageWork {
    index: usize,
    url: String,
    outcome: PipelineResult<(Prepared, Option<String>)>,
}

pub struct CallbackOrchestrator {
    classifier: Arc<LockStateClassifier>,
    store: Arc<dyn DetectionStore>,
    fetcher: Arc<dyn ImageFetcher>,
    sink: Arc<dyn MessageSink>,
    settings: RwLock<DingTalkConfig>,
}

impl CallbackOrchestrator {
    pub fn new(
        classifier: Arc<LockStateClassifier>,
        store: Arc<dyn DetectionStore>,
        fetcher: Arc<dyn ImageFetcher>,
        sink: Arc<dyn MessageSink>,
        settings: DingTalkConfig,
    ) -> Self {
        Self {
            classifier,
            store,
            fetcher,
            sink,
            settings: RwLock::new(settings),
        }
    }

    pub fn classifier(&self) -> &LockStateClassifier {
        &self.classifier
    }

    pub fn store(&self) -> &Arc<dyn DetectionStore> {
        &self.store
    }

    pub async fn settings(&self) -> DingTalkConfig {
        self.settings.read().await.clone()
    }

    /// Replace the webhook credentials at runtime.
    ///
    /// `webhook_url = None` keeps the current robot URL.
    pub async fn configure(&self, app_key: &str, app_secret: &str, webhook_url: Option<&str>) {
        let mut settings = self.settings.write().await;
        settings.app_key = app_key.to_string();
        settings.app_secret = app_secret.to_string();
        if let Some(url) = webhook_url {
            settings.webhook_url = url.to_string();
        }
        tracing::info!(
            app_key,
            webhook = !settings.webhook_url.is_empty(),
            "webhook settings updated"
        );
    }

    /// Run one webhook callback through the pipeline.
    pub async fn handle(&self, ctx: CallbackContext) -> CallbackOutcome {
        let settings = self.settings().await;
        let mut outcome = CallbackOutcome::new();

        let validator = SignatureValidator::new(&settings.app_secret, settings.max_clock_skew_secs);
        if let Err(e) = validator.verify(ctx.timestamp.as_deref(), ctx.signature.as_deref()) {
            tracing::warn!("rejected webhook callback with invalid signature");
            return outcome.fail(&e);
        }
        outcome.enter(CallbackState::SignatureChecked);

        let message = match WebhookMessage::parse(&ctx.body) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "malformed webhook payload");
                return outcome.fail(&e);
            }
        };
        outcome.enter(CallbackState::Parsed);
        let envelope = message.envelope().clone();
        tracing::info!(
            msg_id = %envelope.msg_id,
            kind = message.kind(),
            images = message.images().len(),
            "webhook message received"
        );

        let images = match MentionDetector::from_config(&settings).evaluate(&message) {
            MentionOutcome::Ignore => {
                return outcome.finish(CallbackState::Skipped, "message not addressed to bot");
            }
            MentionOutcome::Acknowledge => {
                let ack = formatter::acknowledgement(envelope.sender_nick.as_deref());
                self.notify(&settings, &envelope, &ack).await;
                return outcome.finish(CallbackState::Skipped, "no image to analyze");
            }
            MentionOutcome::Process(images) => images,
        };

        // Fetch and classify every image concurrently.
        let work = self.fetch_and_classify(images).await;

        let fetched = work
            .iter()
            .filter(|w| !matches!(w.outcome, Err(PipelineError::RetrievalFailed(_))))
            .count();
        outcome.images = work
            .iter()
            .map(|w| ImageReport {
                url: w.url.clone(),
                error: w.outcome.as_ref().err().map(|e| e.code().to_string()),
                ..ImageReport::default()
            })
            .collect();

        if fetched == 0 {
            let notice = formatter::download_failed(envelope.sender_nick.as_deref());
            self.notify(&settings, &envelope, &notice).await;
            return outcome.fail(&PipelineError::RetrievalFailed(format!(
                "all {} image(s) failed to download",
                work.len()
            )));
        }
        outcome.enter(CallbackState::ImageFetched);

        let mut classified = Vec::new();
        let mut lookup_failure = None;
        for w in work {
            match w.outcome {
                Ok((prepared, preview)) => classified.push((w.index, prepared, preview)),
                Err(e) => {
                    tracing::warn!(url = %w.url, error = %e, "image not processed");
                    if matches!(e, PipelineError::Persistence(_)) {
                        lookup_failure = Some(e);
                    }
                }
            }
        }
        if classified.is_empty() {
            let notice = formatter::processing_failed(envelope.sender_nick.as_deref());
            self.notify(&settings, &envelope, &notice).await;
            let err = lookup_failure.unwrap_or_else(|| {
                PipelineError::DetectionFailed("no image could be classified".to_string())
            });
            return outcome.fail(&err);
        }
        outcome.enter(CallbackState::Classified);

        let provenance = Provenance {
            dingtalk_message_id: Some(envelope.msg_id.clone()),
            user_id: Some(envelope.sender_id.clone()),
            group_id: envelope.group_id().map(str::to_string),
        };
        let mut persisted = Vec::new();
        let mut last_err = None;
        for (index, prepared, preview) in classified {
            match prepared.commit(self.store.as_ref(), &provenance).await {
                Ok(admitted) => {
                    let report = &mut outcome.images[index];
                    report.fingerprint = Some(admitted.stored.image_hash.clone());
                    report.detection_id = Some(admitted.stored.id);
                    report.is_new = Some(admitted.is_new);
                    report.is_safe = Some(admitted.stored.result.is_safe());
                    persisted.push((index, admitted.stored, preview));
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to persist detection");
                    outcome.images[index].error = Some(e.code().to_string());
                    last_err = Some(e);
                }
            }
        }
        if persisted.is_empty() {
            let err = last_err.unwrap_or_else(|| {
                PipelineError::Persistence(anyhow::anyhow!("nothing persisted"))
            });
            return outcome.fail(&err);
        }
        outcome.enter(CallbackState::Persisted);

        let target = resolve_target(
            envelope.session_webhook.as_ref(),
            &settings.webhook_url,
            chrono::Utc::now().timestamp_millis(),
        );
        for (index, stored, preview) in &persisted {
            let msg = formatter::format_result(
                &stored.result,
                envelope.sender_nick.as_deref(),
                preview.as_deref(),
            );
            if let Some(target) = target.as_deref() {
                match self.sink.send(target, &msg.to_payload()).await {
                    Ok(()) => outcome.images[*index].dispatched = true,
                    Err(e) => tracing::warn!(error = %e, id = stored.id, "result dispatch failed"),
                }
            } else {
                tracing::warn!(id = stored.id, "no reply target configured, result not sent");
            }
        }

        outcome.finish(
            CallbackState::Dispatched,
            format!("processed {} image(s)", persisted.len()),
        )
    }

    async fn fetch_and_classify(&self, images: Vec<ImageRef>) -> Vec<ImageWork> {
        let mut set = JoinSet::new();
        for (index, image) in images.into_iter().enumerate() {
            let fetcher = self.fetcher.clone();
            let classifier = self.classifier.clone();
            let store = self.store.clone();
            set.spawn(async move {
                let outcome: PipelineResult<(Prepared, Option<String>)> = async {
                    let bytes = fetcher.fetch(&image).await?;
                    let prepared = intake::prepare(&classifier, store.as_ref(), &bytes).await?;
                    let source = match &prepared {
                        Prepared::Known(_) => PreviewSource::Encoded(bytes),
                        Prepared::Fresh(c) => PreviewSource::Decoded(c.image.clone()),
                    };
                    let preview = render::spawn_preview(source, prepared.result().clone()).await;
                    Ok::<_, PipelineError>((prepared, preview))
                }
                .await;
                ImageWork {
                    index,
                    url: image.url,
                    outcome,
                }
            });
        }

        let mut out = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(work) => out.push(work),
                Err(e) => tracing::error!(error = %e, "image task panicked"),
            }
        }
        out.sort_by_key(|w| w.index);
        // Re-number densely so report indexes match positions.
        for (pos, w) in out.iter_mut().enumerate() {
            w.index = pos;
        }
        out
    }

    /// Best-effort text notice; failures are only logged.
    async fn notify(&self, settings: &DingTalkConfig, envelope: &Envelope, notice: &Notice) {
        let target = resolve_target(
            envelope.session_webhook.as_ref(),
            &settings.webhook_url,
            chrono::Utc::now().timestamp_millis(),
        );
        let Some(target) = target else {
            tracing::debug!(title = %notice.title, "no reply target, notice dropped");
            return;
        };
        if let Err(e) = self.sink.send(&target, &notice.to_payload()).await {
            tracing::warn!(error = %e, title = %notice.title, "notice dispatch failed");
        }
    }

    /// Classify and store one uploaded image.
    ///
    /// Bytes that are already stored return the stored row without
    /// running the detector.
    pub async fn detect_upload(
        &self,
        bytes: &[u8],
        provenance: &Provenance,
    ) -> PipelineResult<UploadOutcome> {
        let admitted =
            intake::admit_image(&self.classifier, self.store.as_ref(), bytes, provenance).await?;
        let source = match admitted.image {
            Some(image) => PreviewSource::Decoded(image),
            None => PreviewSource::Encoded(bytes.to_vec()),
        };
        let image_base64 = render::spawn_preview(source, admitted.stored.result.clone()).await;
        Ok(UploadOutcome {
            stored: admitted.stored,
            is_new: admitted.is_new,
            image_base64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::RegionAnalyzer;
    use crate::classifier::LabelTable;
    use crate::config::ClassifierConfig;
    use crate::detector::ObjectDetector;
    use crate::models::{BoundingBox, ConfidencePolicy, RawDetection};
    use crate::signature::sign;
    use crate::store::InMemoryDetectionStore;
    use anyhow::Result;
    use async_trait::async_trait;
    use image::{DynamicImage, GrayImage};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const SECRET: &str = "test_secret";

    struct ScenarioDetector;

    #[async_trait]
    impl ObjectDetector for ScenarioDetector {
        fn name(&self) -> &str {
            "scenario"
        }
        async fn detect(&self, _image: &DynamicImage) -> Result<Vec<RawDetection>> {
            let b = |n: i32| BoundingBox::new(n, n, n + 4, n + 4).unwrap();
            Ok(vec![
                RawDetection::new("locked_lock", 0.9, b(0)),
                RawDetection::new("locked_lock", 0.88, b(5)),
                RawDetection::new("unlocked_lock", 0.95, b(10)),
            ])
        }
    }

    /// Scenario output on the first call, then an outage.
    #[derive(Default)]
    struct FlakyDetector {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ObjectDetector for FlakyDetector {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn detect(&self, image: &DynamicImage) -> Result<Vec<RawDetection>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
                anyhow::bail!("detector down");
            }
            ScenarioDetector.detect(image).await
        }
    }

    struct AlwaysLocked;
    impl RegionAnalyzer for AlwaysLocked {
        fn appears_locked(&self, _crop: &GrayImage) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct MapFetcher {
        images: HashMap<String, Vec<u8>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ImageFetcher for MapFetcher {
        async fn fetch(&self, image: &ImageRef) -> PipelineResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.images
                .get(&image.url)
                .cloned()
                .ok_or_else(|| PipelineError::RetrievalFailed("404".into()))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(String, Value)>>,
        fail: bool,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn send(&self, target: &str, payload: &Value) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((target.to_string(), payload.clone()));
            if self.fail {
                anyhow::bail!("sink down");
            }
            Ok(())
        }
    }

    fn png(seed: u8) -> Vec<u8> {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(16, 16, image::Luma([seed])));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    struct Harness {
        orch: CallbackOrchestrator,
        store: Arc<InMemoryDetectionStore>,
        fetcher: Arc<MapFetcher>,
        sink: Arc<RecordingSink>,
    }

    fn harness(images: &[(&str, Vec<u8>)], sink_fails: bool) -> Harness {
        harness_with(Arc::new(ScenarioDetector), images, sink_fails)
    }

    fn harness_with(
        detector: Arc<dyn ObjectDetector>,
        images: &[(&str, Vec<u8>)],
        sink_fails: bool,
    ) -> Harness {
        let classifier = LockStateClassifier::new(
            detector,
            Arc::new(AlwaysLocked),
            LabelTable::from_config(&ClassifierConfig::default()).unwrap(),
            ConfidencePolicy::Min,
        );
        let store = Arc::new(InMemoryDetectionStore::new());
        let fetcher = Arc::new(MapFetcher {
            images: images
                .iter()
                .map(|(u, b)| (u.to_string(), b.clone()))
                .collect(),
            calls: AtomicUsize::new(0),
        });
        let sink = Arc::new(RecordingSink {
            sent: Mutex::new(Vec::new()),
            fail: sink_fails,
        });
        let settings = DingTalkConfig {
            app_key: "bot-id".into(),
            app_secret: SECRET.into(),
            webhook_url: "https://robot.example/send".into(),
            bot_display_token: "@bot".into(),
            ack_without_image: true,
            max_clock_skew_secs: None,
        };
        let orch = CallbackOrchestrator::new(
            Arc::new(classifier),
            store.clone(),
            fetcher.clone(),
            sink.clone(),
            settings,
        );
        Harness {
            orch,
            store,
            fetcher,
            sink,
        }
    }

    fn signed(body: Value) -> CallbackContext {
        let ts = "1700000000";
        CallbackContext {
            timestamp: Some(ts.into()),
            signature: Some(sign(ts, SECRET)),
            body: body.to_string().into_bytes(),
        }
    }

    fn message(text: &str, urls: &[&str]) -> Value {
        json!({
            "msgId": "msg-1",
            "conversationType": "2",
            "conversationId": "cid-1",
            "senderId": "user-1",
            "senderNick": "alice",
            "text": {"content": text},
            "images": {"imageUrl": urls},
        })
    }

    use CallbackState::*;

    #[tokio::test]
    async fn test_full_pipeline_dispatches_result() {
        let h = harness(&[("http://img/a.png", png(1))], false);
        let out = h
            .orch
            .handle(signed(message("@bot check this", &["http://img/a.png"])))
            .await;
        assert_eq!(
            out.trace,
            vec![
                Received,
                SignatureChecked,
                Parsed,
                ImageFetched,
                Classified,
                Persisted,
                Dispatched
            ]
        );
        assert!(out.success);
        assert_eq!(out.http_status, 200);
        assert_eq!(out.images.len(), 1);
        assert_eq!(out.images[0].is_new, Some(true));
        assert_eq!(out.images[0].is_safe, Some(false));
        assert!(out.images[0].dispatched);

        let sent = h.sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "https://robot.example/send");
        assert_eq!(sent[0].1["msgtype"], "markdown");

        let stats = h.store.statistics().await.unwrap();
        assert_eq!(stats.total_detections, 1);
        assert_eq!(stats.total_unlocked, 1);
        let stored = h.store.history(10, 0).await.unwrap();
        assert_eq!(stored[0].group_id.as_deref(), Some("cid-1"));
        assert_eq!(stored[0].dingtalk_message_id.as_deref(), Some("msg-1"));
    }

    #[tokio::test]
    async fn test_invalid_signature_is_401_and_side_effect_free() {
        let h = harness(&[("http://img/a.png", png(1))], false);
        let mut ctx = signed(message("@bot check this", &["http://img/a.png"]));
        ctx.signature = Some(sign("1700000000", "wrong"));
        let out = h.orch.handle(ctx).await;
        assert_eq!(out.trace, vec![Received, Failed]);
        assert_eq!(out.http_status, 401);
        assert_eq!(out.error.as_deref(), Some("invalid_signature"));
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 0);
        assert!(h.sink.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unaddressed_message_skipped() {
        let h = harness(&[("http://img/a.png", png(1))], false);
        let out = h
            .orch
            .handle(signed(message("just chatting", &["http://img/a.png"])))
            .await;
        assert_eq!(out.final_state(), Skipped);
        assert!(out.success);
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.statistics().await.unwrap().total_detections, 0);
        assert!(h.sink.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mention_without_image_acknowledged() {
        let h = harness(&[], false);
        let out = h.orch.handle(signed(message("@bot hi", &[]))).await;
        assert_eq!(out.final_state(), Skipped);
        let sent = h.sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1["markdown"]["title"], formatter::ACK_TITLE);
    }

    #[tokio::test]
    async fn test_malformed_body_fails_with_200() {
        let h = harness(&[], false);
        let out = h.orch.handle(signed(json!({"senderId": "x"}))).await;
        assert_eq!(out.trace, vec![Received, SignatureChecked, Failed]);
        assert_eq!(out.http_status, 200);
        assert!(!out.success);
        assert_eq!(out.error.as_deref(), Some("malformed_message"));
    }

    #[tokio::test]
    async fn test_all_downloads_failing_sends_notice() {
        let h = harness(&[], false);
        let out = h
            .orch
            .handle(signed(message("@bot", &["http://img/missing.png"])))
            .await;
        assert_eq!(out.final_state(), Failed);
        assert_eq!(out.error.as_deref(), Some("retrieval_failed"));
        assert_eq!(h.store.statistics().await.unwrap().total_detections, 0);
        let sent = h.sink.sent.lock().unwrap();
        assert_eq!(sent[0].1["markdown"]["title"], formatter::DOWNLOAD_FAILED_TITLE);
    }

    #[tokio::test]
    async fn test_partial_download_failure_continues() {
        let h = harness(&[("http://img/a.png", png(1))], false);
        let out = h
            .orch
            .handle(signed(message(
                "@bot",
                &["http://img/missing.png", "http://img/a.png"],
            )))
            .await;
        assert_eq!(out.final_state(), Dispatched);
        assert_eq!(out.images[0].error.as_deref(), Some("retrieval_failed"));
        assert_eq!(out.images[1].is_new, Some(true));
    }

    #[tokio::test]
    async fn test_undecodable_images_fail_detection_without_rows() {
        let h = harness(&[("http://img/a.png", b"garbage".to_vec())], false);
        let out = h
            .orch
            .handle(signed(message("@bot", &["http://img/a.png"])))
            .await;
        assert_eq!(
            out.trace,
            vec![Received, SignatureChecked, Parsed, ImageFetched, Failed]
        );
        assert_eq!(out.error.as_deref(), Some("detection_failed"));
        assert_eq!(h.store.statistics().await.unwrap().total_detections, 0);
    }

    #[tokio::test]
    async fn test_duplicate_image_reuses_row_and_still_announces() {
        let bytes = png(7);
        let h = harness(
            &[("http://img/a.png", bytes.clone()), ("http://img/b.png", bytes)],
            false,
        );
        let first = h
            .orch
            .handle(signed(message("@bot", &["http://img/a.png"])))
            .await;
        let second = h
            .orch
            .handle(signed(message("@bot", &["http://img/b.png"])))
            .await;
        assert_eq!(first.images[0].detection_id, second.images[0].detection_id);
        assert_eq!(second.images[0].is_new, Some(false));
        assert_eq!(h.store.statistics().await.unwrap().total_detections, 1);
        assert_eq!(h.sink.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_dispatch_failure_still_succeeds() {
        let h = harness(&[("http://img/a.png", png(1))], true);
        let out = h
            .orch
            .handle(signed(message("@bot", &["http://img/a.png"])))
            .await;
        assert_eq!(out.final_state(), Dispatched);
        assert!(out.success);
        assert!(!out.images[0].dispatched);
        assert_eq!(h.store.statistics().await.unwrap().total_detections, 1);
    }

    #[tokio::test]
    async fn test_session_webhook_preferred_per_request() {
        let h = harness(&[("http://img/a.png", png(1))], false);
        let mut body = message("@bot", &["http://img/a.png"]);
        body["sessionWebhook"] = json!("https://session.example/reply");
        h.orch.handle(signed(body)).await;
        h.orch
            .handle(signed(message("@bot", &["http://img/a.png"])))
            .await;
        let sent = h.sink.sent.lock().unwrap();
        assert_eq!(sent[0].0, "https://session.example/reply");
        assert_eq!(sent[1].0, "https://robot.example/send");
    }

    #[tokio::test]
    async fn test_configure_rotates_secret() {
        let h = harness(&[], false);
        h.orch.configure("bot-id", "rotated", None).await;
        let out = h.orch.handle(signed(message("@bot", &[]))).await;
        assert_eq!(out.http_status, 401);
        assert_eq!(
            h.orch.settings().await.webhook_url,
            "https://robot.example/send"
        );
    }

    #[tokio::test]
    async fn test_detect_upload_is_idempotent() {
        let h = harness(&[], false);
        let bytes = png(3);
        let a = h
            .orch
            .detect_upload(&bytes, &Provenance::default())
            .await
            .unwrap();
        let b = h
            .orch
            .detect_upload(&bytes, &Provenance::default())
            .await
            .unwrap();
        assert!(a.is_new);
        assert!(!b.is_new);
        assert_eq!(a.stored, b.stored);
        assert!(a.image_base64.is_some());
        assert_eq!(a.stored.result.total_locks(), 3);
        assert!((a.stored.result.confidence_score() - 0.88).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_repeat_upload_served_from_store_when_detector_down() {
        let detector = Arc::new(FlakyDetector::default());
        let h = harness_with(detector.clone(), &[], false);
        let bytes = png(11);

        let first = h
            .orch
            .detect_upload(&bytes, &Provenance::default())
            .await
            .unwrap();
        let second = h
            .orch
            .detect_upload(&bytes, &Provenance::default())
            .await
            .unwrap();

        assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
        assert!(!second.is_new);
        assert_eq!(first.stored, second.stored);
        assert!(second.image_base64.is_some());
    }

    #[tokio::test]
    async fn test_redelivered_callback_skips_detector() {
        let bytes = png(12);
        let detector = Arc::new(FlakyDetector::default());
        let h = harness_with(
            detector.clone(),
            &[("http://img/a.png", bytes.clone()), ("http://img/b.png", bytes)],
            false,
        );

        let first = h
            .orch
            .handle(signed(message("@bot", &["http://img/a.png"])))
            .await;
        let again = h
            .orch
            .handle(signed(message("@bot", &["http://img/b.png"])))
            .await;

        assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
        assert_eq!(again.final_state(), Dispatched);
        assert_eq!(again.images[0].is_new, Some(false));
        assert_eq!(first.images[0].detection_id, again.images[0].detection_id);
        assert_eq!(h.sink.sent.lock().unwrap().len(), 2);
    }
}
