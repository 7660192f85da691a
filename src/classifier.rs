//! Lock-state classification.
//!
//! Turns raw detector output into per-lock verdicts and folds them into a
//! [`DetectionResult`]. Each detection is decided by strict precedence:
//!
//! 1. label maps to [`LockLabel::Locked`] → locked
//! 2. label maps to [`LockLabel::Unlocked`] → unlocked
//! 3. label maps to [`LockLabel::Ambiguous`] → crop the box and ask the
//!    [`RegionAnalyzer`]
//!
//! Labels are resolved through an explicit [`LabelTable`]. A label missing
//! from the table is rejected (`strict_labels = true`) or treated as
//! ambiguous with a warning.
//!
//! Classification is deterministic: the same bytes and detections always
//! produce the same verdicts, which the fingerprint-keyed store relies on.
//!
//! Decoding and pixel analysis run on the blocking pool; only the detector
//! call is awaited on the runtime.

use image::DynamicImage;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

use crate::analyzer::{crop_region, BoundingBoxFeatureAnalyzer, RegionAnalyzer};
use crate::config::{ClassifierConfig, Config};
use crate::detector::ObjectDetector;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{ConfidencePolicy, DetectionResult, RawDetection};

/// The closed set of classes a detector label can map to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockLabel {
    Locked,
    Unlocked,
    Ambiguous,
}

/// Exhaustive mapping from detector label tokens to [`LockLabel`].
#[derive(Debug, Clone)]
pub struct LabelTable {
    entries: HashMap<String, LockLabel>,
    strict: bool,
}

impl LabelTable {
    pub fn from_config(config: &ClassifierConfig) -> anyhow::Result<Self> {
        let mut entries = HashMap::new();
        let groups = [
            (&config.locked, LockLabel::Locked),
            (&config.unlocked, LockLabel::Unlocked),
            (&config.ambiguous, LockLabel::Ambiguous),
        ];
        for (tokens, label) in groups {
            for token in tokens {
                let key = normalize(token);
                if key.is_empty() {
                    anyhow::bail!("classifier label tokens must not be empty");
                }
                if let Some(previous) = entries.insert(key.clone(), label) {
                    if previous != label {
                        anyhow::bail!(
                            "classifier label '{}' is listed as both {:?} and {:?}",
                            key,
                            previous,
                            label
                        );
                    }
                }
            }
        }
        Ok(Self {
            entries,
            strict: config.strict_labels,
        })
    }

    /// Resolve a detector label. Unknown labels fail in strict mode.
    pub fn resolve(&self, label: &str) -> PipelineResult<LockLabel> {
        match self.entries.get(&normalize(label)) {
            Some(l) => Ok(*l),
            None if self.strict => Err(PipelineError::DetectionFailed(format!(
                "unrecognized detector label '{}'",
                label
            ))),
            None => {
                tracing::warn!(label, "unrecognized detector label, deferring to feature analysis");
                Ok(LockLabel::Ambiguous)
            }
        }
    }
}

fn normalize(token: &str) -> String {
    token.trim().to_lowercase()
}

/// Content fingerprint of raw image bytes (SHA-256, hex).
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Output of classifying one image.
pub struct ClassifiedImage {
    pub fingerprint: String,
    pub image: DynamicImage,
    pub result: DetectionResult,
}

/// Decode raw bytes on the blocking pool.
pub async fn decode(bytes: Vec<u8>) -> PipelineResult<DynamicImage> {
    tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
        .await
        .map_err(|e| PipelineError::DetectionFailed(format!("decode task failed: {}", e)))?
        .map_err(|e| PipelineError::DetectionFailed(format!("cannot decode image: {}", e)))
}

pub struct LockStateClassifier {
    detector: Arc<dyn ObjectDetector>,
    analyzer: Arc<dyn RegionAnalyzer>,
    labels: Arc<LabelTable>,
    policy: ConfidencePolicy,
}

impl LockStateClassifier {
    pub fn new(
        detector: Arc<dyn ObjectDetector>,
        analyzer: Arc<dyn RegionAnalyzer>,
        labels: LabelTable,
        policy: ConfidencePolicy,
    ) -> Self {
        Self {
            detector,
            analyzer,
            labels: Arc::new(labels),
            policy,
        }
    }

    /// Build a classifier with the feature analyzer and label table from config.
    pub fn from_config(config: &Config, detector: Arc<dyn ObjectDetector>) -> anyhow::Result<Self> {
        Ok(Self::new(
            detector,
            Arc::new(BoundingBoxFeatureAnalyzer::new(config.analyzer.clone())),
            LabelTable::from_config(&config.classifier)?,
            config.classifier.confidence_policy,
        ))
    }

    pub fn detector_name(&self) -> &str {
        self.detector.name()
    }

    /// Decide locked/unlocked for a single detection.
    pub fn verdict(&self, detection: &RawDetection, image: &DynamicImage) -> PipelineResult<bool> {
        verdict(self.analyzer.as_ref(), &self.labels, detection, image)
    }

    /// Fold a set of detections for one image into a [`DetectionResult`].
    pub fn classify_detections(
        &self,
        image: &DynamicImage,
        detections: &[RawDetection],
    ) -> PipelineResult<DetectionResult> {
        fold(
            self.analyzer.as_ref(),
            &self.labels,
            self.policy,
            image,
            detections,
        )
    }

    /// Decode, detect, and classify one image's raw bytes.
    pub async fn classify_image(&self, bytes: &[u8]) -> PipelineResult<ClassifiedImage> {
        let image = decode(bytes.to_vec()).await?;

        let detections = self
            .detector
            .detect(&image)
            .await
            .map_err(|e| PipelineError::DetectionFailed(e.to_string()))?;

        let analyzer = self.analyzer.clone();
        let labels = self.labels.clone();
        let policy = self.policy;
        let (image, result) = tokio::task::spawn_blocking(move || {
            let result = fold(analyzer.as_ref(), &labels, policy, &image, &detections);
            (image, result)
        })
        .await
        .map_err(|e| PipelineError::DetectionFailed(format!("classification task failed: {}", e)))?;
        let result = result?;

        tracing::info!(
            total = result.total_locks(),
            unlocked = result.unlocked_locks(),
            "classified image"
        );

        Ok(ClassifiedImage {
            fingerprint: fingerprint(bytes),
            image,
            result,
        })
    }
}

fn verdict(
    analyzer: &dyn RegionAnalyzer,
    labels: &LabelTable,
    detection: &RawDetection,
    image: &DynamicImage,
) -> PipelineResult<bool> {
    match labels.resolve(&detection.label)? {
        LockLabel::Locked => Ok(true),
        LockLabel::Unlocked => Ok(false),
        LockLabel::Ambiguous => Ok(match crop_region(image, &detection.bbox) {
            Some(crop) => analyzer.appears_locked(&crop),
            None => true,
        }),
    }
}

fn fold(
    analyzer: &dyn RegionAnalyzer,
    labels: &LabelTable,
    policy: ConfidencePolicy,
    image: &DynamicImage,
    detections: &[RawDetection],
) -> PipelineResult<DetectionResult> {
    let mut result = DetectionResult::new(policy);
    for det in detections {
        let is_locked = verdict(analyzer, labels, det, image)?;
        result.add_lock(det.label.clone(), is_locked, det.confidence, det.bbox);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BoundingBox;
    use anyhow::Result;
    use async_trait::async_trait;
    use image::GrayImage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedDetector(Vec<RawDetection>);

    #[async_trait]
    impl ObjectDetector for FixedDetector {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn detect(&self, _image: &DynamicImage) -> Result<Vec<RawDetection>> {
            Ok(self.0.clone())
        }
    }

    struct FixedAnalyzer {
        answer: bool,
        calls: AtomicUsize,
    }

    impl RegionAnalyzer for FixedAnalyzer {
        fn appears_locked(&self, _crop: &GrayImage) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer
        }
    }

    fn bbox(n: i32) -> BoundingBox {
        BoundingBox::new(n, n, n + 8, n + 8).unwrap()
    }

    fn classifier(answer: bool, strict: bool) -> (LockStateClassifier, Arc<FixedAnalyzer>) {
        let analyzer = Arc::new(FixedAnalyzer {
            answer,
            calls: AtomicUsize::new(0),
        });
        let cfg = ClassifierConfig {
            strict_labels: strict,
            ..ClassifierConfig::default()
        };
        let c = LockStateClassifier::new(
            Arc::new(FixedDetector(vec![])),
            analyzer.clone(),
            LabelTable::from_config(&cfg).unwrap(),
            ConfidencePolicy::Min,
        );
        (c, analyzer)
    }

    fn image() -> DynamicImage {
        DynamicImage::new_luma8(64, 64)
    }

    #[test]
    fn test_locked_label_ignores_analyzer() {
        let (c, analyzer) = classifier(false, true);
        let det = RawDetection::new("locked_lock", 0.9, bbox(1));
        assert!(c.verdict(&det, &image()).unwrap());
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unlocked_label_ignores_analyzer() {
        let (c, analyzer) = classifier(true, true);
        let det = RawDetection::new("Unlocked_Lock ", 0.9, bbox(1));
        assert!(!c.verdict(&det, &image()).unwrap());
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_ambiguous_label_defers_to_analyzer() {
        for answer in [true, false] {
            let (c, analyzer) = classifier(answer, true);
            let det = RawDetection::new("padlock", 0.7, bbox(4));
            assert_eq!(c.verdict(&det, &image()).unwrap(), answer);
            assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_unknown_label_strict_fails() {
        let (c, _) = classifier(true, true);
        let det = RawDetection::new("bicycle", 0.7, bbox(4));
        let err = c.verdict(&det, &image()).unwrap_err();
        assert_eq!(err.code(), "detection_failed");
    }

    #[test]
    fn test_unknown_label_lenient_defers() {
        let (c, analyzer) = classifier(false, false);
        let det = RawDetection::new("bicycle", 0.7, bbox(4));
        assert!(!c.verdict(&det, &image()).unwrap());
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_conflicting_label_table_rejected() {
        let cfg = ClassifierConfig {
            ambiguous: vec!["LOCKED".into()],
            ..ClassifierConfig::default()
        };
        assert!(LabelTable::from_config(&cfg).is_err());
    }

    #[test]
    fn test_permutation_invariance() {
        let (c, _) = classifier(false, true);
        let a = RawDetection::new("locked_lock", 0.9, bbox(1));
        let b = RawDetection::new("unlocked_lock", 0.95, bbox(10));
        let d = RawDetection::new("padlock", 0.6, bbox(20));
        let img = image();
        let r1 = c
            .classify_detections(&img, &[a.clone(), b.clone(), d.clone()])
            .unwrap();
        let r2 = c.classify_detections(&img, &[d, a, b]).unwrap();
        assert_eq!(r1.total_locks(), r2.total_locks());
        assert_eq!(r1.unlocked_locks(), r2.unlocked_locks());
        assert_eq!(r1.is_safe(), r2.is_safe());
        assert_eq!(r1.confidence_score(), r2.confidence_score());
    }

    #[test]
    fn test_three_lock_scenario() {
        let (c, _) = classifier(true, true);
        let dets = vec![
            RawDetection::new("locked_lock", 0.9, bbox(1)),
            RawDetection::new("locked_lock", 0.88, bbox(12)),
            RawDetection::new("unlocked_lock", 0.95, bbox(24)),
        ];
        let r = c.classify_detections(&image(), &dets).unwrap();
        assert_eq!(r.total_locks(), 3);
        assert_eq!(r.locked_locks(), 2);
        assert_eq!(r.unlocked_locks(), 1);
        assert!(!r.is_safe());
        assert!((r.confidence_score() - 0.88).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_undecodable_bytes_fail_detection() {
        let (c, _) = classifier(true, true);
        let err = c.classify_image(b"not an image").await.err().unwrap();
        assert!(matches!(err, PipelineError::DetectionFailed(_)));
    }

    struct ThreadRecorder(std::sync::Mutex<Option<std::thread::ThreadId>>);

    impl RegionAnalyzer for ThreadRecorder {
        fn appears_locked(&self, _crop: &GrayImage) -> bool {
            *self.0.lock().unwrap() = Some(std::thread::current().id());
            true
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_pixel_analysis_runs_off_runtime_thread() {
        let recorder = Arc::new(ThreadRecorder(std::sync::Mutex::new(None)));
        let c = LockStateClassifier::new(
            Arc::new(FixedDetector(vec![RawDetection::new("padlock", 0.7, bbox(2))])),
            recorder.clone(),
            LabelTable::from_config(&ClassifierConfig::default()).unwrap(),
            ConfidencePolicy::Min,
        );
        let mut png = Vec::new();
        image()
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let classified = c.classify_image(&png).await.unwrap();
        assert_eq!(classified.result.locked_locks(), 1);
        let analyzed_on = recorder.0.lock().unwrap().expect("analyzer was not called");
        assert_ne!(analyzed_on, std::thread::current().id());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(fingerprint(b"abc"), fingerprint(b"abc"));
        assert_ne!(fingerprint(b"abc"), fingerprint(b"abd"));
        assert_eq!(fingerprint(b"").len(), 64);
    }
}
