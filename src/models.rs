//! Core data models used throughout lockwatch.
//!
//! These types represent the raw detector output, the per-lock verdicts, the
//! per-image safety summary, and the persisted detection records that flow
//! through the classification and callback pipeline.

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

/// Axis-aligned pixel rectangle, `xmin < xmax` and `ymin < ymax`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BoundingBox {
    xmin: i32,
    ymin: i32,
    xmax: i32,
    ymax: i32,
}

impl BoundingBox {
    /// Build a box, rejecting degenerate or inverted coordinates.
    pub fn new(xmin: i32, ymin: i32, xmax: i32, ymax: i32) -> Result<Self, String> {
        if xmin >= xmax || ymin >= ymax {
            return Err(format!(
                "degenerate bounding box ({}, {}, {}, {})",
                xmin, ymin, xmax, ymax
            ));
        }
        Ok(Self {
            xmin,
            ymin,
            xmax,
            ymax,
        })
    }

    pub fn xmin(&self) -> i32 {
        self.xmin
    }
    pub fn ymin(&self) -> i32 {
        self.ymin
    }
    pub fn xmax(&self) -> i32 {
        self.xmax
    }
    pub fn ymax(&self) -> i32 {
        self.ymax
    }

    pub fn width(&self) -> i32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> i32 {
        self.ymax - self.ymin
    }

    /// Intersect with an image of the given size.
    ///
    /// Returns `(x, y, w, h)` in unsigned pixel space, or `None` when the box
    /// lies entirely outside the image.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.xmin.max(0) as i64;
        let y0 = self.ymin.max(0) as i64;
        let x1 = (self.xmax as i64).min(width as i64);
        let y1 = (self.ymax as i64).min(height as i64);
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
    }
}

/// One `(label, confidence, bbox)` tuple as produced by the object detector.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub label: String,
    pub confidence: f64,
    pub bbox: BoundingBox,
}

impl RawDetection {
    pub fn new(label: impl Into<String>, confidence: f64, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox,
        }
    }
}

/// Verdict for one detected lock.
#[derive(Debug, Clone, PartialEq)]
pub struct LockDetail {
    pub lock_type: String,
    pub is_locked: bool,
    pub confidence: f64,
    pub bbox: BoundingBox,
}

impl Serialize for LockDetail {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("LockDetail", 8)?;
        s.serialize_field("lock_type", &self.lock_type)?;
        s.serialize_field("is_locked", &self.is_locked)?;
        s.serialize_field("confidence", &self.confidence)?;
        s.serialize_field("bbox", &self.bbox)?;
        s.serialize_field("position_x", &self.bbox.xmin())?;
        s.serialize_field("position_y", &self.bbox.ymin())?;
        s.serialize_field("width", &self.bbox.width())?;
        s.serialize_field("height", &self.bbox.height())?;
        s.end()
    }
}

/// How per-lock confidences fold into one `confidence_score`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidencePolicy {
    /// Lowest confidence over all locks (conservative bound).
    #[default]
    Min,
    Max,
    Mean,
}

impl ConfidencePolicy {
    /// Aggregate a set of confidences; `0.0` when empty.
    ///
    /// The result does not depend on the order of `values`: the mean is
    /// summed over the sorted values.
    pub fn aggregate(&self, values: impl Iterator<Item = f64>) -> f64 {
        let mut values: Vec<f64> = values.collect();
        if values.is_empty() {
            return 0.0;
        }
        match self {
            ConfidencePolicy::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            ConfidencePolicy::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            ConfidencePolicy::Mean => {
                values.sort_by(f64::total_cmp);
                values.iter().sum::<f64>() / values.len() as f64
            }
        }
    }
}

/// Safety summary for one image.
///
/// Built empty, filled by [`add_lock`](DetectionResult::add_lock) during a
/// single classification pass, then handed to the store. Counts are kept
/// private so `total = locked + unlocked` holds after every mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    lock_details: Vec<LockDetail>,
    locked_locks: u32,
    unlocked_locks: u32,
    confidence_score: f64,
    policy: ConfidencePolicy,
    detection_time: DateTime<Utc>,
}

impl DetectionResult {
    pub fn new(policy: ConfidencePolicy) -> Self {
        Self::new_at(policy, Utc::now())
    }

    pub fn new_at(policy: ConfidencePolicy, detection_time: DateTime<Utc>) -> Self {
        Self {
            lock_details: Vec::new(),
            locked_locks: 0,
            unlocked_locks: 0,
            confidence_score: 0.0,
            policy,
            detection_time,
        }
    }

    /// Rebuild a persisted result. The stored score is kept as-is.
    pub fn restore(
        lock_details: Vec<LockDetail>,
        confidence_score: f64,
        detection_time: DateTime<Utc>,
    ) -> Self {
        let locked = lock_details.iter().filter(|d| d.is_locked).count() as u32;
        let unlocked = lock_details.len() as u32 - locked;
        Self {
            lock_details,
            locked_locks: locked,
            unlocked_locks: unlocked,
            confidence_score,
            policy: ConfidencePolicy::default(),
            detection_time,
        }
    }

    pub fn add_lock(
        &mut self,
        lock_type: impl Into<String>,
        is_locked: bool,
        confidence: f64,
        bbox: BoundingBox,
    ) {
        self.lock_details.push(LockDetail {
            lock_type: lock_type.into(),
            is_locked,
            confidence,
            bbox,
        });
        if is_locked {
            self.locked_locks += 1;
        } else {
            self.unlocked_locks += 1;
        }
        self.confidence_score = self
            .policy
            .aggregate(self.lock_details.iter().map(|d| d.confidence));
    }

    pub fn lock_details(&self) -> &[LockDetail] {
        &self.lock_details
    }

    pub fn total_locks(&self) -> u32 {
        self.locked_locks + self.unlocked_locks
    }

    pub fn locked_locks(&self) -> u32 {
        self.locked_locks
    }

    pub fn unlocked_locks(&self) -> u32 {
        self.unlocked_locks
    }

    pub fn is_safe(&self) -> bool {
        self.unlocked_locks == 0
    }

    pub fn confidence_score(&self) -> f64 {
        self.confidence_score
    }

    pub fn detection_time(&self) -> DateTime<Utc> {
        self.detection_time
    }

    /// Unlocked entries with their 1-based position among all locks.
    pub fn unlocked_details(&self) -> impl Iterator<Item = (usize, &LockDetail)> {
        self.lock_details
            .iter()
            .enumerate()
            .filter(|(_, d)| !d.is_locked)
            .map(|(i, d)| (i + 1, d))
    }
}

impl Serialize for DetectionResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("DetectionResult", 7)?;
        s.serialize_field("is_safe", &self.is_safe())?;
        s.serialize_field("total_locks", &self.total_locks())?;
        s.serialize_field("unlocked_locks", &self.unlocked_locks)?;
        s.serialize_field("locked_locks", &self.locked_locks)?;
        s.serialize_field("lock_details", &self.lock_details)?;
        s.serialize_field("confidence_score", &self.confidence_score)?;
        s.serialize_field("detection_time", &self.detection_time.to_rfc3339())?;
        s.end()
    }
}

/// Who and where an image came from; stored alongside the result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provenance {
    pub dingtalk_message_id: Option<String>,
    pub user_id: Option<String>,
    pub group_id: Option<String>,
}

/// A persisted detection, keyed by the image fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredDetection {
    pub id: i64,
    pub image_hash: String,
    pub dingtalk_message_id: Option<String>,
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    pub result: DetectionResult,
}

/// Aggregate counters over all stored detections.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionStats {
    pub total_detections: i64,
    pub unsafe_detections: i64,
    pub total_locks: i64,
    pub total_unlocked: i64,
    pub today_detections: i64,
    pub safety_rate: f64,
}

impl DetectionStats {
    /// Percentage of safe detections; 100 when nothing has been stored.
    pub fn safety_rate_of(total: i64, unsafe_count: i64) -> f64 {
        if total > 0 {
            (total - unsafe_count) as f64 / total as f64 * 100.0
        } else {
            100.0
        }
    }
}
