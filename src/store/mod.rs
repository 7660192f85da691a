//! Storage abstraction for detection results.
//!
//! The [`DetectionStore`] trait is the persistence gate of the pipeline. Its
//! central operation, [`admit`](DetectionStore::admit), is keyed on the image
//! fingerprint and guarantees at most one stored result per distinct image:
//! re-submitting the same bytes (a retried upload, a duplicate webhook
//! delivery) returns the row that already exists.
//!
//! Implementations must be `Send + Sync` and must serialize concurrent
//! admits of the same fingerprint so only one caller observes `is_new`.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`admit`](DetectionStore::admit) | Insert-if-absent keyed on fingerprint |
//! | [`get`](DetectionStore::get) | Fetch by surrogate id |
//! | [`find_by_hash`](DetectionStore::find_by_hash) | Fetch by fingerprint |
//! | [`history`](DetectionStore::history) | Newest-first page of detections |
//! | [`since`](DetectionStore::since) | Detections at or after a time |
//! | [`statistics`](DetectionStore::statistics) | Aggregate counters |

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{DetectionResult, DetectionStats, Provenance, StoredDetection};

pub use memory::InMemoryDetectionStore;
pub use sqlite::SqliteDetectionStore;

/// Outcome of [`DetectionStore::admit`].
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub stored: StoredDetection,
    /// `false` when the fingerprint was already stored.
    pub is_new: bool,
}

#[async_trait]
pub trait DetectionStore: Send + Sync {
    /// Persist `result` under `fingerprint` unless that fingerprint exists.
    ///
    /// An existing row is returned unchanged; nothing is re-classified or
    /// duplicated.
    async fn admit(
        &self,
        fingerprint: &str,
        result: &DetectionResult,
        provenance: &Provenance,
    ) -> Result<Admission>;

    async fn get(&self, id: i64) -> Result<Option<StoredDetection>>;

    async fn find_by_hash(&self, image_hash: &str) -> Result<Option<StoredDetection>>;

    /// Newest first.
    async fn history(&self, limit: i64, offset: i64) -> Result<Vec<StoredDetection>>;

    /// Detections with `detection_time >= since`, newest first.
    async fn since(&self, since: DateTime<Utc>) -> Result<Vec<StoredDetection>>;

    async fn statistics(&self) -> Result<DetectionStats>;
}

/// Midnight UTC of the current day, the cut-off for `today_detections`.
pub(crate) fn start_of_today() -> DateTime<Utc> {
    let today = Utc::now().date_naive();
    today
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or_else(Utc::now)
}
