//! In-memory [`DetectionStore`] for tests and ephemeral runs.
//!
//! One mutex guards the check-and-insert in `admit`, which is what makes
//! concurrent admits of the same fingerprint first-writer-wins.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{DetectionResult, DetectionStats, Provenance, StoredDetection};

use super::{start_of_today, Admission, DetectionStore};

#[derive(Default)]
struct Inner {
    rows: Vec<StoredDetection>,
    by_hash: HashMap<String, usize>,
}

/// In-memory store for testing.
#[derive(Default)]
pub struct InMemoryDetectionStore {
    inner: Mutex<Inner>,
}

impl InMemoryDetectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

fn newest_first(rows: &mut [StoredDetection]) {
    rows.sort_by(|a, b| {
        b.result
            .detection_time()
            .cmp(&a.result.detection_time())
            .then(b.id.cmp(&a.id))
    });
}

#[async_trait]
impl DetectionStore for InMemoryDetectionStore {
    async fn admit(
        &self,
        fingerprint: &str,
        result: &DetectionResult,
        provenance: &Provenance,
    ) -> Result<Admission> {
        let mut inner = self.lock()?;
        if let Some(&idx) = inner.by_hash.get(fingerprint) {
            return Ok(Admission {
                stored: inner.rows[idx].clone(),
                is_new: false,
            });
        }
        let stored = StoredDetection {
            id: inner.rows.len() as i64 + 1,
            image_hash: fingerprint.to_string(),
            dingtalk_message_id: provenance.dingtalk_message_id.clone(),
            user_id: provenance.user_id.clone(),
            group_id: provenance.group_id.clone(),
            result: result.clone(),
        };
        let idx = inner.rows.len();
        inner.rows.push(stored.clone());
        inner.by_hash.insert(fingerprint.to_string(), idx);
        Ok(Admission {
            stored,
            is_new: true,
        })
    }

    async fn get(&self, id: i64) -> Result<Option<StoredDetection>> {
        let inner = self.lock()?;
        Ok(inner.rows.iter().find(|r| r.id == id).cloned())
    }

    async fn find_by_hash(&self, image_hash: &str) -> Result<Option<StoredDetection>> {
        let inner = self.lock()?;
        Ok(inner
            .by_hash
            .get(image_hash)
            .map(|&idx| inner.rows[idx].clone()))
    }

    async fn history(&self, limit: i64, offset: i64) -> Result<Vec<StoredDetection>> {
        let mut rows = self.lock()?.rows.clone();
        newest_first(&mut rows);
        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn since(&self, since: DateTime<Utc>) -> Result<Vec<StoredDetection>> {
        let mut rows: Vec<StoredDetection> = self
            .lock()?
            .rows
            .iter()
            .filter(|r| r.result.detection_time() >= since)
            .cloned()
            .collect();
        newest_first(&mut rows);
        Ok(rows)
    }

    async fn statistics(&self) -> Result<DetectionStats> {
        let inner = self.lock()?;
        let today = start_of_today();
        let total = inner.rows.len() as i64;
        let unsafe_count = inner.rows.iter().filter(|r| !r.result.is_safe()).count() as i64;
        Ok(DetectionStats {
            total_detections: total,
            unsafe_detections: unsafe_count,
            total_locks: inner
                .rows
                .iter()
                .map(|r| r.result.total_locks() as i64)
                .sum(),
            total_unlocked: inner
                .rows
                .iter()
                .map(|r| r.result.unlocked_locks() as i64)
                .sum(),
            today_detections: inner
                .rows
                .iter()
                .filter(|r| r.result.detection_time() >= today)
                .count() as i64,
            safety_rate: DetectionStats::safety_rate_of(total, unsafe_count),
        })
    }
}
