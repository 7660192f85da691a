//! SQLite-backed [`DetectionStore`].
//!
//! `admit` runs in one transaction: `INSERT ... ON CONFLICT(image_hash) DO
//! NOTHING` on `detection_results`, then the `lock_details` rows only when
//! the insert actually happened. The unique index makes the first committed
//! writer win; an in-process write gate keeps concurrent admits from
//! contending for the SQLite write lock.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use crate::models::{
    BoundingBox, DetectionResult, DetectionStats, LockDetail, Provenance, StoredDetection,
};

use super::{start_of_today, Admission, DetectionStore};

pub struct SqliteDetectionStore {
    pool: SqlitePool,
    write_gate: Mutex<()>,
}

impl SqliteDetectionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_gate: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn hydrate(&self, row: &SqliteRow) -> Result<StoredDetection> {
        let id: i64 = row.try_get("id")?;
        let detection_ms: i64 = row.try_get("detection_time")?;
        let detection_time = DateTime::<Utc>::from_timestamp_millis(detection_ms)
            .ok_or_else(|| anyhow!("invalid detection_time {} for detection {}", detection_ms, id))?;

        let detail_rows = sqlx::query(
            r#"
            SELECT lock_type, is_locked, confidence, position_x, position_y, width, height
            FROM lock_details
            WHERE detection_id = ?
            ORDER BY lock_index
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut details = Vec::with_capacity(detail_rows.len());
        for d in &detail_rows {
            let x: i32 = d.try_get("position_x")?;
            let y: i32 = d.try_get("position_y")?;
            let w: i32 = d.try_get("width")?;
            let h: i32 = d.try_get("height")?;
            details.push(LockDetail {
                lock_type: d.try_get("lock_type")?,
                is_locked: d.try_get("is_locked")?,
                confidence: d.try_get("confidence")?,
                bbox: BoundingBox::new(x, y, x + w, y + h).map_err(|e| anyhow!(e))?,
            });
        }

        Ok(StoredDetection {
            id,
            image_hash: row.try_get("image_hash")?,
            dingtalk_message_id: row.try_get("dingtalk_message_id")?,
            user_id: row.try_get("user_id")?,
            group_id: row.try_get("group_id")?,
            result: DetectionResult::restore(
                details,
                row.try_get("confidence_score")?,
                detection_time,
            ),
        })
    }

    async fn hydrate_all(&self, rows: Vec<SqliteRow>) -> Result<Vec<StoredDetection>> {
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(self.hydrate(row).await?);
        }
        Ok(out)
    }
}

const SELECT_DETECTION: &str = r#"
    SELECT id, image_hash, detection_time, confidence_score,
           dingtalk_message_id, user_id, group_id
    FROM detection_results
"#;

#[async_trait]
impl DetectionStore for SqliteDetectionStore {
    async fn admit(
        &self,
        fingerprint: &str,
        result: &DetectionResult,
        provenance: &Provenance,
    ) -> Result<Admission> {
        let _gate = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO detection_results (image_hash, detection_time, locks_detected,
                                           unlocked_locks, confidence_score,
                                           dingtalk_message_id, user_id, group_id,
                                           is_safe, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(image_hash) DO NOTHING
            "#,
        )
        .bind(fingerprint)
        .bind(result.detection_time().timestamp_millis())
        .bind(result.total_locks() as i64)
        .bind(result.unlocked_locks() as i64)
        .bind(result.confidence_score())
        .bind(&provenance.dingtalk_message_id)
        .bind(&provenance.user_id)
        .bind(&provenance.group_id)
        .bind(result.is_safe())
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;

        let is_new = inserted.rows_affected() == 1;
        if is_new {
            let detection_id = inserted.last_insert_rowid();
            for (i, detail) in result.lock_details().iter().enumerate() {
                sqlx::query(
                    r#"
                    INSERT INTO lock_details (detection_id, lock_index, lock_type, is_locked,
                                              confidence, position_x, position_y, width, height)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(detection_id)
                .bind(i as i64)
                .bind(&detail.lock_type)
                .bind(detail.is_locked)
                .bind(detail.confidence)
                .bind(detail.bbox.xmin())
                .bind(detail.bbox.ymin())
                .bind(detail.bbox.width())
                .bind(detail.bbox.height())
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;

        let stored = self
            .find_by_hash(fingerprint)
            .await?
            .with_context(|| format!("detection {} vanished after admit", fingerprint))?;
        if is_new {
            tracing::info!(id = stored.id, hash = fingerprint, "stored new detection");
        } else {
            tracing::info!(id = stored.id, hash = fingerprint, "duplicate image, reusing detection");
        }
        Ok(Admission { stored, is_new })
    }

    async fn get(&self, id: i64) -> Result<Option<StoredDetection>> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_DETECTION))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => Ok(Some(self.hydrate(&r).await?)),
            None => Ok(None),
        }
    }

    async fn find_by_hash(&self, image_hash: &str) -> Result<Option<StoredDetection>> {
        let row = sqlx::query(&format!("{} WHERE image_hash = ?", SELECT_DETECTION))
            .bind(image_hash)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => Ok(Some(self.hydrate(&r).await?)),
            None => Ok(None),
        }
    }

    async fn history(&self, limit: i64, offset: i64) -> Result<Vec<StoredDetection>> {
        let rows = sqlx::query(&format!(
            "{} ORDER BY detection_time DESC, id DESC LIMIT ? OFFSET ?",
            SELECT_DETECTION
        ))
        .bind(limit.max(0))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        self.hydrate_all(rows).await
    }

    async fn since(&self, since: DateTime<Utc>) -> Result<Vec<StoredDetection>> {
        let rows = sqlx::query(&format!(
            "{} WHERE detection_time >= ? ORDER BY detection_time DESC, id DESC",
            SELECT_DETECTION
        ))
        .bind(since.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        self.hydrate_all(rows).await
    }

    async fn statistics(&self) -> Result<DetectionStats> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COALESCE(SUM(CASE WHEN is_safe = 0 THEN 1 ELSE 0 END), 0) AS unsafe_count,
                   COALESCE(SUM(locks_detected), 0) AS total_locks,
                   COALESCE(SUM(unlocked_locks), 0) AS total_unlocked,
                   COALESCE(SUM(CASE WHEN detection_time >= ? THEN 1 ELSE 0 END), 0) AS today
            FROM detection_results
            "#,
        )
        .bind(start_of_today().timestamp_millis())
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.try_get("total")?;
        let unsafe_count: i64 = row.try_get("unsafe_count")?;
        Ok(DetectionStats {
            total_detections: total,
            unsafe_detections: unsafe_count,
            total_locks: row.try_get("total_locks")?,
            total_unlocked: row.try_get("total_unlocked")?,
            today_detections: row.try_get("today")?,
            safety_rate: DetectionStats::safety_rate_of(total, unsafe_count),
        })
    }
}
