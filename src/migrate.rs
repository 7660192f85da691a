use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Open the configured database, create the schema, and close the pool.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes. Idempotent.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // One row per distinct image; image_hash is the dedup key
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS detection_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            image_hash TEXT NOT NULL UNIQUE,
            detection_time INTEGER NOT NULL,
            locks_detected INTEGER NOT NULL DEFAULT 0,
            unlocked_locks INTEGER NOT NULL DEFAULT 0,
            confidence_score REAL NOT NULL DEFAULT 0.0,
            dingtalk_message_id TEXT,
            user_id TEXT,
            group_id TEXT,
            is_safe INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-lock verdicts, owned by a detection
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS lock_details (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            detection_id INTEGER NOT NULL,
            lock_index INTEGER NOT NULL,
            lock_type TEXT NOT NULL,
            is_locked INTEGER NOT NULL,
            confidence REAL NOT NULL,
            position_x INTEGER NOT NULL,
            position_y INTEGER NOT NULL,
            width INTEGER NOT NULL,
            height INTEGER NOT NULL,
            UNIQUE(detection_id, lock_index),
            FOREIGN KEY (detection_id) REFERENCES detection_results(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_lock_details_detection_id ON lock_details(detection_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_detection_results_time ON detection_results(detection_time DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
