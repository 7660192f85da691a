//! Detection statistics and history for the terminal.
//!
//! Backs `lockwatch stats` and `lockwatch history`: a quick view of how many
//! images have been checked, how many were unsafe, and what the most recent
//! verdicts were.

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::models::StoredDetection;
use crate::store::{DetectionStore, SqliteDetectionStore};

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteDetectionStore::new(pool.clone());
    let stats = store.statistics().await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("lockwatch: Detection Stats");
    println!("==========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Detections:  {}", stats.total_detections);
    println!("  Unsafe:      {}", stats.unsafe_detections);
    println!("  Today:       {}", stats.today_detections);
    println!(
        "  Locks:       {} ({} unlocked)",
        stats.total_locks, stats.total_unlocked
    );
    println!("  Safety rate: {:.1}%", stats.safety_rate);
    println!();

    pool.close().await;
    Ok(())
}

/// Run the history command: print stored detections newest first.
pub async fn run_history(config: &Config, limit: i64, offset: i64) -> Result<()> {
    if limit <= 0 {
        anyhow::bail!("--limit must be positive");
    }
    if offset < 0 {
        anyhow::bail!("--offset must not be negative");
    }

    let pool = db::connect(config).await?;
    let store = SqliteDetectionStore::new(pool.clone());
    let rows = store.history(limit, offset).await?;

    if rows.is_empty() {
        println!("No detections recorded.");
    } else {
        println!(
            "  {:>6}  {:<16}  {:>5}  {:>8}  {:<8}  {}",
            "ID", "WHEN", "LOCKS", "UNLOCKED", "STATUS", "HASH"
        );
        println!("  {}", "-".repeat(76));
        for row in &rows {
            println!("{}", history_line(row));
        }
    }

    pool.close().await;
    Ok(())
}

fn history_line(row: &StoredDetection) -> String {
    let r = &row.result;
    format!(
        "  {:>6}  {:<16}  {:>5}  {:>8}  {:<8}  {}",
        row.id,
        format_ts_relative(r.detection_time().timestamp()),
        r.total_locks(),
        r.unlocked_locks(),
        if r.is_safe() { "safe" } else { "UNSAFE" },
        &row.image_hash[..row.image_hash.len().min(12)]
    )
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
