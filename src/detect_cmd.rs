use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::classifier::LockStateClassifier;
use crate::config::Config;
use crate::db;
use crate::detector::create_detector;
use crate::intake;
use crate::migrate;
use crate::models::{DetectionResult, Provenance};
use crate::store::SqliteDetectionStore;

/// Classify one image file and store the result.
///
/// An image that is already stored is reported from its stored row.
pub async fn run_detect(
    config: &Config,
    path: &Path,
    user_id: Option<String>,
    dry_run: bool,
) -> Result<()> {
    if !config.detector.is_enabled() {
        bail!("Object detector is disabled. Set [detector] provider in config.");
    }

    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read image: {}", path.display()))?;

    let detector = create_detector(&config.detector)?;
    let classifier = LockStateClassifier::from_config(config, detector)?;

    if dry_run {
        let classified = classifier.classify_image(&bytes).await?;
        println!("detect (dry-run)");
        print_result(&classified.result);
        return Ok(());
    }

    let pool = db::connect(config).await?;
    migrate::apply_schema(&pool).await?;
    let store = SqliteDetectionStore::new(pool.clone());
    let provenance = Provenance {
        user_id,
        ..Provenance::default()
    };
    let admitted = intake::admit_image(&classifier, &store, &bytes, &provenance).await?;

    println!("detect");
    println!("  detection id: {}", admitted.stored.id);
    println!(
        "  stored: {}",
        if admitted.is_new { "new" } else { "duplicate" }
    );
    print_result(&admitted.stored.result);

    pool.close().await;
    Ok(())
}

fn print_result(result: &DetectionResult) {
    println!("  locks: {}", result.total_locks());
    println!("  locked: {}", result.locked_locks());
    println!("  unlocked: {}", result.unlocked_locks());
    println!("  confidence: {:.2}", result.confidence_score());
    println!("  status: {}", if result.is_safe() { "safe" } else { "UNSAFE" });
    for (index, detail) in result.unlocked_details() {
        println!(
            "    {}. {} ({:.2})",
            index, detail.lock_type, detail.confidence
        );
    }
}
