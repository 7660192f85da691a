//! Fingerprint-first admission of one image.
//!
//! Every path that turns image bytes into a stored detection (webhook
//! callbacks, API uploads, `lockwatch detect`) goes through here:
//!
//! 1. fingerprint the bytes
//! 2. look the fingerprint up in the store; a hit is answered from the stored
//!    row without decoding or running the detector
//! 3. on a miss, classify and then [`admit`](DetectionStore::admit)
//!
//! `admit` stays the arbiter when two first submissions of the same bytes
//! race past the lookup: exactly one of them observes `is_new`.

use image::DynamicImage;

use crate::classifier::{fingerprint, ClassifiedImage, LockStateClassifier};
use crate::error::PipelineResult;
use crate::models::{DetectionResult, Provenance, StoredDetection};
use crate::store::DetectionStore;

/// An image whose verdict is known but not yet persisted.
pub enum Prepared {
    /// Fingerprint already stored.
    Known(StoredDetection),
    /// Classified by this call.
    Fresh(ClassifiedImage),
}

/// A persisted detection plus the decoded image when this call decoded it.
pub struct Admitted {
    pub stored: StoredDetection,
    pub is_new: bool,
    pub image: Option<DynamicImage>,
}

/// Resolve the verdict for `bytes`, classifying only on a store miss.
pub async fn prepare(
    classifier: &LockStateClassifier,
    store: &dyn DetectionStore,
    bytes: &[u8],
) -> PipelineResult<Prepared> {
    let hash = fingerprint(bytes);
    if let Some(stored) = store.find_by_hash(&hash).await? {
        tracing::info!(id = stored.id, "image already stored, skipping classification");
        return Ok(Prepared::Known(stored));
    }
    Ok(Prepared::Fresh(classifier.classify_image(bytes).await?))
}

impl Prepared {
    pub fn fingerprint(&self) -> &str {
        match self {
            Prepared::Known(stored) => &stored.image_hash,
            Prepared::Fresh(classified) => &classified.fingerprint,
        }
    }

    pub fn result(&self) -> &DetectionResult {
        match self {
            Prepared::Known(stored) => &stored.result,
            Prepared::Fresh(classified) => &classified.result,
        }
    }

    /// Persist a fresh verdict. A known row is returned as-is.
    pub async fn commit(
        self,
        store: &dyn DetectionStore,
        provenance: &Provenance,
    ) -> PipelineResult<Admitted> {
        match self {
            Prepared::Known(stored) => Ok(Admitted {
                stored,
                is_new: false,
                image: None,
            }),
            Prepared::Fresh(classified) => {
                let admission = store
                    .admit(&classified.fingerprint, &classified.result, provenance)
                    .await?;
                Ok(Admitted {
                    stored: admission.stored,
                    is_new: admission.is_new,
                    image: Some(classified.image),
                })
            }
        }
    }
}

/// [`prepare`] then [`commit`](Prepared::commit).
pub async fn admit_image(
    classifier: &LockStateClassifier,
    store: &dyn DetectionStore,
    bytes: &[u8],
    provenance: &Provenance,
) -> PipelineResult<Admitted> {
    prepare(classifier, store, bytes)
        .await?
        .commit(store, provenance)
        .await
}
