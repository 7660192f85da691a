//! Image-feature fallback for ambiguous detector labels.
//!
//! When the detector reports a lock without saying whether it is locked,
//! the classifier crops the bounding box and asks a [`RegionAnalyzer`].
//! [`BoundingBoxFeatureAnalyzer`] applies two heuristics in order and the
//! first confident one wins:
//!
//! 1. **Brightness variance**: a smooth crop (low intensity stddev) reads as
//!    a closed shackle, a strongly textured crop as an open one.
//! 2. **Edge density**: many strong gradients in the shackle band (the top
//!    of the crop) suggest a visible gap, i.e. unlocked.
//!
//! With no confident signal the region is reported as locked.
//!
//! Work is proportional to the crop area; nothing here touches I/O.

use image::{DynamicImage, GrayImage};

use crate::config::AnalyzerConfig;
use crate::models::BoundingBox;

/// Decides whether a cropped grayscale region looks locked.
pub trait RegionAnalyzer: Send + Sync {
    fn appears_locked(&self, crop: &GrayImage) -> bool;
}

/// Which heuristic produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeatureSignal {
    Smooth { stddev: f64 },
    Textured { stddev: f64 },
    EdgeDense { density: f64 },
    NoSignal,
}

impl FeatureSignal {
    pub fn is_locked(&self) -> bool {
        matches!(self, FeatureSignal::Smooth { .. } | FeatureSignal::NoSignal)
    }
}

#[derive(Debug, Clone)]
pub struct BoundingBoxFeatureAnalyzer {
    config: AnalyzerConfig,
}

impl BoundingBoxFeatureAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    /// Run the heuristics and report which one decided.
    pub fn analyze(&self, crop: &GrayImage) -> FeatureSignal {
        let (w, h) = crop.dimensions();
        if w < 3 || h < 3 {
            return FeatureSignal::NoSignal;
        }

        let stddev = intensity_stddev(crop);
        if stddev <= self.config.smooth_stddev {
            return FeatureSignal::Smooth { stddev };
        }
        if stddev >= self.config.textured_stddev {
            return FeatureSignal::Textured { stddev };
        }

        let band = ((h as f64 * self.config.shackle_fraction).ceil() as u32).clamp(3, h);
        let density = edge_density(crop, band, self.config.edge_magnitude);
        if density > self.config.edge_density {
            return FeatureSignal::EdgeDense { density };
        }

        FeatureSignal::NoSignal
    }
}

impl RegionAnalyzer for BoundingBoxFeatureAnalyzer {
    fn appears_locked(&self, crop: &GrayImage) -> bool {
        let signal = self.analyze(crop);
        tracing::debug!(?signal, "feature analysis");
        signal.is_locked()
    }
}

/// Crop `bbox` out of `image` as grayscale, clamped to the image bounds.
pub fn crop_region(image: &DynamicImage, bbox: &BoundingBox) -> Option<GrayImage> {
    let (x, y, w, h) = bbox.clamp_to(image.width(), image.height())?;
    Some(image.crop_imm(x, y, w, h).to_luma8())
}

fn intensity_stddev(img: &GrayImage) -> f64 {
    let n = (img.width() as f64) * (img.height() as f64);
    let (sum, sum_sq) = img.pixels().fold((0.0f64, 0.0f64), |(s, sq), p| {
        let v = p.0[0] as f64;
        (s + v, sq + v * v)
    });
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0).sqrt()
}

/// Fraction of interior pixels in the top `band` rows whose central-difference
/// gradient magnitude exceeds `threshold`.
fn edge_density(img: &GrayImage, band: u32, threshold: f64) -> f64 {
    let w = img.width();
    let mut strong = 0u64;
    let mut total = 0u64;
    for y in 1..band - 1 {
        for x in 1..w - 1 {
            let px = |xx: u32, yy: u32| img.get_pixel(xx, yy).0[0] as f64;
            let gx = px(x + 1, y) - px(x - 1, y);
            let gy = px(x, y + 1) - px(x, y - 1);
            if (gx * gx + gy * gy).sqrt() > threshold {
                strong += 1;
            }
            total += 1;
        }
    }
    if total == 0 {
        0.0
    } else {
        strong as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn analyzer() -> BoundingBoxFeatureAnalyzer {
        BoundingBoxFeatureAnalyzer::new(AnalyzerConfig::default())
    }

    #[test]
    fn test_flat_crop_is_locked() {
        let img = GrayImage::from_pixel(20, 20, Luma([128]));
        let signal = analyzer().analyze(&img);
        assert!(matches!(signal, FeatureSignal::Smooth { .. }));
        assert!(analyzer().appears_locked(&img));
    }

    #[test]
    fn test_checkerboard_is_unlocked() {
        let img = GrayImage::from_fn(20, 20, |x, y| {
            if (x + y) % 2 == 0 {
                Luma([0])
            } else {
                Luma([255])
            }
        });
        let signal = analyzer().analyze(&img);
        assert!(matches!(signal, FeatureSignal::Textured { .. }));
        assert!(!analyzer().appears_locked(&img));
    }

    #[test]
    fn test_edges_in_shackle_band_are_unlocked() {
        // Mid-range stddev with vertical stripes concentrated in the top rows.
        let img = GrayImage::from_fn(20, 20, |x, y| {
            if y < 8 {
                if (x / 2) % 2 == 0 {
                    Luma([90])
                } else {
                    Luma([170])
                }
            } else {
                Luma([130])
            }
        });
        let signal = analyzer().analyze(&img);
        assert!(
            matches!(signal, FeatureSignal::EdgeDense { .. }),
            "got {:?}",
            signal
        );
    }

    #[test]
    fn test_mid_variance_without_edges_defaults_locked() {
        // Smooth horizontal gradient: moderate stddev, weak local edges.
        let img = GrayImage::from_fn(40, 40, |x, _| Luma([(60 + x * 3) as u8]));
        let signal = analyzer().analyze(&img);
        assert_eq!(signal, FeatureSignal::NoSignal);
        assert!(analyzer().appears_locked(&img));
    }

    #[test]
    fn test_tiny_crop_defaults_locked() {
        let img = GrayImage::from_pixel(2, 2, Luma([0]));
        assert_eq!(analyzer().analyze(&img), FeatureSignal::NoSignal);
    }

    #[test]
    fn test_crop_region_clamps() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(10, 10, Luma([7])));
        let bbox = BoundingBox::new(5, 5, 50, 50).unwrap();
        let crop = crop_region(&img, &bbox).unwrap();
        assert_eq!(crop.dimensions(), (5, 5));
        let outside = BoundingBox::new(20, 20, 30, 30).unwrap();
        assert!(crop_region(&img, &outside).is_none());
    }
}
