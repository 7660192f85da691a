//! Annotated preview images.
//!
//! Draws each detected lock's box (green when locked, red when unlocked),
//! scales the result to fit chat clients, and encodes it as base64 JPEG.
//! [`spawn_preview`] does all of it on the blocking pool.

use anyhow::{Context, Result};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};

use crate::models::DetectionResult;

const LOCKED_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const UNLOCKED_COLOR: Rgb<u8> = Rgb([220, 0, 0]);
const STROKE: u32 = 3;
pub const MAX_EDGE: u32 = 800;
const JPEG_QUALITY: u8 = 85;

/// Draw every lock box onto a copy of `image`.
pub fn annotate(image: &DynamicImage, result: &DetectionResult) -> RgbImage {
    let mut canvas = image.to_rgb8();
    let (w, h) = canvas.dimensions();
    for detail in result.lock_details() {
        let color = if detail.is_locked {
            LOCKED_COLOR
        } else {
            UNLOCKED_COLOR
        };
        if let Some((x, y, bw, bh)) = detail.bbox.clamp_to(w, h) {
            draw_box(&mut canvas, x, y, bw, bh, color);
        }
    }
    canvas
}

fn draw_box(canvas: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: Rgb<u8>) {
    let stroke = STROKE.min(w).min(h);
    for dy in 0..h {
        for dx in 0..w {
            let on_edge = dx < stroke || dy < stroke || dx >= w - stroke || dy >= h - stroke;
            if on_edge {
                canvas.put_pixel(x + dx, y + dy, color);
            }
        }
    }
}

/// Shrink so the longest edge is at most `max_edge`; smaller images pass through.
pub fn fit_within(image: RgbImage, max_edge: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    if w.max(h) <= max_edge {
        return image;
    }
    DynamicImage::ImageRgb8(image)
        .resize(max_edge, max_edge, FilterType::Lanczos3)
        .to_rgb8()
}

pub fn encode_jpeg_base64(image: &RgbImage) -> Result<String> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY)
        .encode_image(image)
        .context("Failed to encode preview JPEG")?;
    Ok(base64::engine::general_purpose::STANDARD.encode(buf))
}

/// Annotate, downscale and encode in one step.
pub fn preview_base64(image: &DynamicImage, result: &DetectionResult) -> Result<String> {
    encode_jpeg_base64(&fit_within(annotate(image, result), MAX_EDGE))
}

/// Pixels to draw a preview from.
pub enum PreviewSource {
    Decoded(DynamicImage),
    /// Raw bytes of an image that was never decoded (a stored duplicate).
    Encoded(Vec<u8>),
}

/// Render a preview off the async runtime. Failures are logged and yield `None`.
pub async fn spawn_preview(source: PreviewSource, result: DetectionResult) -> Option<String> {
    let rendered = tokio::task::spawn_blocking(move || -> Result<String> {
        let image = match source {
            PreviewSource::Decoded(image) => image,
            PreviewSource::Encoded(bytes) => {
                image::load_from_memory(&bytes).context("Failed to decode image for preview")?
            }
        };
        preview_base64(&image, &result)
    })
    .await;
    match rendered {
        Ok(Ok(b64)) => Some(b64),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "preview rendering failed");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "preview task failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BoundingBox, ConfidencePolicy};

    #[test]
    fn test_boxes_are_colored_by_verdict() {
        let img = DynamicImage::new_rgb8(40, 40);
        let mut r = DetectionResult::new(ConfidencePolicy::Min);
        r.add_lock("locked_lock", true, 0.9, BoundingBox::new(0, 0, 10, 10).unwrap());
        r.add_lock("unlocked_lock", false, 0.9, BoundingBox::new(20, 20, 30, 30).unwrap());
        let out = annotate(&img, &r);
        assert_eq!(*out.get_pixel(0, 0), LOCKED_COLOR);
        assert_eq!(*out.get_pixel(20, 20), UNLOCKED_COLOR);
        // interior untouched
        assert_eq!(*out.get_pixel(25, 25), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_box_partly_outside_is_clamped() {
        let img = DynamicImage::new_rgb8(20, 20);
        let mut r = DetectionResult::new(ConfidencePolicy::Min);
        r.add_lock("lock", false, 0.5, BoundingBox::new(-5, -5, 50, 50).unwrap());
        let out = annotate(&img, &r);
        assert_eq!(*out.get_pixel(19, 19), UNLOCKED_COLOR);
    }

    #[test]
    fn test_fit_within_scales_longest_edge() {
        let big = RgbImage::new(1600, 400);
        let out = fit_within(big, MAX_EDGE);
        assert_eq!(out.dimensions(), (800, 200));
        let small = RgbImage::new(100, 50);
        assert_eq!(fit_within(small, MAX_EDGE).dimensions(), (100, 50));
    }

    #[test]
    fn test_preview_decodes_as_jpeg() {
        let img = DynamicImage::new_rgb8(16, 16);
        let r = DetectionResult::new(ConfidencePolicy::Min);
        let b64 = preview_base64(&img, &r).unwrap();
        let bytes = base64::engine::general_purpose::STANDARD.decode(b64).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 16));
    }

    #[tokio::test]
    async fn test_spawn_preview_from_encoded_bytes() {
        let mut png = Vec::new();
        DynamicImage::new_rgb8(12, 12)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let r = DetectionResult::new(ConfidencePolicy::Min);
        assert!(spawn_preview(PreviewSource::Encoded(png), r.clone())
            .await
            .is_some());
        assert!(spawn_preview(PreviewSource::Encoded(b"junk".to_vec()), r)
            .await
            .is_none());
    }
}
