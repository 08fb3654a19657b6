//! Frame decode, person crops and crop encoding.

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView, ImageResult};
use sha2::{Digest, Sha256};

use crate::error::GeometryError;
use crate::region::BBox;

pub const DEFAULT_EXPAND_RATIO: f64 = 0.15;
pub const JPEG_QUALITY: u8 = 90;

pub fn decode(bytes: &[u8]) -> ImageResult<DynamicImage> {
    image::load_from_memory(bytes)
}

/// Clip `bbox` to a `width` x `height` frame. Fails when nothing is left.
pub fn clamp_crop(bbox: &BBox, width: u32, height: u32) -> Result<BBox, GeometryError> {
    let max_x = i32::try_from(width).unwrap_or(i32::MAX);
    let max_y = i32::try_from(height).unwrap_or(i32::MAX);
    let clipped = BBox {
        x1: bbox.x1.clamp(0, max_x),
        y1: bbox.y1.clamp(0, max_y),
        x2: bbox.x2.clamp(0, max_x),
        y2: bbox.y2.clamp(0, max_y),
    };
    if clipped.x1 >= clipped.x2 || clipped.y1 >= clipped.y2 {
        return Err(GeometryError::EmptyCrop {
            x1: bbox.x1,
            y1: bbox.y1,
            x2: bbox.x2,
            y2: bbox.y2,
            width,
            height,
        });
    }
    Ok(clipped)
}

/// Grow each side by `factor` of the box size (floored), clamped to the frame.
pub fn expanded_bbox(bbox: &BBox, width: u32, height: u32, factor: f64) -> BBox {
    let expand_w = (bbox.width() as f64 * factor).floor() as i64;
    let expand_h = (bbox.height() as f64 * factor).floor() as i64;
    let max_x = i64::from(width).min(i64::from(i32::MAX));
    let max_y = i64::from(height).min(i64::from(i32::MAX));
    // Extents are computed in i64; clamping brings them back into i32.
    let fit = |value: i64, max: i64| value.clamp(0, max) as i32;
    BBox {
        x1: fit(i64::from(bbox.x1) - expand_w, max_x),
        y1: fit(i64::from(bbox.y1) - expand_h, max_y),
        x2: fit(i64::from(bbox.x2) + expand_w, max_x),
        y2: fit(i64::from(bbox.y2) + expand_h, max_y),
    }
}

/// Tight crop of `bbox`, clamped to the frame.
pub fn crop(image: &DynamicImage, bbox: &BBox) -> Result<DynamicImage, GeometryError> {
    let (width, height) = image.dimensions();
    let area = clamp_crop(bbox, width, height)?;
    Ok(crop_area(image, &area))
}

/// Crop of `bbox` grown by `factor` on each side.
pub fn crop_expanded(
    image: &DynamicImage,
    bbox: &BBox,
    factor: f64,
) -> Result<DynamicImage, GeometryError> {
    let (width, height) = image.dimensions();
    let area = clamp_crop(&expanded_bbox(bbox, width, height, factor), width, height)?;
    Ok(crop_area(image, &area))
}

// `area` is already clamped and non-empty.
fn crop_area(image: &DynamicImage, area: &BBox) -> DynamicImage {
    image.crop_imm(
        area.x1 as u32,
        area.y1 as u32,
        area.width() as u32,
        area.height() as u32,
    )
}

pub fn encode_jpeg(image: &DynamicImage) -> ImageResult<Vec<u8>> {
    let rgb = image.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY).encode_image(&rgb)?;
    Ok(out)
}

/// Object key for a crop: `{camera}.{sha256 hex of the bytes}`. Identical
/// crops map to the same key.
pub fn content_key(camera: &str, bytes: &[u8]) -> String {
    format!("{}.{}", camera, hex::encode(Sha256::digest(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn frame(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([40, 90, 160])))
    }

    #[test]
    fn expansion_floors_and_clamps() {
        let bbox = BBox::new(10, 10, 50, 90).unwrap();
        // 40 * 0.15 = 6, 80 * 0.15 = 12
        assert_eq!(
            expanded_bbox(&bbox, 200, 200, 0.15),
            BBox::new(4, 0, 56, 102).unwrap()
        );
        assert_eq!(
            expanded_bbox(&bbox, 52, 95, 0.15),
            BBox::new(4, 0, 52, 95).unwrap()
        );
    }

    #[test]
    fn full_range_box_expands_to_the_frame() {
        let bbox = BBox::new(i32::MIN, i32::MIN, i32::MAX, i32::MAX).unwrap();
        assert_eq!(
            expanded_bbox(&bbox, 64, 48, DEFAULT_EXPAND_RATIO),
            BBox::new(0, 0, 64, 48).unwrap()
        );
        assert_eq!(crop_expanded(&frame(64, 48), &bbox, DEFAULT_EXPAND_RATIO).unwrap().dimensions(), (64, 48));
    }

    #[test]
    fn crop_clamps_to_frame() {
        let image = frame(100, 60);
        let bbox = BBox::new(80, 40, 140, 90).unwrap();
        let cropped = crop(&image, &bbox).unwrap();
        assert_eq!(cropped.dimensions(), (20, 20));
    }

    #[test]
    fn crop_outside_frame_is_empty() {
        let image = frame(100, 60);
        let bbox = BBox::new(120, 10, 140, 30).unwrap();
        assert!(matches!(
            crop(&image, &bbox),
            Err(GeometryError::EmptyCrop { width: 100, height: 60, .. })
        ));
    }

    #[test]
    fn jpeg_encoding_decodes_back() {
        let image = frame(32, 24);
        let jpeg = encode_jpeg(&image).unwrap();
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
        assert_eq!(decode(&jpeg).unwrap().dimensions(), (32, 24));
    }

    #[test]
    fn content_key_is_stable() {
        let a = content_key("front", b"crop");
        assert_eq!(a, content_key("front", b"crop"));
        assert!(a.starts_with("front."));
        assert_eq!(a.len(), "front.".len() + 64);
        assert_ne!(a, content_key("front", b"other"));
    }
}
