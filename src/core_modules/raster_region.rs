// THEORY:
// `RasterRegion` is a concrete spatial region for 2D work: a greyscale mask
// placed at an integer origin in a shared index space. Any nonzero pixel is
// "inside". It is a "dumb" data container like the pixel and chunk types it
// grew out of: it can describe itself (extent, area, bounding box) and move
// to and from PNG, but it knows nothing about how it was produced.
//
// The origin lets a feature computed over a small region of interest line up
// with a full-size initial segmentation without resampling.

use crate::error::RasterError;
use image::{ExtendedColorType, GrayImage, ImageEncoder, Luma};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// A coordinate in the shared index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

/// Inclusive rectangle in the shared index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub min: Point,
    pub max: Point,
}

impl BoundingBox {
    pub fn width(&self) -> u64 {
        (self.max.x - self.min.x + 1) as u64
    }

    pub fn height(&self) -> u64 {
        (self.max.y - self.min.y + 1) as u64
    }
}

/// A labelled greyscale mask positioned in the shared index space.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterRegion {
    /// Free-form description, e.g. "roi" or "sigmoid-feature".
    pub label: String,
    /// World coordinate of the mask's top-left pixel.
    pub origin: Point,
    mask: GrayImage,
}

impl RasterRegion {
    pub fn new(label: impl Into<String>, origin: Point, mask: GrayImage) -> Self {
        Self {
            label: label.into(),
            origin,
            mask,
        }
    }

    /// Builds a region from a row-major luma buffer.
    pub fn from_mask(
        label: impl Into<String>,
        origin: Point,
        width: u32,
        height: u32,
        buffer: Vec<u8>,
    ) -> Result<Self, RasterError> {
        let len = buffer.len();
        let mask = GrayImage::from_raw(width, height, buffer)
            .ok_or(RasterError::BufferSize { width, height, len })?;
        Ok(Self::new(label, origin, mask))
    }

    /// A solid rectangle, every pixel inside.
    pub fn filled(label: impl Into<String>, origin: Point, width: u32, height: u32) -> Self {
        Self::new(label, origin, GrayImage::from_pixel(width, height, Luma([255u8])))
    }

    pub fn width(&self) -> u32 {
        self.mask.width()
    }

    pub fn height(&self) -> u32 {
        self.mask.height()
    }

    pub fn mask(&self) -> &GrayImage {
        &self.mask
    }

    /// True if the world coordinate falls on a nonzero pixel.
    pub fn contains(&self, x: i64, y: i64) -> bool {
        let local_x = x - self.origin.x;
        let local_y = y - self.origin.y;
        if local_x < 0 || local_y < 0 {
            return false;
        }
        let (local_x, local_y) = (local_x as u64, local_y as u64);
        if local_x >= self.width() as u64 || local_y >= self.height() as u64 {
            return false;
        }
        self.mask.get_pixel(local_x as u32, local_y as u32).0[0] > 0
    }

    /// Number of nonzero pixels.
    pub fn foreground_count(&self) -> usize {
        self.mask.pixels().filter(|p| p.0[0] > 0).count()
    }

    /// Tightest box around the nonzero pixels, in world coordinates.
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        let mut min_x = u32::MAX;
        let mut min_y = u32::MAX;
        let mut max_x = 0;
        let mut max_y = 0;
        let mut found = false;

        for (x, y, pixel) in self.mask.enumerate_pixels() {
            if pixel.0[0] == 0 {
                continue;
            }
            found = true;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }

        found.then(|| BoundingBox {
            min: Point {
                x: self.origin.x + min_x as i64,
                y: self.origin.y + min_y as i64,
            },
            max: Point {
                x: self.origin.x + max_x as i64,
                y: self.origin.y + max_y as i64,
            },
        })
    }

    /// Loads any image format `image` understands and keeps its luma channel.
    pub fn load_png(path: impl AsRef<Path>, label: impl Into<String>) -> Result<Self, RasterError> {
        let mask = image::open(path)?.to_luma8();
        Ok(Self::new(label, Point { x: 0, y: 0 }, mask))
    }

    /// Writes the mask as an 8-bit greyscale PNG. The origin is not stored.
    pub fn save_png(&self, path: impl AsRef<Path>) -> Result<(), RasterError> {
        let output = BufWriter::new(File::create(path).map_err(image::ImageError::IoError)?);
        let encoder = image::codecs::png::PngEncoder::new(output);

        encoder.write_image(
            self.mask.as_raw(),
            self.width(),
            self.height(),
            ExtendedColorType::L8,
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(x: i64, y: i64) -> Point {
        Point { x, y }
    }

    #[test]
    fn contains_uses_world_coordinates() {
        let region = RasterRegion::filled("roi", origin(10, 20), 4, 3);
        assert!(region.contains(10, 20));
        assert!(region.contains(13, 22));
        assert!(!region.contains(14, 22));
        assert!(!region.contains(9, 20));
        assert!(!region.contains(10, 23));
    }

    #[test]
    fn bounding_box_covers_foreground_only() {
        let mut buffer = vec![0u8; 5 * 5];
        buffer[5 + 1] = 255; // (1, 1)
        buffer[3 * 5 + 2] = 40; // (2, 3)
        let region = RasterRegion::from_mask("blob", origin(-2, 0), 5, 5, buffer).unwrap();

        assert_eq!(region.foreground_count(), 2);
        let bbox = region.bounding_box().unwrap();
        assert_eq!(bbox.min, origin(-1, 1));
        assert_eq!(bbox.max, origin(0, 3));
        assert_eq!((bbox.width(), bbox.height()), (2, 3));
    }

    #[test]
    fn empty_mask_has_no_bounding_box() {
        let region = RasterRegion::from_mask("empty", origin(0, 0), 3, 3, vec![0; 9]).unwrap();
        assert_eq!(region.bounding_box(), None);
        assert_eq!(region.foreground_count(), 0);
    }

    #[test]
    fn mismatched_buffer_is_rejected() {
        let err = RasterRegion::from_mask("bad", origin(0, 0), 4, 4, vec![0; 10]).unwrap_err();
        assert!(matches!(
            err,
            RasterError::BufferSize { width: 4, height: 4, len: 10 }
        ));
    }

    #[test]
    fn png_round_trip_keeps_mask() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.png");

        let mut buffer = vec![0u8; 8 * 6];
        for x in 2..5 {
            buffer[2 * 8 + x] = 255;
        }
        let region = RasterRegion::from_mask("seed", origin(0, 0), 8, 6, buffer).unwrap();
        region.save_png(&path).unwrap();

        let loaded = RasterRegion::load_png(&path, "seed").unwrap();
        assert_eq!(loaded, region);
    }
}
