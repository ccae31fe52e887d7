// Example runner for the `lesion_segmentation` library.
//
// Usage: lesion_segmentation [input.png] [output.png]
//
// Loads a greyscale image (or synthesizes a gradient with a bright disc when no
// input is given), restricts work to a centred region of interest, derives two
// threshold features and intersects them into a segmentation mask.

use anyhow::{Context, Result};
use lesion_segmentation::{
    CollaboratorError, FnFeatureGenerator, FnSegmentationModule, Point, RasterError, RasterRegion,
    SegmentationInputs, SegmentationPipeline,
};
use std::env;
use std::sync::Arc;
use tracing::info;

const BRIGHT_THRESHOLD: u8 = 160;
const MID_THRESHOLD: u8 = 96;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // --- 1. Argument Parsing & Input ---
    let args: Vec<String> = env::args().collect();
    let image = match args.get(1) {
        Some(path) => RasterRegion::load_png(path, "image")
            .with_context(|| format!("failed to load input image '{}'", path))?,
        None => synthetic_image(128, 128)?,
    };
    let output_path = args.get(2).cloned().unwrap_or_else(|| "segmentation.png".to_string());
    let image = Arc::new(image);

    // --- 2. Pipeline Configuration ---
    let mut pipeline = SegmentationPipeline::new();
    pipeline.set_region_of_interest(Some(Arc::new(centred_roi(&image))));

    pipeline.add_feature_generator(Arc::new(FnFeatureGenerator::new(
        "bright-band",
        threshold_feature(Arc::clone(&image), BRIGHT_THRESHOLD),
    )));
    pipeline.add_feature_generator(Arc::new(FnFeatureGenerator::new(
        "mid-band",
        threshold_feature(Arc::clone(&image), MID_THRESHOLD),
    )));
    pipeline.set_segmentation_module(Arc::new(FnSegmentationModule::new(
        "intersection",
        intersect_features,
    )));

    info!("\n{}", pipeline);

    // --- 3. Update & Output ---
    let segmentation = pipeline.generate_data().await?;
    match segmentation.bounding_box() {
        Some(bbox) => info!(
            pixels = segmentation.foreground_count(),
            "segmented {}x{} at ({}, {})",
            bbox.width(),
            bbox.height(),
            bbox.min.x,
            bbox.min.y
        ),
        None => info!("segmentation is empty"),
    }
    segmentation
        .save_png(&output_path)
        .with_context(|| format!("failed to write '{}'", output_path))?;
    info!("wrote {}", output_path);
    Ok(())
}

/// Horizontal gradient with a bright disc in the middle.
fn synthetic_image(width: u32, height: u32) -> Result<RasterRegion, RasterError> {
    let (cx, cy) = (width as f64 / 2.0, height as f64 / 2.0);
    let radius = width.min(height) as f64 / 6.0;
    let mut buffer = Vec::with_capacity(width as usize * height as usize);
    for y in 0..height {
        for x in 0..width {
            let distance = ((x as f64 - cx).powi(2) + (y as f64 - cy).powi(2)).sqrt();
            let value = if distance <= radius {
                220
            } else {
                (u64::from(x) * 120 / u64::from(width.max(1))) as u8
            };
            buffer.push(value);
        }
    }
    RasterRegion::from_mask("image", Point { x: 0, y: 0 }, width, height, buffer)
}

/// The middle half of the image in each direction.
fn centred_roi(image: &RasterRegion) -> RasterRegion {
    let origin = Point {
        x: image.origin.x + (image.width() / 4) as i64,
        y: image.origin.y + (image.height() / 4) as i64,
    };
    RasterRegion::filled("roi", origin, image.width() / 2, image.height() / 2)
}

fn threshold_feature(
    image: Arc<RasterRegion>,
    threshold: u8,
) -> impl Fn(Option<&RasterRegion>) -> Result<RasterRegion, CollaboratorError> + Send + Sync {
    move |roi: Option<&RasterRegion>| {
        let mut mask = image.mask().clone();
        for (x, y, pixel) in mask.enumerate_pixels_mut() {
            let world_x = image.origin.x + x as i64;
            let world_y = image.origin.y + y as i64;
            let inside = roi.is_none_or(|roi| roi.contains(world_x, world_y));
            pixel.0[0] = if inside && pixel.0[0] >= threshold { 255 } else { 0 };
        }
        Ok(RasterRegion::new(format!("threshold>={}", threshold), image.origin, mask))
    }
}

fn intersect_features(inputs: &SegmentationInputs<RasterRegion>) -> Result<RasterRegion, CollaboratorError> {
    let Some(first) = inputs.features.first() else {
        return Err(CollaboratorError::new("intersection needs at least one feature"));
    };
    let mut mask = first.mask().clone();
    for (x, y, pixel) in mask.enumerate_pixels_mut() {
        let world_x = first.origin.x + x as i64;
        let world_y = first.origin.y + y as i64;
        let inside = inputs.features[1..]
            .iter()
            .all(|feature| feature.contains(world_x, world_y));
        if !inside {
            pixel.0[0] = 0;
        }
    }
    Ok(RasterRegion::new("segmentation", first.origin, mask))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_image_has_requested_size_and_a_bright_disc() {
        let image = synthetic_image(64, 32).unwrap();
        assert_eq!((image.width(), image.height()), (64, 32));
        assert_eq!(image.mask().get_pixel(32, 16).0[0], 220);
        assert!(image.mask().get_pixel(0, 0).0[0] < MID_THRESHOLD);
    }

    #[test]
    fn intersection_keeps_only_shared_pixels() {
        let left = RasterRegion::filled("left", Point { x: 0, y: 0 }, 4, 2);
        let right = RasterRegion::filled("right", Point { x: 2, y: 0 }, 4, 2);
        let inputs = SegmentationInputs {
            region_of_interest: None,
            initial_segmentation: None,
            features: vec![Arc::new(left), Arc::new(right)],
        };

        let segmentation = intersect_features(&inputs).unwrap();
        assert_eq!(segmentation.foreground_count(), 4);
        assert!(segmentation.contains(2, 1));
        assert!(!segmentation.contains(1, 0));
    }

    #[test]
    fn intersection_without_features_is_an_error() {
        let inputs = SegmentationInputs::<RasterRegion> {
            region_of_interest: None,
            initial_segmentation: None,
            features: Vec::new(),
        };
        assert!(intersect_features(&inputs).is_err());
    }
}
