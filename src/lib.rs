// THEORY:
// This file is the main entry point for the `lesion_segmentation` library crate.
// It exports the `SegmentationPipeline` and the contracts its collaborators
// implement (`FeatureGenerator`, `SegmentationModule`) as the public API.
//
// The pipeline is a coordinator, not an algorithm. Concrete feature extractors
// and segmentation algorithms live outside this crate and plug in through the
// traits in `core_modules`. `RasterRegion` is provided as one ready-made region
// representation for 2D masks; any `Send + Sync + 'static` type works.

pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;

pub use core_modules::feature_generator::{FeatureGenerator, FnFeatureGenerator, SharedFeatureGenerator};
pub use core_modules::modified_time::ModifiedTime;
pub use core_modules::raster_region::{BoundingBox, Point, RasterRegion};
pub use core_modules::segmentation_module::{
    FnSegmentationModule, SegmentationInputs, SegmentationModule, SharedSegmentationModule,
};
pub use core_modules::spatial_region::{DecoratedOutput, SharedRegion, same_region};
pub use error::{CollaboratorError, ConfigurationError, PipelineError, PipelineResult, RasterError};
pub use parallel_pipeline::{FanOutMode, FeatureFanOut};
pub use pipeline::{PipelineConfig, PipelineState, SegmentationPipeline};
