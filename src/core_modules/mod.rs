pub mod feature_generator;
pub mod modified_time;
pub mod raster_region;
pub mod segmentation_module;
pub mod spatial_region;
