//! Error types for the segmentation pipeline.
//!
//! Collaborators (feature generators, segmentation modules) report failures as
//! [`CollaboratorError`]. The pipeline wraps those into [`PipelineError`] so the
//! caller of `generate_data` can tell which stage failed.

use std::error::Error as StdError;
use thiserror::Error;

/// Boxed error carried inside collaborator failures.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Specialized Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Problems with how the pipeline was configured. Always detected before any
/// collaborator is invoked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// `generate_data` was called with no segmentation module set
    #[error("no segmentation module has been set")]
    MissingSegmentationModule,

    /// An absent feature generator was offered for registration
    #[error("cannot register an absent feature generator")]
    MissingFeatureGenerator,
}

/// Pipeline error type
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// A feature generator failed to produce its output
    #[error("feature generator #{index} ({generator}) failed: {source}")]
    UpstreamFailure {
        /// Registration slot of the failing generator
        index: usize,
        /// Name reported by the generator
        generator: String,
        source: CollaboratorError,
    },

    /// The segmentation module rejected its inputs or failed to run
    #[error("segmentation module ({module}) failed: {source}")]
    SegmentationFailure {
        module: String,
        source: CollaboratorError,
    },
}

impl PipelineError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    pub fn is_upstream_failure(&self) -> bool {
        matches!(self, Self::UpstreamFailure { .. })
    }

    pub fn is_segmentation_failure(&self) -> bool {
        matches!(self, Self::SegmentationFailure { .. })
    }
}

/// Failure reported by a feature generator or segmentation module.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CollaboratorError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl CollaboratorError {
    /// Create an error from a plain message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create an error that keeps the underlying cause
    pub fn with_source(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Raster I/O error type
#[derive(Debug, Error)]
pub enum RasterError {
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// Mask dimensions do not match the pixel buffer
    #[error("mask buffer of {len} bytes does not fit {width}x{height}")]
    BufferSize { width: u32, height: u32, len: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_failure_names_slot_and_generator() {
        let err = PipelineError::UpstreamFailure {
            index: 2,
            generator: "sigmoid".to_string(),
            source: CollaboratorError::new("empty region"),
        };
        assert_eq!(
            err.to_string(),
            "feature generator #2 (sigmoid) failed: empty region"
        );
        assert!(err.is_upstream_failure());
        assert!(!err.is_configuration());
    }

    #[test]
    fn configuration_error_converts_into_pipeline_error() {
        let err: PipelineError = ConfigurationError::MissingSegmentationModule.into();
        assert!(err.is_configuration());
        assert_eq!(
            err.to_string(),
            "configuration error: no segmentation module has been set"
        );
    }

    #[test]
    fn collaborator_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = CollaboratorError::with_source("could not read volume", io);
        assert_eq!(err.message(), "could not read volume");
        assert_eq!(err.source().map(|s| s.to_string()), Some("disk gone".to_string()));
    }
}
