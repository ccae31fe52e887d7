// THEORY:
// The `SegmentationModule` is the single fan-in point of the pipeline. Where
// feature generators each see only the region of interest, the module sees
// everything at once: the region, the optional initial segmentation used as a
// seed, and the full ordered list of features. There is no meaningful partial
// segmentation, so the module is only ever called with a complete feature set.
//
// The module owns its algorithm and its own requirements. If it needs at least
// two features, or refuses an empty region, it says so by returning an error;
// the pipeline does not second-guess it.

use crate::core_modules::modified_time::ModifiedTime;
use crate::core_modules::spatial_region::SharedRegion;
use crate::error::CollaboratorError;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Everything the module receives for one update cycle.
#[derive(Debug)]
pub struct SegmentationInputs<R> {
    pub region_of_interest: Option<SharedRegion<R>>,
    pub initial_segmentation: Option<SharedRegion<R>>,
    /// One entry per registered generator, in registration order.
    pub features: Vec<SharedRegion<R>>,
}

impl<R> SegmentationInputs<R> {
    pub fn feature_count(&self) -> usize {
        self.features.len()
    }
}

impl<R> Clone for SegmentationInputs<R> {
    fn clone(&self) -> Self {
        Self {
            region_of_interest: self.region_of_interest.clone(),
            initial_segmentation: self.initial_segmentation.clone(),
            features: self.features.clone(),
        }
    }
}

/// The algorithm that turns features into the final segmentation.
#[async_trait]
pub trait SegmentationModule<R>: Send + Sync
where
    R: Send + Sync + 'static,
{
    /// Human readable name used in logs and errors.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// When the module's own settings last changed. A module whose settings
    /// never change can keep the default.
    fn modified_time(&self) -> ModifiedTime {
        ModifiedTime::ORIGIN
    }

    /// Runs the algorithm over one complete set of inputs.
    async fn segment(
        &self,
        inputs: &SegmentationInputs<R>,
    ) -> Result<SharedRegion<R>, CollaboratorError>;
}

pub type SharedSegmentationModule<R> = Arc<dyn SegmentationModule<R>>;

/// Wraps a closure as a [`SegmentationModule`].
pub struct FnSegmentationModule<F> {
    name: String,
    minimum_features: usize,
    segment: F,
    invocations: AtomicUsize,
}

impl<F> FnSegmentationModule<F> {
    pub fn new<R>(name: impl Into<String>, segment: F) -> Self
    where
        F: Fn(&SegmentationInputs<R>) -> Result<R, CollaboratorError>,
    {
        Self {
            name: name.into(),
            minimum_features: 0,
            segment,
            invocations: AtomicUsize::new(0),
        }
    }

    /// Refuse to run with fewer than `count` features.
    pub fn with_minimum_features(mut self, count: usize) -> Self {
        self.minimum_features = count;
        self
    }

    /// How many times `segment` has been called, including failed calls.
    pub fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<R, F> SegmentationModule<R> for FnSegmentationModule<F>
where
    R: Send + Sync + 'static,
    F: Fn(&SegmentationInputs<R>) -> Result<R, CollaboratorError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn segment(
        &self,
        inputs: &SegmentationInputs<R>,
    ) -> Result<SharedRegion<R>, CollaboratorError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if inputs.feature_count() < self.minimum_features {
            return Err(CollaboratorError::new(format!(
                "expected at least {} features, got {}",
                self.minimum_features,
                inputs.feature_count()
            )));
        }
        (self.segment)(inputs).map(Arc::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(features: &[&str]) -> SegmentationInputs<String> {
        SegmentationInputs {
            region_of_interest: Some(Arc::new("roi".to_string())),
            initial_segmentation: None,
            features: features.iter().map(|f| Arc::new(f.to_string())).collect(),
        }
    }

    #[tokio::test]
    async fn closure_module_sees_features_in_order() {
        let module = FnSegmentationModule::new("join", |inputs: &SegmentationInputs<String>| {
            Ok(inputs
                .features
                .iter()
                .map(|f| f.as_str())
                .collect::<Vec<_>>()
                .join(","))
        });

        let output = module.segment(&inputs(&["A", "B", "C"])).await.unwrap();
        assert_eq!(output.as_str(), "A,B,C");
        assert_eq!(module.invocation_count(), 1);
    }

    #[tokio::test]
    async fn minimum_feature_count_is_enforced() {
        let module = FnSegmentationModule::new("needs-two", |_: &SegmentationInputs<String>| {
            Ok(String::new())
        })
        .with_minimum_features(2);

        let err = module.segment(&inputs(&["A"])).await.unwrap_err();
        assert_eq!(err.message(), "expected at least 2 features, got 1");
        assert_eq!(module.invocation_count(), 1);
    }
}
