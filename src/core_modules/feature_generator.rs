// THEORY:
// A `FeatureGenerator` turns the region of interest into one derived region, a
// "feature" (an edge map, a vesselness response, a thresholded intensity band).
// The pipeline treats it as a black box with a tiny contract:
//
// 1.  **Accept a region**: `set_region_of_interest` is called before every
//     update. The generator alone decides whether that invalidates its cache.
// 2.  **Report staleness**: `is_current` answers "would `update` change my
//     output?". The pipeline skips `update` when it returns true.
// 3.  **Produce one output**: after a successful `update`, `feature` returns
//     the current region until the inputs or the generator's own settings change.
//
// Generators are shared (`Arc`) and may be registered more than once, so every
// method takes `&self` and implementations keep their state behind a lock.

use crate::core_modules::modified_time::ModifiedTime;
use crate::core_modules::spatial_region::{SharedRegion, same_region};
use crate::error::CollaboratorError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A stage that derives one feature region from the region of interest.
#[async_trait]
pub trait FeatureGenerator<R>: Send + Sync
where
    R: Send + Sync + 'static,
{
    /// Human readable name used in logs and errors.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Hands the generator the region it must work inside.
    fn set_region_of_interest(&self, region: Option<SharedRegion<R>>);

    /// True if the last output is still valid for the current inputs.
    fn is_current(&self) -> bool;

    /// Recomputes the output. After `Ok(())`, `feature` must return `Some`.
    async fn update(&self) -> Result<(), CollaboratorError>;

    /// The most recent output, if any has been produced.
    fn feature(&self) -> Option<SharedRegion<R>>;

    /// When the generator's inputs or settings last changed.
    fn modified_time(&self) -> ModifiedTime {
        ModifiedTime::ORIGIN
    }
}

pub type SharedFeatureGenerator<R> = Arc<dyn FeatureGenerator<R>>;

struct GeneratorState<R> {
    region: Option<SharedRegion<R>>,
    output: Option<SharedRegion<R>>,
    modified: ModifiedTime,
    computed_at: ModifiedTime,
}

/// Wraps a closure as a caching [`FeatureGenerator`].
///
/// The closure runs only when the region handed in differs (by identity) from the
/// one used for the cached output, or after [`FnFeatureGenerator::touch`].
pub struct FnFeatureGenerator<R, F> {
    name: String,
    compute: F,
    state: Mutex<GeneratorState<R>>,
    compute_count: AtomicUsize,
}

impl<R, F> FnFeatureGenerator<R, F>
where
    R: Send + Sync + 'static,
    F: Fn(Option<&R>) -> Result<R, CollaboratorError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, compute: F) -> Self {
        Self {
            name: name.into(),
            compute,
            state: Mutex::new(GeneratorState {
                region: None,
                output: None,
                modified: ModifiedTime::now(),
                computed_at: ModifiedTime::ORIGIN,
            }),
            compute_count: AtomicUsize::new(0),
        }
    }

    /// Marks the generator stale, as if one of its settings changed.
    pub fn touch(&self) {
        self.lock_state().modified = ModifiedTime::now();
    }

    /// How many times the closure has actually run.
    pub fn compute_count(&self) -> usize {
        self.compute_count.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> MutexGuard<'_, GeneratorState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<R, F> FeatureGenerator<R> for FnFeatureGenerator<R, F>
where
    R: Send + Sync + 'static,
    F: Fn(Option<&R>) -> Result<R, CollaboratorError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn set_region_of_interest(&self, region: Option<SharedRegion<R>>) {
        let mut state = self.lock_state();
        if !same_region(state.region.as_ref(), region.as_ref()) {
            state.region = region;
            state.modified = ModifiedTime::now();
        }
    }

    fn is_current(&self) -> bool {
        let state = self.lock_state();
        state.output.is_some() && state.computed_at.is_newer_than(state.modified)
    }

    async fn update(&self) -> Result<(), CollaboratorError> {
        // Snapshot the inputs so the closure runs without holding the lock.
        let (region, started_at) = {
            let state = self.lock_state();
            (state.region.clone(), ModifiedTime::now())
        };

        let output = (self.compute)(region.as_deref())?;
        self.compute_count.fetch_add(1, Ordering::SeqCst);

        let mut state = self.lock_state();
        state.output = Some(Arc::new(output));
        // A concurrent `touch` after `started_at` keeps the generator stale.
        state.computed_at = if state.modified.is_newer_than(started_at) {
            started_at
        } else {
            ModifiedTime::now()
        };
        Ok(())
    }

    fn feature(&self) -> Option<SharedRegion<R>> {
        self.lock_state().output.clone()
    }

    fn modified_time(&self) -> ModifiedTime {
        self.lock_state().modified
    }
}
