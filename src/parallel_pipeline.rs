// THEORY:
// The fan-out half of an update cycle. Every registered feature generator must
// be brought up to date against the same region of interest before the
// segmentation module may run. Generators never observe each other, so this is
// the naturally parallel, expensive part of the pipeline.
//
// Key architectural principles:
// 1.  **Order-indexed slots**: results are written into the slot matching the
//     generator's registration index, never appended in completion order. The
//     module always sees features in registration order.
// 2.  **Bounded parallelism**: one tokio task per slot, gated by a semaphore so
//     a pipeline with many generators cannot flood the runtime.
// 3.  **Fail fast**: the first failure ends the wait and is reported. Tasks
//     already dispatched are detached and allowed to finish on their own.
// 4.  **Barrier**: the caller receives either every feature or an error, never
//     a subset.

use crate::core_modules::feature_generator::SharedFeatureGenerator;
use crate::core_modules::spatial_region::SharedRegion;
use crate::error::{CollaboratorError, PipelineError, PipelineResult};
use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// How generators are brought up to date within one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FanOutMode {
    /// One at a time, in registration order, on the caller's task.
    Sequential,
    /// One spawned task per generator, bounded by the concurrency limit.
    #[default]
    Parallel,
}

/// The features gathered in one fan-out, in registration order.
#[derive(Debug)]
pub struct FanOutOutcome<R> {
    pub features: Vec<SharedRegion<R>>,
    /// Generators that actually recomputed (the rest were already current).
    pub refreshed: usize,
}

/// Brings a list of generators up to date and collects their features.
#[derive(Debug, Clone)]
pub struct FeatureFanOut {
    mode: FanOutMode,
    max_concurrent: usize,
}

impl FeatureFanOut {
    pub fn new(mode: FanOutMode, max_concurrent: usize) -> Self {
        Self {
            mode,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn mode(&self) -> FanOutMode {
        self.mode
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub async fn run<R>(
        &self,
        generators: &[SharedFeatureGenerator<R>],
        region_of_interest: Option<SharedRegion<R>>,
    ) -> PipelineResult<FanOutOutcome<R>>
    where
        R: Send + Sync + 'static,
    {
        match self.mode {
            FanOutMode::Sequential => Self::run_sequential(generators, region_of_interest).await,
            FanOutMode::Parallel if generators.len() <= 1 => {
                Self::run_sequential(generators, region_of_interest).await
            }
            FanOutMode::Parallel => self.run_parallel(generators, region_of_interest).await,
        }
    }

    async fn run_sequential<R>(
        generators: &[SharedFeatureGenerator<R>],
        region_of_interest: Option<SharedRegion<R>>,
    ) -> PipelineResult<FanOutOutcome<R>>
    where
        R: Send + Sync + 'static,
    {
        let mut features = Vec::with_capacity(generators.len());
        let mut refreshed = 0;

        for (index, generator) in generators.iter().enumerate() {
            let (feature, did_refresh) =
                refresh_generator(index, generator, region_of_interest.clone()).await?;
            features.push(feature);
            refreshed += usize::from(did_refresh);
        }

        Ok(FanOutOutcome { features, refreshed })
    }

    async fn run_parallel<R>(
        &self,
        generators: &[SharedFeatureGenerator<R>],
        region_of_interest: Option<SharedRegion<R>>,
    ) -> PipelineResult<FanOutOutcome<R>>
    where
        R: Send + Sync + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut pending = FuturesUnordered::new();

        for (index, generator) in generators.iter().enumerate() {
            let generator = Arc::clone(generator);
            let region = region_of_interest.clone();
            let semaphore = Arc::clone(&semaphore);

            let handle = tokio::spawn(async move {
                match semaphore.acquire_owned().await {
                    Ok(_permit) => refresh_generator(index, &generator, region).await,
                    Err(closed) => Err(upstream(
                        index,
                        &generator,
                        CollaboratorError::with_source("worker pool closed", closed),
                    )),
                }
            });
            pending.push(async move { (index, handle.await) });
        }

        let mut slots: Vec<Option<SharedRegion<R>>> = vec![None; generators.len()];
        let mut refreshed = 0;

        while let Some((index, joined)) = pending.next().await {
            match joined {
                Ok(Ok((feature, did_refresh))) => {
                    slots[index] = Some(feature);
                    refreshed += usize::from(did_refresh);
                }
                Ok(Err(err)) => {
                    warn!(index, remaining = pending.len(), "aborting fan-out: {}", err);
                    return Err(err);
                }
                Err(join_error) => {
                    warn!(index, "feature generator task did not complete: {}", join_error);
                    return Err(upstream(
                        index,
                        &generators[index],
                        CollaboratorError::with_source("generator task did not complete", join_error),
                    ));
                }
            }
        }

        let features: Vec<_> = slots.into_iter().flatten().collect();
        debug_assert_eq!(features.len(), generators.len());
        Ok(FanOutOutcome { features, refreshed })
    }
}

/// Pushes the region into one generator, updates it if stale and reads its output.
/// A panic inside the generator is reported as that slot's failure.
async fn refresh_generator<R>(
    index: usize,
    generator: &SharedFeatureGenerator<R>,
    region_of_interest: Option<SharedRegion<R>>,
) -> PipelineResult<(SharedRegion<R>, bool)>
where
    R: Send + Sync + 'static,
{
    AssertUnwindSafe(refresh_slot(index, generator, region_of_interest))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            warn!(index, generator = generator.name(), "feature generator panicked: {}", message);
            Err(upstream(
                index,
                generator,
                CollaboratorError::new(format!("generator panicked: {}", message)),
            ))
        })
}

async fn refresh_slot<R>(
    index: usize,
    generator: &SharedFeatureGenerator<R>,
    region_of_interest: Option<SharedRegion<R>>,
) -> PipelineResult<(SharedRegion<R>, bool)>
where
    R: Send + Sync + 'static,
{
    generator.set_region_of_interest(region_of_interest);

    let did_refresh = if generator.is_current() {
        debug!(index, generator = generator.name(), "feature already current");
        false
    } else {
        debug!(index, generator = generator.name(), "updating feature");
        generator
            .update()
            .await
            .map_err(|source| upstream(index, generator, source))?;
        true
    };

    let feature = generator.feature().ok_or_else(|| {
        upstream(
            index,
            generator,
            CollaboratorError::new("generator produced no feature"),
        )
    })?;
    Ok((feature, did_refresh))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn upstream<R>(
    index: usize,
    generator: &SharedFeatureGenerator<R>,
    source: CollaboratorError,
) -> PipelineError
where
    R: Send + Sync + 'static,
{
    PipelineError::UpstreamFailure {
        index,
        generator: generator.name().to_string(),
        source,
    }
}
