// THEORY:
// The `pipeline` module is the top-level API of the engine. A
// `SegmentationPipeline` coordinates any number of feature generators and
// exactly one segmentation module into a single, region-of-interest
// constrained segmentation. It implements no algorithm itself; its job is the
// data-flow discipline around them.
//
// An update cycle (`generate_data`) has two stages:
// 1.  **Fan-out**: every registered generator is handed the current region of
//     interest and brought up to date. Its output lands in the slot matching
//     its registration index. Any failure aborts the cycle.
// 2.  **Fan-in**: the region, the initial segmentation and the complete,
//     ordered feature list go to the segmentation module once. Its result
//     replaces the published output wholesale.
//
// Staleness is lazy. Setters only record that something changed; nothing is
// computed until a consumer pulls. If nothing changed since the last success
// (same configuration, same module settings, and every generator returned the
// very same feature handle), the module is not invoked again.
//
// A failed cycle never touches the published output. The pipeline moves to
// `Failed` and keeps the error text for inspection; any later configuration
// change or a new pull starts over.

use crate::core_modules::feature_generator::SharedFeatureGenerator;
use crate::core_modules::modified_time::ModifiedTime;
use crate::core_modules::segmentation_module::{SegmentationInputs, SharedSegmentationModule};
use crate::core_modules::spatial_region::{DecoratedOutput, SharedRegion, same_region};
use crate::error::{ConfigurationError, PipelineError, PipelineResult};
use crate::parallel_pipeline::{FanOutMode, FeatureFanOut};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Configuration for the SegmentationPipeline, allowing for tunable behavior.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Whether generators are refreshed one after another or concurrently.
    pub fan_out: FanOutMode,
    /// Upper bound on generators refreshed at the same time. Zero is read as one.
    pub max_concurrent_generators: usize,
    /// Skip the segmentation module when none of its inputs changed since the
    /// last successful cycle.
    pub reuse_unchanged_output: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fan_out: FanOutMode::Parallel,
            max_concurrent_generators: num_cpus::get(),
            reuse_unchanged_output: true,
        }
    }
}

impl PipelineConfig {
    pub fn with_fan_out(mut self, fan_out: FanOutMode) -> Self {
        self.fan_out = fan_out;
        self
    }

    pub fn with_max_concurrent_generators(mut self, limit: usize) -> Self {
        self.max_concurrent_generators = limit;
        self
    }

    pub fn with_reuse_unchanged_output(mut self, reuse: bool) -> Self {
        self.reuse_unchanged_output = reuse;
        self
    }
}

/// Where the pipeline is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No segmentation module has been set.
    Unconfigured,
    /// Ready to run; configuration changed since the last cycle (or none ran).
    Configured,
    /// A cycle is in progress.
    Updating,
    /// The last cycle succeeded.
    Ready,
    /// The last cycle failed. See `last_failure`.
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Unconfigured => "unconfigured",
            PipelineState::Configured => "configured",
            PipelineState::Updating => "updating",
            PipelineState::Ready => "ready",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What the module consumed in the last successful cycle.
struct LastRun<R> {
    completed_at: ModifiedTime,
    module_modified: ModifiedTime,
    generators_modified: Vec<ModifiedTime>,
    features: Vec<SharedRegion<R>>,
}

impl<R> LastRun<R> {
    fn features_match(&self, features: &[SharedRegion<R>]) -> bool {
        self.features.len() == features.len()
            && self
                .features
                .iter()
                .zip(features)
                .all(|(previous, current)| Arc::ptr_eq(previous, current))
    }
}

/// Marks a cycle `Failed` if its future is dropped before it finishes, e.g.
/// by a caller-side timeout.
struct CycleGuard<'a, R>
where
    R: Send + Sync + 'static,
{
    pipeline: &'a mut SegmentationPipeline<R>,
    armed: bool,
}

impl<R> Drop for CycleGuard<'_, R>
where
    R: Send + Sync + 'static,
{
    fn drop(&mut self) {
        if self.armed {
            warn!("update cycle cancelled before completion");
            self.pipeline.state = PipelineState::Failed;
            self.pipeline.last_failure = Some(CANCELLED_CYCLE.to_string());
        }
    }
}

const CANCELLED_CYCLE: &str = "update cycle cancelled";

/// Coordinates feature generators and a segmentation module into one result.
pub struct SegmentationPipeline<R>
where
    R: Send + Sync + 'static,
{
    region_of_interest: Option<SharedRegion<R>>,
    initial_segmentation: Option<SharedRegion<R>>,
    /// Registration order is the feature order handed to the module.
    feature_generators: Vec<SharedFeatureGenerator<R>>,
    segmentation_module: Option<SharedSegmentationModule<R>>,
    config: PipelineConfig,
    fan_out: FeatureFanOut,
    state: PipelineState,
    last_failure: Option<String>,
    modified: ModifiedTime,
    last_run: Option<LastRun<R>>,
    output: watch::Sender<Option<Arc<DecoratedOutput<R>>>>,
    update_count: u64,
    segmentation_invocations: u64,
}

impl<R> Default for SegmentationPipeline<R>
where
    R: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<R> SegmentationPipeline<R>
where
    R: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_config(PipelineConfig::default())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        let fan_out = FeatureFanOut::new(config.fan_out, config.max_concurrent_generators);
        let (output, _) = watch::channel(None);
        Self {
            region_of_interest: None,
            initial_segmentation: None,
            feature_generators: Vec::new(),
            segmentation_module: None,
            config,
            fan_out,
            state: PipelineState::Unconfigured,
            last_failure: None,
            modified: ModifiedTime::now(),
            last_run: None,
            output,
            update_count: 0,
            segmentation_invocations: 0,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // --- Region of interest / initial segmentation ---

    /// Sets the region every generator and the module work inside. Takes effect
    /// on the next pull.
    pub fn set_region_of_interest(&mut self, region: Option<SharedRegion<R>>) {
        if !same_region(self.region_of_interest.as_ref(), region.as_ref()) {
            self.region_of_interest = region;
            self.mark_modified();
        }
    }

    pub fn region_of_interest(&self) -> Option<&SharedRegion<R>> {
        self.region_of_interest.as_ref()
    }

    /// Sets the seed handed to the segmentation module.
    pub fn set_initial_segmentation(&mut self, region: Option<SharedRegion<R>>) {
        if !same_region(self.initial_segmentation.as_ref(), region.as_ref()) {
            self.initial_segmentation = region;
            self.mark_modified();
        }
    }

    pub fn initial_segmentation(&self) -> Option<&SharedRegion<R>> {
        self.initial_segmentation.as_ref()
    }

    // --- Collaborators ---

    /// Appends a generator and returns the feature slot it will fill. Adding the
    /// same generator twice creates two independent slots.
    pub fn add_feature_generator(&mut self, generator: SharedFeatureGenerator<R>) -> usize {
        let index = self.feature_generators.len();
        debug!(index, generator = generator.name(), "registered feature generator");
        self.feature_generators.push(generator);
        self.mark_modified();
        index
    }

    /// Like [`add_feature_generator`](Self::add_feature_generator), for callers
    /// holding a generator that may be absent. Absence is rejected and nothing
    /// is appended.
    pub fn try_add_feature_generator(
        &mut self,
        generator: Option<SharedFeatureGenerator<R>>,
    ) -> Result<usize, ConfigurationError> {
        match generator {
            Some(generator) => Ok(self.add_feature_generator(generator)),
            None => {
                warn!("refusing to register an absent feature generator");
                Err(ConfigurationError::MissingFeatureGenerator)
            }
        }
    }

    pub fn feature_generators(&self) -> &[SharedFeatureGenerator<R>] {
        &self.feature_generators
    }

    pub fn feature_generator_count(&self) -> usize {
        self.feature_generators.len()
    }

    /// Installs the module, replacing any previous one.
    pub fn set_segmentation_module(&mut self, module: SharedSegmentationModule<R>) {
        debug!(module = module.name(), "segmentation module set");
        self.segmentation_module = Some(module);
        self.mark_modified();
    }

    pub fn segmentation_module(&self) -> Option<&SharedSegmentationModule<R>> {
        self.segmentation_module.as_ref()
    }

    // --- Status ---

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Error text of the last failed cycle, cleared by the next success.
    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    /// When the pipeline's own configuration last changed.
    pub fn modified_time(&self) -> ModifiedTime {
        self.modified
    }

    /// The published output, `None` until a cycle has succeeded.
    pub fn output(&self) -> Option<Arc<DecoratedOutput<R>>> {
        self.output.borrow().clone()
    }

    /// A receiver for downstream stages. Each successful cycle replaces the
    /// value atomically.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<DecoratedOutput<R>>>> {
        self.output.subscribe()
    }

    /// Number of successful cycles, including ones that reused the output.
    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    /// Number of times the segmentation module has been called.
    pub fn segmentation_invocations(&self) -> u64 {
        self.segmentation_invocations
    }

    // --- Update protocol ---

    /// Pull entry point, same as [`generate_data`](Self::generate_data).
    pub async fn update(&mut self) -> PipelineResult<SharedRegion<R>> {
        self.generate_data().await
    }

    /// Runs one update cycle and returns the segmentation.
    ///
    /// Takes `&mut self`: the region, seed and collaborators cannot be replaced
    /// while a cycle is running.
    ///
    /// # Errors
    ///
    /// - `Configuration` if no module is set. No generator is touched.
    /// - `UpstreamFailure` if a generator fails. The module is not called.
    /// - `SegmentationFailure` if the module fails.
    ///
    /// The published output is left as it was on every error.
    pub async fn generate_data(&mut self) -> PipelineResult<SharedRegion<R>> {
        let Some(module) = self.segmentation_module.clone() else {
            let err = PipelineError::from(ConfigurationError::MissingSegmentationModule);
            return Err(self.fail(err));
        };

        self.state = PipelineState::Updating;
        info!(
            generators = self.feature_generators.len(),
            module = module.name(),
            "starting update cycle"
        );

        let mut guard = CycleGuard {
            pipeline: &mut *self,
            armed: true,
        };
        let result = guard.pipeline.run_cycle(&module).await;
        guard.armed = false;
        drop(guard);

        match result {
            Ok(region) => {
                self.update_count += 1;
                self.state = PipelineState::Ready;
                self.last_failure = None;
                info!(cycle = self.update_count, "update cycle complete");
                Ok(region)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    async fn run_cycle(
        &mut self,
        module: &SharedSegmentationModule<R>,
    ) -> PipelineResult<SharedRegion<R>> {
        // Stage 1: bring every generator up to date, in registration-indexed slots.
        let outcome = self
            .fan_out
            .run(&self.feature_generators, self.region_of_interest.clone())
            .await?;
        debug!(
            features = outcome.features.len(),
            refreshed = outcome.refreshed,
            "feature fan-out complete"
        );

        let module_modified = module.modified_time();
        let generators_modified: Vec<ModifiedTime> = self
            .feature_generators
            .iter()
            .map(|generator| generator.modified_time())
            .collect();
        if let Some(current) =
            self.reusable_output(&outcome.features, module_modified, &generators_modified)
        {
            debug!("inputs unchanged, reusing previous segmentation");
            return Ok(current);
        }

        // Stage 2: one call to the module with the complete feature list.
        let inputs = SegmentationInputs {
            region_of_interest: self.region_of_interest.clone(),
            initial_segmentation: self.initial_segmentation.clone(),
            features: outcome.features,
        };
        self.segmentation_invocations += 1;
        let region = module
            .segment(&inputs)
            .await
            .map_err(|source| PipelineError::SegmentationFailure {
                module: module.name().to_string(),
                source,
            })?;

        // Stage 3: publish. Readers see either the old or the new output.
        let cycle = self.update_count + 1;
        let published = Arc::new(DecoratedOutput::new(Arc::clone(&region), cycle));
        let completed_at = published.published_at;
        self.output.send_replace(Some(published));
        self.last_run = Some(LastRun {
            completed_at,
            module_modified,
            generators_modified,
            features: inputs.features,
        });

        Ok(region)
    }

    fn reusable_output(
        &self,
        features: &[SharedRegion<R>],
        module_modified: ModifiedTime,
        generators_modified: &[ModifiedTime],
    ) -> Option<SharedRegion<R>> {
        if !self.config.reuse_unchanged_output {
            return None;
        }
        let last_run = self.last_run.as_ref()?;
        let unchanged = !self.modified.is_newer_than(last_run.completed_at)
            && last_run.module_modified == module_modified
            && last_run.generators_modified == generators_modified
            && last_run.features_match(features);
        if !unchanged {
            return None;
        }
        self.output().map(|current| Arc::clone(&current.region))
    }

    fn fail(&mut self, err: PipelineError) -> PipelineError {
        warn!("update cycle failed: {}", err);
        self.state = PipelineState::Failed;
        self.last_failure = Some(err.to_string());
        err
    }

    fn mark_modified(&mut self) {
        self.modified = ModifiedTime::now();
        self.state = if self.segmentation_module.is_some() {
            PipelineState::Configured
        } else {
            PipelineState::Unconfigured
        };
    }
}

impl<R> fmt::Display for SegmentationPipeline<R>
where
    R: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SegmentationPipeline ({})", self.state)?;
        writeln!(f, "  region of interest: {}", presence(self.region_of_interest.is_some()))?;
        writeln!(f, "  initial segmentation: {}", presence(self.initial_segmentation.is_some()))?;
        writeln!(
            f,
            "  feature generators: {} ({:?} fan-out, up to {} at once)",
            self.feature_generators.len(),
            self.fan_out.mode(),
            self.fan_out.max_concurrent()
        )?;
        for (index, generator) in self.feature_generators.iter().enumerate() {
            writeln!(f, "    [{}] {}", index, generator.name())?;
        }
        match &self.segmentation_module {
            Some(module) => writeln!(f, "  segmentation module: {}", module.name())?,
            None => writeln!(f, "  segmentation module: (none)")?,
        }
        write!(f, "  successful cycles: {}", self.update_count)
    }
}

fn presence(present: bool) -> &'static str {
    if present { "set" } else { "(none)" }
}
