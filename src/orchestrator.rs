//! Upscale orchestrator
//!
//! [`EnhancementEngine`] owns the stage registry, the backend selector and a
//! handle to the configuration store, and drives one request through
//! `Init → Analyze → PreProcess → Execute(tier) → PostProcess → Validate`,
//! demoting one tier per failed or rejected attempt until an output is
//! accepted or the naive fallback produces the final image.

use crate::analysis::ImageAnalyzer;
use crate::backends::{
    BackendSelector, BackendTier, DefaultBackendFactory, ModelStore, NaiveUpscaler, ResourceProbe,
    ResourceSnapshot, SuperResolutionBackend, SystemResourceProbe, TierParams,
};
use crate::config::{ConfigStore, EngineConfig};
use crate::error::{EnhanceError, Result};
use crate::events::{EngineState, EnhancementEvent, EventSink, TracingEventSink};
use crate::pipeline::{EnhancementPipeline, PipelineOutcome};
use crate::stages::{ensure_opaque, ProcessingStage, StagePhase, StageRegistry};
use crate::types::{
    AttemptOutcome, ContentHint, FeatureVector, ProcessingTimings, StageFailure, TierAttempt,
    UpscaleReport, UpscaleRequest, UpscaleResult,
};
use crate::validator::{OutputValidator, Validation};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use image::{DynamicImage, RgbImage};
use instant::Instant;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Milliseconds elapsed since `start`
fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn worker_failed(error: &tokio::task::JoinError) -> EnhanceError {
    EnhanceError::internal(format!("blocking worker failed: {error}"))
}

/// Per-request state shared by every tier attempt
struct RequestContext {
    request_id: Uuid,
    config: Arc<EngineConfig>,
    features: FeatureVector,
    hint: ContentHint,
    /// Normalized, pre-processed input handed to the backends read-only
    prepared: Arc<RgbImage>,
    scale: u32,
    target: (u32, u32),
    snapshot: ResourceSnapshot,
    post: EnhancementPipeline,
    post_active: Vec<String>,
    /// The engine, not the normalize stage, flattened the input
    composited: bool,
    validator: OutputValidator,
    cancel: CancellationToken,
}

impl RequestContext {
    fn input_pixels(&self) -> u64 {
        u64::from(self.prepared.width()) * u64::from(self.prepared.height())
    }
}

/// Output of one model tier that reached validation
struct TierRun {
    post: PipelineOutcome,
    validation: Validation,
}

/// Adaptive enhancement and upscaling engine
///
/// # Examples
///
/// ```rust,no_run
/// use imgly_upscale::{EnhancementEngine, UpscaleRequest};
///
/// # async fn example() -> anyhow::Result<()> {
/// let engine = EnhancementEngine::with_defaults()?;
/// let image = image::open("scan.png")?;
/// let result = engine.enhance(UpscaleRequest::new(image, 2)).await?;
/// println!("{} after {} retries", result.report.tier_used, result.report.retries);
/// # Ok(())
/// # }
/// ```
pub struct EnhancementEngine {
    config: Arc<ConfigStore>,
    registry: RwLock<StageRegistry>,
    selector: BackendSelector,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for EnhancementEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnhancementEngine")
            .field("config", &self.config)
            .field("stages", &self.stage_names())
            .field("selector", &self.selector)
            .finish_non_exhaustive()
    }
}

impl EnhancementEngine {
    #[must_use]
    pub fn builder() -> EnhancementEngineBuilder {
        EnhancementEngineBuilder::default()
    }

    /// Engine over the default config file, the system resource probe and the
    /// default backends for every compiled-in tier
    ///
    /// # Errors
    /// - `Io`/`Serialization` when the config file cannot be read
    pub fn with_defaults() -> Result<Self> {
        Self::builder()
            .config_store(Arc::new(ConfigStore::open_default()?))
            .with_default_backends()
            .build()
    }

    #[must_use]
    pub fn config_store(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    #[must_use]
    pub fn selector(&self) -> &BackendSelector {
        &self.selector
    }

    fn emit(&self, event: EnhancementEvent) {
        self.events.emit(event);
    }

    fn enter(&self, request_id: Uuid, state: EngineState, tier: Option<BackendTier>) {
        self.emit(EnhancementEvent::StateEntered {
            request_id,
            state,
            tier,
        });
    }

    fn registry_read(&self) -> std::sync::RwLockReadGuard<'_, StageRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_write(&self) -> std::sync::RwLockWriteGuard<'_, StageRegistry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    // Stage registry

    /// Append a custom stage and declare its parameters in the config store
    ///
    /// # Errors
    /// - `DuplicateStage` if the name is taken
    /// - `InvalidRequest`/`InvalidConfig` for an invalid stage name
    pub fn register_stage(&self, stage: Arc<dyn ProcessingStage>) -> Result<()> {
        let mut registry = self.registry_write();
        registry.admit(&stage)?;
        self.config.declare_stage(stage.name(), stage.declaration())?;
        registry.register(stage)
    }

    /// Insert a custom stage at `index` in the execution order
    pub fn insert_stage(&self, index: usize, stage: Arc<dyn ProcessingStage>) -> Result<()> {
        let mut registry = self.registry_write();
        registry.admit(&stage)?;
        self.config.declare_stage(stage.name(), stage.declaration())?;
        registry.insert(index, stage)
    }

    pub fn unregister_stage(&self, name: &str) -> Result<Arc<dyn ProcessingStage>> {
        self.registry_write().unregister(name)
    }

    pub fn reorder_stages(&self, order: &[&str]) -> Result<()> {
        self.registry_write().reorder(order)
    }

    pub fn move_stage(&self, name: &str, index: usize) -> Result<()> {
        self.registry_write().move_stage(name, index)
    }

    pub fn set_stage_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        self.registry_write().set_enabled(name, enabled)
    }

    /// Registered stage names in execution order
    #[must_use]
    pub fn stage_names(&self) -> Vec<String> {
        self.registry_read().names()
    }

    /// Whether each tier could run right now, with the reason when it cannot
    pub async fn tier_availability(&self) -> Vec<(BackendTier, std::result::Result<(), String>)> {
        let snapshot = self.selector.snapshot().await;
        let config = self.config.snapshot();
        BackendTier::DESCENDING
            .into_iter()
            .map(|tier| (tier, self.selector.check_tier(tier, &snapshot, &config.backends)))
            .collect()
    }

    // Orchestration

    /// Init: reject requests no tier could ever satisfy
    fn validate_request(request: &UpscaleRequest, config: &EngineConfig) -> Result<(u32, u32)> {
        let (width, height) = (request.image.width(), request.image.height());
        if width == 0 || height == 0 {
            return Err(EnhanceError::invalid_request(format!(
                "image has no pixels ({width}x{height})"
            )));
        }
        if request.scale_factor == 0 {
            return Err(EnhanceError::invalid_request("scale factor must be at least 1"));
        }
        if request.scale_factor > config.engine.max_scale_factor {
            return Err(EnhanceError::invalid_request(format!(
                "scale factor {} exceeds the configured maximum {}",
                request.scale_factor, config.engine.max_scale_factor
            )));
        }
        let pixels = u64::from(width) * u64::from(height);
        if pixels > config.engine.max_input_pixels {
            return Err(EnhanceError::invalid_request(format!(
                "{width}x{height} exceeds the configured maximum of {} input pixels",
                config.engine.max_input_pixels
            )));
        }
        let (out_width, out_height) = request.target_dimensions()?;
        let output_pixels = u64::from(out_width) * u64::from(out_height);
        if output_pixels > config.engine.max_input_pixels {
            return Err(EnhanceError::invalid_request(format!(
                "{width}x{height} scaled by {} gives {out_width}x{out_height}, over the configured maximum of {} pixels",
                request.scale_factor, config.engine.max_input_pixels
            )));
        }
        Ok((out_width, out_height))
    }

    fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            Err(EnhanceError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn report_skipped(&self, request_id: Uuid, skipped: &[StageFailure]) {
        for failure in skipped {
            self.emit(EnhancementEvent::StageSkipped {
                request_id,
                stage: failure.stage.clone(),
                error: failure.error.clone(),
            });
        }
    }

    /// Enhance and upscale one image.
    ///
    /// Stage, backend and validation failures never surface here: they are
    /// absorbed by skipping stages and demoting tiers, and recorded in the
    /// report.
    ///
    /// # Errors
    /// - `InvalidRequest` for empty images, out-of-range scale factors or
    ///   oversized inputs
    /// - `Cancelled` when the request's token fires at a stage boundary or
    ///   between tier attempts
    /// - `FallbackExhausted` if even the naive fallback misses the target size
    #[instrument(skip_all, fields(scale = request.scale_factor, width = request.image.width(), height = request.image.height()))]
    pub async fn enhance(&self, request: UpscaleRequest) -> Result<UpscaleResult> {
        let request_id = Uuid::new_v4();
        let started_at = Utc::now();
        let total_start = Instant::now();
        let config = self.config.snapshot();
        let cancel = request.cancellation.clone();
        let mut timings = ProcessingTimings::default();

        // Init
        self.enter(request_id, EngineState::Init, None);
        let target = Self::validate_request(&request, &config)?;
        Self::check_cancelled(&cancel)?;
        let input_dimensions = (request.image.width(), request.image.height());
        let scale = request.scale_factor;
        let budget = request.degradation_budget.unwrap_or(usize::MAX);

        // Analyze
        self.enter(request_id, EngineState::Analyze, None);
        let analysis_start = Instant::now();
        let image = request.image;
        let (features, image) = tokio::task::spawn_blocking(move || {
            let features = ImageAnalyzer::new().analyze(&image);
            (features, image)
        })
        .await
        .map_err(|e| worker_failed(&e))?;
        let hint = request
            .content_hint
            .unwrap_or_else(|| ContentHint::infer(&features));
        timings.analysis_ms = elapsed_ms(analysis_start);
        info!(
            %request_id,
            edge_density = features.edge_density,
            contrast = features.contrast_score,
            noise = features.noise_estimate,
            color_richness = features.color_richness,
            %hint,
            "🔍 Image analyzed"
        );

        let (normalize, pre, post) = {
            let registry = self.registry_read();
            (
                EnhancementPipeline::from_registry(&registry, &[StagePhase::Normalize]),
                EnhancementPipeline::from_registry(&registry, &[StagePhase::PreProcess]),
                EnhancementPipeline::from_registry(&registry, &[StagePhase::PostProcess]),
            )
        };
        let normalize_active = normalize.active_stage_names(&features, &config, hint);
        let pre_active = pre.active_stage_names(&features, &config, hint);
        let post_active = post.active_stage_names(&features, &config, hint);

        // PreProcess
        Self::check_cancelled(&cancel)?;
        self.enter(request_id, EngineState::PreProcess, None);
        let preprocess_start = Instant::now();
        let (normalized, pre_outcome, composited) = {
            let config = Arc::clone(&config);
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || -> Result<_> {
                let mut normalized =
                    normalize.run(image, &features, &normalize_active, &config, hint, &cancel)?;
                let image = std::mem::replace(&mut normalized.image, DynamicImage::new_rgb8(0, 0));
                let (opaque, composited) = ensure_opaque(image, &config, hint);
                let pre_outcome = pre.run(
                    DynamicImage::ImageRgb8(opaque),
                    &features,
                    &pre_active,
                    &config,
                    hint,
                    &cancel,
                )?;
                Ok((normalized, pre_outcome, composited))
            })
            .await
            .map_err(|e| worker_failed(&e))??
        };
        timings.preprocess_ms = elapsed_ms(preprocess_start);
        if composited {
            warn!(
                %request_id,
                "🧯 Input was not normalized by the pipeline; composited onto the normalize background"
            );
        }
        self.report_skipped(request_id, &normalized.skipped);
        self.report_skipped(request_id, &pre_outcome.skipped);
        let mut stages_applied = normalized.applied;
        stages_applied.extend(pre_outcome.applied);
        let mut stages_skipped = normalized.skipped;
        stages_skipped.extend(pre_outcome.skipped);
        let prepared = match pre_outcome.image {
            DynamicImage::ImageRgb8(rgb) => rgb,
            other => other.to_rgb8(),
        };

        let snapshot = self.selector.snapshot().await;
        let mut tier = self.selector.initial_tier(&snapshot, &config.backends);
        self.emit(EnhancementEvent::TierSelected {
            request_id,
            tier,
            reason: if tier == BackendTier::NaiveFallback {
                "no model tier is eligible".to_string()
            } else {
                "highest tier eligible under the resource snapshot".to_string()
            },
        });

        let context = RequestContext {
            request_id,
            validator: OutputValidator::new(config.quality),
            config,
            features,
            hint,
            prepared: Arc::new(prepared),
            scale,
            target,
            snapshot,
            post,
            post_active,
            composited,
            cancel,
        };

        let mut attempts = Vec::new();
        let mut demotions = 0_usize;

        while tier != BackendTier::NaiveFallback {
            Self::check_cancelled(&context.cancel)?;
            let attempt_start = Instant::now();
            let params = TierParams::derive(
                tier,
                &context.config,
                &context.features,
                context.hint,
                context.input_pixels(),
            );
            let (noise_level, model_file) = match &params {
                Ok(params) => (Some(params.noise_level), Some(params.model.file.clone())),
                Err(_) => (None, None),
            };
            let attempt = |outcome, quality_score| TierAttempt {
                tier,
                outcome,
                duration_ms: elapsed_ms(attempt_start),
                quality_score,
                noise_level,
                model_file: model_file.clone(),
            };

            let run = match params {
                Ok(params) => self.run_tier(params, &context, &mut timings).await,
                Err(e) => Err(e),
            };
            let reason = match run {
                Ok(run) if run.validation.accepted => {
                    attempts.push(attempt(
                        AttemptOutcome::Accepted,
                        Some(run.validation.score),
                    ));
                    self.enter(request_id, EngineState::Accept, Some(tier));
                    stages_applied.extend(run.post.applied);
                    stages_skipped.extend(run.post.skipped);
                    timings.total_ms = elapsed_ms(total_start);

                    let report = UpscaleReport {
                        request_id,
                        started_at,
                        tier_used: tier,
                        retries: demotions,
                        accepted: true,
                        fully_degraded: false,
                        quality_score: run.validation.score,
                        content_hint: context.hint,
                        features: context.features,
                        attempts,
                        stages_applied,
                        stages_skipped,
                        input_dimensions,
                        output_dimensions: context.target,
                        composited_by_engine: context.composited,
                        timings,
                    };
                    return Ok(self.complete(run.post.image, report));
                },
                Ok(run) => {
                    let reason = run
                        .validation
                        .reasons
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("; ");
                    attempts.push(attempt(
                        AttemptOutcome::Rejected {
                            reasons: run.validation.reasons,
                        },
                        Some(run.validation.score),
                    ));
                    reason
                },
                Err(EnhanceError::Cancelled) => return Err(EnhanceError::Cancelled),
                Err(e) => {
                    let error = e.to_string();
                    self.emit(EnhancementEvent::TierFailed {
                        request_id,
                        tier,
                        error: error.clone(),
                    });
                    attempts.push(attempt(
                        AttemptOutcome::Failed {
                            error: error.clone(),
                        },
                        None,
                    ));
                    error
                },
            };

            // Demote
            let next = if demotions >= budget {
                BackendTier::NaiveFallback
            } else {
                tier.next_lower().unwrap_or(BackendTier::NaiveFallback)
            };
            self.enter(request_id, EngineState::Demote, Some(tier));
            self.emit(EnhancementEvent::Demoted {
                request_id,
                from: tier,
                to: next,
                reason,
            });
            demotions += 1;
            tier = next;
        }

        // ExhaustedFallback
        Self::check_cancelled(&context.cancel)?;
        self.enter(request_id, EngineState::ExhaustedFallback, Some(tier));
        let attempt_start = Instant::now();
        let naive = NaiveUpscaler::new(context.config.backends.naive_fallback);
        let validator = context.validator;
        let prepared = Arc::clone(&context.prepared);
        let target = context.target;
        let (image, score) = tokio::task::spawn_blocking(move || {
            let image = DynamicImage::ImageRgb8(naive.upscale(&prepared, target));
            let score = validator.score(&image);
            (image, score)
        })
        .await
        .map_err(|e| worker_failed(&e))?;
        timings.execute_ms += elapsed_ms(attempt_start);

        if (image.width(), image.height()) != target {
            return Err(EnhanceError::fallback_exhausted(format!(
                "naive resize produced {}x{}, expected {}x{}",
                image.width(),
                image.height(),
                target.0,
                target.1
            )));
        }
        if score.flags.any() {
            warn!(%request_id, flags = ?score.flags, "Naive fallback output is degenerate; returned unvalidated");
        }

        attempts.push(TierAttempt {
            tier: BackendTier::NaiveFallback,
            outcome: AttemptOutcome::Fallback,
            duration_ms: elapsed_ms(attempt_start),
            quality_score: Some(score),
            noise_level: None,
            model_file: None,
        });
        timings.total_ms = elapsed_ms(total_start);

        let report = UpscaleReport {
            request_id,
            started_at,
            tier_used: BackendTier::NaiveFallback,
            retries: demotions,
            accepted: true,
            fully_degraded: true,
            quality_score: score,
            content_hint: context.hint,
            features: context.features,
            attempts,
            stages_applied,
            stages_skipped,
            input_dimensions,
            output_dimensions: target,
            composited_by_engine: context.composited,
            timings,
        };
        Ok(self.complete(image, report))
    }

    fn complete(&self, image: DynamicImage, report: UpscaleReport) -> UpscaleResult {
        self.emit(EnhancementEvent::Completed {
            request_id: report.request_id,
            tier: report.tier_used,
            retries: report.retries,
            accepted: report.accepted,
            composite_score: report.quality_score.composite,
            total_ms: report.timings.total_ms,
        });
        UpscaleResult { image, report }
    }

    /// Execute, post-process and validate on one model tier
    async fn run_tier(
        &self,
        params: TierParams,
        context: &RequestContext,
        timings: &mut ProcessingTimings,
    ) -> Result<TierRun> {
        let request_id = context.request_id;
        let tier = params.tier;

        // Execute
        self.enter(request_id, EngineState::Execute, Some(tier));
        info!(
            %request_id,
            %tier,
            model = %params.model.file,
            noise_level = params.noise_level,
            tile = params.tile_size,
            "⚙️ Running model tier"
        );
        let execute_start = Instant::now();
        let upscaled = self
            .selector
            .execute(
                Arc::clone(&context.prepared),
                context.scale,
                params,
                &context.snapshot,
                &context.config.backends,
                context.cancel.clone(),
            )
            .await;
        timings.execute_ms += elapsed_ms(execute_start);
        let upscaled = upscaled?;

        // PostProcess
        Self::check_cancelled(&context.cancel)?;
        self.enter(request_id, EngineState::PostProcess, Some(tier));
        let post_start = Instant::now();
        let post = {
            let pipeline = context.post.clone();
            let active = context.post_active.clone();
            let config = Arc::clone(&context.config);
            let features = context.features;
            let hint = context.hint;
            let cancel = context.cancel.clone();
            tokio::task::spawn_blocking(move || {
                pipeline.run(
                    DynamicImage::ImageRgb8(upscaled),
                    &features,
                    &active,
                    &config,
                    hint,
                    &cancel,
                )
            })
            .await
            .map_err(|e| worker_failed(&e))??
        };
        timings.postprocess_ms += elapsed_ms(post_start);
        self.report_skipped(request_id, &post.skipped);

        // Validate
        self.enter(request_id, EngineState::Validate, Some(tier));
        let validate_start = Instant::now();
        let validator = context.validator;
        let target = context.target;
        let (post, validation) = tokio::task::spawn_blocking(move || {
            let validation = validator.validate(&post.image, target);
            (post, validation)
        })
        .await
        .map_err(|e| worker_failed(&e))?;
        timings.validation_ms += elapsed_ms(validate_start);

        self.emit(EnhancementEvent::ValidationResult {
            request_id,
            tier,
            accepted: validation.accepted,
            score: validation.score,
            reasons: validation.reasons.clone(),
        });
        Ok(TierRun { post, validation })
    }

    /// Enhance independent requests concurrently.
    ///
    /// At most `concurrency` requests are in flight (the configured
    /// `engine.batch_concurrency` when `None`); results keep the input order.
    pub async fn enhance_batch(
        &self,
        requests: Vec<UpscaleRequest>,
        concurrency: Option<usize>,
    ) -> Vec<Result<UpscaleResult>> {
        let concurrency = concurrency
            .unwrap_or_else(|| self.config.snapshot().engine.batch_concurrency)
            .max(1);
        info!(requests = requests.len(), concurrency, "📦 Batch enhancement started");
        stream::iter(requests)
            .map(|request| self.enhance(request))
            .buffered(concurrency)
            .collect::<Vec<_>>()
            .await
    }
}

/// Builder for [`EnhancementEngine`]
#[derive(Default)]
pub struct EnhancementEngineBuilder {
    config: Option<Arc<ConfigStore>>,
    probe: Option<Arc<dyn ResourceProbe>>,
    backends: Vec<(BackendTier, Arc<dyn SuperResolutionBackend>)>,
    stages: Vec<Arc<dyn ProcessingStage>>,
    events: Option<Arc<dyn EventSink>>,
    model_store: Option<ModelStore>,
    default_backends: bool,
}

impl EnhancementEngineBuilder {
    /// Configuration store; an in-memory store with defaults when unset
    #[must_use]
    pub fn config_store(mut self, store: Arc<ConfigStore>) -> Self {
        self.config = Some(store);
        self
    }

    /// Resource probe; the system probe over `backends.device` when unset
    #[must_use]
    pub fn resource_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Bind `backend` to a model tier, replacing a default binding
    #[must_use]
    pub fn backend(mut self, tier: BackendTier, backend: Arc<dyn SuperResolutionBackend>) -> Self {
        self.backends.push((tier, backend));
        self
    }

    /// Register a custom stage after the built-in ones
    #[must_use]
    pub fn stage(mut self, stage: Arc<dyn ProcessingStage>) -> Self {
        self.stages.push(stage);
        self
    }

    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Where the default backends look for model files
    #[must_use]
    pub fn model_store(mut self, store: ModelStore) -> Self {
        self.model_store = Some(store);
        self
    }

    /// Bind the ONNX Runtime/Tract backends for every tier this build supports
    #[must_use]
    pub fn with_default_backends(mut self) -> Self {
        self.default_backends = true;
        self
    }

    /// # Errors
    /// - `DuplicateStage` when a custom stage reuses a registered name
    /// - `InvalidRequest` when a backend is bound to the naive fallback
    pub fn build(self) -> Result<EnhancementEngine> {
        let config = self
            .config
            .unwrap_or_else(|| Arc::new(ConfigStore::in_memory()));
        let current = config.snapshot();

        let probe = self.probe.unwrap_or_else(|| {
            Arc::new(SystemResourceProbe::new(current.backends.device)) as Arc<dyn ResourceProbe>
        });
        let mut selector = BackendSelector::new(probe);
        if self.default_backends {
            let factory = DefaultBackendFactory::new(self.model_store.unwrap_or_default());
            selector = selector.with_factory(&factory, &current.backends);
        }
        for (tier, backend) in self.backends {
            selector.bind(tier, backend)?;
        }

        let mut registry = StageRegistry::with_builtin_stages();
        for stage in self.stages {
            registry.admit(&stage)?;
            config.declare_stage(stage.name(), stage.declaration())?;
            registry.register(stage)?;
        }

        Ok(EnhancementEngine {
            config,
            registry: RwLock::new(registry),
            selector,
            events: self
                .events
                .unwrap_or_else(|| Arc::new(TracingEventSink) as Arc<dyn EventSink>),
        })
    }
}
