//! Ordered stage execution with per-stage failure isolation
//!
//! The pipeline never fails because of a stage. A stage that returns an
//! error, panics, or changes the image dimensions is skipped: its failure is
//! recorded and logged, and the next stage receives the pre-stage image.

use crate::config::{EngineConfig, StageParams};
use crate::error::{EnhanceError, Result};
use crate::stages::{ProcessingStage, StagePhase, StageRegistry};
use crate::types::{ContentHint, FeatureVector, StageFailure};
use image::{DynamicImage, GenericImageView};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, span, warn, Level};

/// Result of running a pipeline over one image
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub image: DynamicImage,
    /// Names of stages that ran and produced output, in order
    pub applied: Vec<String>,
    /// Stages that failed and were skipped
    pub skipped: Vec<StageFailure>,
}

/// Snapshot of the stages for a set of phases, in registry order
#[derive(Debug, Clone, Default)]
pub struct EnhancementPipeline {
    stages: Vec<Arc<dyn ProcessingStage>>,
}

impl EnhancementPipeline {
    #[must_use]
    pub fn new(stages: Vec<Arc<dyn ProcessingStage>>) -> Self {
        Self { stages }
    }

    /// Enabled registry stages of the given phases. Phase order wins over
    /// registry order, so normalization always precedes pre-processing.
    #[must_use]
    pub fn from_registry(registry: &StageRegistry, phases: &[StagePhase]) -> Self {
        let stages = phases
            .iter()
            .flat_map(|&phase| registry.enabled_in(phase))
            .collect();
        Self { stages }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    fn params_for(stage: &dyn ProcessingStage, config: &EngineConfig, hint: ContentHint) -> StageParams {
        let name = stage.name();
        match config.stages.get(name) {
            Some(stage_config) => stage_config.resolve(name, hint),
            None => stage.declaration().default_config().resolve(name, hint),
        }
    }

    fn enabled_by_config(stage: &dyn ProcessingStage, config: &EngineConfig) -> bool {
        config.stages.get(stage.name()).map_or(true, |c| c.enabled)
    }

    /// Names of the stages that would run for an image with these features.
    ///
    /// Computed once per request from the pre-upscale features, so the
    /// post-processing selection is the same for every tier attempt.
    #[must_use]
    pub fn active_stage_names(
        &self,
        features: &FeatureVector,
        config: &EngineConfig,
        hint: ContentHint,
    ) -> Vec<String> {
        self.stages
            .iter()
            .filter(|stage| Self::enabled_by_config(stage.as_ref(), config))
            .filter(|stage| {
                let params = Self::params_for(stage.as_ref(), config, hint);
                match stage.is_applicable(features, &params) {
                    Ok(applicable) => applicable,
                    Err(e) => {
                        warn!(stage = stage.name(), error = %e, "Applicability check failed; stage skipped");
                        false
                    },
                }
            })
            .map(|stage| stage.name().to_string())
            .collect()
    }

    /// Run the stages named in `active` over `image`.
    ///
    /// # Errors
    ///
    /// Only [`EnhanceError::Cancelled`]; stage failures are reported in
    /// [`PipelineOutcome::skipped`].
    #[instrument(level = "debug", skip_all, fields(stages = self.stages.len()))]
    pub fn run(
        &self,
        image: DynamicImage,
        features: &FeatureVector,
        active: &[String],
        config: &EngineConfig,
        hint: ContentHint,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        let mut current = image;
        let mut applied = Vec::new();
        let mut skipped = Vec::new();

        for stage in &self.stages {
            let name = stage.name();
            if !active.iter().any(|a| a == name) {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(EnhanceError::Cancelled);
            }

            let _span = span!(Level::DEBUG, "stage", name).entered();
            let params = Self::params_for(stage.as_ref(), config, hint);
            let expected = current.dimensions();

            let result = catch_unwind(AssertUnwindSafe(|| {
                stage.process(&current, features, &params)
            }))
            .unwrap_or_else(|payload| Err(EnhanceError::stage(name, panic_message(&payload))));

            match result {
                Ok(next) if next.dimensions() == expected => {
                    debug!(stage = name, "Stage applied");
                    current = next;
                    applied.push(name.to_string());
                },
                Ok(next) => {
                    let error = format!(
                        "changed dimensions from {}x{} to {}x{}",
                        expected.0,
                        expected.1,
                        next.width(),
                        next.height()
                    );
                    warn!(stage = name, %error, "⚠️ Stage skipped");
                    skipped.push(StageFailure {
                        stage: name.to_string(),
                        error,
                    });
                },
                Err(e) => {
                    warn!(stage = name, error = %e, "⚠️ Stage skipped");
                    skipped.push(StageFailure {
                        stage: name.to_string(),
                        error: e.to_string(),
                    });
                },
            }
        }

        Ok(PipelineOutcome {
            image: current,
            applied,
            skipped,
        })
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}
