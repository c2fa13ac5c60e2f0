//! Pluggable processing stages
//!
//! A stage is a stateless transformation with a fixed capability surface:
//! it declares its parameters, decides whether it applies to an image given
//! its features, and produces a new image of the same dimensions.
//!
//! ```rust
//! use imgly_upscale::stages::{StageRegistry, StagePhase};
//!
//! let registry = StageRegistry::with_builtin_stages();
//! assert_eq!(registry.names()[0], "normalize");
//! assert_eq!(registry.enabled_in(StagePhase::PostProcess).len(), 2);
//! ```

mod color;
mod denoise;
mod histogram;
mod normalize;
mod registry;
mod sharpen;

pub use color::ColorEnhancementStage;
pub use denoise::NoiseReductionStage;
pub use histogram::HistogramEqualizationStage;
pub use normalize::{ensure_opaque, flatten_onto, NormalizeStage};
pub use registry::{RegisteredStage, StageRegistry};
pub use sharpen::SharpeningStage;

use crate::config::{StageDeclaration, StageParams};
use crate::error::Result;
use crate::types::FeatureVector;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Declarations keyed by stage name
pub type StageDeclarations = BTreeMap<String, StageDeclaration>;

/// Where in the request a stage runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePhase {
    /// Converts the input to 8-bit opaque RGB before anything else
    Normalize,
    /// Before super-resolution
    PreProcess,
    /// After super-resolution, before validation
    PostProcess,
}

impl StagePhase {
    /// Phases that run before super-resolution, in order
    pub const BEFORE_UPSCALE: [StagePhase; 2] = [Self::Normalize, Self::PreProcess];
}

/// Capability interface of a pipeline stage
pub trait ProcessingStage: Send + Sync {
    /// Unique registry key, also the key of the stage's config subtree
    fn name(&self) -> &str;

    fn phase(&self) -> StagePhase;

    /// Parameters, defaults, bounds and version
    fn declaration(&self) -> StageDeclaration;

    /// Whether the stage should run for an image with these features
    fn is_applicable(&self, _features: &FeatureVector, _params: &StageParams) -> Result<bool> {
        Ok(true)
    }

    /// Produce the transformed image. Must not change the dimensions.
    fn process(
        &self,
        image: &DynamicImage,
        features: &FeatureVector,
        params: &StageParams,
    ) -> Result<DynamicImage>;
}

impl std::fmt::Debug for dyn ProcessingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingStage")
            .field("name", &self.name())
            .field("phase", &self.phase())
            .finish()
    }
}

/// The default stage set in registration order
#[must_use]
pub fn builtin_stages() -> Vec<Arc<dyn ProcessingStage>> {
    vec![
        Arc::new(NormalizeStage),
        Arc::new(HistogramEqualizationStage),
        Arc::new(SharpeningStage),
        Arc::new(NoiseReductionStage),
        Arc::new(ColorEnhancementStage),
    ]
}

/// Declarations of the default stage set
#[must_use]
pub fn builtin_declarations() -> StageDeclarations {
    builtin_stages()
        .iter()
        .map(|stage| (stage.name().to_string(), stage.declaration()))
        .collect()
}

#[inline]
pub(crate) fn clamp_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
