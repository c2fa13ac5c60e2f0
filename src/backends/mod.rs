//! Super-resolution backends and the tier selector
//!
//! Every model-backed tier is bound to one [`SuperResolutionBackend`]:
//! - ONNX Runtime (CUDA/CoreML providers for the accelerated tiers)
//! - Tract (pure Rust, CPU only) for general compute
//!
//! The naive fallback is not a backend; it is a plain resampling step that
//! cannot fail.

mod cache;
mod models;
mod naive;
mod resources;
mod selector;
mod tensor;
mod tier;
mod tiling;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "tract")]
pub mod tract;

pub use cache::{ModelCache, ModelCacheStats, ModelSlot};
pub use models::{ModelStore, MODEL_DIR_ENV_VAR};
pub use naive::NaiveUpscaler;
pub use resources::{
    ResourceProbe, StaticResourceProbe, SystemResourceProbe, DEVICE_MEMORY_ENV_VAR,
};
pub use selector::{BackendFactory, BackendSelector, DefaultBackendFactory};
pub use tensor::{rgb_to_tensor, tensor_to_rgb};
pub use tier::{BackendTier, LatencyClass, ResourceSnapshot, TierRequirement};
pub use tiling::{run_model_tier, upscale_tiled};

#[cfg(feature = "onnx")]
pub use self::onnx::OnnxSuperResolution;

#[cfg(feature = "tract")]
pub use self::tract::TractSuperResolution;

use crate::config::{EngineConfig, ModelEntry};
use crate::error::{EnhanceError, Result};
use crate::types::{ContentHint, FeatureVector};
use image::RgbImage;

/// A learned upscaler bound to one or more tiers.
///
/// Implementations are shared between requests and must be safe to call from
/// several blocking workers; sessions that need `&mut` access are guarded
/// internally.
pub trait SuperResolutionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Make sure the model for `params` is loaded and the backend can run.
    ///
    /// Called once per Execute before any tile is submitted.
    fn prepare(&self, _params: &TierParams) -> Result<()> {
        Ok(())
    }

    /// Upscale factor of one forward pass
    fn native_scale(&self, params: &TierParams) -> u32 {
        params.model.native_scale
    }

    /// Whether every tile must have the same square shape.
    ///
    /// Tiles on the image border are then padded by edge replication and the
    /// padding is cropped off the output.
    fn fixed_tile_shape(&self) -> bool {
        false
    }

    /// Upscale one tile by exactly [`Self::native_scale`]
    fn upscale_tile(&self, tile: &RgbImage, params: &TierParams) -> Result<RgbImage>;
}

/// Everything a backend needs to run one request on one tier
#[derive(Debug, Clone, PartialEq)]
pub struct TierParams {
    pub tier: BackendTier,
    pub model_id: String,
    pub model: ModelEntry,
    /// Tile edge in input pixels
    pub tile_size: u32,
    /// Context pixels shared with each neighbouring tile
    pub overlap: u32,
    /// Denoise level 0..=2 derived from the noise estimate; `model` is
    /// already resolved to the variant for this level
    pub noise_level: u8,
    /// Average with a horizontally flipped pass
    pub tta: bool,
}

impl TierParams {
    /// Cache slot of the loaded model for these parameters
    #[must_use]
    pub fn slot(&self) -> ModelSlot {
        ModelSlot {
            model_id: self.model_id.clone(),
            noise_level: self.noise_level,
        }
    }

    /// Derive the parameters of `tier` for an image of `pixels` pixels.
    ///
    /// # Errors
    /// - `InvalidRequest` for the naive fallback, which has no model
    /// - `Model` when the hint's model identifier is not in `backends.models`
    pub fn derive(
        tier: BackendTier,
        config: &EngineConfig,
        features: &FeatureVector,
        hint: ContentHint,
        pixels: u64,
    ) -> Result<Self> {
        let tier_config = config.backends.tier(tier).ok_or_else(|| {
            EnhanceError::invalid_request(format!("tier {tier} is not model-backed"))
        })?;
        let model_id = tier_config.models.for_hint(hint).to_string();
        let noise_level = tier_config.noise.level_for(features.noise_estimate);
        let model = config
            .backends
            .models
            .get(&model_id)
            .map(|entry| entry.for_noise_level(noise_level))
            .ok_or_else(|| EnhanceError::model(format!("unknown model '{model_id}'")))?;

        Ok(Self {
            tier,
            model_id,
            model,
            tile_size: tier_config.tiles.tile_for(pixels),
            overlap: tier_config.tiles.overlap,
            noise_level,
            tta: tier_config.tta.enabled
                && features.complexity() > tier_config.tta.complexity_threshold,
        })
    }
}
