//! Configuration tree for the enhancement engine
//!
//! The tree is a plain serde structure persisted as JSON by [`ConfigStore`].
//! Every subtree has defaults so partial files and partial overrides merge onto
//! a complete configuration. Invariants are checked by [`EngineConfig::validate`]
//! at load time, never on the hot path.

mod params;
mod store;
mod validation;

pub use params::{
    ParamKind, ParamValue, ParameterSpec, StageConfig, StageDeclaration, StageParams,
};
pub use store::{merge_json, ConfigStore, LoadedConfig, CONFIG_ENV_VAR};
pub(crate) use validation::is_valid_stage_name;
pub use validation::WEIGHT_SUM_EPSILON;

use crate::backends::{BackendTier, LatencyClass};
use crate::error::{EnhanceError, Result};
use crate::stages::{builtin_declarations, StageDeclarations};
use crate::types::ContentHint;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current layout version of the persisted tree
pub const SCHEMA_VERSION: u32 = 1;

/// Execution provider options for ONNX Runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProvider {
    /// Auto-detect best available device provider (CUDA > `CoreML`)
    #[default]
    Auto,
    /// CPU only; accelerated tiers are never satisfied
    Cpu,
    /// NVIDIA CUDA GPU acceleration
    Cuda,
    /// Apple Silicon acceleration
    #[serde(rename = "coreml")]
    CoreMl,
}

impl std::fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::CoreMl => write!(f, "coreml"),
        }
    }
}

impl std::str::FromStr for ExecutionProvider {
    type Err = EnhanceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda),
            "coreml" => Ok(Self::CoreMl),
            other => Err(EnhanceError::invalid_config(format!(
                "unknown execution provider '{other}' (expected auto, cpu, cuda or coreml)"
            ))),
        }
    }
}

/// Weights of the quality sub-scores; must sum to 1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityWeights {
    pub edge: f64,
    pub contrast: f64,
    pub detail: f64,
    pub noise: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            edge: 0.3,
            contrast: 0.25,
            detail: 0.25,
            noise: 0.2,
        }
    }
}

impl QualityWeights {
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.edge + self.contrast + self.detail + self.noise
    }
}

/// Thresholds of the degenerate-output detectors
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnomalyThresholds {
    /// Fewer distinct channel values than this marks the image uniform
    pub uniform_distinct_values: usize,
    /// Mean luminance (0-255) below this marks the image near-black
    pub near_black_luminance: f64,
    /// Channel standard deviation (0-255) below this marks low variance
    pub low_variance_std_dev: f64,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self {
            uniform_distinct_values: 10,
            near_black_luminance: 8.0,
            low_variance_std_dev: 5.0,
        }
    }
}

/// Normalization constants mapping raw measurements onto `[0, 1]` sub-scores
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreScales {
    pub edge_gain: f64,
    pub contrast_gain: f64,
    /// Laplacian variance that maps to a full detail score
    pub detail_divisor: f64,
    pub noise_gain: f64,
}

impl Default for ScoreScales {
    fn default() -> Self {
        Self {
            edge_gain: 5.0,
            contrast_gain: 2.0,
            detail_divisor: 2000.0,
            noise_gain: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityConfig {
    pub weights: QualityWeights,
    pub anomalies: AnomalyThresholds,
    pub scales: ScoreScales,
    /// Minimum composite score an output needs to be accepted
    pub min_score: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            weights: QualityWeights::default(),
            anomalies: AnomalyThresholds::default(),
            scales: ScoreScales::default(),
            min_score: 0.1,
        }
    }
}

/// Tile sizing for one tier, chosen by input pixel count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileConfig {
    pub for_small_images: u32,
    pub for_medium_images: u32,
    pub for_large_images: u32,
    pub min_tile: u32,
    /// Context pixels shared between neighbouring tiles (input resolution)
    pub overlap: u32,
    pub small_image_pixels: u64,
    pub large_image_pixels: u64,
}

impl TileConfig {
    const fn sized(small: u32, medium: u32, large: u32, overlap: u32) -> Self {
        Self {
            for_small_images: small,
            for_medium_images: medium,
            for_large_images: large,
            min_tile: 64,
            overlap,
            small_image_pixels: 400_000,
            large_image_pixels: 2_000_000,
        }
    }

    #[must_use]
    pub fn tile_for(&self, pixels: u64) -> u32 {
        let size = if pixels <= self.small_image_pixels {
            self.for_small_images
        } else if pixels <= self.large_image_pixels {
            self.for_medium_images
        } else {
            self.for_large_images
        };
        size.max(self.min_tile)
    }
}

/// Maps the analyzer's noise estimate to a model denoise level
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoiseLevelConfig {
    pub low_threshold: f64,
    pub high_threshold: f64,
}

impl Default for NoiseLevelConfig {
    fn default() -> Self {
        Self {
            low_threshold: 0.01,
            high_threshold: 0.03,
        }
    }
}

impl NoiseLevelConfig {
    #[must_use]
    pub fn level_for(&self, noise_estimate: f64) -> u8 {
        if noise_estimate < self.low_threshold {
            0
        } else if noise_estimate < self.high_threshold {
            1
        } else {
            2
        }
    }
}

/// Model identifier per content hint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub photo: String,
    pub anime: String,
    pub document: String,
}

impl ModelSelection {
    fn uniform(model: &str) -> Self {
        Self {
            photo: model.to_string(),
            anime: model.to_string(),
            document: model.to_string(),
        }
    }

    #[must_use]
    pub fn for_hint(&self, hint: ContentHint) -> &str {
        match hint {
            ContentHint::Photo => &self.photo,
            ContentHint::Anime => &self.anime,
            ContentHint::Document => &self.document,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        [self.photo.as_str(), self.anime.as_str(), self.document.as_str()].into_iter()
    }
}

/// Flip test-time augmentation: average the model output over a mirrored pass
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TtaConfig {
    pub enabled: bool,
    pub complexity_threshold: f64,
}

impl Default for TtaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            complexity_threshold: 0.5,
        }
    }
}

/// Parameters and requirements of one model-backed tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    pub enabled: bool,
    pub requires_device: bool,
    pub min_device_memory_mb: u64,
    pub latency: LatencyClass,
    pub tiles: TileConfig,
    pub noise: NoiseLevelConfig,
    pub models: ModelSelection,
    pub tta: TtaConfig,
}

impl TierConfig {
    /// Defaults for a model-backed tier; `None` for the naive fallback
    #[must_use]
    pub fn default_for(tier: BackendTier) -> Option<Self> {
        match tier {
            BackendTier::AcceleratedPrimary => Some(Self::accelerated_primary()),
            BackendTier::AcceleratedSecondary => Some(Self::accelerated_secondary()),
            BackendTier::GeneralCompute => Some(Self::general_compute()),
            BackendTier::NaiveFallback => None,
        }
    }

    fn accelerated_primary() -> Self {
        Self {
            enabled: true,
            requires_device: true,
            min_device_memory_mb: 2048,
            latency: LatencyClass::Interactive,
            tiles: TileConfig::sized(512, 400, 256, 16),
            noise: NoiseLevelConfig::default(),
            models: ModelSelection {
                photo: "realesrgan-x2".to_string(),
                anime: "waifu2x-cunet-2x".to_string(),
                document: "waifu2x-cunet-2x".to_string(),
            },
            tta: TtaConfig {
                enabled: true,
                complexity_threshold: 0.5,
            },
        }
    }

    fn accelerated_secondary() -> Self {
        Self {
            enabled: true,
            requires_device: true,
            min_device_memory_mb: 1024,
            latency: LatencyClass::Interactive,
            tiles: TileConfig::sized(256, 200, 128, 12),
            noise: NoiseLevelConfig::default(),
            models: ModelSelection::uniform("waifu2x-upconv7-2x"),
            tta: TtaConfig::default(),
        }
    }

    fn general_compute() -> Self {
        Self {
            enabled: true,
            requires_device: false,
            min_device_memory_mb: 0,
            latency: LatencyClass::Batch,
            tiles: TileConfig::sized(256, 200, 128, 8),
            noise: NoiseLevelConfig::default(),
            models: ModelSelection::uniform("waifu2x-upconv7-2x"),
            tta: TtaConfig::default(),
        }
    }
}

/// Resampling filter of the naive fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeFilter {
    Nearest,
    Triangle,
    CatmullRom,
    Gaussian,
    #[default]
    Lanczos3,
}

impl From<ResizeFilter> for FilterType {
    fn from(filter: ResizeFilter) -> Self {
        match filter {
            ResizeFilter::Nearest => FilterType::Nearest,
            ResizeFilter::Triangle => FilterType::Triangle,
            ResizeFilter::CatmullRom => FilterType::CatmullRom,
            ResizeFilter::Gaussian => FilterType::Gaussian,
            ResizeFilter::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NaiveConfig {
    pub filter: ResizeFilter,
}

/// A denoising build of a model, trained for one noise level
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelVariant {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// A super-resolution model file known to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// File name relative to the model directory
    pub file: String,
    /// Upscale factor of one forward pass
    pub native_scale: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Denoising variants keyed by noise level
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub noise_variants: BTreeMap<u8, ModelVariant>,
}

impl ModelEntry {
    #[must_use]
    pub fn new(file: &str, native_scale: u32) -> Self {
        Self {
            file: file.to_string(),
            native_scale,
            sha256: None,
            noise_variants: BTreeMap::new(),
        }
    }

    #[must_use]
    fn with_noise_variants(mut self, variants: &[(u8, &str)]) -> Self {
        self.noise_variants = variants
            .iter()
            .map(|&(level, file)| {
                (
                    level,
                    ModelVariant {
                        file: file.to_string(),
                        sha256: None,
                    },
                )
            })
            .collect();
        self
    }

    /// The file to run for `noise_level`.
    ///
    /// Picks the variant of the highest level not above `noise_level`; the
    /// base file when there is none.
    #[must_use]
    pub fn for_noise_level(&self, noise_level: u8) -> ModelEntry {
        match self.noise_variants.range(..=noise_level).next_back() {
            Some((_, variant)) => ModelEntry {
                file: variant.file.clone(),
                native_scale: self.native_scale,
                sha256: variant.sha256.clone(),
                noise_variants: BTreeMap::new(),
            },
            None => ModelEntry {
                noise_variants: BTreeMap::new(),
                ..self.clone()
            },
        }
    }
}

fn default_models() -> BTreeMap<String, ModelEntry> {
    BTreeMap::from([
        (
            "realesrgan-x2".to_string(),
            ModelEntry::new("realesrgan_x2plus.onnx", 2),
        ),
        (
            "waifu2x-cunet-2x".to_string(),
            ModelEntry::new("waifu2x_cunet_scale2x.onnx", 2).with_noise_variants(&[
                (1, "waifu2x_cunet_noise1_scale2x.onnx"),
                (2, "waifu2x_cunet_noise2_scale2x.onnx"),
            ]),
        ),
        (
            "waifu2x-upconv7-2x".to_string(),
            ModelEntry::new("waifu2x_upconv7_scale2x.onnx", 2).with_noise_variants(&[
                (1, "waifu2x_upconv7_noise1_scale2x.onnx"),
                (2, "waifu2x_upconv7_noise2_scale2x.onnx"),
            ]),
        ),
    ])
}

/// Device access shared by the accelerated tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub execution_provider: ExecutionProvider,
    /// Free device memory to assume; `None` reads the environment or treats it as unknown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_memory_mb: Option<u64>,
    /// How long an Execute call waits for the device before demoting
    pub wait_timeout_ms: u64,
    /// ONNX Runtime intra-op threads (0 = all cores)
    pub intra_threads: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            execution_provider: ExecutionProvider::Auto,
            device_memory_mb: None,
            wait_timeout_ms: 5_000,
            intra_threads: 0,
        }
    }
}

/// Per-tier circuit breaker
///
/// A tier whose execution failed on `failure_threshold` consecutive requests
/// is skipped for `cooldown_ms`. A threshold of 0 disables the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub accelerated_primary: TierConfig,
    pub accelerated_secondary: TierConfig,
    pub general_compute: TierConfig,
    pub naive_fallback: NaiveConfig,
    pub models: BTreeMap<String, ModelEntry>,
    pub device: DeviceConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            accelerated_primary: TierConfig::accelerated_primary(),
            accelerated_secondary: TierConfig::accelerated_secondary(),
            general_compute: TierConfig::general_compute(),
            naive_fallback: NaiveConfig::default(),
            models: default_models(),
            device: DeviceConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl BackendConfig {
    /// Config of a model-backed tier; `None` for the naive fallback
    #[must_use]
    pub fn tier(&self, tier: BackendTier) -> Option<&TierConfig> {
        match tier {
            BackendTier::AcceleratedPrimary => Some(&self.accelerated_primary),
            BackendTier::AcceleratedSecondary => Some(&self.accelerated_secondary),
            BackendTier::GeneralCompute => Some(&self.general_compute),
            BackendTier::NaiveFallback => None,
        }
    }

    fn tier_mut(&mut self, tier: BackendTier) -> Option<&mut TierConfig> {
        match tier {
            BackendTier::AcceleratedPrimary => Some(&mut self.accelerated_primary),
            BackendTier::AcceleratedSecondary => Some(&mut self.accelerated_secondary),
            BackendTier::GeneralCompute => Some(&mut self.general_compute),
            BackendTier::NaiveFallback => None,
        }
    }
}

/// Orchestration limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    pub max_scale_factor: u32,
    pub max_input_pixels: u64,
    pub batch_concurrency: usize,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_scale_factor: 8,
            max_input_pixels: 64 * 1024 * 1024,
            batch_concurrency: 2,
        }
    }
}

/// Root of the configuration tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub schema_version: u32,
    pub stages: BTreeMap<String, StageConfig>,
    pub quality: QualityConfig,
    pub backends: BackendConfig,
    pub engine: OrchestrationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::default_with(&builtin_declarations())
    }
}

impl EngineConfig {
    /// Defaults with one stage subtree per declared stage
    #[must_use]
    pub fn default_with(declarations: &StageDeclarations) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            stages: declarations
                .iter()
                .map(|(name, declaration)| (name.clone(), declaration.default_config()))
                .collect(),
            quality: QualityConfig::default(),
            backends: BackendConfig::default(),
            engine: OrchestrationConfig::default(),
        }
    }

    /// Create a new builder starting from the defaults
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Validate against the built-in stage declarations
    #[must_use]
    pub fn validate(&self) -> Vec<crate::error::ConfigError> {
        self.validate_with(&builtin_declarations())
    }

    /// Validate against an explicit set of stage declarations
    #[must_use]
    pub fn validate_with(&self, declarations: &StageDeclarations) -> Vec<crate::error::ConfigError> {
        validation::validate(self, declarations)
    }

    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.get(name)
    }
}

/// Builder for [`EngineConfig`]
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Override one stage parameter
    #[must_use]
    pub fn stage_param(mut self, stage: &str, name: &str, value: impl Into<ParamValue>) -> Self {
        if let Some(stage_config) = self.config.stages.get_mut(stage) {
            stage_config.params.insert(name.to_string(), value.into());
        }
        self
    }

    /// Enable or disable a stage
    #[must_use]
    pub fn stage_enabled(mut self, stage: &str, enabled: bool) -> Self {
        if let Some(stage_config) = self.config.stages.get_mut(stage) {
            stage_config.enabled = enabled;
        }
        self
    }

    #[must_use]
    pub fn quality_weights(mut self, weights: QualityWeights) -> Self {
        self.config.quality.weights = weights;
        self
    }

    #[must_use]
    pub fn min_score(mut self, min_score: f64) -> Self {
        self.config.quality.min_score = min_score;
        self
    }

    #[must_use]
    pub fn execution_provider(mut self, provider: ExecutionProvider) -> Self {
        self.config.backends.device.execution_provider = provider;
        self
    }

    #[must_use]
    pub fn device_memory_mb(mut self, memory: u64) -> Self {
        self.config.backends.device.device_memory_mb = Some(memory);
        self
    }

    #[must_use]
    pub fn device_wait_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.backends.device.wait_timeout_ms = timeout_ms;
        self
    }

    /// Enable or disable a model-backed tier
    #[must_use]
    pub fn tier_enabled(mut self, tier: BackendTier, enabled: bool) -> Self {
        if let Some(tier_config) = self.config.backends.tier_mut(tier) {
            tier_config.enabled = enabled;
        }
        self
    }

    /// Open a tier's circuit after `failure_threshold` failed requests in a row
    #[must_use]
    pub fn breaker(mut self, failure_threshold: u32, cooldown_ms: u64) -> Self {
        self.config.backends.breaker = BreakerConfig {
            failure_threshold,
            cooldown_ms,
        };
        self
    }

    #[must_use]
    pub fn naive_filter(mut self, filter: ResizeFilter) -> Self {
        self.config.backends.naive_fallback.filter = filter;
        self
    }

    #[must_use]
    pub fn max_scale_factor(mut self, max: u32) -> Self {
        self.config.engine.max_scale_factor = max;
        self
    }

    /// Limit on both the input and the upscaled pixel count
    #[must_use]
    pub fn max_input_pixels(mut self, max: u64) -> Self {
        self.config.engine.max_input_pixels = max;
        self
    }

    #[must_use]
    pub fn batch_concurrency(mut self, concurrency: usize) -> Self {
        self.config.engine.batch_concurrency = concurrency;
        self
    }

    /// Build and validate against the built-in stage declarations
    pub fn build(self) -> Result<EngineConfig> {
        let issues = self.config.validate();
        if issues.is_empty() {
            Ok(self.config)
        } else {
            Err(EnhanceError::Config(issues))
        }
    }
}
