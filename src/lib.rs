#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

//! # IMG.LY Adaptive Upscaling Library
//!
//! Content-aware image enhancement and super-resolution with graceful
//! degradation. Each request is analyzed, optionally pre-processed, upscaled
//! by the highest backend tier the machine can run, post-processed and
//! validated. Rejected or failed output demotes the request to the next
//! lower tier until a result is accepted or the naive resampler takes over.
//!
//! ## Features
//!
//! - **Tiered Backends**: device-accelerated ONNX Runtime, Tract on the CPU and a
//!   naive resampler that always succeeds
//! - **Content Analysis**: edge density, contrast, noise and color richness drive
//!   stage activation and tier parameters
//! - **Configurable Pipeline**: denoise, histogram, color and sharpening stages
//!   that can be reordered, disabled or extended at runtime
//! - **Quality Gate**: edge, contrast, detail and inverse-noise scoring with
//!   uniform, near-black, low-variance and dimension checks
//! - **Observability**: state transitions reported as structured events
//! - **CLI Integration**: optional command-line interface (enable with `cli` feature)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use imgly_upscale::{EnhancementEngine, UpscaleRequest};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let engine = EnhancementEngine::with_defaults()?;
//! let image = image::open("input.jpg")?;
//! let result = engine.enhance(UpscaleRequest::new(image, 2)).await?;
//!
//! println!(
//!     "tier {} after {} retries, score {:.2}",
//!     result.report.tier_used, result.report.retries, result.report.quality_score.composite
//! );
//! result.image.save("output.png")?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Feature Flags
//!
//! - `onnx` (default): ONNX Runtime backends for the accelerated and general-compute tiers
//! - `tract` (default): Pure Rust backend for the low-resource tier
//! - `cli` (default): Command-line interface and subscriber setup
//! - `webp-support` (default): WebP output
//! - `tracing-json`, `tracing-files`: JSON log lines and file output for the CLI
//!
//! ### Library-Only Usage
//!
//! ```toml
//! [dependencies]
//! imgly-upscale = { version = "0.1", default-features = false, features = ["tract"] }
//! ```

pub mod analysis;
pub mod backends;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod pipeline;
pub mod services;
pub mod stages;
#[cfg(feature = "cli")]
pub mod tracing_config;
pub mod types;
pub mod validator;

use tokio::io::AsyncRead;

pub use analysis::{ImageAnalyzer, QualityScorer};
pub use backends::{
    BackendSelector, BackendTier, ModelStore, NaiveUpscaler, ResourceProbe, ResourceSnapshot,
    StaticResourceProbe, SuperResolutionBackend, SystemResourceProbe, TierParams,
};
pub use config::{ConfigStore, EngineConfig, ExecutionProvider, LoadedConfig, QualityConfig};
pub use error::{ConfigError, EnhanceError, Result};
pub use events::{
    EngineState, EnhancementEvent, EventSink, MemoryEventSink, NoOpEventSink, TracingEventSink,
};
pub use orchestrator::{EnhancementEngine, EnhancementEngineBuilder};
pub use pipeline::{EnhancementPipeline, PipelineOutcome};
pub use services::{ImageIoService, OutputFormat};
pub use stages::{ProcessingStage, StagePhase, StageRegistry};
pub use types::{
    AnomalyFlags, ContentHint, FeatureVector, QualityScore, RejectionReason, TierAttempt,
    UpscaleReport, UpscaleRequest, UpscaleResult,
};
pub use validator::{OutputValidator, Validation};

#[cfg(feature = "cli")]
pub use tracing_config::{init_cli_tracing, spans, TracingConfig, TracingFormat, TracingOutput};

/// Enhance one request with a default engine
///
/// Opens the configuration at the default location and binds the backends
/// compiled into this build. Callers that process many images should build
/// one [`EnhancementEngine`] and reuse it.
pub async fn enhance(request: UpscaleRequest) -> Result<UpscaleResult> {
    EnhancementEngine::with_defaults()?.enhance(request).await
}

/// Decode `image_bytes` and enhance them by `scale_factor`
///
/// ```rust,no_run
/// # async fn example(upload: Vec<u8>) -> anyhow::Result<()> {
/// let result = imgly_upscale::enhance_bytes(&upload, 4).await?;
/// assert!(result.report.accepted);
/// # Ok(())
/// # }
/// ```
pub async fn enhance_bytes(image_bytes: &[u8], scale_factor: u32) -> Result<UpscaleResult> {
    let image = image::load_from_memory(image_bytes)?;
    enhance(UpscaleRequest::new(image, scale_factor)).await
}

/// Read an encoded image from `reader` and enhance it by `scale_factor`
pub async fn enhance_reader<R: AsyncRead + Unpin>(
    mut reader: R,
    scale_factor: u32,
) -> Result<UpscaleResult> {
    let mut buffer = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buffer).await?;
    enhance_bytes(&buffer, scale_factor).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enhance_bytes_rejects_garbage() {
        let result = enhance_bytes(b"not an image", 2).await;
        assert!(matches!(result, Err(EnhanceError::Image(_))));
    }

    #[tokio::test]
    async fn test_enhance_reader_rejects_empty_stream() {
        let result = enhance_reader(std::io::Cursor::new(Vec::new()), 2).await;
        assert!(result.is_err());
    }
}
