//! ONNX Runtime super-resolution backend
//!
//! Serves the accelerated tiers through the CUDA or CoreML execution
//! providers, and can serve general compute on the CPU provider. Sessions
//! are created lazily per model slot and reused across requests until the
//! slot's file or checksum changes.

use super::{
    rgb_to_tensor, tensor_to_rgb, BackendTier, ModelCache, ModelCacheStats, ModelStore,
    SuperResolutionBackend, TierParams,
};
use crate::config::{DeviceConfig, ExecutionProvider};
use crate::error::{EnhanceError, Result};
use image::RgbImage;
use instant::Instant;
use ort::execution_providers::{
    CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider as OrtExecutionProvider,
    ExecutionProviderDispatch,
};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;

/// ONNX Runtime backend for super-resolution models
#[derive(Debug)]
pub struct OnnxSuperResolution {
    store: ModelStore,
    device: DeviceConfig,
    /// Whether this instance must run on an accelerator
    accelerated: bool,
    sessions: ModelCache<Session>,
}

impl OnnxSuperResolution {
    /// Backend for the accelerated tiers; refuses to fall back to the CPU
    #[must_use]
    pub fn accelerated(store: ModelStore, device: DeviceConfig) -> Self {
        Self {
            store,
            device,
            accelerated: true,
            sessions: ModelCache::new(),
        }
    }

    /// Backend running on the CPU provider
    #[must_use]
    pub fn cpu(store: ModelStore, device: DeviceConfig) -> Self {
        Self {
            store,
            device: DeviceConfig {
                execution_provider: ExecutionProvider::Cpu,
                ..device
            },
            accelerated: false,
            sessions: ModelCache::new(),
        }
    }

    /// Whether an accelerator matching `provider` is usable
    #[must_use]
    pub fn accelerator_available(provider: ExecutionProvider) -> bool {
        let cuda = || OrtExecutionProvider::is_available(&CUDAExecutionProvider::default()).unwrap_or(false);
        let coreml =
            || OrtExecutionProvider::is_available(&CoreMLExecutionProvider::default()).unwrap_or(false);
        match provider {
            ExecutionProvider::Auto => cuda() || coreml(),
            ExecutionProvider::Cuda => cuda(),
            ExecutionProvider::CoreMl => coreml(),
            ExecutionProvider::Cpu => false,
        }
    }

    /// All ONNX Runtime execution providers with availability and a description
    ///
    /// ```rust,no_run
    /// use imgly_upscale::backends::OnnxSuperResolution;
    ///
    /// for (name, available, description) in OnnxSuperResolution::list_providers() {
    ///     println!("{}: {} - {}", name, if available { "✅" } else { "❌" }, description);
    /// }
    /// ```
    #[must_use]
    pub fn list_providers() -> Vec<(String, bool, String)> {
        log::debug!("🔍 System Hardware Analysis:");
        log::debug!("  - Platform: {os}", os = std::env::consts::OS);
        log::debug!("  - Architecture: {arch}", arch = std::env::consts::ARCH);

        vec![
            (
                "CPU".to_string(),
                true,
                "Always available, general compute tier".to_string(),
            ),
            (
                "CUDA".to_string(),
                Self::accelerator_available(ExecutionProvider::Cuda),
                "NVIDIA GPU acceleration (requires CUDA toolkit and compatible GPU)".to_string(),
            ),
            (
                "CoreML".to_string(),
                Self::accelerator_available(ExecutionProvider::CoreMl),
                "Apple Silicon GPU acceleration (macOS only)".to_string(),
            ),
        ]
    }

    fn unavailable(tier: BackendTier, reason: impl Into<String>) -> EnhanceError {
        EnhanceError::backend_unavailable(tier, reason)
    }

    /// Execution providers for the configured preference
    fn providers(&self, tier: BackendTier) -> Result<Vec<ExecutionProviderDispatch>> {
        let mut providers = Vec::new();
        let want_cuda = matches!(
            self.device.execution_provider,
            ExecutionProvider::Auto | ExecutionProvider::Cuda
        );
        let want_coreml = matches!(
            self.device.execution_provider,
            ExecutionProvider::Auto | ExecutionProvider::CoreMl
        );

        if want_cuda {
            let cuda = CUDAExecutionProvider::default();
            if OrtExecutionProvider::is_available(&cuda).unwrap_or(false) {
                log::info!("🚀 CUDA execution provider is available and will be used");
                providers.push(cuda.build());
            } else {
                log::debug!("CUDA execution provider is not available");
            }
        }
        if want_coreml {
            let coreml = CoreMLExecutionProvider::default();
            if OrtExecutionProvider::is_available(&coreml).unwrap_or(false) {
                log::info!("🍎 CoreML execution provider is available and will be used");
                providers.push(CoreMLExecutionProvider::default().with_subgraphs(true).build());
            } else {
                log::debug!("CoreML execution provider is not available");
            }
        }

        if providers.is_empty() && self.accelerated {
            return Err(Self::unavailable(
                tier,
                format!(
                    "no accelerator for execution provider '{}'",
                    self.device.execution_provider
                ),
            ));
        }
        if providers.is_empty() {
            log::debug!("Using CPU execution provider");
        }
        Ok(providers)
    }

    fn create_session(&self, params: &TierParams) -> Result<Session> {
        let load_start = Instant::now();
        let providers = self.providers(params.tier)?;
        let model_data = self.store.load_bytes(&params.model_id, &params.model)?;

        let intra_threads = if self.device.intra_threads > 0 {
            self.device.intra_threads
        } else {
            std::thread::available_parallelism()
                .map(std::num::NonZero::get)
                .unwrap_or(4)
        };

        let mut builder = Session::builder()
            .map_err(|e| EnhanceError::inference(format!("Failed to create session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| EnhanceError::inference(format!("Failed to set optimization level: {e}")))?;
        if !providers.is_empty() {
            builder = builder.with_execution_providers(providers).map_err(|e| {
                Self::unavailable(params.tier, format!("Failed to set execution providers: {e}"))
            })?;
        }
        let session = builder
            .with_intra_threads(intra_threads)
            .map_err(|e| EnhanceError::inference(format!("Failed to set intra threads: {e}")))?
            .commit_from_memory(&model_data)
            .map_err(|e| EnhanceError::model(format!("Failed to create session from model data: {e}")))?;

        log::info!(
            "📊 Model '{}' loaded for {} in {:.0}ms ({intra_threads} intra-op threads)",
            params.model_id,
            params.tier,
            load_start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(session)
    }
}

impl SuperResolutionBackend for OnnxSuperResolution {
    fn name(&self) -> &str {
        if self.accelerated {
            "onnx-accelerated"
        } else {
            "onnx-cpu"
        }
    }

    fn prepare(&self, params: &TierParams) -> Result<()> {
        self.sessions.ensure(params, || {
            if !self.store.is_available(&params.model_id, &params.model) {
                return Err(Self::unavailable(
                    params.tier,
                    format!("model '{}' ({}) is not installed", params.model_id, params.model.file),
                ));
            }
            self.create_session(params)
        })
    }

    fn upscale_tile(&self, tile: &RgbImage, params: &TierParams) -> Result<RgbImage> {
        self.sessions
            .with_entry(params, |session| Self::run_session(session, tile))
    }
}

impl OnnxSuperResolution {
    #[must_use]
    pub fn cache_stats(&self) -> ModelCacheStats {
        self.sessions.stats()
    }

    fn run_session(session: &mut Session, tile: &RgbImage) -> Result<RgbImage> {
        let inference_start = Instant::now();
        let input = Value::from_array(rgb_to_tensor(tile))
            .map_err(|e| EnhanceError::inference(format!("Failed to convert input tensor: {e}")))?;
        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| EnhanceError::inference(format!("ONNX inference failed: {e}")))?;

        let keys: Vec<_> = outputs.keys().collect();
        let first_key = keys
            .first()
            .ok_or_else(|| EnhanceError::inference("No output tensors found"))?;
        let output = outputs
            .get(first_key)
            .ok_or_else(|| EnhanceError::inference("First output tensor not found"))?
            .try_extract_array::<f32>()
            .map_err(|e| EnhanceError::inference(format!("Failed to extract output tensor: {e}")))?;
        let image = tensor_to_rgb(output)?;

        log::debug!(
            "⚡ Tile {}x{} -> {}x{} in {:.2}ms",
            tile.width(),
            tile.height(),
            image.width(),
            image.height(),
            inference_start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(image)
    }
}
