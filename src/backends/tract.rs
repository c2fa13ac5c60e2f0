//! Tract super-resolution backend
//!
//! Pure Rust CPU inference with no native dependencies. Tract optimizes a
//! graph for a fixed input shape, so the backend asks for square tiles of the
//! tier's tile size and caches one runnable plan per model slot and tile
//! size.

use super::{
    rgb_to_tensor, tensor_to_rgb, ModelCache, ModelCacheStats, ModelStore, SuperResolutionBackend,
    TierParams,
};
use crate::error::{EnhanceError, Result};
use image::RgbImage;
use instant::Instant;
use std::collections::HashMap;
use std::sync::Arc;
use tract_onnx::prelude::*;

/// Type alias for the optimized, runnable Tract plan
type TractModel = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Plans of one model slot by input `(width, height)`
type Plans = HashMap<(u32, u32), Arc<TractModel>>;

/// Tract backend for the general compute tier
#[derive(Debug)]
pub struct TractSuperResolution {
    store: ModelStore,
    models: ModelCache<InferenceModel>,
    plans: ModelCache<Plans>,
}

impl TractSuperResolution {
    #[must_use]
    pub fn new(store: ModelStore) -> Self {
        Self {
            store,
            models: ModelCache::new(),
            plans: ModelCache::new(),
        }
    }

    /// Tract only ever runs on the CPU
    #[must_use]
    pub fn list_providers() -> Vec<(String, bool, String)> {
        vec![(
            "CPU".to_string(),
            true,
            "Pure Rust CPU inference with no external dependencies".to_string(),
        )]
    }

    /// Number of compiled plans across all model slots
    #[must_use]
    pub fn plan_count(&self) -> usize {
        self.plans.total(HashMap::len)
    }

    #[must_use]
    pub fn model_cache_stats(&self) -> ModelCacheStats {
        self.models.stats()
    }

    fn plan(&self, params: &TierParams, width: u32, height: u32) -> Result<Arc<TractModel>> {
        let key = (width, height);
        if let Some(plan) = self
            .plans
            .with_entry(params, |plans| Ok(plans.get(&key).cloned()))?
        {
            return Ok(plan);
        }

        let model = self.models.with_entry(params, |model| Ok(model.clone()))?;
        let optimize_start = Instant::now();
        let plan = model
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, height as usize, width as usize)),
            )
            .map_err(|e| EnhanceError::model(format!("Failed to set input shape: {e}")))?
            .into_optimized()
            .map_err(|e| EnhanceError::model(format!("Failed to optimize model: {e}")))?
            .into_runnable()
            .map_err(|e| EnhanceError::model(format!("Failed to create runnable model: {e}")))?;
        log::debug!(
            "🔧 Tract plan for '{}' at {width}x{height} built in {}ms",
            params.model.file,
            optimize_start.elapsed().as_millis()
        );

        let plan = Arc::new(plan);
        self.plans.with_entry(params, |plans| {
            plans.insert(key, Arc::clone(&plan));
            Ok(())
        })?;
        Ok(plan)
    }
}

impl SuperResolutionBackend for TractSuperResolution {
    fn name(&self) -> &str {
        "tract"
    }

    fn fixed_tile_shape(&self) -> bool {
        true
    }

    fn prepare(&self, params: &TierParams) -> Result<()> {
        self.models.ensure(params, || {
            if !self.store.is_available(&params.model_id, &params.model) {
                return Err(EnhanceError::backend_unavailable(
                    params.tier,
                    format!("model '{}' ({}) is not installed", params.model_id, params.model.file),
                ));
            }

            let data = self.store.load_bytes(&params.model_id, &params.model)?;
            log::info!("🚀 Loading '{}' into Tract (Pure Rust)", params.model.file);
            onnx()
                .model_for_read(&mut std::io::Cursor::new(data))
                .map_err(|e| EnhanceError::model(format!("Failed to load ONNX model: {e}")))
        })?;
        // Plans follow the model: a replaced model starts with no plans
        self.plans.ensure(params, || Ok(Plans::new()))
    }

    fn upscale_tile(&self, tile: &RgbImage, params: &TierParams) -> Result<RgbImage> {
        let plan = self.plan(params, tile.width(), tile.height())?;
        let inference_start = Instant::now();

        let input = Tensor::from(rgb_to_tensor(tile));
        let outputs = plan
            .run(tvec![input.into()])
            .map_err(|e| EnhanceError::inference(format!("Tract inference failed: {e}")))?;
        let output = outputs
            .into_iter()
            .next()
            .ok_or_else(|| EnhanceError::inference("No output tensor found"))?
            .into_arc_tensor();
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| EnhanceError::inference(format!("Failed to convert output tensor: {e}")))?;
        let image = tensor_to_rgb(view)?;

        log::debug!(
            "✅ Tract tile {}x{} in {:.2}ms",
            tile.width(),
            tile.height(),
            inference_start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BackendTier;
    use crate::config::ModelEntry;
    use tempfile::TempDir;

    fn params(file: &str) -> TierParams {
        TierParams {
            tier: BackendTier::GeneralCompute,
            model_id: "m".to_string(),
            model: ModelEntry::new(file, 2),
            tile_size: 64,
            overlap: 4,
            noise_level: 0,
            tta: false,
        }
    }

    #[test]
    fn test_missing_model_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let backend = TractSuperResolution::new(ModelStore::new(dir.path()));
        assert!(matches!(
            backend.prepare(&params("missing.onnx")),
            Err(EnhanceError::BackendUnavailable { .. })
        ));
    }

    #[test]
    fn test_garbage_model_is_a_model_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("garbage.onnx"), b"not a protobuf").unwrap();
        let backend = TractSuperResolution::new(ModelStore::new(dir.path()));
        assert!(matches!(
            backend.prepare(&params("garbage.onnx")),
            Err(EnhanceError::Model(_))
        ));
    }

    #[test]
    fn test_failed_prepare_caches_nothing() {
        let dir = TempDir::new().unwrap();
        let backend = TractSuperResolution::new(ModelStore::new(dir.path()));
        let _ = backend.prepare(&params("missing.onnx"));
        assert_eq!(backend.model_cache_stats().entries, 0);
        assert_eq!(backend.plan_count(), 0);
        assert!(backend.fixed_tile_shape());
        assert!(backend
            .upscale_tile(&RgbImage::new(64, 64), &params("missing.onnx"))
            .is_err());
    }

    #[test]
    fn test_providers() {
        assert_eq!(TractSuperResolution::list_providers().len(), 1);
    }
}
