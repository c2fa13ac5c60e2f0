//! Shared fixtures for the integration tests
//!
//! `ScriptedBackend` stands in for a learned model: each instance follows a
//! fixed script so tests can force failures, degenerate output or success on
//! any tier without model files.

#![allow(dead_code)]

use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage, Rgba, RgbaImage};
use imgly_upscale::backends::{StaticResourceProbe, TierParams};
use imgly_upscale::config::{ConfigStore, EngineConfig};
use imgly_upscale::{
    BackendTier, EnhanceError, EnhancementEngine, EnhancementEngineBuilder, MemoryEventSink,
    ResourceSnapshot, Result, SuperResolutionBackend,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What a scripted backend does with every tile
#[derive(Debug, Clone)]
pub enum Script {
    /// Report an inference error
    Fail,
    /// Panic inside the worker
    Panic,
    /// Return an all-black tile of the right size
    Black,
    /// Return a single-color tile of the right size
    Uniform(u8),
    /// Nearest-neighbour resize, which keeps the input texture
    Resize,
    /// Resize after sleeping
    SlowResize(Duration),
    /// Cancel the token, then resize
    CancelThenResize(CancellationToken),
}

#[derive(Debug)]
pub struct ScriptedBackend {
    name: String,
    script: Script,
    calls: AtomicUsize,
    model_files: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(name: &str, script: Script) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script,
            calls: AtomicUsize::new(0),
            model_files: Mutex::new(Vec::new()),
        })
    }

    /// Number of tiles this backend was asked to upscale
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Model file of every tile, in call order
    pub fn model_files(&self) -> Vec<String> {
        self.model_files.lock().unwrap().clone()
    }
}

impl SuperResolutionBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn native_scale(&self, _params: &TierParams) -> u32 {
        2
    }

    fn upscale_tile(&self, tile: &RgbImage, params: &TierParams) -> Result<RgbImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.model_files.lock().unwrap().push(params.model.file.clone());
        let (w, h) = (tile.width() * 2, tile.height() * 2);
        match &self.script {
            Script::Fail => Err(EnhanceError::inference(format!("{} refused the tile", self.name))),
            Script::Panic => panic!("{} crashed", self.name),
            Script::Black => Ok(RgbImage::new(w, h)),
            Script::Uniform(v) => Ok(RgbImage::from_pixel(w, h, Rgb([*v, *v, *v]))),
            Script::Resize => Ok(image::imageops::resize(tile, w, h, FilterType::Nearest)),
            Script::SlowResize(delay) => {
                std::thread::sleep(*delay);
                Ok(image::imageops::resize(tile, w, h, FilterType::Nearest))
            },
            Script::CancelThenResize(token) => {
                token.cancel();
                Ok(image::imageops::resize(tile, w, h, FilterType::Nearest))
            },
        }
    }
}

/// Deterministic image with enough edges and contrast to pass validation
pub fn textured(w: u32, h: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, y| {
        let v = ((x * 7 + y * 13) % 200 + 30) as u8;
        Rgb([v, v.wrapping_add(20), 255 - v])
    }))
}

pub fn gray(w: u32, h: u32, value: u8) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([value, value, value])))
}

pub fn transparent(w: u32, h: u32) -> DynamicImage {
    DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba([0, 0, 0, 0])))
}

/// Engine on a machine with a device, recording events, with one script per model tier
pub fn engine_with(
    scripts: [(BackendTier, Script); 3],
    config: EngineConfig,
    sink: Arc<MemoryEventSink>,
) -> (EnhancementEngine, Vec<Arc<ScriptedBackend>>) {
    let mut backends = Vec::new();
    let mut builder = base_builder(config, ResourceSnapshot::with_device(8192), sink);
    for (tier, script) in scripts {
        let backend = ScriptedBackend::new(tier.config_key(), script);
        builder = builder.backend(tier, Arc::clone(&backend) as Arc<dyn SuperResolutionBackend>);
        backends.push(backend);
    }
    (builder.build().unwrap(), backends)
}

pub fn all_tiers(primary: Script, secondary: Script, general: Script) -> [(BackendTier, Script); 3] {
    [
        (BackendTier::AcceleratedPrimary, primary),
        (BackendTier::AcceleratedSecondary, secondary),
        (BackendTier::GeneralCompute, general),
    ]
}

pub fn base_builder(
    config: EngineConfig,
    snapshot: ResourceSnapshot,
    sink: Arc<MemoryEventSink>,
) -> EnhancementEngineBuilder {
    EnhancementEngine::builder()
        .config_store(Arc::new(ConfigStore::from_config(config).unwrap()))
        .resource_probe(Arc::new(StaticResourceProbe(snapshot)))
        .event_sink(sink)
}
