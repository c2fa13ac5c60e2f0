use super::{clamp_u8, ProcessingStage, StagePhase};
use crate::config::{ParamValue, ParameterSpec, StageDeclaration, StageParams};
use crate::error::Result;
use crate::types::{ContentHint, FeatureVector};
use image::{imageops, DynamicImage, RgbImage};

/// Unsharp mask: `out = src + strength * (src - blur(src))`.
///
/// Strength backs off on images that are already edge-dense or noisy, since
/// amplifying either mostly amplifies artifacts.
#[derive(Debug, Clone, Copy, Default)]
pub struct SharpeningStage;

impl SharpeningStage {
    fn effective_strength(features: &FeatureVector, params: &StageParams) -> Result<f64> {
        let mut strength = params.f64("base_strength")?;
        if features.edge_density > params.f64("high_edge_threshold")? {
            strength *= params.f64("high_edge_factor")?;
        }
        if features.noise_estimate > params.f64("high_noise_threshold")? {
            strength *= params.f64("high_noise_factor")?;
        }
        Ok(strength)
    }
}

impl ProcessingStage for SharpeningStage {
    fn name(&self) -> &str {
        "sharpening"
    }

    fn phase(&self) -> StagePhase {
        StagePhase::PreProcess
    }

    fn declaration(&self) -> StageDeclaration {
        StageDeclaration::new(
            1,
            vec![
                ParameterSpec::float("base_strength", 1.2, 0.0, 5.0),
                ParameterSpec::float("radius", 1.0, 0.1, 10.0).describe("Gaussian sigma of the blur"),
                ParameterSpec::float("max_edge_density", 0.3, 0.0, 1.0)
                    .describe("Images with more edges than this are left alone"),
                ParameterSpec::float("high_edge_threshold", 0.15, 0.0, 1.0),
                ParameterSpec::float("high_edge_factor", 0.8, 0.0, 1.0),
                ParameterSpec::float("high_noise_threshold", 0.03, 0.0, 1.0),
                ParameterSpec::float("high_noise_factor", 0.6, 0.0, 1.0),
            ],
        )
        .with_profile(ContentHint::Document, [("base_strength", ParamValue::Float(1.4))])
    }

    fn is_applicable(&self, features: &FeatureVector, params: &StageParams) -> Result<bool> {
        Ok(features.edge_density < params.f64("max_edge_density")?)
    }

    fn process(
        &self,
        image: &DynamicImage,
        features: &FeatureVector,
        params: &StageParams,
    ) -> Result<DynamicImage> {
        let strength = Self::effective_strength(features, params)? as f32;
        let radius = params.f64("radius")? as f32;
        let source = image.to_rgb8();
        if strength == 0.0 || source.width() < 2 || source.height() < 2 {
            return Ok(DynamicImage::ImageRgb8(source));
        }

        let blurred = imageops::blur(&source, radius);
        let mut out = RgbImage::new(source.width(), source.height());
        for ((dst, src), low) in out.pixels_mut().zip(source.pixels()).zip(blurred.pixels()) {
            for c in 0..3 {
                let original = f32::from(src.0[c]);
                let detail = original - f32::from(low.0[c]);
                dst.0[c] = clamp_u8(original + strength * detail);
            }
        }
        Ok(DynamicImage::ImageRgb8(out))
    }
}
