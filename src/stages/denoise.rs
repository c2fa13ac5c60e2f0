use super::{clamp_u8, ProcessingStage, StagePhase};
use crate::analysis::LumaPlane;
use crate::config::{ParameterSpec, StageDeclaration, StageParams};
use crate::error::Result;
use crate::types::FeatureVector;
use image::{imageops, DynamicImage, RgbImage};

/// Sobel magnitude of a 3x3 neighbourhood can reach `4 * sqrt(2) * 255`
const MAX_SOBEL: f32 = 1442.5;

/// Edge-aware smoothing run after super-resolution.
///
/// The image is blurred with `sigma = strength / 4`, then each pixel is
/// mixed between the blurred and original values. Pixels whose normalized
/// gradient exceeds `edge_preservation` keep `edge_blend` of the original.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoiseReductionStage;

impl ProcessingStage for NoiseReductionStage {
    fn name(&self) -> &str {
        "noise_reduction"
    }

    fn phase(&self) -> StagePhase {
        StagePhase::PostProcess
    }

    fn declaration(&self) -> StageDeclaration {
        StageDeclaration::new(
            1,
            vec![
                ParameterSpec::int("strength", 6, 1, 30),
                ParameterSpec::float("min_noise", 0.02, 0.0, 1.0)
                    .describe("Noise estimate below which the stage is skipped"),
                ParameterSpec::float("edge_preservation", 0.1, 0.0, 1.0),
                ParameterSpec::float("edge_blend", 0.7, 0.0, 1.0),
            ],
        )
    }

    fn is_applicable(&self, features: &FeatureVector, params: &StageParams) -> Result<bool> {
        Ok(features.noise_estimate > params.f64("min_noise")?)
    }

    fn process(
        &self,
        image: &DynamicImage,
        _features: &FeatureVector,
        params: &StageParams,
    ) -> Result<DynamicImage> {
        let sigma = params.u32("strength")? as f32 * 0.25;
        let edge_threshold = params.f64("edge_preservation")? as f32;
        let edge_blend = params.f64("edge_blend")? as f32;

        let source = image.to_rgb8();
        if source.width() < 3 || source.height() < 3 {
            return Ok(DynamicImage::ImageRgb8(source));
        }

        let smoothed = imageops::blur(&source, sigma);
        let plane = LumaPlane::from_image(image);
        let mut out = RgbImage::new(source.width(), source.height());
        for (x, y, dst) in out.enumerate_pixels_mut() {
            let (xu, yu) = (x as usize, y as usize);
            let interior = xu > 0 && yu > 0 && xu + 1 < plane.width && yu + 1 < plane.height;
            let edge = interior && plane.sobel(xu, yu) / MAX_SOBEL > edge_threshold;
            let keep = if edge { edge_blend } else { 0.0 };

            let src = source.get_pixel(x, y).0;
            let low = smoothed.get_pixel(x, y).0;
            for c in 0..3 {
                dst.0[c] = clamp_u8(f32::from(src[c]) * keep + f32::from(low[c]) * (1.0 - keep));
            }
        }
        Ok(DynamicImage::ImageRgb8(out))
    }
}
