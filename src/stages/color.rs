use super::{clamp_u8, ProcessingStage, StagePhase};
use crate::analysis::luma;
use crate::config::{ParameterSpec, StageDeclaration, StageParams};
use crate::error::Result;
use crate::types::FeatureVector;
use image::{DynamicImage, Rgb, RgbImage};

/// Saturation and contrast boost.
///
/// Saturation interpolates each channel away from the pixel's own gray level;
/// contrast scales luminance deviations around the image's mean luminance.
/// Colorful images get a gentler saturation boost and drab ones a stronger
/// one, capped at `max_saturation`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColorEnhancementStage;

impl ColorEnhancementStage {
    fn effective_saturation(features: &FeatureVector, params: &StageParams) -> Result<f64> {
        let base = params.f64("saturation")?;
        let factor = if features.color_richness > params.f64("rich_threshold")? {
            params.f64("rich_factor")?
        } else {
            params.f64("poor_factor")?
        };
        Ok((base * factor).min(params.f64("max_saturation")?))
    }
}

impl ProcessingStage for ColorEnhancementStage {
    fn name(&self) -> &str {
        "color_enhancement"
    }

    fn phase(&self) -> StagePhase {
        StagePhase::PostProcess
    }

    fn declaration(&self) -> StageDeclaration {
        StageDeclaration::new(
            1,
            vec![
                ParameterSpec::float("saturation", 1.1, 0.0, 3.0),
                ParameterSpec::float("contrast", 1.05, 0.0, 3.0),
                ParameterSpec::float("min_color_richness", 0.1, 0.0, 1.0),
                ParameterSpec::float("rich_threshold", 0.5, 0.0, 1.0),
                ParameterSpec::float("rich_factor", 0.9, 0.0, 2.0),
                ParameterSpec::float("poor_factor", 1.1, 0.0, 2.0),
                ParameterSpec::float("max_saturation", 1.3, 0.0, 3.0),
            ],
        )
    }

    fn is_applicable(&self, features: &FeatureVector, params: &StageParams) -> Result<bool> {
        Ok(features.color_richness > params.f64("min_color_richness")?)
    }

    fn process(
        &self,
        image: &DynamicImage,
        features: &FeatureVector,
        params: &StageParams,
    ) -> Result<DynamicImage> {
        let saturation = Self::effective_saturation(features, params)? as f32;
        let contrast = params.f64("contrast")? as f32;
        let source = image.to_rgb8();

        let saturated: Vec<[f32; 3]> = source
            .pixels()
            .map(|p| {
                let gray = luma(p.0[0], p.0[1], p.0[2]);
                p.0.map(|c| gray + (f32::from(c) - gray) * saturation)
            })
            .collect();

        let mean = if saturated.is_empty() {
            0.0
        } else {
            let total: f64 = saturated
                .iter()
                .map(|&[r, g, b]| f64::from(0.299 * r + 0.587 * g + 0.114 * b))
                .sum();
            (total / saturated.len() as f64) as f32
        };

        let width = source.width();
        let out = RgbImage::from_fn(width, source.height(), |x, y| {
            let index = y as usize * width as usize + x as usize;
            let [r, g, b] = saturated.get(index).copied().unwrap_or_default();
            let adjust = |c: f32| clamp_u8(mean + (c - mean) * contrast);
            Rgb([adjust(r), adjust(g), adjust(b)])
        });
        Ok(DynamicImage::ImageRgb8(out))
    }
}
