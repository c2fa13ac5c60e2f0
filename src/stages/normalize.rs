//! Normalization to opaque 8-bit RGB

use super::{ProcessingStage, StagePhase};
use crate::config::{EngineConfig, ParameterSpec, StageDeclaration, StageParams};
use crate::error::{EnhanceError, Result};
use crate::types::{ContentHint, FeatureVector};
use image::{DynamicImage, Rgb, RgbImage};

/// Flattens alpha onto a solid background and converts every layout and bit
/// depth to 8-bit RGB, which is what every later stage and backend expects.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeStage;

impl NormalizeStage {
    fn background(params: &StageParams) -> Result<[u8; 3]> {
        let channel = |name: &str| -> Result<u8> {
            let value = params.u32(name)?;
            u8::try_from(value).map_err(|_| {
                EnhanceError::stage("normalize", format!("{name} {value} exceeds 255"))
            })
        };
        Ok([
            channel("background_r")?,
            channel("background_g")?,
            channel("background_b")?,
        ])
    }
}

impl ProcessingStage for NormalizeStage {
    fn name(&self) -> &str {
        "normalize"
    }

    fn phase(&self) -> StagePhase {
        StagePhase::Normalize
    }

    fn declaration(&self) -> StageDeclaration {
        StageDeclaration::new(
            1,
            vec![
                ParameterSpec::int("background_r", 255, 0, 255)
                    .describe("Red channel of the background transparent pixels are composited onto"),
                ParameterSpec::int("background_g", 255, 0, 255),
                ParameterSpec::int("background_b", 255, 0, 255),
            ],
        )
    }

    fn process(
        &self,
        image: &DynamicImage,
        _features: &FeatureVector,
        params: &StageParams,
    ) -> Result<DynamicImage> {
        Ok(DynamicImage::ImageRgb8(flatten_onto(image, Self::background(params)?)))
    }
}

/// Composite `image` onto `background` and convert it to 8-bit RGB.
#[must_use]
pub fn flatten_onto(image: &DynamicImage, background: [u8; 3]) -> RgbImage {
    if let DynamicImage::ImageRgb8(rgb) = image {
        return rgb.clone();
    }
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }

    let background = background.map(f32::from);
    let rgba = image.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let alpha = f32::from(a) / 255.0;
        let blend = |c: u8, bg: f32| super::clamp_u8(f32::from(c) * alpha + bg * (1.0 - alpha));
        Rgb([
            blend(r, background[0]),
            blend(g, background[1]),
            blend(b, background[2]),
        ])
    })
}

/// Make sure the backends receive opaque 8-bit RGB when the normalize stage
/// was disabled or skipped.
///
/// Uses the normalize stage's configured background, or white when that
/// cannot be read. Returns whether a composite was needed.
#[must_use]
pub fn ensure_opaque(image: DynamicImage, config: &EngineConfig, hint: ContentHint) -> (RgbImage, bool) {
    match image {
        DynamicImage::ImageRgb8(rgb) => (rgb, false),
        other => {
            let background = config
                .stage("normalize")
                .map(|stage| stage.resolve("normalize", hint))
                .and_then(|params| NormalizeStage::background(&params).ok())
                .unwrap_or([255; 3]);
            (flatten_onto(&other, background), true)
        },
    }
}
