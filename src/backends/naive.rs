use crate::config::NaiveConfig;
use image::{imageops, DynamicImage, RgbImage};

/// Geometric resampling used as the terminal tier.
///
/// Never fails and never consults a model; the only input is the filter
/// from `backends.naive_fallback`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaiveUpscaler {
    config: NaiveConfig,
}

impl NaiveUpscaler {
    #[must_use]
    pub fn new(config: NaiveConfig) -> Self {
        Self { config }
    }

    /// Resize to exactly `target`
    #[must_use]
    pub fn upscale(&self, image: &RgbImage, target: (u32, u32)) -> RgbImage {
        if image.dimensions() == target {
            return image.clone();
        }
        imageops::resize(image, target.0, target.1, self.config.filter.into())
    }

    #[must_use]
    pub fn upscale_dynamic(&self, image: &DynamicImage, target: (u32, u32)) -> DynamicImage {
        DynamicImage::ImageRgb8(self.upscale(&image.to_rgb8(), target))
    }
}
