//! Image feature analyzer

use super::LumaPlane;
use crate::types::FeatureVector;
use image::DynamicImage;
use tracing::{instrument, trace};

/// Sobel magnitude above which a pixel counts as an edge
pub const EDGE_MAGNITUDE_THRESHOLD: f32 = 128.0;

/// Divisor mapping luminance standard deviation to `contrast_score`.
/// A half-black, half-white image scores 1.0.
const CONTRAST_DIVISOR: f64 = 127.5;

/// Four bits per channel
const COLOR_QUANT_SHIFT: u8 = 4;
const COLOR_BINS: usize = 1 << (3 * (8 - COLOR_QUANT_SHIFT));

/// Computes a [`FeatureVector`] from pixel data alone.
///
/// Deterministic and free of I/O: the same image always yields a bit-identical
/// vector. Degenerate inputs (empty, 1x1, thinner than three pixels, uniform)
/// produce `0.0` for every descriptor that needs a neighbourhood or variation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageAnalyzer;

impl ImageAnalyzer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    #[instrument(level = "debug", skip_all, fields(width = image.width(), height = image.height()))]
    #[must_use]
    pub fn analyze(&self, image: &DynamicImage) -> FeatureVector {
        if image.width() == 0 || image.height() == 0 {
            return FeatureVector::default();
        }

        let plane = LumaPlane::from_image(image);
        let features = FeatureVector {
            edge_density: edge_density(&plane),
            contrast_score: plane.mean_std().1 / CONTRAST_DIVISOR,
            noise_estimate: noise_estimate(&plane),
            color_richness: color_richness(image),
        };
        trace!(?features, "Features computed");
        features
    }
}

fn edge_density(plane: &LumaPlane) -> f64 {
    let mut edges = 0_u64;
    plane.for_each_interior(|x, y| {
        if plane.sobel(x, y) > EDGE_MAGNITUDE_THRESHOLD {
            edges += 1;
        }
    });
    (edges as f64 / plane.len() as f64).clamp(0.0, 1.0)
}

fn noise_estimate(plane: &LumaPlane) -> f64 {
    let (mut count, mut sum_sq) = (0_u64, 0.0_f64);
    plane.for_each_interior(|x, y| {
        let residual = f64::from(plane.at(x, y) - plane.mean3x3(x, y));
        sum_sq += residual * residual;
        count += 1;
    });
    if count == 0 {
        return 0.0;
    }
    (sum_sq / count as f64).sqrt() / 255.0
}

#[allow(clippy::indexing_slicing)] // bin index is built from 4-bit components
fn color_richness(image: &DynamicImage) -> f64 {
    let rgb = image.to_rgb8();
    let mut seen = vec![false; COLOR_BINS];
    let mut distinct = 0_usize;
    for pixel in rgb.pixels() {
        let [r, g, b] = pixel.0;
        let bin = (usize::from(r >> COLOR_QUANT_SHIFT) << 8)
            | (usize::from(g >> COLOR_QUANT_SHIFT) << 4)
            | usize::from(b >> COLOR_QUANT_SHIFT);
        if !seen[bin] {
            seen[bin] = true;
            distinct += 1;
        }
    }

    let pixels = rgb.width() as usize * rgb.height() as usize;
    let maximum = pixels.min(COLOR_BINS);
    if maximum <= 1 {
        return 0.0;
    }
    ((distinct.saturating_sub(1)) as f64 / (maximum - 1) as f64).clamp(0.0, 1.0)
}
