//! Image measurements: feature extraction and quality scoring
//!
//! Both components are pure functions of their inputs. They share a luminance
//! plane representation and a handful of 3x3 neighbourhood helpers.

mod features;
mod quality;

pub use features::{ImageAnalyzer, EDGE_MAGNITUDE_THRESHOLD};
pub use quality::QualityScorer;

use image::DynamicImage;

/// BT.601 luma of an 8-bit RGB triple
#[inline]
pub(crate) fn luma(r: u8, g: u8, b: u8) -> f32 {
    0.299 * f32::from(r) + 0.587 * f32::from(g) + 0.114 * f32::from(b)
}

/// Row-major luminance samples in `[0, 255]`
#[derive(Debug, Clone)]
pub(crate) struct LumaPlane {
    pub(crate) width: usize,
    pub(crate) height: usize,
    pub(crate) data: Vec<f32>,
}

impl LumaPlane {
    /// Alpha is ignored; colour channels are read as stored
    pub(crate) fn from_image(image: &DynamicImage) -> Self {
        let rgb = image.to_rgb8();
        let (width, height) = (rgb.width() as usize, rgb.height() as usize);
        let data = rgb.pixels().map(|p| luma(p.0[0], p.0[1], p.0[2])).collect();
        Self {
            width,
            height,
            data,
        }
    }

    #[inline]
    #[allow(clippy::indexing_slicing)] // callers stay inside the plane
    pub(crate) fn at(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    /// True when a 3x3 neighbourhood fits at least once
    pub(crate) fn has_interior(&self) -> bool {
        self.width >= 3 && self.height >= 3
    }

    /// Calls `f(x, y)` for every pixel with a full 3x3 neighbourhood
    pub(crate) fn for_each_interior(&self, mut f: impl FnMut(usize, usize)) {
        if !self.has_interior() {
            return;
        }
        for y in 1..self.height - 1 {
            for x in 1..self.width - 1 {
                f(x, y);
            }
        }
    }

    /// 3x3 Sobel gradient magnitude at an interior pixel
    pub(crate) fn sobel(&self, x: usize, y: usize) -> f32 {
        let p = |dx: usize, dy: usize| self.at(x + dx - 1, y + dy - 1);
        let gx = (p(2, 0) + 2.0 * p(2, 1) + p(2, 2)) - (p(0, 0) + 2.0 * p(0, 1) + p(0, 2));
        let gy = (p(0, 2) + 2.0 * p(1, 2) + p(2, 2)) - (p(0, 0) + 2.0 * p(1, 0) + p(2, 0));
        (gx * gx + gy * gy).sqrt()
    }

    /// Mean of the 3x3 neighbourhood at an interior pixel
    pub(crate) fn mean3x3(&self, x: usize, y: usize) -> f32 {
        let mut sum = 0.0;
        for dy in 0..3 {
            for dx in 0..3 {
                sum += self.at(x + dx - 1, y + dy - 1);
            }
        }
        sum / 9.0
    }

    /// 4-neighbour Laplacian at an interior pixel
    pub(crate) fn laplacian(&self, x: usize, y: usize) -> f32 {
        self.at(x - 1, y) + self.at(x + 1, y) + self.at(x, y - 1) + self.at(x, y + 1)
            - 4.0 * self.at(x, y)
    }

    /// Population mean and standard deviation; `(0, 0)` when empty
    pub(crate) fn mean_std(&self) -> (f64, f64) {
        mean_std(self.data.iter().map(|&v| f64::from(v)))
    }
}

/// Population mean and standard deviation of a sample stream
pub(crate) fn mean_std(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (mut count, mut sum, mut sum_sq) = (0_u64, 0.0_f64, 0.0_f64);
    for v in values {
        count += 1;
        sum += v;
        sum_sq += v * v;
    }
    if count == 0 {
        return (0.0, 0.0);
    }
    let n = count as f64;
    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0);
    (mean, variance.sqrt())
}
