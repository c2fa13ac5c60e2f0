//! Contrast-limited adaptive histogram equalization on luminance

use super::{clamp_u8, ProcessingStage, StagePhase};
use crate::analysis::luma;
use crate::config::{ParamValue, ParameterSpec, StageDeclaration, StageParams};
use crate::error::Result;
use crate::types::{ContentHint, FeatureVector};
use image::{DynamicImage, Rgb, RgbImage};

/// Equalizes local luminance histograms on a `tile_grid x tile_grid` grid,
/// clipping each histogram at `clip_limit` times its mean bin height and
/// interpolating bilinearly between neighbouring tile mappings.
///
/// Chroma is preserved by shifting all three channels by the luminance delta.
/// Images that already have strong global contrast get a reduced clip limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct HistogramEqualizationStage;

struct TileMaps {
    tiles_x: usize,
    tiles_y: usize,
    tile_w: usize,
    tile_h: usize,
    luts: Vec<[f32; 256]>,
}

impl TileMaps {
    #[allow(clippy::indexing_slicing)] // histogram bins are indexed by u8 values
    fn build(levels: &[u8], width: usize, height: usize, grid: usize, clip_limit: f64) -> Self {
        let tiles_x = grid.min(width).max(1);
        let tiles_y = grid.min(height).max(1);
        let tile_w = width.div_ceil(tiles_x);
        let tile_h = height.div_ceil(tiles_y);

        let mut luts = Vec::with_capacity(tiles_x * tiles_y);
        for ty in 0..tiles_y {
            for tx in 0..tiles_x {
                let x_range = (tx * tile_w).min(width)..((tx + 1) * tile_w).min(width);
                let y_range = (ty * tile_h).min(height)..((ty + 1) * tile_h).min(height);

                let mut histogram = [0_u32; 256];
                let mut count = 0_u32;
                for y in y_range.clone() {
                    for x in x_range.clone() {
                        histogram[usize::from(levels[y * width + x])] += 1;
                        count += 1;
                    }
                }
                luts.push(equalization_lut(&mut histogram, count, clip_limit));
            }
        }

        Self {
            tiles_x,
            tiles_y,
            tile_w,
            tile_h,
            luts,
        }
    }

    /// Bilinear blend of the four nearest tile mappings
    #[allow(clippy::indexing_slicing)] // tile coordinates are clamped to the grid
    fn map(&self, x: usize, y: usize, level: u8) -> f32 {
        let locate = |pos: usize, size: usize, count: usize| -> (usize, usize, f32) {
            let centre = (pos as f32 + 0.5) / size as f32 - 0.5;
            if centre <= 0.0 {
                return (0, 0, 0.0);
            }
            let low = (centre.floor() as usize).min(count - 1);
            let high = (low + 1).min(count - 1);
            (low, high, (centre - low as f32).clamp(0.0, 1.0))
        };
        let (x0, x1, ax) = locate(x, self.tile_w, self.tiles_x);
        let (y0, y1, ay) = locate(y, self.tile_h, self.tiles_y);
        let v = usize::from(level);
        let lut = |tx: usize, ty: usize| self.luts[ty * self.tiles_x + tx][v];

        let top = lut(x0, y0) * (1.0 - ax) + lut(x1, y0) * ax;
        let bottom = lut(x0, y1) * (1.0 - ax) + lut(x1, y1) * ax;
        top * (1.0 - ay) + bottom * ay
    }
}

/// Clip, redistribute the excess evenly, and integrate into a mapping
#[allow(clippy::indexing_slicing)]
fn equalization_lut(histogram: &mut [u32; 256], count: u32, clip_limit: f64) -> [f32; 256] {
    let mut lut = [0.0_f32; 256];
    if count == 0 {
        for (i, slot) in lut.iter_mut().enumerate() {
            *slot = i as f32;
        }
        return lut;
    }

    let clip = ((clip_limit * f64::from(count) / 256.0).ceil() as u32).max(1);
    let mut excess = 0_u32;
    for bin in histogram.iter_mut() {
        if *bin > clip {
            excess += *bin - clip;
            *bin = clip;
        }
    }
    let share = excess / 256;
    let remainder = (excess % 256) as usize;
    for (i, bin) in histogram.iter_mut().enumerate() {
        *bin += share + u32::from(i < remainder);
    }

    let mut cumulative = 0_u32;
    for (i, bin) in histogram.iter().enumerate() {
        cumulative += bin;
        lut[i] = cumulative as f32 * 255.0 / count as f32;
    }
    lut
}

impl ProcessingStage for HistogramEqualizationStage {
    fn name(&self) -> &str {
        "histogram_equalization"
    }

    fn phase(&self) -> StagePhase {
        StagePhase::PreProcess
    }

    fn declaration(&self) -> StageDeclaration {
        StageDeclaration::new(
            1,
            vec![
                ParameterSpec::float("clip_limit", 2.0, 0.01, 40.0)
                    .describe("Histogram clip height as a multiple of the mean bin height"),
                ParameterSpec::int("tile_grid", 8, 1, 64),
                ParameterSpec::float("high_contrast_threshold", 0.6, 0.0, 2.0),
                ParameterSpec::float("high_contrast_factor", 0.5, 0.05, 1.0),
            ],
        )
        .with_profile(ContentHint::Photo, [("clip_limit", ParamValue::Float(1.5))])
        .with_profile(ContentHint::Document, [("clip_limit", ParamValue::Float(3.0))])
    }

    fn is_applicable(&self, features: &FeatureVector, _params: &StageParams) -> Result<bool> {
        Ok(features.contrast_score > 0.0)
    }

    #[allow(clippy::indexing_slicing)]
    fn process(
        &self,
        image: &DynamicImage,
        features: &FeatureVector,
        params: &StageParams,
    ) -> Result<DynamicImage> {
        let mut clip_limit = params.f64("clip_limit")?;
        if features.contrast_score > params.f64("high_contrast_threshold")? {
            clip_limit *= params.f64("high_contrast_factor")?;
        }
        let grid = params.u32("tile_grid")? as usize;

        let rgb = image.to_rgb8();
        let (width, height) = (rgb.width() as usize, rgb.height() as usize);
        if width == 0 || height == 0 {
            return Ok(DynamicImage::ImageRgb8(rgb));
        }

        let luminance: Vec<f32> = rgb.pixels().map(|p| luma(p.0[0], p.0[1], p.0[2])).collect();
        let levels: Vec<u8> = luminance.iter().map(|&y| clamp_u8(y)).collect();
        let maps = TileMaps::build(&levels, width, height, grid, clip_limit);

        let out = RgbImage::from_fn(rgb.width(), rgb.height(), |x, y| {
            let (xu, yu) = (x as usize, y as usize);
            let index = yu * width + xu;
            let delta = maps.map(xu, yu, levels[index]) - luminance[index];
            let [r, g, b] = rgb.get_pixel(x, y).0;
            Rgb([
                clamp_u8(f32::from(r) + delta),
                clamp_u8(f32::from(g) + delta),
                clamp_u8(f32::from(b) + delta),
            ])
        });
        Ok(DynamicImage::ImageRgb8(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ImageAnalyzer;

    fn run(image: &DynamicImage, hint: ContentHint) -> DynamicImage {
        let stage = HistogramEqualizationStage;
        let params = stage
            .declaration()
            .default_config()
            .resolve(stage.name(), hint);
        let features = ImageAnalyzer::new().analyze(image);
        stage.process(image, &features, &params).unwrap()
    }

    fn luma_range(image: &DynamicImage) -> (u8, u8) {
        let gray = image.to_luma8();
        let min = gray.pixels().map(|p| p.0[0]).min().unwrap();
        let max = gray.pixels().map(|p| p.0[0]).max().unwrap();
        (min, max)
    }

    #[test]
    fn test_low_contrast_image_is_stretched() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(64, 64, |x, y| {
            let v = 100 + ((x + y) % 20) as u8;
            Rgb([v, v, v])
        }));
        let (before_min, before_max) = luma_range(&image);
        let (after_min, after_max) = luma_range(&run(&image, ContentHint::Document));
        assert!(after_max - after_min > before_max - before_min);
    }

    #[test]
    fn test_dimensions_are_preserved_for_odd_sizes() {
        for (w, h) in [(1, 1), (3, 17), (65, 9)] {
            let image = DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, y| {
                Rgb([(x * 13) as u8, (y * 7) as u8, 90])
            }));
            let out = run(&image, ContentHint::Photo);
            assert_eq!((out.width(), out.height()), (w, h));
        }
    }

    #[test]
    fn test_lut_of_empty_tile_is_identity() {
        let mut histogram = [0_u32; 256];
        let lut = equalization_lut(&mut histogram, 0, 2.0);
        assert!((lut[77] - 77.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_not_applicable_to_flat_images() {
        let stage = HistogramEqualizationStage;
        let params = stage.declaration().default_config().resolve(stage.name(), ContentHint::Photo);
        assert!(!stage.is_applicable(&FeatureVector::default(), &params).unwrap());
    }
}
