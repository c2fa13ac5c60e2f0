//! Overlapping-tile execution with linear seam blending

use super::{SuperResolutionBackend, TierParams};
use crate::error::{EnhanceError, Result};
use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use std::ops::Range;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Input ranges of the tiles along one axis.
///
/// Each tile covers a core of `tile - 2 * overlap` pixels plus up to
/// `overlap` pixels of context on either side.
fn tile_spans(length: u32, tile: u32, overlap: u32) -> Vec<Range<u32>> {
    if length <= tile {
        return vec![0..length];
    }
    let step = tile.saturating_sub(2 * overlap).max(1);
    let mut spans = Vec::new();
    let mut core_start = 0;
    while core_start < length {
        let start = core_start.saturating_sub(overlap);
        let end = (core_start + step + overlap).min(length);
        spans.push(start..end);
        core_start += step;
    }
    spans
}

/// Blend weight of output position `p` in a span of `len` pixels whose
/// leading/trailing edges ramp over `ramp` pixels when they are interior
fn ramp_weight(p: u32, len: u32, ramp: u32, ramp_start: bool, ramp_end: bool) -> f32 {
    if ramp == 0 {
        return 1.0;
    }
    let mut weight = 1.0_f32;
    if ramp_start {
        weight = weight.min((p as f32 + 0.5) / ramp as f32);
    }
    if ramp_end {
        weight = weight.min(((len - p) as f32 - 0.5) / ramp as f32);
    }
    weight.clamp(1e-3, 1.0)
}

/// Replicate the last column and row of `tile` out to `side` x `side`
fn pad_to_square(tile: &RgbImage, side: u32) -> RgbImage {
    let (w, h) = tile.dimensions();
    RgbImage::from_fn(side, side, |x, y| {
        *tile.get_pixel(x.min(w.saturating_sub(1)), y.min(h.saturating_sub(1)))
    })
}

/// Run one tile, padded to the tier's square tile shape when the backend
/// compiles per input shape
fn run_tile(
    backend: &dyn SuperResolutionBackend,
    tile: &RgbImage,
    native: u32,
    params: &TierParams,
) -> Result<RgbImage> {
    if !backend.fixed_tile_shape() {
        return run_exact_tile(backend, tile, native, params);
    }
    let (w, h) = tile.dimensions();
    let side = params.tile_size.max(w).max(h);
    if (w, h) == (side, side) {
        return run_exact_tile(backend, tile, native, params);
    }
    let out = run_exact_tile(backend, &pad_to_square(tile, side), native, params)?;
    Ok(imageops::crop_imm(&out, 0, 0, w * native, h * native).to_image())
}

fn run_exact_tile(
    backend: &dyn SuperResolutionBackend,
    tile: &RgbImage,
    native: u32,
    params: &TierParams,
) -> Result<RgbImage> {
    let expected = (tile.width() * native, tile.height() * native);
    let check = |out: RgbImage| -> Result<RgbImage> {
        if out.dimensions() == expected {
            Ok(out)
        } else {
            Err(EnhanceError::inference(format!(
                "{} returned a {}x{} tile, expected {}x{}",
                backend.name(),
                out.width(),
                out.height(),
                expected.0,
                expected.1
            )))
        }
    };

    let out = check(backend.upscale_tile(tile, params)?)?;
    if !params.tta {
        return Ok(out);
    }

    let flipped = imageops::flip_horizontal(tile);
    let mirrored = imageops::flip_horizontal(&check(backend.upscale_tile(&flipped, params)?)?);
    let mut averaged = out;
    for (a, b) in averaged.pixels_mut().zip(mirrored.pixels()) {
        for c in 0..3 {
            a.0[c] = ((u16::from(a.0[c]) + u16::from(b.0[c]) + 1) / 2) as u8;
        }
    }
    Ok(averaged)
}

/// One native-scale pass over `image`, split into overlapping tiles.
///
/// Cancellation is honoured between tiles, never inside one.
///
/// # Errors
/// - Any backend error, unchanged
/// - `Inference` when a tile comes back with the wrong dimensions
/// - `Cancelled` when `cancel` fires between tiles
#[instrument(level = "debug", skip_all, fields(backend = backend.name(), tile = params.tile_size))]
pub fn upscale_tiled(
    backend: &dyn SuperResolutionBackend,
    image: &RgbImage,
    native: u32,
    params: &TierParams,
    cancel: &CancellationToken,
) -> Result<RgbImage> {
    let (width, height) = image.dimensions();
    let (out_w, out_h) = (width * native, height * native);
    let xs = tile_spans(width, params.tile_size, params.overlap);
    let ys = tile_spans(height, params.tile_size, params.overlap);
    debug!(tiles = xs.len() * ys.len(), "Tiling pass");

    if xs.len() == 1 && ys.len() == 1 {
        return run_tile(backend, image, native, params);
    }

    let ramp = params.overlap * native;
    let plane = out_w as usize * out_h as usize;
    let mut accum = vec![0.0_f32; plane * 3];
    let mut weights = vec![0.0_f32; plane];

    for (iy, ys_span) in ys.iter().enumerate() {
        for (ix, xs_span) in xs.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(EnhanceError::Cancelled);
            }
            let tile = imageops::crop_imm(
                image,
                xs_span.start,
                ys_span.start,
                xs_span.end - xs_span.start,
                ys_span.end - ys_span.start,
            )
            .to_image();
            let out = run_tile(backend, &tile, native, params)?;

            let (ox, oy) = (xs_span.start * native, ys_span.start * native);
            let (tw, th) = out.dimensions();
            for (x, y, pixel) in out.enumerate_pixels() {
                let wx = ramp_weight(x, tw, ramp, ix > 0, ix + 1 < xs.len());
                let wy = ramp_weight(y, th, ramp, iy > 0, iy + 1 < ys.len());
                let weight = wx * wy;
                let index = (oy + y) as usize * out_w as usize + (ox + x) as usize;
                if let Some(w) = weights.get_mut(index) {
                    *w += weight;
                }
                for c in 0..3 {
                    if let Some(slot) = accum.get_mut(index * 3 + c) {
                        *slot += f32::from(pixel.0[c]) * weight;
                    }
                }
            }
        }
    }

    Ok(RgbImage::from_fn(out_w, out_h, |x, y| {
        let index = y as usize * out_w as usize + x as usize;
        let weight = weights.get(index).copied().unwrap_or(1.0).max(f32::EPSILON);
        let channel = |c: usize| {
            let value = accum.get(index * 3 + c).copied().unwrap_or(0.0) / weight;
            value.round().clamp(0.0, 255.0) as u8
        };
        Rgb([channel(0), channel(1), channel(2)])
    }))
}

/// Upscale `image` by exactly `scale` on a model tier.
///
/// Runs native passes until the cumulative factor reaches `scale`, then
/// resamples to the exact target when the passes overshoot. A scale of 1
/// needs no pass.
///
/// # Errors
/// As [`upscale_tiled`], plus `Model` for a native scale below 2.
pub fn run_model_tier(
    backend: &dyn SuperResolutionBackend,
    image: &RgbImage,
    scale: u32,
    params: &TierParams,
    cancel: &CancellationToken,
) -> Result<RgbImage> {
    backend.prepare(params)?;
    let native = backend.native_scale(params);
    if native < 2 {
        return Err(EnhanceError::model(format!(
            "model '{}' declares native scale {native}",
            params.model_id
        )));
    }

    let target = (image.width() * scale, image.height() * scale);
    let mut current = image.clone();
    let mut reached = 1_u32;
    while reached < scale {
        if cancel.is_cancelled() {
            return Err(EnhanceError::Cancelled);
        }
        current = upscale_tiled(backend, &current, native, params, cancel)?;
        reached = reached.saturating_mul(native);
    }

    if current.dimensions() != target {
        debug!(
            from = ?current.dimensions(),
            to = ?target,
            "Resampling model output to the requested scale"
        );
        current = imageops::resize(&current, target.0, target.1, FilterType::Lanczos3);
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BackendTier;
    use crate::config::ModelEntry;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Nearest {
        calls: AtomicUsize,
        fixed: bool,
        shapes: Mutex<HashSet<(u32, u32)>>,
    }

    impl SuperResolutionBackend for Nearest {
        fn name(&self) -> &str {
            "nearest"
        }

        fn fixed_tile_shape(&self) -> bool {
            self.fixed
        }

        fn upscale_tile(&self, tile: &RgbImage, _params: &TierParams) -> Result<RgbImage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.shapes.lock().unwrap().insert(tile.dimensions());
            Ok(imageops::resize(
                tile,
                tile.width() * 2,
                tile.height() * 2,
                FilterType::Nearest,
            ))
        }
    }

    fn params(tile_size: u32, overlap: u32) -> TierParams {
        TierParams {
            tier: BackendTier::GeneralCompute,
            model_id: "test".to_string(),
            model: ModelEntry::new("test.onnx", 2),
            tile_size,
            overlap,
            noise_level: 0,
            tta: false,
        }
    }

    fn backend() -> Nearest {
        Nearest {
            calls: AtomicUsize::new(0),
            fixed: false,
            shapes: Mutex::new(HashSet::new()),
        }
    }

    fn fixed_shape_backend() -> Nearest {
        Nearest {
            fixed: true,
            ..backend()
        }
    }

    #[test]
    fn test_spans_cover_the_axis() {
        let spans = tile_spans(100, 32, 4);
        assert_eq!(spans.first().map(|s| s.start), Some(0));
        assert_eq!(spans.last().map(|s| s.end), Some(100));
        for pair in spans.windows(2) {
            assert!(pair[1].start < pair[0].end, "{pair:?} must overlap");
        }
        assert_eq!(tile_spans(20, 32, 4), vec![0..20]);
    }

    #[test]
    fn test_tiled_output_matches_untiled_without_seams() {
        let image = RgbImage::from_fn(70, 45, |x, y| Rgb([(x * 3) as u8, (y * 5) as u8, 7]));
        let whole = backend()
            .upscale_tile(&image, &params(256, 0))
            .unwrap();
        let tiled_backend = backend();
        let tiled = upscale_tiled(&tiled_backend, &image, 2, &params(24, 4), &CancellationToken::new())
            .unwrap();
        assert!(tiled_backend.calls.load(Ordering::SeqCst) > 1);
        assert_eq!(tiled.dimensions(), (140, 90));
        assert_eq!(tiled, whole);
    }

    #[test]
    fn test_fixed_shape_backend_sees_one_tile_shape_for_any_image_size() {
        let b = fixed_shape_backend();
        let p = params(32, 4);
        for (w, h) in [(100, 70), (101, 70), (13, 9), (32, 32)] {
            let image = RgbImage::from_fn(w, h, |x, y| Rgb([(x * 3) as u8, (y * 5) as u8, 11]));
            let out = upscale_tiled(&b, &image, 2, &p, &CancellationToken::new()).unwrap();
            let expected = imageops::resize(&image, w * 2, h * 2, FilterType::Nearest);
            assert_eq!(out, expected, "{w}x{h}");
        }
        assert_eq!(*b.shapes.lock().unwrap(), HashSet::from([(32, 32)]));

        let free = backend();
        upscale_tiled(&free, &RgbImage::new(101, 70), 2, &p, &CancellationToken::new()).unwrap();
        assert!(free.shapes.lock().unwrap().len() > 1);
    }

    #[test]
    fn test_non_power_scale_is_resampled() {
        let image = RgbImage::from_pixel(10, 6, Rgb([9, 9, 9]));
        let out = run_model_tier(&backend(), &image, 3, &params(64, 8), &CancellationToken::new())
            .unwrap();
        assert_eq!(out.dimensions(), (30, 18));
    }

    #[test]
    fn test_scale_one_runs_no_pass() {
        let b = backend();
        let image = RgbImage::from_pixel(5, 5, Rgb([1, 2, 3]));
        let out = run_model_tier(&b, &image, 1, &params(64, 8), &CancellationToken::new()).unwrap();
        assert_eq!(out, image);
        assert_eq!(b.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancelled_between_tiles() {
        let token = CancellationToken::new();
        token.cancel();
        let image = RgbImage::new(100, 100);
        let result = upscale_tiled(&backend(), &image, 2, &params(32, 4), &token);
        assert!(matches!(result, Err(EnhanceError::Cancelled)));
    }
}
