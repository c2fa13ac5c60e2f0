//! Conversion between RGB images and NCHW `f32` tensors in `[0, 1]`

use crate::error::{EnhanceError, Result};
use image::{Rgb, RgbImage};
use ndarray::{Array4, ArrayViewD, Ix4};

/// `1 x 3 x H x W` tensor of an RGB image
#[must_use]
pub fn rgb_to_tensor(image: &RgbImage) -> Array4<f32> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, height, width));
    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = f32::from(pixel.0[c]) / 255.0;
        }
    }
    tensor
}

/// Image from a `1 x 3 x H x W` model output, clamping out-of-range values
///
/// # Errors
/// - `Inference` when the output is not a single 3-channel 4D tensor
pub fn tensor_to_rgb(output: ArrayViewD<'_, f32>) -> Result<RgbImage> {
    let output = output.into_dimensionality::<Ix4>().map_err(|e| {
        EnhanceError::inference(format!("Expected 4D output tensor: {e}"))
    })?;
    let (batch, channels, height, width) = output.dim();
    if batch != 1 || channels != 3 {
        return Err(EnhanceError::inference(format!(
            "Expected output shape [1, 3, H, W], got [{batch}, {channels}, {height}, {width}]"
        )));
    }
    let (w, h) = (
        u32::try_from(width).map_err(|_| EnhanceError::inference("output too wide"))?,
        u32::try_from(height).map_err(|_| EnhanceError::inference("output too tall"))?,
    );
    Ok(RgbImage::from_fn(w, h, |x, y| {
        let (xu, yu) = (x as usize, y as usize);
        let channel = |c: usize| (output[[0, c, yu, xu]] * 255.0).round().clamp(0.0, 255.0) as u8;
        Rgb([channel(0), channel(1), channel(2)])
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_nchw() {
        let image = RgbImage::from_fn(3, 2, |x, y| Rgb([(x * 100) as u8, (y * 255) as u8, 51]));
        let tensor = rgb_to_tensor(&image);
        assert_eq!(tensor.dim(), (1, 3, 2, 3));
        assert!((tensor[[0, 0, 0, 2]] - 200.0 / 255.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 1, 0]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 1, 1]] - 0.2).abs() < 1e-6);

        let back = tensor_to_rgb(tensor.view().into_dyn()).unwrap();
        assert_eq!(back, image);
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let mut tensor = Array4::<f32>::zeros((1, 3, 1, 1));
        tensor[[0, 0, 0, 0]] = 1.7;
        tensor[[0, 1, 0, 0]] = -0.3;
        let image = tensor_to_rgb(tensor.view().into_dyn()).unwrap();
        assert_eq!(image.get_pixel(0, 0).0, [255, 0, 0]);
    }

    #[test]
    fn test_wrong_shapes_are_rejected() {
        let gray = Array4::<f32>::zeros((1, 1, 4, 4));
        assert!(tensor_to_rgb(gray.view().into_dyn()).is_err());
        let flat = ndarray::Array2::<f32>::zeros((4, 4));
        assert!(tensor_to_rgb(flat.view().into_dyn()).is_err());
    }
}
