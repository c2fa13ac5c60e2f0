//! Image file loading and saving
//!
//! The engine works on decoded buffers; this service is the file boundary
//! used by the CLI and by callers that start from paths.

use crate::error::{EnhanceError, Result};
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Encodings the service can write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
    #[cfg(feature = "webp-support")]
    WebP,
    Tiff,
}

impl OutputFormat {
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            #[cfg(feature = "webp-support")]
            Self::WebP => "webp",
            Self::Tiff => "tiff",
        }
    }

    fn image_format(self) -> ImageFormat {
        match self {
            Self::Png => ImageFormat::Png,
            Self::Jpeg => ImageFormat::Jpeg,
            #[cfg(feature = "webp-support")]
            Self::WebP => ImageFormat::WebP,
            Self::Tiff => ImageFormat::Tiff,
        }
    }

    /// Format implied by a path's extension
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            #[cfg(feature = "webp-support")]
            "webp" => Some(Self::WebP),
            "tif" | "tiff" => Some(Self::Tiff),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = EnhanceError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_path(Path::new(&format!("x.{s}"))).ok_or_else(|| {
            EnhanceError::invalid_request(format!("unsupported output format '{s}'"))
        })
    }
}

/// File boundary of the engine
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageIoService;

impl ImageIoService {
    /// Decode an image, falling back to content sniffing when the extension
    /// is missing or wrong
    pub fn load_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(EnhanceError::file_io_error(
                "read image file",
                path,
                &std::io::Error::new(std::io::ErrorKind::NotFound, "file does not exist"),
            ));
        }

        match image::open(path) {
            Ok(image) => Ok(image),
            Err(by_extension) => {
                log::debug!(
                    "Extension-based decoding failed for {}: {by_extension}; sniffing content",
                    path.display()
                );
                let data = std::fs::read(path)
                    .map_err(|e| EnhanceError::file_io_error("read image data", path, &e))?;
                Ok(image::load_from_memory(&data)?)
            },
        }
    }

    /// Encode `image` to `path`, creating parent directories. JPEG output
    /// drops the alpha channel.
    pub fn save_image<P: AsRef<Path>>(
        image: &DynamicImage,
        path: P,
        format: OutputFormat,
    ) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| EnhanceError::file_io_error("create output directory", parent, &e))?;
        }

        let encoded = match format {
            OutputFormat::Jpeg if image.color().has_alpha() => {
                DynamicImage::ImageRgb8(image.to_rgb8()).save_with_format(path, format.image_format())
            },
            _ => image.save_with_format(path, format.image_format()),
        };
        encoded?;
        log::debug!("💾 Saved {} ({format})", path.display());
        Ok(())
    }

    /// `<stem>_x<scale>.<ext>` next to the input, or inside `output_dir`
    #[must_use]
    pub fn output_path(
        input: &Path,
        output_dir: Option<&Path>,
        scale: u32,
        format: OutputFormat,
    ) -> PathBuf {
        let stem = input
            .file_stem()
            .map_or_else(|| "image".into(), |s| s.to_string_lossy());
        let file_name = format!("{stem}_x{scale}.{}", format.extension());
        match output_dir {
            Some(dir) => dir.join(file_name),
            None => input.with_file_name(file_name),
        }
    }

    /// Whether `path` has an extension the loader handles
    #[must_use]
    pub fn is_supported_input(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| {
                matches!(
                    e.to_ascii_lowercase().as_str(),
                    "png" | "jpg" | "jpeg" | "webp" | "tif" | "tiff" | "bmp"
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use tempfile::TempDir;

    #[test]
    fn test_round_trip_png_with_wrong_extension() {
        let dir = TempDir::new().unwrap();
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 3, Rgba([1, 2, 3, 4])));
        let written = dir.path().join("nested/out.png");
        ImageIoService::save_image(&image, &written, OutputFormat::Png).unwrap();

        let renamed = dir.path().join("mislabeled.jpg");
        std::fs::rename(&written, &renamed).unwrap();
        let loaded = ImageIoService::load_image(&renamed).unwrap();
        assert_eq!(loaded.to_rgba8(), image.to_rgba8());
    }

    #[test]
    fn test_jpeg_drops_alpha() {
        let dir = TempDir::new().unwrap();
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([200, 10, 10, 0])));
        let path = dir.path().join("out.jpg");
        ImageIoService::save_image(&image, &path, OutputFormat::Jpeg).unwrap();
        assert!(!ImageIoService::load_image(&path).unwrap().color().has_alpha());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            ImageIoService::load_image("/definitely/not/here.png"),
            Err(EnhanceError::Io(_))
        ));
    }

    #[test]
    fn test_output_path() {
        let path = ImageIoService::output_path(Path::new("/in/scan.tif"), None, 2, OutputFormat::Png);
        assert_eq!(path, PathBuf::from("/in/scan_x2.png"));
        let path = ImageIoService::output_path(
            Path::new("scan.png"),
            Some(Path::new("/out")),
            4,
            OutputFormat::Jpeg,
        );
        assert_eq!(path, PathBuf::from("/out/scan_x4.jpg"));
        assert_eq!("jpeg".parse::<OutputFormat>().unwrap(), OutputFormat::Jpeg);
    }
}
