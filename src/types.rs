//! Core data types shared by the analyzer, pipeline, backends and orchestrator

use crate::backends::BackendTier;
use crate::error::{EnhanceError, Result};
use chrono::{DateTime, Utc};
use image::{DynamicImage, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-image descriptors computed once by the analyzer, before any stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureVector {
    /// Fraction of pixels on a strong luminance gradient, in `[0, 1]`
    pub edge_density: f64,
    /// Luminance standard deviation divided by 127.5
    pub contrast_score: f64,
    /// RMS of the high-frequency residual after a 3x3 mean filter, divided by 255
    pub noise_estimate: f64,
    /// Distinct quantized colors relative to the theoretical maximum, in `[0, 1]`
    pub color_richness: f64,
}

impl FeatureVector {
    /// Rough structural complexity used to decide test-time augmentation
    #[must_use]
    pub fn complexity(&self) -> f64 {
        (self.edge_density * 2.0 + self.noise_estimate * 10.0 + self.contrast_score) / 3.0
    }
}

/// Content class of an image; selects model identifiers and stage profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentHint {
    Photo,
    Anime,
    Document,
}

impl ContentHint {
    pub const ALL: [ContentHint; 3] = [Self::Photo, Self::Anime, Self::Document];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Anime => "anime",
            Self::Document => "document",
        }
    }

    /// Classify an image from its features when the caller gave no hint.
    ///
    /// Scanned pages are nearly achromatic with dense glyph edges, flat-shaded
    /// artwork has few colors and little sensor noise, everything else is a photo.
    #[must_use]
    pub fn infer(features: &FeatureVector) -> Self {
        if features.color_richness < 0.02 && features.edge_density > 0.02 {
            Self::Document
        } else if features.color_richness < 0.25 && features.noise_estimate < 0.01 {
            Self::Anime
        } else {
            Self::Photo
        }
    }
}

impl fmt::Display for ContentHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentHint {
    type Err = EnhanceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "photo" => Ok(Self::Photo),
            "anime" | "illustration" => Ok(Self::Anime),
            "document" | "text" => Ok(Self::Document),
            other => Err(EnhanceError::invalid_request(format!(
                "unknown content hint '{other}' (expected photo, anime or document)"
            ))),
        }
    }
}

/// Sub-scores that feed the composite, each normalized to `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SubScores {
    pub edge: f64,
    pub contrast: f64,
    pub detail: f64,
    pub inverse_noise: f64,
}

/// Degenerate-output detectors. Any raised flag forces rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AnomalyFlags {
    pub is_uniform: bool,
    pub is_near_black: bool,
    pub is_low_variance: bool,
}

impl AnomalyFlags {
    #[must_use]
    pub fn any(&self) -> bool {
        self.is_uniform || self.is_near_black || self.is_low_variance
    }
}

/// Pixel statistics the anomaly flags were derived from
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PixelStats {
    pub mean_luminance: f64,
    pub channel_std_dev: f64,
    pub distinct_values: usize,
}

/// Quality assessment of one image
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QualityScore {
    /// Weighted sum of the sub-scores, in `[0, 1]`
    pub composite: f64,
    pub sub_scores: SubScores,
    pub flags: AnomalyFlags,
    pub stats: PixelStats,
}

/// Why the validator refused an output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectionReason {
    ScoreBelowMinimum { score: f64, minimum: f64 },
    Uniform { distinct_values: usize, threshold: usize },
    NearBlack { mean_luminance: f64, threshold: f64 },
    LowVariance { std_dev: f64, threshold: f64 },
    DimensionMismatch { expected: (u32, u32), actual: (u32, u32) },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScoreBelowMinimum { score, minimum } => {
                write!(f, "composite score {score:.3} below minimum {minimum:.3}")
            },
            Self::Uniform {
                distinct_values,
                threshold,
            } => write!(
                f,
                "uniform output ({distinct_values} distinct values, threshold {threshold})"
            ),
            Self::NearBlack {
                mean_luminance,
                threshold,
            } => write!(
                f,
                "near-black output (mean luminance {mean_luminance:.2}, threshold {threshold:.2})"
            ),
            Self::LowVariance { std_dev, threshold } => write!(
                f,
                "low-variance output (std dev {std_dev:.2}, threshold {threshold:.2})"
            ),
            Self::DimensionMismatch { expected, actual } => write!(
                f,
                "dimension mismatch (expected {}x{}, got {}x{})",
                expected.0, expected.1, actual.0, actual.1
            ),
        }
    }
}

/// Palette-indexed raster as extracted from document containers.
///
/// The engine works on decoded buffers, so palette images are expanded with
/// [`IndexedImage::expand`] before they are submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedImage {
    pub width: u32,
    pub height: u32,
    pub palette: Vec<[u8; 3]>,
    pub indices: Vec<u8>,
    pub transparent_index: Option<u8>,
}

impl IndexedImage {
    /// Expand to RGBA, mapping the transparent index (if any) to alpha 0.
    pub fn expand(&self) -> Result<DynamicImage> {
        let expected = self.width as usize * self.height as usize;
        if self.indices.len() != expected {
            return Err(EnhanceError::invalid_request(format!(
                "indexed image has {} indices, expected {expected}",
                self.indices.len()
            )));
        }

        let mut out = RgbaImage::new(self.width, self.height);
        for (pixel, &index) in out.pixels_mut().zip(&self.indices) {
            let [r, g, b] = self
                .palette
                .get(usize::from(index))
                .copied()
                .ok_or_else(|| {
                    EnhanceError::invalid_request(format!(
                        "palette index {index} out of range ({} entries)",
                        self.palette.len()
                    ))
                })?;
            let alpha = if self.transparent_index == Some(index) {
                0
            } else {
                255
            };
            *pixel = Rgba([r, g, b, alpha]);
        }
        Ok(DynamicImage::ImageRgba8(out))
    }
}

/// One unit of work for the engine
#[derive(Debug, Clone)]
pub struct UpscaleRequest {
    pub image: DynamicImage,
    pub scale_factor: u32,
    pub content_hint: Option<ContentHint>,
    /// Maximum number of tier demotions before jumping to the naive fallback.
    /// `None` exhausts every tier.
    pub degradation_budget: Option<usize>,
    pub cancellation: CancellationToken,
}

impl UpscaleRequest {
    #[must_use]
    pub fn new(image: DynamicImage, scale_factor: u32) -> Self {
        Self {
            image,
            scale_factor,
            content_hint: None,
            degradation_budget: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Build from a palette image
    pub fn from_indexed(image: &IndexedImage, scale_factor: u32) -> Result<Self> {
        Ok(Self::new(image.expand()?, scale_factor))
    }

    #[must_use]
    pub fn with_content_hint(mut self, hint: ContentHint) -> Self {
        self.content_hint = Some(hint);
        self
    }

    #[must_use]
    pub fn with_degradation_budget(mut self, budget: usize) -> Self {
        self.degradation_budget = Some(budget);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Output dimensions implied by the input size and the scale factor
    pub fn target_dimensions(&self) -> Result<(u32, u32)> {
        let scale = self.scale_factor;
        let width = self.image.width().checked_mul(scale);
        let height = self.image.height().checked_mul(scale);
        width.zip(height).ok_or_else(|| {
            EnhanceError::invalid_request(format!(
                "{}x{} scaled by {scale} overflows",
                self.image.width(),
                self.image.height()
            ))
        })
    }
}

/// What happened on one tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Accepted,
    Failed { error: String },
    Rejected { reasons: Vec<RejectionReason> },
    /// Terminal naive resize; never validated
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierAttempt {
    pub tier: BackendTier,
    pub outcome: AttemptOutcome,
    pub duration_ms: u64,
    pub quality_score: Option<QualityScore>,
    /// Denoise level the model was chosen for; `None` on the naive fallback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise_level: Option<u8>,
    /// Model file the tier ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_file: Option<String>,
}

/// A stage that the pipeline skipped after it failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: String,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessingTimings {
    pub analysis_ms: u64,
    pub preprocess_ms: u64,
    pub execute_ms: u64,
    pub postprocess_ms: u64,
    pub validation_ms: u64,
    pub total_ms: u64,
}

/// Everything a caller needs to audit one `enhance` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpscaleReport {
    pub request_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub tier_used: BackendTier,
    /// Number of tier transitions after the first attempt
    pub retries: usize,
    pub accepted: bool,
    /// The naive fallback produced the result
    pub fully_degraded: bool,
    pub quality_score: QualityScore,
    pub content_hint: ContentHint,
    pub features: FeatureVector,
    pub attempts: Vec<TierAttempt>,
    pub stages_applied: Vec<String>,
    pub stages_skipped: Vec<StageFailure>,
    pub input_dimensions: (u32, u32),
    pub output_dimensions: (u32, u32),
    /// The normalize stage was disabled or skipped and the engine composited
    /// the input onto the normalize background itself
    #[serde(default)]
    pub composited_by_engine: bool,
    pub timings: ProcessingTimings,
}

impl UpscaleReport {
    /// Tiers in the order they were attempted
    #[must_use]
    pub fn tier_sequence(&self) -> Vec<BackendTier> {
        self.attempts.iter().map(|attempt| attempt.tier).collect()
    }
}

/// Enhanced image plus its report
#[derive(Debug, Clone)]
pub struct UpscaleResult {
    pub image: DynamicImage,
    pub report: UpscaleReport,
}

impl UpscaleResult {
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.image.width(), self.image.height())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hint_parsing() {
        assert_eq!("Photo".parse::<ContentHint>().unwrap(), ContentHint::Photo);
        assert_eq!("text".parse::<ContentHint>().unwrap(), ContentHint::Document);
        assert!("vector".parse::<ContentHint>().is_err());
    }

    #[test]
    fn test_content_hint_inference() {
        let document = FeatureVector {
            edge_density: 0.12,
            contrast_score: 0.8,
            noise_estimate: 0.02,
            color_richness: 0.001,
        };
        assert_eq!(ContentHint::infer(&document), ContentHint::Document);

        let anime = FeatureVector {
            edge_density: 0.05,
            contrast_score: 0.4,
            noise_estimate: 0.002,
            color_richness: 0.1,
        };
        assert_eq!(ContentHint::infer(&anime), ContentHint::Anime);

        let photo = FeatureVector {
            edge_density: 0.08,
            contrast_score: 0.4,
            noise_estimate: 0.03,
            color_richness: 0.6,
        };
        assert_eq!(ContentHint::infer(&photo), ContentHint::Photo);
    }

    #[test]
    fn test_indexed_expand_with_transparency() {
        let indexed = IndexedImage {
            width: 2,
            height: 1,
            palette: vec![[255, 0, 0], [0, 0, 255]],
            indices: vec![0, 1],
            transparent_index: Some(1),
        };
        let rgba = indexed.expand().unwrap().to_rgba8();
        assert_eq!(rgba.get_pixel(0, 0), &Rgba([255, 0, 0, 255]));
        assert_eq!(rgba.get_pixel(1, 0), &Rgba([0, 0, 255, 0]));
    }

    #[test]
    fn test_indexed_expand_rejects_bad_index() {
        let indexed = IndexedImage {
            width: 1,
            height: 1,
            palette: vec![[1, 2, 3]],
            indices: vec![4],
            transparent_index: None,
        };
        assert!(matches!(
            indexed.expand(),
            Err(EnhanceError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_target_dimensions() {
        let request = UpscaleRequest::new(DynamicImage::new_rgb8(30, 20), 3);
        assert_eq!(request.target_dimensions().unwrap(), (90, 60));

        let huge = UpscaleRequest::new(DynamicImage::new_rgb8(1, 1), u32::MAX);
        assert_eq!(huge.target_dimensions().unwrap(), (u32::MAX, u32::MAX));
    }

    #[test]
    fn test_rejection_reason_display() {
        let reason = RejectionReason::DimensionMismatch {
            expected: (200, 200),
            actual: (198, 200),
        };
        assert_eq!(
            reason.to_string(),
            "dimension mismatch (expected 200x200, got 198x200)"
        );
    }
}
