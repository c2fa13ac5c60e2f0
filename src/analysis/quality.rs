//! Quality scorer: weighted composite plus degenerate-output detectors

use super::{mean_std, LumaPlane};
use crate::config::QualityConfig;
use crate::types::{AnomalyFlags, FeatureVector, PixelStats, QualityScore, SubScores};
use image::DynamicImage;
use tracing::instrument;

/// Scores an image against the `quality` config subtree.
///
/// The weights are assumed to satisfy the sum invariant; that is checked when
/// the configuration is loaded, not here.
#[derive(Debug, Clone, Copy)]
pub struct QualityScorer {
    config: QualityConfig,
}

impl QualityScorer {
    #[must_use]
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    /// Score `image`, whose features were computed by the analyzer
    #[instrument(level = "debug", skip_all, fields(width = image.width(), height = image.height()))]
    #[must_use]
    pub fn score(&self, image: &DynamicImage, features: &FeatureVector) -> QualityScore {
        let plane = LumaPlane::from_image(image);
        let scales = &self.config.scales;
        let weights = &self.config.weights;

        let sub_scores = SubScores {
            edge: (features.edge_density * scales.edge_gain).clamp(0.0, 1.0),
            contrast: (features.contrast_score * scales.contrast_gain).clamp(0.0, 1.0),
            detail: (laplacian_variance(&plane) / scales.detail_divisor).clamp(0.0, 1.0),
            inverse_noise: 1.0 - (features.noise_estimate * scales.noise_gain).clamp(0.0, 1.0),
        };
        let composite = (weights.edge * sub_scores.edge
            + weights.contrast * sub_scores.contrast
            + weights.detail * sub_scores.detail
            + weights.noise * sub_scores.inverse_noise)
            .clamp(0.0, 1.0);

        let stats = pixel_stats(image, &plane);
        let anomalies = &self.config.anomalies;
        let flags = AnomalyFlags {
            is_uniform: stats.distinct_values < anomalies.uniform_distinct_values,
            is_near_black: stats.mean_luminance < anomalies.near_black_luminance,
            is_low_variance: stats.channel_std_dev < anomalies.low_variance_std_dev,
        };

        QualityScore {
            composite,
            sub_scores,
            flags,
            stats,
        }
    }
}

impl Default for QualityScorer {
    fn default() -> Self {
        Self::new(QualityConfig::default())
    }
}

fn laplacian_variance(plane: &LumaPlane) -> f64 {
    let mut responses = Vec::new();
    plane.for_each_interior(|x, y| responses.push(f64::from(plane.laplacian(x, y))));
    let (_, std) = mean_std(responses.into_iter());
    std * std
}

#[allow(clippy::indexing_slicing)] // u8 index into a 256-entry table
fn pixel_stats(image: &DynamicImage, plane: &LumaPlane) -> PixelStats {
    let rgb = image.to_rgb8();
    let mut seen = [false; 256];
    for &value in rgb.as_raw() {
        seen[usize::from(value)] = true;
    }
    let (_, channel_std_dev) = mean_std(rgb.as_raw().iter().map(|&v| f64::from(v)));
    let (mean_luminance, _) = plane.mean_std();
    PixelStats {
        mean_luminance,
        channel_std_dev,
        distinct_values: seen.iter().filter(|&&s| s).count(),
    }
}
