//! Quality gate applied to the output of every model tier

use crate::analysis::{ImageAnalyzer, QualityScorer};
use crate::config::QualityConfig;
use crate::types::{QualityScore, RejectionReason};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::instrument;

/// Verdict on one candidate output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub accepted: bool,
    pub score: QualityScore,
    /// Empty when accepted
    pub reasons: Vec<RejectionReason>,
}

/// Accepts an output when its composite score reaches `quality.min_score`,
/// no degenerate-output flag is raised, and its dimensions are exactly the
/// requested ones.
#[derive(Debug, Clone, Copy)]
pub struct OutputValidator {
    analyzer: ImageAnalyzer,
    scorer: QualityScorer,
}

impl OutputValidator {
    #[must_use]
    pub fn new(config: QualityConfig) -> Self {
        Self {
            analyzer: ImageAnalyzer::new(),
            scorer: QualityScorer::new(config),
        }
    }

    /// Score without judging; used for the naive fallback's report
    #[must_use]
    pub fn score(&self, image: &DynamicImage) -> QualityScore {
        let features = self.analyzer.analyze(image);
        self.scorer.score(image, &features)
    }

    #[instrument(level = "debug", skip_all, fields(width = image.width(), height = image.height()))]
    #[must_use]
    pub fn validate(&self, image: &DynamicImage, expected: (u32, u32)) -> Validation {
        let score = self.score(image);
        let mut reasons = Vec::new();

        let actual = (image.width(), image.height());
        if actual != expected {
            reasons.push(RejectionReason::DimensionMismatch { expected, actual });
        }
        let config = self.scorer.config();
        let min_score = config.min_score;
        if score.composite < min_score {
            reasons.push(RejectionReason::ScoreBelowMinimum {
                score: score.composite,
                minimum: min_score,
            });
        }
        if score.flags.is_uniform {
            reasons.push(RejectionReason::Uniform {
                distinct_values: score.stats.distinct_values,
                threshold: config.anomalies.uniform_distinct_values,
            });
        }
        if score.flags.is_near_black {
            reasons.push(RejectionReason::NearBlack {
                mean_luminance: score.stats.mean_luminance,
                threshold: config.anomalies.near_black_luminance,
            });
        }
        if score.flags.is_low_variance {
            reasons.push(RejectionReason::LowVariance {
                std_dev: score.stats.channel_std_dev,
                threshold: config.anomalies.low_variance_std_dev,
            });
        }

        Validation {
            accepted: reasons.is_empty(),
            score,
            reasons,
        }
    }
}

impl Default for OutputValidator {
    fn default() -> Self {
        Self::new(QualityConfig::default())
    }
}
