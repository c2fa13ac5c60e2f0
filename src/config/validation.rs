//! Invariant checks over the configuration tree
//!
//! Every issue names the JSON pointer of the smallest subtree that the store
//! resets to defaults when repairing a loaded file.

use super::{EngineConfig, ModelEntry, ParamValue, StageDeclaration, TierConfig, SCHEMA_VERSION};
use crate::backends::BackendTier;
use crate::error::ConfigError;
use crate::stages::StageDeclarations;
use std::collections::BTreeMap;

/// Tolerance of the weight-sum invariant
pub const WEIGHT_SUM_EPSILON: f64 = 1e-6;

const MAX_SCALE_FACTOR_LIMIT: u32 = 16;

pub(super) fn validate(config: &EngineConfig, declarations: &StageDeclarations) -> Vec<ConfigError> {
    let mut issues = Vec::new();

    if config.schema_version != SCHEMA_VERSION {
        issues.push(ConfigError::new(
            "/schema_version",
            format!(
                "unsupported schema version {} (expected {SCHEMA_VERSION})",
                config.schema_version
            ),
        ));
    }

    validate_stages(config, declarations, &mut issues);
    validate_quality(config, &mut issues);
    validate_backends(config, &mut issues);
    validate_engine(config, &mut issues);

    issues
}

/// Pointer of a stage subtree
pub(super) fn stage_pointer(name: &str) -> String {
    format!("/stages/{}", name.replace('~', "~0").replace('/', "~1"))
}

fn validate_stages(
    config: &EngineConfig,
    declarations: &StageDeclarations,
    issues: &mut Vec<ConfigError>,
) {
    for (name, declaration) in declarations {
        let subtree = stage_pointer(name);
        let Some(stage) = config.stages.get(name) else {
            issues.push(ConfigError::new(&subtree, "stage configuration missing"));
            continue;
        };

        if stage.version != declaration.version {
            issues.push(ConfigError::new(
                &subtree,
                format!(
                    "config version {} does not match stage version {}",
                    stage.version, declaration.version
                ),
            ));
            continue;
        }

        for spec in &declaration.parameters {
            match stage.params.get(spec.name) {
                None => issues.push(
                    ConfigError::new(&subtree, "declared parameter has no value")
                        .with_parameter(spec.name),
                ),
                Some(value) => {
                    if let Err(message) = spec.check(value) {
                        issues.push(
                            ConfigError::new(&subtree, message).with_parameter(spec.name),
                        );
                    }
                },
            }
        }

        check_undeclared(&subtree, &stage.params, declaration, issues);
        for (hint, overrides) in &stage.profiles {
            for (param, value) in overrides {
                match declaration.spec(param) {
                    None => issues.push(
                        ConfigError::new(
                            &subtree,
                            format!("profile '{hint}' overrides undeclared parameter"),
                        )
                        .with_parameter(param),
                    ),
                    Some(spec) => {
                        if let Err(message) = spec.check(value) {
                            issues.push(
                                ConfigError::new(&subtree, format!("profile '{hint}': {message}"))
                                    .with_parameter(param),
                            );
                        }
                    },
                }
            }
        }
    }

    for name in config.stages.keys() {
        if !is_valid_stage_name(name) {
            issues.push(ConfigError::new(
                stage_pointer(name),
                "stage names may only contain lowercase letters, digits, '_' and '-'",
            ));
        }
    }
}

fn check_undeclared(
    subtree: &str,
    params: &BTreeMap<String, ParamValue>,
    declaration: &StageDeclaration,
    issues: &mut Vec<ConfigError>,
) {
    for name in params.keys() {
        if declaration.spec(name).is_none() {
            issues.push(
                ConfigError::new(subtree, "parameter is not declared by the stage")
                    .with_parameter(name),
            );
        }
    }
}

/// Stage names become JSON pointer segments and config keys
#[must_use]
pub(crate) fn is_valid_stage_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

fn check_unit_interval(subtree: &str, parameter: &str, value: f64, issues: &mut Vec<ConfigError>) {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        issues.push(
            ConfigError::new(subtree, format!("value {value} outside [0, 1]"))
                .with_parameter(parameter),
        );
    }
}

fn check_non_negative(subtree: &str, parameter: &str, value: f64, issues: &mut Vec<ConfigError>) {
    if !value.is_finite() || value < 0.0 {
        issues.push(
            ConfigError::new(subtree, format!("value {value} must be finite and >= 0"))
                .with_parameter(parameter),
        );
    }
}

fn check_positive(subtree: &str, parameter: &str, value: f64, issues: &mut Vec<ConfigError>) {
    if !value.is_finite() || value <= 0.0 {
        issues.push(
            ConfigError::new(subtree, format!("value {value} must be finite and > 0"))
                .with_parameter(parameter),
        );
    }
}

fn validate_quality(config: &EngineConfig, issues: &mut Vec<ConfigError>) {
    let weights = &config.quality.weights;
    let subtree = "/quality/weights";
    for (name, value) in [
        ("edge", weights.edge),
        ("contrast", weights.contrast),
        ("detail", weights.detail),
        ("noise", weights.noise),
    ] {
        check_unit_interval(subtree, name, value, issues);
    }
    let sum = weights.sum();
    if (sum - 1.0).abs() > WEIGHT_SUM_EPSILON {
        issues.push(ConfigError::new(
            subtree,
            format!("quality weights must sum to 1.0 (±{WEIGHT_SUM_EPSILON}), found {sum}"),
        ));
    }

    let anomalies = &config.quality.anomalies;
    check_non_negative(
        "/quality/anomalies",
        "near_black_luminance",
        anomalies.near_black_luminance,
        issues,
    );
    check_non_negative(
        "/quality/anomalies",
        "low_variance_std_dev",
        anomalies.low_variance_std_dev,
        issues,
    );
    if anomalies.uniform_distinct_values > 256 {
        issues.push(
            ConfigError::new(
                "/quality/anomalies",
                "an 8-bit image never has more than 256 distinct channel values",
            )
            .with_parameter("uniform_distinct_values"),
        );
    }

    let scales = &config.quality.scales;
    for (name, value) in [
        ("edge_gain", scales.edge_gain),
        ("contrast_gain", scales.contrast_gain),
        ("detail_divisor", scales.detail_divisor),
        ("noise_gain", scales.noise_gain),
    ] {
        check_positive("/quality/scales", name, value, issues);
    }

    check_unit_interval("/quality/min_score", "min_score", config.quality.min_score, issues);
}

/// Pointer of a model-backed tier subtree
pub(super) fn tier_pointer(tier: BackendTier) -> String {
    format!("/backends/{}", tier.config_key())
}

fn validate_tier(
    tier: BackendTier,
    tier_config: &TierConfig,
    models: &BTreeMap<String, ModelEntry>,
    issues: &mut Vec<ConfigError>,
) {
    let subtree = tier_pointer(tier);
    let tiles = &tier_config.tiles;
    for (name, size) in [
        ("for_small_images", tiles.for_small_images),
        ("for_medium_images", tiles.for_medium_images),
        ("for_large_images", tiles.for_large_images),
        ("min_tile", tiles.min_tile),
    ] {
        if size == 0 {
            issues.push(
                ConfigError::new(&subtree, "tile sizes must be positive")
                    .with_parameter(format!("tiles.{name}")),
            );
        }
    }
    if tiles.overlap.saturating_mul(2) >= tiles.min_tile {
        issues.push(
            ConfigError::new(
                &subtree,
                format!(
                    "overlap {} must be smaller than half the minimum tile {}",
                    tiles.overlap, tiles.min_tile
                ),
            )
            .with_parameter("tiles.overlap"),
        );
    }
    if tiles.small_image_pixels > tiles.large_image_pixels {
        issues.push(
            ConfigError::new(&subtree, "small image threshold exceeds large image threshold")
                .with_parameter("tiles.small_image_pixels"),
        );
    }

    let noise = &tier_config.noise;
    check_non_negative(&subtree, "noise.low_threshold", noise.low_threshold, issues);
    check_non_negative(&subtree, "noise.high_threshold", noise.high_threshold, issues);
    if noise.low_threshold > noise.high_threshold {
        issues.push(
            ConfigError::new(&subtree, "low noise threshold exceeds high noise threshold")
                .with_parameter("noise.low_threshold"),
        );
    }

    check_non_negative(
        &subtree,
        "tta.complexity_threshold",
        tier_config.tta.complexity_threshold,
        issues,
    );

    for model in tier_config.models.iter() {
        if !models.contains_key(model) {
            issues.push(
                ConfigError::new(&subtree, format!("unknown model identifier '{model}'"))
                    .with_parameter("models"),
            );
        }
    }
}

/// Highest level [`super::NoiseLevelConfig::level_for`] returns
const MAX_NOISE_LEVEL: u8 = 2;

fn is_sha256_digest(checksum: Option<&str>) -> bool {
    checksum.map_or(true, |c| c.len() == 64 && c.chars().all(|c| c.is_ascii_hexdigit()))
}

fn validate_backends(config: &EngineConfig, issues: &mut Vec<ConfigError>) {
    let backends = &config.backends;
    for tier in BackendTier::MODEL_TIERS {
        if let Some(tier_config) = backends.tier(tier) {
            validate_tier(tier, tier_config, &backends.models, issues);
        }
    }

    for (id, entry) in &backends.models {
        if entry.native_scale < 2 {
            issues.push(
                ConfigError::new(
                    "/backends/models",
                    format!("model '{id}' must have a native scale of at least 2"),
                )
                .with_parameter(id),
            );
        }
        if entry.file.trim().is_empty() {
            issues.push(
                ConfigError::new("/backends/models", format!("model '{id}' has no file"))
                    .with_parameter(id),
            );
        }
        if !is_sha256_digest(entry.sha256.as_deref()) {
            issues.push(
                ConfigError::new(
                    "/backends/models",
                    format!("model '{id}' checksum is not a SHA-256 hex digest"),
                )
                .with_parameter(id),
            );
        }
        for (level, variant) in &entry.noise_variants {
            if *level > MAX_NOISE_LEVEL {
                issues.push(
                    ConfigError::new(
                        "/backends/models",
                        format!("model '{id}' has a variant for noise level {level} (max {MAX_NOISE_LEVEL})"),
                    )
                    .with_parameter(id),
                );
            }
            if variant.file.trim().is_empty() || !is_sha256_digest(variant.sha256.as_deref()) {
                issues.push(
                    ConfigError::new(
                        "/backends/models",
                        format!("model '{id}' noise level {level} variant needs a file and a valid checksum"),
                    )
                    .with_parameter(id),
                );
            }
        }
    }

    if backends.breaker.failure_threshold > 0 && backends.breaker.cooldown_ms == 0 {
        issues.push(
            ConfigError::new("/backends/breaker", "cool-down must be positive when the breaker is on")
                .with_parameter("cooldown_ms"),
        );
    }

    if backends.device.wait_timeout_ms == 0 {
        issues.push(
            ConfigError::new("/backends/device", "device wait timeout must be positive")
                .with_parameter("wait_timeout_ms"),
        );
    }
}

fn validate_engine(config: &EngineConfig, issues: &mut Vec<ConfigError>) {
    let engine = &config.engine;
    if !(1..=MAX_SCALE_FACTOR_LIMIT).contains(&engine.max_scale_factor) {
        issues.push(
            ConfigError::new(
                "/engine",
                format!(
                    "max scale factor {} outside 1-{MAX_SCALE_FACTOR_LIMIT}",
                    engine.max_scale_factor
                ),
            )
            .with_parameter("max_scale_factor"),
        );
    }
    if engine.max_input_pixels == 0 {
        issues.push(
            ConfigError::new("/engine", "max input pixels must be positive")
                .with_parameter("max_input_pixels"),
        );
    }
    if engine.batch_concurrency == 0 {
        issues.push(
            ConfigError::new("/engine", "batch concurrency must be at least 1")
                .with_parameter("batch_concurrency"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ParameterSpec, QualityWeights};

    #[test]
    fn test_weight_sum_violation_is_reported_on_weights_subtree() {
        let mut config = EngineConfig::default();
        config.quality.weights = QualityWeights {
            edge: 0.3,
            contrast: 0.2,
            detail: 0.2,
            noise: 0.2,
        };
        let issues = config.validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].subtree, "/quality/weights");
        assert!(issues[0].message.contains("sum to 1.0"));
    }

    #[test]
    fn test_out_of_bounds_stage_parameter() {
        let mut config = EngineConfig::default();
        config
            .stages
            .get_mut("histogram_equalization")
            .unwrap()
            .params
            .insert("clip_limit".to_string(), ParamValue::Float(-1.0));
        let issues = config.validate();
        assert!(issues.iter().any(|issue| issue.subtree == "/stages/histogram_equalization"
            && issue.parameter.as_deref() == Some("clip_limit")));
    }

    #[test]
    fn test_missing_and_undeclared_parameters() {
        let mut config = EngineConfig::default();
        let sharpening = config.stages.get_mut("sharpening").unwrap();
        sharpening.params.remove("radius");
        sharpening
            .params
            .insert("bogus".to_string(), ParamValue::Int(1));
        let issues = config.validate();
        let params: Vec<_> = issues.iter().filter_map(|i| i.parameter.as_deref()).collect();
        assert!(params.contains(&"radius"));
        assert!(params.contains(&"bogus"));
    }

    #[test]
    fn test_version_mismatch() {
        let mut config = EngineConfig::default();
        config.stages.get_mut("noise_reduction").unwrap().version = 99;
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.subtree == "/stages/noise_reduction" && i.message.contains("version")));
    }

    #[test]
    fn test_unknown_model_and_bad_tiles() {
        let mut config = EngineConfig::default();
        config.backends.general_compute.models.photo = "does-not-exist".to_string();
        config.backends.accelerated_primary.tiles.for_large_images = 0;
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.subtree == "/backends/general_compute" && i.message.contains("unknown model")));
        assert!(issues
            .iter()
            .any(|i| i.subtree == "/backends/accelerated_primary"
                && i.parameter.as_deref() == Some("tiles.for_large_images")));
    }

    #[test]
    fn test_bad_noise_variants() {
        let mut config = EngineConfig::default();
        let cunet = config.backends.models.get_mut("waifu2x-cunet-2x").unwrap();
        cunet.noise_variants.get_mut(&1).unwrap().sha256 = Some("abc".to_string());
        cunet.noise_variants.insert(
            7,
            crate::config::ModelVariant {
                file: "noise7.onnx".to_string(),
                sha256: None,
            },
        );
        let issues = config.validate();
        let messages: Vec<_> = issues
            .iter()
            .filter(|i| i.parameter.as_deref() == Some("waifu2x-cunet-2x"))
            .map(|i| i.message.as_str())
            .collect();
        assert_eq!(messages.len(), 2, "{messages:?}");
        assert!(messages.iter().any(|m| m.contains("noise level 7")));
    }

    #[test]
    fn test_custom_declarations_are_checked() {
        let mut declarations = crate::stages::builtin_declarations();
        declarations.insert(
            "vignette".to_string(),
            StageDeclaration::new(1, vec![ParameterSpec::float("amount", 0.5, 0.0, 1.0)]),
        );
        let config = EngineConfig::default();
        let issues = config.validate_with(&declarations);
        assert!(issues
            .iter()
            .any(|i| i.subtree == "/stages/vignette" && i.message.contains("missing")));

        let config = EngineConfig::default_with(&declarations);
        assert!(config.validate_with(&declarations).is_empty());
    }

    #[test]
    fn test_stage_name_rules() {
        assert!(is_valid_stage_name("noise_reduction"));
        assert!(is_valid_stage_name("clahe-v2"));
        assert!(!is_valid_stage_name("Noise"));
        assert!(!is_valid_stage_name("a/b"));
        assert!(!is_valid_stage_name(""));
    }
}
