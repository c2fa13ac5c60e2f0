//! Typed stage parameters: values, declarations and resolved per-request views

use crate::error::{EnhanceError, Result};
use crate::types::ContentHint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single typed parameter value as stored in the config tree.
///
/// Untagged so the JSON stays a plain key/value mapping. Integers written
/// without a fraction parse as `Int`; readers that expect a float accept both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Bool,
    Int,
    Float,
    Text,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::Int => "integer",
            Self::Float => "float",
            Self::Text => "text",
        };
        f.write_str(name)
    }
}

impl ParamValue {
    #[must_use]
    pub fn kind(&self) -> ParamKind {
        match self {
            Self::Bool(_) => ParamKind::Bool,
            Self::Int(_) => ParamKind::Int,
            Self::Float(_) => ParamKind::Float,
            Self::Text(_) => ParamKind::Text,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Whether this value can be read as `kind`
    #[must_use]
    pub fn conforms_to(&self, kind: ParamKind) -> bool {
        match kind {
            ParamKind::Float => self.as_f64().is_some(),
            ParamKind::Int => self.as_i64().is_some(),
            ParamKind::Bool => self.as_bool().is_some(),
            ParamKind::Text => self.as_str().is_some(),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "\"{v}\""),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Declaration of one stage parameter: its type, default and bounds
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub default: ParamValue,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub description: &'static str,
}

impl ParameterSpec {
    #[must_use]
    pub fn float(name: &'static str, default: f64, min: f64, max: f64) -> Self {
        Self {
            name,
            kind: ParamKind::Float,
            default: ParamValue::Float(default),
            min: Some(min),
            max: Some(max),
            description: "",
        }
    }

    #[must_use]
    pub fn int(name: &'static str, default: i64, min: i64, max: i64) -> Self {
        Self {
            name,
            kind: ParamKind::Int,
            default: ParamValue::Int(default),
            min: Some(min as f64),
            max: Some(max as f64),
            description: "",
        }
    }

    #[must_use]
    pub fn boolean(name: &'static str, default: bool) -> Self {
        Self {
            name,
            kind: ParamKind::Bool,
            default: ParamValue::Bool(default),
            min: None,
            max: None,
            description: "",
        }
    }

    #[must_use]
    pub fn describe(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Check a candidate value against kind and bounds
    pub fn check(&self, value: &ParamValue) -> std::result::Result<(), String> {
        if !value.conforms_to(self.kind) {
            return Err(format!(
                "expected {} value, found {}",
                self.kind,
                value.kind()
            ));
        }
        if let Some(v) = value.as_f64() {
            if !v.is_finite() {
                return Err(format!("value {v} is not finite"));
            }
            if let Some(min) = self.min {
                if v < min {
                    return Err(format!("value {v} below minimum {min}"));
                }
            }
            if let Some(max) = self.max {
                if v > max {
                    return Err(format!("value {v} above maximum {max}"));
                }
            }
        }
        Ok(())
    }
}

/// What a stage declares about its configuration
#[derive(Debug, Clone, PartialEq)]
pub struct StageDeclaration {
    pub version: u32,
    pub parameters: Vec<ParameterSpec>,
    /// Default per-content-hint overrides
    pub profiles: BTreeMap<ContentHint, BTreeMap<String, ParamValue>>,
}

impl StageDeclaration {
    #[must_use]
    pub fn new(version: u32, parameters: Vec<ParameterSpec>) -> Self {
        Self {
            version,
            parameters,
            profiles: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_profile(
        mut self,
        hint: ContentHint,
        overrides: impl IntoIterator<Item = (&'static str, ParamValue)>,
    ) -> Self {
        self.profiles.insert(
            hint,
            overrides
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        );
        self
    }

    #[must_use]
    pub fn spec(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|spec| spec.name == name)
    }

    /// Check every default and profile override against the declared parameters
    pub fn check_defaults(&self) -> std::result::Result<(), String> {
        for spec in &self.parameters {
            spec.check(&spec.default)
                .map_err(|reason| format!("default of '{}': {reason}", spec.name))?;
        }
        for (hint, overrides) in &self.profiles {
            for (name, value) in overrides {
                let spec = self
                    .spec(name)
                    .ok_or_else(|| format!("{hint:?} profile overrides undeclared '{name}'"))?;
                spec.check(value)
                    .map_err(|reason| format!("{hint:?} profile value of '{name}': {reason}"))?;
            }
        }
        Ok(())
    }

    /// Config subtree holding every declared default
    #[must_use]
    pub fn default_config(&self) -> StageConfig {
        StageConfig {
            version: self.version,
            enabled: true,
            params: self
                .parameters
                .iter()
                .map(|spec| (spec.name.to_string(), spec.default.clone()))
                .collect(),
            profiles: self.profiles.clone(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Named, versioned parameter mapping for one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub version: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub profiles: BTreeMap<ContentHint, BTreeMap<String, ParamValue>>,
}

impl StageConfig {
    /// Parameters in effect for one request, with the content-hint profile applied
    #[must_use]
    pub fn resolve(&self, stage: &str, hint: ContentHint) -> StageParams {
        let mut values = self.params.clone();
        if let Some(profile) = self.profiles.get(&hint) {
            for (name, value) in profile {
                values.insert(name.clone(), value.clone());
            }
        }
        StageParams {
            stage: stage.to_string(),
            values,
        }
    }
}

/// Read-only view of a stage's effective parameters
#[derive(Debug, Clone, PartialEq)]
pub struct StageParams {
    stage: String,
    values: BTreeMap<String, ParamValue>,
}

impl StageParams {
    #[must_use]
    pub fn new(stage: &str, values: BTreeMap<String, ParamValue>) -> Self {
        Self {
            stage: stage.to_string(),
            values,
        }
    }

    fn get(&self, name: &str) -> Result<&ParamValue> {
        self.values.get(name).ok_or_else(|| {
            EnhanceError::stage(&self.stage, format!("missing parameter '{name}'"))
        })
    }

    fn mismatch(&self, name: &str, expected: ParamKind) -> EnhanceError {
        EnhanceError::stage(
            &self.stage,
            format!("parameter '{name}' is not a {expected} value"),
        )
    }

    pub fn f64(&self, name: &str) -> Result<f64> {
        let value = self.get(name)?;
        value
            .as_f64()
            .ok_or_else(|| self.mismatch(name, ParamKind::Float))
    }

    pub fn u32(&self, name: &str) -> Result<u32> {
        let value = self.get(name)?;
        value
            .as_i64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| self.mismatch(name, ParamKind::Int))
    }

    pub fn bool(&self, name: &str) -> Result<bool> {
        let value = self.get(name)?;
        value
            .as_bool()
            .ok_or_else(|| self.mismatch(name, ParamKind::Bool))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged_json_shapes() {
        let values: BTreeMap<String, ParamValue> =
            serde_json::from_str(r#"{"a": 2.0, "b": 8, "c": true, "d": "x"}"#).unwrap();
        assert_eq!(values["a"], ParamValue::Float(2.0));
        assert_eq!(values["b"], ParamValue::Int(8));
        assert_eq!(values["c"], ParamValue::Bool(true));
        assert_eq!(values["d"], ParamValue::Text("x".to_string()));

        let json = serde_json::to_string(&values).unwrap();
        let reparsed: BTreeMap<String, ParamValue> = serde_json::from_str(&json).unwrap();
        assert_eq!(values, reparsed);
    }

    #[test]
    fn test_spec_check_bounds_and_kind() {
        let spec = ParameterSpec::float("clip_limit", 2.0, 0.01, 40.0);
        assert!(spec.check(&ParamValue::Float(3.0)).is_ok());
        assert!(spec.check(&ParamValue::Int(3)).is_ok());
        assert!(spec.check(&ParamValue::Float(0.0)).is_err());
        assert!(spec.check(&ParamValue::Float(41.0)).is_err());
        assert!(spec.check(&ParamValue::Bool(true)).is_err());
        assert!(spec.check(&ParamValue::Float(f64::NAN)).is_err());

        let grid = ParameterSpec::int("tile_grid", 8, 1, 64);
        assert!(grid.check(&ParamValue::Float(4.0)).is_ok());
        assert!(grid.check(&ParamValue::Float(4.5)).is_err());
    }

    #[test]
    fn test_resolve_applies_profile() {
        let declaration = StageDeclaration::new(
            1,
            vec![ParameterSpec::float("clip_limit", 2.0, 0.01, 40.0)],
        )
        .with_profile(ContentHint::Document, [("clip_limit", ParamValue::Float(3.0))]);
        let config = declaration.default_config();

        let photo = config.resolve("histogram_equalization", ContentHint::Photo);
        assert!((photo.f64("clip_limit").unwrap() - 2.0).abs() < f64::EPSILON);

        let document = config.resolve("histogram_equalization", ContentHint::Document);
        assert!((document.f64("clip_limit").unwrap() - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_stage_params_errors_name_the_stage() {
        let params = StageParams::new("sharpening", BTreeMap::new());
        let err = params.f64("radius").unwrap_err();
        assert!(matches!(err, EnhanceError::StageExecution { ref stage, .. } if stage == "sharpening"));
    }
}
