//! Persistent configuration store with per-subtree repair and atomic swaps
//!
//! Readers take an `Arc` snapshot and never block writers for longer than a
//! pointer swap. Writers (save, reset, reload, override) are serialized by a
//! mutex and publish a whole new tree at once.

use super::validation::{stage_pointer, tier_pointer};
use super::{
    AnomalyThresholds, DeviceConfig, EngineConfig, ModelEntry, NaiveConfig,
    OrchestrationConfig, QualityWeights, ScoreScales, StageConfig, StageDeclaration, TierConfig,
};
use crate::backends::BackendTier;
use crate::error::{ConfigError, EnhanceError, Result};
use crate::stages::{builtin_declarations, StageDeclarations};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, instrument, warn};

/// Environment variable overriding the config file location
pub const CONFIG_ENV_VAR: &str = "IMGLY_UPSCALE_CONFIG";

const CONFIG_DIR_NAME: &str = "imgly-upscale";
const CONFIG_FILE_NAME: &str = "engine.json";
const MAX_REPAIR_ROUNDS: usize = 3;

/// A loaded configuration together with every problem that was repaired
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedConfig {
    pub config: EngineConfig,
    pub issues: Vec<ConfigError>,
}

impl LoadedConfig {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

pub struct ConfigStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<EngineConfig>>,
    declarations: RwLock<StageDeclarations>,
    last_issues: RwLock<Vec<ConfigError>>,
    writer: Mutex<()>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ConfigStore {
    /// Store backed by `path`, holding defaults until [`ConfigStore::reload`] runs
    #[must_use]
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self::with_path(Some(path.into()))
    }

    /// Store without a backing file; `save` only swaps the in-memory tree
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_path(None)
    }

    /// In-memory store seeded with `config`
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let store = Self::in_memory();
        store.replace(config)?;
        Ok(store)
    }

    fn with_path(path: Option<PathBuf>) -> Self {
        let declarations = builtin_declarations();
        let defaults = EngineConfig::default_with(&declarations);
        Self {
            path,
            current: RwLock::new(Arc::new(defaults)),
            declarations: RwLock::new(declarations),
            last_issues: RwLock::new(Vec::new()),
            writer: Mutex::new(()),
        }
    }

    /// Open the store at `path` and load it. Repaired issues are logged and kept
    /// available through [`ConfigStore::last_issues`].
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let store = Self::new(path);
        let issues = store.reload()?;
        for issue in &issues {
            warn!(subtree = %issue.subtree, parameter = ?issue.parameter, "⚠️ Config issue repaired with defaults: {}", issue.message);
        }
        Ok(store)
    }

    /// Open the store at the well-known location
    pub fn open_default() -> Result<Self> {
        Self::open(Self::default_path()?)
    }

    /// `$IMGLY_UPSCALE_CONFIG`, else `<config_dir>/imgly-upscale/engine.json`
    pub fn default_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.trim().is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
        dirs::config_dir()
            .map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
            .ok_or_else(|| {
                EnhanceError::invalid_config(format!(
                    "no config directory on this platform; set {CONFIG_ENV_VAR}"
                ))
            })
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Cheap read of the live tree
    #[must_use]
    pub fn snapshot(&self) -> Arc<EngineConfig> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    #[must_use]
    pub fn declarations(&self) -> StageDeclarations {
        self.declarations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Issues repaired by the most recent reload
    #[must_use]
    pub fn last_issues(&self) -> Vec<ConfigError> {
        self.last_issues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Register the parameters of a custom stage. A missing subtree for the
    /// stage is added to the live tree with the declared defaults.
    pub fn declare_stage(&self, name: &str, declaration: StageDeclaration) -> Result<()> {
        if !super::is_valid_stage_name(name) {
            return Err(EnhanceError::invalid_config(format!(
                "invalid stage name '{name}'"
            )));
        }
        declaration.check_defaults().map_err(|reason| {
            EnhanceError::invalid_config(format!("stage '{name}' declares {reason}"))
        })?;
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let default_config = declaration.default_config();
        self.declarations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), declaration);

        let current = self.snapshot();
        if !current.stages.contains_key(name) {
            let mut updated = (*current).clone();
            updated.stages.insert(name.to_string(), default_config);
            self.publish(updated);
        }
        Ok(())
    }

    #[must_use]
    pub fn validate(&self, config: &EngineConfig) -> Vec<ConfigError> {
        config.validate_with(&self.declarations())
    }

    /// Read and repair the persisted tree without publishing it.
    ///
    /// A missing file yields defaults without issues.
    #[instrument(skip(self), fields(path = ?self.path))]
    pub fn load(&self) -> Result<LoadedConfig> {
        let Some(path) = &self.path else {
            return Ok(LoadedConfig {
                config: (*self.snapshot()).clone(),
                issues: Vec::new(),
            });
        };

        match std::fs::read_to_string(path) {
            Ok(text) => Ok(self.load_from_str(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config file found, using defaults");
                Ok(LoadedConfig {
                    config: EngineConfig::default_with(&self.declarations()),
                    issues: Vec::new(),
                })
            },
            Err(e) => Err(EnhanceError::file_io_error("read config", path, &e)),
        }
    }

    /// Parse and repair a JSON document. Offending subtrees fall back to their
    /// defaults; everything else is kept.
    #[must_use]
    pub fn load_from_str(&self, text: &str) -> LoadedConfig {
        let declarations = self.declarations();
        let defaults = EngineConfig::default_with(&declarations);
        let fallback = |issue: ConfigError| LoadedConfig {
            config: defaults.clone(),
            issues: vec![issue],
        };

        let default_value = match serde_json::to_value(&defaults) {
            Ok(value) => value,
            Err(e) => return fallback(ConfigError::new("", e.to_string())),
        };
        let user: Value = match serde_json::from_str(text) {
            Ok(value @ Value::Object(_)) => value,
            Ok(_) => return fallback(ConfigError::new("", "config root must be a JSON object")),
            Err(e) => return fallback(ConfigError::new("", format!("unparseable config: {e}"))),
        };

        let mut merged = default_value.clone();
        merge_json(&mut merged, &user);

        let mut issues = Vec::new();
        for pointer in subtree_pointers(&merged) {
            let Some(subtree) = merged.pointer(&pointer) else {
                continue;
            };
            if let Err(message) = check_shape(&pointer, subtree) {
                issues.push(ConfigError::new(&pointer, message));
                reset_subtree(&mut merged, &default_value, &pointer);
            }
        }

        let mut config = match serde_json::from_value::<EngineConfig>(merged) {
            Ok(config) => config,
            Err(e) => return fallback(ConfigError::new("", e.to_string())),
        };

        for _ in 0..MAX_REPAIR_ROUNDS {
            let found = config.validate_with(&declarations);
            if found.is_empty() {
                return LoadedConfig { config, issues };
            }

            let repaired = serde_json::to_value(&config).and_then(|mut value| {
                for issue in &found {
                    reset_subtree(&mut value, &default_value, &issue.subtree);
                }
                serde_json::from_value::<EngineConfig>(value)
            });
            issues.extend(found);
            match repaired {
                Ok(next) => config = next,
                Err(e) => {
                    issues.push(ConfigError::new("", e.to_string()));
                    return LoadedConfig {
                        config: defaults,
                        issues,
                    };
                },
            }
        }

        issues.push(ConfigError::new(
            "",
            "configuration could not be repaired; using defaults",
        ));
        LoadedConfig {
            config: defaults,
            issues,
        }
    }

    /// Load from disk and publish the repaired tree. Returns the repaired issues.
    pub fn reload(&self) -> Result<Vec<ConfigError>> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let loaded = self.load()?;
        info!(
            issues = loaded.issues.len(),
            "🔄 Configuration reloaded"
        );
        self.publish(loaded.config);
        *self
            .last_issues
            .write()
            .unwrap_or_else(PoisonError::into_inner) = loaded.issues.clone();
        Ok(loaded.issues)
    }

    /// Validate, persist atomically and publish
    #[instrument(skip(self, config), fields(path = ?self.path))]
    pub fn save(&self, config: &EngineConfig) -> Result<()> {
        let issues = self.validate(config);
        if !issues.is_empty() {
            return Err(EnhanceError::Config(issues));
        }
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(path) = &self.path {
            write_atomically(path, config)?;
            info!("💾 Configuration saved to {}", path.display());
        }
        self.publish(config.clone());
        Ok(())
    }

    /// Publish a validated tree without persisting it
    pub fn replace(&self, config: EngineConfig) -> Result<()> {
        let issues = self.validate(&config);
        if !issues.is_empty() {
            return Err(EnhanceError::Config(issues));
        }
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.publish(config);
        Ok(())
    }

    /// Restore and persist the defaults
    pub fn reset_to_default(&self) -> Result<EngineConfig> {
        let defaults = EngineConfig::default_with(&self.declarations());
        self.save(&defaults)?;
        info!("♻️ Configuration reset to defaults");
        Ok(defaults)
    }

    /// Deep-merge a JSON fragment onto the live tree and publish it if valid.
    /// The override is not persisted.
    pub fn apply_override(&self, patch: &Value) -> Result<Arc<EngineConfig>> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut value = serde_json::to_value(&*self.snapshot())?;
        merge_json(&mut value, patch);
        let candidate: EngineConfig = serde_json::from_value(value)?;
        let issues = self.validate(&candidate);
        if !issues.is_empty() {
            return Err(EnhanceError::Config(issues));
        }
        let published = Arc::new(candidate);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&published);
        debug!("Configuration override applied");
        Ok(published)
    }

    /// Write the live tree to another file
    pub fn export_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_atomically(path.as_ref(), &self.snapshot())
    }

    /// Load a tree from another file, repair it, then save and publish it here.
    pub fn import_from<P: AsRef<Path>>(&self, path: P) -> Result<Vec<ConfigError>> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EnhanceError::file_io_error("read config", path, &e))?;
        let loaded = self.load_from_str(&text);
        self.save(&loaded.config)?;
        Ok(loaded.issues)
    }

    fn publish(&self, config: EngineConfig) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
    }
}

fn write_atomically(path: &Path, config: &EngineConfig) -> Result<()> {
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .map_err(|e| EnhanceError::file_io_error("create config directory", dir, &e))?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| EnhanceError::file_io_error("create temporary config in", dir, &e))?;
    serde_json::to_writer_pretty(&mut temp, config)?;
    temp.write_all(b"\n")?;
    temp.as_file().sync_all()?;
    temp.persist(path)
        .map_err(|e| EnhanceError::file_io_error("replace config", path, &e.error))?;
    Ok(())
}

/// Recursively merge `overlay` into `base`. Objects merge key by key; any other
/// value replaces what was there.
pub fn merge_json(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    },
                }
            }
        },
        (base, overlay) => *base = overlay.clone(),
    }
}

const CONTAINER_POINTERS: [&str; 3] = ["/stages", "/quality", "/backends"];

const LEAF_POINTERS: [&str; 9] = [
    "/schema_version",
    "/quality/weights",
    "/quality/anomalies",
    "/quality/scales",
    "/quality/min_score",
    "/backends/naive_fallback",
    "/backends/models",
    "/backends/device",
    "/engine",
];

/// Every repairable subtree of a merged document, containers first
fn subtree_pointers(merged: &Value) -> Vec<String> {
    let mut pointers: Vec<String> = CONTAINER_POINTERS.iter().map(ToString::to_string).collect();
    pointers.extend(LEAF_POINTERS.iter().map(ToString::to_string));
    pointers.extend(BackendTier::MODEL_TIERS.iter().map(|tier| tier_pointer(*tier)));
    if let Some(Value::Object(stages)) = merged.get("stages") {
        pointers.extend(stages.keys().map(|name| stage_pointer(name)));
    }
    pointers
}

fn conforms<T: DeserializeOwned>(value: &Value) -> std::result::Result<(), String> {
    serde_json::from_value::<T>(value.clone())
        .map(drop)
        .map_err(|e| e.to_string())
}

/// Does the subtree at `pointer` deserialize into its declared type?
fn check_shape(pointer: &str, value: &Value) -> std::result::Result<(), String> {
    match pointer {
        "/stages" | "/quality" | "/backends" => {
            if value.is_object() {
                Ok(())
            } else {
                Err("expected an object".to_string())
            }
        },
        "/schema_version" => conforms::<u32>(value),
        "/quality/weights" => conforms::<QualityWeights>(value),
        "/quality/anomalies" => conforms::<AnomalyThresholds>(value),
        "/quality/scales" => conforms::<ScoreScales>(value),
        "/quality/min_score" => conforms::<f64>(value),
        "/backends/naive_fallback" => conforms::<NaiveConfig>(value),
        "/backends/models" => conforms::<BTreeMap<String, ModelEntry>>(value),
        "/backends/device" => conforms::<DeviceConfig>(value),
        "/engine" => conforms::<OrchestrationConfig>(value),
        p if p.starts_with("/backends/") => conforms::<TierConfig>(value),
        p if p.starts_with("/stages/") => conforms::<StageConfig>(value),
        _ => Ok(()),
    }
}

fn unescape_segment(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

/// Replace the subtree at `pointer` with its default, or remove it when no
/// default exists (for example an undeclared stage).
fn reset_subtree(value: &mut Value, defaults: &Value, pointer: &str) {
    if pointer.is_empty() {
        *value = defaults.clone();
        return;
    }
    let Some((parent, last)) = pointer.rsplit_once('/') else {
        return;
    };
    let key = unescape_segment(last);
    let default = defaults.pointer(pointer).cloned();
    let Some(Value::Object(parent_map)) = value.pointer_mut(parent) else {
        return;
    };
    match default {
        Some(default) => {
            parent_map.insert(key, default);
        },
        None => {
            parent_map.remove(&key);
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParamValue;
    use serde_json::json;

    #[test]
    fn test_merge_json_nested() {
        let mut base = json!({"a": {"b": 1, "c": 2}, "d": [1, 2]});
        merge_json(&mut base, &json!({"a": {"c": 3}, "d": [9], "e": true}));
        assert_eq!(base, json!({"a": {"b": 1, "c": 3}, "d": [9], "e": true}));
    }

    #[test]
    fn test_load_from_str_partial_file() {
        let store = ConfigStore::in_memory();
        let loaded = store.load_from_str(r#"{"quality": {"min_score": 0.3}}"#);
        assert!(loaded.is_clean(), "{:?}", loaded.issues);
        assert!((loaded.config.quality.min_score - 0.3).abs() < f64::EPSILON);
        assert_eq!(loaded.config.backends, EngineConfig::default().backends);
    }

    #[test]
    fn test_bad_weights_fall_back_for_that_subtree_only() {
        let store = ConfigStore::in_memory();
        let loaded = store.load_from_str(
            r#"{
                "quality": {
                    "weights": {"edge": 0.3, "contrast": 0.2, "detail": 0.2, "noise": 0.2},
                    "min_score": 0.25
                }
            }"#,
        );
        assert_eq!(loaded.config.quality.weights, QualityWeights::default());
        assert!((loaded.config.quality.min_score - 0.25).abs() < f64::EPSILON);
        assert!(loaded
            .issues
            .iter()
            .any(|issue| issue.subtree == "/quality/weights"));
    }

    #[test]
    fn test_type_errors_repair_only_their_subtree() {
        let store = ConfigStore::in_memory();
        let loaded = store.load_from_str(
            r#"{
                "engine": {"max_scale_factor": "four"},
                "stages": {"sharpening": {"version": 1, "params": {"base_strength": 0.9}}}
            }"#,
        );
        assert_eq!(loaded.config.engine, OrchestrationConfig::default());
        assert_eq!(
            loaded.config.stages["sharpening"].params["base_strength"],
            ParamValue::Float(0.9)
        );
        assert_eq!(loaded.issues.len(), 1);
        assert_eq!(loaded.issues[0].subtree, "/engine");
    }

    #[test]
    fn test_unparseable_document_uses_defaults() {
        let store = ConfigStore::in_memory();
        let loaded = store.load_from_str("{ not json");
        assert_eq!(loaded.config, EngineConfig::default());
        assert_eq!(loaded.issues.len(), 1);
        assert_eq!(loaded.issues[0].subtree, "");
    }

    #[test]
    fn test_apply_override_rejects_invalid() {
        let store = ConfigStore::in_memory();
        let err = store
            .apply_override(&json!({"quality": {"weights": {"edge": 0.9}}}))
            .unwrap_err();
        assert!(matches!(err, EnhanceError::Config(_)));
        assert_eq!(*store.snapshot(), EngineConfig::default());

        let updated = store
            .apply_override(&json!({"backends": {"device": {"wait_timeout_ms": 250}}}))
            .unwrap();
        assert_eq!(updated.backends.device.wait_timeout_ms, 250);
        assert_eq!(store.snapshot().backends.device.wait_timeout_ms, 250);
    }

    #[test]
    fn test_declare_stage_adds_defaults() {
        let store = ConfigStore::in_memory();
        store
            .declare_stage(
                "vignette",
                StageDeclaration::new(
                    2,
                    vec![crate::config::ParameterSpec::float("amount", 0.4, 0.0, 1.0)],
                ),
            )
            .unwrap();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.stages["vignette"].version, 2);
        assert!(store.validate(&snapshot).is_empty());
        assert!(store
            .declare_stage("Bad Name", StageDeclaration::new(1, Vec::new()))
            .is_err());
    }
}
