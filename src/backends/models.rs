//! Model file resolution and integrity checks

use crate::config::ModelEntry;
use crate::error::{EnhanceError, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// Overrides the model directory
pub const MODEL_DIR_ENV_VAR: &str = "IMGLY_UPSCALE_MODEL_DIR";

/// Directory of super-resolution model files.
///
/// Models are never downloaded; a missing file makes the tier unavailable and
/// the orchestrator demotes past it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelStore {
    root: PathBuf,
}

impl ModelStore {
    #[must_use]
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// `$IMGLY_UPSCALE_MODEL_DIR`, else `<data_dir>/imgly-upscale/models`
    #[must_use]
    pub fn default_root() -> PathBuf {
        if let Ok(dir) = std::env::var(MODEL_DIR_ENV_VAR) {
            return PathBuf::from(dir);
        }
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("imgly-upscale")
            .join("models")
    }

    #[must_use]
    pub fn from_env() -> Self {
        Self::new(Self::default_root())
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the model file, which must exist
    ///
    /// # Errors
    /// - `Model` when the file is missing
    pub fn resolve(&self, model_id: &str, entry: &ModelEntry) -> Result<PathBuf> {
        let path = self.root.join(&entry.file);
        if path.is_file() {
            Ok(path)
        } else {
            Err(EnhanceError::model(format!(
                "model '{model_id}' not found at {}",
                path.display()
            )))
        }
    }

    /// Whether the model file is present, without reading it
    #[must_use]
    pub fn is_available(&self, model_id: &str, entry: &ModelEntry) -> bool {
        self.resolve(model_id, entry).is_ok()
    }

    /// Read the model and verify its checksum when one is configured
    ///
    /// # Errors
    /// - `Model` when the file is missing or its SHA-256 does not match
    /// - `Io` when reading fails
    pub fn load_bytes(&self, model_id: &str, entry: &ModelEntry) -> Result<Vec<u8>> {
        let path = self.resolve(model_id, entry)?;
        let bytes =
            fs::read(&path).map_err(|e| EnhanceError::file_io_error("read model", &path, &e))?;

        if let Some(expected) = &entry.sha256 {
            let actual = hex_digest(&bytes);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(EnhanceError::model(format!(
                    "checksum mismatch for model '{model_id}': expected {expected}, got {actual}"
                )));
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let size_mb = bytes.len() as f64 / (1024.0 * 1024.0);
        log::debug!("📦 Loaded model '{model_id}' ({size_mb:.2} MB)");
        Ok(bytes)
    }
}

impl Default for ModelStore {
    fn default() -> Self {
        Self::from_env()
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
