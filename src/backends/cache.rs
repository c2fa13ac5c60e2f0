//! In-memory cache of loaded models
//!
//! Backends keep one loaded artefact (session, parsed graph, compiled plans)
//! per model slot. Each entry remembers the file and checksum it was built
//! from; a config reload that points a slot at a different file or checksum
//! replaces the entry instead of serving the stale one.

use super::TierParams;
use crate::config::ModelEntry;
use crate::error::{EnhanceError, Result};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Model identifier and the noise level it was resolved for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelSlot {
    pub model_id: String,
    pub noise_level: u8,
}

/// What a cached entry was built from
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    file: String,
    sha256: Option<String>,
}

impl Fingerprint {
    fn of(model: &ModelEntry) -> Self {
        Self {
            file: model.file.clone(),
            sha256: model.sha256.clone(),
        }
    }
}

#[derive(Debug)]
struct Entry<T> {
    fingerprint: Fingerprint,
    value: T,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub loads: u64,
    /// Loads that replaced an entry built from another file or checksum
    pub reloads: u64,
}

#[derive(Debug)]
struct Inner<T> {
    entries: HashMap<ModelSlot, Entry<T>>,
    stats: ModelCacheStats,
}

/// Loaded models keyed by [`ModelSlot`]; at most one entry per slot
#[derive(Debug)]
pub struct ModelCache<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for ModelCache<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                stats: ModelCacheStats::default(),
            }),
        }
    }
}

impl<T> ModelCache<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make sure the slot of `params` holds an entry built from its current
    /// file and checksum, calling `load` on a miss or a stale entry.
    ///
    /// The lock is held while `load` runs, so concurrent callers never load
    /// the same slot twice.
    ///
    /// # Errors
    /// Whatever `load` returns; the previous entry is dropped either way when
    /// it was stale.
    pub fn ensure(&self, params: &TierParams, load: impl FnOnce() -> Result<T>) -> Result<()> {
        let slot = params.slot();
        let fingerprint = Fingerprint::of(&params.model);
        let mut inner = self.lock();

        let stale = match inner.entries.get(&slot) {
            Some(entry) if entry.fingerprint == fingerprint => {
                inner.stats.hits += 1;
                return Ok(());
            },
            Some(_) => true,
            None => false,
        };
        if stale {
            log::info!(
                "♻️ Model '{}' now points at '{}'; dropping the cached copy",
                slot.model_id,
                fingerprint.file
            );
            inner.entries.remove(&slot);
            inner.stats.entries = inner.entries.len();
        }

        let value = load()?;
        inner.stats.loads += 1;
        if stale {
            inner.stats.reloads += 1;
        }
        inner.entries.insert(slot, Entry { fingerprint, value });
        inner.stats.entries = inner.entries.len();
        Ok(())
    }

    /// Run `f` on the entry for `params`.
    ///
    /// # Errors
    /// - `Internal` when the slot was never prepared or was built from
    ///   another file
    /// - Whatever `f` returns
    pub fn with_entry<R>(&self, params: &TierParams, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let slot = params.slot();
        let fingerprint = Fingerprint::of(&params.model);
        let mut inner = self.lock();
        match inner.entries.get_mut(&slot) {
            Some(entry) if entry.fingerprint == fingerprint => f(&mut entry.value),
            _ => Err(EnhanceError::internal(format!(
                "model '{}' ({}) not prepared",
                slot.model_id, fingerprint.file
            ))),
        }
    }

    #[must_use]
    pub fn stats(&self) -> ModelCacheStats {
        self.lock().stats
    }

    /// Sum of `measure` over every entry
    pub fn total(&self, measure: impl Fn(&T) -> usize) -> usize {
        self.lock().entries.values().map(|entry| measure(&entry.value)).sum()
    }

    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let removed = inner.entries.len();
        inner.entries.clear();
        inner.stats.entries = 0;
        removed
    }
}
