//! Ordered, name-keyed stage registry

use super::{builtin_stages, ProcessingStage, StageDeclarations, StagePhase};
use crate::config::is_valid_stage_name;
use crate::error::{EnhanceError, Result};
use std::sync::Arc;

/// A stage together with its registry-level switch
#[derive(Debug, Clone)]
pub struct RegisteredStage {
    pub stage: Arc<dyn ProcessingStage>,
    pub enabled: bool,
}

/// Holds stages in execution order. Names are unique.
///
/// Disabling a stage here is independent of the `enabled` flag in its config
/// subtree; a stage runs only when both allow it.
#[derive(Debug, Default, Clone)]
pub struct StageRegistry {
    stages: Vec<RegisteredStage>,
}

impl StageRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the default stage set, all enabled
    #[must_use]
    pub fn with_builtin_stages() -> Self {
        let stages = builtin_stages()
            .into_iter()
            .map(|stage| RegisteredStage {
                stage,
                enabled: true,
            })
            .collect();
        Self { stages }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.stage.name() == name)
    }

    fn require(&self, name: &str) -> Result<usize> {
        self.position(name)
            .ok_or_else(|| EnhanceError::UnknownStage(name.to_string()))
    }

    /// Whether `stage` could be registered without changing anything
    ///
    /// # Errors
    /// `InvalidRequest` for a malformed name, `DuplicateStage` when taken
    pub fn admit(&self, stage: &Arc<dyn ProcessingStage>) -> Result<()> {
        let name = stage.name();
        if !is_valid_stage_name(name) {
            return Err(EnhanceError::invalid_request(format!(
                "stage name '{name}' must be lowercase ascii letters, digits, '_' or '-'"
            )));
        }
        if self.position(name).is_some() {
            return Err(EnhanceError::DuplicateStage(name.to_string()));
        }
        Ok(())
    }

    /// Append a stage at the end of the order
    pub fn register(&mut self, stage: Arc<dyn ProcessingStage>) -> Result<()> {
        self.admit(&stage)?;
        log::debug!("Registered stage '{}' ({:?})", stage.name(), stage.phase());
        self.stages.push(RegisteredStage {
            stage,
            enabled: true,
        });
        Ok(())
    }

    /// Insert a stage at `index`, clamped to the current length
    pub fn insert(&mut self, index: usize, stage: Arc<dyn ProcessingStage>) -> Result<()> {
        self.admit(&stage)?;
        let index = index.min(self.stages.len());
        self.stages.insert(
            index,
            RegisteredStage {
                stage,
                enabled: true,
            },
        );
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> Result<Arc<dyn ProcessingStage>> {
        let index = self.require(name)?;
        log::debug!("Unregistered stage '{name}'");
        Ok(self.stages.remove(index).stage)
    }

    /// Move one stage to `index`, clamped to the last position
    pub fn move_stage(&mut self, name: &str, index: usize) -> Result<()> {
        let from = self.require(name)?;
        let entry = self.stages.remove(from);
        let index = index.min(self.stages.len());
        self.stages.insert(index, entry);
        Ok(())
    }

    /// Replace the whole order. `order` must name every registered stage once.
    pub fn reorder(&mut self, order: &[&str]) -> Result<()> {
        if order.len() != self.stages.len() {
            return Err(EnhanceError::invalid_request(format!(
                "reorder lists {} stages but {} are registered",
                order.len(),
                self.stages.len()
            )));
        }
        let mut remaining = self.stages.clone();
        let mut reordered = Vec::with_capacity(order.len());
        for name in order {
            let index = remaining
                .iter()
                .position(|s| s.stage.name() == *name)
                .ok_or_else(|| EnhanceError::UnknownStage((*name).to_string()))?;
            reordered.push(remaining.remove(index));
        }
        self.stages = reordered;
        Ok(())
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<()> {
        let index = self.require(name)?;
        if let Some(entry) = self.stages.get_mut(index) {
            entry.enabled = enabled;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_enabled(&self, name: &str) -> Option<bool> {
        self.position(name)
            .and_then(|i| self.stages.get(i))
            .map(|s| s.enabled)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ProcessingStage>> {
        self.position(name)
            .and_then(|i| self.stages.get(i))
            .map(|s| Arc::clone(&s.stage))
    }

    /// Stage names in execution order
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.stages
            .iter()
            .map(|s| s.stage.name().to_string())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredStage> {
        self.stages.iter()
    }

    /// Enabled stages of one phase, in order
    #[must_use]
    pub fn enabled_in(&self, phase: StagePhase) -> Vec<Arc<dyn ProcessingStage>> {
        self.stages
            .iter()
            .filter(|s| s.enabled && s.stage.phase() == phase)
            .map(|s| Arc::clone(&s.stage))
            .collect()
    }

    /// Declarations of every registered stage, enabled or not
    #[must_use]
    pub fn declarations(&self) -> StageDeclarations {
        self.stages
            .iter()
            .map(|s| (s.stage.name().to_string(), s.stage.declaration()))
            .collect()
    }
}
