//! Backend tiers and their resource requirements

use crate::config::TierConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Capability tiers, ordered from least to most capable.
///
/// Degradation only ever moves downwards through this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendTier {
    /// Lanczos resize; cannot fail and is never validated
    NaiveFallback,
    /// CPU inference
    GeneralCompute,
    /// Device inference with a lighter model
    AcceleratedSecondary,
    /// Device inference with the best model for the content
    AcceleratedPrimary,
}

impl BackendTier {
    /// Every tier, most capable first
    pub const DESCENDING: [BackendTier; 4] = [
        Self::AcceleratedPrimary,
        Self::AcceleratedSecondary,
        Self::GeneralCompute,
        Self::NaiveFallback,
    ];

    /// Tiers backed by a learned model
    pub const MODEL_TIERS: [BackendTier; 3] = [
        Self::AcceleratedPrimary,
        Self::AcceleratedSecondary,
        Self::GeneralCompute,
    ];

    /// The tier one step below, or `None` from the naive fallback
    #[must_use]
    pub fn next_lower(self) -> Option<Self> {
        match self {
            Self::AcceleratedPrimary => Some(Self::AcceleratedSecondary),
            Self::AcceleratedSecondary => Some(Self::GeneralCompute),
            Self::GeneralCompute => Some(Self::NaiveFallback),
            Self::NaiveFallback => None,
        }
    }

    #[must_use]
    pub fn is_accelerated(self) -> bool {
        matches!(self, Self::AcceleratedPrimary | Self::AcceleratedSecondary)
    }

    /// Key of this tier in the `backends` config subtree
    #[must_use]
    pub fn config_key(self) -> &'static str {
        match self {
            Self::AcceleratedPrimary => "accelerated_primary",
            Self::AcceleratedSecondary => "accelerated_secondary",
            Self::GeneralCompute => "general_compute",
            Self::NaiveFallback => "naive_fallback",
        }
    }
}

impl fmt::Display for BackendTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.config_key())
    }
}

/// Expected responsiveness of a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyClass {
    Interactive,
    Batch,
    Slow,
}

/// Point-in-time view of the machine, taken once per orchestration call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub device_available: bool,
    /// `None` when the device does not report free memory
    pub free_device_memory_mb: Option<u64>,
    pub cpu_threads: usize,
}

impl ResourceSnapshot {
    /// A machine without an accelerator
    #[must_use]
    pub fn cpu_only() -> Self {
        Self {
            device_available: false,
            free_device_memory_mb: None,
            cpu_threads: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1),
        }
    }

    /// A machine with an accelerator reporting `free_memory_mb`
    #[must_use]
    pub fn with_device(free_memory_mb: u64) -> Self {
        Self {
            device_available: true,
            free_device_memory_mb: Some(free_memory_mb),
            ..Self::cpu_only()
        }
    }
}

/// What a tier needs from the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierRequirement {
    pub requires_device: bool,
    pub min_device_memory_mb: u64,
    pub latency: LatencyClass,
}

impl TierRequirement {
    /// The naive fallback needs nothing
    #[must_use]
    pub fn none() -> Self {
        Self {
            requires_device: false,
            min_device_memory_mb: 0,
            latency: LatencyClass::Slow,
        }
    }

    #[must_use]
    pub fn from_config(config: &TierConfig) -> Self {
        Self {
            requires_device: config.requires_device,
            min_device_memory_mb: config.min_device_memory_mb,
            latency: config.latency,
        }
    }

    /// `Ok` when the snapshot satisfies this requirement, else the reason it does not.
    /// Unknown free memory is treated as sufficient.
    pub fn check(&self, snapshot: &ResourceSnapshot) -> Result<(), String> {
        if !self.requires_device {
            return Ok(());
        }
        if !snapshot.device_available {
            return Err("no accelerator device available".to_string());
        }
        match snapshot.free_device_memory_mb {
            Some(free) if free < self.min_device_memory_mb => Err(format!(
                "{free} MB free device memory, {} MB required",
                self.min_device_memory_mb
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(BackendTier::AcceleratedPrimary > BackendTier::AcceleratedSecondary);
        assert!(BackendTier::AcceleratedSecondary > BackendTier::GeneralCompute);
        assert!(BackendTier::GeneralCompute > BackendTier::NaiveFallback);
        let mut sorted = BackendTier::DESCENDING;
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(sorted, BackendTier::DESCENDING);
    }

    #[test]
    fn test_next_lower_walks_every_tier() {
        let mut walked = vec![BackendTier::AcceleratedPrimary];
        while let Some(next) = walked.last().and_then(|tier| tier.next_lower()) {
            walked.push(next);
        }
        assert_eq!(walked, BackendTier::DESCENDING);
    }

    #[test]
    fn test_requirement_check() {
        let requirement = TierRequirement {
            requires_device: true,
            min_device_memory_mb: 2048,
            latency: LatencyClass::Interactive,
        };
        assert!(requirement.check(&ResourceSnapshot::with_device(4096)).is_ok());
        assert!(requirement.check(&ResourceSnapshot::with_device(1024)).is_err());
        assert!(requirement.check(&ResourceSnapshot::cpu_only()).is_err());

        let unknown_memory = ResourceSnapshot {
            device_available: true,
            free_device_memory_mb: None,
            cpu_threads: 4,
        };
        assert!(requirement.check(&unknown_memory).is_ok());
        assert!(TierRequirement::none().check(&ResourceSnapshot::cpu_only()).is_ok());
    }

    #[test]
    fn test_tier_serde_names() {
        assert_eq!(
            serde_json::to_string(&BackendTier::GeneralCompute).unwrap(),
            "\"general_compute\""
        );
        assert_eq!(BackendTier::AcceleratedPrimary.to_string(), "accelerated_primary");
    }
}
