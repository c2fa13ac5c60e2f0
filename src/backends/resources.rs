//! Runtime resource probing

use super::ResourceSnapshot;
use crate::config::{DeviceConfig, ExecutionProvider};
use async_trait::async_trait;

/// Reports free device memory when the driver cannot
pub const DEVICE_MEMORY_ENV_VAR: &str = "IMGLY_UPSCALE_DEVICE_MEMORY_MB";

/// Source of the resource snapshot taken at the start of each request
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn snapshot(&self) -> ResourceSnapshot;
}

/// Probes the machine: accelerator availability through ONNX Runtime's
/// execution providers, free memory from config or the environment.
#[derive(Debug, Clone, Copy)]
pub struct SystemResourceProbe {
    device: DeviceConfig,
}

impl SystemResourceProbe {
    #[must_use]
    pub fn new(device: DeviceConfig) -> Self {
        Self { device }
    }

    fn device_available(provider: ExecutionProvider) -> bool {
        if provider == ExecutionProvider::Cpu {
            return false;
        }
        #[cfg(feature = "onnx")]
        {
            super::onnx::OnnxSuperResolution::accelerator_available(provider)
        }
        #[cfg(not(feature = "onnx"))]
        {
            false
        }
    }

    fn device_memory_mb(&self) -> Option<u64> {
        self.device.device_memory_mb.or_else(|| {
            std::env::var(DEVICE_MEMORY_ENV_VAR)
                .ok()
                .and_then(|value| value.trim().parse().ok())
        })
    }
}

#[async_trait]
impl ResourceProbe for SystemResourceProbe {
    async fn snapshot(&self) -> ResourceSnapshot {
        let provider = self.device.execution_provider;
        let device_available = tokio::task::spawn_blocking(move || Self::device_available(provider))
            .await
            .unwrap_or(false);
        let snapshot = ResourceSnapshot {
            device_available,
            free_device_memory_mb: if device_available {
                self.device_memory_mb()
            } else {
                None
            },
            ..ResourceSnapshot::cpu_only()
        };
        tracing::debug!(?snapshot, "Resource snapshot");
        snapshot
    }
}

/// Always reports the same snapshot
#[derive(Debug, Clone, Copy)]
pub struct StaticResourceProbe(pub ResourceSnapshot);

#[async_trait]
impl ResourceProbe for StaticResourceProbe {
    async fn snapshot(&self) -> ResourceSnapshot {
        self.0
    }
}
