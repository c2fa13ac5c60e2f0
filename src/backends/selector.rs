//! Tier selection, per-tier circuit breaking and serialized device execution

use super::{
    run_model_tier, BackendTier, ModelStore, ResourceProbe, ResourceSnapshot,
    SuperResolutionBackend, TierParams, TierRequirement,
};
use crate::config::{BackendConfig, BreakerConfig};
use crate::error::{EnhanceError, Result};
use image::RgbImage;
use instant::Instant;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Creates the backend bound to each model tier
pub trait BackendFactory: Send + Sync {
    /// Backend for `tier`, or `None` when this build cannot serve it
    fn create_backend(
        &self,
        tier: BackendTier,
        config: &BackendConfig,
    ) -> Option<Arc<dyn SuperResolutionBackend>>;

    /// Model tiers this factory can serve
    fn available_tiers(&self) -> Vec<BackendTier>;
}

/// ONNX Runtime for the accelerated tiers, Tract for general compute
/// (ONNX Runtime on the CPU when Tract is compiled out)
#[derive(Debug, Clone, Default)]
pub struct DefaultBackendFactory {
    store: ModelStore,
}

impl DefaultBackendFactory {
    #[must_use]
    pub fn new(store: ModelStore) -> Self {
        Self { store }
    }
}

impl BackendFactory for DefaultBackendFactory {
    #[allow(unused_variables)]
    fn create_backend(
        &self,
        tier: BackendTier,
        config: &BackendConfig,
    ) -> Option<Arc<dyn SuperResolutionBackend>> {
        match tier {
            #[cfg(feature = "onnx")]
            BackendTier::AcceleratedPrimary | BackendTier::AcceleratedSecondary => Some(Arc::new(
                super::OnnxSuperResolution::accelerated(self.store.clone(), config.device),
            )),
            #[cfg(feature = "tract")]
            BackendTier::GeneralCompute => {
                Some(Arc::new(super::TractSuperResolution::new(self.store.clone())))
            },
            #[cfg(all(feature = "onnx", not(feature = "tract")))]
            BackendTier::GeneralCompute => Some(Arc::new(super::OnnxSuperResolution::cpu(
                self.store.clone(),
                config.device,
            ))),
            _ => None,
        }
    }

    fn available_tiers(&self) -> Vec<BackendTier> {
        let mut tiers = Vec::new();
        if cfg!(feature = "onnx") {
            tiers.push(BackendTier::AcceleratedPrimary);
            tiers.push(BackendTier::AcceleratedSecondary);
        }
        if cfg!(any(feature = "onnx", feature = "tract")) {
            tiers.push(BackendTier::GeneralCompute);
        }
        tiers
    }
}

/// Binds backends to tiers, checks requirements against a resource snapshot
/// and serializes accelerated executions on the single device.
pub struct BackendSelector {
    backends: BTreeMap<BackendTier, Arc<dyn SuperResolutionBackend>>,
    probe: Arc<dyn ResourceProbe>,
    device: Arc<Mutex<()>>,
    breakers: std::sync::Mutex<BTreeMap<BackendTier, Breaker>>,
}

/// Consecutive failed executions of one tier
#[derive(Debug, Clone, Copy, Default)]
struct Breaker {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl Breaker {
    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.open_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }
}

impl fmt::Debug for BackendSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound: BTreeMap<_, _> = self
            .backends
            .iter()
            .map(|(tier, backend)| (*tier, backend.name().to_string()))
            .collect();
        f.debug_struct("BackendSelector")
            .field("backends", &bound)
            .finish_non_exhaustive()
    }
}

impl BackendSelector {
    #[must_use]
    pub fn new(probe: Arc<dyn ResourceProbe>) -> Self {
        Self {
            backends: BTreeMap::new(),
            probe,
            device: Arc::new(Mutex::new(())),
            breakers: std::sync::Mutex::new(BTreeMap::new()),
        }
    }

    fn breakers(&self) -> std::sync::MutexGuard<'_, BTreeMap<BackendTier, Breaker>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Time left before an open circuit lets `tier` run again
    #[must_use]
    pub fn circuit_open_for(&self, tier: BackendTier) -> Option<Duration> {
        self.breakers()
            .get(&tier)
            .and_then(|breaker| breaker.remaining(Instant::now()))
    }

    fn record_success(&self, tier: BackendTier) {
        if let Some(breaker) = self.breakers().get_mut(&tier) {
            *breaker = Breaker::default();
        }
    }

    fn record_failure(&self, tier: BackendTier, config: BreakerConfig) {
        if config.failure_threshold == 0 {
            return;
        }
        let mut breakers = self.breakers();
        let breaker = breakers.entry(tier).or_default();
        breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);
        if breaker.consecutive_failures >= config.failure_threshold {
            breaker.open_until = Some(Instant::now() + Duration::from_millis(config.cooldown_ms));
            warn!(
                %tier,
                failures = breaker.consecutive_failures,
                cooldown_ms = config.cooldown_ms,
                "🔌 Circuit opened; tier skipped until the cool-down ends"
            );
        }
    }

    /// Bind every tier `factory` can serve
    #[must_use]
    pub fn with_factory(mut self, factory: &dyn BackendFactory, config: &BackendConfig) -> Self {
        for tier in factory.available_tiers() {
            if let Some(backend) = factory.create_backend(tier, config) {
                self.backends.insert(tier, backend);
            }
        }
        self
    }

    /// Bind `backend` to a model tier, replacing any previous binding.
    ///
    /// # Errors
    /// - `InvalidRequest` for the naive fallback, which takes no backend
    pub fn bind(&mut self, tier: BackendTier, backend: Arc<dyn SuperResolutionBackend>) -> Result<()> {
        if tier == BackendTier::NaiveFallback {
            return Err(EnhanceError::invalid_request(
                "the naive fallback cannot be bound to a backend",
            ));
        }
        self.backends.insert(tier, backend);
        Ok(())
    }

    #[must_use]
    pub fn backend(&self, tier: BackendTier) -> Option<Arc<dyn SuperResolutionBackend>> {
        self.backends.get(&tier).cloned()
    }

    /// Handle to the device lock shared by the accelerated tiers
    #[must_use]
    pub fn device_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.device)
    }

    pub async fn snapshot(&self) -> ResourceSnapshot {
        self.probe.snapshot().await
    }

    /// Why `tier` cannot run under `snapshot`, if it cannot
    pub fn check_tier(
        &self,
        tier: BackendTier,
        snapshot: &ResourceSnapshot,
        config: &BackendConfig,
    ) -> std::result::Result<(), String> {
        let Some(tier_config) = config.tier(tier) else {
            return Ok(());
        };
        if !tier_config.enabled {
            return Err("disabled in configuration".to_string());
        }
        if !self.backends.contains_key(&tier) {
            return Err("no backend bound".to_string());
        }
        if let Some(remaining) = self.circuit_open_for(tier) {
            return Err(format!(
                "circuit open after repeated failures; retry in {}ms",
                remaining.as_millis()
            ));
        }
        TierRequirement::from_config(tier_config).check(snapshot)
    }

    /// Highest tier that can run now; the naive fallback when none can
    #[must_use]
    pub fn initial_tier(&self, snapshot: &ResourceSnapshot, config: &BackendConfig) -> BackendTier {
        BackendTier::MODEL_TIERS
            .into_iter()
            .find(|&tier| match self.check_tier(tier, snapshot, config) {
                Ok(()) => true,
                Err(reason) => {
                    debug!(%tier, %reason, "Tier not eligible");
                    false
                },
            })
            .unwrap_or(BackendTier::NaiveFallback)
    }

    /// Run a model tier over `image`.
    ///
    /// Accelerated tiers first acquire the device, waiting at most
    /// `backends.device.wait_timeout_ms`. The work runs on a blocking thread
    /// that holds the device guard until the last tile is done.
    ///
    /// Every outcome except cancellation and an ineligible tier feeds the
    /// tier's circuit breaker.
    ///
    /// # Errors
    /// - `BackendUnavailable` when the tier is ineligible, the device wait
    ///   times out, or the backend panics
    /// - Any error the backend reports
    #[instrument(level = "debug", skip_all, fields(tier = %params.tier, scale))]
    pub async fn execute(
        &self,
        image: Arc<RgbImage>,
        scale: u32,
        params: TierParams,
        snapshot: &ResourceSnapshot,
        config: &BackendConfig,
        cancel: CancellationToken,
    ) -> Result<RgbImage> {
        let tier = params.tier;
        self.check_tier(tier, snapshot, config)
            .map_err(|reason| EnhanceError::backend_unavailable(tier, reason))?;
        let backend = self
            .backend(tier)
            .ok_or_else(|| EnhanceError::backend_unavailable(tier, "no backend bound"))?;

        let result = self.run_on_backend(backend, image, scale, params, config, cancel).await;
        match &result {
            Ok(_) => self.record_success(tier),
            Err(EnhanceError::Cancelled) => {},
            Err(_) => self.record_failure(tier, config.breaker),
        }
        result
    }

    async fn run_on_backend(
        &self,
        backend: Arc<dyn SuperResolutionBackend>,
        image: Arc<RgbImage>,
        scale: u32,
        params: TierParams,
        config: &BackendConfig,
        cancel: CancellationToken,
    ) -> Result<RgbImage> {
        let tier = params.tier;
        let guard = if tier.is_accelerated() {
            let wait = Duration::from_millis(config.device.wait_timeout_ms);
            let guard = tokio::time::timeout(wait, Arc::clone(&self.device).lock_owned())
                .await
                .map_err(|_| {
                    EnhanceError::backend_unavailable(
                        tier,
                        format!("device busy for more than {}ms", config.device.wait_timeout_ms),
                    )
                })?;
            Some(guard)
        } else {
            None
        };

        tokio::task::spawn_blocking(move || {
            let _device = guard;
            run_model_tier(backend.as_ref(), &image, scale, &params, &cancel)
        })
        .await
        .map_err(|e| EnhanceError::backend_unavailable(tier, format!("backend worker failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::StaticResourceProbe;
    use crate::config::EngineConfig;

    struct Doubler;

    impl SuperResolutionBackend for Doubler {
        fn name(&self) -> &str {
            "doubler"
        }

        fn upscale_tile(&self, tile: &RgbImage, _params: &TierParams) -> Result<RgbImage> {
            Ok(image::imageops::resize(
                tile,
                tile.width() * 2,
                tile.height() * 2,
                image::imageops::FilterType::Nearest,
            ))
        }
    }

    fn selector(snapshot: ResourceSnapshot) -> BackendSelector {
        let mut selector = BackendSelector::new(Arc::new(StaticResourceProbe(snapshot)));
        for tier in BackendTier::MODEL_TIERS {
            selector.bind(tier, Arc::new(Doubler)).unwrap();
        }
        selector
    }

    fn params(tier: BackendTier, config: &EngineConfig) -> TierParams {
        TierParams::derive(
            tier,
            config,
            &crate::types::FeatureVector::default(),
            crate::types::ContentHint::Photo,
            64,
        )
        .unwrap()
    }

    #[test]
    fn test_initial_tier_follows_resources() {
        let config = EngineConfig::default().backends;
        assert_eq!(
            selector(ResourceSnapshot::with_device(4096)).initial_tier(&ResourceSnapshot::with_device(4096), &config),
            BackendTier::AcceleratedPrimary
        );
        assert_eq!(
            selector(ResourceSnapshot::with_device(1500)).initial_tier(&ResourceSnapshot::with_device(1500), &config),
            BackendTier::AcceleratedSecondary
        );
        assert_eq!(
            selector(ResourceSnapshot::cpu_only()).initial_tier(&ResourceSnapshot::cpu_only(), &config),
            BackendTier::GeneralCompute
        );

        let empty = BackendSelector::new(Arc::new(StaticResourceProbe(ResourceSnapshot::cpu_only())));
        assert_eq!(
            empty.initial_tier(&ResourceSnapshot::cpu_only(), &config),
            BackendTier::NaiveFallback
        );
    }

    #[test]
    fn test_naive_cannot_be_bound() {
        let mut selector = selector(ResourceSnapshot::cpu_only());
        assert!(selector.bind(BackendTier::NaiveFallback, Arc::new(Doubler)).is_err());
    }

    #[tokio::test]
    async fn test_device_wait_times_out() {
        let config = EngineConfig::builder()
            .device_wait_timeout_ms(20)
            .build()
            .unwrap();
        let snapshot = ResourceSnapshot::with_device(8192);
        let selector = selector(snapshot);
        let lock = selector.device_lock();
        let _held = lock.lock().await;

        let image = Arc::new(RgbImage::new(8, 8));
        let accelerated = selector
            .execute(
                Arc::clone(&image),
                2,
                params(BackendTier::AcceleratedPrimary, &config),
                &snapshot,
                &config.backends,
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(
            accelerated,
            Err(EnhanceError::BackendUnavailable { tier: BackendTier::AcceleratedPrimary, .. })
        ));

        // CPU tiers never wait for the device
        let cpu = selector
            .execute(
                image,
                2,
                params(BackendTier::GeneralCompute, &config),
                &snapshot,
                &config.backends,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(cpu.dimensions(), (16, 16));
    }

    struct Refuses;

    impl SuperResolutionBackend for Refuses {
        fn name(&self) -> &str {
            "refuses"
        }

        fn upscale_tile(&self, _tile: &RgbImage, _params: &TierParams) -> Result<RgbImage> {
            Err(EnhanceError::inference("refused"))
        }
    }

    async fn run_once(
        selector: &BackendSelector,
        config: &EngineConfig,
        snapshot: ResourceSnapshot,
    ) -> Result<RgbImage> {
        selector
            .execute(
                Arc::new(RgbImage::new(8, 8)),
                2,
                params(BackendTier::GeneralCompute, config),
                &snapshot,
                &config.backends,
                CancellationToken::new(),
            )
            .await
    }

    #[tokio::test]
    async fn test_circuit_opens_after_consecutive_failures_and_closes_after_cooldown() {
        let config = EngineConfig::builder().breaker(2, 50).build().unwrap();
        let snapshot = ResourceSnapshot::cpu_only();
        let mut selector = selector(snapshot);
        let tier = BackendTier::GeneralCompute;

        selector.bind(tier, Arc::new(Refuses)).unwrap();
        assert!(run_once(&selector, &config, snapshot).await.is_err());
        assert!(selector.check_tier(tier, &snapshot, &config.backends).is_ok());
        assert!(run_once(&selector, &config, snapshot).await.is_err());

        let reason = selector
            .check_tier(tier, &snapshot, &config.backends)
            .unwrap_err();
        assert!(reason.contains("circuit open"), "{reason}");
        assert!(selector.circuit_open_for(tier).is_some());
        assert_eq!(
            selector.initial_tier(&snapshot, &config.backends),
            BackendTier::NaiveFallback
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(selector.check_tier(tier, &snapshot, &config.backends).is_ok());

        selector.bind(tier, Arc::new(Doubler)).unwrap();
        assert!(run_once(&selector, &config, snapshot).await.is_ok());
        assert!(run_once(&selector, &config, snapshot).await.is_ok());
        assert!(selector.circuit_open_for(tier).is_none());
    }

    #[tokio::test]
    async fn test_disabled_breaker_never_opens() {
        let config = EngineConfig::builder().breaker(0, 0).build().unwrap();
        let snapshot = ResourceSnapshot::cpu_only();
        let mut selector = selector(snapshot);
        selector.bind(BackendTier::GeneralCompute, Arc::new(Refuses)).unwrap();
        for _ in 0..5 {
            assert!(run_once(&selector, &config, snapshot).await.is_err());
        }
        assert!(selector.circuit_open_for(BackendTier::GeneralCompute).is_none());
    }

    #[test]
    fn test_default_factory_tiers() {
        let factory = DefaultBackendFactory::default();
        let config = EngineConfig::default().backends;
        for tier in factory.available_tiers() {
            assert!(factory.create_backend(tier, &config).is_some(), "{tier}");
        }
        assert!(factory
            .create_backend(BackendTier::NaiveFallback, &config)
            .is_none());
    }
}
