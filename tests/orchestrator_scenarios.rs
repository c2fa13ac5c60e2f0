//! End-to-end orchestration scenarios with scripted backends
//!
//! Covers tier demotion, the naive fallback, degradation budgets,
//! cancellation, device contention, batch ordering and the event stream.

mod common;

use common::{all_tiers, base_builder, engine_with, gray, textured, transparent, Script};
use imgly_upscale::config::{EngineConfig, NoiseLevelConfig};
use imgly_upscale::types::AttemptOutcome;
use imgly_upscale::{
    BackendTier, EngineState, EnhanceError, EnhancementEvent, MemoryEventSink, RejectionReason,
    ResourceSnapshot, UpscaleRequest,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn states(events: &[EnhancementEvent]) -> Vec<EngineState> {
    events
        .iter()
        .filter_map(|event| match event {
            EnhancementEvent::StateEntered { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_transparent_image_falls_back_to_naive_when_every_tier_fails() {
    let sink = Arc::new(MemoryEventSink::new());
    let (engine, backends) = engine_with(
        all_tiers(Script::Fail, Script::Fail, Script::Fail),
        EngineConfig::default(),
        Arc::clone(&sink),
    );

    let result = engine
        .enhance(UpscaleRequest::new(transparent(100, 100), 2))
        .await
        .unwrap();

    assert_eq!(result.dimensions(), (200, 200));
    assert_eq!(result.report.tier_used, BackendTier::NaiveFallback);
    assert!(result.report.accepted);
    assert!(result.report.fully_degraded);
    assert_eq!(result.report.retries, BackendTier::DESCENDING.len() - 1);
    assert_eq!(result.report.tier_sequence(), BackendTier::DESCENDING.to_vec());
    assert!(backends.iter().all(|backend| backend.calls() > 0));

    let events = sink.events_for(result.report.request_id);
    let failures = events
        .iter()
        .filter(|e| matches!(e, EnhancementEvent::TierFailed { .. }))
        .count();
    assert_eq!(failures, 3);
    assert!(states(&events).contains(&EngineState::ExhaustedFallback));
}

#[tokio::test]
async fn test_uniform_output_is_rejected_but_naive_uniform_result_is_returned() {
    let (engine, _) = engine_with(
        all_tiers(Script::Uniform(128), Script::Uniform(128), Script::Uniform(128)),
        EngineConfig::default(),
        Arc::new(MemoryEventSink::new()),
    );

    let result = engine
        .enhance(UpscaleRequest::new(gray(32, 32, 128), 3))
        .await
        .unwrap();

    assert_eq!(result.dimensions(), (96, 96));
    assert_eq!(result.report.tier_used, BackendTier::NaiveFallback);
    assert!(result.report.accepted);
    assert!(result.report.quality_score.flags.is_uniform);

    for attempt in &result.report.attempts[..3] {
        match &attempt.outcome {
            AttemptOutcome::Rejected { reasons } => assert!(reasons
                .iter()
                .any(|r| matches!(r, RejectionReason::Uniform { .. }))),
            other => panic!("expected a rejection on {}, got {other:?}", attempt.tier),
        }
    }
    assert_eq!(result.report.attempts[3].outcome, AttemptOutcome::Fallback);
}

#[tokio::test]
async fn test_demotion_is_monotonic_across_mixed_failures() {
    let (engine, backends) = engine_with(
        all_tiers(Script::Black, Script::Panic, Script::Resize),
        EngineConfig::default(),
        Arc::new(MemoryEventSink::new()),
    );

    let result = engine
        .enhance(UpscaleRequest::new(textured(48, 40), 2))
        .await
        .unwrap();

    assert_eq!(result.report.tier_used, BackendTier::GeneralCompute);
    assert_eq!(result.report.retries, 2);
    assert!(!result.report.fully_degraded);
    assert!(backends[2].calls() > 0);

    let sequence = result.report.tier_sequence();
    assert!(sequence.windows(2).all(|pair| pair[0] > pair[1]));

    let outcomes: Vec<_> = result.report.attempts.iter().map(|a| &a.outcome).collect();
    assert!(matches!(outcomes[0], AttemptOutcome::Rejected { .. }));
    assert!(matches!(outcomes[1], AttemptOutcome::Failed { .. }));
    assert_eq!(outcomes[2], &AttemptOutcome::Accepted);
}

#[tokio::test]
async fn test_degradation_budget_jumps_to_naive() {
    let (engine, backends) = engine_with(
        all_tiers(Script::Fail, Script::Fail, Script::Resize),
        EngineConfig::default(),
        Arc::new(MemoryEventSink::new()),
    );

    let result = engine
        .enhance(UpscaleRequest::new(textured(32, 32), 2).with_degradation_budget(0))
        .await
        .unwrap();
    assert_eq!(
        result.report.tier_sequence(),
        vec![BackendTier::AcceleratedPrimary, BackendTier::NaiveFallback]
    );
    assert_eq!(result.report.retries, 1);

    let result = engine
        .enhance(UpscaleRequest::new(textured(32, 32), 2).with_degradation_budget(1))
        .await
        .unwrap();
    assert_eq!(
        result.report.tier_sequence(),
        vec![
            BackendTier::AcceleratedPrimary,
            BackendTier::AcceleratedSecondary,
            BackendTier::NaiveFallback
        ]
    );
    assert_eq!(backends[2].calls(), 0);
}

#[tokio::test]
async fn test_ineligible_accelerated_tiers_are_not_retries() {
    let sink = Arc::new(MemoryEventSink::new());
    let engine = base_builder(
        EngineConfig::default(),
        ResourceSnapshot::cpu_only(),
        Arc::clone(&sink),
    )
    .backend(
        BackendTier::AcceleratedPrimary,
        common::ScriptedBackend::new("primary", Script::Resize),
    )
    .backend(
        BackendTier::GeneralCompute,
        common::ScriptedBackend::new("general", Script::Resize),
    )
    .build()
    .unwrap();

    let result = engine
        .enhance(UpscaleRequest::new(textured(40, 30), 2))
        .await
        .unwrap();
    assert_eq!(result.report.tier_used, BackendTier::GeneralCompute);
    assert_eq!(result.report.retries, 0);
    assert!(sink.events_for(result.report.request_id).iter().any(|e| matches!(
        e,
        EnhancementEvent::TierSelected {
            tier: BackendTier::GeneralCompute,
            ..
        }
    )));
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let (engine, backends) = engine_with(
        all_tiers(Script::Resize, Script::Resize, Script::Resize),
        EngineConfig::default(),
        Arc::new(MemoryEventSink::new()),
    );
    let token = CancellationToken::new();
    token.cancel();

    let result = engine
        .enhance(UpscaleRequest::new(textured(16, 16), 2).with_cancellation(token))
        .await;
    assert!(matches!(result, Err(EnhanceError::Cancelled)));
    assert!(backends.iter().all(|backend| backend.calls() == 0));
}

#[tokio::test]
async fn test_cancellation_during_execute_is_not_a_tier_failure() {
    let token = CancellationToken::new();
    let (engine, backends) = engine_with(
        all_tiers(
            Script::CancelThenResize(token.clone()),
            Script::Resize,
            Script::Resize,
        ),
        EngineConfig::default(),
        Arc::new(MemoryEventSink::new()),
    );

    let result = engine
        .enhance(UpscaleRequest::new(textured(16, 16), 2).with_cancellation(token))
        .await;
    assert!(matches!(result, Err(EnhanceError::Cancelled)));
    assert_eq!(backends[1].calls(), 0);
    assert_eq!(backends[2].calls(), 0);
}

#[tokio::test]
async fn test_busy_device_demotes_to_cpu_tier() {
    let config = EngineConfig::builder()
        .device_wait_timeout_ms(20)
        .build()
        .unwrap();
    let (engine, backends) = engine_with(
        all_tiers(Script::Resize, Script::Resize, Script::Resize),
        config,
        Arc::new(MemoryEventSink::new()),
    );

    let _held = engine.selector().device_lock().lock_owned().await;
    let result = engine
        .enhance(UpscaleRequest::new(textured(32, 24), 2))
        .await
        .unwrap();

    assert_eq!(result.report.tier_used, BackendTier::GeneralCompute);
    assert_eq!(result.report.retries, 2);
    assert_eq!(backends[0].calls(), 0);
    assert_eq!(backends[1].calls(), 0);
    match &result.report.attempts[0].outcome {
        AttemptOutcome::Failed { error } => assert!(error.contains("device busy")),
        other => panic!("expected a device timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_output_dimensions_always_match_the_scale() {
    for script in [Script::Resize, Script::Fail] {
        let (engine, _) = engine_with(
            all_tiers(script.clone(), script.clone(), script),
            EngineConfig::default(),
            Arc::new(MemoryEventSink::new()),
        );
        for (w, h, scale) in [(1, 1, 2), (17, 9, 3), (64, 33, 4), (20, 20, 1)] {
            let result = engine
                .enhance(UpscaleRequest::new(textured(w, h), scale))
                .await
                .unwrap();
            assert_eq!(result.dimensions(), (w * scale, h * scale));
            assert_eq!(result.report.output_dimensions, (w * scale, h * scale));
        }
    }
}

#[tokio::test]
async fn test_batch_keeps_input_order() {
    let (engine, _) = engine_with(
        all_tiers(
            Script::Fail,
            Script::SlowResize(Duration::from_millis(5)),
            Script::Resize,
        ),
        EngineConfig::default(),
        Arc::new(MemoryEventSink::new()),
    );
    let sizes = [(40, 10), (12, 12), (30, 20), (8, 24)];
    let requests = sizes
        .iter()
        .map(|&(w, h)| UpscaleRequest::new(textured(w, h), 2))
        .collect();

    let results = engine.enhance_batch(requests, Some(3)).await;
    assert_eq!(results.len(), sizes.len());
    for (result, (w, h)) in results.into_iter().zip(sizes) {
        let result = result.unwrap();
        assert_eq!(result.report.input_dimensions, (w, h));
        assert_eq!(result.dimensions(), (w * 2, h * 2));
    }
}

#[tokio::test]
async fn test_event_sequence_of_an_accepted_request() {
    let sink = Arc::new(MemoryEventSink::new());
    let engine = base_builder(
        EngineConfig::default(),
        ResourceSnapshot::cpu_only(),
        Arc::clone(&sink),
    )
    .backend(
        BackendTier::GeneralCompute,
        common::ScriptedBackend::new("general", Script::Resize),
    )
    .build()
    .unwrap();

    let result = engine
        .enhance(UpscaleRequest::new(textured(24, 24), 2))
        .await
        .unwrap();
    let events = sink.events_for(result.report.request_id);

    assert_eq!(
        states(&events),
        vec![
            EngineState::Init,
            EngineState::Analyze,
            EngineState::PreProcess,
            EngineState::Execute,
            EngineState::PostProcess,
            EngineState::Validate,
            EngineState::Accept,
        ]
    );
    assert!(events.iter().any(|e| matches!(
        e,
        EnhancementEvent::ValidationResult { accepted: true, .. }
    )));
    match events.last() {
        Some(EnhancementEvent::Completed { tier, retries, .. }) => {
            assert_eq!(*tier, BackendTier::GeneralCompute);
            assert_eq!(*retries, 0);
        },
        other => panic!("expected completion last, got {other:?}"),
    }
}

#[tokio::test]
async fn test_noise_level_picks_the_model_variant_and_is_reported() {
    let mut results = Vec::new();
    for threshold in [10.0, 0.0] {
        let mut config = EngineConfig::default();
        config.backends.general_compute.noise = NoiseLevelConfig {
            low_threshold: threshold,
            high_threshold: threshold,
        };
        let engine = base_builder(
            config,
            ResourceSnapshot::cpu_only(),
            Arc::new(MemoryEventSink::new()),
        );
        let backend = common::ScriptedBackend::new("general", Script::Resize);
        let engine = engine
            .backend(
                BackendTier::GeneralCompute,
                Arc::clone(&backend) as Arc<dyn imgly_upscale::SuperResolutionBackend>,
            )
            .build()
            .unwrap();

        let result = engine
            .enhance(UpscaleRequest::new(textured(24, 24), 2))
            .await
            .unwrap();
        let attempt = result.report.attempts[0].clone();
        results.push((attempt, backend.model_files()));
    }

    let (clean, clean_files) = &results[0];
    let (noisy, noisy_files) = &results[1];
    assert_eq!(clean.noise_level, Some(0));
    assert_eq!(noisy.noise_level, Some(2));
    assert_eq!(clean.model_file.as_deref(), Some("waifu2x_upconv7_scale2x.onnx"));
    assert_eq!(
        noisy.model_file.as_deref(),
        Some("waifu2x_upconv7_noise2_scale2x.onnx")
    );
    assert!(clean_files.iter().all(|f| f == "waifu2x_upconv7_scale2x.onnx"));
    assert!(noisy_files.iter().all(|f| f == "waifu2x_upconv7_noise2_scale2x.onnx"));
    assert!(!noisy_files.is_empty());
}

#[tokio::test]
async fn test_repeatedly_failing_tier_is_skipped_while_its_circuit_is_open() {
    let config = EngineConfig::builder().breaker(2, 60_000).build().unwrap();
    let (engine, backends) = engine_with(
        all_tiers(Script::Fail, Script::Resize, Script::Resize),
        config,
        Arc::new(MemoryEventSink::new()),
    );

    for _ in 0..2 {
        let result = engine
            .enhance(UpscaleRequest::new(textured(24, 24), 2))
            .await
            .unwrap();
        assert_eq!(
            result.report.tier_sequence(),
            vec![BackendTier::AcceleratedPrimary, BackendTier::AcceleratedSecondary]
        );
    }
    let primary_calls = backends[0].calls();

    let result = engine
        .enhance(UpscaleRequest::new(textured(24, 24), 2))
        .await
        .unwrap();
    assert_eq!(result.report.tier_used, BackendTier::AcceleratedSecondary);
    assert_eq!(result.report.retries, 0);
    assert_eq!(result.report.attempts.len(), 1);
    assert_eq!(backends[0].calls(), primary_calls);
    assert!(engine
        .selector()
        .circuit_open_for(BackendTier::AcceleratedPrimary)
        .is_some());

    let availability = engine.tier_availability().await;
    let primary = &availability[0];
    assert_eq!(primary.0, BackendTier::AcceleratedPrimary);
    assert!(matches!(&primary.1, Err(reason) if reason.contains("circuit open")));
}
