//! Structured orchestration events
//!
//! The engine defines the event shape; where events go is up to the
//! embedding application. The default sink forwards them to `tracing`.

use crate::backends::BackendTier;
use crate::types::{QualityScore, RejectionReason};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

/// States of the per-request state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Init,
    Analyze,
    PreProcess,
    Execute,
    PostProcess,
    Validate,
    Accept,
    Demote,
    ExhaustedFallback,
}

impl EngineState {
    /// Human-readable description of the state
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            EngineState::Init => "Validating request",
            EngineState::Analyze => "Analyzing image features",
            EngineState::PreProcess => "Running pre-processing stages",
            EngineState::Execute => "Running super-resolution",
            EngineState::PostProcess => "Running post-processing stages",
            EngineState::Validate => "Validating output quality",
            EngineState::Accept => "Output accepted",
            EngineState::Demote => "Demoting to a lower tier",
            EngineState::ExhaustedFallback => "Falling back to naive resampling",
        }
    }
}

/// One observable step of an orchestration call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EnhancementEvent {
    StateEntered {
        request_id: Uuid,
        state: EngineState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tier: Option<BackendTier>,
    },
    TierSelected {
        request_id: Uuid,
        tier: BackendTier,
        /// Why this tier is the starting point
        reason: String,
    },
    TierFailed {
        request_id: Uuid,
        tier: BackendTier,
        error: String,
    },
    ValidationResult {
        request_id: Uuid,
        tier: BackendTier,
        accepted: bool,
        score: QualityScore,
        reasons: Vec<RejectionReason>,
    },
    Demoted {
        request_id: Uuid,
        from: BackendTier,
        to: BackendTier,
        reason: String,
    },
    StageSkipped {
        request_id: Uuid,
        stage: String,
        error: String,
    },
    Completed {
        request_id: Uuid,
        tier: BackendTier,
        retries: usize,
        accepted: bool,
        composite_score: f64,
        total_ms: u64,
    },
}

impl EnhancementEvent {
    #[must_use]
    pub fn request_id(&self) -> Uuid {
        match self {
            Self::StateEntered { request_id, .. }
            | Self::TierSelected { request_id, .. }
            | Self::TierFailed { request_id, .. }
            | Self::ValidationResult { request_id, .. }
            | Self::Demoted { request_id, .. }
            | Self::StageSkipped { request_id, .. }
            | Self::Completed { request_id, .. } => *request_id,
        }
    }
}

/// Receives orchestration events. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EnhancementEvent);
}

/// Forwards events to `tracing` with the event fields as structured fields
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: EnhancementEvent) {
        match &event {
            EnhancementEvent::StateEntered {
                request_id,
                state,
                tier,
            } => tracing::debug!(%request_id, ?state, ?tier, "{}", state.description()),
            EnhancementEvent::TierSelected {
                request_id,
                tier,
                reason,
            } => tracing::info!(%request_id, %tier, %reason, "🎯 Tier selected"),
            EnhancementEvent::TierFailed {
                request_id,
                tier,
                error,
            } => tracing::warn!(%request_id, %tier, %error, "❌ Tier failed"),
            EnhancementEvent::ValidationResult {
                request_id,
                tier,
                accepted,
                score,
                reasons,
            } => tracing::info!(
                %request_id,
                %tier,
                accepted,
                composite = score.composite,
                reasons = ?reasons,
                "📊 Validation result"
            ),
            EnhancementEvent::Demoted {
                request_id,
                from,
                to,
                reason,
            } => tracing::warn!(%request_id, %from, %to, %reason, "⬇️ Demoted"),
            EnhancementEvent::StageSkipped {
                request_id,
                stage,
                error,
            } => tracing::warn!(%request_id, %stage, %error, "⚠️ Stage skipped"),
            EnhancementEvent::Completed {
                request_id,
                tier,
                retries,
                accepted,
                composite_score,
                total_ms,
            } => tracing::info!(
                %request_id,
                %tier,
                retries,
                accepted,
                composite_score,
                total_ms,
                "✅ Enhancement complete"
            ),
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<EnhancementEvent>>,
}

impl MemoryEventSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything received so far
    #[must_use]
    pub fn events(&self) -> Vec<EnhancementEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events of one request, in emission order
    #[must_use]
    pub fn events_for(&self, request_id: Uuid) -> Vec<EnhancementEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.request_id() == request_id)
            .collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: EnhancementEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Discards all events
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn emit(&self, _event: EnhancementEvent) {}
}
