//! Error types for enhancement and upscaling operations

use crate::backends::BackendTier;
use crate::types::RejectionReason;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EnhanceError>;

/// A single configuration problem found while loading or validating the config tree.
///
/// `subtree` is the JSON pointer of the smallest section that is replaced with its
/// defaults when the problem is repaired (for example `/quality/weights` or
/// `/stages/sharpening`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{subtree}: {message}")]
pub struct ConfigError {
    pub subtree: String,
    pub parameter: Option<String>,
    pub message: String,
}

impl ConfigError {
    pub fn new<S: Into<String>, M: Into<String>>(subtree: S, message: M) -> Self {
        Self {
            subtree: subtree.into(),
            parameter: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn with_parameter<S: Into<String>>(mut self, parameter: S) -> Self {
        self.parameter = Some(parameter.into());
        self
    }
}

/// Error taxonomy of the engine
#[derive(Error, Debug)]
pub enum EnhanceError {
    /// Input/output errors (config file, model file, image file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding/encoding errors
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// Config tree (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// One or more configuration invariants are violated
    #[error("Configuration rejected: {}", format_issues(.0))]
    Config(Vec<ConfigError>),

    /// Invalid builder or runtime parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A pipeline stage failed; absorbed by the pipeline and reported
    #[error("Stage '{stage}' failed: {message}")]
    StageExecution { stage: String, message: String },

    /// The backend bound to a tier cannot run right now
    #[error("Backend for tier {tier} unavailable: {reason}")]
    BackendUnavailable { tier: BackendTier, reason: String },

    /// Output of a tier failed quality validation
    #[error("Output of tier {tier} rejected: {}", format_reasons(.reasons))]
    ValidationRejected {
        tier: BackendTier,
        reasons: Vec<RejectionReason>,
    },

    /// Even the naive fallback could not produce a correctly sized image
    #[error("Fallback exhausted: {0}")]
    FallbackExhausted(String),

    /// A stage with the same name is already registered
    #[error("Stage '{0}' is already registered")]
    DuplicateStage(String),

    /// No stage with this name is registered
    #[error("Unknown stage '{0}'")]
    UnknownStage(String),

    /// The request itself cannot be processed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The request was cancelled by its caller
    #[error("Request cancelled")]
    Cancelled,

    /// Model resolution or loading errors
    #[error("Model error: {0}")]
    Model(String),

    /// Backend inference errors
    #[error("Inference error: {0}")]
    Inference(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_issues(issues: &[ConfigError]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_reasons(reasons: &[RejectionReason]) -> String {
    reasons
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl EnhanceError {
    /// Create a new invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a new stage execution error
    pub fn stage<S: Into<String>, M: Into<String>>(stage: S, msg: M) -> Self {
        Self::StageExecution {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    /// Create a new backend availability error
    pub fn backend_unavailable<S: Into<String>>(tier: BackendTier, reason: S) -> Self {
        Self::BackendUnavailable {
            tier,
            reason: reason.into(),
        }
    }

    /// Create a new invalid request error
    pub fn invalid_request<S: Into<String>>(msg: S) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a new fallback error
    pub fn fallback_exhausted<S: Into<String>>(msg: S) -> Self {
        Self::FallbackExhausted(msg.into())
    }

    /// Create a new model error
    pub fn model<S: Into<String>>(msg: S) -> Self {
        Self::Model(msg.into())
    }

    /// Create a new inference error
    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::Inference(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create file I/O error with operation context
    pub fn file_io_error<P: AsRef<std::path::Path>>(
        operation: &str,
        path: P,
        error: &std::io::Error,
    ) -> Self {
        let path_display = path.as_ref().display();
        Self::Io(std::io::Error::new(
            error.kind(),
            format!("Failed to {operation} '{path_display}': {error}"),
        ))
    }

    /// Create configuration error with valid ranges
    pub fn config_value_error<T: std::fmt::Display>(
        parameter: &str,
        value: T,
        valid_range: &str,
    ) -> Self {
        Self::InvalidConfig(format!(
            "Invalid {parameter}: {value} (valid range: {valid_range})"
        ))
    }

    /// Whether the orchestrator may recover from this error by demoting to a lower tier
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable { .. }
                | Self::ValidationRejected { .. }
                | Self::StageExecution { .. }
                | Self::Model(_)
                | Self::Inference(_)
        )
    }
}
