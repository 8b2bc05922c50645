//! Error types for the sentience orchestration core.

use std::time::Duration;

use thiserror::Error;

use crate::gateway::{GatewayError, InferenceError};
use crate::state_machine::{AgentEvent, AgentState};

/// Result type alias for core operations.
pub type SentienceResult<T> = Result<T, SentienceError>;

/// Errors surfaced by the core components and the orchestration facade.
#[derive(Error, Debug)]
pub enum SentienceError {
    #[error("Unknown emotion: {0}")]
    UnknownEmotion(String),

    #[error("Invalid transition: {event:?} is not accepted in state {from:?}")]
    InvalidTransition { from: AgentState, event: AgentEvent },

    #[error("Circuit open: inference service unavailable")]
    CircuitOpen,

    #[error("Circuit half-open: trial call already in flight")]
    CircuitHalfOpenBusy,

    #[error("Gateway timeout after {0:?}")]
    GatewayTimeout(Duration),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Core is shutting down")]
    ShuttingDown,
}

impl SentienceError {
    /// True for the degraded-mode signals callers are expected to answer with a fallback.
    pub fn is_degraded(&self) -> bool {
        matches!(self, SentienceError::CircuitOpen | SentienceError::CircuitHalfOpenBusy)
    }
}

impl From<sled::Error> for SentienceError {
    fn from(err: sled::Error) -> Self {
        SentienceError::PersistenceUnavailable(err.to_string())
    }
}

impl From<GatewayError<InferenceError>> for SentienceError {
    fn from(err: GatewayError<InferenceError>) -> Self {
        match err {
            GatewayError::CircuitOpen => SentienceError::CircuitOpen,
            GatewayError::HalfOpenBusy => SentienceError::CircuitHalfOpenBusy,
            GatewayError::Timeout(after) => SentienceError::GatewayTimeout(after),
            GatewayError::Inner(e) => SentienceError::Inference(e.to_string()),
        }
    }
}

impl From<config::ConfigError> for SentienceError {
    fn from(err: config::ConfigError) -> Self {
        SentienceError::Config(err.to_string())
    }
}

impl From<toml::de::Error> for SentienceError {
    fn from(err: toml::de::Error) -> Self {
        SentienceError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for SentienceError {
    fn from(err: toml::ser::Error) -> Self {
        SentienceError::Config(err.to_string())
    }
}

/// Reports a broken internal invariant.
///
/// Debug builds abort the current operation with [`SentienceError::InvariantViolation`].
/// Release builds log and return `Ok(())` so the caller can clamp and continue.
pub(crate) fn invariant_violation(message: impl Into<String>) -> SentienceResult<()> {
    let message = message.into();
    if cfg!(debug_assertions) {
        Err(SentienceError::InvariantViolation(message))
    } else {
        tracing::warn!(target: "sentience::invariant", violation = %message, "invariant violated; clamping");
        Ok(())
    }
}
