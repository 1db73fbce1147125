//! Error taxonomy for the rollout controller.
//!
//! Routing-path failures never reach callers (the router degrades to the
//! legacy variant instead); controller-path failures are logged, alerted,
//! and leave the feature in its last good state.

use crate::types::{FeatureId, RolloutCommand, Stage};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("unknown feature: {0}")]
    UnknownFeature(FeatureId),

    #[error("feature already registered: {0}")]
    FeatureExists(FeatureId),

    #[error("percentage out of range [0, 100]: {0}")]
    InvalidPercentage(f64),

    #[error("command '{cmd}' is not valid from stage '{from}'", cmd = .command.name())]
    InvalidTransition { from: Stage, command: RolloutCommand },

    /// Soft: the evaluator cannot classify; the controller holds position.
    #[error("insufficient samples to classify feature {0}")]
    InsufficientData(FeatureId),

    /// The authoritative store cannot be read or persisted. The router keeps
    /// serving its last-known-good snapshot; the controller suspends ticking.
    #[error("state store unavailable: {0}")]
    StateStoreUnavailable(String),

    /// A compare-and-update lost the race against a concurrent transition.
    #[error("concurrent transition conflict for feature {feature}")]
    ConcurrentTransitionConflict { feature: FeatureId },

    /// Audit persistence failed after retries. Alerted, but never reverts
    /// the already-applied transition.
    #[error("audit write failure: {0}")]
    AuditWriteFailure(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RolloutError>;
