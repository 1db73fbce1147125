//! Shared types and utilities for the Ramp rollout controller.
//!
//! This crate holds everything both the daemon and external callers need to
//! agree on: the feature/rollout data model, per-feature threshold
//! configuration, the error taxonomy, and the sticky assignment hash used by
//! the variant router.

pub mod config;
pub mod errors;
pub mod sticky;
pub mod types;

pub use config::{ControllerConfig, FeatureThresholds, RampConfig, load_config};
pub use errors::RolloutError;
pub use sticky::{assignment_bucket, fresh_seed};
pub use types::{
    AuditEntry, CommandEnvelope, Feature, FeatureId, HealthAggregate, HealthSample, PauseOrigin,
    RolloutCommand, RolloutEvent, RolloutState, Stage, TransitionTrigger, Variant, Verdict,
};
