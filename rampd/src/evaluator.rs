//! Health evaluation.
//!
//! [`classify`] is a pure function of the current aggregate and the
//! feature's thresholds; it carries no memory of prior verdicts. Hysteresis
//! (dwell counters, pause/resume) belongs to the controller, which keeps the
//! evaluator trivially testable.

use crate::registry::FeatureRegistry;
use crate::sampler::SampleWindows;
use ramp_common::{FeatureId, FeatureThresholds, HealthAggregate, Variant, Verdict};
use std::sync::Arc;

/// Classify an aggregate against two threshold tiers.
///
/// Too few samples yields `InsufficientData`: the controller must neither
/// advance nor roll back on weak evidence, which guards low-traffic features
/// against premature action.
pub fn classify(aggregate: &HealthAggregate, thresholds: &FeatureThresholds) -> Verdict {
    if aggregate.sample_count < thresholds.min_sample_threshold {
        return Verdict::InsufficientData;
    }
    if aggregate.error_rate > thresholds.critical_error_rate
        || aggregate.p95_latency_ms > thresholds.critical_latency_ms
    {
        return Verdict::Critical;
    }
    if aggregate.error_rate > thresholds.degraded_error_rate
        || aggregate.p95_latency_ms > thresholds.degraded_latency_ms
    {
        return Verdict::Degraded;
    }
    Verdict::Healthy
}

/// Evaluates the new-variant health of registered features.
pub struct HealthEvaluator {
    windows: Arc<SampleWindows>,
    registry: Arc<FeatureRegistry>,
}

impl HealthEvaluator {
    pub fn new(windows: Arc<SampleWindows>, registry: Arc<FeatureRegistry>) -> Self {
        Self { windows, registry }
    }

    /// Verdict for a feature's new variant. Unknown features read as
    /// `InsufficientData` so the controller holds rather than guesses.
    pub fn evaluate(&self, feature_id: &FeatureId) -> Verdict {
        let Some(thresholds) = self.registry.thresholds(feature_id) else {
            return Verdict::InsufficientData;
        };
        let aggregate = self.windows.aggregate(feature_id, Variant::New);
        classify(&aggregate, &thresholds)
    }

    /// Current aggregate, for state-inspection endpoints.
    pub fn aggregate(&self, feature_id: &FeatureId, variant: Variant) -> HealthAggregate {
        self.windows.aggregate(feature_id, variant)
    }
}
