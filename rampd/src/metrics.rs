//! Prometheus metrics for the rollout daemon.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    /// State transitions, labeled by destination stage.
    pub static ref TRANSITIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("ramp_transitions_total", "Rollout state transitions"),
        &["to_stage"],
    )
    .unwrap();

    /// Rollbacks, labeled by trigger (automatic vs. manual).
    pub static ref ROLLBACKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("ramp_rollbacks_total", "Features rolled back to 0%"),
        &["trigger"],
    )
    .unwrap();

    pub static ref SAMPLES_INGESTED_TOTAL: IntCounter = IntCounter::new(
        "ramp_samples_ingested_total",
        "Health samples accepted into the ingestion channel",
    )
    .unwrap();

    /// Samples dropped because the ingestion channel was full. Loss here is
    /// tolerated; the counter exists so sustained loss is visible.
    pub static ref SAMPLES_DROPPED_TOTAL: IntCounter = IntCounter::new(
        "ramp_samples_dropped_total",
        "Health samples dropped at ingestion",
    )
    .unwrap();

    /// Audit records that could not be persisted after retries. Compliance
    /// record loss is a reportable event; this must alert.
    pub static ref AUDIT_WRITE_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "ramp_audit_write_failures_total",
        "Audit trail writes that failed after retries",
    )
    .unwrap();

    pub static ref CONFLICT_RETRIES_TOTAL: IntCounter = IntCounter::new(
        "ramp_conflict_retries_total",
        "State transitions retried after a version conflict",
    )
    .unwrap();

    pub static ref ROLLOUT_PERCENTAGE: GaugeVec = GaugeVec::new(
        Opts::new("ramp_rollout_percentage", "Current rollout percentage"),
        &["feature"],
    )
    .unwrap();

    pub static ref FEATURES_REGISTERED: IntGauge = IntGauge::new(
        "ramp_features_registered",
        "Features known to the registry",
    )
    .unwrap();
}

/// Register all metrics with the daemon registry.
///
/// Safe to call more than once; duplicate registrations are ignored.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(TRANSITIONS_TOTAL.clone()),
        Box::new(ROLLBACKS_TOTAL.clone()),
        Box::new(SAMPLES_INGESTED_TOTAL.clone()),
        Box::new(SAMPLES_DROPPED_TOTAL.clone()),
        Box::new(AUDIT_WRITE_FAILURES_TOTAL.clone()),
        Box::new(CONFLICT_RETRIES_TOTAL.clone()),
        Box::new(ROLLOUT_PERCENTAGE.clone()),
        Box::new(FEATURES_REGISTERED.clone()),
    ];
    for collector in collectors {
        let _ = REGISTRY.register(collector);
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> prometheus::Result<String> {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        register_metrics();
        register_metrics();
        TRANSITIONS_TOTAL.with_label_values(&["canary"]).inc();
        let output = encode_metrics().unwrap();
        assert!(output.contains("ramp_transitions_total"));
    }

    #[test]
    fn gauge_tracks_percentage() {
        register_metrics();
        ROLLOUT_PERCENTAGE.with_label_values(&["widget"]).set(25.0);
        let output = encode_metrics().unwrap();
        assert!(output.contains("ramp_rollout_percentage"));
    }
}
