//! Configuration for the Ramp daemon.
//!
//! Loaded from TOML with per-field serde defaults. Health thresholds are
//! deliberately *not* defaulted: risk tolerance differs per feature, and a
//! baked-in value would be a guess. Every feature must be registered with
//! explicit thresholds, either in the config file or through the admin API.

use crate::errors::{Result, RolloutError};
use crate::types::FeatureId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Per-feature health thresholds.
///
/// Two tiers: crossing a `degraded_*` bound pauses the ramp, crossing a
/// `critical_*` bound rolls the feature back on the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureThresholds {
    /// Below this many samples in the window the verdict is
    /// `InsufficientData` and the controller holds position.
    pub min_sample_threshold: u64,
    /// Error rate (0..1) above which the feature is degraded.
    pub degraded_error_rate: f64,
    /// Error rate (0..1) above which the feature is critical.
    pub critical_error_rate: f64,
    /// p95 latency above which the feature is degraded.
    pub degraded_latency_ms: u64,
    /// p95 latency above which the feature is critical.
    pub critical_latency_ms: u64,
}

impl FeatureThresholds {
    /// Reject threshold sets that could never classify sanely.
    pub fn validate(&self) -> Result<()> {
        if self.min_sample_threshold == 0 {
            return Err(RolloutError::Config(
                "min_sample_threshold must be at least 1".to_string(),
            ));
        }
        for (name, rate) in [
            ("degraded_error_rate", self.degraded_error_rate),
            ("critical_error_rate", self.critical_error_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(RolloutError::Config(format!(
                    "{name} must be within [0, 1], got {rate}"
                )));
            }
        }
        if self.critical_error_rate < self.degraded_error_rate {
            return Err(RolloutError::Config(
                "critical_error_rate must be >= degraded_error_rate".to_string(),
            ));
        }
        if self.critical_latency_ms < self.degraded_latency_ms {
            return Err(RolloutError::Config(
                "critical_latency_ms must be >= degraded_latency_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Controller tick, canary, and dwell settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Seconds between evaluation ticks.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Fixed percentage used for the canary stage.
    #[serde(default = "default_canary_percentage")]
    pub canary_percentage: f64,
    /// Percentage added per completed dwell window while ramping.
    #[serde(default = "default_ramp_step_percentage")]
    pub ramp_step_percentage: f64,
    /// Consecutive healthy ticks required before advancing.
    #[serde(default = "default_dwell_ticks")]
    pub dwell_ticks: u32,
    /// Sliding sample window length in seconds.
    #[serde(default = "default_sample_window_secs")]
    pub sample_window_secs: u64,
    /// Hard cap on retained samples per (feature, variant) window.
    #[serde(default = "default_max_window_samples")]
    pub max_window_samples: usize,
    /// Seconds between router snapshot refreshes.
    #[serde(default = "default_router_refresh_secs")]
    pub router_refresh_secs: u64,
}

impl ControllerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn sample_window(&self) -> Duration {
        Duration::from_secs(self.sample_window_secs)
    }

    pub fn router_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.router_refresh_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.canary_percentage) {
            return Err(RolloutError::InvalidPercentage(self.canary_percentage));
        }
        if self.ramp_step_percentage <= 0.0 || self.ramp_step_percentage > 100.0 {
            return Err(RolloutError::Config(format!(
                "ramp_step_percentage must be within (0, 100], got {}",
                self.ramp_step_percentage
            )));
        }
        if self.dwell_ticks == 0 {
            return Err(RolloutError::Config(
                "dwell_ticks must be at least 1".to_string(),
            ));
        }
        if self.tick_interval_secs == 0 {
            return Err(RolloutError::Config(
                "tick_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            canary_percentage: default_canary_percentage(),
            ramp_step_percentage: default_ramp_step_percentage(),
            dwell_ticks: default_dwell_ticks(),
            sample_window_secs: default_sample_window_secs(),
            max_window_samples: default_max_window_samples(),
            router_refresh_secs: default_router_refresh_secs(),
        }
    }
}

/// Daemon-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Port for the admin HTTP API and metrics endpoint.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Path to the rollout state snapshot file (JSON). In-memory only when
    /// unset.
    #[serde(default)]
    pub state_file: Option<String>,
    /// Path to the feature registry snapshot file (JSON). Features
    /// registered through the API are lost on restart when unset.
    #[serde(default)]
    pub features_file: Option<String>,
    /// Path to the audit trail file (JSONL). In-memory only when unset.
    #[serde(default)]
    pub audit_file: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            http_port: default_http_port(),
            state_file: None,
            features_file: None,
            audit_file: None,
        }
    }
}

/// A feature declared in the config file, registered at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSeed {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub thresholds: FeatureThresholds,
}

/// Top-level Ramp configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RampConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub features: Vec<FeatureSeed>,
}

impl RampConfig {
    pub fn validate(&self) -> Result<()> {
        self.controller.validate()?;
        let mut seen = std::collections::HashSet::new();
        for seed in &self.features {
            if !seen.insert(seed.id.as_str()) {
                return Err(RolloutError::FeatureExists(FeatureId::new(&seed.id)));
            }
            seed.thresholds.validate()?;
        }
        Ok(())
    }
}

/// Load and validate a config file.
pub fn load_config(path: &Path) -> Result<RampConfig> {
    let raw = std::fs::read_to_string(path)?;
    let config: RampConfig =
        toml::from_str(&raw).map_err(|e| RolloutError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

fn default_tick_interval_secs() -> u64 {
    30
}

fn default_canary_percentage() -> f64 {
    5.0
}

fn default_ramp_step_percentage() -> f64 {
    20.0
}

fn default_dwell_ticks() -> u32 {
    3
}

fn default_sample_window_secs() -> u64 {
    300
}

fn default_max_window_samples() -> usize {
    10_000
}

fn default_router_refresh_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_http_port() -> u16 {
    7171
}
