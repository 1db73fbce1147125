//! Common types used across Ramp components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema version stamped into persisted audit records and state snapshots.
pub const PERSISTED_SCHEMA_VERSION: u32 = 1;

/// Unique identifier for a feature undergoing migration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureId(pub String);

impl FeatureId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FeatureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two implementations a feature can route to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// The known-safe legacy/mock data source.
    Legacy,
    /// The real backend data source being rolled out.
    New,
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Legacy => write!(f, "legacy"),
            Self::New => write!(f, "new"),
        }
    }
}

/// Rollout stage of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Not rolling out; everyone sees the legacy variant.
    Off,
    /// Fixed small percentage to gather early signal.
    Canary,
    /// Percentage increasing toward the target on a dwell schedule.
    Ramping,
    /// Target reached; rollout complete.
    Full,
    /// Held at the current percentage, no automatic movement.
    Paused,
    /// Forced to 0%; requires a manual re-arm to leave.
    RolledBack,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::Canary => write!(f, "canary"),
            Self::Ramping => write!(f, "ramping"),
            Self::Full => write!(f, "full"),
            Self::Paused => write!(f, "paused"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// Health classification produced by the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Healthy,
    Degraded,
    Critical,
    /// Too few samples in the window to classify.
    InsufficientData,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Critical => write!(f, "critical"),
            Self::InsufficientData => write!(f, "insufficient_data"),
        }
    }
}

/// What initiated a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionTrigger {
    Automatic,
    Manual,
}

/// Who put a feature into `Paused`.
///
/// A degraded-verdict pause auto-resumes once health recovers; an operator
/// pause only resumes on an explicit `resume` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseOrigin {
    Operator,
    Degraded,
}

/// A named unit of migration. Immutable once created; deactivated, never
/// deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub description: String,
    pub created_at: DateTime<Utc>,
    /// Deactivated features route everyone to legacy and are skipped by the
    /// controller tick.
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Feature {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: FeatureId::new(id),
            description: description.into(),
            created_at: Utc::now(),
            active: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Authoritative rollout record for one feature.
///
/// Mutated only through controller transitions; the `version` field enforces
/// single-writer semantics on the state store (compare-and-update).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutState {
    pub feature_id: FeatureId,
    /// Fraction of eligible users routed to the new variant, in [0, 100].
    pub current_percentage: f64,
    /// The percentage the controller is advancing toward.
    pub target_percentage: f64,
    pub stage: Stage,
    pub last_transition_at: DateTime<Utc>,
    /// Health classification at the time of the last decision.
    pub last_verdict: Option<Verdict>,
    /// Per-feature seed keeping a user's assignment stable across the ramp.
    pub sticky_assignment_seed: u64,
    /// Dwell counter: consecutive healthy evaluation ticks at the current
    /// percentage.
    pub consecutive_healthy_ticks: u32,
    /// Set while `stage == Paused`.
    pub pause_origin: Option<PauseOrigin>,
    /// Stage to return to when a pause lifts.
    pub paused_from: Option<Stage>,
    /// Monotonic write version for compare-and-update.
    pub version: u64,
}

impl RolloutState {
    /// Fresh `Off/0%` state for a newly registered feature.
    pub fn initial(feature_id: FeatureId, seed: u64) -> Self {
        Self {
            feature_id,
            current_percentage: 0.0,
            target_percentage: 0.0,
            stage: Stage::Off,
            last_transition_at: Utc::now(),
            last_verdict: None,
            sticky_assignment_seed: seed,
            consecutive_healthy_ticks: 0,
            pause_origin: None,
            paused_from: None,
            version: 0,
        }
    }
}

/// Raw per-request health observation.
///
/// Ephemeral: folded into rolling aggregates and discarded once it falls out
/// of the window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSample {
    pub feature_id: FeatureId,
    pub variant: Variant,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

/// Rolling-window aggregate per (feature, variant).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthAggregate {
    pub sample_count: u64,
    /// Fraction of failed samples, in [0, 1].
    pub error_rate: f64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
}

impl HealthAggregate {
    pub fn empty() -> Self {
        Self {
            sample_count: 0,
            error_rate: 0.0,
            p50_latency_ms: 0,
            p95_latency_ms: 0,
        }
    }
}

/// Immutable append-only record of one state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub timestamp: DateTime<Utc>,
    pub feature_id: FeatureId,
    pub from_stage: Stage,
    pub to_stage: Stage,
    pub from_percentage: f64,
    pub to_percentage: f64,
    pub trigger: TransitionTrigger,
    /// Free text or a verdict snapshot.
    pub reason: String,
    /// Operator id, or `system` for automatic transitions.
    pub actor: String,
}

fn default_schema_version() -> u32 {
    PERSISTED_SCHEMA_VERSION
}

/// Event emitted to notification sinks on every transition.
///
/// Delivery is at-least-once; `event_id` lets downstream consumers
/// deduplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutEvent {
    pub event_id: uuid::Uuid,
    pub feature_id: FeatureId,
    pub from_stage: Stage,
    pub to_stage: Stage,
    pub trigger: TransitionTrigger,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Manual operator commands accepted by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "command")]
pub enum RolloutCommand {
    /// `Off -> Canary` at the configured canary percentage.
    Start { target_percentage: f64 },
    /// Freeze at the current percentage.
    Pause,
    /// Leave an operator pause and continue ramping.
    Resume,
    /// Force to `RolledBack/0%`.
    Rollback { reason: String },
    /// Leave `RolledBack` and return to `Off`; rotates the sticky seed.
    Rearm,
    /// Abandon a paused rollout and return to `Off`.
    Abandon,
}

impl RolloutCommand {
    /// Short name for logs and audit reasons.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Rollback { .. } => "rollback",
            Self::Rearm => "rearm",
            Self::Abandon => "abandon",
        }
    }
}

/// A command plus the context it was issued with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub feature_id: FeatureId,
    pub command: RolloutCommand,
    pub actor: String,
    pub issued_at: DateTime<Utc>,
}

impl CommandEnvelope {
    pub fn new(feature_id: FeatureId, command: RolloutCommand, actor: impl Into<String>) -> Self {
        Self {
            feature_id,
            command,
            actor: actor.into(),
            issued_at: Utc::now(),
        }
    }
}
