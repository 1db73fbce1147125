//! Rollout state machine.
//!
//! One controller owns all features; transitions for a single feature are
//! serialized through a per-feature async mutex, so two concurrent ticks can
//! never both decide to advance the same feature. Planning is split into
//! pure functions ([`plan_automatic`], [`plan_command`]) over the current
//! state, with commits going through the store's compare-and-update.
//!
//! Hysteresis rules:
//! - advancing requires `dwell_ticks` consecutive healthy verdicts at the
//!   current percentage;
//! - a `Critical` verdict bypasses dwell entirely and rolls back on the
//!   next tick;
//! - `RolledBack` is sticky: only a manual re-arm leaves it, so a failed
//!   feature cannot oscillate back on its own.
//!
//! Manual commands take precedence: a command applied mid-cycle marks the
//! feature so the automatic evaluation for that cycle is dropped.

use crate::audit::AuditTrail;
use crate::evaluator::HealthEvaluator;
use crate::metrics;
use crate::notify::SinkSet;
use crate::registry::FeatureRegistry;
use crate::store::StateStore;
use chrono::Utc;
use ramp_common::errors::{Result, RolloutError};
use ramp_common::{
    AuditEntry, CommandEnvelope, ControllerConfig, FeatureId, PauseOrigin, RolloutCommand,
    RolloutEvent, RolloutState, Stage, TransitionTrigger, Verdict, fresh_seed,
    types::PERSISTED_SCHEMA_VERSION,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Actor recorded for automatic transitions.
const SYSTEM_ACTOR: &str = "system";

/// A fully-resolved transition, ready to commit.
#[derive(Debug, Clone)]
struct PlannedTransition {
    to_stage: Stage,
    to_percentage: f64,
    /// Set when the command changes the target (start, rearm, abandon).
    new_target: Option<f64>,
    reason: String,
    pause_origin: Option<PauseOrigin>,
    paused_from: Option<Stage>,
    rotate_seed: bool,
}

/// Outcome of evaluating one automatic tick.
#[derive(Debug)]
enum AutoDecision {
    /// No decision was made; the tick is logged as a no-op.
    Hold(&'static str),
    /// The healthy-dwell counter advances, but no transition happens yet.
    Dwell(u32),
    Transition(PlannedTransition),
}

/// Per-feature cycle bookkeeping guarded by the feature's transition lock.
#[derive(Default)]
struct FeatureCycle {
    /// Set when a manual command lands; suppresses the automatic decision
    /// for the cycle it raced with.
    manual_this_cycle: bool,
}

/// The rollout controller: consumes verdicts and operator commands, mutates
/// the state store, and records every transition.
pub struct RolloutController {
    config: ControllerConfig,
    registry: Arc<FeatureRegistry>,
    store: Arc<StateStore>,
    evaluator: Arc<HealthEvaluator>,
    audit: Arc<AuditTrail>,
    sinks: SinkSet,
    cycles: Mutex<HashMap<FeatureId, Arc<Mutex<FeatureCycle>>>>,
}

impl RolloutController {
    pub fn new(
        config: ControllerConfig,
        registry: Arc<FeatureRegistry>,
        store: Arc<StateStore>,
        evaluator: Arc<HealthEvaluator>,
        audit: Arc<AuditTrail>,
        sinks: SinkSet,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            evaluator,
            audit,
            sinks,
            cycles: Mutex::new(HashMap::new()),
        }
    }

    /// Apply a manual operator command immediately.
    ///
    /// The command is processed under the feature's transition lock, not
    /// queued behind the scheduler, and suppresses the automatic decision
    /// for the current cycle: manual intent always wins.
    pub async fn submit_command(&self, envelope: CommandEnvelope) -> Result<RolloutState> {
        let cycle = self.cycle_handle(&envelope.feature_id).await;
        let mut cycle_guard = cycle.lock().await;

        let mut attempt = 0;
        loop {
            let base = self
                .store
                .get(&envelope.feature_id)
                .ok_or_else(|| RolloutError::UnknownFeature(envelope.feature_id.clone()))?;
            let planned = plan_command(&base, &envelope.command, &self.config)?;
            let next = build_next(&base, &planned, None);

            match self.store.compare_and_update(base.version, next.clone()) {
                Ok(_) => {
                    let next = self
                        .store
                        .get(&envelope.feature_id)
                        .unwrap_or(next);
                    self.record_transition(
                        &base,
                        &next,
                        TransitionTrigger::Manual,
                        &planned.reason,
                        &envelope.actor,
                    );
                    cycle_guard.manual_this_cycle = true;
                    return Ok(next);
                }
                Err(RolloutError::ConcurrentTransitionConflict { .. }) if attempt == 0 => {
                    // Retry once against the now-current state.
                    metrics::CONFLICT_RETRIES_TOTAL.inc();
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One evaluation cycle across all active features.
    pub async fn tick(&self) {
        if !self.store.is_available() {
            warn!("State store unavailable; suspending automatic evaluation this tick");
            return;
        }
        for feature_id in self.registry.active_ids() {
            self.tick_feature(&feature_id).await;
        }
    }

    /// Evaluate and possibly transition a single feature.
    pub async fn tick_feature(&self, feature_id: &FeatureId) {
        let cycle = self.cycle_handle(feature_id).await;
        let mut cycle_guard = cycle.lock().await;

        if cycle_guard.manual_this_cycle {
            cycle_guard.manual_this_cycle = false;
            debug!(feature = %feature_id, "Automatic tick dropped: manual command won this cycle");
            return;
        }

        let Some(base) = self.store.get(feature_id) else {
            warn!(feature = %feature_id, "No rollout state for registered feature");
            return;
        };
        let verdict = self.evaluator.evaluate(feature_id);

        match plan_automatic(&base, verdict, &self.config) {
            AutoDecision::Hold(reason) => {
                debug!(feature = %feature_id, verdict = %verdict, "Tick no-op: {}", reason);
            }
            AutoDecision::Dwell(ticks) => {
                let mut next = base.clone();
                next.consecutive_healthy_ticks = ticks;
                next.last_verdict = Some(verdict);
                // Losing a dwell increment to a conflict is harmless; the
                // next tick re-earns it.
                if let Err(e) = self.store.compare_and_update(base.version, next) {
                    warn!(feature = %feature_id, "Dwell update dropped: {}", e);
                } else {
                    debug!(
                        feature = %feature_id,
                        ticks,
                        required = self.config.dwell_ticks,
                        "Healthy dwell tick"
                    );
                }
            }
            AutoDecision::Transition(planned) => {
                self.commit_automatic(feature_id, &base, planned, verdict);
            }
        }
    }

    /// Commit an automatic transition, retrying once on a version conflict
    /// by re-planning against the fresh state.
    fn commit_automatic(
        &self,
        feature_id: &FeatureId,
        base: &RolloutState,
        planned: PlannedTransition,
        verdict: Verdict,
    ) {
        let next = build_next(base, &planned, Some(verdict));
        match self.store.compare_and_update(base.version, next.clone()) {
            Ok(_) => {
                let next = self.store.get(feature_id).unwrap_or(next);
                self.record_transition(
                    base,
                    &next,
                    TransitionTrigger::Automatic,
                    &planned.reason,
                    SYSTEM_ACTOR,
                );
            }
            Err(RolloutError::ConcurrentTransitionConflict { .. }) => {
                metrics::CONFLICT_RETRIES_TOTAL.inc();
                let Some(fresh) = self.store.get(feature_id) else {
                    return;
                };
                if let AutoDecision::Transition(replanned) =
                    plan_automatic(&fresh, verdict, &self.config)
                {
                    let next = build_next(&fresh, &replanned, Some(verdict));
                    match self.store.compare_and_update(fresh.version, next.clone()) {
                        Ok(_) => {
                            let next = self.store.get(feature_id).unwrap_or(next);
                            self.record_transition(
                                &fresh,
                                &next,
                                TransitionTrigger::Automatic,
                                &replanned.reason,
                                SYSTEM_ACTOR,
                            );
                        }
                        Err(e) => {
                            warn!(feature = %feature_id, "Transition dropped after retry: {}", e);
                        }
                    }
                }
            }
            Err(e) => warn!(feature = %feature_id, "Transition failed: {}", e),
        }
    }

    /// Audit, notify, and update metrics for a committed transition.
    fn record_transition(
        &self,
        base: &RolloutState,
        next: &RolloutState,
        trigger: TransitionTrigger,
        reason: &str,
        actor: &str,
    ) {
        let stage_label = next.stage.to_string();
        let trigger_label = match trigger {
            TransitionTrigger::Automatic => "automatic",
            TransitionTrigger::Manual => "manual",
        };
        metrics::TRANSITIONS_TOTAL
            .with_label_values(&[stage_label.as_str()])
            .inc();
        if next.stage == Stage::RolledBack {
            metrics::ROLLBACKS_TOTAL
                .with_label_values(&[trigger_label])
                .inc();
        }
        metrics::ROLLOUT_PERCENTAGE
            .with_label_values(&[next.feature_id.as_str()])
            .set(next.current_percentage);

        self.audit.append(AuditEntry {
            schema_version: PERSISTED_SCHEMA_VERSION,
            timestamp: next.last_transition_at,
            feature_id: next.feature_id.clone(),
            from_stage: base.stage,
            to_stage: next.stage,
            from_percentage: base.current_percentage,
            to_percentage: next.current_percentage,
            trigger,
            reason: reason.to_string(),
            actor: actor.to_string(),
        });

        self.sinks.notify_all(&RolloutEvent {
            event_id: uuid::Uuid::new_v4(),
            feature_id: next.feature_id.clone(),
            from_stage: base.stage,
            to_stage: next.stage,
            trigger,
            reason: reason.to_string(),
            timestamp: next.last_transition_at,
        });

        info!(
            feature = %next.feature_id,
            from = %base.stage,
            to = %next.stage,
            from_pct = base.current_percentage,
            to_pct = next.current_percentage,
            trigger = trigger_label,
            "Rollout transition committed"
        );
    }

    async fn cycle_handle(&self, feature_id: &FeatureId) -> Arc<Mutex<FeatureCycle>> {
        let mut cycles = self.cycles.lock().await;
        Arc::clone(cycles.entry(feature_id.clone()).or_default())
    }

    /// Periodic tick loop.
    pub fn start_tick_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.tick_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            info!("Rollout controller started (tick interval: {:?})", interval);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }
}

/// Materialize the successor state for a planned transition.
///
/// Any transition resets the dwell counter: after a resume or a percentage
/// step, health must be re-proven at the new level before advancing again.
fn build_next(
    base: &RolloutState,
    planned: &PlannedTransition,
    verdict: Option<Verdict>,
) -> RolloutState {
    let mut next = base.clone();
    next.stage = planned.to_stage;
    next.current_percentage = planned.to_percentage;
    if let Some(target) = planned.new_target {
        next.target_percentage = target;
    }
    next.last_transition_at = Utc::now();
    if let Some(verdict) = verdict {
        next.last_verdict = Some(verdict);
    }
    next.consecutive_healthy_ticks = 0;
    next.pause_origin = planned.pause_origin;
    next.paused_from = planned.paused_from;
    if planned.rotate_seed {
        next.sticky_assignment_seed = fresh_seed();
    }
    next
}

/// Plan the automatic decision for one tick. Pure function of the current
/// state, the verdict, and configuration.
fn plan_automatic(
    state: &RolloutState,
    verdict: Verdict,
    config: &ControllerConfig,
) -> AutoDecision {
    match verdict {
        // No evidence, no decision: distinct from Paused, where a decision
        // to hold was made.
        Verdict::InsufficientData => AutoDecision::Hold("insufficient samples in window"),

        // The one path that bypasses dwell: act on the next tick to cap
        // blast radius.
        Verdict::Critical => match state.stage {
            Stage::Canary | Stage::Ramping | Stage::Paused | Stage::Full => {
                AutoDecision::Transition(PlannedTransition {
                    to_stage: Stage::RolledBack,
                    to_percentage: 0.0,
                    new_target: None,
                    reason: format!(
                        "critical verdict at {:.0}%",
                        state.current_percentage
                    ),
                    pause_origin: None,
                    paused_from: None,
                    rotate_seed: false,
                })
            }
            Stage::Off | Stage::RolledBack => {
                AutoDecision::Hold("critical verdict with no exposure")
            }
        },

        // A warning, not a failure: freeze the ramp and wait.
        Verdict::Degraded => match state.stage {
            Stage::Canary | Stage::Ramping => AutoDecision::Transition(PlannedTransition {
                to_stage: Stage::Paused,
                to_percentage: state.current_percentage,
                new_target: None,
                reason: format!(
                    "degraded verdict at {:.0}%, ramp frozen",
                    state.current_percentage
                ),
                pause_origin: Some(PauseOrigin::Degraded),
                paused_from: Some(state.stage),
                rotate_seed: false,
            }),
            _ => AutoDecision::Hold("degraded verdict outside an active ramp"),
        },

        Verdict::Healthy => match state.stage {
            // Only a health-triggered pause lifts automatically; an operator
            // pause waits for an explicit resume.
            Stage::Paused if state.pause_origin == Some(PauseOrigin::Degraded) => {
                AutoDecision::Transition(PlannedTransition {
                    to_stage: state.paused_from.unwrap_or(Stage::Ramping),
                    to_percentage: state.current_percentage,
                    new_target: None,
                    reason: "health recovered, resuming ramp".to_string(),
                    pause_origin: None,
                    paused_from: None,
                    rotate_seed: false,
                })
            }
            Stage::Canary => {
                let ticks = state.consecutive_healthy_ticks + 1;
                if ticks < config.dwell_ticks {
                    return AutoDecision::Dwell(ticks);
                }
                let to = (state.current_percentage + config.ramp_step_percentage)
                    .min(state.target_percentage);
                AutoDecision::Transition(PlannedTransition {
                    to_stage: Stage::Ramping,
                    to_percentage: to,
                    new_target: None,
                    reason: format!("canary healthy for {ticks} ticks, ramping to {to:.0}%"),
                    pause_origin: None,
                    paused_from: None,
                    rotate_seed: false,
                })
            }
            Stage::Ramping => {
                let ticks = state.consecutive_healthy_ticks + 1;
                if ticks < config.dwell_ticks {
                    return AutoDecision::Dwell(ticks);
                }
                if state.current_percentage >= state.target_percentage {
                    AutoDecision::Transition(PlannedTransition {
                        to_stage: Stage::Full,
                        to_percentage: state.current_percentage,
                        new_target: None,
                        reason: format!(
                            "target {:.0}% held healthy through dwell, rollout complete",
                            state.target_percentage
                        ),
                        pause_origin: None,
                        paused_from: None,
                        rotate_seed: false,
                    })
                } else {
                    let to = (state.current_percentage + config.ramp_step_percentage)
                        .min(state.target_percentage);
                    AutoDecision::Transition(PlannedTransition {
                        to_stage: Stage::Ramping,
                        to_percentage: to,
                        new_target: None,
                        reason: format!("healthy dwell complete, advancing to {to:.0}%"),
                        pause_origin: None,
                        paused_from: None,
                        rotate_seed: false,
                    })
                }
            }
            Stage::Off | Stage::Full | Stage::RolledBack | Stage::Paused => {
                AutoDecision::Hold("no ramp in progress")
            }
        },
    }
}

/// Validate and plan a manual command against the current state.
fn plan_command(
    state: &RolloutState,
    command: &RolloutCommand,
    config: &ControllerConfig,
) -> Result<PlannedTransition> {
    let invalid = || RolloutError::InvalidTransition {
        from: state.stage,
        command: command.clone(),
    };

    match command {
        RolloutCommand::Start { target_percentage } => {
            if state.stage != Stage::Off {
                return Err(invalid());
            }
            let target = *target_percentage;
            if !(target > 0.0 && target <= 100.0) {
                return Err(RolloutError::InvalidPercentage(target));
            }
            Ok(PlannedTransition {
                to_stage: Stage::Canary,
                to_percentage: config.canary_percentage.min(target),
                new_target: Some(target),
                reason: format!("rollout started toward {target:.0}%"),
                pause_origin: None,
                paused_from: None,
                rotate_seed: false,
            })
        }
        RolloutCommand::Pause => match state.stage {
            Stage::Canary | Stage::Ramping => Ok(PlannedTransition {
                to_stage: Stage::Paused,
                to_percentage: state.current_percentage,
                new_target: None,
                reason: "operator pause".to_string(),
                pause_origin: Some(PauseOrigin::Operator),
                paused_from: Some(state.stage),
                rotate_seed: false,
            }),
            _ => Err(invalid()),
        },
        RolloutCommand::Resume => match state.stage {
            Stage::Paused => Ok(PlannedTransition {
                to_stage: state.paused_from.unwrap_or(Stage::Ramping),
                to_percentage: state.current_percentage,
                new_target: None,
                reason: "operator resume".to_string(),
                pause_origin: None,
                paused_from: None,
                rotate_seed: false,
            }),
            _ => Err(invalid()),
        },
        RolloutCommand::Rollback { reason } => match state.stage {
            Stage::Off | Stage::RolledBack => Err(invalid()),
            _ => Ok(PlannedTransition {
                to_stage: Stage::RolledBack,
                to_percentage: 0.0,
                new_target: None,
                reason: reason.clone(),
                pause_origin: None,
                paused_from: None,
                rotate_seed: false,
            }),
        },
        RolloutCommand::Rearm => match state.stage {
            // Explicit anti-oscillation rule: only a human leaves RolledBack.
            Stage::RolledBack => Ok(PlannedTransition {
                to_stage: Stage::Off,
                to_percentage: 0.0,
                new_target: Some(0.0),
                reason: "re-armed after rollback".to_string(),
                pause_origin: None,
                paused_from: None,
                rotate_seed: true,
            }),
            _ => Err(invalid()),
        },
        RolloutCommand::Abandon => match state.stage {
            Stage::Paused => Ok(PlannedTransition {
                to_stage: Stage::Off,
                to_percentage: 0.0,
                new_target: Some(0.0),
                reason: "rollout abandoned".to_string(),
                pause_origin: None,
                paused_from: None,
                rotate_seed: false,
            }),
            _ => Err(invalid()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ControllerConfig {
        ControllerConfig {
            tick_interval_secs: 1,
            canary_percentage: 5.0,
            ramp_step_percentage: 20.0,
            dwell_ticks: 2,
            sample_window_secs: 300,
            max_window_samples: 10_000,
            router_refresh_secs: 1,
        }
    }

    fn state(stage: Stage, pct: f64, target: f64, ticks: u32) -> RolloutState {
        let mut s = RolloutState::initial(FeatureId::new("widget"), 42);
        s.stage = stage;
        s.current_percentage = pct;
        s.target_percentage = target;
        s.consecutive_healthy_ticks = ticks;
        s
    }

    // ── plan_automatic ─────────────────────────────────────────────────

    #[test]
    fn insufficient_data_holds_everywhere() {
        for stage in [
            Stage::Off,
            Stage::Canary,
            Stage::Ramping,
            Stage::Full,
            Stage::Paused,
            Stage::RolledBack,
        ] {
            let decision =
                plan_automatic(&state(stage, 50.0, 100.0, 1), Verdict::InsufficientData, &config());
            assert!(matches!(decision, AutoDecision::Hold(_)), "stage {stage}");
        }
    }

    #[test]
    fn healthy_canary_dwells_then_ramps() {
        let cfg = config();

        let decision = plan_automatic(&state(Stage::Canary, 5.0, 100.0, 0), Verdict::Healthy, &cfg);
        assert!(matches!(decision, AutoDecision::Dwell(1)));

        let decision = plan_automatic(&state(Stage::Canary, 5.0, 100.0, 1), Verdict::Healthy, &cfg);
        match decision {
            AutoDecision::Transition(planned) => {
                assert_eq!(planned.to_stage, Stage::Ramping);
                assert_eq!(planned.to_percentage, 25.0);
            }
            other => panic!("expected transition, got {other:?}"),
        }
    }

    #[test]
    fn ramping_advances_by_step_clamped_to_target() {
        let cfg = config();
        let decision = plan_automatic(&state(Stage::Ramping, 90.0, 100.0, 1), Verdict::Healthy, &cfg);
        match decision {
            AutoDecision::Transition(planned) => {
                assert_eq!(planned.to_stage, Stage::Ramping);
                assert_eq!(planned.to_percentage, 100.0);
            }
            other => panic!("expected transition, got {other:?}"),
        }
    }

    #[test]
    fn ramping_at_target_completes_to_full() {
        let cfg = config();
        let decision =
            plan_automatic(&state(Stage::Ramping, 100.0, 100.0, 1), Verdict::Healthy, &cfg);
        match decision {
            AutoDecision::Transition(planned) => {
                assert_eq!(planned.to_stage, Stage::Full);
                assert_eq!(planned.to_percentage, 100.0);
            }
            other => panic!("expected transition, got {other:?}"),
        }
    }

    #[test]
    fn critical_bypasses_dwell_from_any_ramping_state() {
        let cfg = config();
        for stage in [Stage::Canary, Stage::Ramping, Stage::Paused, Stage::Full] {
            let decision = plan_automatic(&state(stage, 75.0, 100.0, 0), Verdict::Critical, &cfg);
            match decision {
                AutoDecision::Transition(planned) => {
                    assert_eq!(planned.to_stage, Stage::RolledBack, "stage {stage}");
                    assert_eq!(planned.to_percentage, 0.0);
                }
                other => panic!("expected rollback from {stage}, got {other:?}"),
            }
        }
    }

    #[test]
    fn critical_without_exposure_holds() {
        let cfg = config();
        for stage in [Stage::Off, Stage::RolledBack] {
            let decision = plan_automatic(&state(stage, 0.0, 0.0, 0), Verdict::Critical, &cfg);
            assert!(matches!(decision, AutoDecision::Hold(_)), "stage {stage}");
        }
    }

    #[test]
    fn degraded_freezes_ramp_without_rollback() {
        let cfg = config();
        let decision = plan_automatic(&state(Stage::Ramping, 50.0, 100.0, 1), Verdict::Degraded, &cfg);
        match decision {
            AutoDecision::Transition(planned) => {
                assert_eq!(planned.to_stage, Stage::Paused);
                assert_eq!(planned.to_percentage, 50.0);
                assert_eq!(planned.pause_origin, Some(PauseOrigin::Degraded));
                assert_eq!(planned.paused_from, Some(Stage::Ramping));
            }
            other => panic!("expected pause, got {other:?}"),
        }
    }

    #[test]
    fn degraded_pause_auto_resumes_on_recovery() {
        let cfg = config();
        let mut paused = state(Stage::Paused, 50.0, 100.0, 0);
        paused.pause_origin = Some(PauseOrigin::Degraded);
        paused.paused_from = Some(Stage::Ramping);

        let decision = plan_automatic(&paused, Verdict::Healthy, &cfg);
        match decision {
            AutoDecision::Transition(planned) => {
                assert_eq!(planned.to_stage, Stage::Ramping);
                assert_eq!(planned.to_percentage, 50.0);
            }
            other => panic!("expected resume, got {other:?}"),
        }
    }

    #[test]
    fn operator_pause_never_auto_resumes() {
        let cfg = config();
        let mut paused = state(Stage::Paused, 50.0, 100.0, 0);
        paused.pause_origin = Some(PauseOrigin::Operator);
        paused.paused_from = Some(Stage::Ramping);

        let decision = plan_automatic(&paused, Verdict::Healthy, &cfg);
        assert!(matches!(decision, AutoDecision::Hold(_)));
    }

    #[test]
    fn rolled_back_ignores_healthy_verdicts() {
        let cfg = config();
        let decision = plan_automatic(&state(Stage::RolledBack, 0.0, 0.0, 0), Verdict::Healthy, &cfg);
        assert!(matches!(decision, AutoDecision::Hold(_)));
    }

    // ── plan_command ───────────────────────────────────────────────────

    #[test]
    fn start_only_from_off() {
        let cfg = config();
        let planned = plan_command(
            &state(Stage::Off, 0.0, 0.0, 0),
            &RolloutCommand::Start { target_percentage: 100.0 },
            &cfg,
        )
        .unwrap();
        assert_eq!(planned.to_stage, Stage::Canary);
        assert_eq!(planned.to_percentage, 5.0);
        assert_eq!(planned.new_target, Some(100.0));

        let err = plan_command(
            &state(Stage::Ramping, 25.0, 100.0, 0),
            &RolloutCommand::Start { target_percentage: 100.0 },
            &cfg,
        )
        .unwrap_err();
        assert!(matches!(err, RolloutError::InvalidTransition { .. }));
    }

    #[test]
    fn start_canary_clamped_to_small_target() {
        let planned = plan_command(
            &state(Stage::Off, 0.0, 0.0, 0),
            &RolloutCommand::Start { target_percentage: 2.0 },
            &config(),
        )
        .unwrap();
        assert_eq!(planned.to_percentage, 2.0);
    }

    #[test]
    fn start_rejects_out_of_range_target() {
        for bad in [0.0, -5.0, 101.0] {
            let err = plan_command(
                &state(Stage::Off, 0.0, 0.0, 0),
                &RolloutCommand::Start { target_percentage: bad },
                &config(),
            )
            .unwrap_err();
            assert!(matches!(err, RolloutError::InvalidPercentage(_)), "{bad}");
        }
    }

    #[test]
    fn rollback_valid_from_active_stages_only() {
        let cfg = config();
        let cmd = RolloutCommand::Rollback { reason: "manual QA finding".to_string() };

        for stage in [Stage::Canary, Stage::Ramping, Stage::Paused, Stage::Full] {
            let planned = plan_command(&state(stage, 75.0, 100.0, 0), &cmd, &cfg).unwrap();
            assert_eq!(planned.to_stage, Stage::RolledBack);
            assert_eq!(planned.to_percentage, 0.0);
            assert_eq!(planned.reason, "manual QA finding");
        }
        for stage in [Stage::Off, Stage::RolledBack] {
            assert!(plan_command(&state(stage, 0.0, 0.0, 0), &cmd, &cfg).is_err());
        }
    }

    #[test]
    fn rearm_only_from_rolled_back_and_rotates_seed() {
        let cfg = config();
        let planned =
            plan_command(&state(Stage::RolledBack, 0.0, 0.0, 0), &RolloutCommand::Rearm, &cfg)
                .unwrap();
        assert_eq!(planned.to_stage, Stage::Off);
        assert!(planned.rotate_seed);

        for stage in [Stage::Off, Stage::Canary, Stage::Ramping, Stage::Paused, Stage::Full] {
            assert!(
                plan_command(&state(stage, 10.0, 100.0, 0), &RolloutCommand::Rearm, &cfg).is_err(),
                "stage {stage}"
            );
        }
    }

    #[test]
    fn resume_returns_to_paused_from_stage() {
        let cfg = config();
        let mut paused = state(Stage::Paused, 5.0, 100.0, 0);
        paused.pause_origin = Some(PauseOrigin::Operator);
        paused.paused_from = Some(Stage::Canary);

        let planned = plan_command(&paused, &RolloutCommand::Resume, &cfg).unwrap();
        assert_eq!(planned.to_stage, Stage::Canary);
    }

    #[test]
    fn abandon_only_from_paused() {
        let cfg = config();
        let mut paused = state(Stage::Paused, 40.0, 100.0, 0);
        paused.pause_origin = Some(PauseOrigin::Operator);
        let planned = plan_command(&paused, &RolloutCommand::Abandon, &cfg).unwrap();
        assert_eq!(planned.to_stage, Stage::Off);
        assert_eq!(planned.to_percentage, 0.0);

        assert!(
            plan_command(&state(Stage::Ramping, 40.0, 100.0, 0), &RolloutCommand::Abandon, &cfg)
                .is_err()
        );
    }

    #[test]
    fn build_next_resets_dwell_counter() {
        let base = state(Stage::Canary, 5.0, 100.0, 3);
        let planned = PlannedTransition {
            to_stage: Stage::Ramping,
            to_percentage: 25.0,
            new_target: None,
            reason: String::new(),
            pause_origin: None,
            paused_from: None,
            rotate_seed: false,
        };
        let next = build_next(&base, &planned, Some(Verdict::Healthy));
        assert_eq!(next.consecutive_healthy_ticks, 0);
        assert_eq!(next.last_verdict, Some(Verdict::Healthy));
        assert_eq!(next.sticky_assignment_seed, base.sticky_assignment_seed);
    }
}
