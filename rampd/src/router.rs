//! Variant routing for the request hot path.
//!
//! `route()` runs on every application request, so it reads an
//! eventually-consistent snapshot swapped in by a background refresh task
//! instead of touching the controller's store. The read is an `Arc` clone
//! behind a briefly-held lock; a controller transition never stalls routing.
//!
//! Failure policy: anything unexpected (unknown feature, inactive feature,
//! store refresh failure) routes to `Legacy`. The rollout machinery must
//! never become a new source of user-facing failures.

use crate::registry::FeatureRegistry;
use crate::store::StateStore;
use ramp_common::{FeatureId, Variant, assignment_bucket};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Per-feature routing inputs captured at refresh time.
#[derive(Debug, Clone, Copy)]
pub struct RouteSnapshot {
    pub percentage: f64,
    pub seed: u64,
    pub active: bool,
}

/// Lock-light router over a periodically refreshed snapshot map.
pub struct VariantRouter {
    snapshot: RwLock<Arc<HashMap<FeatureId, RouteSnapshot>>>,
}

impl Default for VariantRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl VariantRouter {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Decide which variant a user sees for a feature.
    ///
    /// Deterministic for a fixed (seed, user, percentage): the bucket is a
    /// stable hash, so a user admitted to `New` at 10% stays on `New` as the
    /// percentage grows, and everyone reverts the moment a rollback forces
    /// the percentage to zero.
    pub fn route(&self, feature_id: &FeatureId, user_id: &str) -> Variant {
        let map = {
            let guard = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
            Arc::clone(&guard)
        };
        let Some(snap) = map.get(feature_id) else {
            return Variant::Legacy;
        };
        if !snap.active || snap.percentage <= 0.0 {
            return Variant::Legacy;
        }
        if assignment_bucket(snap.seed, user_id) < snap.percentage {
            Variant::New
        } else {
            Variant::Legacy
        }
    }

    /// Rebuild the snapshot from the authoritative store.
    ///
    /// While the store is unavailable the last-known-good snapshot keeps
    /// serving; degrading every feature to 0% on a transient store failure
    /// would be a rollback nobody asked for.
    pub fn refresh(&self, store: &StateStore, registry: &FeatureRegistry) {
        if !store.is_available() {
            warn!("State store unavailable; router keeps last-known-good snapshot");
            return;
        }

        let mut map = HashMap::new();
        for state in store.all() {
            let active = registry.is_active(&state.feature_id);
            map.insert(
                state.feature_id.clone(),
                RouteSnapshot {
                    percentage: state.current_percentage,
                    seed: state.sticky_assignment_seed,
                    active,
                },
            );
        }

        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(map);
    }

    /// Periodic refresh loop.
    pub fn start_refresh_task(
        self: Arc<Self>,
        store: Arc<StateStore>,
        registry: Arc<FeatureRegistry>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            debug!("Router refresh task started (interval: {:?})", interval);
            loop {
                ticker.tick().await;
                self.refresh(&store, &registry);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ramp_common::{Feature, FeatureThresholds, RolloutState, Stage};

    fn thresholds() -> FeatureThresholds {
        FeatureThresholds {
            min_sample_threshold: 100,
            degraded_error_rate: 0.05,
            critical_error_rate: 0.10,
            degraded_latency_ms: 500,
            critical_latency_ms: 2000,
        }
    }

    fn setup(percentage: f64) -> (VariantRouter, Arc<StateStore>, Arc<FeatureRegistry>) {
        let store = Arc::new(StateStore::new());
        let registry = Arc::new(FeatureRegistry::new());
        registry
            .register(Feature::new("widget", ""), thresholds())
            .unwrap();
        let mut state = RolloutState::initial(FeatureId::new("widget"), 42);
        state.current_percentage = percentage;
        state.stage = Stage::Ramping;
        store.insert_initial(state).unwrap();

        let router = VariantRouter::new();
        router.refresh(&store, &registry);
        (router, store, registry)
    }

    #[test]
    fn unknown_feature_routes_legacy() {
        let router = VariantRouter::new();
        assert_eq!(
            router.route(&FeatureId::new("ghost"), "user-1"),
            Variant::Legacy
        );
    }

    #[test]
    fn zero_percent_routes_everyone_legacy() {
        let (router, _store, _registry) = setup(0.0);
        for i in 0..100 {
            assert_eq!(
                router.route(&FeatureId::new("widget"), &format!("user-{i}")),
                Variant::Legacy
            );
        }
    }

    #[test]
    fn hundred_percent_routes_everyone_new() {
        let (router, _store, _registry) = setup(100.0);
        for i in 0..100 {
            assert_eq!(
                router.route(&FeatureId::new("widget"), &format!("user-{i}")),
                Variant::New
            );
        }
    }

    #[test]
    fn routing_is_deterministic_across_repeated_calls() {
        let (router, _store, _registry) = setup(30.0);
        let id = FeatureId::new("widget");

        for i in 0..20 {
            let user = format!("user-{i}");
            let first = router.route(&id, &user);
            for _ in 0..1000 {
                assert_eq!(router.route(&id, &user), first);
            }
        }
    }

    #[test]
    fn bucket_comparison_matches_route() {
        let (router, _store, _registry) = setup(30.0);
        let id = FeatureId::new("widget");

        for i in 0..200 {
            let user = format!("user-{i}");
            let expected = if assignment_bucket(42, &user) < 30.0 {
                Variant::New
            } else {
                Variant::Legacy
            };
            assert_eq!(router.route(&id, &user), expected);
        }
    }

    #[test]
    fn assignments_are_sticky_as_percentage_grows() {
        let (router, store, registry) = setup(10.0);
        let id = FeatureId::new("widget");

        let admitted_at_10: Vec<String> = (0..500)
            .map(|i| format!("user-{i}"))
            .filter(|u| router.route(&id, u) == Variant::New)
            .collect();

        let mut next = store.get(&id).unwrap();
        next.current_percentage = 60.0;
        store.compare_and_update(0, next).unwrap();
        router.refresh(&store, &registry);

        // Everyone admitted at 10% stays admitted at 60%.
        for user in &admitted_at_10 {
            assert_eq!(router.route(&id, user), Variant::New);
        }
    }

    #[test]
    fn deactivated_feature_routes_legacy() {
        let (router, store, registry) = setup(100.0);
        let id = FeatureId::new("widget");
        assert_eq!(router.route(&id, "user-1"), Variant::New);

        registry.deactivate(&id).unwrap();
        router.refresh(&store, &registry);
        assert_eq!(router.route(&id, "user-1"), Variant::Legacy);
    }

    #[test]
    fn refresh_respects_percentage_fraction() {
        let (router, _store, _registry) = setup(30.0);
        let id = FeatureId::new("widget");

        let n = 5000;
        let admitted = (0..n)
            .filter(|i| router.route(&id, &format!("user-{i}")) == Variant::New)
            .count();
        let fraction = admitted as f64 / n as f64;
        assert!(
            (0.26..0.34).contains(&fraction),
            "expected ~30% admitted, got {fraction}"
        );
    }
}
