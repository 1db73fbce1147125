//! Authoritative rollout state store.
//!
//! Strongly-consistent map of per-feature rollout state, mutated only
//! through versioned compare-and-update writes issued by the controller.
//! The router never reads this store on the request path; it works from its
//! own periodically refreshed snapshot.
//!
//! Persistence is a JSON snapshot file with a schema-version envelope,
//! rewritten asynchronously after each committed write. A persistence
//! failure marks the store unavailable, which suspends automatic controller
//! ticks until a later write succeeds.

use ramp_common::errors::{Result, RolloutError};
use ramp_common::types::PERSISTED_SCHEMA_VERSION;
use ramp_common::{FeatureId, RolloutState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, warn};

/// On-disk envelope for the state snapshot.
#[derive(Debug, Serialize, Deserialize)]
struct StateSnapshot {
    schema_version: u32,
    states: Vec<RolloutState>,
}

/// Versioned in-memory store with optional snapshot persistence.
pub struct StateStore {
    states: RwLock<HashMap<FeatureId, RolloutState>>,
    path: Option<PathBuf>,
    available: Arc<AtomicBool>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    /// In-memory only store.
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            path: None,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Enable snapshot persistence to the given path.
    pub fn with_persistence(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    /// Load a snapshot written by a previous run.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let snapshot: StateSnapshot = serde_json::from_str(&raw)?;
        if snapshot.schema_version > PERSISTED_SCHEMA_VERSION {
            return Err(RolloutError::Config(format!(
                "state snapshot schema v{} is newer than supported v{}",
                snapshot.schema_version, PERSISTED_SCHEMA_VERSION
            )));
        }
        let states = snapshot
            .states
            .into_iter()
            .map(|s| (s.feature_id.clone(), s))
            .collect::<HashMap<_, _>>();
        debug!("Loaded {} rollout states from {:?}", states.len(), path);
        Ok(Self {
            states: RwLock::new(states),
            path: Some(path.to_path_buf()),
            available: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Whether the backing snapshot file is writable. The in-memory map stays
    /// authoritative either way; automatic ticks are suspended while false.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn get(&self, id: &FeatureId) -> Option<RolloutState> {
        let states = self.states.read().unwrap_or_else(|e| e.into_inner());
        states.get(id).cloned()
    }

    pub fn all(&self) -> Vec<RolloutState> {
        let states = self.states.read().unwrap_or_else(|e| e.into_inner());
        states.values().cloned().collect()
    }

    /// Seed the store with the initial `Off/0%` state for a new feature.
    pub fn insert_initial(&self, state: RolloutState) -> Result<Option<tokio::task::JoinHandle<()>>> {
        {
            let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
            if states.contains_key(&state.feature_id) {
                return Err(RolloutError::FeatureExists(state.feature_id));
            }
            states.insert(state.feature_id.clone(), state);
        }
        Ok(self.schedule_persist())
    }

    /// Replace a feature's state if nobody else has written since
    /// `expected_version` was read. The new state's version is set to
    /// `expected_version + 1` on commit.
    pub fn compare_and_update(
        &self,
        expected_version: u64,
        mut next: RolloutState,
    ) -> Result<Option<tokio::task::JoinHandle<()>>> {
        {
            let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
            let current = states
                .get(&next.feature_id)
                .ok_or_else(|| RolloutError::UnknownFeature(next.feature_id.clone()))?;
            if current.version != expected_version {
                return Err(RolloutError::ConcurrentTransitionConflict {
                    feature: next.feature_id.clone(),
                });
            }
            next.version = expected_version + 1;
            states.insert(next.feature_id.clone(), next);
        }
        Ok(self.schedule_persist())
    }

    /// Serialize the current map and rewrite the snapshot file off the hot
    /// path. Returns a handle so tests can await durability.
    fn schedule_persist(&self) -> Option<tokio::task::JoinHandle<()>> {
        let path = self.path.clone()?;
        let snapshot = StateSnapshot {
            schema_version: PERSISTED_SCHEMA_VERSION,
            states: self.all(),
        };
        let available = Arc::clone(&self.available);
        Some(tokio::spawn(async move {
            match persist_snapshot(&path, &snapshot).await {
                Ok(()) => {
                    if !available.swap(true, Ordering::SeqCst) {
                        warn!("State store persistence recovered: {:?}", path);
                    }
                }
                Err(e) => {
                    error!("Failed to persist state snapshot to {:?}: {}", path, e);
                    available.store(false, Ordering::SeqCst);
                }
            }
        }))
    }
}

/// Write the snapshot to a sidecar file and rename it into place, so a crash
/// mid-write never truncates the previous good snapshot.
async fn persist_snapshot(path: &Path, snapshot: &StateSnapshot) -> Result<()> {
    let serialized = serde_json::to_string_pretty(snapshot)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, serialized.as_bytes()).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
