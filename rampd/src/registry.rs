//! Feature registry.
//!
//! Arena-style map from feature id to its immutable metadata and health
//! thresholds. Features grow at runtime through registration; they are
//! deactivated, never deleted.
//!
//! Registrations persist as a JSON snapshot next to the rollout state, so a
//! restart re-hydrates both. Without this a restart would silently revert
//! every API-registered feature to legacy routing with no transition and no
//! audit record.

use crate::metrics;
use ramp_common::errors::{Result, RolloutError};
use ramp_common::types::PERSISTED_SCHEMA_VERSION;
use ramp_common::{Feature, FeatureId, FeatureThresholds};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, error};

/// Registered feature plus its threshold configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureEntry {
    pub feature: Feature,
    pub thresholds: FeatureThresholds,
}

/// On-disk envelope for the registry snapshot.
#[derive(Debug, Serialize, Deserialize)]
struct RegistrySnapshot {
    schema_version: u32,
    entries: Vec<FeatureEntry>,
}

/// Thread-safe registry of migratable features.
#[derive(Default)]
pub struct FeatureRegistry {
    inner: RwLock<HashMap<FeatureId, FeatureEntry>>,
    path: Option<PathBuf>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable snapshot persistence to the given path.
    pub fn with_persistence(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    /// Load a snapshot written by a previous run.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let snapshot: RegistrySnapshot = serde_json::from_str(&raw)?;
        if snapshot.schema_version > PERSISTED_SCHEMA_VERSION {
            return Err(RolloutError::Config(format!(
                "registry snapshot schema v{} is newer than supported v{}",
                snapshot.schema_version, PERSISTED_SCHEMA_VERSION
            )));
        }
        let inner = snapshot
            .entries
            .into_iter()
            .map(|entry| (entry.feature.id.clone(), entry))
            .collect::<HashMap<_, _>>();
        debug!("Loaded {} registered features from {:?}", inner.len(), path);
        metrics::FEATURES_REGISTERED.set(inner.len() as i64);
        Ok(Self {
            inner: RwLock::new(inner),
            path: Some(path.to_path_buf()),
        })
    }

    /// Register a new feature. Thresholds must be supplied explicitly;
    /// re-registering an existing id is rejected.
    pub fn register(
        &self,
        feature: Feature,
        thresholds: FeatureThresholds,
    ) -> Result<Option<tokio::task::JoinHandle<()>>> {
        thresholds.validate()?;
        {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            if inner.contains_key(&feature.id) {
                return Err(RolloutError::FeatureExists(feature.id));
            }
            inner.insert(
                feature.id.clone(),
                FeatureEntry {
                    feature,
                    thresholds,
                },
            );
            metrics::FEATURES_REGISTERED.set(inner.len() as i64);
        }
        Ok(self.schedule_persist())
    }

    /// Deactivate a feature: routing falls back to legacy and the controller
    /// stops ticking it. The record itself is retained.
    pub fn deactivate(&self, id: &FeatureId) -> Result<Option<tokio::task::JoinHandle<()>>> {
        {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            match inner.get_mut(id) {
                Some(entry) => entry.feature.active = false,
                None => return Err(RolloutError::UnknownFeature(id.clone())),
            }
        }
        Ok(self.schedule_persist())
    }

    /// Unwind a registration whose rollout state could not be created.
    /// Not part of the normal lifecycle; established features are
    /// deactivated, never removed.
    pub fn remove(&self, id: &FeatureId) -> Option<tokio::task::JoinHandle<()>> {
        {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner.remove(id)?;
            metrics::FEATURES_REGISTERED.set(inner.len() as i64);
        }
        self.schedule_persist()
    }

    pub fn get(&self, id: &FeatureId) -> Option<Feature> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.get(id).map(|entry| entry.feature.clone())
    }

    pub fn thresholds(&self, id: &FeatureId) -> Option<FeatureThresholds> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.get(id).map(|entry| entry.thresholds)
    }

    pub fn is_active(&self, id: &FeatureId) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.get(id).map(|entry| entry.feature.active).unwrap_or(false)
    }

    /// Ids of active features, for the controller tick.
    pub fn active_ids(&self) -> Vec<FeatureId> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .values()
            .filter(|entry| entry.feature.active)
            .map(|entry| entry.feature.id.clone())
            .collect()
    }

    pub fn all(&self) -> Vec<Feature> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.values().map(|entry| entry.feature.clone()).collect()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the registry snapshot off the hot path. Returns a handle so
    /// tests can await durability.
    fn schedule_persist(&self) -> Option<tokio::task::JoinHandle<()>> {
        let path = self.path.clone()?;
        let snapshot = RegistrySnapshot {
            schema_version: PERSISTED_SCHEMA_VERSION,
            entries: {
                let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
                inner.values().cloned().collect()
            },
        };
        Some(tokio::spawn(async move {
            if let Err(e) = persist_snapshot(&path, &snapshot).await {
                error!("Failed to persist registry snapshot to {:?}: {}", path, e);
            }
        }))
    }
}

/// Write the snapshot to a sidecar file and rename it into place.
async fn persist_snapshot(path: &Path, snapshot: &RegistrySnapshot) -> Result<()> {
    let serialized = serde_json::to_string_pretty(snapshot)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, serialized.as_bytes()).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
