//! Health sample ingestion and sliding windows.
//!
//! Ingestion sits on application request paths, so it must never block:
//! samples go through a bounded channel with `try_send`, and a full channel
//! drops the sample and bumps a counter. State transitions must be exact;
//! sample loss is tolerable.
//!
//! A background drain task folds samples into per-(feature, variant) sliding
//! windows, bounded both by time and by a hard sample cap.

use crate::metrics;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ramp_common::{FeatureId, HealthAggregate, HealthSample, Variant};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default ingestion channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 8192;

/// Sliding sample windows per (feature, variant).
pub struct SampleWindows {
    window: ChronoDuration,
    max_samples: usize,
    recent: RwLock<HashMap<(FeatureId, Variant), VecDeque<HealthSample>>>,
}

impl SampleWindows {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        let window =
            ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::seconds(300));
        Self {
            window,
            max_samples,
            recent: RwLock::new(HashMap::new()),
        }
    }

    /// Fold a sample into its window, evicting anything that slid out.
    pub fn ingest(&self, sample: HealthSample) {
        let key = (sample.feature_id.clone(), sample.variant);
        let mut recent = self.recent.write().unwrap_or_else(|e| e.into_inner());
        let entries = recent.entry(key).or_default();
        entries.push_back(sample);

        let cutoff = Utc::now() - self.window;
        Self::evict(entries, cutoff, self.max_samples);
    }

    fn evict(entries: &mut VecDeque<HealthSample>, cutoff: DateTime<Utc>, max_samples: usize) {
        while entries
            .front()
            .map(|s| s.timestamp < cutoff)
            .unwrap_or(false)
        {
            entries.pop_front();
        }
        while entries.len() > max_samples {
            entries.pop_front();
        }
    }

    /// Current aggregate for one (feature, variant) window.
    ///
    /// Samples older than the window are excluded even if eviction has not
    /// run since they expired.
    pub fn aggregate(&self, feature_id: &FeatureId, variant: Variant) -> HealthAggregate {
        let recent = self.recent.read().unwrap_or_else(|e| e.into_inner());
        let Some(entries) = recent.get(&(feature_id.clone(), variant)) else {
            return HealthAggregate::empty();
        };

        let cutoff = Utc::now() - self.window;
        let mut latencies: Vec<u64> = Vec::with_capacity(entries.len());
        let mut failures = 0u64;
        for sample in entries.iter().filter(|s| s.timestamp >= cutoff) {
            latencies.push(sample.latency_ms);
            if !sample.success {
                failures += 1;
            }
        }

        let count = latencies.len() as u64;
        if count == 0 {
            return HealthAggregate::empty();
        }

        latencies.sort_unstable();
        HealthAggregate {
            sample_count: count,
            error_rate: failures as f64 / count as f64,
            p50_latency_ms: percentile(&latencies, 0.50),
            p95_latency_ms: percentile(&latencies, 0.95),
        }
    }

    /// Number of samples currently retained across all windows.
    pub fn retained(&self) -> usize {
        let recent = self.recent.read().unwrap_or_else(|e| e.into_inner());
        recent.values().map(VecDeque::len).sum()
    }
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[u64], q: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Non-blocking sample ingestion handle, cloneable into request handlers.
#[derive(Clone)]
pub struct MetricSampler {
    tx: mpsc::Sender<HealthSample>,
}

impl MetricSampler {
    /// Create the sampler and the receiving end for the drain task.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<HealthSample>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Record one observation. Never blocks; drops on a full channel.
    pub fn record_sample(
        &self,
        feature_id: FeatureId,
        variant: Variant,
        success: bool,
        latency_ms: u64,
        error_kind: Option<String>,
    ) {
        let sample = HealthSample {
            feature_id,
            variant,
            timestamp: Utc::now(),
            success,
            latency_ms,
            error_kind,
        };
        match self.tx.try_send(sample) {
            Ok(()) => metrics::SAMPLES_INGESTED_TOTAL.inc(),
            Err(mpsc::error::TrySendError::Full(sample)) => {
                metrics::SAMPLES_DROPPED_TOTAL.inc();
                debug!(feature = %sample.feature_id, "Sample channel full, dropping sample");
            }
            Err(mpsc::error::TrySendError::Closed(sample)) => {
                warn!(feature = %sample.feature_id, "Sample channel closed, dropping sample");
            }
        }
    }
}

/// Drain ingested samples into the windows until the channel closes.
pub fn start_drain_task(
    mut rx: mpsc::Receiver<HealthSample>,
    windows: std::sync::Arc<SampleWindows>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(sample) = rx.recv().await {
            windows.ingest(sample);
        }
        debug!("Sample drain task stopped: channel closed");
    })
}
