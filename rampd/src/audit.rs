//! Append-only audit trail for compliance review.
//!
//! Every state transition appends exactly one entry. The in-memory log is
//! the read path for `get_history`; persistence is a JSONL side-channel
//! drained by a writer task with bounded retries. A write that still fails
//! is alerted (error log plus counter) but never blocks or reverts the
//! transition it records.

use crate::metrics;
use ramp_common::errors::Result;
use ramp_common::{AuditEntry, FeatureId};
use std::collections::HashMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Attempts per entry before the write is declared failed.
const WRITE_ATTEMPTS: u32 = 3;

/// Base backoff between write attempts.
const WRITE_BACKOFF: Duration = Duration::from_millis(100);

/// Write-once, read-many transition log.
pub struct AuditTrail {
    entries: RwLock<HashMap<FeatureId, Vec<AuditEntry>>>,
    tx: Option<mpsc::UnboundedSender<AuditEntry>>,
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditTrail {
    /// In-memory only trail.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            tx: None,
        }
    }

    /// Trail persisted as JSONL, with existing records replayed from disk.
    /// Returns the writer task handle for shutdown.
    pub fn with_persistence(path: PathBuf) -> Result<(Self, tokio::task::JoinHandle<()>)> {
        let mut entries: HashMap<FeatureId, Vec<AuditEntry>> = HashMap::new();
        if path.exists() {
            let file = std::fs::File::open(&path)?;
            let reader = std::io::BufReader::new(file);
            let mut count = 0usize;
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<AuditEntry>(&line) {
                    Ok(entry) => {
                        entries.entry(entry.feature_id.clone()).or_default().push(entry);
                        count += 1;
                    }
                    // A torn trailing line must not lose the whole trail.
                    Err(e) => warn!("Skipping unreadable audit line: {}", e),
                }
            }
            debug!("Replayed {} audit entries from {:?}", count, path);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(writer_loop(rx, path));
        Ok((
            Self {
                entries: RwLock::new(entries),
                tx: Some(tx),
            },
            handle,
        ))
    }

    /// Append one entry. The in-memory record is committed before the
    /// persistence hand-off, so history reads always reflect the transition.
    pub fn append(&self, entry: AuditEntry) {
        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            entries
                .entry(entry.feature_id.clone())
                .or_default()
                .push(entry.clone());
        }
        if let Some(tx) = &self.tx
            && tx.send(entry).is_err()
        {
            metrics::AUDIT_WRITE_FAILURES_TOTAL.inc();
            error!("Audit writer channel closed; entry not persisted");
        }
    }

    /// Full transition history for a feature, in transition order.
    pub fn history(&self, feature_id: &FeatureId) -> Vec<AuditEntry> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(feature_id).cloned().unwrap_or_default()
    }

    /// Total entries across all features.
    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drain entries to the JSONL file until the channel closes.
async fn writer_loop(mut rx: mpsc::UnboundedReceiver<AuditEntry>, path: PathBuf) {
    while let Some(entry) = rx.recv().await {
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                metrics::AUDIT_WRITE_FAILURES_TOTAL.inc();
                error!("Failed to serialize audit entry: {}", e);
                continue;
            }
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match append_line(&path, &line).await {
                Ok(()) => break,
                Err(e) if attempt < WRITE_ATTEMPTS => {
                    warn!(
                        attempt,
                        "Audit write failed, retrying: {}", e
                    );
                    tokio::time::sleep(WRITE_BACKOFF * attempt).await;
                }
                Err(e) => {
                    metrics::AUDIT_WRITE_FAILURES_TOTAL.inc();
                    error!(
                        feature = %entry.feature_id,
                        "Audit write failed after {} attempts, compliance record lost: {}",
                        WRITE_ATTEMPTS, e
                    );
                    break;
                }
            }
        }
    }
    debug!("Audit writer stopped: channel closed");
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await?;
    Ok(())
}
