//! Retention policies and garbage collection

use crate::StateDb;
use ahash::AHashSet;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Snapshots a retention pass always keeps, whatever the configuration says
pub const MIN_KEEP_SNAPSHOTS: usize = 2;

/// Retention policy configuration (`[retention]` in config.toml)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Number of most recent snapshots to keep (default: 2)
    pub keep_snapshots: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_snapshots: MIN_KEEP_SNAPSHOTS,
        }
    }
}

/// Outcome of one collection pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub snapshots_pruned: Vec<u64>,
    pub summaries_removed: usize,
    pub snapshots_kept: usize,
}

/// Garbage collector
pub struct GarbageCollector {
    policy: RetentionPolicy,
}

impl GarbageCollector {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self { policy }
    }

    fn keep(&self) -> usize {
        self.policy.keep_snapshots.max(MIN_KEEP_SNAPSHOTS)
    }

    /// Prune superseded snapshots only, leaving the analysis cache alone
    pub fn prune(&self, db: &StateDb) -> Result<GcReport> {
        let snapshots_pruned = db.snapshots.prune(self.keep())?;
        if !snapshots_pruned.is_empty() {
            debug!(pruned = snapshots_pruned.len(), "snapshots pruned");
        }
        Ok(GcReport {
            snapshots_pruned,
            summaries_removed: 0,
            snapshots_kept: db.snapshots.count(),
        })
    }

    /// Prune superseded snapshots, then drop analysis summaries whose content
    /// no retained snapshot references
    ///
    /// Diagram history is never collected.
    pub fn collect(&self, db: &StateDb) -> Result<GcReport> {
        let keep = self.keep();
        let snapshots_pruned = db.snapshots.prune(keep)?;

        let mut live = AHashSet::new();
        let retained = db.snapshots.last_n(keep)?;
        for snapshot in &retained {
            live.extend(snapshot.file_fingerprints());
        }
        let summaries_removed = db.analysis.gc(&live)?;
        db.flush()?;

        info!(
            pruned = snapshots_pruned.len(),
            summaries_removed,
            "garbage collection complete"
        );
        Ok(GcReport {
            snapshots_pruned,
            summaries_removed,
            snapshots_kept: retained.len(),
        })
    }
}
