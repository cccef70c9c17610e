//! Persistent engine state
//!
//! This crate provides:
//! - Append-only snapshot store (sled embedded DB)
//! - Content-addressed analysis cache
//! - Versioned diagram store with scope records
//! - Retention policies & GC

pub mod cache;
pub mod diagrams;
pub mod retention;
pub mod snapshots;

// Re-exports
pub use cache::{AnalysisCache, CacheStats};
pub use diagrams::{DiagramStore, ScopeRecord};
pub use retention::{GarbageCollector, GcReport, RetentionPolicy, MIN_KEEP_SNAPSHOTS};
pub use snapshots::SnapshotStore;

use anyhow::Context;
use std::path::Path;

/// Result type for journal operations
pub type Result<T> = anyhow::Result<T>;

/// The three stores, backed by one sled database
pub struct StateDb {
    db: sled::Db,
    pub snapshots: SnapshotStore,
    pub analysis: AnalysisCache,
    pub diagrams: DiagramStore,
}

impl StateDb {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path).with_context(|| format!("Failed to open state database {}", path.display()))?;
        let snapshots = SnapshotStore::open(db.open_tree("snapshots")?)?;
        let analysis = AnalysisCache::open(db.open_tree("analysis")?);
        let diagrams = DiagramStore::open(db.open_tree("diagrams")?);
        Ok(Self {
            db,
            snapshots,
            analysis,
            diagrams,
        })
    }

    /// Flush every tree to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush().context("Failed to flush state database")?;
        Ok(())
    }

    /// On-disk size in bytes, as reported by sled
    pub fn size_on_disk(&self) -> Result<u64> {
        Ok(self.db.size_on_disk()?)
    }
}
