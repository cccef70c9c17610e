//! Content-addressed analysis cache
//!
//! Summaries are keyed by the fingerprint of the content they describe, so a
//! renamed or reverted file is never re-analyzed. Entries are immutable: the
//! first writer for a fingerprint wins and later writers receive the stored
//! entry back.

use ahash::AHashSet;
use anyhow::{Context, Result};
use constellation_core::{AnalysisSummary, Fingerprint};
use dashmap::DashMap;
use sled::{CompareAndSwapError, Tree};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Hit/miss counters for reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

pub struct AnalysisCache {
    tree: Tree,
    /// Decoded entries, populated on first access
    memo: DashMap<Fingerprint, AnalysisSummary>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl AnalysisCache {
    pub fn open(tree: Tree) -> Self {
        Self {
            tree,
            memo: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up the summary for a fingerprint
    pub fn get(&self, fingerprint: &Fingerprint) -> Result<Option<AnalysisSummary>> {
        if let Some(summary) = self.memo.get(fingerprint) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(summary.clone()));
        }

        match self.tree.get(fingerprint.as_bytes())? {
            Some(bytes) => {
                let summary = decode(&bytes)?;
                self.memo.insert(*fingerprint, summary.clone());
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(summary))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Insert a summary unless one already exists for its fingerprint
    ///
    /// Returns the stored entry, which is `summary` itself only if this call
    /// won the race.
    pub fn put(&self, summary: AnalysisSummary) -> Result<AnalysisSummary> {
        let key = *summary.fingerprint.as_bytes();
        let encoded = bincode::serialize(&summary).context("Failed to encode analysis summary")?;

        let stored = match self.tree.compare_and_swap(key, None::<&[u8]>, Some(encoded))? {
            Ok(()) => {
                debug!(fingerprint = %summary.fingerprint.short(), path = %summary.first_seen_path, "summary cached");
                summary
            }
            Err(CompareAndSwapError { current: Some(existing), .. }) => decode(&existing)?,
            Err(CompareAndSwapError { current: None, .. }) => {
                anyhow::bail!("Analysis cache entry vanished during insert")
            }
        };

        let entry = self.memo.entry(stored.fingerprint).or_insert(stored);
        Ok(entry.clone())
    }

    /// Remove every entry whose fingerprint is not in `live`
    ///
    /// Returns the number of removed entries.
    pub fn gc(&self, live: &AHashSet<Fingerprint>) -> Result<usize> {
        let mut batch = sled::Batch::default();
        let mut removed = 0;
        for item in self.tree.iter().keys() {
            let key = item?;
            let bytes: [u8; 32] = key
                .as_ref()
                .try_into()
                .with_context(|| format!("Corrupt analysis key of length {}", key.len()))?;
            if !live.contains(&Fingerprint::from_bytes(bytes)) {
                batch.remove(key);
                removed += 1;
            }
        }
        self.tree.apply_batch(batch)?;
        self.memo.retain(|fingerprint, _| live.contains(fingerprint));
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

fn decode(bytes: &[u8]) -> Result<AnalysisSummary> {
    bincode::deserialize(bytes).context("Failed to decode analysis summary")
}
