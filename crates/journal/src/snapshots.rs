//! Append-only snapshot log using sled

use anyhow::{Context, Result};
use constellation_core::{Snapshot, SnapshotRef};
use parking_lot::RwLock;
use sled::Tree;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Persisted snapshots, keyed by big-endian sequence number
pub struct SnapshotStore {
    tree: Tree,
    /// Sequence numbers currently stored
    index: RwLock<BTreeSet<u64>>,
    /// Next sequence number to hand out
    seq_counter: AtomicU64,
}

impl SnapshotStore {
    /// Open the store on an existing sled tree, rebuilding the index
    pub fn open(tree: Tree) -> Result<Self> {
        let mut index = BTreeSet::new();
        for item in tree.iter().keys() {
            let key = item?;
            index.insert(decode_seq(&key)?);
        }
        let next = index.iter().next_back().map_or(1, |max| max + 1);

        Ok(Self {
            tree,
            index: RwLock::new(index),
            seq_counter: AtomicU64::new(next),
        })
    }

    /// Persist a snapshot, assigning it the next sequence number
    ///
    /// Sequence-tagged snapshots are re-tagged with the assigned number;
    /// commit-tagged snapshots keep their commit id.
    pub fn append(&self, snapshot: Snapshot) -> Result<Snapshot> {
        let seq = self.seq_counter.fetch_add(1, Ordering::SeqCst);
        let reference = match snapshot.reference() {
            SnapshotRef::Sequence(_) => SnapshotRef::Sequence(seq),
            commit @ SnapshotRef::Commit(_) => commit.clone(),
        };
        let snapshot = snapshot.renumbered(seq, reference);

        self.tree.insert(seq.to_be_bytes(), snapshot.to_bytes()?)?;
        self.tree.flush().context("Failed to flush snapshot store")?;
        self.index.write().insert(seq);

        debug!(seq, entries = snapshot.len(), "snapshot persisted");
        Ok(snapshot)
    }

    /// Get a snapshot by sequence number
    pub fn get(&self, seq: u64) -> Result<Option<Snapshot>> {
        match self.tree.get(seq.to_be_bytes())? {
            Some(bytes) => Ok(Some(Snapshot::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Get the most recent snapshot
    pub fn latest(&self) -> Result<Option<Snapshot>> {
        let latest = self.index.read().iter().next_back().copied();
        match latest {
            Some(seq) => self.get(seq),
            None => Ok(None),
        }
    }

    /// Get the last N snapshots, oldest first
    pub fn last_n(&self, count: usize) -> Result<Vec<Snapshot>> {
        let seqs: Vec<u64> = {
            let index = self.index.read();
            let skip = index.len().saturating_sub(count);
            index.iter().skip(skip).copied().collect()
        };

        let mut snapshots = Vec::with_capacity(seqs.len());
        for seq in seqs {
            if let Some(snapshot) = self.get(seq)? {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    /// All stored sequence numbers, ascending
    pub fn sequences(&self) -> Vec<u64> {
        self.index.read().iter().copied().collect()
    }

    /// Delete every snapshot except the newest `keep`
    ///
    /// Returns the sequence numbers that were removed.
    pub fn prune(&self, keep: usize) -> Result<Vec<u64>> {
        let doomed: Vec<u64> = {
            let index = self.index.read();
            let excess = index.len().saturating_sub(keep);
            index.iter().take(excess).copied().collect()
        };
        if doomed.is_empty() {
            return Ok(doomed);
        }

        let mut batch = sled::Batch::default();
        for seq in &doomed {
            batch.remove(seq.to_be_bytes().to_vec());
        }
        self.tree.apply_batch(batch)?;
        self.tree.flush()?;

        let mut index = self.index.write();
        for seq in &doomed {
            index.remove(seq);
        }
        Ok(doomed)
    }

    /// Number of stored snapshots
    pub fn count(&self) -> usize {
        self.index.read().len()
    }
}

fn decode_seq(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .with_context(|| format!("Corrupt snapshot key of length {}", key.len()))?;
    Ok(u64::from_be_bytes(bytes))
}
