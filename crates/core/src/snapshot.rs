//! Immutable point-in-time descriptions of the tracked file tree

use crate::hash::Fingerprint;
use ahash::{AHashMap, AHashSet};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Type of a snapshot entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// Regular file, fingerprinted by content
    File,
    /// Directory, fingerprinted by the aggregate of its children
    Directory,
}

/// One path in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathEntry {
    /// Relative, `/`-separated path. The walk root is `""`.
    pub path: String,
    /// Kind of entry
    pub kind: EntryKind,
    /// Content fingerprint (aggregate for directories)
    pub fingerprint: Fingerprint,
    /// Byte size (sum of descendant files for directories)
    pub size: u64,
    /// Modification time, Unix milliseconds
    pub mtime_ms: u64,
}

impl PathEntry {
    /// Create a file entry
    pub fn file(path: impl Into<String>, fingerprint: Fingerprint, size: u64, mtime_ms: u64) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File,
            fingerprint,
            size,
            mtime_ms,
        }
    }

    /// Create a directory entry
    pub fn directory(path: impl Into<String>, fingerprint: Fingerprint, size: u64, mtime_ms: u64) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Directory,
            fingerprint,
            size,
            mtime_ms,
        }
    }

    /// Whether this entry is a regular file
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    /// Whether this entry is a directory
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Whether two entries describe the same content (rename candidates)
    pub fn same_content(&self, other: &PathEntry) -> bool {
        self.kind == other.kind && self.fingerprint == other.fingerprint && self.size == other.size
    }
}

/// How a snapshot is anchored in history
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotRef {
    /// Version-control commit the work tree was at when captured
    Commit(String),
    /// Logical sequence number, used when no commit is available
    Sequence(u64),
}

impl fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotRef::Commit(id) => write!(f, "commit {}", &id[..id.len().min(10)]),
            SnapshotRef::Sequence(seq) => write!(f, "seq {seq}"),
        }
    }
}

/// Serialized form of a snapshot; the lookup index is rebuilt on load
#[derive(Serialize, Deserialize)]
struct SnapshotRecord {
    seq: u64,
    reference: SnapshotRef,
    captured_at_ms: u64,
    entries: Vec<PathEntry>,
}

/// An ordered, immutable collection of path entries captured at one instant
///
/// Entries are kept in the order the walker produced them (post-order).
/// A snapshot is never edited: a newer one supersedes it.
#[derive(Debug, Clone)]
pub struct Snapshot {
    seq: u64,
    reference: SnapshotRef,
    captured_at_ms: u64,
    entries: Vec<PathEntry>,
    index: AHashMap<String, usize>,
}

impl Snapshot {
    /// Build a snapshot from walker output
    pub fn new(seq: u64, reference: SnapshotRef, captured_at_ms: u64, entries: Vec<PathEntry>) -> Self {
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.path.clone(), i))
            .collect();
        Self {
            seq,
            reference,
            captured_at_ms,
            entries,
            index,
        }
    }

    /// The empty snapshot, used as the base of the very first cycle
    pub fn empty() -> Self {
        Self::new(0, SnapshotRef::Sequence(0), 0, Vec::new())
    }

    /// Monotonic sequence number assigned by the snapshot store
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Commit or sequence reference
    pub fn reference(&self) -> &SnapshotRef {
        &self.reference
    }

    /// Capture time, Unix milliseconds
    pub fn captured_at_ms(&self) -> u64 {
        self.captured_at_ms
    }

    /// All entries in walk order
    pub fn entries(&self) -> &[PathEntry] {
        &self.entries
    }

    /// File entries in walk order
    pub fn files(&self) -> impl Iterator<Item = &PathEntry> {
        self.entries.iter().filter(|e| e.is_file())
    }

    /// Directory entries in walk order
    pub fn directories(&self) -> impl Iterator<Item = &PathEntry> {
        self.entries.iter().filter(|e| e.is_dir())
    }

    /// Look up an entry by relative path
    pub fn get(&self, path: &str) -> Option<&PathEntry> {
        self.index.get(path).map(|&i| &self.entries[i])
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot has no entries at all
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Aggregate fingerprint of the walk root, if the snapshot has one
    pub fn root_fingerprint(&self) -> Option<Fingerprint> {
        self.get("").map(|e| e.fingerprint)
    }

    /// Fingerprints of every file, used to decide which cache entries are live
    pub fn file_fingerprints(&self) -> AHashSet<Fingerprint> {
        self.files().map(|e| e.fingerprint).collect()
    }

    /// Same entries under a different sequence number and reference
    ///
    /// Used by the store when it assigns the durable sequence number; the
    /// original value is consumed so no two live copies disagree.
    pub fn renumbered(self, seq: u64, reference: SnapshotRef) -> Self {
        Self { seq, reference, ..self }
    }

    /// Encode for persistence
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let record = SnapshotRecord {
            seq: self.seq,
            reference: self.reference.clone(),
            captured_at_ms: self.captured_at_ms,
            entries: self.entries.clone(),
        };
        bincode::serialize(&record).context("Failed to encode snapshot")
    }

    /// Decode a persisted snapshot
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let record: SnapshotRecord = bincode::deserialize(bytes).context("Failed to decode snapshot")?;
        Ok(Self::new(record.seq, record.reference, record.captured_at_ms, record.entries))
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
            && self.reference == other.reference
            && self.captured_at_ms == other.captured_at_ms
            && self.entries == other.entries
    }
}

impl Eq for Snapshot {}
