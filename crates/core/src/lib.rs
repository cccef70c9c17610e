//! Constellation Core - data model for incremental diagram synchronization
//!
//! This crate provides the foundational types:
//! - BLAKE3 content fingerprints
//! - Immutable snapshots of the tracked tree
//! - Change detection between snapshots
//! - Diagram artifacts and analysis summaries
//! - State directory layout and atomic writes

pub mod artifact;
pub mod diff;
pub mod error;
pub mod hash;
pub mod snapshot;
pub mod store;

// Re-export main types for convenience
pub use artifact::{AnalysisSummary, ArtifactStatus, DiagramArtifact, CATCH_ALL_SCOPE};
pub use diff::{ChangeKind, ChangeSet, SnapshotMark, VcsChange};
pub use error::Error;
pub use hash::{DirectoryHasher, Fingerprint};
pub use snapshot::{EntryKind, PathEntry, Snapshot, SnapshotRef};
pub use store::Workspace;

/// Common result type used throughout constellation-core
pub type Result<T> = anyhow::Result<T>;
