//! Version-control boundary
//!
//! Read-only access to the git repository holding the project:
//! - HEAD commit id, used to tag snapshots
//! - Change lists between two revisions, or between a revision and the
//!   working tree, with git's rename detection

pub mod git;

pub use git::GitRepo;

/// Result type for version-control operations
pub type Result<T> = anyhow::Result<T>;
