//! Constellation Walker - enumerates and fingerprints the tracked tree
//!
//! - Post-order, sorted, symlink-free traversal
//! - `.gitignore`/`.cstignore`/configured exclusions and an extension filter
//! - Directory fingerprints aggregated from their children

pub mod ignore;
pub mod walk;

pub use ignore::{ExcludeConfig, ExcludeRules};
pub use walk::TreeWalker;
