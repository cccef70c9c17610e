//! Diagram artifacts and analysis summaries

use crate::hash::Fingerprint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use ulid::Ulid;

/// Scope id of the implicit catch-all scope that owns unmapped paths
pub const CATCH_ALL_SCOPE: &str = "*";

/// Lifecycle status of a scope's diagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactStatus {
    /// Diagram reflects the latest known change set
    Clean,
    /// An affecting change arrived; a refresh is needed
    Stale,
    /// A refresh task is in flight
    Updating,
    /// Retries were exhausted; the prior Clean version is still served
    Failed,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Clean => "clean",
            ArtifactStatus::Stale => "stale",
            ArtifactStatus::Updating => "updating",
            ArtifactStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted version of a scope's diagram
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagramArtifact {
    /// Scope the diagram describes
    pub scope_id: String,
    /// Diagram markup (a mermaid code block)
    pub markup: String,
    /// Markdown overview of the scope, exported as `summary.md`
    pub summary: String,
    /// Fingerprints of every path the diagram was derived from
    pub lineage: BTreeMap<String, Fingerprint>,
    /// Version number, starting at 1 and increasing by one per commit
    pub version: u64,
    /// Status at the time the version was written
    pub status: ArtifactStatus,
    /// Synchronization cycle that produced this version
    pub produced_by: Ulid,
    /// Creation time, Unix milliseconds
    pub created_at_ms: u64,
}

impl DiagramArtifact {
    /// Whether the artifact was derived from exactly these fingerprints
    pub fn derived_from(&self, lineage: &BTreeMap<String, Fingerprint>) -> bool {
        &self.lineage == lineage
    }
}

/// Cached structural description of one file's content
///
/// Keyed by the content fingerprint and never mutated after insertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    /// Fingerprint of the summarized content
    pub fingerprint: Fingerprint,
    /// Path the content had when it was first summarized
    pub first_seen_path: String,
    /// Summary text returned by the analysis backend
    pub text: String,
    /// Creation time, Unix milliseconds
    pub created_at_ms: u64,
}
