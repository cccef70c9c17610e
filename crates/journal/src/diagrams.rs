//! Versioned diagram store
//!
//! Every scope has one [`ScopeRecord`] and an append-only list of
//! [`DiagramArtifact`] versions, all in a single sled tree:
//!
//! ```text
//! r\0<scope>              -> ScopeRecord
//! v\0<scope>\0<version>   -> DiagramArtifact   (version as big-endian u64)
//! ```
//!
//! A commit writes the new version and the updated record in one sled
//! transaction, so a reader resolving `record -> clean version` never observes
//! a record pointing at a version that does not exist yet.

use anyhow::{Context, Result};
use constellation_core::store::current_timestamp_ms;
use constellation_core::{ArtifactStatus, DiagramArtifact, Error, Fingerprint};
use serde::{Deserialize, Serialize};
use sled::transaction::{
    ConflictableTransactionError, TransactionError, TransactionResult, TransactionalTree,
};
use sled::Tree;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use ulid::Ulid;

const RECORD_PREFIX: &[u8] = b"r\0";
const VERSION_PREFIX: &[u8] = b"v\0";

/// Persisted per-scope bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRecord {
    pub scope_id: String,
    pub status: ArtifactStatus,
    /// Version served by `read`, if any version was ever committed
    pub clean_version: Option<u64>,
    /// Highest committed version (0 when none)
    pub latest_version: u64,
    /// Error from the last failed update, cleared on success
    pub last_error: Option<String>,
    /// Scope no longer exists in the configuration or tree
    pub obsolete: bool,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl ScopeRecord {
    fn new(scope_id: &str) -> Self {
        let now = current_timestamp_ms();
        Self {
            scope_id: scope_id.to_string(),
            status: ArtifactStatus::Stale,
            clean_version: None,
            latest_version: 0,
            last_error: None,
            obsolete: false,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }
}

pub struct DiagramStore {
    tree: Tree,
}

impl DiagramStore {
    pub fn open(tree: Tree) -> Self {
        Self { tree }
    }

    /// Register a scope, creating its record on first discovery
    ///
    /// An obsolete scope that reappears is un-marked. Returns the record and
    /// whether it was created by this call.
    pub fn ensure_scope(&self, scope_id: &str) -> Result<(ScopeRecord, bool)> {
        let key = record_key(scope_id);
        let result: TransactionResult<_, anyhow::Error> = self.tree.transaction(|tx| {
            match read_record(tx, &key)? {
                Some(mut record) if record.obsolete => {
                    record.obsolete = false;
                    record.updated_at_ms = current_timestamp_ms();
                    write_record(tx, &key, &record)?;
                    Ok((record, false))
                }
                Some(record) => Ok((record, false)),
                None => {
                    let record = ScopeRecord::new(scope_id);
                    write_record(tx, &key, &record)?;
                    Ok((record, true))
                }
            }
        });
        let (record, created) = finish(result)?;
        if created {
            debug!(scope = scope_id, "scope registered");
        }
        Ok((record, created))
    }

    pub fn record(&self, scope_id: &str) -> Result<Option<ScopeRecord>> {
        match self.tree.get(record_key(scope_id))? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All scope records, ordered by scope id
    pub fn records(&self) -> Result<Vec<ScopeRecord>> {
        self.tree
            .scan_prefix(RECORD_PREFIX)
            .values()
            .map(|item| decode_record(&item?))
            .collect()
    }

    /// Apply `update` to a scope's record atomically
    pub fn update_record<F>(&self, scope_id: &str, update: F) -> Result<ScopeRecord>
    where
        F: Fn(&mut ScopeRecord),
    {
        let key = record_key(scope_id);
        let result: TransactionResult<_, anyhow::Error> = self.tree.transaction(|tx| {
            let mut record = read_record(tx, &key)?.unwrap_or_else(|| ScopeRecord::new(scope_id));
            update(&mut record);
            record.updated_at_ms = current_timestamp_ms();
            write_record(tx, &key, &record)?;
            Ok(record)
        });
        finish(result)
    }

    /// Record a status transition
    ///
    /// `error` is stored for Failed; Clean clears any earlier error.
    pub fn set_status(&self, scope_id: &str, status: ArtifactStatus, error: Option<String>) -> Result<ScopeRecord> {
        self.update_record(scope_id, |record| {
            record.status = status;
            match status {
                ArtifactStatus::Failed => record.last_error = error.clone(),
                ArtifactStatus::Clean => record.last_error = None,
                ArtifactStatus::Stale | ArtifactStatus::Updating => {}
            }
        })
    }

    /// Flag a scope that disappeared; its history is kept
    pub fn mark_obsolete(&self, scope_id: &str) -> Result<()> {
        let record = self.update_record(scope_id, |record| record.obsolete = true)?;
        warn!(scope = scope_id, versions = record.latest_version, "scope marked obsolete");
        Ok(())
    }

    /// Persist a new Clean version and point the scope's record at it
    pub fn commit(
        &self,
        scope_id: &str,
        markup: &str,
        summary: &str,
        lineage: &BTreeMap<String, Fingerprint>,
        produced_by: Ulid,
    ) -> Result<DiagramArtifact> {
        let key = record_key(scope_id);
        let result: TransactionResult<_, anyhow::Error> = self.tree.transaction(|tx| {
            let mut record = read_record(tx, &key)?.unwrap_or_else(|| ScopeRecord::new(scope_id));
            let now = current_timestamp_ms();
            let artifact = DiagramArtifact {
                scope_id: scope_id.to_string(),
                markup: markup.to_string(),
                summary: summary.to_string(),
                lineage: lineage.clone(),
                version: record.latest_version + 1,
                status: ArtifactStatus::Clean,
                produced_by,
                created_at_ms: now,
            };
            let encoded = bincode::serialize(&artifact)
                .context("Failed to encode diagram artifact")
                .map_err(ConflictableTransactionError::Abort)?;
            tx.insert(version_key(scope_id, artifact.version), encoded)?;

            record.latest_version = artifact.version;
            record.clean_version = Some(artifact.version);
            record.status = ArtifactStatus::Clean;
            record.last_error = None;
            record.updated_at_ms = now;
            write_record(tx, &key, &record)?;
            Ok(artifact)
        });
        let artifact = finish(result)?;
        self.tree.flush().context("Failed to flush diagram store")?;
        info!(scope = scope_id, version = artifact.version, "diagram committed");
        Ok(artifact)
    }

    /// Latest Clean version of a scope's diagram
    pub fn read(&self, scope_id: &str) -> std::result::Result<DiagramArtifact, Error> {
        let clean = self.record(scope_id)?.and_then(|record| record.clean_version);
        let Some(version) = clean else {
            return Err(Error::NotYetAvailable(scope_id.to_string()));
        };
        self.version(scope_id, version)?
            .ok_or_else(|| Error::Other(anyhow::anyhow!("Scope '{scope_id}' points at missing version {version}")))
    }

    pub fn version(&self, scope_id: &str, version: u64) -> Result<Option<DiagramArtifact>> {
        match self.tree.get(version_key(scope_id, version))? {
            Some(bytes) => Ok(Some(decode_artifact(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every committed version of a scope, oldest first
    pub fn history(&self, scope_id: &str) -> Result<Vec<DiagramArtifact>> {
        self.tree
            .scan_prefix(version_prefix(scope_id))
            .values()
            .map(|item| decode_artifact(&item?))
            .collect()
    }

    /// Re-publish an older version's markup and summary as a new version
    pub fn rollback(&self, scope_id: &str, version: u64, produced_by: Ulid) -> Result<DiagramArtifact> {
        let target = self
            .version(scope_id, version)?
            .with_context(|| format!("Scope '{scope_id}' has no version {version}"))?;
        let artifact = self.commit(scope_id, &target.markup, &target.summary, &target.lineage, produced_by)?;
        info!(scope = scope_id, from = version, to = artifact.version, "diagram rolled back");
        Ok(artifact)
    }

    /// Reset scopes left Updating by an interrupted run back to Stale
    pub fn recover_interrupted(&self) -> Result<Vec<String>> {
        let mut recovered = Vec::new();
        for record in self.records()? {
            if record.status == ArtifactStatus::Updating {
                self.set_status(&record.scope_id, ArtifactStatus::Stale, None)?;
                recovered.push(record.scope_id);
            }
        }
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "recovered scopes left updating by an interrupted run");
        }
        Ok(recovered)
    }

    /// Ids of every known scope, obsolete ones included
    pub fn scopes(&self) -> Result<Vec<String>> {
        Ok(self.records()?.into_iter().map(|r| r.scope_id).collect())
    }

    pub fn flush(&self) -> Result<()> {
        self.tree.flush()?;
        Ok(())
    }
}

fn record_key(scope_id: &str) -> Vec<u8> {
    let mut key = RECORD_PREFIX.to_vec();
    key.extend_from_slice(scope_id.as_bytes());
    key
}

fn version_prefix(scope_id: &str) -> Vec<u8> {
    let mut key = VERSION_PREFIX.to_vec();
    key.extend_from_slice(scope_id.as_bytes());
    key.push(0);
    key
}

fn version_key(scope_id: &str, version: u64) -> Vec<u8> {
    let mut key = version_prefix(scope_id);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

type TxResult<T> = std::result::Result<T, ConflictableTransactionError<anyhow::Error>>;

fn read_record(tx: &TransactionalTree, key: &[u8]) -> TxResult<Option<ScopeRecord>> {
    match tx.get(key)? {
        Some(bytes) => decode_record(&bytes).map(Some).map_err(ConflictableTransactionError::Abort),
        None => Ok(None),
    }
}

fn write_record(tx: &TransactionalTree, key: &[u8], record: &ScopeRecord) -> TxResult<()> {
    let encoded = bincode::serialize(record)
        .context("Failed to encode scope record")
        .map_err(ConflictableTransactionError::Abort)?;
    tx.insert(key, encoded)?;
    Ok(())
}

fn finish<T>(result: TransactionResult<T, anyhow::Error>) -> Result<T> {
    result.map_err(|err| match err {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => anyhow::Error::new(err).context("Diagram store transaction failed"),
    })
}

fn decode_record(bytes: &[u8]) -> Result<ScopeRecord> {
    bincode::deserialize(bytes).context("Failed to decode scope record")
}

fn decode_artifact(bytes: &[u8]) -> Result<DiagramArtifact> {
    bincode::deserialize(bytes).context("Failed to decode diagram artifact")
}
