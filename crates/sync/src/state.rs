//! Per-scope update state machine
//!
//! ```text
//! Clean --mark--> Stale --begin--> Updating --finish(ok)--> Clean
//!   ^               ^                  |      --finish(err)-> Failed
//!   |               +----- abandon ----+
//!   +-- Failed --mark--> Stale
//! ```
//!
//! A mark that arrives while a scope is Updating is remembered; when the
//! update finishes the scope goes back to Stale instead of Clean or Failed.

use constellation_core::ArtifactStatus;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

/// Rejected state transitions
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("scope '{0}' is already updating")]
    AlreadyUpdating(String),

    #[error("scope '{scope}' cannot start an update from {from}")]
    NotStale { scope: String, from: ArtifactStatus },

    #[error("scope '{0}' is not tracked")]
    UnknownScope(String),
}

/// Result of marking a scope stale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// Scope moved to Stale
    Marked,
    /// Scope was already Stale
    AlreadyStale,
    /// Scope is Updating; it returns to Stale when the update finishes
    Deferred,
}

#[derive(Debug, Clone, Copy)]
struct ScopeState {
    status: ArtifactStatus,
    pending_stale: bool,
}

/// In-memory statuses of every tracked scope
///
/// Transitions on one scope are atomic (the map shard holding the scope is
/// locked for the duration); scopes never block each other.
#[derive(Debug, Default)]
pub struct ScopeStates {
    states: DashMap<String, ScopeState>,
}

impl ScopeStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a scope with a persisted status
    ///
    /// A persisted Updating status can only come from an interrupted run and
    /// is tracked as Stale.
    pub fn track(&self, scope_id: &str, status: ArtifactStatus) {
        let status = match status {
            ArtifactStatus::Updating => ArtifactStatus::Stale,
            other => other,
        };
        self.states.entry(scope_id.to_string()).or_insert(ScopeState {
            status,
            pending_stale: false,
        });
    }

    pub fn forget(&self, scope_id: &str) {
        self.states.remove(scope_id);
    }

    pub fn status(&self, scope_id: &str) -> Option<ArtifactStatus> {
        self.states.get(scope_id).map(|s| s.status)
    }

    /// Whether a mark arrived during the current update
    pub fn is_pending(&self, scope_id: &str) -> bool {
        self.states.get(scope_id).is_some_and(|s| s.pending_stale)
    }

    /// Mark a scope stale; idempotent
    pub fn mark_stale(&self, scope_id: &str) -> MarkOutcome {
        let mut state = match self.states.entry(scope_id.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(ScopeState {
                    status: ArtifactStatus::Stale,
                    pending_stale: false,
                });
                return MarkOutcome::Marked;
            }
            Entry::Occupied(occupied) => occupied.into_ref(),
        };
        match state.status {
            ArtifactStatus::Stale => MarkOutcome::AlreadyStale,
            ArtifactStatus::Updating => {
                state.pending_stale = true;
                MarkOutcome::Deferred
            }
            ArtifactStatus::Clean | ArtifactStatus::Failed => {
                state.status = ArtifactStatus::Stale;
                MarkOutcome::Marked
            }
        }
    }

    /// Stale -> Updating; refuses re-entry
    pub fn begin_update(&self, scope_id: &str) -> Result<(), TransitionError> {
        let mut state = self
            .states
            .get_mut(scope_id)
            .ok_or_else(|| TransitionError::UnknownScope(scope_id.to_string()))?;
        match state.status {
            ArtifactStatus::Stale => {
                state.status = ArtifactStatus::Updating;
                state.pending_stale = false;
                Ok(())
            }
            ArtifactStatus::Updating => Err(TransitionError::AlreadyUpdating(scope_id.to_string())),
            from => Err(TransitionError::NotStale {
                scope: scope_id.to_string(),
                from,
            }),
        }
    }

    /// Updating -> Clean | Failed, or Stale when a mark arrived meanwhile
    ///
    /// Returns the resulting status.
    pub fn finish(&self, scope_id: &str, succeeded: bool) -> ArtifactStatus {
        let Some(mut state) = self.states.get_mut(scope_id) else {
            return ArtifactStatus::Stale;
        };
        state.status = if state.pending_stale {
            ArtifactStatus::Stale
        } else if succeeded {
            ArtifactStatus::Clean
        } else {
            ArtifactStatus::Failed
        };
        state.pending_stale = false;
        state.status
    }

    /// Updating -> Stale, for cancelled updates
    pub fn abandon(&self, scope_id: &str) {
        if let Some(mut state) = self.states.get_mut(scope_id) {
            if state.status == ArtifactStatus::Updating {
                state.status = ArtifactStatus::Stale;
                state.pending_stale = false;
            }
        }
    }

    /// Ids of every Stale scope, sorted
    pub fn stale(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .states
            .iter()
            .filter(|entry| entry.status == ArtifactStatus::Stale)
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Every tracked scope with its status, sorted by id
    pub fn snapshot(&self) -> Vec<(String, ArtifactStatus)> {
        let mut all: Vec<(String, ArtifactStatus)> = self
            .states
            .iter()
            .map(|entry| (entry.key().clone(), entry.status))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
