//! Update orchestrator
//!
//! One synchronization cycle:
//!
//! 1. Walk the tree on a blocking thread and persist the head snapshot
//! 2. Diff it against the last processed snapshot (or take a git change list)
//! 3. Map changes to scopes and mark the affected ones Stale
//! 4. Refresh every Stale scope on a bounded pool of tasks
//! 5. Commit each successful diagram; leave failed scopes on their last
//!    Clean version
//!
//! A shutdown signal stops queued tasks from starting and abandons in-flight
//! ones; their scopes stay Stale.

use anyhow::{anyhow, Context};
use constellation_core::store::current_timestamp_ms;
use constellation_core::{
    ArtifactStatus, ChangeSet, DiagramArtifact, Error, Fingerprint, PathEntry, Snapshot, SnapshotMark, SnapshotRef,
    VcsChange, Workspace,
};
use constellation_core::hash::read_prefix_and_hash;
use constellation_journal::{CacheStats, GarbageCollector, GcReport, StateDb};
use constellation_vcs::GitRepo;
use constellation_walker::{ExcludeRules, TreeWalker};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::backend::{DiagramBackend, FileInput, GenerationRequest, ScopeFile, ScopeLink};
use crate::config::Config;
use crate::export::{export_diagrams, relative_link, ExportReport};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::scope::ScopeSet;
use crate::state::{MarkOutcome, ScopeStates};

/// Options for one cycle
#[derive(Debug, Clone, Default)]
pub struct CycleOptions {
    /// Take changes from git since this revision instead of diffing snapshots
    pub since: Option<String>,
}

/// How one scope's update ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateResult {
    /// A new Clean version was committed
    Updated { version: u64 },
    /// Retries were exhausted or a non-retryable error occurred
    Failed { error: String },
    /// Shutdown arrived before or during the update
    Cancelled,
    /// Another update of the scope was already running
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeOutcome {
    pub scope_id: String,
    pub result: UpdateResult,
    /// Status after the update
    pub status: ArtifactStatus,
    pub elapsed_ms: u64,
}

/// Summary of one synchronization cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle_id: Ulid,
    pub base_seq: Option<u64>,
    pub head: SnapshotRef,
    pub head_seq: u64,
    pub changes: usize,
    /// Scopes the change set mapped to
    pub affected: Vec<String>,
    pub outcomes: Vec<ScopeOutcome>,
    /// Final status of every live scope, sorted by id
    pub statuses: Vec<(String, ArtifactStatus)>,
    pub obsoleted: Vec<String>,
    /// Cache hits and misses during this cycle
    pub cache: CacheStats,
    pub cancelled: bool,
    pub export: Option<ExportReport>,
    /// Retention pass run after the cycle; skipped when cancelled
    pub retention: Option<GcReport>,
    pub elapsed_ms: u64,
}

impl CycleReport {
    /// Whether every live scope ended Clean
    pub fn all_clean(&self) -> bool {
        self.statuses.iter().all(|(_, status)| *status == ArtifactStatus::Clean)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.statuses
            .iter()
            .filter(|(_, status)| *status == ArtifactStatus::Failed)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// 0 when all scopes are Clean, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.all_clean() {
            0
        } else {
            1
        }
    }
}

/// State shared by the update tasks of one cycle
struct TaskShared {
    root: PathBuf,
    db: Arc<StateDb>,
    backend: Arc<dyn DiagramBackend>,
    states: Arc<ScopeStates>,
    retry: RetryPolicy,
    max_content_bytes: u64,
    cycle_id: Ulid,
}

/// A full analysis-cache sweep runs on every this many snapshot sequence numbers
const CACHE_SWEEP_INTERVAL: u64 = 8;

/// Work for one scope
struct ScopeJob {
    scope_id: String,
    files: Vec<PathEntry>,
    linked: Vec<ScopeLink>,
}

/// Scopes for a snapshot: the configured ones, or discovered from its directories
pub fn scopes_for(config: &Config, workspace: &Workspace, snapshot: &Snapshot) -> anyhow::Result<ScopeSet> {
    if config.scopes.is_empty() {
        Ok(ScopeSet::discover(snapshot, &workspace.project_name()))
    } else {
        ScopeSet::from_config(&config.scopes)
    }
}

/// The synchronization engine for one workspace
pub struct Engine {
    workspace: Workspace,
    config: Config,
    db: Arc<StateDb>,
    backend: Arc<dyn DiagramBackend>,
    states: Arc<ScopeStates>,
    walker: Arc<TreeWalker>,
}

impl Engine {
    /// Open the state database and restore scope statuses
    ///
    /// Scopes left Updating by an interrupted run come back Stale.
    pub fn open(workspace: Workspace, config: Config, backend: Arc<dyn DiagramBackend>) -> anyhow::Result<Self> {
        let db = Arc::new(StateDb::open(&workspace.db_path())?);
        db.diagrams.recover_interrupted()?;

        let states = Arc::new(ScopeStates::new());
        for record in db.diagrams.records()? {
            if !record.obsolete {
                states.track(&record.scope_id, record.status);
            }
        }

        let rules = ExcludeRules::load(workspace.root(), &config.walk)?;
        let walker = Arc::new(TreeWalker::new(workspace.root(), rules));

        Ok(Self {
            workspace,
            config,
            db,
            backend,
            states,
            walker,
        })
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db(&self) -> &StateDb {
        &self.db
    }

    pub fn states(&self) -> &ScopeStates {
        &self.states
    }

    pub fn scopes_for(&self, snapshot: &Snapshot) -> anyhow::Result<ScopeSet> {
        scopes_for(&self.config, &self.workspace, snapshot)
    }

    /// Scopes for the last processed snapshot
    pub fn current_scopes(&self) -> anyhow::Result<ScopeSet> {
        let latest = self.db.snapshots.latest()?.unwrap_or_else(Snapshot::empty);
        self.scopes_for(&latest)
    }

    /// Mark a scope stale from outside a cycle
    pub fn mark_stale(&self, scope_id: &str) -> anyhow::Result<MarkOutcome> {
        let outcome = self.states.mark_stale(scope_id);
        if outcome == MarkOutcome::Marked {
            self.db.diagrams.set_status(scope_id, ArtifactStatus::Stale, None)?;
        }
        Ok(outcome)
    }

    /// Output directory for exports, resolved against the project root
    pub fn export_dir(&self) -> Option<PathBuf> {
        self.config
            .export
            .output_dir
            .as_ref()
            .map(|dir| self.workspace.root().join(dir))
    }

    /// Run one synchronization cycle
    ///
    /// Returns an error only for failures that abort the whole cycle (an
    /// unreadable tree, a storage failure). Per-scope failures are reported
    /// in the returned [`CycleReport`].
    pub async fn run_cycle(&self, options: &CycleOptions, shutdown: watch::Receiver<bool>) -> Result<CycleReport, Error> {
        let started = Instant::now();
        let cycle_id = Ulid::new();
        let cache_before = self.db.analysis.stats();
        info!(cycle = %cycle_id, root = %self.workspace.root().display(), "sync cycle started");

        let base = self.db.snapshots.latest()?;
        let base_seq = base.as_ref().map(Snapshot::seq);
        let base = base.unwrap_or_else(Snapshot::empty);

        let (walked, vcs_changes) = self.capture(options.since.clone()).await?;

        let mut changes = match &vcs_changes {
            Some(list) => ChangeSet::from_change_list(list, &base, &walked),
            None => ChangeSet::diff(&base, &walked),
        };

        // Removed paths are mapped with the scopes they were owned under too,
        // so a scope linking to a vanished one still refreshes.
        let scopes = self.scopes_for(&walked)?;
        let mut mapped = scopes.map_changes(&changes);
        mapped.extend(self.scopes_for(&base)?.map_changes(&changes));
        let mut ownership = scopes.ownership(&walked);
        let affected: Vec<String> = mapped.into_iter().filter(|id| ownership.contains_key(id)).collect();

        self.register_scopes(&ownership, &affected)?;
        let obsoleted = self.retire_vanished(&ownership)?;

        // The snapshot becomes the next base only once its changes are
        // recorded as Stale scopes.
        let head = self.db.snapshots.append(walked)?;
        changes.head = SnapshotMark::from(&head);
        info!(
            base = ?base_seq,
            head = head.seq(),
            added = changes.added.len(),
            removed = changes.removed.len(),
            modified = changes.modified.len(),
            renamed = changes.renamed.len(),
            "changes detected"
        );

        let shared = self.task_shared(cycle_id);
        let jobs: Vec<ScopeJob> = self
            .states
            .stale()
            .into_iter()
            .filter_map(|scope_id| {
                let files = ownership.remove(&scope_id)?;
                let linked = scopes
                    .linked(&scope_id)
                    .into_iter()
                    .map(|to| ScopeLink {
                        href: relative_link(&scope_id, &to, scopes.root()),
                        scope_id: to,
                        summary: None,
                        files: 0,
                    })
                    .collect();
                Some(ScopeJob {
                    scope_id,
                    files,
                    linked,
                })
            })
            .collect();

        let outcomes = dispatch(shared, jobs, self.config.sync.concurrency, shutdown.clone()).await;
        let cancelled = *shutdown.borrow() || outcomes.iter().any(|o| o.result == UpdateResult::Cancelled);
        self.db.flush()?;
        let retention = if cancelled { None } else { Some(self.apply_retention(head.seq())?) };

        let export = match (self.config.export.auto, self.export_dir()) {
            (true, Some(dir)) if !cancelled => Some(export_diagrams(&self.db, &dir, scopes.root(), None)?),
            _ => None,
        };

        let live: BTreeSet<String> = self
            .db
            .diagrams
            .records()?
            .into_iter()
            .filter(|r| !r.obsolete)
            .map(|r| r.scope_id)
            .collect();
        let statuses = self
            .states
            .snapshot()
            .into_iter()
            .filter(|(id, _)| live.contains(id))
            .collect();

        let cache_after = self.db.analysis.stats();
        let report = CycleReport {
            cycle_id,
            base_seq,
            head: head.reference().clone(),
            head_seq: head.seq(),
            changes: changes.len(),
            affected,
            outcomes,
            statuses,
            obsoleted,
            cache: CacheStats {
                hits: cache_after.hits - cache_before.hits,
                misses: cache_after.misses - cache_before.misses,
                entries: cache_after.entries,
            },
            cancelled,
            export,
            retention,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            cycle = %cycle_id,
            updated = report.outcomes.iter().filter(|o| matches!(o.result, UpdateResult::Updated { .. })).count(),
            failed = report.failed().len(),
            cancelled = report.cancelled,
            elapsed_ms = report.elapsed_ms,
            "sync cycle finished"
        );
        Ok(report)
    }

    /// Walk the tree and, with `since`, collect the git change list
    async fn capture(&self, since: Option<String>) -> Result<(Snapshot, Option<Vec<VcsChange>>), Error> {
        let walker = Arc::clone(&self.walker);
        let root = self.workspace.root().to_path_buf();

        tokio::task::spawn_blocking(move || -> Result<(Snapshot, Option<Vec<VcsChange>>), Error> {
            let git = GitRepo::discover(&root)?;
            let reference = match git.as_ref().map(GitRepo::head_commit).transpose()?.flatten() {
                Some(commit) => SnapshotRef::Commit(commit),
                None => SnapshotRef::Sequence(0),
            };

            let changes = match (&since, &git) {
                (Some(rev), Some(git)) => Some(git.working_changes(rev)?),
                (Some(_), None) => {
                    return Err(anyhow!("--since needs a git work tree at {}", root.display()).into());
                }
                (None, _) => None,
            };

            let snapshot = walker.snapshot(0, reference, current_timestamp_ms())?;
            Ok((snapshot, changes))
        })
        .await
        .map_err(|e| Error::Other(anyhow!("Tree walk task failed: {e}")))?
    }

    fn task_shared(&self, cycle_id: Ulid) -> Arc<TaskShared> {
        Arc::new(TaskShared {
            root: self.workspace.root().to_path_buf(),
            db: Arc::clone(&self.db),
            backend: Arc::clone(&self.backend),
            states: Arc::clone(&self.states),
            retry: self.config.sync.retry_policy(),
            max_content_bytes: self.config.sync.max_content_bytes,
            cycle_id,
        })
    }

    /// Prune superseded snapshots; sweep the analysis cache every
    /// [`CACHE_SWEEP_INTERVAL`] cycles
    fn apply_retention(&self, head_seq: u64) -> anyhow::Result<GcReport> {
        let collector = GarbageCollector::new(self.config.retention.clone());
        if head_seq % CACHE_SWEEP_INTERVAL == 0 {
            collector.collect(&self.db)
        } else {
            collector.prune(&self.db)
        }
    }

    /// Track every live scope and mark what needs a refresh
    ///
    /// New scopes start Stale, Failed scopes are retried, and affected scopes
    /// are marked.
    fn register_scopes(&self, ownership: &BTreeMap<String, Vec<PathEntry>>, affected: &[String]) -> anyhow::Result<()> {
        for scope_id in ownership.keys() {
            let (record, created) = self.db.diagrams.ensure_scope(scope_id)?;
            self.states.track(scope_id, record.status);

            let needs_refresh = created
                || record.clean_version.is_none()
                || record.status == ArtifactStatus::Failed
                || affected.binary_search(scope_id).is_ok();
            if needs_refresh && self.states.mark_stale(scope_id) == MarkOutcome::Marked {
                self.db.diagrams.set_status(scope_id, ArtifactStatus::Stale, None)?;
                debug!(scope = %scope_id, "scope marked stale");
            }
        }
        Ok(())
    }

    /// Mark scopes that no longer exist as obsolete
    fn retire_vanished(&self, ownership: &BTreeMap<String, Vec<PathEntry>>) -> anyhow::Result<Vec<String>> {
        let mut retired = Vec::new();
        for record in self.db.diagrams.records()? {
            if !record.obsolete && !ownership.contains_key(&record.scope_id) {
                self.db.diagrams.mark_obsolete(&record.scope_id)?;
                self.states.forget(&record.scope_id);
                retired.push(record.scope_id);
            }
        }
        Ok(retired)
    }
}

/// Run scope jobs with at most `concurrency` in flight
///
/// Jobs run in waves: a scope starts once every scope it links to in the same
/// cycle has finished, so the linked summaries it reads are current.
async fn dispatch(
    shared: Arc<TaskShared>,
    jobs: Vec<ScopeJob>,
    concurrency: usize,
    shutdown: watch::Receiver<bool>,
) -> Vec<ScopeOutcome> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut outcomes = Vec::new();

    for wave in waves(jobs) {
        let mut tasks = JoinSet::new();
        for job in wave {
            let shared = Arc::clone(&shared);
            let semaphore = Arc::clone(&semaphore);
            let mut shutdown = shutdown.clone();
            tasks.spawn(async move {
                let started = Instant::now();
                let permit = tokio::select! {
                    biased;
                    _ = wait_for_shutdown(&mut shutdown) => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let mut outcome = match permit {
                    Some(_permit) => run_job(&shared, &job, &mut shutdown).await,
                    None => {
                        debug!(scope = %job.scope_id, "update not started");
                        ScopeOutcome {
                            scope_id: job.scope_id.clone(),
                            result: UpdateResult::Cancelled,
                            status: shared.states.status(&job.scope_id).unwrap_or(ArtifactStatus::Stale),
                            elapsed_ms: 0,
                        }
                    }
                };
                outcome.elapsed_ms = started.elapsed().as_millis() as u64;
                outcome
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "scope update task panicked"),
            }
        }
    }
    outcomes.sort_by(|a, b| a.scope_id.cmp(&b.scope_id));
    outcomes
}

/// Group jobs so each one follows the jobs it links to
///
/// Jobs caught in a link cycle share the final wave.
fn waves(jobs: Vec<ScopeJob>) -> Vec<Vec<ScopeJob>> {
    let mut pending: BTreeMap<String, ScopeJob> = jobs.into_iter().map(|job| (job.scope_id.clone(), job)).collect();
    let mut waves = Vec::new();

    while !pending.is_empty() {
        let ready: Vec<String> = pending
            .values()
            .filter(|job| {
                job.linked
                    .iter()
                    .all(|link| link.scope_id == job.scope_id || !pending.contains_key(&link.scope_id))
            })
            .map(|job| job.scope_id.clone())
            .collect();
        if ready.is_empty() {
            waves.push(std::mem::take(&mut pending).into_values().collect());
            break;
        }
        waves.push(ready.iter().filter_map(|id| pending.remove(id)).collect());
    }
    waves
}

/// Resolve once shutdown is requested; never resolves if the sender is gone
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Move one scope through Updating and record the result
async fn run_job(shared: &TaskShared, job: &ScopeJob, shutdown: &mut watch::Receiver<bool>) -> ScopeOutcome {
    let scope_id = job.scope_id.as_str();
    let outcome = |result, status| ScopeOutcome {
        scope_id: scope_id.to_string(),
        result,
        status,
        elapsed_ms: 0,
    };

    if let Err(e) = shared.states.begin_update(scope_id) {
        debug!(scope = scope_id, error = %e, "update skipped");
        let status = shared.states.status(scope_id).unwrap_or(ArtifactStatus::Stale);
        return outcome(UpdateResult::Skipped, status);
    }
    if let Err(e) = shared.db.diagrams.set_status(scope_id, ArtifactStatus::Updating, None) {
        shared.states.abandon(scope_id);
        return outcome(UpdateResult::Failed { error: e.to_string() }, ArtifactStatus::Stale);
    }
    debug!(scope = scope_id, files = job.files.len(), "scope update started");

    let result = tokio::select! {
        biased;
        _ = wait_for_shutdown(shutdown) => None,
        result = update_scope(shared, job) => Some(result),
    };

    match result {
        None => {
            shared.states.abandon(scope_id);
            persist_status(shared, scope_id, ArtifactStatus::Stale, None);
            warn!(scope = scope_id, "update abandoned on shutdown");
            outcome(UpdateResult::Cancelled, ArtifactStatus::Stale)
        }
        Some(Ok(artifact)) => {
            let status = shared.states.finish(scope_id, true);
            if status != ArtifactStatus::Clean {
                persist_status(shared, scope_id, status, None);
            }
            outcome(
                UpdateResult::Updated {
                    version: artifact.version,
                },
                status,
            )
        }
        Some(Err(e)) => {
            let status = shared.states.finish(scope_id, false);
            persist_status(shared, scope_id, status, Some(e.to_string()));
            error!(scope = scope_id, kind = e.kind(), error = %e, "scope update failed");
            outcome(UpdateResult::Failed { error: e.to_string() }, status)
        }
    }
}

fn persist_status(shared: &TaskShared, scope_id: &str, status: ArtifactStatus, error: Option<String>) {
    if let Err(e) = shared.db.diagrams.set_status(scope_id, status, error) {
        error!(scope = scope_id, error = %e, "failed to persist scope status");
    }
}

/// Summarize the scope's files, describe the scope, generate its diagram
/// and commit both
///
/// A file whose content no longer matches the walked fingerprint is
/// summarized as read, and the scope is left Stale for the next cycle.
async fn update_scope(shared: &TaskShared, job: &ScopeJob) -> Result<DiagramArtifact, Error> {
    let backend = shared.backend.as_ref();
    let mut files = Vec::with_capacity(job.files.len());
    let mut lineage: BTreeMap<String, Fingerprint> = BTreeMap::new();

    for entry in &job.files {
        let (summary, fingerprint) = match shared.db.analysis.get(&entry.fingerprint)? {
            Some(summary) => (summary, entry.fingerprint),
            None => {
                let input = read_input(&shared.root, entry, shared.max_content_bytes).await?;
                if input.fingerprint != entry.fingerprint {
                    warn!(scope = %job.scope_id, path = %entry.path, "file changed since the walk");
                    shared.states.mark_stale(&job.scope_id);
                }
                let input = &input;
                let label = format!("summarize {}", entry.path);
                let mut summary = retry_with_backoff(&shared.retry, &label, move |_| backend.summarize(input)).await?;
                summary.fingerprint = input.fingerprint;
                (shared.db.analysis.put(summary)?, input.fingerprint)
            }
        };
        lineage.insert(entry.path.clone(), fingerprint);
        files.push(ScopeFile {
            path: entry.path.clone(),
            fingerprint,
            summary: summary.text,
        });
    }

    let prior_markup = match shared.db.diagrams.read(&job.scope_id) {
        Ok(artifact) => Some(artifact.markup),
        Err(Error::NotYetAvailable(_)) => None,
        Err(e) => return Err(e),
    };
    let linked_scopes = job
        .linked
        .iter()
        .map(|link| resolve_link(&shared.db, link))
        .collect::<Result<Vec<_>, Error>>()?;
    let request = GenerationRequest {
        scope_id: job.scope_id.clone(),
        files,
        prior_markup,
        linked_scopes,
    };

    let request = &request;
    let label = format!("describe {}", job.scope_id);
    let summary = retry_with_backoff(&shared.retry, &label, move |_| backend.describe(request)).await?;
    let label = format!("generate {}", job.scope_id);
    let generated = retry_with_backoff(&shared.retry, &label, move |_| backend.generate(request)).await?;

    let artifact = shared.db.diagrams.commit(
        &job.scope_id,
        &generated.markup,
        &summary,
        &lineage,
        shared.cycle_id,
    )?;
    Ok(artifact)
}

/// Fill a link with the linked scope's current summary and file count
fn resolve_link(db: &StateDb, link: &ScopeLink) -> Result<ScopeLink, Error> {
    let mut link = link.clone();
    match db.diagrams.read(&link.scope_id) {
        Ok(artifact) => {
            link.files = artifact.lineage.len();
            link.summary = Some(artifact.summary).filter(|s| !s.is_empty());
        }
        Err(Error::NotYetAvailable(_)) => {}
        Err(e) => return Err(e),
    }
    Ok(link)
}

/// Read a file for summarization, at most `limit` bytes, fingerprinting the
/// content as it is now
async fn read_input(root: &Path, entry: &PathEntry, limit: u64) -> Result<FileInput, Error> {
    let full = root.join(&entry.path);
    let path = entry.path.clone();

    tokio::task::spawn_blocking(move || -> Result<FileInput, Error> {
        let (content, fingerprint) = read_prefix_and_hash(&full, limit).map_err(|source| Error::IoUnreadable {
            path: full.clone(),
            source,
        })?;
        Ok(FileInput {
            path,
            fingerprint,
            content: String::from_utf8_lossy(&content).into_owned(),
        })
    })
    .await
    .context("File read task failed")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::config::ScopeConfig;
    use constellation_core::hash::hash_bytes;
    use std::fs;
    use tempfile::TempDir;

    fn engine(dir: &TempDir, config: Config) -> anyhow::Result<(Engine, Arc<MockBackend>)> {
        let workspace = Workspace::init(dir.path())?;
        let backend = Arc::new(MockBackend::new());
        let engine = Engine::open(workspace, config, backend.clone())?;
        Ok((engine, backend))
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn test_discovered_scopes_all_clean() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::create_dir_all(dir.path().join("src/api"))?;
        fs::write(dir.path().join("README.md"), "readme")?;
        fs::write(dir.path().join("src/lib.rs"), "pub mod api;")?;
        fs::write(dir.path().join("src/api/mod.rs"), "fn handler() {}")?;

        let (engine, backend) = engine(&dir, Config::default())?;
        let report = engine.run_cycle(&CycleOptions::default(), no_shutdown()).await?;

        let root = engine.workspace().project_name();
        let ids: Vec<&str> = report.statuses.iter().map(|(id, _)| id.as_str()).collect();
        let mut expected = vec![root.as_str(), "src", "src/api"];
        expected.sort();
        assert_eq!(ids, expected);
        assert!(report.all_clean());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(backend.summarize_calls(), 3);
        assert_eq!(backend.describe_calls(), 3);
        assert_eq!(backend.generate_calls(), 3);

        let src = engine.db().diagrams.read("src")?;
        assert!(src.markup.contains("click Child0_src_api \"./api/mermaid.md\""));
        assert!(src.lineage.contains_key("src/lib.rs"));
        assert!(src.summary.starts_with("# Summary for src\n"));
        assert!(src.summary.contains("- src/api (Files: 1)"));
        Ok(())
    }

    #[tokio::test]
    async fn test_unchanged_tree_does_no_work() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("a.txt"), "a")?;
        let (engine, backend) = engine(&dir, Config::default())?;

        engine.run_cycle(&CycleOptions::default(), no_shutdown()).await?;
        let report = engine.run_cycle(&CycleOptions::default(), no_shutdown()).await?;

        assert_eq!(report.changes, 0);
        assert!(report.outcomes.is_empty());
        assert!(report.all_clean());
        assert_eq!(backend.generate_calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_only_affected_scopes_refresh() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::create_dir_all(dir.path().join("api"))?;
        fs::create_dir_all(dir.path().join("db"))?;
        fs::write(dir.path().join("api/a.rs"), "a")?;
        fs::write(dir.path().join("db/d.rs"), "d")?;

        let config = Config {
            scopes: vec![
                ScopeConfig {
                    id: "api".into(),
                    paths: vec!["api".into()],
                    ..Default::default()
                },
                ScopeConfig {
                    id: "db".into(),
                    paths: vec!["db".into()],
                    ..Default::default()
                },
            ],
            ..Config::default()
        };
        let (engine, _) = engine(&dir, config)?;
        engine.run_cycle(&CycleOptions::default(), no_shutdown()).await?;

        fs::write(dir.path().join("api/a.rs"), "a2")?;
        let report = engine.run_cycle(&CycleOptions::default(), no_shutdown()).await?;

        assert_eq!(report.affected, vec!["api".to_string()]);
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].result, UpdateResult::Updated { version: 2 });
        assert_eq!(engine.db().diagrams.read("db")?.version, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_vanished_scope_marked_obsolete() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::create_dir_all(dir.path().join("old"))?;
        fs::write(dir.path().join("old/x.txt"), "x")?;
        fs::write(dir.path().join("keep.txt"), "k")?;
        let (engine, _) = engine(&dir, Config::default())?;
        engine.run_cycle(&CycleOptions::default(), no_shutdown()).await?;

        fs::remove_dir_all(dir.path().join("old"))?;
        let report = engine.run_cycle(&CycleOptions::default(), no_shutdown()).await?;

        assert_eq!(report.obsoleted, vec!["old".to_string()]);
        let root = engine.workspace().project_name();
        assert_eq!(report.affected, vec![root.clone()]);
        assert!(!engine.db().diagrams.read(&root)?.markup.contains("./old/mermaid.md"));
        assert!(report.statuses.iter().all(|(id, _)| id != "old"));
        let record = engine.db().diagrams.record("old")?.unwrap();
        assert!(record.obsolete);
        assert_eq!(engine.db().diagrams.history("old")?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_before_dispatch_leaves_scopes_stale() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("a.txt"), "a")?;
        let (engine, backend) = engine(&dir, Config::default())?;

        let (tx, rx) = watch::channel(false);
        tx.send(true)?;
        let report = engine.run_cycle(&CycleOptions::default(), rx).await?;

        assert!(report.cancelled);
        assert_eq!(report.exit_code(), 1);
        assert!(report.statuses.iter().all(|(_, s)| *s == ArtifactStatus::Stale));
        assert_eq!(backend.generate_calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_auto_export() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::create_dir_all(dir.path().join("lib"))?;
        fs::write(dir.path().join("lib/x.rs"), "x")?;
        let mut config = Config::default();
        config.export.output_dir = Some(PathBuf::from("docs/diagrams"));
        config.export.auto = true;
        config.walk.exclude = vec!["docs/".into()];

        let (engine, _) = engine(&dir, config)?;
        let report = engine.run_cycle(&CycleOptions::default(), no_shutdown()).await?;

        assert_eq!(report.export.map(|e| e.written.len()), Some(4));
        let out = dir.path().join("docs/diagrams");
        assert!(out.join("mermaid.md").is_file());
        assert!(out.join("lib/mermaid.md").is_file());
        assert!(out.join("lib/summary.md").is_file());
        Ok(())
    }

    fn job(scope_id: &str, links: &[&str]) -> ScopeJob {
        ScopeJob {
            scope_id: scope_id.into(),
            files: Vec::new(),
            linked: links
                .iter()
                .map(|to| ScopeLink {
                    scope_id: to.to_string(),
                    href: format!("./{to}/mermaid.md"),
                    summary: None,
                    files: 0,
                })
                .collect(),
        }
    }

    fn wave_ids(waves: &[Vec<ScopeJob>]) -> Vec<Vec<&str>> {
        waves
            .iter()
            .map(|wave| wave.iter().map(|job| job.scope_id.as_str()).collect())
            .collect()
    }

    #[test]
    fn test_waves_follow_links() {
        let jobs = vec![job("root", &["a", "b"]), job("a", &["a/x"]), job("b", &[]), job("a/x", &["gone"])];
        let waves = waves(jobs);
        assert_eq!(wave_ids(&waves), vec![vec!["a/x", "b"], vec!["a"], vec!["root"]]);
    }

    #[test]
    fn test_link_cycle_shares_last_wave() {
        let jobs = vec![job("p", &["q"]), job("q", &["p"]), job("leaf", &[]), job("top", &["p"])];
        let waves = waves(jobs);
        assert_eq!(wave_ids(&waves), vec![vec!["leaf"], vec!["p", "q", "top"]]);
    }

    #[tokio::test]
    async fn test_parent_reads_child_summary_of_same_cycle() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::create_dir_all(dir.path().join("pkg/inner"))?;
        fs::write(dir.path().join("pkg/p.rs"), "p")?;
        fs::write(dir.path().join("pkg/inner/a.rs"), "a")?;
        fs::write(dir.path().join("pkg/inner/b.rs"), "b")?;
        let (engine, _) = engine(&dir, Config::default())?;
        engine.run_cycle(&CycleOptions::default(), no_shutdown()).await?;

        // A new file in the child changes its summary; the parent must see it.
        fs::write(dir.path().join("pkg/inner/c.rs"), "c")?;
        let report = engine.run_cycle(&CycleOptions::default(), no_shutdown()).await?;

        assert!(report.affected.contains(&"pkg/inner".to_string()));
        let pkg = engine.db().diagrams.read("pkg")?;
        assert!(pkg.summary.contains("- pkg/inner (Files: 3)"));
        Ok(())
    }

    #[tokio::test]
    async fn test_content_changed_after_walk() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let body = "the file changed after the walk";
        fs::write(dir.path().join("f.txt"), body)?;
        let (engine, _) = engine(&dir, Config::default())?;

        let walked = hash_bytes(b"old");
        let actual = hash_bytes(body.as_bytes());
        let job = ScopeJob {
            scope_id: "s".into(),
            files: vec![PathEntry::file("f.txt", walked, 3, 0)],
            linked: Vec::new(),
        };
        engine.states().track("s", ArtifactStatus::Stale);
        engine.states().begin_update("s")?;

        let shared = engine.task_shared(Ulid::new());
        let artifact = update_scope(&shared, &job).await?;

        assert!(engine.db().analysis.get(&walked)?.is_none());
        let cached = engine.db().analysis.get(&actual)?.unwrap();
        assert!(cached.text.contains("31 characters"));
        assert_eq!(artifact.lineage.get("f.txt"), Some(&actual));
        assert_eq!(engine.states().finish("s", true), ArtifactStatus::Stale);
        Ok(())
    }

    #[tokio::test]
    async fn test_cycle_applies_retention() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let (engine, _) = engine(&dir, Config::default())?;

        for i in 0..6 {
            fs::write(dir.path().join("a.txt"), format!("version {i}"))?;
            let report = engine.run_cycle(&CycleOptions::default(), no_shutdown()).await?;
            assert!(report.retention.is_some());
        }

        assert_eq!(engine.db().snapshots.count(), 2);
        let latest = engine.db().snapshots.latest()?.unwrap();
        assert_eq!(latest.seq(), 6);
        Ok(())
    }

    #[tokio::test]
    async fn test_scope_error_keeps_previous_base() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::create_dir_all(dir.path().join("src"))?;
        fs::write(dir.path().join("src/a.rs"), "a")?;
        let config = Config {
            scopes: vec![ScopeConfig {
                id: "broken".into(),
                paths: vec!["src/[".into()],
                ..Default::default()
            }],
            ..Config::default()
        };
        let (engine, backend) = engine(&dir, config)?;

        let result = engine.run_cycle(&CycleOptions::default(), no_shutdown()).await;
        assert!(result.is_err());
        assert_eq!(engine.db().snapshots.count(), 0);
        assert!(engine.db().snapshots.latest()?.is_none());
        assert_eq!(backend.generate_calls(), 0);
        Ok(())
    }
}
