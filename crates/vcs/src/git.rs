//! Git change lists via libgit2

use anyhow::{Context, Result};
use constellation_core::store::normalize_path;
use constellation_core::{ChangeKind, VcsChange};
use git2::{Delta, Diff, DiffFindOptions, DiffOptions, ErrorCode, Repository, Tree};
use std::path::Path;
use tracing::debug;

/// A git work tree containing the project root
pub struct GitRepo {
    repo: Repository,
    /// Project root relative to the work tree (`""` when they coincide)
    prefix: String,
}

impl GitRepo {
    /// Find the repository containing `root`
    ///
    /// Returns `None` when `root` is not inside a git work tree.
    pub fn discover(root: &Path) -> Result<Option<Self>> {
        let repo = match Repository::discover(root) {
            Ok(repo) => repo,
            Err(err) if err.code() == ErrorCode::NotFound => return Ok(None),
            Err(err) => return Err(err).context("Failed to open git repository"),
        };

        let workdir = match repo.workdir() {
            Some(dir) => dir
                .canonicalize()
                .with_context(|| format!("Failed to resolve work tree {}", dir.display()))?,
            None => {
                debug!(path = %repo.path().display(), "bare repository ignored");
                return Ok(None);
            }
        };
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve project root {}", root.display()))?;
        let rel = root
            .strip_prefix(&workdir)
            .with_context(|| format!("{} is outside work tree {}", root.display(), workdir.display()))?;
        let prefix = normalize_path(rel)?;

        debug!(workdir = %workdir.display(), prefix = %prefix, "git repository found");
        Ok(Some(Self { repo, prefix }))
    }

    /// Id of the commit HEAD points at, `None` on an unborn branch
    pub fn head_commit(&self) -> Result<Option<String>> {
        match self.repo.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?.id().to_string())),
            Err(err) if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => Ok(None),
            Err(err) => Err(err).context("Failed to read HEAD"),
        }
    }

    /// Resolve a revision expression (`HEAD~2`, a branch, a short id) to a commit id
    pub fn resolve(&self, rev: &str) -> Result<String> {
        let commit = self
            .repo
            .revparse_single(rev)
            .and_then(|obj| obj.peel_to_commit())
            .with_context(|| format!("Unknown revision '{rev}'"))?;
        Ok(commit.id().to_string())
    }

    /// Changes between two revisions, paths relative to the project root
    pub fn change_list(&self, from: &str, to: &str) -> Result<Vec<VcsChange>> {
        let old = self.tree_of(from)?;
        let new = self.tree_of(to)?;
        let mut opts = self.diff_options();
        let mut diff = self
            .repo
            .diff_tree_to_tree(Some(&old), Some(&new), Some(&mut opts))
            .with_context(|| format!("Failed to diff {from}..{to}"))?;
        self.collect(&mut diff)
    }

    /// Changes between a revision and the working tree, untracked files included
    pub fn working_changes(&self, from: &str) -> Result<Vec<VcsChange>> {
        let old = self.tree_of(from)?;
        let mut opts = self.diff_options();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let mut diff = self
            .repo
            .diff_tree_to_workdir_with_index(Some(&old), Some(&mut opts))
            .with_context(|| format!("Failed to diff {from} against the working tree"))?;
        self.collect(&mut diff)
    }

    fn tree_of(&self, rev: &str) -> Result<Tree<'_>> {
        self.repo
            .revparse_single(rev)
            .and_then(|obj| obj.peel_to_tree())
            .with_context(|| format!("Unknown revision '{rev}'"))
    }

    fn diff_options(&self) -> DiffOptions {
        let mut opts = DiffOptions::new();
        if !self.prefix.is_empty() {
            opts.pathspec(self.prefix.as_str());
        }
        opts
    }

    fn collect(&self, diff: &mut Diff<'_>) -> Result<Vec<VcsChange>> {
        let mut find = DiffFindOptions::new();
        find.renames(true).for_untracked(true);
        diff.find_similar(Some(&mut find)).context("Rename detection failed")?;

        let mut changes = Vec::new();
        for delta in diff.deltas() {
            let Some(path) = self.project_path(delta.new_file().path().or(delta.old_file().path()))? else {
                continue;
            };
            let kind = match delta.status() {
                Delta::Added | Delta::Untracked | Delta::Copied => ChangeKind::Added,
                Delta::Deleted => ChangeKind::Deleted,
                Delta::Modified | Delta::Typechange | Delta::Conflicted | Delta::Unreadable => ChangeKind::Modified,
                Delta::Renamed => match self.project_path(delta.old_file().path())? {
                    Some(from) => ChangeKind::Renamed { from },
                    None => ChangeKind::Added,
                },
                Delta::Unmodified | Delta::Ignored => continue,
            };
            changes.push(VcsChange::new(path, kind));
        }

        changes.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(changes = changes.len(), "git change list collected");
        Ok(changes)
    }

    /// Map a work-tree path to a project path, `None` when outside the project
    fn project_path(&self, path: Option<&Path>) -> Result<Option<String>> {
        let Some(path) = path else {
            return Ok(None);
        };
        let normalized = normalize_path(path)?;
        if self.prefix.is_empty() {
            return Ok(Some(normalized));
        }
        Ok(normalized
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .map(str::to_string))
    }
}
