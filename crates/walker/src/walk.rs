//! Deterministic post-order tree walk
//!
//! Enumerates the project tree with children sorted by file name, skipping
//! symlinks and excluded subtrees, and fingerprints every file and directory.
//! Directory fingerprints aggregate their already-fingerprinted children, so
//! one pass suffices.

use crate::ignore::ExcludeRules;
use constellation_core::hash::{hash_file, DirectoryHasher};
use constellation_core::store::{file_name, normalize_path};
use constellation_core::{Error, PathEntry, Snapshot, SnapshotRef};
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Instant, UNIX_EPOCH};
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

/// A directory whose children are still being visited
struct OpenDir {
    path: String,
    depth: usize,
    hasher: DirectoryHasher,
    size: u64,
    mtime_ms: u64,
}

/// Walks one project root
pub struct TreeWalker {
    root: PathBuf,
    rules: ExcludeRules,
}

impl TreeWalker {
    pub fn new(root: &Path, rules: ExcludeRules) -> Self {
        Self {
            root: root.to_path_buf(),
            rules,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rules(&self) -> &ExcludeRules {
        &self.rules
    }

    /// Walk the tree and return its entries in post-order
    ///
    /// Aborts with [`Error::IoUnreadable`] on the first path that cannot be
    /// listed, stat'ed or read; a partial entry list is never returned.
    pub fn walk(&self) -> Result<Vec<PathEntry>, Error> {
        let started = Instant::now();
        let mut entries = Vec::new();
        let mut open: Vec<OpenDir> = Vec::new();

        let iter = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !self.excluded(e));

        for item in iter {
            let entry = item.map_err(|err| {
                let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
                let source = err
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "filesystem loop detected"));
                Error::IoUnreadable { path, source }
            })?;

            // Leaving a directory: everything deeper than this entry's parent is done.
            while open.last().is_some_and(|dir| dir.depth >= entry.depth()) {
                close_dir(&mut open, &mut entries);
            }

            let file_type = entry.file_type();
            if file_type.is_symlink() {
                debug!(path = %entry.path().display(), "skipping symlink");
                continue;
            }

            let rel = self.relative(entry.path())?;
            let metadata = entry.metadata().map_err(|err| Error::IoUnreadable {
                path: entry.path().to_path_buf(),
                source: err
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "metadata unavailable")),
            })?;

            if file_type.is_dir() {
                open.push(OpenDir {
                    path: rel,
                    depth: entry.depth(),
                    hasher: DirectoryHasher::new(),
                    size: 0,
                    mtime_ms: mtime_ms(&metadata),
                });
            } else if file_type.is_file() {
                let fingerprint = hash_file(entry.path()).map_err(|source| Error::IoUnreadable {
                    path: entry.path().to_path_buf(),
                    source,
                })?;
                let size = metadata.len();
                if let Some(parent) = open.last_mut() {
                    parent.hasher.push_child(file_name(&rel), false, &fingerprint);
                    parent.size += size;
                }
                entries.push(PathEntry::file(rel, fingerprint, size, mtime_ms(&metadata)));
            } else {
                debug!(path = %entry.path().display(), "skipping special file");
            }
        }

        while !open.is_empty() {
            close_dir(&mut open, &mut entries);
        }

        info!(
            root = %self.root.display(),
            entries = entries.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tree walk complete"
        );
        Ok(entries)
    }

    /// Walk the tree into a snapshot
    pub fn snapshot(&self, seq: u64, reference: SnapshotRef, captured_at_ms: u64) -> Result<Snapshot, Error> {
        let entries = self.walk()?;
        Ok(Snapshot::new(seq, reference, captured_at_ms, entries))
    }

    fn excluded(&self, entry: &DirEntry) -> bool {
        match entry.path().strip_prefix(&self.root) {
            Ok(rel) => self.rules.should_ignore(rel, entry.file_type().is_dir()),
            Err(_) => false,
        }
    }

    fn relative(&self, path: &Path) -> Result<String, Error> {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        normalize_path(rel).map_err(|err| Error::IoUnreadable {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidData, err.to_string()),
        })
    }
}

/// Finalize the innermost open directory and fold it into its parent
fn close_dir(open: &mut Vec<OpenDir>, entries: &mut Vec<PathEntry>) {
    let Some(dir) = open.pop() else {
        return;
    };
    let fingerprint = dir.hasher.finalize();
    if let Some(parent) = open.last_mut() {
        parent.hasher.push_child(file_name(&dir.path), true, &fingerprint);
        parent.size += dir.size;
    }
    entries.push(PathEntry::directory(dir.path, fingerprint, dir.size, dir.mtime_ms));
}

fn mtime_ms(metadata: &Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
