//! Change detection between two snapshots

use crate::hash::Fingerprint;
use crate::snapshot::{PathEntry, Snapshot, SnapshotRef};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Identity of a snapshot referenced by a change set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMark {
    pub seq: u64,
    pub reference: SnapshotRef,
}

impl From<&Snapshot> for SnapshotMark {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            seq: snapshot.seq(),
            reference: snapshot.reference().clone(),
        }
    }
}

/// Kind of change reported by a version-control system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    /// Path was moved here from `from`
    Renamed { from: String },
}

/// One `{path, changeKind}` tuple from a version-control change list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcsChange {
    pub path: String,
    pub kind: ChangeKind,
}

impl VcsChange {
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self { path: path.into(), kind }
    }
}

/// Structured difference between two snapshots
///
/// Only file entries are reported. Every path appears in at most one
/// category, and a path whose fingerprint is equal on both sides never
/// appears. All lists are sorted by path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub base: SnapshotMark,
    pub head: SnapshotMark,
    pub added: Vec<PathEntry>,
    pub removed: Vec<PathEntry>,
    /// (old, new) pairs at the same path
    pub modified: Vec<(PathEntry, PathEntry)>,
    /// (old, new) pairs with identical content at different paths
    pub renamed: Vec<(PathEntry, PathEntry)>,
}

impl ChangeSet {
    /// Compare two snapshots by path, then pair exact-content renames
    pub fn diff(base: &Snapshot, head: &Snapshot) -> Self {
        let mut added = BTreeMap::new();
        let mut removed = BTreeMap::new();
        let mut modified = BTreeMap::new();

        for new in head.files() {
            match base.get(&new.path).filter(|old| old.is_file()) {
                Some(old) if old.fingerprint == new.fingerprint => {}
                Some(old) => {
                    modified.insert(new.path.clone(), (old.clone(), new.clone()));
                }
                None => {
                    added.insert(new.path.clone(), new.clone());
                }
            }
        }

        for old in base.files() {
            if !head.get(&old.path).is_some_and(PathEntry::is_file) {
                removed.insert(old.path.clone(), old.clone());
            }
        }

        Self::assemble(base, head, added, removed, modified)
    }

    /// Normalize a version-control change list into a change set
    ///
    /// Entries are resolved against the two snapshots so the rest of the
    /// pipeline sees the same shape regardless of the change source. Paths the
    /// walker excluded, and entries whose content did not actually change, are
    /// dropped.
    pub fn from_change_list(changes: &[VcsChange], base: &Snapshot, head: &Snapshot) -> Self {
        let mut added = BTreeMap::new();
        let mut removed = BTreeMap::new();
        let mut modified = BTreeMap::new();

        let file_in = |snap: &Snapshot, path: &str| snap.get(path).filter(|e| e.is_file()).cloned();

        for change in changes {
            let new = file_in(head, &change.path);
            let old = match &change.kind {
                ChangeKind::Renamed { from } => file_in(base, from),
                _ => file_in(base, &change.path),
            };

            match (old, new) {
                (Some(old), Some(new)) if old.path == new.path => {
                    if old.fingerprint != new.fingerprint {
                        modified.insert(new.path.clone(), (old, new));
                    }
                }
                (Some(old), Some(new)) => {
                    removed.insert(old.path.clone(), old);
                    added.insert(new.path.clone(), new);
                }
                (Some(old), None) => {
                    removed.insert(old.path.clone(), old);
                }
                (None, Some(new)) => {
                    added.insert(new.path.clone(), new);
                }
                (None, None) => {
                    debug!(path = %change.path, "change list entry not present in either snapshot");
                }
            }
        }

        // A path can only be in one category; later list entries win over
        // earlier contradictory ones for the same path.
        for path in modified.keys() {
            added.remove(path);
            removed.remove(path);
        }
        removed.retain(|path, _| !added.contains_key(path));

        Self::assemble(base, head, added, removed, modified)
    }

    fn assemble(
        base: &Snapshot,
        head: &Snapshot,
        mut added: BTreeMap<String, PathEntry>,
        mut removed: BTreeMap<String, PathEntry>,
        modified: BTreeMap<String, (PathEntry, PathEntry)>,
    ) -> Self {
        let renamed = pair_renames(&mut added, &mut removed);
        Self {
            base: SnapshotMark::from(base),
            head: SnapshotMark::from(head),
            added: added.into_values().collect(),
            removed: removed.into_values().collect(),
            modified: modified.into_values().collect(),
            renamed,
        }
    }

    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty() && self.renamed.is_empty()
    }

    /// Total number of reported changes (a rename counts once)
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len() + self.renamed.len()
    }

    /// Every path touched by the change set, on either side
    pub fn touched_paths(&self) -> impl Iterator<Item = &str> {
        self.added
            .iter()
            .chain(self.removed.iter())
            .map(|e| e.path.as_str())
            .chain(
                self.modified
                    .iter()
                    .chain(self.renamed.iter())
                    .flat_map(|(old, new)| [old.path.as_str(), new.path.as_str()]),
            )
    }
}

/// Pair removed and added files with identical content into renames
///
/// Candidates are matched in path order on both sides, so the pairing is
/// deterministic when several files share the same content.
fn pair_renames(
    added: &mut BTreeMap<String, PathEntry>,
    removed: &mut BTreeMap<String, PathEntry>,
) -> Vec<(PathEntry, PathEntry)> {
    if added.is_empty() || removed.is_empty() {
        return Vec::new();
    }

    let mut by_content: AHashMap<(Fingerprint, u64), Vec<String>> = AHashMap::new();
    for entry in removed.values() {
        by_content
            .entry((entry.fingerprint, entry.size))
            .or_default()
            .push(entry.path.clone());
    }
    // Reverse so pop() yields the smallest path first.
    for paths in by_content.values_mut() {
        paths.reverse();
    }

    let mut renamed = Vec::new();
    let added_paths: Vec<String> = added.keys().cloned().collect();
    for path in added_paths {
        let key = match added.get(&path) {
            Some(entry) => (entry.fingerprint, entry.size),
            None => continue,
        };
        let Some(old_path) = by_content.get_mut(&key).and_then(Vec::pop) else {
            continue;
        };
        if let (Some(old), Some(new)) = (removed.remove(&old_path), added.remove(&path)) {
            renamed.push((old, new));
        }
    }
    renamed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;

    fn file(path: &str, content: &[u8]) -> PathEntry {
        PathEntry::file(path, hash_bytes(content), content.len() as u64, 0)
    }

    fn snap(seq: u64, entries: Vec<PathEntry>) -> Snapshot {
        Snapshot::new(seq, SnapshotRef::Sequence(seq), 0, entries)
    }

    #[test]
    fn test_unchanged_tree_has_empty_diff() {
        let entries = vec![file("a.txt", b"a"), file("b/c.txt", b"c")];
        let base = snap(1, entries.clone());
        let head = snap(2, entries);
        let changes = ChangeSet::diff(&base, &head);
        assert!(changes.is_empty());
        assert_eq!(changes.base.seq, 1);
        assert_eq!(changes.head.seq, 2);
    }

    #[test]
    fn test_added_removed_modified() {
        let base = snap(1, vec![file("keep.txt", b"k"), file("gone.txt", b"g"), file("edit.txt", b"v1")]);
        let head = snap(2, vec![file("keep.txt", b"k"), file("new.txt", b"n"), file("edit.txt", b"v2")]);
        let changes = ChangeSet::diff(&base, &head);

        assert_eq!(changes.added.iter().map(|e| e.path.as_str()).collect::<Vec<_>>(), vec!["new.txt"]);
        assert_eq!(changes.removed.iter().map(|e| e.path.as_str()).collect::<Vec<_>>(), vec!["gone.txt"]);
        assert_eq!(changes.modified.len(), 1);
        assert_eq!(changes.modified[0].0.fingerprint, hash_bytes(b"v1"));
        assert_eq!(changes.modified[0].1.fingerprint, hash_bytes(b"v2"));
        assert!(changes.renamed.is_empty());
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn test_pure_rename_is_single_pair() {
        let base = snap(1, vec![file("x.txt", b"same content")]);
        let head = snap(2, vec![file("y.txt", b"same content")]);
        let changes = ChangeSet::diff(&base, &head);

        assert!(changes.added.is_empty());
        assert!(changes.removed.is_empty());
        assert_eq!(changes.renamed.len(), 1);
        assert_eq!(changes.renamed[0].0.path, "x.txt");
        assert_eq!(changes.renamed[0].1.path, "y.txt");
    }

    #[test]
    fn test_rename_pairing_is_deterministic_for_duplicates() {
        let base = snap(1, vec![file("a1", b"dup"), file("a2", b"dup")]);
        let head = snap(2, vec![file("b1", b"dup"), file("b2", b"dup"), file("b3", b"dup")]);
        let changes = ChangeSet::diff(&base, &head);

        let pairs: Vec<_> = changes
            .renamed
            .iter()
            .map(|(o, n)| (o.path.as_str(), n.path.as_str()))
            .collect();
        assert_eq!(pairs, vec![("a1", "b1"), ("a2", "b2")]);
        assert_eq!(changes.added.len(), 1);
        assert_eq!(changes.added[0].path, "b3");
    }

    #[test]
    fn test_directories_are_not_reported() {
        let base = snap(1, vec![PathEntry::directory("d", hash_bytes(b"1"), 0, 0)]);
        let head = snap(2, vec![PathEntry::directory("d", hash_bytes(b"2"), 0, 0)]);
        assert!(ChangeSet::diff(&base, &head).is_empty());
    }

    #[test]
    fn test_no_path_in_two_categories() {
        let base = snap(1, vec![file("a", b"1"), file("b", b"2"), file("c", b"3")]);
        let head = snap(2, vec![file("a", b"2"), file("d", b"3"), file("e", b"9")]);
        let changes = ChangeSet::diff(&base, &head);

        let mut seen = std::collections::HashSet::new();
        for path in changes.touched_paths() {
            assert!(seen.insert(path.to_string()), "{path} reported twice");
        }
    }

    #[test]
    fn test_change_list_normalization() {
        let base = snap(1, vec![file("x.txt", b"same"), file("m.txt", b"v1"), file("d.txt", b"d")]);
        let head = snap(2, vec![file("y.txt", b"same"), file("m.txt", b"v2"), file("n.txt", b"n")]);
        let list = vec![
            VcsChange::new("y.txt", ChangeKind::Renamed { from: "x.txt".into() }),
            VcsChange::new("m.txt", ChangeKind::Modified),
            VcsChange::new("d.txt", ChangeKind::Deleted),
            VcsChange::new("n.txt", ChangeKind::Added),
            VcsChange::new("ignored/build.log", ChangeKind::Added),
        ];

        let from_list = ChangeSet::from_change_list(&list, &base, &head);
        assert_eq!(from_list, ChangeSet::diff(&base, &head));
        assert_eq!(from_list.renamed.len(), 1);
    }

    #[test]
    fn test_change_list_drops_unchanged_content() {
        let base = snap(1, vec![file("m.txt", b"same")]);
        let head = snap(2, vec![file("m.txt", b"same")]);
        let list = vec![VcsChange::new("m.txt", ChangeKind::Modified)];
        assert!(ChangeSet::from_change_list(&list, &base, &head).is_empty());
    }
}
