//! Diagram scopes and change-to-scope mapping
//!
//! A scope owns a set of paths through its rules:
//!
//! | rule                   | matches                                      |
//! |------------------------|----------------------------------------------|
//! | `Prefix("src/api")`    | `src/api` and everything beneath it          |
//! | `Glob("src/**/*.rs")`  | paths matching the glob (`*` stops at `/`)   |
//! | `Directory("src/api")` | direct file children of `src/api` only       |
//!
//! A changed path affects every scope with a matching rule. When a file is
//! matched by several scopes, the most specific rule owns it: the rule with
//! the most literal characters wins, ties going to the smallest scope id.
//! Paths no rule matches belong to the catch-all scope `*`.

use anyhow::{Context, Result};
use constellation_core::store::parent_dir;
use constellation_core::{ChangeSet, PathEntry, Snapshot, CATCH_ALL_SCOPE};
use globset::{GlobBuilder, GlobMatcher};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::config::ScopeConfig;

/// Characters with special meaning in glob patterns
const GLOB_META: &[char] = &['*', '?', '[', ']', '{', '}', '!', ','];

/// One ownership rule
#[derive(Clone)]
pub enum ScopeRule {
    Prefix(String),
    Glob { pattern: String, matcher: GlobMatcher },
    Directory(String),
}

impl ScopeRule {
    /// Parse a `paths` entry: globs contain wildcard characters, anything
    /// else is a prefix
    pub fn parse_path(pattern: &str) -> Result<Self> {
        let trimmed = pattern.trim().trim_start_matches("./").trim_end_matches('/');
        if trimmed.contains(['*', '?', '[', '{']) {
            Self::glob(trimmed)
        } else {
            Ok(ScopeRule::Prefix(trimmed.to_string()))
        }
    }

    pub fn glob(pattern: &str) -> Result<Self> {
        let matcher = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .with_context(|| format!("Invalid scope glob '{pattern}'"))?
            .compile_matcher();
        Ok(ScopeRule::Glob {
            pattern: pattern.to_string(),
            matcher,
        })
    }

    pub fn directory(dir: &str) -> Self {
        ScopeRule::Directory(dir.trim().trim_start_matches("./").trim_end_matches('/').to_string())
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            ScopeRule::Prefix(prefix) => {
                prefix.is_empty()
                    || path == prefix
                    || (path.starts_with(prefix.as_str()) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
            }
            ScopeRule::Glob { matcher, .. } => matcher.is_match(path),
            ScopeRule::Directory(dir) => !path.is_empty() && parent_dir(path) == dir,
        }
    }

    /// Number of literal (non-wildcard) characters in the rule
    pub fn specificity(&self) -> usize {
        match self {
            ScopeRule::Prefix(p) | ScopeRule::Directory(p) => p.chars().count(),
            ScopeRule::Glob { pattern, .. } => pattern.chars().filter(|c| !GLOB_META.contains(c)).count(),
        }
    }
}

impl fmt::Debug for ScopeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeRule::Prefix(p) => write!(f, "Prefix({p:?})"),
            ScopeRule::Glob { pattern, .. } => write!(f, "Glob({pattern:?})"),
            ScopeRule::Directory(d) => write!(f, "Directory({d:?})"),
        }
    }
}

impl PartialEq for ScopeRule {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ScopeRule::Prefix(a), ScopeRule::Prefix(b)) => a == b,
            (ScopeRule::Glob { pattern: a, .. }, ScopeRule::Glob { pattern: b, .. }) => a == b,
            (ScopeRule::Directory(a), ScopeRule::Directory(b)) => a == b,
            _ => false,
        }
    }
}

/// A unit of diagram generation
#[derive(Debug, Clone, PartialEq)]
pub struct DiagramScope {
    pub id: String,
    pub rules: Vec<ScopeRule>,
    pub depends_on: Vec<String>,
}

impl DiagramScope {
    /// Specificity of the best rule matching `path`, if any
    fn best_match(&self, path: &str) -> Option<usize> {
        self.rules
            .iter()
            .filter(|rule| rule.matches(path))
            .map(ScopeRule::specificity)
            .max()
    }
}

/// The full set of configured or discovered scopes
#[derive(Debug, Clone, Default)]
pub struct ScopeSet {
    scopes: BTreeMap<String, DiagramScope>,
    /// Scope whose diagram describes the project root, when discovered
    root: Option<String>,
}

impl ScopeSet {
    /// Build from `[[scopes]]` tables
    pub fn from_config(configs: &[ScopeConfig]) -> Result<Self> {
        let mut scopes = BTreeMap::new();
        for config in configs {
            let mut rules = Vec::with_capacity(config.paths.len() + config.directories.len());
            for pattern in &config.paths {
                rules.push(ScopeRule::parse_path(pattern).with_context(|| format!("In scope '{}'", config.id))?);
            }
            rules.extend(config.directories.iter().map(|d| ScopeRule::directory(d)));

            scopes.insert(
                config.id.clone(),
                DiagramScope {
                    id: config.id.clone(),
                    rules,
                    depends_on: config.depends_on.clone(),
                },
            );
        }
        Ok(Self { scopes, root: None })
    }

    /// One scope per directory of `snapshot`, each depending on its child
    /// directories' scopes
    ///
    /// Directory scopes are identified by their path; the root directory by
    /// the project name (or `.` if a top-level directory already uses it).
    pub fn discover(snapshot: &Snapshot, project_name: &str) -> Self {
        let dirs: BTreeSet<&str> = snapshot.directories().map(|e| e.path.as_str()).collect();
        let root_id = if dirs.contains(project_name) || project_name.is_empty() {
            ".".to_string()
        } else {
            project_name.to_string()
        };
        let id_of = |dir: &str| if dir.is_empty() { root_id.clone() } else { dir.to_string() };

        let mut children: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for dir in dirs.iter().filter(|d| !d.is_empty()) {
            children.entry(parent_dir(dir)).or_default().push(id_of(dir));
        }

        let scopes = dirs
            .iter()
            .map(|dir| {
                let id = id_of(dir);
                let scope = DiagramScope {
                    id: id.clone(),
                    rules: vec![ScopeRule::Directory(dir.to_string())],
                    depends_on: children.remove(dir).unwrap_or_default(),
                };
                (id, scope)
            })
            .collect();

        Self {
            scopes,
            root: Some(root_id),
        }
    }

    pub fn get(&self, id: &str) -> Option<&DiagramScope> {
        self.scopes.get(id)
    }

    /// Scope ids, sorted
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.scopes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Id of the discovered root scope
    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    /// Scopes this scope links to in its diagram
    pub fn linked(&self, id: &str) -> Vec<String> {
        self.scopes.get(id).map(|s| s.depends_on.clone()).unwrap_or_default()
    }

    /// Every scope with a rule matching `path`; the catch-all when none does
    pub fn matching(&self, path: &str) -> Vec<&str> {
        let matched: Vec<&str> = self
            .scopes
            .values()
            .filter(|scope| scope.best_match(path).is_some())
            .map(|scope| scope.id.as_str())
            .collect();
        if matched.is_empty() {
            vec![CATCH_ALL_SCOPE]
        } else {
            matched
        }
    }

    /// The single scope owning `path`
    pub fn owner(&self, path: &str) -> &str {
        self.scopes
            .values()
            .filter_map(|scope| scope.best_match(path).map(|spec| (spec, Reverse(scope.id.as_str()))))
            .max()
            .map(|(_, Reverse(id))| id)
            .unwrap_or(CATCH_ALL_SCOPE)
    }

    /// Scopes affected by a change set
    ///
    /// Every scope matching a touched path, plus every scope that lists one
    /// of those in `depends_on` (one hop). The result does not depend on the
    /// order changes are processed in.
    pub fn map_changes(&self, changes: &ChangeSet) -> BTreeSet<String> {
        let mut direct = BTreeSet::new();
        for path in changes.touched_paths() {
            direct.extend(self.matching(path).into_iter().map(str::to_string));
        }

        let mut affected = direct.clone();
        for scope in self.scopes.values() {
            if scope.depends_on.iter().any(|dep| direct.contains(dep)) {
                affected.insert(scope.id.clone());
            }
        }
        affected
    }

    /// Files of `snapshot` grouped by owning scope
    ///
    /// Every configured scope appears, possibly with no files; the catch-all
    /// appears only when it owns something.
    pub fn ownership(&self, snapshot: &Snapshot) -> BTreeMap<String, Vec<PathEntry>> {
        let mut owned: BTreeMap<String, Vec<PathEntry>> =
            self.scopes.keys().map(|id| (id.clone(), Vec::new())).collect();
        for file in snapshot.files() {
            owned
                .entry(self.owner(&file.path).to_string())
                .or_default()
                .push(file.clone());
        }
        owned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use constellation_core::hash::hash_bytes;
    use constellation_core::SnapshotRef;

    fn snapshot(files: &[(&str, &str)], dirs: &[&str]) -> Snapshot {
        let mut entries: Vec<PathEntry> = files
            .iter()
            .map(|(path, content)| PathEntry::file(*path, hash_bytes(content.as_bytes()), content.len() as u64, 0))
            .collect();
        entries.extend(dirs.iter().map(|d| PathEntry::directory(*d, hash_bytes(d.as_bytes()), 0, 0)));
        Snapshot::new(1, SnapshotRef::Sequence(1), 0, entries)
    }

    fn scope(id: &str, paths: &[&str], dirs: &[&str], deps: &[&str]) -> ScopeConfig {
        ScopeConfig {
            id: id.into(),
            paths: paths.iter().map(|s| s.to_string()).collect(),
            directories: dirs.iter().map(|s| s.to_string()).collect(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn ids(set: &BTreeSet<String>) -> Vec<&str> {
        set.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_rule_matching() -> Result<()> {
        let prefix = ScopeRule::parse_path("src/api/")?;
        assert!(prefix.matches("src/api"));
        assert!(prefix.matches("src/api/handlers/user.rs"));
        assert!(!prefix.matches("src/apis/x.rs"));

        let glob = ScopeRule::parse_path("src/**/*.rs")?;
        assert!(matches!(glob, ScopeRule::Glob { .. }));
        assert!(glob.matches("src/lib.rs"));
        assert!(glob.matches("src/a/b/c.rs"));
        assert!(!glob.matches("tests/a.rs"));

        let single = ScopeRule::parse_path("src/*.rs")?;
        assert!(!single.matches("src/a/b.rs"), "* must not cross directories");

        let dir = ScopeRule::directory("src/api");
        assert!(dir.matches("src/api/mod.rs"));
        assert!(!dir.matches("src/api/v1/mod.rs"));

        let root = ScopeRule::directory("");
        assert!(root.matches("README.md"));
        assert!(!root.matches("src/lib.rs"));
        Ok(())
    }

    #[test]
    fn test_specificity() -> Result<()> {
        assert_eq!(ScopeRule::parse_path("src/api")?.specificity(), 7);
        assert_eq!(ScopeRule::parse_path("src/**/*.rs")?.specificity(), 8);
        assert_eq!(ScopeRule::directory("src").specificity(), 3);
        Ok(())
    }

    #[test]
    fn test_owner_prefers_most_specific() -> Result<()> {
        let set = ScopeSet::from_config(&[
            scope("code", &["src"], &[], &[]),
            scope("api", &["src/api"], &[], &[]),
            scope("rust", &["src/**/*.rs"], &[], &[]),
        ])?;

        assert_eq!(set.owner("src/api/user.rs"), "api");
        assert_eq!(set.owner("src/db/conn.rs"), "rust");
        assert_eq!(set.owner("src/db/schema.sql"), "code");
        assert_eq!(set.owner("README.md"), CATCH_ALL_SCOPE);
        Ok(())
    }

    #[test]
    fn test_owner_tie_breaks_on_smallest_id() -> Result<()> {
        let set = ScopeSet::from_config(&[scope("zeta", &["lib"], &[], &[]), scope("alpha", &["lib"], &[], &[])])?;
        assert_eq!(set.owner("lib/x.rs"), "alpha");
        Ok(())
    }

    #[test]
    fn test_map_changes_hits_all_matching_scopes_and_dependents() -> Result<()> {
        let set = ScopeSet::from_config(&[
            scope("api", &["src/api"], &[], &[]),
            scope("rust", &["src/**/*.rs"], &[], &[]),
            scope("overview", &[], &["docs"], &["api"]),
            scope("top", &["zzz"], &[], &["overview"]),
        ])?;
        let base = snapshot(&[], &[]);
        let head = snapshot(&[("src/api/user.rs", "u"), ("notes.txt", "n")], &[]);

        let affected = set.map_changes(&ChangeSet::diff(&base, &head));
        assert_eq!(ids(&affected), vec!["*", "api", "overview", "rust"]);
        Ok(())
    }

    #[test]
    fn test_map_changes_is_idempotent_and_order_independent() -> Result<()> {
        let set = ScopeSet::from_config(&[
            scope("a", &["a"], &[], &[]),
            scope("b", &["b/**/*.md"], &[], &["a"]),
        ])?;
        let base = snapshot(&[("a/1.txt", "x"), ("b/c/d.md", "y")], &[]);
        let head = snapshot(&[("b/c/d.md", "y2"), ("a/1.txt", "x2"), ("c.txt", "z")], &[]);
        let reversed_head = snapshot(&[("c.txt", "z"), ("a/1.txt", "x2"), ("b/c/d.md", "y2")], &[]);

        let changes = ChangeSet::diff(&base, &head);
        let first = set.map_changes(&changes);
        assert_eq!(first, set.map_changes(&changes));
        assert_eq!(first, set.map_changes(&ChangeSet::diff(&base, &reversed_head)));
        assert_eq!(ids(&first), vec!["*", "a", "b"]);
        Ok(())
    }

    #[test]
    fn test_rename_affects_both_sides() -> Result<()> {
        let set = ScopeSet::from_config(&[scope("old", &["old"], &[], &[]), scope("new", &["new"], &[], &[])])?;
        let base = snapshot(&[("old/x.rs", "same")], &[]);
        let head = snapshot(&[("new/x.rs", "same")], &[]);

        let changes = ChangeSet::diff(&base, &head);
        assert_eq!(changes.renamed.len(), 1);
        assert_eq!(ids(&set.map_changes(&changes)), vec!["new", "old"]);
        Ok(())
    }

    #[test]
    fn test_discover_directory_scopes() {
        let snap = snapshot(
            &[("README.md", "r"), ("a/x.txt", "x"), ("a/b/y.txt", "y")],
            &["a/b", "a", ""],
        );
        let set = ScopeSet::discover(&snap, "proj");

        assert_eq!(set.ids().collect::<Vec<_>>(), vec!["a", "a/b", "proj"]);
        assert_eq!(set.root(), Some("proj"));
        assert_eq!(set.linked("proj"), vec!["a"]);
        assert_eq!(set.linked("a"), vec!["a/b"]);
        assert_eq!(set.owner("a/b/y.txt"), "a/b");
        assert_eq!(set.owner("README.md"), "proj");

        // A change deep in the tree refreshes the directory and its parent only
        let base = snap.clone();
        let head = snapshot(
            &[("README.md", "r"), ("a/x.txt", "x"), ("a/b/y.txt", "changed")],
            &["a/b", "a", ""],
        );
        let affected = set.map_changes(&ChangeSet::diff(&base, &head));
        assert_eq!(ids(&affected), vec!["a", "a/b"]);
    }

    #[test]
    fn test_discover_avoids_root_id_collision() {
        let snap = snapshot(&[("proj/x.txt", "x")], &["proj", ""]);
        let set = ScopeSet::discover(&snap, "proj");
        assert_eq!(set.root(), Some("."));
        assert_eq!(set.owner("proj/x.txt"), "proj");
    }

    #[test]
    fn test_ownership_groups_files() -> Result<()> {
        let set = ScopeSet::from_config(&[scope("api", &["api"], &[], &[]), scope("empty", &["nothing"], &[], &[])])?;
        let snap = snapshot(&[("api/a.rs", "a"), ("api/b.rs", "b"), ("misc.txt", "m")], &[]);

        let owned = set.ownership(&snap);
        assert_eq!(owned["api"].len(), 2);
        assert!(owned["empty"].is_empty());
        assert_eq!(owned[CATCH_ALL_SCOPE][0].path, "misc.txt");
        Ok(())
    }

    #[test]
    fn test_invalid_glob_rejected() {
        assert!(ScopeSet::from_config(&[scope("bad", &["src/[abc"], &[], &[])]).is_err());
    }
}
