//! Export of Clean diagrams to a mirrored directory tree
//!
//! Each scope's latest Clean markup is written to
//! `<output_dir>/<scope path>/mermaid.md` with its overview next to it in
//! `summary.md`. The root scope of a discovered
//! project lands at `<output_dir>/mermaid.md` and the catch-all scope under
//! `_unmapped/`.

use anyhow::{Context, Result};
use constellation_core::store::atomic_write;
use constellation_core::CATCH_ALL_SCOPE;
use constellation_journal::StateDb;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const DIAGRAM_FILE: &str = "mermaid.md";
pub const SUMMARY_FILE: &str = "summary.md";
const UNMAPPED_DIR: &str = "_unmapped";

/// Directory components a scope's diagram is exported under
fn scope_components<'a>(scope_id: &'a str, root: Option<&str>) -> Vec<&'a str> {
    if Some(scope_id) == root {
        return Vec::new();
    }
    if scope_id == CATCH_ALL_SCOPE {
        return vec![UNMAPPED_DIR];
    }
    scope_id
        .split('/')
        .filter(|c| !c.is_empty())
        .map(|c| if c == "." || c == ".." { "_" } else { c })
        .collect()
}

/// Directory a scope's files are exported to, relative to the output directory
pub fn scope_dir(scope_id: &str, root: Option<&str>) -> PathBuf {
    scope_components(scope_id, root).into_iter().collect()
}

/// Path of a scope's exported diagram, relative to the output directory
pub fn diagram_path(scope_id: &str, root: Option<&str>) -> PathBuf {
    scope_dir(scope_id, root).join(DIAGRAM_FILE)
}

/// Link from one scope's exported diagram to another's
pub fn relative_link(from: &str, to: &str, root: Option<&str>) -> String {
    let from_dir = scope_components(from, root);
    let to_dir = scope_components(to, root);
    let common = from_dir.iter().zip(&to_dir).take_while(|(a, b)| a == b).count();

    let mut parts: Vec<&str> = Vec::new();
    if common == from_dir.len() {
        parts.push(".");
    } else {
        parts.extend(std::iter::repeat("..").take(from_dir.len() - common));
    }
    parts.extend(&to_dir[common..]);
    parts.push(DIAGRAM_FILE);
    parts.join("/")
}

/// Result of an export run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExportReport {
    /// Files written, absolute
    pub written: Vec<PathBuf>,
    /// Scopes whose exported files were already up to date
    pub unchanged: usize,
    /// Scopes with no Clean version yet
    pub unavailable: Vec<String>,
}

/// Write every live scope's Clean diagram under `output_dir`
///
/// With `only`, exports just that scope. Files whose content already
/// matches are left untouched.
pub fn export_diagrams(db: &StateDb, output_dir: &Path, root: Option<&str>, only: Option<&str>) -> Result<ExportReport> {
    let mut report = ExportReport::default();

    for record in db.diagrams.records()? {
        if record.obsolete || only.is_some_and(|id| id != record.scope_id) {
            continue;
        }
        let artifact = match db.diagrams.read(&record.scope_id) {
            Ok(artifact) => artifact,
            Err(constellation_core::Error::NotYetAvailable(_)) => {
                report.unavailable.push(record.scope_id);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let dir = output_dir.join(scope_dir(&record.scope_id, root));
        let files = [(DIAGRAM_FILE, &artifact.markup), (SUMMARY_FILE, &artifact.summary)];
        let mut wrote = false;
        for (name, content) in files {
            let target = dir.join(name);
            if fs::read_to_string(&target).is_ok_and(|existing| existing == *content) {
                continue;
            }
            fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
            atomic_write(&dir, &target, content.as_bytes())?;
            debug!(scope = %record.scope_id, path = %target.display(), version = artifact.version, "exported");
            report.written.push(target);
            wrote = true;
        }
        if !wrote {
            report.unchanged += 1;
        }
    }

    info!(
        written = report.written.len(),
        unchanged = report.unchanged,
        unavailable = report.unavailable.len(),
        "export complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use constellation_core::ArtifactStatus;
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use ulid::Ulid;

    #[test]
    fn test_diagram_paths() {
        assert_eq!(diagram_path("proj", Some("proj")), PathBuf::from("mermaid.md"));
        assert_eq!(diagram_path("src/api", Some("proj")), PathBuf::from("src/api/mermaid.md"));
        assert_eq!(diagram_path("*", None), PathBuf::from("_unmapped/mermaid.md"));
        assert_eq!(diagram_path("../evil", None), PathBuf::from("_/evil/mermaid.md"));
    }

    #[test]
    fn test_relative_links() {
        let root = Some("proj");
        assert_eq!(relative_link("proj", "src", root), "./src/mermaid.md");
        assert_eq!(relative_link("src", "src/api", root), "./api/mermaid.md");
        assert_eq!(relative_link("src/api", "src/db", root), "../db/mermaid.md");
        assert_eq!(relative_link("overview", "api", None), "../api/mermaid.md");
        assert_eq!(relative_link("src/api", "proj", root), "../../mermaid.md");
    }

    #[test]
    fn test_export_writes_clean_diagrams() -> Result<()> {
        let dir = TempDir::new()?;
        let db = StateDb::open(&dir.path().join("state.db"))?;
        db.diagrams.ensure_scope("proj")?;
        db.diagrams.ensure_scope("src")?;
        db.diagrams.ensure_scope("pending")?;
        db.diagrams.ensure_scope("gone")?;
        db.diagrams.commit("proj", "```mermaid\nroot\n```\n", "# Summary for proj\n", &BTreeMap::new(), Ulid::new())?;
        db.diagrams.commit("src", "```mermaid\nsrc\n```\n", "# Summary for src\n", &BTreeMap::new(), Ulid::new())?;
        db.diagrams.commit("gone", "```mermaid\ngone\n```\n", "", &BTreeMap::new(), Ulid::new())?;
        db.diagrams.mark_obsolete("gone")?;

        let out = dir.path().join("docs");
        let report = export_diagrams(&db, &out, Some("proj"), None)?;
        assert_eq!(report.written.len(), 4);
        assert_eq!(report.unavailable, vec!["pending".to_string()]);
        assert_eq!(fs::read_to_string(out.join("mermaid.md"))?, "```mermaid\nroot\n```\n");
        assert_eq!(fs::read_to_string(out.join("src/mermaid.md"))?, "```mermaid\nsrc\n```\n");
        assert_eq!(fs::read_to_string(out.join("summary.md"))?, "# Summary for proj\n");
        assert_eq!(fs::read_to_string(out.join("src/summary.md"))?, "# Summary for src\n");
        assert!(!out.join("gone").exists());

        let again = export_diagrams(&db, &out, Some("proj"), None)?;
        assert!(again.written.is_empty());
        assert_eq!(again.unchanged, 2);

        // A summary edited by hand is restored on its own
        fs::write(out.join("src/summary.md"), "edited")?;
        let repaired = export_diagrams(&db, &out, Some("proj"), None)?;
        assert_eq!(repaired.written, vec![out.join("src/summary.md")]);
        assert_eq!(repaired.unchanged, 1);
        assert_eq!(db.diagrams.record("src")?.map(|r| r.status), Some(ArtifactStatus::Clean));
        Ok(())
    }

    #[test]
    fn test_export_single_scope() -> Result<()> {
        let dir = TempDir::new()?;
        let db = StateDb::open(&dir.path().join("state.db"))?;
        for id in ["a", "b"] {
            db.diagrams.ensure_scope(id)?;
            db.diagrams.commit(id, "```mermaid\nx\n```\n", "x", &BTreeMap::new(), Ulid::new())?;
        }

        let out = dir.path().join("out");
        let report = export_diagrams(&db, &out, None, Some("b"))?;
        assert_eq!(report.written, vec![out.join("b/mermaid.md"), out.join("b/summary.md")]);
        assert!(!out.join("a").exists());
        Ok(())
    }
}
