//! Write Clean diagrams to a mirrored directory tree

use crate::locks::SyncLock;
use crate::util;
use anyhow::{Context, Result};
use constellation_core::Snapshot;
use constellation_journal::StateDb;
use constellation_sync::{export_diagrams, scopes_for};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};

pub async fn run(root: Option<&Path>, scope: Option<&str>, output: Option<PathBuf>) -> Result<()> {
    let (workspace, config) = util::open_project(root)?;
    let _lock = SyncLock::acquire(&workspace.locks_dir(), "export")?;
    let db = StateDb::open(&workspace.db_path()).context("Failed to open state database")?;

    let output_dir = match output {
        Some(dir) => dir,
        None => config
            .export
            .output_dir
            .as_ref()
            .map(|dir| workspace.root().join(dir))
            .context("No output directory: pass --output or set [export] output_dir")?,
    };

    if let Some(scope) = scope {
        db.diagrams
            .record(scope)?
            .with_context(|| format!("Unknown scope '{}' (see 'cst status')", scope))?;
    }

    let latest = db.snapshots.latest()?.unwrap_or_else(Snapshot::empty);
    let scopes = scopes_for(&config, &workspace, &latest)?;
    let report = export_diagrams(&db, &output_dir, scopes.root(), scope)?;

    util::print_header("Export Complete");
    println!("Output:        {}", output_dir.display().to_string().cyan());
    println!("Written:       {}", report.written.len().to_string().green());
    println!("Unchanged:     {}", report.unchanged);
    for path in &report.written {
        let shown = path.strip_prefix(&output_dir).unwrap_or(path);
        println!("  + {}", shown.display());
    }
    if !report.unavailable.is_empty() {
        println!();
        println!(
            "{} {}",
            "No clean diagram yet:".yellow(),
            report.unavailable.join(", ")
        );
    }
    Ok(())
}
