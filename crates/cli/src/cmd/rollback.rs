//! Re-publish an older diagram version

use crate::locks::SyncLock;
use crate::util;
use anyhow::{Context, Result};
use constellation_journal::StateDb;
use owo_colors::OwoColorize;
use std::path::Path;
use ulid::Ulid;

pub async fn run(root: Option<&Path>, scope: &str, version: u64) -> Result<()> {
    let workspace = util::open_workspace(root)?;
    let _lock = SyncLock::acquire(&workspace.locks_dir(), "rollback")?;
    let db = StateDb::open(&workspace.db_path()).context("Failed to open state database")?;

    db.diagrams
        .record(scope)?
        .with_context(|| format!("Unknown scope '{}' (see 'cst status')", scope))?;

    let artifact = db.diagrams.rollback(scope, version, Ulid::new())?;
    db.flush()?;

    println!(
        "Rolled back {} to {} (published as {})",
        scope.bold(),
        format!("v{}", version).yellow(),
        format!("v{}", artifact.version).green()
    );
    println!("{}", "Run 'cst export' to refresh exported files".dimmed());
    Ok(())
}
