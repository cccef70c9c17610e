//! Print a scope's diagram markup

use crate::util;
use anyhow::{Context, Result};
use constellation_core::ArtifactStatus;
use constellation_journal::StateDb;
use owo_colors::OwoColorize;
use std::path::Path;

/// Markup goes to stdout untouched; notes go to stderr
pub async fn run(root: Option<&Path>, scope: &str, version: Option<u64>) -> Result<()> {
    let workspace = util::open_workspace(root)?;
    let db = StateDb::open(&workspace.db_path())
        .context("Failed to open state database (is a scan running?)")?;

    let record = db
        .diagrams
        .record(scope)?
        .with_context(|| format!("Unknown scope '{}' (see 'cst status')", scope))?;

    let artifact = match version {
        Some(version) => db
            .diagrams
            .version(scope, version)?
            .with_context(|| format!("Scope '{}' has no version {}", scope, version))?,
        None => db.diagrams.read(scope)?,
    };

    if version.is_none() && record.status != ArtifactStatus::Clean {
        eprintln!(
            "{}",
            format!(
                "note: scope is {}; showing last clean version v{}",
                record.status, artifact.version
            )
            .yellow()
        );
    }
    if record.obsolete {
        eprintln!("{}", "note: scope is obsolete".yellow());
    }

    print!("{}", artifact.markup);
    Ok(())
}
