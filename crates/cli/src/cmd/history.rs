//! List a scope's diagram versions

use crate::diff_utils;
use crate::util;
use anyhow::{Context, Result};
use constellation_journal::StateDb;
use owo_colors::OwoColorize;
use std::path::Path;

pub async fn run(root: Option<&Path>, scope: &str, patch: bool, context: usize) -> Result<()> {
    let workspace = util::open_workspace(root)?;
    let db = StateDb::open(&workspace.db_path())
        .context("Failed to open state database (is a scan running?)")?;

    let record = db
        .diagrams
        .record(scope)?
        .with_context(|| format!("Unknown scope '{}' (see 'cst status')", scope))?;
    let versions = db.diagrams.history(scope)?;

    util::print_header(&format!("History of '{}'", scope));

    if versions.is_empty() {
        println!("{}", "No versions committed yet".dimmed());
        return Ok(());
    }

    // Newest first, each compared against its predecessor
    for (idx, artifact) in versions.iter().enumerate().rev() {
        let previous = idx.checked_sub(1).map(|i| &versions[i]);
        let current = if record.clean_version == Some(artifact.version) {
            format!(" {}", "(current)".green())
        } else {
            String::new()
        };

        let changes = match previous {
            Some(prev) => {
                let (inserted, deleted) = diff_utils::line_stats(&prev.markup, &artifact.markup);
                format!("{} {}", format!("+{}", inserted).green(), format!("-{}", deleted).red())
            }
            None => "initial".dimmed().to_string(),
        };

        println!(
            "{} {} {}  {} files  {}{}",
            format!("v{:<3}", artifact.version).yellow(),
            util::format_relative_time(artifact.created_at_ms),
            format!("({})", util::format_absolute_time(artifact.created_at_ms)).dimmed(),
            artifact.lineage.len(),
            changes,
            current
        );
        println!("     {}", format!("cycle {}", artifact.produced_by).dimmed());

        if patch {
            if let Some(prev) = previous {
                let diff = diff_utils::generate_unified_diff(&prev.markup, &artifact.markup, context);
                if diff.is_empty() {
                    println!("    {}", "(markup identical)".dimmed());
                } else {
                    print!("{}", diff);
                }
            }
            println!();
        }
    }

    Ok(())
}
