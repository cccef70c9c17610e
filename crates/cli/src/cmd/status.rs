//! Show scope statuses and storage statistics

use crate::util;
use anyhow::{Context, Result};
use constellation_journal::StateDb;
use constellation_sync::BackendKind;
use owo_colors::OwoColorize;
use std::path::Path;

pub async fn run(root: Option<&Path>) -> Result<()> {
    let (workspace, config) = util::open_project(root)?;
    let db = StateDb::open(&workspace.db_path())
        .context("Failed to open state database (is a scan running?)")?;

    let latest = db.snapshots.latest()?;
    let records = db.diagrams.records()?;
    let (live, obsolete): (Vec<_>, Vec<_>) = records.into_iter().partition(|r| !r.obsolete);

    util::print_header("Project Status");

    println!(
        "Project:       {} ({})",
        workspace.project_name().bold(),
        workspace.root().display().to_string().cyan()
    );
    match config.backend.kind {
        BackendKind::Mock => println!("Backend:       mock"),
        BackendKind::Gemini => println!("Backend:       gemini ({})", config.backend.model),
    }
    println!();

    println!("Last scan:");
    if let Some(snapshot) = &latest {
        println!("  Snapshot:    seq {} ({})", snapshot.seq(), snapshot.reference());
        println!(
            "  Time:        {} ({})",
            util::format_relative_time(snapshot.captured_at_ms()),
            util::format_absolute_time(snapshot.captured_at_ms()).dimmed()
        );
        println!(
            "  Tracked:     {} files, {} directories",
            snapshot.files().count(),
            snapshot.directories().count()
        );
    } else {
        println!("  {}", "Never scanned".dimmed());
    }
    println!();

    println!("Scopes:");
    if live.is_empty() {
        println!("  {}", "No scopes yet".dimmed());
    } else {
        let width = live.iter().map(|r| r.scope_id.len()).max().unwrap_or(0);
        for record in &live {
            let version = match record.clean_version {
                Some(clean) => format!("v{}", clean),
                None => "-".to_string(),
            };
            println!(
                "  {} {:<width$}  {:<5} {}",
                util::status_label(record.status),
                record.scope_id,
                version,
                util::format_relative_time(record.updated_at_ms).dimmed(),
                width = width
            );
            if let Some(error) = &record.last_error {
                println!("      {}", error.red());
            }
        }
    }
    if !obsolete.is_empty() {
        println!("  {}", format!("{} obsolete scope(s) with retained history", obsolete.len()).dimmed());
    }
    println!();

    println!("Storage:");
    println!("  Snapshots:   {} retained", db.snapshots.count());
    println!("  Summaries:   {} cached", db.analysis.len());
    println!("  Total size:  {}", util::format_size(db.size_on_disk()?));
    println!();

    if latest.is_none() {
        println!("{}", "Tip: Run 'cst scan' to generate the first diagrams".dimmed());
    } else if live.iter().any(|r| r.status != constellation_core::ArtifactStatus::Clean) {
        println!("{}", "Tip: Run 'cst scan' to refresh stale or failed scopes".dimmed());
    }

    Ok(())
}
