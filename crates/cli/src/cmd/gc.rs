//! Run garbage collection

use crate::locks::SyncLock;
use crate::util;
use anyhow::{Context, Result};
use constellation_journal::{GarbageCollector, StateDb, MIN_KEEP_SNAPSHOTS};
use owo_colors::OwoColorize;
use std::path::Path;

pub async fn run(root: Option<&Path>, keep: Option<usize>) -> Result<()> {
    let (workspace, config) = util::open_project(root)?;
    let _lock = SyncLock::acquire(&workspace.locks_dir(), "gc")?;
    let db = StateDb::open(&workspace.db_path()).context("Failed to open state database")?;

    let mut policy = config.retention.clone();
    if let Some(keep) = keep {
        if keep < MIN_KEEP_SNAPSHOTS {
            anyhow::bail!("--keep must be at least {}, got {}", MIN_KEEP_SNAPSHOTS, keep);
        }
        policy.keep_snapshots = keep;
    }

    println!("{}", "Running Garbage Collection...".bold());
    println!();

    let size_before = db.size_on_disk()?;
    let report = GarbageCollector::new(policy).collect(&db)?;
    let size_after = db.size_on_disk()?;

    println!("{}", "GC Complete".green().bold());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();

    if report.snapshots_pruned.is_empty() && report.summaries_removed == 0 {
        println!("{}", "No garbage found - state is already compact".dimmed());
    } else {
        println!("Snapshots pruned:   {}", report.snapshots_pruned.len().to_string().yellow());
        println!("Summaries removed:  {}", report.summaries_removed.to_string().yellow());
    }
    println!("Snapshots kept:     {}", report.snapshots_kept);
    println!(
        "Database size:      {} -> {}",
        util::format_size(size_before),
        util::format_size(size_after).green()
    );

    Ok(())
}
