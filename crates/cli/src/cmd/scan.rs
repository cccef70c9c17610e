//! Run one synchronization cycle

use crate::locks::SyncLock;
use crate::util;
use anyhow::Result;
use constellation_sync::{create_backend, CycleOptions, CycleReport, Engine, UpdateResult};
use owo_colors::OwoColorize;
use std::path::Path;
use std::process::ExitCode;
use tokio::sync::watch;

pub async fn run(root: Option<&Path>, since: Option<String>) -> Result<ExitCode> {
    let (workspace, config) = util::open_project(root)?;
    let _lock = SyncLock::acquire(&workspace.locks_dir(), "scan")?;
    let backend = create_backend(&config.backend)?;
    let engine = Engine::open(workspace, config, backend)?;

    // Ctrl-C stops queued updates and abandons in-flight ones
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "Interrupted; stopping in-flight updates...".yellow());
            let _ = shutdown_tx.send(true);
        }
    });

    let spinner = util::spinner(format!(
        "Synchronizing diagrams for {}",
        engine.workspace().project_name()
    ));
    let result = engine.run_cycle(&CycleOptions { since }, shutdown_rx).await;
    spinner.finish_and_clear();
    signal_task.abort();

    let report = result?;
    print_report(&report);
    Ok(ExitCode::from(report.exit_code() as u8))
}

fn print_report(report: &CycleReport) {
    let title = if report.cancelled {
        "Sync Interrupted".yellow().bold().to_string()
    } else if report.all_clean() {
        "Sync Complete".green().bold().to_string()
    } else {
        "Sync Finished With Failures".red().bold().to_string()
    };
    util::print_header(&title);

    let base = report
        .base_seq
        .map(|seq| format!("seq {}", seq))
        .unwrap_or_else(|| "none".to_string());
    println!("Snapshot:      seq {} ({}), base {}", report.head_seq, report.head, base);
    if report.changes == 0 {
        println!("Changes:       {}", "none".dimmed());
    } else {
        println!("Changes:       {} paths", report.changes);
    }
    println!("Affected:      {} scopes", report.affected.len());
    println!(
        "Cache:         {} hits, {} misses",
        report.cache.hits, report.cache.misses
    );
    println!("Elapsed:       {}", util::format_elapsed(report.elapsed_ms));
    println!();

    if report.statuses.is_empty() {
        println!("{}", "No scopes (the tree has no tracked files)".dimmed());
    } else {
        println!("Scopes:");
        let width = report.statuses.iter().map(|(id, _)| id.len()).max().unwrap_or(0);
        for (scope_id, status) in &report.statuses {
            let outcome = report.outcomes.iter().find(|o| &o.scope_id == scope_id);
            let detail = match outcome.map(|o| (&o.result, o.elapsed_ms)) {
                Some((UpdateResult::Updated { version }, ms)) => {
                    format!("v{} updated in {}", version, util::format_elapsed(ms))
                }
                Some((UpdateResult::Failed { error }, _)) => error.red().to_string(),
                Some((UpdateResult::Cancelled, _)) => "cancelled".yellow().to_string(),
                Some((UpdateResult::Skipped, _)) => "skipped (update already running)".dimmed().to_string(),
                None => "unchanged".dimmed().to_string(),
            };
            println!(
                "  {} {:<width$}  {}",
                util::status_label(*status),
                scope_id,
                detail,
                width = width
            );
        }
    }

    if !report.obsoleted.is_empty() {
        println!();
        println!(
            "Retired:       {} {}",
            report.obsoleted.join(", ").yellow(),
            "(history kept)".dimmed()
        );
    }

    if let Some(pruned) = report.retention.as_ref().filter(|r| !r.snapshots_pruned.is_empty()) {
        println!(
            "Pruned:        {} snapshots, {} summaries",
            pruned.snapshots_pruned.len(),
            pruned.summaries_removed
        );
    }

    if let Some(export) = &report.export {
        println!();
        println!(
            "Exported:      {} written, {} unchanged",
            export.written.len(),
            export.unchanged
        );
    }

    let failed = report.failed();
    if !failed.is_empty() {
        println!();
        println!(
            "{}",
            format!(
                "{} scope(s) failed and still serve their last clean diagram. Re-run 'cst scan' to retry.",
                failed.len()
            )
            .dimmed()
        );
    }
}
