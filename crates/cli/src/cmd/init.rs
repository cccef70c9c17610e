//! Initialize Constellation in a project

use crate::util;
use anyhow::Result;
use constellation_core::store::STATE_DIR;
use constellation_core::Workspace;
use constellation_sync::{BackendKind, Config};
use owo_colors::OwoColorize;
use std::path::Path;

pub async fn run(root: Option<&Path>, backend: Option<BackendKind>) -> Result<()> {
    let root = util::start_dir(root)?;
    let existed = root.join(STATE_DIR).is_dir();
    let workspace = Workspace::init(&root)?;
    let config_path = workspace.config_path();

    if existed && config_path.exists() {
        println!(
            "Constellation already initialized at {}",
            workspace.state_dir().display().to_string().cyan()
        );
        if backend.is_some() {
            println!(
                "{}",
                "Existing config.toml left unchanged; edit [backend] to switch backends".dimmed()
            );
        }
        return Ok(());
    }

    let mut config = Config::default();
    if let Some(kind) = backend {
        config.backend.kind = kind;
    }
    config.save(&config_path, &workspace.tmp_dir())?;

    println!(
        "Initialized Constellation project {} at {}",
        workspace.project_name().bold(),
        workspace.root().display().to_string().cyan()
    );
    println!();
    println!("Created {}/ directory structure:", STATE_DIR);
    println!("  - {}/config.toml   (project configuration)", STATE_DIR);
    println!("  - {}/locks/        (scan exclusivity)", STATE_DIR);
    println!("  - {}/logs/         (cst.log)", STATE_DIR);
    println!("  - {}/tmp/          (atomic write staging)", STATE_DIR);
    println!();
    println!("Backend: {}", format!("{:?}", config.backend.kind).to_lowercase().yellow());
    if config.backend.kind == BackendKind::Gemini {
        println!(
            "  {}",
            format!("Set {} before running a scan", config.backend.api_key_env).dimmed()
        );
    }
    println!();
    println!("Next steps:");
    println!("  - Run 'cst scan' to generate diagrams");
    println!("  - Run 'cst config --example' to see every option");

    Ok(())
}
