//! Print the effective or example configuration
//!
//! Output is valid TOML: location and ranges are emitted as comments so the
//! result can be redirected straight into `config.toml`.

use crate::util;
use anyhow::Result;
use constellation_sync::example_config;
use std::path::Path;

pub async fn run(root: Option<&Path>, example: bool) -> Result<()> {
    if example {
        print!("{}", example_config());
        return Ok(());
    }

    let (workspace, config) = util::open_project(root)?;
    let path = workspace.config_path();

    if path.exists() {
        println!("# Location: {}", path.display());
    } else {
        println!("# Location: {} (missing, showing defaults)", path.display());
    }
    println!("#");
    println!("# Valid ranges:");
    println!("#   sync.concurrency: 1-64");
    println!("#   sync.max_attempts: 1-10");
    println!("#   sync.timeout_secs: 1-600");
    println!("#   sync.base_delay_ms <= sync.max_delay_ms");
    println!("#   retention.keep_snapshots: >= 2");
    println!("#   backend.temperature: 0.0-2.0");
    println!();
    print!("{}", config.to_toml()?);
    Ok(())
}
