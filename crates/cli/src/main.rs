//! Constellation CLI - cst command

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use constellation_sync::BackendKind;
use owo_colors::OwoColorize;
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;
mod diff_utils;
mod locks;
mod logging;
mod util;

/// Constellation - architecture diagrams that keep up with your code
#[derive(Parser)]
#[command(name = "cst")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Project root (default: nearest directory holding .constellation/)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize Constellation in the current directory
    Init {
        /// Generation backend to configure
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,
    },
    /// Run one synchronization cycle
    Scan {
        /// Take changes from git since this revision instead of diffing snapshots
        #[arg(long)]
        since: Option<String>,
    },
    /// Show scope statuses and storage statistics
    Status,
    /// Print a scope's diagram markup
    Show {
        /// Scope id
        scope: String,
        /// Specific version (default: latest clean version)
        #[arg(long)]
        version: Option<u64>,
    },
    /// List a scope's diagram versions
    History {
        /// Scope id
        scope: String,
        /// Show line diffs between versions
        #[arg(short = 'p', long)]
        patch: bool,
        /// Number of context lines (default: 3)
        #[arg(short = 'U', long, default_value = "3")]
        context: usize,
    },
    /// Re-publish an older diagram version as the current one
    Rollback {
        /// Scope id
        scope: String,
        /// Version to restore
        version: u64,
    },
    /// Write clean diagrams to a mirrored directory tree
    Export {
        /// Export only this scope
        #[arg(long)]
        scope: Option<String>,
        /// Output directory (default: [export] output_dir)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Prune old snapshots and unreferenced summaries
    Gc {
        /// Snapshots to keep (default: [retention] keep_snapshots)
        #[arg(long)]
        keep: Option<usize>,
    },
    /// Print the effective configuration
    Config {
        /// Print an annotated example instead
        #[arg(long)]
        example: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Mock,
    Gemini,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Mock => BackendKind::Mock,
            BackendArg::Gemini => BackendKind::Gemini,
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let root = cli.root.as_deref();
    match cli.command {
        Commands::Init { backend } => cmd::init::run(root, backend.map(Into::into)).await?,
        Commands::Scan { since } => return cmd::scan::run(root, since).await,
        Commands::Status => cmd::status::run(root).await?,
        Commands::Show { scope, version } => cmd::show::run(root, &scope, version).await?,
        Commands::History { scope, patch, context } => {
            cmd::history::run(root, &scope, patch, context).await?
        }
        Commands::Rollback { scope, version } => cmd::rollback::run(root, &scope, version).await?,
        Commands::Export { scope, output } => cmd::export::run(root, scope.as_deref(), output).await?,
        Commands::Gc { keep } => cmd::gc::run(root, keep).await?,
        Commands::Config { example } => cmd::config::run(root, example).await?,
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_dir = util::open_workspace(cli.root.as_deref())
        .ok()
        .map(|workspace| workspace.logs_dir())
        .filter(|dir| dir.is_dir());
    let _guard = logging::init(cli.verbose, log_dir.as_deref());

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::from(2)
        }
    }
}
