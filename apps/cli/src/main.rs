//! Grabbit CLI - Command-line front end for the Grabbit download engine
//!
//! Runs the engine in-process: downloads are queued, rendered as progress
//! bars and summarized when every task reaches a terminal status.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use grabbit_core::config;
use grabbit_types::Settings;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Grabbit - concurrent downloads with duplicate detection
#[derive(Parser)]
#[command(name = "grabbit")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Storage directory for downloaded files
    #[arg(long, global = true, env = "GRABBIT_DIR")]
    dir: Option<PathBuf>,

    /// Settings file (JSON)
    #[arg(long, global = true, env = "GRABBIT_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "human")]
    output: OutputFormat,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one or more URLs
    Get {
        /// URLs to download
        #[arg(required = true)]
        urls: Vec<String>,

        /// Public alias for the stored file (single URL only)
        #[arg(short, long)]
        alias: Option<String>,

        /// Maximum concurrent downloads
        #[arg(short, long)]
        jobs: Option<u32>,
    },

    /// List stored files
    Ls,

    /// Rename a stored file
    Mv {
        /// Current name or alias
        from: String,

        /// New name
        to: String,
    },

    /// Delete a stored file
    Rm {
        /// Name or alias
        name: String,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Commands::Completions { shell } = cli.command {
        use clap::CommandFactory;
        clap_complete::generate(shell, &mut Cli::command(), "grabbit", &mut std::io::stdout());
        return Ok(());
    }

    let mut settings = load_settings(cli.config.clone()).await?;
    if let Some(dir) = cli.dir.clone() {
        settings.storage_dir = dir;
    }
    if let Commands::Get { jobs: Some(jobs), .. } = &cli.command {
        settings.max_concurrent_downloads = *jobs;
    }
    tracing::debug!(?settings, "Resolved settings");

    // Initialize core
    let core = grabbit_core::GrabbitCore::new(settings).await?;

    match cli.command {
        Commands::Get { urls, alias, .. } => {
            commands::get_downloads(&core, urls, alias, cli.output).await?
        }

        Commands::Ls => commands::list_files(&core, cli.output).await?,

        Commands::Mv { from, to } => commands::rename_file(&core, &from, &to, cli.output).await?,

        Commands::Rm { name } => commands::remove_file(&core, &name, cli.output).await?,

        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Logs go to stderr so they never tear progress bars on stdout
fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "grabbit=debug,grabbit_core=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Explicit path, else `<config dir>/grabbit/config.json`, else defaults
async fn load_settings(path: Option<PathBuf>) -> Result<Settings> {
    let path = path.or_else(|| dirs::config_dir().map(|d| d.join("grabbit").join("config.json")));
    match path {
        Some(path) => Ok(config::load_settings(&path).await?),
        None => Ok(Settings::default()),
    }
}
