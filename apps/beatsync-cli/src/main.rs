//! beatsync command line client.

mod app;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "beatsync", version)]
#[command(about = "Resumable, chunked sync of osu! beatmap archives")]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Upload every file under a directory
    Upload {
        dir: PathBuf,
        /// Remote namespace (overrides the configured one)
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Download the beatmap sets named in a beatmap list
    Download {
        /// Text (`<onlineId> <name>` per line) or JSON beatmap list
        list: PathBuf,
        /// Directory the archives are written to
        dest: PathBuf,
        /// Fetch from the sync server's file tree instead of the mirror
        #[arg(long)]
        files: bool,
    },
    /// Run a JSON manifest
    Sync {
        manifest: PathBuf,
        /// Local root for the manifest's relative paths (defaults to the
        /// manifest's directory)
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Write the beatmap list of an osu! Songs directory
    Export {
        songs_dir: PathBuf,
        /// Output file; `.json` selects the JSON format
        out: PathBuf,
    },
    /// Show persisted transfers
    Status,
    /// Drop the persisted state of one transfer
    Discard {
        file_id: String,
        /// Destination as shown by `status`
        dest: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = config::CliConfig::load(cli.config.as_deref())?;
    tracing::debug!(state_dir = %config.state_dir.display(), "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(cli.command, config))
}
