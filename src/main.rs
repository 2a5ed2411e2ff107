mod commands;
mod render;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use datebook_core::StoreConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "datebook")]
#[command(about = "Inspect the month window and the components a datebook store shows in it")]
struct Cli {
    /// Read this config file instead of ~/.config/datebook/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the month range, the week-aligned data range and the week count
    Window {
        /// Month to compute (YYYY-M); defaults to the last viewed month
        #[arg(long)]
        month: Option<String>,

        /// First day of the week (e.g. "monday", "sun")
        #[arg(long)]
        week_start: Option<String>,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Load a fixture file and list everything the store shows for a month
    Agenda {
        /// JSON file with sources and their components
        #[arg(long)]
        fixture: PathBuf,

        /// Month to show (YYYY-M); defaults to the last viewed month
        #[arg(long)]
        month: Option<String>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("DATEBOOK_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => StoreConfig::load_from(path)?,
        None => StoreConfig::load()?,
    };

    match cli.command {
        Commands::Window {
            month,
            week_start,
            json,
        } => commands::window::run(config, month.as_deref(), week_start.as_deref(), json).await,
        Commands::Agenda { fixture, month } => {
            commands::agenda::run(config, &fixture, month.as_deref()).await
        }
    }
}
