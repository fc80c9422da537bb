//! # Sift CLI (`sift`)
//!
//! ## Usage
//!
//! ```bash
//! sift --config ./config/sift.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sift init` | Create the SQLite database and run schema migrations |
//! | `sift sync-sources` | Copy configured sources, channels and rules into the database |
//! | `sift connectors` | List the available connector types |
//! | `sift fetch` | Fetch every due channel once |
//! | `sift classify` | Drain the classifier backlog |
//! | `sift analyze` | Drain the deep analysis queue |
//! | `sift status` | Print queue depths and channel errors |
//! | `sift run` | Run everything, plus the status server, until ctrl-c |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use sift::{app, config, migrate};

/// Sift: feed ingestion with deduplication and two-stage classification.
#[derive(Parser)]
#[command(name = "sift", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/sift.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Copy sources, channels and rules from the config file into the database.
    ///
    /// Channels failing connector validation are reported but still stored.
    SyncSources,

    /// List available connector types.
    Connectors,

    /// Fetch every due channel once and run the pipeline on the results.
    Fetch,

    /// Work through the classify, duplicate-check and index backlogs until empty.
    Classify,

    /// Run deep analysis on pending items until none remain.
    ///
    /// Wakes the inference host first when power management is enabled.
    Analyze,

    /// Print queue depths and channel health.
    Status,

    /// Run the scheduler, both workers and the status server until interrupted.
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    // RUST_LOG wins over the config file.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sift={}", cfg.logging.level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => {
            migrate::run_migrations_for(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::SyncSources => app::run_sync_sources(cfg).await?,
        Commands::Connectors => app::run_connectors()?,
        Commands::Fetch => app::run_fetch(cfg).await?,
        Commands::Classify => app::run_classify(cfg).await?,
        Commands::Analyze => app::run_analyze(cfg).await?,
        Commands::Status => app::run_status(cfg).await?,
        Commands::Run => app::run_all(cfg).await?,
    }

    Ok(())
}
