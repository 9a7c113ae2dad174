//! tallyset CLI: the user-facing command-line interface.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "tallyset",
    version,
    about = "Reconcile assessment submissions and track completion"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch submissions and rebuild the validation cache
    Sync {
        /// Refetch submissions even when a valid snapshot is cached
        #[arg(long)]
        force: bool,

        /// Limit to these test-taker ids (repeatable)
        #[arg(long = "id")]
        ids: Vec<String>,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Show completion from the cached validation mapping
    Status {
        /// Limit to these test-taker ids (repeatable)
        #[arg(long = "id")]
        ids: Vec<String>,

        /// Print entries as JSON instead of a table
        #[arg(long)]
        json: bool,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// List secondary-source data with no primary-source submission
    Orphans {
        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Delete cached submissions and validation results
    ClearCache {
        /// Only drop the validation mapping, keep the submission snapshot
        #[arg(long)]
        validation_only: bool,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// List one test-taker's JotForm submissions
    Lookup {
        /// Test-taker id, with or without the identity prefix
        id: String,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Refresh the JotForm question map (field name to question id)
    Questions {
        /// Output path (defaults to files.question_map)
        #[arg(long)]
        out: Option<PathBuf>,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Validate the catalogue, field map and roster files
    Check {
        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tallyset=info".parse().expect("static directive")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Sync { force, ids, config } => commands::sync::execute(force, ids, config).await,
        Commands::Status { ids, json, config } => commands::status::execute(ids, json, config).await,
        Commands::Orphans { config } => commands::orphans::execute(config).await,
        Commands::ClearCache {
            validation_only,
            config,
        } => commands::clear_cache::execute(validation_only, config).await,
        Commands::Lookup { id, config } => commands::lookup::execute(id, config).await,
        Commands::Questions { out, config } => commands::questions::execute(out, config).await,
        Commands::Check { config } => commands::check::execute(config),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}
