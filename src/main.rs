//! # lockwatch CLI
//!
//! The `lockwatch` binary initializes the database, classifies single images
//! from disk, prints stored statistics, and runs the HTTP server that
//! receives uploads and chat callbacks.
//!
//! ## Usage
//!
//! ```bash
//! lockwatch --config ./config/lockwatch.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lockwatch init` | Create the SQLite database and run schema migrations |
//! | `lockwatch serve` | Start the HTTP server |
//! | `lockwatch detect <path>` | Classify one image and store the result |
//! | `lockwatch stats` | Print aggregate detection statistics |
//! | `lockwatch history` | List stored detections, newest first |
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use lockwatch::{config, detect_cmd, migrate, server, stats};

/// lockwatch: padlock state detection for chat-driven site checks.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/lockwatch.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "lockwatch",
    about = "lockwatch: detect unlocked padlocks in photos and report them to chat",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/lockwatch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the detection tables. Running
    /// it again is safe.
    Init,

    /// Start the HTTP server (uploads, chat webhook, history).
    Serve,

    /// Classify one image file.
    Detect {
        /// Path to a JPEG or PNG image.
        path: PathBuf,

        /// User id recorded with the stored detection.
        #[arg(long)]
        user_id: Option<String>,

        /// Classify and print without writing to the database.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show detection statistics.
    Stats,

    /// List stored detections, newest first.
    History {
        #[arg(long, default_value = "20")]
        limit: i64,

        #[arg(long, default_value = "0")]
        offset: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Detect {
            path,
            user_id,
            dry_run,
        } => {
            detect_cmd::run_detect(&cfg, &path, user_id, dry_run).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::History { limit, offset } => {
            stats::run_history(&cfg, limit, offset).await?;
        }
    }

    Ok(())
}
