//! # biblioport CLI
//!
//! Commands for migrating a legacy Papers2 library into a Zotero cloud
//! library. All commands accept a `--config` flag pointing to a TOML
//! configuration file; see `config/biblioport.example.toml` for a full
//! example.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `biblioport run` | Run the migration (resumable via the checkpoint) |
//! | `biblioport status` | Show checkpoint and source-library counts |
//! | `biblioport collections` | List the source library's collections |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use biblioport::{config, logging, run, stats};

/// Migrate a Papers2 reference library into a Zotero cloud library.
#[derive(Parser)]
#[command(
    name = "biblioport",
    about = "Migrate a Papers2 reference library into a Zotero cloud library",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/biblioport.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the migration.
    ///
    /// Streams matching source records, converts each to a target item,
    /// and submits them in batches. Progress is tracked in the checkpoint
    /// file, so an interrupted run resumes exactly where it stopped.
    Run {
        /// Print the payloads instead of sending them. An optional file
        /// path redirects the output from stdout.
        #[arg(long, num_args = 0..=1)]
        dry_run: Option<Option<PathBuf>>,

        /// Re-attempt records that failed in earlier runs.
        #[arg(long)]
        retry: bool,

        /// Maximum number of records to enqueue this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Restrict to these source record ids.
        #[arg(long, value_delimiter = ',')]
        ids: Option<Vec<i64>>,

        /// Restrict to records whose author list contains this substring.
        #[arg(long)]
        author: Option<String>,

        /// Override the configured batch size.
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Show checkpoint and source-library counts.
    Status,

    /// List the source library's collections.
    Collections,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            dry_run,
            retry,
            limit,
            ids,
            author,
            batch_size,
        } => {
            // Dry runs skip the persistent error log.
            let error_file = if dry_run.is_some() {
                None
            } else {
                Some(cfg.logging.error_file.clone())
            };
            let _guard = logging::init(&cfg.logging.level, error_file.as_deref())?;

            run::run_migration(
                &cfg,
                run::RunArgs {
                    dry_run,
                    retry,
                    limit,
                    ids,
                    author,
                    batch_size,
                },
            )
            .await?;
        }
        Commands::Status => {
            let _guard = logging::init(&cfg.logging.level, None)?;
            stats::run_status(&cfg).await?;
        }
        Commands::Collections => {
            let _guard = logging::init(&cfg.logging.level, None)?;
            stats::run_collections(&cfg).await?;
        }
    }

    Ok(())
}
