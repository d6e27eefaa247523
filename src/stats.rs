//! Checkpoint and source-library overview.
//!
//! `biblioport status` gives a quick summary of migration progress: how
//! many records the checkpoint has committed as imported or failed, and
//! how many matching records the source library holds in total.

use anyhow::Result;

use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::source::{Papers2, RecordFilter};

pub async fn run_status(config: &Config) -> Result<()> {
    let checkpoint = Checkpoint::load(&config.checkpoint.path)?;

    let source = Papers2::open(&config.source.folder, config.source.mine_reviews_only).await?;
    let filter = RecordFilter {
        include_deleted: config.source.include_deleted,
        include_duplicates: config.source.include_duplicates,
        include_manuscripts: config.source.include_manuscripts,
        ..Default::default()
    };
    let total = source.count(&filter).await?;

    println!("biblioport — Migration Status");
    println!("=============================");
    println!();
    println!("  Checkpoint:  {}", config.checkpoint.path.display());
    println!("  Source:      {}", config.source.folder.display());
    println!();
    println!("  Records in source:  {}", total);
    println!("  Imported:           {}", checkpoint.imported_count());
    println!("  Failed:             {}", checkpoint.failed_count());

    if checkpoint.failed_count() > 0 {
        let ids: Vec<String> = checkpoint.failed_ids().map(|id| id.to_string()).collect();
        println!();
        println!("  Failed ids: {}", ids.join(", "));
        println!("  Re-run with --retry to attempt them again.");
    }
    println!();

    source.close().await;
    Ok(())
}

/// List the source library's collections, as candidates for the
/// `import.collections` selection.
pub async fn run_collections(config: &Config) -> Result<()> {
    let source = Papers2::open(&config.source.folder, config.source.mine_reviews_only).await?;
    let collections = source.collections().await?;

    if collections.is_empty() {
        println!("No collections in the source library.");
    } else {
        println!("Source collections:");
        for name in &collections {
            println!("  {}", name);
        }
    }

    source.close().await;
    Ok(())
}
