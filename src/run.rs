//! Top-level migration loop.
//!
//! Wires the source reader, checkpoint, remote client, relocator, and
//! orchestrator together, then drives the record stream. One malformed
//! record never aborts the run: per-record errors are logged with the
//! record id and processing continues. The run does halt when the
//! infrastructure is unusable — rejected credentials or a checkpoint
//! that cannot be persisted — since every later batch would fail the
//! same way.

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::checkpoint::{Checkpoint, PersistFailure};
use crate::config::{Config, ImportConfig, RelocatorBackend};
use crate::dryrun::DryRunSink;
use crate::extract::KeywordKindFilter;
use crate::importer::{Importer, ImporterOptions};
use crate::kinds::Label;
use crate::relocate::{DriveRelocator, LocalRelocator, Relocator};
use crate::source::{Papers2, RecordFilter};
use crate::zotero::{AuthFailure, RemoteLibrary, ZoteroClient};

/// Per-invocation overrides from the command line.
#[derive(Debug, Default)]
pub struct RunArgs {
    /// `Some(None)` writes to stdout, `Some(Some(path))` to a file.
    pub dry_run: Option<Option<PathBuf>>,
    pub retry: bool,
    pub limit: Option<usize>,
    pub ids: Option<Vec<i64>>,
    pub author: Option<String>,
    pub batch_size: Option<usize>,
}

pub async fn run_migration(config: &Config, args: RunArgs) -> Result<()> {
    let dry = args.dry_run.is_some();

    let source = Papers2::open(&config.source.folder, config.source.mine_reviews_only).await?;

    let filter = RecordFilter {
        ids: args.ids.clone(),
        author: args.author.clone(),
        kinds: None,
        include_deleted: config.source.include_deleted,
        include_duplicates: config.source.include_duplicates,
        include_manuscripts: config.source.include_manuscripts,
    };
    let ids = source.record_ids(&filter).await?;
    info!(matching = ids.len(), "source records selected");

    // Dry runs leave the checkpoint untouched.
    let checkpoint = if dry {
        None
    } else {
        let cp = Checkpoint::load(&config.checkpoint.path)?;
        info!(
            imported = cp.imported_count(),
            failed = cp.failed_count(),
            "checkpoint loaded"
        );
        Some(cp)
    };

    let dry_sink = match &args.dry_run {
        Some(path) => Some(DryRunSink::open(path.as_deref())?),
        None => None,
    };

    let selection: Vec<String> = if config.import.no_collections {
        Vec::new()
    } else {
        match &config.import.collections {
            Some(names) => names.clone(),
            None => source.collections().await?,
        }
    };

    let remote: Box<dyn RemoteLibrary> = Box::new(ZoteroClient::new(&config.library)?);

    let relocator: Option<Box<dyn Relocator>> = match (&config.linked_attachments, dry) {
        (Some(linked), false) => Some(match linked.backend {
            RelocatorBackend::Local => Box::new(LocalRelocator::new(linked.local_mode)),
            RelocatorBackend::Drive => Box::new(DriveRelocator::connect(&linked.drive_auth).await?),
        }),
        _ => None,
    };

    let keyword_kinds = KeywordKindFilter {
        user: config.import.keyword_kinds.iter().any(|k| k == "user"),
        auto: config.import.keyword_kinds.iter().any(|k| k == "auto"),
        label: config.import.keyword_kinds.iter().any(|k| k == "label"),
    };

    let mut importer = Importer::new(
        remote,
        relocator,
        checkpoint,
        dry_sink,
        ImporterOptions {
            batch_size: args.batch_size.unwrap_or(config.import.batch_size),
            policy: config.import.attachments,
            retry_failed: args.retry,
            keyword_kinds,
            label_map: build_label_map(&config.import),
            collections: selection,
            linked: config.linked_attachments.clone(),
            source_folder: source.folder().to_path_buf(),
        },
    )
    .await?;

    let mut added = 0usize;
    for id in &ids {
        if let Some(limit) = args.limit {
            if added >= limit {
                warn!(limit, "record limit reached, stopping");
                break;
            }
        }

        let result = match source.record(*id).await {
            Ok(record) => importer.add_record(&record).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(true) => added += 1,
            Ok(false) => {}
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                error!(record = *id, "record conversion failed: {:#}", e);
            }
        }
    }

    match importer.close().await {
        Ok(()) => {}
        Err(e) if is_fatal(&e) => return Err(e),
        Err(e) => error!("final batch flush failed: {:#}", e),
    }

    if let Some(cp) = importer.checkpoint() {
        info!(
            imported = cp.imported_count(),
            failed = cp.failed_count(),
            "run finished"
        );
    }
    println!("processed {} of {} matching records", added, ids.len());

    source.close().await;
    Ok(())
}

/// Unusable infrastructure: rejected credentials or a checkpoint that
/// could not be persisted. Continuing would fail every subsequent batch
/// or lose the resume point.
fn is_fatal(err: &anyhow::Error) -> bool {
    err.downcast_ref::<AuthFailure>().is_some()
        || err.downcast_ref::<PersistFailure>().is_some()
        || err.chain().any(|cause| {
            cause.downcast_ref::<AuthFailure>().is_some()
                || cause.downcast_ref::<PersistFailure>().is_some()
        })
}

/// Tag text per color label: explicit overrides first, then
/// `<prefix><Color>` defaults. The "no label" color maps to nothing.
fn build_label_map(import: &ImportConfig) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for label in Label::ALL {
        if label == Label::None {
            continue;
        }
        let tag = import
            .label_map
            .get(label.name())
            .cloned()
            .unwrap_or_else(|| format!("{}{}", import.label_prefix, label.name()));
        map.insert(label.name().to_string(), tag);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_map_defaults_and_overrides() {
        let mut import = ImportConfig::default();
        import
            .label_map
            .insert("Red".to_string(), "important".to_string());

        let map = build_label_map(&import);
        assert_eq!(map.get("Red").unwrap(), "important");
        assert_eq!(map.get("Blue").unwrap(), "LabelBlue");
        assert!(!map.contains_key("None"));
    }

    #[test]
    fn auth_failure_is_fatal_through_context() {
        let err = anyhow::Error::new(AuthFailure { status: 403 }).context("Batch submission failed");
        assert!(is_fatal(&err));

        let plain = anyhow::anyhow!("some transient problem");
        assert!(!is_fatal(&plain));
    }
}
