//! Durable record of which source ids have been imported or have
//! permanently failed.
//!
//! The checkpoint is loaded once at startup, mutated in memory while a
//! batch is being assembled, and persisted only on [`Checkpoint::commit`]
//! after the remote submission outcome is known. A commit writes the full
//! state to a temporary file and renames it into place, so a crash can
//! never leave a partially-written checkpoint behind. Persistence failure
//! is fatal to the run: resuming from an untrustworthy checkpoint would
//! re-import records.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Marker error for checkpoint persistence failures. The run loop halts
/// when it sees one of these in an error chain.
#[derive(Debug)]
pub struct PersistFailure {
    pub path: PathBuf,
}

impl fmt::Display for PersistFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to persist checkpoint to {}",
            self.path.display()
        )
    }
}

impl std::error::Error for PersistFailure {}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointFile {
    imported: Vec<i64>,
    failed: Vec<i64>,
}

#[derive(Debug)]
pub struct Checkpoint {
    path: PathBuf,
    imported: BTreeSet<i64>,
    failed: BTreeSet<i64>,
    /// Ids staged since the last commit, in enqueue order.
    pending: Vec<i64>,
}

impl Checkpoint {
    /// Load the checkpoint file, or start empty if it does not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        let (imported, failed) = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read checkpoint file: {}", path.display()))?;
            let file: CheckpointFile = serde_json::from_str(&content)
                .with_context(|| format!("Malformed checkpoint file: {}", path.display()))?;
            (
                file.imported.into_iter().collect(),
                file.failed.into_iter().collect(),
            )
        } else {
            (BTreeSet::new(), BTreeSet::new())
        };

        Ok(Self {
            path: path.to_path_buf(),
            imported,
            failed,
            pending: Vec::new(),
        })
    }

    /// True if the id is in the committed-success set.
    pub fn contains(&self, id: i64) -> bool {
        self.imported.contains(&id)
    }

    /// True if the id is in the failed set.
    pub fn contains_failed(&self, id: i64) -> bool {
        self.failed.contains(&id)
    }

    /// Stage an id as pending-success for the next commit. A new attempt
    /// supersedes any earlier failure.
    pub fn add(&mut self, id: i64) {
        self.pending.push(id);
        self.failed.remove(&id);
    }

    /// Mark an id as failed. May also be called for a downstream failure
    /// discovered after the item itself was created remotely.
    pub fn add_failed(&mut self, id: i64) {
        self.failed.insert(id);
    }

    /// Move staged ids that did not fail into the success set and persist
    /// the whole state atomically. Errors carry a [`PersistFailure`].
    pub fn commit(&mut self) -> Result<()> {
        for id in self.pending.drain(..) {
            if !self.failed.contains(&id) {
                self.imported.insert(id);
            }
        }
        // Success takes precedence over any stale failure entry.
        let imported = &self.imported;
        self.failed.retain(|id| !imported.contains(id));

        let file = CheckpointFile {
            imported: self.imported.iter().copied().collect(),
            failed: self.failed.iter().copied().collect(),
        };
        let json = serde_json::to_string(&file).context("Failed to serialize checkpoint")?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .and_then(|_| std::fs::rename(&tmp, &self.path))
            .map_err(|e| {
                anyhow::Error::new(e).context(PersistFailure {
                    path: self.path.clone(),
                })
            })?;
        Ok(())
    }

    /// Discard staged additions without persisting. Used when the remote
    /// submission itself failed and the staged state no longer matches
    /// remote reality.
    pub fn rollback(&mut self) {
        self.pending.clear();
    }

    pub fn imported_count(&self) -> usize {
        self.imported.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn failed_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.failed.iter().copied()
    }
}
