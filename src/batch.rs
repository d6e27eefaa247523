//! Bounded buffer of converted records awaiting one remote submission.
//!
//! Each entry carries its own source id, so a per-position failure in the
//! remote response can always be traced back to the record that produced
//! it without correlating parallel lists.

use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::kinds::PubKind;

/// One converted record queued for submission.
#[derive(Debug, Clone)]
pub struct QueuedRecord {
    pub source_id: i64,
    pub kind: PubKind,
    /// The filled-in item payload, template defaults included.
    pub item: Map<String, Value>,
    /// Child note bodies to create once the item exists.
    pub notes: Vec<String>,
    pub attachments: Vec<QueuedAttachment>,
}

#[derive(Debug, Clone)]
pub struct QueuedAttachment {
    pub path: PathBuf,
    pub mime: Option<String>,
}

/// Ordered collection of up to `max_size` queued records.
#[derive(Debug)]
pub struct Batch {
    max_size: usize,
    entries: Vec<QueuedRecord>,
}

impl Batch {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            entries: Vec::with_capacity(max_size),
        }
    }

    pub fn push(&mut self, entry: QueuedRecord) {
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_size
    }

    /// Drain every queued entry, leaving the buffer empty. Submission
    /// always drains first so a failed attempt can never be resubmitted.
    pub fn take(&mut self) -> Vec<QueuedRecord> {
        std::mem::take(&mut self.entries)
    }
}
