//! Dry-run output sink.
//!
//! In dry-run mode nothing touches the network or the checkpoint; each
//! converted record is written to a text sink instead, as three labeled
//! blocks of pretty-printed JSON — the exact payloads that would have
//! been sent remotely.

use anyhow::{Context, Result};
use serde_json::Value;
use std::io::Write;
use std::path::Path;

use crate::batch::QueuedRecord;

pub struct DryRunSink {
    out: Box<dyn Write + Send>,
}

impl DryRunSink {
    /// Open a sink: a file when a path is given, stdout otherwise.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let out: Box<dyn Write + Send> = match path {
            Some(path) => Box::new(
                std::fs::File::create(path)
                    .with_context(|| format!("Failed to create dry-run file: {}", path.display()))?,
            ),
            None => Box::new(std::io::stdout()),
        };
        Ok(Self { out })
    }

    pub fn write_entry(&mut self, entry: &QueuedRecord) -> Result<()> {
        let item = Value::Object(entry.item.clone());
        let notes = Value::from(entry.notes.clone());
        let attachments = Value::from(
            entry
                .attachments
                .iter()
                .map(|a| a.path.display().to_string())
                .collect::<Vec<_>>(),
        );

        writeln!(self.out, "ITEM:")?;
        writeln!(self.out, "{}", serde_json::to_string_pretty(&item)?)?;
        writeln!(self.out, "NOTES:")?;
        writeln!(self.out, "{}", serde_json::to_string_pretty(&notes)?)?;
        writeln!(self.out, "ATTACHMENTS:")?;
        writeln!(self.out, "{}", serde_json::to_string_pretty(&attachments)?)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}
