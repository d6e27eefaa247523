//! Import orchestration: record stream -> batched remote submission.
//!
//! [`Importer::add_record`] converts one source record into a target item
//! (template + extraction rules + tag augmentation), queues it with its
//! notes and attachment files, and flushes the batch when full. Batch
//! submission isolates per-item failures: a rejected position marks only
//! its own source id failed, siblings still get their notes created and
//! attachments handled. The checkpoint is committed once per batch, after
//! the remote outcome is known; a failure of the submission call itself
//! rolls the staged ids back and propagates.

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::batch::{Batch, QueuedAttachment, QueuedRecord};
use crate::checkpoint::Checkpoint;
use crate::config::{AttachmentPolicy, LinkedAttachmentsConfig};
use crate::dryrun::DryRunSink;
use crate::extract::{self, ExtractContext, KeywordKindFilter, FIELD_RULES};
use crate::kinds::PubKind;
use crate::models::SourceRecord;
use crate::relocate::Relocator;
use crate::zotero::{RemoteLibrary, UploadFile};

/// Run parameters the orchestrator needs beyond its collaborators.
pub struct ImporterOptions {
    pub batch_size: usize,
    pub policy: AttachmentPolicy,
    pub retry_failed: bool,
    pub keyword_kinds: KeywordKindFilter,
    /// Color label name -> tag text.
    pub label_map: BTreeMap<String, String>,
    /// Source collections selected for this run. Empty means none.
    pub collections: Vec<String>,
    pub linked: Option<LinkedAttachmentsConfig>,
    /// The legacy library folder attachment paths live under.
    pub source_folder: PathBuf,
}

pub struct Importer {
    remote: Box<dyn RemoteLibrary>,
    relocator: Option<Box<dyn Relocator>>,
    checkpoint: Option<Checkpoint>,
    dry_run: Option<DryRunSink>,
    context: ExtractContext,
    batch: Batch,
    policy: AttachmentPolicy,
    retry_failed: bool,
    linked: Option<LinkedAttachmentsConfig>,
    source_folder: PathBuf,
}

impl Importer {
    /// Build the orchestrator, including the one-time collection
    /// name -> key mapping (existing remote collections matched by name,
    /// missing ones created; placeholder keys in dry-run mode).
    pub async fn new(
        remote: Box<dyn RemoteLibrary>,
        relocator: Option<Box<dyn Relocator>>,
        checkpoint: Option<Checkpoint>,
        dry_run: Option<DryRunSink>,
        options: ImporterOptions,
    ) -> Result<Self> {
        let collections = if options.collections.is_empty() {
            BTreeMap::new()
        } else if dry_run.is_some() {
            options
                .collections
                .iter()
                .map(|name| (name.clone(), format!("<{}>", name)))
                .collect()
        } else {
            load_collection_map(remote.as_ref(), &options.collections).await?
        };

        Ok(Self {
            remote,
            relocator,
            checkpoint,
            dry_run,
            context: ExtractContext {
                collections,
                keyword_kinds: options.keyword_kinds,
                label_map: options.label_map,
            },
            batch: Batch::new(options.batch_size),
            policy: options.policy,
            retry_failed: options.retry_failed,
            linked: options.linked,
            source_folder: options.source_folder,
        })
    }

    /// Convert and enqueue one record. Returns true iff the record was
    /// enqueued (not skipped). A full batch is submitted before
    /// returning.
    pub async fn add_record(&mut self, record: &SourceRecord) -> Result<bool> {
        if let Some(cp) = &self.checkpoint {
            if cp.contains(record.id) {
                info!(
                    record = record.id,
                    title = record.title.as_deref().unwrap_or(""),
                    "skipping already imported record"
                );
                return Ok(false);
            }
            if cp.contains_failed(record.id) {
                if self.retry_failed {
                    warn!(
                        record = record.id,
                        title = record.title.as_deref().unwrap_or(""),
                        "retrying previously failed record"
                    );
                } else {
                    info!(
                        record = record.id,
                        title = record.title.as_deref().unwrap_or(""),
                        "skipping previously failed record"
                    );
                    return Ok(false);
                }
            }
        }

        let item = self.build_item(record).await?;
        let notes = gather_notes(record);
        let attachments = match self.policy {
            AttachmentPolicy::All => queue_attachments(record),
            AttachmentPolicy::Unread if record.times_read == 0 => queue_attachments(record),
            _ => Vec::new(),
        };

        self.batch.push(QueuedRecord {
            source_id: record.id,
            kind: record.kind,
            item,
            notes,
            attachments,
        });
        if let Some(cp) = &mut self.checkpoint {
            cp.add(record.id);
        }

        if self.batch.is_full() {
            self.commit_batch().await?;
        }
        Ok(true)
    }

    /// Start from the remote template for the record's type and apply
    /// every extraction rule that matches a template field. `None`
    /// results leave the template default untouched.
    async fn build_item(&self, record: &SourceRecord) -> Result<Map<String, Value>> {
        let mut item = self
            .remote
            .item_template(record.kind.item_type(), None)
            .await?;

        for (field, rule) in FIELD_RULES {
            if !item.contains_key(*field) {
                continue;
            }
            if let Some(value) = extract::apply(rule, record, &self.context)? {
                item.insert((*field).to_string(), value);
            }
        }

        append_extra_tags(&mut item, record);
        Ok(item)
    }

    /// Submit whatever is buffered. The buffer is drained before any
    /// remote work, so a poisoned batch can never be resubmitted.
    pub async fn commit_batch(&mut self) -> Result<()> {
        let entries = self.batch.take();
        if entries.is_empty() {
            return Ok(());
        }

        if let Some(sink) = &mut self.dry_run {
            for entry in &entries {
                sink.write_entry(entry)?;
            }
            return Ok(());
        }

        let items: Vec<Value> = entries
            .iter()
            .map(|e| Value::Object(e.item.clone()))
            .collect();
        let attempted = items.len();

        let outcome = match self.remote.create_items(items, None).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // The staged checkpoint state no longer matches remote
                // reality; discard it and let the caller decide.
                if let Some(cp) = &mut self.checkpoint {
                    cp.rollback();
                }
                return Err(e).context("Batch submission failed");
            }
        };

        for (pos, failure) in &outcome.failed {
            let Some(entry) = entries.get(*pos) else {
                warn!(position = *pos, "remote reported failure for unknown batch position");
                continue;
            };
            error!(
                record = entry.source_id,
                title = entry.item.get("title").and_then(|v| v.as_str()).unwrap_or(""),
                code = failure.code,
                message = %failure.message,
                "item creation failed"
            );
            if let Some(cp) = &mut self.checkpoint {
                cp.add_failed(entry.source_id);
            }
        }

        let succeeded: Vec<(usize, String)> = outcome
            .succeeded()
            .map(|(pos, key)| (pos, key.to_string()))
            .collect();
        for (pos, key) in &succeeded {
            let Some(entry) = entries.get(*pos) else {
                continue;
            };
            debug!(record = entry.source_id, key = %key, "creating notes and attachments");
            self.create_notes(entry, key).await;
            if self.policy != AttachmentPolicy::None {
                self.handle_attachments(entry, key).await;
            }
        }

        if let Some(cp) = &mut self.checkpoint {
            cp.commit()?;
            info!(
                created = outcome.success.len(),
                unchanged = outcome.unchanged.len(),
                failed = outcome.failed.len(),
                attempted,
                total_imported = cp.imported_count(),
                total_failed = cp.failed_count(),
                "batch committed"
            );
        }
        Ok(())
    }

    /// Create the record's child notes in one follow-up batch. Failures
    /// degrade to a warning plus a failed-checkpoint mark; they never
    /// abort the batch.
    async fn create_notes(&mut self, entry: &QueuedRecord, parent: &str) {
        if entry.notes.is_empty() {
            return;
        }

        let result = async {
            let template = self.remote.item_template("note", None).await?;
            let notes: Vec<Value> = entry
                .notes
                .iter()
                .map(|text| {
                    let mut note = template.clone();
                    note.insert("note".to_string(), json!(text));
                    Value::Object(note)
                })
                .collect();
            self.remote.create_items(notes, Some(parent)).await
        }
        .await;

        match result {
            Ok(outcome) => {
                for (pos, failure) in &outcome.failed {
                    error!(
                        record = entry.source_id,
                        note = *pos,
                        code = failure.code,
                        message = %failure.message,
                        "note creation failed"
                    );
                    if let Some(cp) = &mut self.checkpoint {
                        cp.add_failed(entry.source_id);
                    }
                }
            }
            Err(e) => {
                warn!(record = entry.source_id, error = %e, "note batch failed");
                if let Some(cp) = &mut self.checkpoint {
                    cp.add_failed(entry.source_id);
                }
            }
        }
    }

    /// Handle a succeeded item's attachments: direct upload, or linked
    /// records plus physical relocation when a linked base and a
    /// relocator are configured. No failure here aborts sibling
    /// attachments or other items.
    async fn handle_attachments(&mut self, entry: &QueuedRecord, parent: &str) {
        if entry.attachments.is_empty() {
            debug!(record = entry.source_id, "no attachments");
            return;
        }

        let linked = match (&self.linked, &self.relocator) {
            (Some(linked), Some(_)) => Some(linked.clone()),
            _ => None,
        };

        match linked {
            None => {
                let files: Vec<UploadFile> = entry
                    .attachments
                    .iter()
                    .map(|a| UploadFile {
                        path: a.path.clone(),
                        mime: a.mime.clone(),
                    })
                    .collect();
                if let Err(e) = self.remote.upload_attachments(&files, parent).await {
                    error!(record = entry.source_id, error = %e, "attachment upload failed");
                    if let Some(cp) = &mut self.checkpoint {
                        cp.add_failed(entry.source_id);
                    }
                }
            }
            Some(linked) => self.link_and_relocate(entry, parent, &linked).await,
        }
    }

    async fn link_and_relocate(
        &mut self,
        entry: &QueuedRecord,
        parent: &str,
        linked: &LinkedAttachmentsConfig,
    ) {
        let template = match self
            .remote
            .item_template("attachment", Some("linked_file"))
            .await
        {
            Ok(template) => template,
            Err(e) => {
                error!(record = entry.source_id, error = %e, "no linked-attachment template");
                if let Some(cp) = &mut self.checkpoint {
                    cp.add_failed(entry.source_id);
                }
                return;
            }
        };

        for attachment in &entry.attachments {
            let Ok(rel) = attachment.path.strip_prefix(&self.source_folder) else {
                error!(
                    record = entry.source_id,
                    path = %attachment.path.display(),
                    "attachment path is outside the library folder"
                );
                self.mark_failed(entry.source_id);
                continue;
            };
            let Some((dest_rel, is_supplement)) = linked_dest(entry.kind, rel) else {
                error!(
                    record = entry.source_id,
                    path = %rel.display(),
                    "attachment path too shallow to reshape"
                );
                self.mark_failed(entry.source_id);
                continue;
            };

            let from_path = linked.source_base.join(rel);
            let to_path = linked.base.join(&dest_rel);
            let link = linked_item(&template, attachment, &dest_rel, is_supplement);

            match self.remote.create_items(vec![link], Some(parent)).await {
                Ok(outcome) if outcome.success.len() == 1 => {
                    if !attachment.path.exists() {
                        error!(
                            record = entry.source_id,
                            path = %attachment.path.display(),
                            "source file does not exist, nothing moved"
                        );
                        self.mark_failed(entry.source_id);
                        continue;
                    }
                    let moved = match self.relocator.as_deref() {
                        Some(relocator) => relocator.relocate(&from_path, &to_path).await,
                        None => false,
                    };
                    if moved {
                        info!(
                            record = entry.source_id,
                            to = %to_path.display(),
                            "attachment relocated"
                        );
                    } else {
                        error!(
                            record = entry.source_id,
                            from = %from_path.display(),
                            "attachment relocation failed"
                        );
                        self.mark_failed(entry.source_id);
                    }
                }
                Ok(_) => {
                    error!(
                        record = entry.source_id,
                        path = %rel.display(),
                        "linked-attachment record not created"
                    );
                    self.mark_failed(entry.source_id);
                }
                Err(e) => {
                    error!(
                        record = entry.source_id,
                        path = %rel.display(),
                        error = %e,
                        "linked-attachment creation failed"
                    );
                    self.mark_failed(entry.source_id);
                }
            }
        }
    }

    fn mark_failed(&mut self, id: i64) {
        if let Some(cp) = &mut self.checkpoint {
            cp.add_failed(id);
        }
    }

    /// Force-submit any remainder and close the dry-run sink.
    pub async fn close(&mut self) -> Result<()> {
        self.commit_batch().await?;
        if let Some(sink) = self.dry_run.take() {
            sink.finish()?;
        }
        Ok(())
    }

    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }
}

/// Fetch existing remote collections, create the selected ones that are
/// missing, and return the name -> key mapping for the selection.
async fn load_collection_map(
    remote: &dyn RemoteLibrary,
    selection: &[String],
) -> Result<BTreeMap<String, String>> {
    let existing = remote.collections().await?;
    let missing: Vec<String> = selection
        .iter()
        .filter(|name| !existing.iter().any(|c| c.name == **name))
        .cloned()
        .collect();
    if !missing.is_empty() {
        info!(count = missing.len(), "creating missing remote collections");
        remote.create_collections(&missing).await?;
    }

    // Re-fetch to pick up keys for anything just created.
    let mut map = BTreeMap::new();
    for collection in remote.collections().await? {
        if selection.contains(&collection.name) {
            map.insert(collection.name, collection.key);
        }
    }
    Ok(map)
}

/// The record's own note plus one formatted note per review.
fn gather_notes(record: &SourceRecord) -> Vec<String> {
    let mut notes = Vec::new();
    if let Some(text) = &record.notes {
        if !text.is_empty() {
            notes.push(text.clone());
        }
    }
    for review in &record.reviews {
        notes.push(format!("{} Rating: {}", review.content, review.rating));
    }
    notes
}

fn queue_attachments(record: &SourceRecord) -> Vec<QueuedAttachment> {
    record
        .attachments
        .iter()
        .map(|a| QueuedAttachment {
            path: a.path.clone(),
            mime: a.mime.clone(),
        })
        .collect()
}

/// Append membership, citation, and rating tags to the item's tag list.
fn append_extra_tags(item: &mut Map<String, Value>, record: &SourceRecord) {
    let mut tags: Vec<String> = record
        .collections
        .iter()
        .map(|name| format!("C:{}", name))
        .collect();
    if record.citekey.is_some() {
        tags.push("&cited".to_string());
    }
    if record.rating > 0 {
        tags.push("⭐".repeat(record.rating as usize));
    }
    if tags.is_empty() {
        return;
    }

    let slot = item
        .entry("tags")
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(list) = slot {
        list.extend(tags.into_iter().map(|tag| json!({ "tag": tag })));
    }
}

/// Reshape a source-relative attachment path into the destination layout:
/// the top folder becomes the target item type's folder, the
/// author-initial segment collapses to a single character, and a
/// `Supplemental` segment is dropped in favor of a `Supplement-` filename
/// prefix.
fn linked_dest(kind: PubKind, rel: &Path) -> Option<(PathBuf, bool)> {
    let mut parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(seg) => Some(seg.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();
    if parts.len() < 3 {
        return None;
    }

    parts[1] = parts[1].chars().next()?.to_string();

    let is_supplement = parts.len() == 5 && parts[3] == "Supplemental";
    if is_supplement {
        parts.remove(3);
        let last = parts.last_mut()?;
        *last = format!("Supplement-{}", last);
    }

    let mut dest = PathBuf::from(kind.folder_name());
    for part in &parts[1..] {
        dest.push(part);
    }
    Some((dest, is_supplement))
}

/// Fill in a linked-attachment payload for one file.
fn linked_item(
    template: &Map<String, Value>,
    attachment: &QueuedAttachment,
    dest_rel: &Path,
    is_supplement: bool,
) -> Value {
    let mut link = template.clone();

    // Linked-file paths use the client's base-directory prefix syntax
    // with forward slashes.
    let rel_str = dest_rel
        .iter()
        .map(|seg| seg.to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    link.insert("path".to_string(), json!(format!("attachments:{}", rel_str)));

    let filename = dest_rel
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    link.insert("title".to_string(), json!(filename));
    if let Some(mime) = &attachment.mime {
        link.insert("contentType".to_string(), json!(mime));
    }
    link.insert(
        "tags".to_string(),
        if is_supplement {
            json!([{ "tag": "&SUPP" }])
        } else {
            json!([])
        },
    );

    let access_date = std::fs::metadata(&attachment.path)
        .ok()
        .and_then(|m| m.created().ok())
        .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
        .and_then(|d| extract::format_utc(d.as_secs() as i64))
        .unwrap_or_default();
    link.insert("accessDate".to_string(), json!(access_date));

    Value::Object(link)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dest_path_collapses_initial() {
        let (dest, supp) = linked_dest(
            PubKind::JournalArticle,
            Path::new("Articles/Abe/Abe/Abe 2008 - Neural Correlates.pdf"),
        )
        .unwrap();
        assert_eq!(
            dest,
            PathBuf::from("Journal Article/A/Abe/Abe 2008 - Neural Correlates.pdf")
        );
        assert!(!supp);
    }

    #[test]
    fn dest_path_reshapes_supplement() {
        let (dest, supp) = linked_dest(
            PubKind::JournalArticle,
            Path::new("Articles/A/Abe/Supplemental/data.xlsx"),
        )
        .unwrap();
        assert_eq!(
            dest,
            PathBuf::from("Journal Article/A/Abe/Supplement-data.xlsx")
        );
        assert!(supp);
    }

    #[test]
    fn dest_path_uses_kind_folder() {
        let (dest, _) = linked_dest(PubKind::Thesis, Path::new("Theses/K/Kim/thesis.pdf")).unwrap();
        assert!(dest.starts_with("Thesis"));
    }

    #[test]
    fn shallow_paths_are_rejected() {
        assert!(linked_dest(PubKind::Book, Path::new("orphan.pdf")).is_none());
        assert!(linked_dest(PubKind::Book, Path::new("A/orphan.pdf")).is_none());
    }

    #[test]
    fn extra_tags_cover_membership_citation_rating() {
        let mut item = Map::new();
        let mut record = sample_record();
        record.collections = vec!["Methods".to_string()];
        record.citekey = Some("Abe2008".to_string());
        record.rating = 3;

        append_extra_tags(&mut item, &record);
        let tags = item.get("tags").unwrap().as_array().unwrap();
        let texts: Vec<&str> = tags
            .iter()
            .map(|t| t.get("tag").unwrap().as_str().unwrap())
            .collect();
        assert_eq!(texts, vec!["C:Methods", "&cited", "⭐⭐⭐"]);
    }

    #[test]
    fn no_extra_tags_leaves_item_untouched() {
        let mut item = Map::new();
        let record = sample_record();
        append_extra_tags(&mut item, &record);
        assert!(!item.contains_key("tags"));
    }

    fn sample_record() -> SourceRecord {
        SourceRecord {
            id: 1,
            uuid: "u".to_string(),
            title: None,
            kind: PubKind::JournalArticle,
            citekey: None,
            rating: 0,
            notes: None,
            doi: None,
            summary: None,
            imported_date: None,
            publication_date: None,
            version: None,
            number: None,
            bundle_string: None,
            resolved_bundle: None,
            language: None,
            document_number: None,
            start_page: None,
            end_page: None,
            place: None,
            publisher: None,
            copyright: None,
            volume: None,
            times_read: 0,
            label: crate::kinds::Label::None,
            authors: Vec::new(),
            identifiers: Vec::new(),
            urls: Vec::new(),
            keywords: Vec::new(),
            collections: Vec::new(),
            reviews: Vec::new(),
            attachments: Vec::new(),
        }
    }
}
