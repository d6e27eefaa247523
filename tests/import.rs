//! End-to-end orchestrator tests against an in-process mock of the
//! remote library: resume, retry, per-position failure isolation,
//! rollback on submission errors, dry-run output, and the linked
//! attachment + relocation chain.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;

use biblioport::checkpoint::Checkpoint;
use biblioport::config::{AttachmentPolicy, LinkedAttachmentsConfig, LocalMode, RelocatorBackend};
use biblioport::dryrun::DryRunSink;
use biblioport::extract::KeywordKindFilter;
use biblioport::importer::{Importer, ImporterOptions};
use biblioport::kinds::{Label, PubKind};
use biblioport::models::{SourceAttachment, SourceRecord};
use biblioport::relocate::Relocator;
use biblioport::zotero::{BatchOutcome, CollectionInfo, RemoteFailure, RemoteLibrary, UploadFile};

// ───────────────────────── mock collaborators ─────────────────────────

#[derive(Default)]
struct MockRemote {
    /// Top-level batches received, in submission order.
    batches: Mutex<Vec<Vec<Value>>>,
    /// Child batches received as (parent key, items).
    child_batches: Mutex<Vec<(String, Vec<Value>)>>,
    /// Positions to reject in the next top-level submission.
    fail_positions: Mutex<Vec<usize>>,
    /// When set, the next top-level submission errors out entirely.
    error_on_create: AtomicBool,
    collections: Mutex<Vec<CollectionInfo>>,
    created_collections: Mutex<Vec<String>>,
    key_counter: AtomicUsize,
    uploads: Mutex<Vec<(String, Vec<PathBuf>)>>,
}

impl MockRemote {
    fn next_key(&self) -> String {
        format!("KEY{}", self.key_counter.fetch_add(1, Ordering::SeqCst))
    }

    fn top_level_batches(&self) -> Vec<Vec<Value>> {
        self.batches.lock().unwrap().clone()
    }

    fn child_batches(&self) -> Vec<(String, Vec<Value>)> {
        self.child_batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteLibrary for MockRemote {
    async fn item_template(
        &self,
        item_type: &str,
        subtype: Option<&str>,
    ) -> anyhow::Result<Map<String, Value>> {
        let mut template = Map::new();
        template.insert("itemType".to_string(), json!(item_type));
        match item_type {
            "note" => {
                template.insert("note".to_string(), json!(""));
                template.insert("tags".to_string(), json!([]));
            }
            "attachment" => {
                template.insert("linkMode".to_string(), json!(subtype.unwrap_or("")));
                template.insert("title".to_string(), json!(""));
                template.insert("path".to_string(), json!(""));
                template.insert("contentType".to_string(), json!(""));
                template.insert("tags".to_string(), json!([]));
                template.insert("accessDate".to_string(), json!(""));
            }
            _ => {
                for field in [
                    "title",
                    "abstractNote",
                    "date",
                    "DOI",
                    "pages",
                    "publicationTitle",
                    "url",
                    "accessDate",
                    "extra",
                    "volume",
                    "issue",
                ] {
                    template.insert(field.to_string(), json!(""));
                }
                template.insert("creators".to_string(), json!([]));
                template.insert("tags".to_string(), json!([]));
                template.insert("collections".to_string(), json!([]));
            }
        }
        Ok(template)
    }

    async fn create_items(
        &self,
        items: Vec<Value>,
        parent: Option<&str>,
    ) -> anyhow::Result<BatchOutcome> {
        if let Some(parent) = parent {
            self.child_batches
                .lock()
                .unwrap()
                .push((parent.to_string(), items.clone()));
            let mut outcome = BatchOutcome::default();
            for pos in 0..items.len() {
                outcome.success.insert(pos, self.next_key());
            }
            return Ok(outcome);
        }

        if self.error_on_create.load(Ordering::SeqCst) {
            anyhow::bail!("simulated transport failure");
        }

        let failures: Vec<usize> = self.fail_positions.lock().unwrap().drain(..).collect();
        self.batches.lock().unwrap().push(items.clone());

        let mut outcome = BatchOutcome::default();
        for pos in 0..items.len() {
            if failures.contains(&pos) {
                outcome.failed.insert(
                    pos,
                    RemoteFailure {
                        code: 400,
                        message: "rejected by test".to_string(),
                    },
                );
            } else {
                outcome.success.insert(pos, self.next_key());
            }
        }
        Ok(outcome)
    }

    async fn collections(&self) -> anyhow::Result<Vec<CollectionInfo>> {
        Ok(self.collections.lock().unwrap().clone())
    }

    async fn create_collections(&self, names: &[String]) -> anyhow::Result<()> {
        let mut existing = self.collections.lock().unwrap();
        for name in names {
            self.created_collections.lock().unwrap().push(name.clone());
            existing.push(CollectionInfo {
                name: name.clone(),
                key: format!("C-{}", name),
            });
        }
        Ok(())
    }

    async fn upload_attachments(&self, files: &[UploadFile], parent: &str) -> anyhow::Result<()> {
        self.uploads.lock().unwrap().push((
            parent.to_string(),
            files.iter().map(|f| f.path.clone()).collect(),
        ));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingRelocator {
    moves: Mutex<Vec<(PathBuf, PathBuf)>>,
    fail: AtomicBool,
}

#[async_trait]
impl Relocator for RecordingRelocator {
    async fn relocate(&self, from: &Path, to: &Path) -> bool {
        self.moves
            .lock()
            .unwrap()
            .push((from.to_path_buf(), to.to_path_buf()));
        !self.fail.load(Ordering::SeqCst)
    }
}

// ───────────────────────── fixtures ─────────────────────────

fn record(id: i64) -> SourceRecord {
    SourceRecord {
        id,
        uuid: format!("uuid-{}", id),
        title: Some(format!("Record {}", id)),
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
        label: Label::None,
        authors: Vec::new(),
        identifiers: Vec::new(),
        urls: Vec::new(),
        keywords: Vec::new(),
        collections: Vec::new(),
        reviews: Vec::new(),
        attachments: Vec::new(),
    }
}

fn options(batch_size: usize, source_folder: &Path) -> ImporterOptions {
    ImporterOptions {
        batch_size,
        policy: AttachmentPolicy::All,
        retry_failed: false,
        keyword_kinds: KeywordKindFilter::default(),
        label_map: BTreeMap::new(),
        collections: Vec::new(),
        linked: None,
        source_folder: source_folder.to_path_buf(),
    }
}

async fn importer_with(
    remote: std::sync::Arc<MockRemote>,
    checkpoint: Checkpoint,
    options: ImporterOptions,
) -> Importer {
    Importer::new(
        Box::new(SharedRemote(remote)),
        None,
        Some(checkpoint),
        None,
        options,
    )
    .await
    .unwrap()
}

/// Lets a test keep a handle on the mock the importer owns.
struct SharedRemote(std::sync::Arc<MockRemote>);

#[async_trait]
impl RemoteLibrary for SharedRemote {
    async fn item_template(
        &self,
        item_type: &str,
        subtype: Option<&str>,
    ) -> anyhow::Result<Map<String, Value>> {
        self.0.item_template(item_type, subtype).await
    }
    async fn create_items(
        &self,
        items: Vec<Value>,
        parent: Option<&str>,
    ) -> anyhow::Result<BatchOutcome> {
        self.0.create_items(items, parent).await
    }
    async fn collections(&self) -> anyhow::Result<Vec<CollectionInfo>> {
        self.0.collections().await
    }
    async fn create_collections(&self, names: &[String]) -> anyhow::Result<()> {
        self.0.create_collections(names).await
    }
    async fn upload_attachments(&self, files: &[UploadFile], parent: &str) -> anyhow::Result<()> {
        self.0.upload_attachments(files, parent).await
    }
}

// ───────────────────────── tests ─────────────────────────

#[tokio::test]
async fn partial_failure_marks_only_the_failed_position() {
    let dir = TempDir::new().unwrap();
    let remote = std::sync::Arc::new(MockRemote::default());
    remote.fail_positions.lock().unwrap().push(1);

    let checkpoint = Checkpoint::load(&dir.path().join("cp.json")).unwrap();
    let mut importer = importer_with(remote.clone(), checkpoint, options(3, dir.path())).await;

    // Give every record a note so we can observe downstream processing.
    for id in [10, 20, 30] {
        let mut rec = record(id);
        rec.notes = Some(format!("note for {}", id));
        assert!(importer.add_record(&rec).await.unwrap());
    }
    importer.close().await.unwrap();

    let cp = Checkpoint::load(&dir.path().join("cp.json")).unwrap();
    assert!(cp.contains(10));
    assert!(!cp.contains(20));
    assert!(cp.contains_failed(20));
    assert!(cp.contains(30));

    // Siblings of the rejected position still got their notes created.
    let children = remote.child_batches();
    assert_eq!(children.len(), 2);
    let note_texts: Vec<String> = children
        .iter()
        .flat_map(|(_, items)| items.iter())
        .map(|item| item["note"].as_str().unwrap().to_string())
        .collect();
    assert!(note_texts.contains(&"note for 10".to_string()));
    assert!(note_texts.contains(&"note for 30".to_string()));
    assert!(!note_texts.contains(&"note for 20".to_string()));
}

#[tokio::test]
async fn second_run_enqueues_nothing() {
    let dir = TempDir::new().unwrap();
    let cp_path = dir.path().join("cp.json");
    let remote = std::sync::Arc::new(MockRemote::default());

    let checkpoint = Checkpoint::load(&cp_path).unwrap();
    let mut importer = importer_with(remote.clone(), checkpoint, options(10, dir.path())).await;
    assert!(importer.add_record(&record(1)).await.unwrap());
    assert!(importer.add_record(&record(2)).await.unwrap());
    importer.close().await.unwrap();
    assert_eq!(remote.top_level_batches().len(), 1);

    // Same checkpoint file, same inputs: everything is skipped.
    let checkpoint = Checkpoint::load(&cp_path).unwrap();
    let mut importer = importer_with(remote.clone(), checkpoint, options(10, dir.path())).await;
    assert!(!importer.add_record(&record(1)).await.unwrap());
    assert!(!importer.add_record(&record(2)).await.unwrap());
    importer.close().await.unwrap();

    assert_eq!(remote.top_level_batches().len(), 1);
}

#[tokio::test]
async fn failed_record_skipped_unless_retry_requested() {
    let dir = TempDir::new().unwrap();
    let cp_path = dir.path().join("cp.json");
    let remote = std::sync::Arc::new(MockRemote::default());

    // First run: the only record is rejected.
    remote.fail_positions.lock().unwrap().push(0);
    let checkpoint = Checkpoint::load(&cp_path).unwrap();
    let mut importer = importer_with(remote.clone(), checkpoint, options(10, dir.path())).await;
    assert!(importer.add_record(&record(5)).await.unwrap());
    importer.close().await.unwrap();
    assert!(Checkpoint::load(&cp_path).unwrap().contains_failed(5));

    // Normal re-run: skipped.
    let checkpoint = Checkpoint::load(&cp_path).unwrap();
    let mut importer = importer_with(remote.clone(), checkpoint, options(10, dir.path())).await;
    assert!(!importer.add_record(&record(5)).await.unwrap());
    importer.close().await.unwrap();
    assert_eq!(remote.top_level_batches().len(), 1);

    // Retry run: reprocessed and, on success, moved to the success set.
    let checkpoint = Checkpoint::load(&cp_path).unwrap();
    let mut opts = options(10, dir.path());
    opts.retry_failed = true;
    let mut importer = importer_with(remote.clone(), checkpoint, opts).await;
    assert!(importer.add_record(&record(5)).await.unwrap());
    importer.close().await.unwrap();

    let cp = Checkpoint::load(&cp_path).unwrap();
    assert!(cp.contains(5));
    assert!(!cp.contains_failed(5));
}

#[tokio::test]
async fn submission_error_rolls_back_and_clears_the_batch() {
    let dir = TempDir::new().unwrap();
    let cp_path = dir.path().join("cp.json");
    let remote = std::sync::Arc::new(MockRemote::default());
    remote.error_on_create.store(true, Ordering::SeqCst);

    let checkpoint = Checkpoint::load(&cp_path).unwrap();
    let mut importer = importer_with(remote.clone(), checkpoint, options(2, dir.path())).await;

    assert!(importer.add_record(&record(1)).await.unwrap());
    // Filling the batch triggers submission, which fails.
    let err = importer.add_record(&record(2)).await.unwrap_err();
    assert!(err.to_string().contains("Batch submission failed"));

    // The poisoned batch is gone: recovery submits only new records.
    remote.error_on_create.store(false, Ordering::SeqCst);
    assert!(importer.add_record(&record(3)).await.unwrap());
    importer.close().await.unwrap();

    let batches = remote.top_level_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 1);

    let cp = Checkpoint::load(&cp_path).unwrap();
    assert!(!cp.contains(1));
    assert!(!cp.contains(2));
    assert!(cp.contains(3));
}

#[tokio::test]
async fn dry_run_writes_labeled_blocks_and_skips_the_network() {
    let dir = TempDir::new().unwrap();
    let out_path = dir.path().join("dryrun.txt");
    let remote = std::sync::Arc::new(MockRemote::default());

    let sink = DryRunSink::open(Some(out_path.as_path())).unwrap();
    let mut importer = Importer::new(
        Box::new(SharedRemote(remote.clone())),
        None,
        None,
        Some(sink),
        options(10, dir.path()),
    )
    .await
    .unwrap();

    let mut rec = record(42);
    rec.notes = Some("remember this".to_string());
    assert!(importer.add_record(&rec).await.unwrap());
    importer.close().await.unwrap();

    let output = std::fs::read_to_string(&out_path).unwrap();
    assert!(output.contains("ITEM:"));
    assert!(output.contains("NOTES:"));
    assert!(output.contains("ATTACHMENTS:"));
    assert!(output.contains("Record 42"));
    assert!(output.contains("remember this"));
    assert!(remote.top_level_batches().is_empty());
}

#[tokio::test]
async fn collection_map_creates_missing_collections() {
    let dir = TempDir::new().unwrap();
    let remote = std::sync::Arc::new(MockRemote::default());
    remote.collections.lock().unwrap().push(CollectionInfo {
        name: "Methods".to_string(),
        key: "MK".to_string(),
    });

    let checkpoint = Checkpoint::load(&dir.path().join("cp.json")).unwrap();
    let mut opts = options(10, dir.path());
    opts.collections = vec!["Methods".to_string(), "Reviews".to_string()];
    let mut importer = importer_with(remote.clone(), checkpoint, opts).await;

    assert_eq!(
        remote.created_collections.lock().unwrap().clone(),
        vec!["Reviews".to_string()]
    );

    // Membership in a selected collection lands in the item payload.
    let mut rec = record(9);
    rec.collections = vec!["Methods".to_string()];
    importer.add_record(&rec).await.unwrap();
    importer.close().await.unwrap();

    let batches = remote.top_level_batches();
    let item = &batches[0][0];
    assert_eq!(item["collections"], json!(["MK"]));
    // Membership also shows up as a C: tag.
    let tags: Vec<&str> = item["tags"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["tag"].as_str().unwrap())
        .collect();
    assert!(tags.contains(&"C:Methods"));
}

#[tokio::test]
async fn direct_upload_sends_attachment_files() {
    let dir = TempDir::new().unwrap();
    let remote = std::sync::Arc::new(MockRemote::default());

    let file = dir.path().join("Articles/A/Abe/paper.pdf");
    std::fs::create_dir_all(file.parent().unwrap()).unwrap();
    std::fs::write(&file, b"pdf").unwrap();

    let checkpoint = Checkpoint::load(&dir.path().join("cp.json")).unwrap();
    let mut importer = importer_with(remote.clone(), checkpoint, options(10, dir.path())).await;

    let mut rec = record(7);
    rec.attachments = vec![SourceAttachment {
        path: file.clone(),
        mime: Some("application/pdf".to_string()),
    }];
    importer.add_record(&rec).await.unwrap();
    importer.close().await.unwrap();

    let uploads = remote.uploads.lock().unwrap().clone();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].1, vec![file]);
}

fn linked_config(base: &Path, source_base: &Path) -> LinkedAttachmentsConfig {
    LinkedAttachmentsConfig {
        base: base.to_path_buf(),
        source_base: source_base.to_path_buf(),
        backend: RelocatorBackend::Local,
        local_mode: LocalMode::Copy,
        drive_auth: PathBuf::from("unused.toml"),
    }
}

#[tokio::test]
async fn linked_attachment_creates_record_then_relocates() {
    let dir = TempDir::new().unwrap();
    let source_folder = dir.path().join("Papers2");
    let file = source_folder.join("Articles/Abe/Abe/paper.pdf");
    std::fs::create_dir_all(file.parent().unwrap()).unwrap();
    std::fs::write(&file, b"pdf").unwrap();

    let remote = std::sync::Arc::new(MockRemote::default());
    let relocator = std::sync::Arc::new(RecordingRelocator::default());

    let checkpoint = Checkpoint::load(&dir.path().join("cp.json")).unwrap();
    let mut opts = options(10, &source_folder);
    opts.linked = Some(linked_config(Path::new("/Zotero"), &source_folder));
    let mut importer = Importer::new(
        Box::new(SharedRemote(remote.clone())),
        Some(Box::new(SharedRelocator(relocator.clone()))),
        Some(checkpoint),
        None,
        opts,
    )
    .await
    .unwrap();

    let mut rec = record(11);
    rec.attachments = vec![SourceAttachment {
        path: file.clone(),
        mime: Some("application/pdf".to_string()),
    }];
    importer.add_record(&rec).await.unwrap();
    importer.close().await.unwrap();

    // A linked-file record was created under the item...
    let children = remote.child_batches();
    let link = children
        .iter()
        .flat_map(|(_, items)| items.iter())
        .find(|item| item["itemType"] == json!("attachment"))
        .expect("linked attachment created");
    assert_eq!(
        link["path"],
        json!("attachments:Journal Article/A/Abe/paper.pdf")
    );

    // ...and only then the physical file was moved into the new layout.
    let moves = relocator.moves.lock().unwrap().clone();
    assert_eq!(moves.len(), 1);
    assert_eq!(moves[0].0, file);
    assert_eq!(
        moves[0].1,
        PathBuf::from("/Zotero/Journal Article/A/Abe/paper.pdf")
    );

    assert!(Checkpoint::load(&dir.path().join("cp.json"))
        .unwrap()
        .contains(11));
}

#[tokio::test]
async fn relocation_failure_downgrades_item_to_failed() {
    let dir = TempDir::new().unwrap();
    let source_folder = dir.path().join("Papers2");
    let file = source_folder.join("Articles/Abe/Abe/paper.pdf");
    std::fs::create_dir_all(file.parent().unwrap()).unwrap();
    std::fs::write(&file, b"pdf").unwrap();

    let remote = std::sync::Arc::new(MockRemote::default());
    let relocator = std::sync::Arc::new(RecordingRelocator::default());
    relocator.fail.store(true, Ordering::SeqCst);

    let cp_path = dir.path().join("cp.json");
    let checkpoint = Checkpoint::load(&cp_path).unwrap();
    let mut opts = options(10, &source_folder);
    opts.linked = Some(linked_config(Path::new("/Zotero"), &source_folder));
    let mut importer = Importer::new(
        Box::new(SharedRemote(remote.clone())),
        Some(Box::new(SharedRelocator(relocator.clone()))),
        Some(checkpoint),
        None,
        opts,
    )
    .await
    .unwrap();

    let mut rec = record(12);
    rec.attachments = vec![SourceAttachment {
        path: file,
        mime: None,
    }];
    importer.add_record(&rec).await.unwrap();
    importer.close().await.unwrap();

    let cp = Checkpoint::load(&cp_path).unwrap();
    assert!(!cp.contains(12));
    assert!(cp.contains_failed(12));
}

#[tokio::test]
async fn missing_source_file_is_a_downstream_failure() {
    let dir = TempDir::new().unwrap();
    let source_folder = dir.path().join("Papers2");
    std::fs::create_dir_all(&source_folder).unwrap();

    let remote = std::sync::Arc::new(MockRemote::default());
    let relocator = std::sync::Arc::new(RecordingRelocator::default());

    let cp_path = dir.path().join("cp.json");
    let checkpoint = Checkpoint::load(&cp_path).unwrap();
    let mut opts = options(10, &source_folder);
    opts.linked = Some(linked_config(Path::new("/Zotero"), &source_folder));
    let mut importer = Importer::new(
        Box::new(SharedRemote(remote.clone())),
        Some(Box::new(SharedRelocator(relocator.clone()))),
        Some(checkpoint),
        None,
        opts,
    )
    .await
    .unwrap();

    let mut rec = record(13);
    rec.attachments = vec![SourceAttachment {
        path: source_folder.join("Articles/A/Gone/vanished.pdf"),
        mime: None,
    }];
    importer.add_record(&rec).await.unwrap();
    importer.close().await.unwrap();

    // The link record may exist remotely, but nothing was moved and the
    // record is marked failed for a later retry.
    assert!(relocator.moves.lock().unwrap().is_empty());
    assert!(Checkpoint::load(&cp_path).unwrap().contains_failed(13));
}

#[tokio::test]
async fn unread_policy_skips_read_records() {
    let dir = TempDir::new().unwrap();
    let remote = std::sync::Arc::new(MockRemote::default());

    let file = dir.path().join("Articles/A/Abe/paper.pdf");
    std::fs::create_dir_all(file.parent().unwrap()).unwrap();
    std::fs::write(&file, b"pdf").unwrap();

    let checkpoint = Checkpoint::load(&dir.path().join("cp.json")).unwrap();
    let mut opts = options(10, dir.path());
    opts.policy = AttachmentPolicy::Unread;
    let mut importer = importer_with(remote.clone(), checkpoint, opts).await;

    let mut read_rec = record(21);
    read_rec.times_read = 3;
    read_rec.attachments = vec![SourceAttachment {
        path: file.clone(),
        mime: None,
    }];
    let mut unread_rec = record(22);
    unread_rec.attachments = vec![SourceAttachment {
        path: file,
        mime: None,
    }];

    importer.add_record(&read_rec).await.unwrap();
    importer.add_record(&unread_rec).await.unwrap();
    importer.close().await.unwrap();

    let uploads = remote.uploads.lock().unwrap().clone();
    assert_eq!(uploads.len(), 1, "only the unread record uploads files");
}

struct SharedRelocator(std::sync::Arc<RecordingRelocator>);

#[async_trait]
impl Relocator for SharedRelocator {
    async fn relocate(&self, from: &Path, to: &Path) -> bool {
        self.0.relocate(from, to).await
    }
}
