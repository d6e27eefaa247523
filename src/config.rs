use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub source: SourceConfig,
    pub library: LibraryConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub linked_attachments: Option<LinkedAttachmentsConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The legacy library to read from.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Papers2 folder containing `Library.papers2/Database.papersdb`
    /// and the attachment tree.
    pub folder: PathBuf,
    #[serde(default)]
    pub include_deleted: bool,
    #[serde(default = "default_true")]
    pub include_duplicates: bool,
    #[serde(default)]
    pub include_manuscripts: bool,
    /// Only convert reviews authored by the library owner.
    #[serde(default = "default_true")]
    pub mine_reviews_only: bool,
}

/// The remote library to write to.
#[derive(Debug, Deserialize, Clone)]
pub struct LibraryConfig {
    pub id: String,
    #[serde(default = "default_library_kind")]
    pub kind: LibraryKind,
    pub api_key: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LibraryKind {
    User,
    Group,
}

fn default_library_kind() -> LibraryKind {
    LibraryKind::User
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImportConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_attachment_policy")]
    pub attachments: AttachmentPolicy,
    /// Keyword kinds converted to tags: any of "user", "auto", "label".
    #[serde(default = "default_keyword_kinds")]
    pub keyword_kinds: Vec<String>,
    /// Source collections to recreate remotely. Omitted means all;
    /// `no_collections = true` means none.
    #[serde(default)]
    pub collections: Option<Vec<String>>,
    #[serde(default)]
    pub no_collections: bool,
    /// Tag prefix for unmapped color labels, e.g. "Label" -> "LabelRed".
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,
    /// Per-color overrides: color name -> tag text.
    #[serde(default)]
    pub label_map: BTreeMap<String, String>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            attachments: default_attachment_policy(),
            keyword_kinds: default_keyword_kinds(),
            collections: None,
            no_collections: false,
            label_prefix: default_label_prefix(),
            label_map: BTreeMap::new(),
        }
    }
}

/// Which attachment files are carried over.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentPolicy {
    /// Every attachment.
    All,
    /// Only attachments of records never marked read.
    Unread,
    /// No attachments.
    None,
}

fn default_true() -> bool {
    true
}
fn default_batch_size() -> usize {
    50
}
fn default_attachment_policy() -> AttachmentPolicy {
    AttachmentPolicy::All
}
fn default_keyword_kinds() -> Vec<String> {
    vec!["user".to_string(), "auto".to_string(), "label".to_string()]
}
fn default_label_prefix() -> String {
    "Label".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_path")]
    pub path: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: default_checkpoint_path(),
        }
    }
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("biblioport.checkpoint.json")
}

/// Linked-attachment mode: create link records remotely and relocate the
/// physical files instead of uploading bytes.
#[derive(Debug, Deserialize, Clone)]
pub struct LinkedAttachmentsConfig {
    /// Destination base directory (the remote client's linked-file base).
    pub base: PathBuf,
    /// Base directory the legacy attachment tree lives under, as seen by
    /// the relocation backend.
    pub source_base: PathBuf,
    #[serde(default = "default_backend")]
    pub backend: RelocatorBackend,
    #[serde(default = "default_local_mode")]
    pub local_mode: LocalMode,
    /// Auth settings file for the drive backend.
    #[serde(default = "default_drive_auth")]
    pub drive_auth: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RelocatorBackend {
    Local,
    Drive,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LocalMode {
    Copy,
    Move,
}

fn default_backend() -> RelocatorBackend {
    RelocatorBackend::Local
}
fn default_local_mode() -> LocalMode {
    LocalMode::Copy
}
fn default_drive_auth() -> PathBuf {
    PathBuf::from("drive_auth.toml")
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Warnings and errors accumulate here across runs.
    #[serde(default = "default_error_file")]
    pub error_file: PathBuf,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            error_file: default_error_file(),
            level: default_log_level(),
        }
    }
}

fn default_error_file() -> PathBuf {
    PathBuf::from("biblioport_errors.log")
}
fn default_log_level() -> String {
    "warn".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.import.batch_size == 0 {
        anyhow::bail!("import.batch_size must be > 0");
    }

    if config.library.id.is_empty() {
        anyhow::bail!("library.id must not be empty");
    }
    if config.library.api_key.is_empty() {
        anyhow::bail!("library.api_key must not be empty");
    }

    for kind in &config.import.keyword_kinds {
        match kind.as_str() {
            "user" | "auto" | "label" => {}
            other => anyhow::bail!(
                "Unknown keyword kind: '{}'. Must be user, auto, or label.",
                other
            ),
        }
    }

    if config.import.no_collections
        && config
            .import
            .collections
            .as_ref()
            .is_some_and(|c| !c.is_empty())
    {
        anyhow::bail!("import.no_collections conflicts with a non-empty import.collections list");
    }

    Ok(config)
}
