//! Remote reference-library client.
//!
//! [`RemoteLibrary`] is the seam the orchestrator drives; [`ZoteroClient`]
//! implements it over the Zotero Web API v3. Submissions return a
//! positional [`BatchOutcome`] so callers can trace per-item failures
//! back to the records that produced them.
//!
//! # Retry strategy
//!
//! Transient failures use exponential backoff, non-retryable client
//! errors fail immediately:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 401/403 → [`AuthFailure`], fatal to the run
//! - Other 4xx → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::{LibraryConfig, LibraryKind};

const API_BASE: &str = "https://api.zotero.org";
const MAX_RETRIES: u32 = 5;

/// Marker error for unusable credentials. The run loop halts when it
/// sees one of these in an error chain: every later batch would fail
/// the same way.
#[derive(Debug)]
pub struct AuthFailure {
    pub status: u16,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "remote library rejected credentials (HTTP {})", self.status)
    }
}

impl std::error::Error for AuthFailure {}

/// Per-item rejection reported by the remote service.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteFailure {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// Positional result of one batch submission.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub success: BTreeMap<usize, String>,
    pub unchanged: BTreeMap<usize, String>,
    pub failed: BTreeMap<usize, RemoteFailure>,
}

impl BatchOutcome {
    /// Created and unchanged positions together: everything that has a
    /// usable remote key.
    pub fn succeeded(&self) -> impl Iterator<Item = (usize, &str)> {
        self.success
            .iter()
            .chain(self.unchanged.iter())
            .map(|(pos, key)| (*pos, key.as_str()))
    }
}

#[derive(Debug, Clone)]
pub struct CollectionInfo {
    pub name: String,
    pub key: String,
}

/// A file to upload directly under a parent item.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub path: PathBuf,
    pub mime: Option<String>,
}

/// The remote service surface the import orchestrator needs.
#[async_trait]
pub trait RemoteLibrary: Send + Sync {
    /// Fetch the empty item payload for an item type (and optional
    /// subtype, e.g. an attachment link mode).
    async fn item_template(
        &self,
        item_type: &str,
        subtype: Option<&str>,
    ) -> Result<Map<String, Value>>;

    /// Submit up to one batch of items, optionally as children of
    /// `parent`. Returns per-position outcomes; only transport-level
    /// problems are errors.
    async fn create_items(
        &self,
        items: Vec<Value>,
        parent: Option<&str>,
    ) -> Result<BatchOutcome>;

    async fn collections(&self) -> Result<Vec<CollectionInfo>>;

    async fn create_collections(&self, names: &[String]) -> Result<()>;

    /// Upload files as stored attachments of `parent`.
    async fn upload_attachments(&self, files: &[UploadFile], parent: &str) -> Result<()>;
}

/// Zotero Web API v3 client.
pub struct ZoteroClient {
    http: reqwest::Client,
    prefix: String,
    api_key: String,
    templates: Mutex<HashMap<String, Map<String, Value>>>,
}

impl ZoteroClient {
    pub fn new(library: &LibraryConfig) -> Result<Self> {
        let prefix = match library.kind {
            LibraryKind::User => format!("{}/users/{}", API_BASE, library.id),
            LibraryKind::Group => format!("{}/groups/{}", API_BASE, library.id),
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            prefix,
            api_key: library.api_key.clone(),
            templates: Mutex::new(HashMap::new()),
        })
    }

    /// Send a request, retrying transient failures with backoff.
    /// 401/403 surfaces an [`AuthFailure`]; other non-2xx statuses are
    /// plain errors with the response body attached.
    async fn send(&self, build: impl Fn() -> reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let mut attempt = 0u32;
        loop {
            let request = build()
                .header("Zotero-API-Version", "3")
                .header("Zotero-API-Key", &self.api_key);

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        bail!(AuthFailure {
                            status: status.as_u16()
                        });
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        if attempt >= MAX_RETRIES {
                            bail!("Remote API error {} after {} retries", status, attempt);
                        }
                    } else if !status.is_success() {
                        let body = resp.text().await.unwrap_or_default();
                        bail!("Remote API error {}: {}", status, body);
                    } else {
                        return Ok(resp);
                    }
                }
                Err(e) => {
                    if attempt >= MAX_RETRIES {
                        return Err(anyhow::Error::new(e).context("Remote API request failed"));
                    }
                }
            }

            let backoff = 2u64.pow(attempt.min(5));
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            attempt += 1;
        }
    }
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    #[serde(default)]
    success: BTreeMap<String, Value>,
    #[serde(default)]
    unchanged: BTreeMap<String, Value>,
    #[serde(default)]
    failed: BTreeMap<String, RemoteFailure>,
}

fn key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        // Newer API versions return the full object; the key is inside.
        Value::Object(obj) => obj
            .get("key")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

fn positional<V: Clone, T>(
    map: &BTreeMap<String, V>,
    convert: impl Fn(&V) -> T,
) -> BTreeMap<usize, T> {
    map.iter()
        .filter_map(|(pos, v)| Some((pos.parse::<usize>().ok()?, convert(v))))
        .collect()
}

#[async_trait]
impl RemoteLibrary for ZoteroClient {
    async fn item_template(
        &self,
        item_type: &str,
        subtype: Option<&str>,
    ) -> Result<Map<String, Value>> {
        let cache_key = format!("{}:{}", item_type, subtype.unwrap_or(""));
        if let Some(cached) = self.templates.lock().unwrap().get(&cache_key) {
            return Ok(cached.clone());
        }

        let mut url = format!("{}/items/new?itemType={}", API_BASE, item_type);
        if let Some(subtype) = subtype {
            url.push_str(&format!("&linkMode={}", subtype));
        }

        let template: Map<String, Value> = self
            .send(|| self.http.get(&url))
            .await?
            .json()
            .await
            .with_context(|| format!("Malformed item template for '{}'", item_type))?;

        self.templates
            .lock()
            .unwrap()
            .insert(cache_key, template.clone());
        Ok(template)
    }

    async fn create_items(
        &self,
        mut items: Vec<Value>,
        parent: Option<&str>,
    ) -> Result<BatchOutcome> {
        if let Some(parent) = parent {
            for item in &mut items {
                if let Some(obj) = item.as_object_mut() {
                    obj.insert("parentItem".to_string(), json!(parent));
                }
            }
        }

        let url = format!("{}/items", self.prefix);
        let body = serde_json::to_string(&items)?;
        let response: WriteResponse = self
            .send(|| {
                self.http
                    .post(&url)
                    .header("Content-Type", "application/json")
                    .body(body.clone())
            })
            .await?
            .json()
            .await
            .context("Malformed item-write response")?;

        Ok(BatchOutcome {
            success: positional(&response.success, key_string),
            unchanged: positional(&response.unchanged, key_string),
            failed: positional(&response.failed, |f| f.clone()),
        })
    }

    async fn collections(&self) -> Result<Vec<CollectionInfo>> {
        #[derive(Deserialize)]
        struct CollectionEntry {
            data: CollectionData,
        }
        #[derive(Deserialize)]
        struct CollectionData {
            name: String,
            key: String,
        }

        let mut out = Vec::new();
        let mut start = 0usize;
        const PAGE: usize = 100;
        loop {
            let url = format!(
                "{}/collections?limit={}&start={}",
                self.prefix, PAGE, start
            );
            let page: Vec<CollectionEntry> = self
                .send(|| self.http.get(&url))
                .await?
                .json()
                .await
                .context("Malformed collections response")?;

            let n = page.len();
            out.extend(page.into_iter().map(|c| CollectionInfo {
                name: c.data.name,
                key: c.data.key,
            }));
            if n < PAGE {
                break;
            }
            start += n;
        }
        Ok(out)
    }

    async fn create_collections(&self, names: &[String]) -> Result<()> {
        let payload: Vec<Value> = names.iter().map(|n| json!({ "name": n })).collect();
        let url = format!("{}/collections", self.prefix);
        let body = serde_json::to_string(&payload)?;
        self.send(|| {
            self.http
                .post(&url)
                .header("Content-Type", "application/json")
                .body(body.clone())
        })
        .await?;
        Ok(())
    }

    async fn upload_attachments(&self, files: &[UploadFile], parent: &str) -> Result<()> {
        for file in files {
            self.upload_one(file, parent).await.with_context(|| {
                format!("Failed to upload attachment {}", file.path.display())
            })?;
        }
        Ok(())
    }
}

impl ZoteroClient {
    /// The three-step stored-file upload: create the attachment item,
    /// request upload authorization, then push bytes and register.
    async fn upload_one(&self, file: &UploadFile, parent: &str) -> Result<()> {
        let filename = file
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| anyhow::anyhow!("Attachment has no file name"))?;

        let mut template = self
            .item_template("attachment", Some("imported_file"))
            .await?;
        template.insert("title".to_string(), json!(filename));
        template.insert("filename".to_string(), json!(filename));
        if let Some(mime) = &file.mime {
            template.insert("contentType".to_string(), json!(mime));
        }

        let outcome = self
            .create_items(vec![Value::Object(template)], Some(parent))
            .await?;
        let Some((_, item_key)) = outcome.succeeded().next() else {
            bail!("Attachment item was not created");
        };
        let item_key = item_key.to_string();

        let bytes = std::fs::read(&file.path)
            .with_context(|| format!("Failed to read {}", file.path.display()))?;
        let digest = format!("{:x}", md5::compute(&bytes));
        let mtime = std::fs::metadata(&file.path)?
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        #[derive(Deserialize)]
        struct UploadAuth {
            #[serde(default)]
            exists: u8,
            #[serde(default)]
            url: String,
            #[serde(default, rename = "contentType")]
            content_type: String,
            #[serde(default)]
            prefix: String,
            #[serde(default)]
            suffix: String,
            #[serde(default, rename = "uploadKey")]
            upload_key: String,
        }

        let auth_url = format!("{}/items/{}/file", self.prefix, item_key);
        let form = format!(
            "md5={}&filename={}&filesize={}&mtime={}",
            digest,
            filename,
            bytes.len(),
            mtime
        );
        let auth: UploadAuth = self
            .send(|| {
                self.http
                    .post(&auth_url)
                    .header("Content-Type", "application/x-www-form-urlencoded")
                    .header("If-None-Match", "*")
                    .body(form.clone())
            })
            .await?
            .json()
            .await
            .context("Malformed upload-authorization response")?;

        if auth.exists == 1 {
            return Ok(());
        }

        let mut body = Vec::with_capacity(auth.prefix.len() + bytes.len() + auth.suffix.len());
        body.extend_from_slice(auth.prefix.as_bytes());
        body.extend_from_slice(&bytes);
        body.extend_from_slice(auth.suffix.as_bytes());

        let status = self
            .http
            .post(&auth.url)
            .header("Content-Type", auth.content_type)
            .body(body)
            .send()
            .await
            .context("Attachment upload failed")?
            .status();
        if !status.is_success() {
            bail!("Attachment upload rejected with HTTP {}", status);
        }

        let register = format!("upload={}", auth.upload_key);
        self.send(|| {
            self.http
                .post(&auth_url)
                .header("Content-Type", "application/x-www-form-urlencoded")
                .header("If-None-Match", "*")
                .body(register.clone())
        })
        .await?;
        Ok(())
    }
}
