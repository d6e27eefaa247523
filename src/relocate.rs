//! Attachment relocation backends.
//!
//! A [`Relocator`] moves one attachment file from the legacy layout into
//! the target layout. The contract is a plain boolean: failures are
//! logged and resolve to `false`, they never propagate.
//!
//! Two backends: [`LocalRelocator`] works on the local filesystem;
//! [`DriveRelocator`] relocates files inside a cloud drive by updating
//! parent-folder metadata, transferring no bytes.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::LocalMode;

/// Single-file move capability.
#[async_trait]
pub trait Relocator: Send + Sync {
    /// Move `from` to `to`. Returns false on any failure; never panics
    /// or propagates an error.
    async fn relocate(&self, from: &Path, to: &Path) -> bool;
}

/// Plain filesystem backend. Copy mode preserves the source file; move
/// mode removes it after a successful transfer.
pub struct LocalRelocator {
    mode: LocalMode,
}

impl LocalRelocator {
    pub fn new(mode: LocalMode) -> Self {
        Self { mode }
    }

    fn transfer(&self, from: &Path, to: &Path) -> std::io::Result<()> {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(from, to)?;
        if self.mode == LocalMode::Move {
            std::fs::remove_file(from)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Relocator for LocalRelocator {
    async fn relocate(&self, from: &Path, to: &Path) -> bool {
        match self.transfer(from, to) {
            Ok(()) => {
                debug!(from = %from.display(), to = %to.display(), "relocated attachment");
                true
            }
            Err(e) => {
                warn!(
                    from = %from.display(),
                    to = %to.display(),
                    error = %e,
                    "attachment relocation failed"
                );
                false
            }
        }
    }
}

const DRIVE_API: &str = "https://www.googleapis.com/drive/v3";
const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const DEVICE_ENDPOINT: &str = "https://oauth2.googleapis.com/device/code";
const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";

/// OAuth client settings for the drive backend, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct DriveAuthSettings {
    pub client_id: String,
    pub client_secret: String,
    /// Where the obtained token is cached between runs.
    #[serde(default = "default_token_cache")]
    pub token_cache: PathBuf,
}

fn default_token_cache() -> PathBuf {
    PathBuf::from("drive_token.json")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DriveToken {
    access_token: String,
    refresh_token: String,
    /// Unix epoch after which the access token is stale.
    expires_at: i64,
}

impl DriveToken {
    fn is_fresh(&self) -> bool {
        chrono::Utc::now().timestamp() + 60 < self.expires_at
    }
}

/// Cloud-drive backend: moves a file by re-parenting and renaming its
/// backend item. Construction establishes a usable session — cached
/// token first, refresh flow next, and as an explicit fallback a
/// device-code interactive authorization that discards the stale cache.
pub struct DriveRelocator {
    http: reqwest::Client,
    settings: DriveAuthSettings,
    token: tokio::sync::Mutex<DriveToken>,
}

impl DriveRelocator {
    pub async fn connect(settings_path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(settings_path).with_context(|| {
            format!("Failed to read drive auth settings: {}", settings_path.display())
        })?;
        let settings: DriveAuthSettings =
            toml::from_str(&content).context("Failed to parse drive auth settings")?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")?;

        let token = match Self::refresh_cached(&http, &settings).await {
            Ok(token) => token,
            Err(e) => {
                // Two-tier strategy: the refresh path is spent; drop the
                // cache and go interactive.
                warn!(error = %e, "cached drive session unusable, re-authenticating");
                let _ = std::fs::remove_file(&settings.token_cache);
                Self::interactive_auth(&http, &settings)
                    .await
                    .context("Could not establish a drive session")?
            }
        };
        Self::store_token(&settings, &token)?;

        Ok(Self {
            http,
            settings,
            token: tokio::sync::Mutex::new(token),
        })
    }

    /// Tier one: reuse the cached token, refreshing it if stale.
    async fn refresh_cached(
        http: &reqwest::Client,
        settings: &DriveAuthSettings,
    ) -> Result<DriveToken> {
        let content = std::fs::read_to_string(&settings.token_cache)
            .with_context(|| "No cached drive token")?;
        let cached: DriveToken =
            serde_json::from_str(&content).context("Malformed drive token cache")?;
        if cached.is_fresh() {
            return Ok(cached);
        }
        Self::refresh(http, settings, cached).await
    }

    async fn refresh(
        http: &reqwest::Client,
        settings: &DriveAuthSettings,
        token: DriveToken,
    ) -> Result<DriveToken> {
        #[derive(Deserialize)]
        struct RefreshResponse {
            access_token: String,
            expires_in: i64,
        }

        let response = http
            .post(TOKEN_ENDPOINT)
            .form(&[
                ("client_id", settings.client_id.as_str()),
                ("client_secret", settings.client_secret.as_str()),
                ("refresh_token", token.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .context("Token refresh request failed")?;
        if !response.status().is_success() {
            bail!("Token refresh rejected with HTTP {}", response.status());
        }
        let refreshed: RefreshResponse = response
            .json()
            .await
            .context("Malformed token refresh response")?;

        Ok(DriveToken {
            access_token: refreshed.access_token,
            refresh_token: token.refresh_token,
            expires_at: chrono::Utc::now().timestamp() + refreshed.expires_in,
        })
    }

    /// Tier two: device-code authorization. Prints a verification URL and
    /// code, then polls until the user grants access.
    async fn interactive_auth(
        http: &reqwest::Client,
        settings: &DriveAuthSettings,
    ) -> Result<DriveToken> {
        #[derive(Deserialize)]
        struct DeviceCode {
            device_code: String,
            user_code: String,
            verification_url: String,
            #[serde(default = "default_poll_interval")]
            interval: u64,
        }
        fn default_poll_interval() -> u64 {
            5
        }

        let device: DeviceCode = http
            .post(DEVICE_ENDPOINT)
            .form(&[
                ("client_id", settings.client_id.as_str()),
                ("scope", DRIVE_SCOPE),
            ])
            .send()
            .await
            .context("Device authorization request failed")?
            .json()
            .await
            .context("Malformed device authorization response")?;

        eprintln!(
            "Drive authorization required: open {} and enter code {}",
            device.verification_url, device.user_code
        );

        #[derive(Deserialize)]
        struct PollResponse {
            #[serde(default)]
            access_token: String,
            #[serde(default)]
            refresh_token: String,
            #[serde(default)]
            expires_in: i64,
            #[serde(default)]
            error: String,
        }

        loop {
            tokio::time::sleep(Duration::from_secs(device.interval)).await;

            let poll: PollResponse = http
                .post(TOKEN_ENDPOINT)
                .form(&[
                    ("client_id", settings.client_id.as_str()),
                    ("client_secret", settings.client_secret.as_str()),
                    ("device_code", device.device_code.as_str()),
                    ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                ])
                .send()
                .await
                .context("Device token poll failed")?
                .json()
                .await
                .context("Malformed device token response")?;

            match poll.error.as_str() {
                "" => {
                    info!("drive session authorized");
                    return Ok(DriveToken {
                        access_token: poll.access_token,
                        refresh_token: poll.refresh_token,
                        expires_at: chrono::Utc::now().timestamp() + poll.expires_in,
                    });
                }
                "authorization_pending" | "slow_down" => continue,
                other => bail!("Device authorization failed: {}", other),
            }
        }
    }

    fn store_token(settings: &DriveAuthSettings, token: &DriveToken) -> Result<()> {
        let json = serde_json::to_string(token)?;
        std::fs::write(&settings.token_cache, json).with_context(|| {
            format!(
                "Failed to cache drive token at {}",
                settings.token_cache.display()
            )
        })?;
        Ok(())
    }

    /// Current access token, refreshed in place when stale.
    async fn access_token(&self) -> Result<String> {
        let mut token = self.token.lock().await;
        if !token.is_fresh() {
            *token = Self::refresh(&self.http, &self.settings, token.clone()).await?;
            Self::store_token(&self.settings, &token)?;
        }
        Ok(token.access_token.clone())
    }

    /// Resolve a drive-absolute path to a backend item id by walking the
    /// segments from the root. With `create`, missing folder segments are
    /// created on the way down.
    async fn resolve(&self, path: &Path, create: bool) -> Result<String> {
        let mut current = "root".to_string();
        for component in path.components() {
            let std::path::Component::Normal(segment) = component else {
                continue;
            };
            let name = segment.to_string_lossy();
            match self.child_id(&current, &name).await? {
                Some(id) => current = id,
                None if create => current = self.create_folder(&current, &name).await?,
                None => bail!("Drive path segment not found: {}", name),
            }
        }
        Ok(current)
    }

    async fn child_id(&self, parent: &str, name: &str) -> Result<Option<String>> {
        #[derive(Deserialize)]
        struct FileList {
            #[serde(default)]
            files: Vec<FileRef>,
        }
        #[derive(Deserialize)]
        struct FileRef {
            id: String,
        }

        let access = self.access_token().await?;
        let query = format!(
            "name = '{}' and '{}' in parents and trashed = false",
            name.replace('\'', "\\'"),
            parent
        );
        let list: FileList = self
            .http
            .get(format!("{}/files", DRIVE_API))
            .bearer_auth(&access)
            .query(&[("q", query.as_str()), ("fields", "files(id)")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(list.files.into_iter().next().map(|f| f.id))
    }

    async fn create_folder(&self, parent: &str, name: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct Created {
            id: String,
        }

        let access = self.access_token().await?;
        let created: Created = self
            .http
            .post(format!("{}/files", DRIVE_API))
            .bearer_auth(&access)
            .json(&json!({
                "name": name,
                "mimeType": "application/vnd.google-apps.folder",
                "parents": [parent],
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(created.id)
    }

    async fn metadata_move(&self, from: &Path, to: &Path) -> Result<()> {
        let file_id = self.resolve(from, false).await?;
        let dest_dir = to
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Destination has no parent directory"))?;
        let new_parent = self.resolve(dest_dir, true).await?;

        #[derive(Deserialize)]
        struct Parents {
            #[serde(default)]
            parents: Vec<String>,
        }

        let access = self.access_token().await?;
        let current: Parents = self
            .http
            .get(format!("{}/files/{}", DRIVE_API, file_id))
            .bearer_auth(&access)
            .query(&[("fields", "parents")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let new_name = to
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| anyhow::anyhow!("Destination has no file name"))?;

        self.http
            .patch(format!("{}/files/{}", DRIVE_API, file_id))
            .bearer_auth(&access)
            .query(&[
                ("addParents", new_parent.as_str()),
                ("removeParents", current.parents.join(",").as_str()),
                ("fields", "id, parents"),
            ])
            .json(&json!({ "name": new_name }))
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }
}

#[async_trait]
impl Relocator for DriveRelocator {
    async fn relocate(&self, from: &Path, to: &Path) -> bool {
        match self.metadata_move(from, to).await {
            Ok(()) => {
                debug!(from = %from.display(), to = %to.display(), "drive item re-parented");
                true
            }
            Err(e) => {
                warn!(
                    from = %from.display(),
                    to = %to.display(),
                    error = %e,
                    "drive relocation failed"
                );
                false
            }
        }
    }
}
