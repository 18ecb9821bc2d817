// src/services/provider.rs

//! External grade provider.
//!
//! The portal scraping itself lives behind an HTTP endpoint that answers
//! `GET <base_url>/<entity_id>` with a [`FetchedSnapshot`] as JSON. This module
//! only speaks to that endpoint and downloads reported course-work files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use url::Url;

use crate::error::{AppError, Result};
use crate::models::{Attachment, FetchedSnapshot, ProviderConfig};
use crate::utils::fs::safe_component;
use crate::utils::http::{create_async_client, with_trailing_slash};

/// Name the portal reports for ids it does not know.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Result of one provider fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Found(FetchedSnapshot),
    /// The provider answered but could not identify the entity
    Unknown,
}

/// Source of fresh entity snapshots.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn fetch_snapshot(&self, entity_id: &str) -> Result<FetchOutcome>;
}

/// Provider backed by the portal's JSON endpoint.
pub struct HttpSnapshotProvider {
    client: Client,
    base_url: Url,
    download_dir: PathBuf,
}

impl HttpSnapshotProvider {
    /// Create a provider from configuration.
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            client: create_async_client(&config.user_agent, config.timeout_secs)?,
            base_url: with_trailing_slash(&config.base_url)?,
            download_dir: config.download_dir.clone(),
        })
    }

    fn is_unknown(name: &str) -> bool {
        let name = name.trim();
        name.is_empty() || name == UNKNOWN_NAME
    }

    /// Download every attachment that only has a remote URL.
    ///
    /// Failed downloads are logged and dropped.
    async fn materialize(&self, entity_id: &str, attachments: Vec<Attachment>) -> Vec<Attachment> {
        let mut ready = Vec::with_capacity(attachments.len());
        for mut attachment in attachments {
            if attachment.path.is_some() {
                ready.push(attachment);
                continue;
            }
            let Some(remote) = attachment.url.clone() else {
                log::warn!(
                    "Attachment for {} in '{}' has neither path nor url",
                    entity_id,
                    attachment.category
                );
                continue;
            };
            match self.download(entity_id, &attachment, &remote).await {
                Ok(path) => {
                    attachment.path = Some(path.to_string_lossy().into_owned());
                    ready.push(attachment);
                }
                Err(e) => log::error!("Failed to download {} for {}: {}", remote, entity_id, e),
            }
        }
        ready
    }

    /// Local path of a downloaded file: one folder per entity, category and
    /// semester, so equal file names of different owners never collide.
    fn local_path(&self, entity_id: &str, attachment: &Attachment, file_name: &str) -> PathBuf {
        let mut dir = self
            .download_dir
            .join(safe_component(entity_id))
            .join(safe_component(&attachment.category));
        if let Some(semester) = attachment.semester.as_deref() {
            dir = dir.join(safe_component(semester));
        }
        dir.join(safe_component(file_name))
    }

    async fn download(
        &self,
        entity_id: &str,
        attachment: &Attachment,
        remote: &str,
    ) -> Result<PathBuf> {
        let url = self.base_url.join(remote)?;
        let file_name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| AppError::validation(format!("no file name in {url}")))?
            .to_string();

        // Already fetched for this owner, category and semester
        let dest = self.local_path(entity_id, attachment, &file_name);
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            log::debug!("Already downloaded: {}", dest.display());
            return Ok(dest);
        }

        let bytes = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        write_file(&dest, &bytes).await?;
        log::info!("Downloaded course work file: {}", dest.display());
        Ok(dest)
    }
}

async fn write_file(dest: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(dest, bytes).await?;
    Ok(())
}

#[async_trait]
impl SnapshotProvider for HttpSnapshotProvider {
    async fn fetch_snapshot(&self, entity_id: &str) -> Result<FetchOutcome> {
        let url = self.base_url.join(entity_id)?;
        let response = self.client.get(url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(AppError::provider(entity_id, "not found"));
        }
        let mut fetched: FetchedSnapshot = response.error_for_status()?.json().await?;

        if Self::is_unknown(&fetched.display_name) {
            return Ok(FetchOutcome::Unknown);
        }

        let attachments = std::mem::take(&mut fetched.attachments);
        fetched.attachments = self.materialize(entity_id, attachments).await;
        Ok(FetchOutcome::Found(fetched))
    }
}
