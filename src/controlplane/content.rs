//! Content sources for images and templates
//!
//! A location is an HTTP(S) URL, a `file://` URL or a bare local path. Seed
//! templates additionally fall back to the template repository, looked up by
//! the location's base name.

use crate::config::base_name;
use crate::domain::ports::StorageBackend;
use crate::error::{Error, Result};
use bytes::Bytes;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// Directory of the template repository holding cloud-init templates
pub const TEMPLATE_DIR: &str = "/cloud-init";

const FETCH_TIMEOUT_SECS: u64 = 300;

/// Path of a template inside the template repository
pub fn template_file_path(name: &str) -> String {
    format!("{}/{}", TEMPLATE_DIR, name)
}

/// Where a location string points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentLocation {
    Url(String),
    LocalPath(PathBuf),
}

impl ContentLocation {
    pub fn parse(location: &str) -> Self {
        if location.starts_with("http://") || location.starts_with("https://") {
            ContentLocation::Url(location.to_string())
        } else {
            let path = location.strip_prefix("file://").unwrap_or(location);
            ContentLocation::LocalPath(PathBuf::from(path))
        }
    }
}

/// Reads content from URLs and local paths
#[derive(Debug, Clone)]
pub struct ContentFetcher {
    client: reqwest::Client,
}

impl ContentFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client })
    }

    /// Read the whole content at `location`
    pub async fn read(&self, location: &str) -> Result<Bytes> {
        match ContentLocation::parse(location) {
            ContentLocation::Url(url) => {
                debug!("Fetching {}", url);
                let response = self.client.get(&url).send().await?.error_for_status()?;
                Ok(response.bytes().await?)
            }
            ContentLocation::LocalPath(path) => {
                debug!("Reading {}", path.display());
                Ok(Bytes::from(tokio::fs::read(&path).await?))
            }
        }
    }

    /// Check `location` can be read without keeping its content
    pub async fn probe(&self, location: &str) -> Result<()> {
        match ContentLocation::parse(location) {
            ContentLocation::Url(url) => {
                self.client.get(&url).send().await?.error_for_status()?;
                Ok(())
            }
            ContentLocation::LocalPath(path) => {
                let metadata = tokio::fs::metadata(&path).await?;
                if metadata.is_file() {
                    Ok(())
                } else {
                    Err(Error::Configuration(format!("{} is not a regular file", path.display())))
                }
            }
        }
    }

    /// Read a seed template, falling back to the template repository
    pub async fn fetch_template(
        &self,
        backend: &dyn StorageBackend,
        template_repo: &str,
        location: &str,
    ) -> Result<Bytes> {
        let mut reasons = Vec::new();
        match self.read(location).await {
            Ok(content) => return Ok(content),
            Err(e) => {
                warn!("Template {} unreadable, trying repository: {}", location, e);
                reasons.push(e.to_string());
            }
        }
        match repo_template(backend, template_repo, location).await {
            Ok(Some(path)) => return backend.file_download(template_repo, &path).await,
            Ok(None) => reasons.push(format!(
                "{} not found in repository {}",
                base_name(location),
                template_repo
            )),
            Err(e) => reasons.push(e.to_string()),
        }
        Err(Error::ContentSource {
            location: location.to_string(),
            reasons: reasons.join("; "),
        })
    }

    /// Check a seed template is reachable by any of its sources
    pub async fn probe_template(
        &self,
        backend: &dyn StorageBackend,
        template_repo: &str,
        location: &str,
    ) -> Result<()> {
        let mut reasons = Vec::new();
        match self.probe(location).await {
            Ok(()) => return Ok(()),
            Err(e) => reasons.push(e.to_string()),
        }
        match repo_template(backend, template_repo, location).await {
            Ok(Some(_)) => return Ok(()),
            Ok(None) => reasons.push(format!(
                "{} not found in repository {}",
                base_name(location),
                template_repo
            )),
            Err(e) => reasons.push(e.to_string()),
        }
        Err(Error::ContentSource {
            location: location.to_string(),
            reasons: reasons.join("; "),
        })
    }
}

/// Repository path of the template named by `location`, if it is there
async fn repo_template(
    backend: &dyn StorageBackend,
    template_repo: &str,
    location: &str,
) -> Result<Option<String>> {
    if !backend.volume_exists(template_repo).await? {
        return Ok(None);
    }
    let path = template_file_path(base_name(location));
    Ok(backend
        .file_exists(template_repo, &path)
        .await?
        .then_some(path))
}
