//! Image and template repositories
//!
//! Each repository is a file volume created on first upload, junctioned at
//! `/<name>` under an export policy of the same name. Images live as LUNs
//! created from a staged file `/_<image>`; templates are plain files under
//! `/cloud-init`. Uploads replace any existing artifact of the same name.

use crate::config::NodeStorageConfig;
use crate::controlplane::aggregate::largest_aggregate;
use crate::controlplane::content::{template_file_path, ContentFetcher, TEMPLATE_DIR};
use crate::domain::ports::{gib_to_bytes, lun_path, StorageBackendRef};
use crate::error::{Error, Result, ResultExt};
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info};

/// Size of a new image repository, GiB
pub const IMAGE_REPO_SIZE_GIB: u64 = 64;
/// Size of a new template repository, GiB
pub const TEMPLATE_REPO_SIZE_GIB: u64 = 1;

/// Wait for a new repository volume to come online before the first upload
const REPO_ONLINE_DELAY: Duration = Duration::from_secs(10);

/// Staging file backing an image LUN
pub fn image_file_path(image: &str) -> String {
    format!("/_{}", image)
}

/// Manager of the image and template repositories
pub struct RepoManager {
    backend: StorageBackendRef,
    fetcher: ContentFetcher,
}

impl RepoManager {
    pub fn new(backend: StorageBackendRef) -> Result<Self> {
        Ok(Self {
            backend,
            fetcher: ContentFetcher::new()?,
        })
    }

    async fn ensure_repo(&self, repo: &str, size_gib: u64) -> Result<()> {
        let backend = self.backend.as_ref();
        if backend.volume_exists(repo).await.context("volume_exists")? {
            return Ok(());
        }
        let aggregate = largest_aggregate(backend)
            .await
            .context("largest_aggregate")?;
        info!(
            "Creating repository volume: {} ({}GiB on {})",
            repo, size_gib, aggregate.name
        );
        backend
            .export_policy_create(repo)
            .await
            .context("export_policy_create")?;
        backend
            .volume_create_nas(repo, &aggregate.name, repo, gib_to_bytes(size_gib))
            .await
            .context("volume_create_nas")?;
        tokio::time::sleep(REPO_ONLINE_DELAY).await;
        Ok(())
    }

    async fn require_repo(&self, repo: &str) -> Result<()> {
        if !self.backend.volume_exists(repo).await.context("volume_exists")? {
            return Err(Error::not_found("repository volume", repo));
        }
        Ok(())
    }

    // =========================================================================
    // Images
    // =========================================================================

    /// Upload an OS image from `location` and expose it as a LUN named `image`
    pub async fn image_upload(&self, cfg: &NodeStorageConfig, image: &str, location: &str) -> Result<()> {
        async {
            let backend = self.backend.as_ref();
            let repo = &cfg.storage.image_repo_name;
            let content = self.fetcher.read(location).await.context("read_image")?;
            self.ensure_repo(repo, IMAGE_REPO_SIZE_GIB).await?;

            self.remove_image(repo, image).await?;
            let file = image_file_path(image);
            info!("Uploading image: {} ({} bytes) to {}", image, content.len(), repo);
            backend
                .file_upload_nfs(repo, &file, content)
                .await
                .context("file_upload_nfs")?;
            backend
                .lun_create_from_file(repo, &file, &lun_path(repo, image), image)
                .await
                .context("lun_create_from_file")
        }
        .await
        .context("create_repo_image")
    }

    /// Remove an image LUN and its staging file
    pub async fn image_delete(&self, cfg: &NodeStorageConfig, image: &str) -> Result<()> {
        async {
            let repo = &cfg.storage.image_repo_name;
            self.require_repo(repo).await?;
            self.remove_image(repo, image).await
        }
        .await
        .context("delete_repo_image")
    }

    /// Image names in the repository; empty when the repository is absent
    pub async fn image_list(&self, cfg: &NodeStorageConfig) -> Result<Vec<String>> {
        async {
            let repo = &cfg.storage.image_repo_name;
            if !self.backend.volume_exists(repo).await.context("volume_exists")? {
                return Ok(Vec::new());
            }
            self.backend.lun_list(repo).await.context("lun_list")
        }
        .await
        .context("get_repo_images")
    }

    async fn remove_image(&self, repo: &str, image: &str) -> Result<()> {
        let backend = self.backend.as_ref();
        let path = lun_path(repo, image);
        if backend.lun_exists(&path).await.context("lun_exists")? {
            info!("Deleting image LUN: {}", path);
            backend.lun_destroy(&path).await.context("lun_destroy")?;
        }
        let file = image_file_path(image);
        if backend.file_exists(repo, &file).await.context("file_exists")? {
            debug!("Deleting image file: {}{}", repo, file);
            backend.file_delete(repo, &file).await.context("file_delete")?;
        }
        Ok(())
    }

    // =========================================================================
    // Templates
    // =========================================================================

    /// Upload a cloud-init template from `location` as `name`
    pub async fn template_upload(&self, cfg: &NodeStorageConfig, name: &str, location: &str) -> Result<()> {
        async {
            let backend = self.backend.as_ref();
            let repo = &cfg.storage.template_repo_name;
            let content = self.fetcher.read(location).await.context("read_template")?;
            self.ensure_repo(repo, TEMPLATE_REPO_SIZE_GIB).await?;

            let file = template_file_path(name);
            if backend.file_exists(repo, &file).await.context("file_exists")? {
                backend.file_delete(repo, &file).await.context("file_delete")?;
            }
            info!("Uploading template: {} to {}", name, repo);
            backend
                .file_upload_api(repo, &file, content)
                .await
                .context("file_upload_api")
        }
        .await
        .context("create_repo_template")
    }

    pub async fn template_delete(&self, cfg: &NodeStorageConfig, name: &str) -> Result<()> {
        async {
            let backend = self.backend.as_ref();
            let repo = &cfg.storage.template_repo_name;
            self.require_repo(repo).await?;
            let file = template_file_path(name);
            if backend.file_exists(repo, &file).await.context("file_exists")? {
                info!("Deleting template: {} from {}", name, repo);
                backend.file_delete(repo, &file).await.context("file_delete")?;
            }
            Ok(())
        }
        .await
        .context("delete_repo_template")
    }

    /// Template names; empty when the repository is absent
    pub async fn template_list(&self, cfg: &NodeStorageConfig) -> Result<Vec<String>> {
        async {
            let repo = &cfg.storage.template_repo_name;
            if !self.backend.volume_exists(repo).await.context("volume_exists")? {
                return Ok(Vec::new());
            }
            self.backend
                .file_list(repo, TEMPLATE_DIR)
                .await
                .context("file_list")
        }
        .await
        .context("get_repo_templates")
    }

    /// Whether a template exists; false when the repository is absent
    pub async fn template_exists(&self, cfg: &NodeStorageConfig, name: &str) -> Result<bool> {
        let repo = &cfg.storage.template_repo_name;
        if !self.backend.volume_exists(repo).await.context("volume_exists")? {
            return Ok(false);
        }
        self.backend
            .file_exists(repo, &template_file_path(name))
            .await
            .context("file_exists")
    }

    pub async fn template_download(&self, cfg: &NodeStorageConfig, name: &str) -> Result<Bytes> {
        async {
            let backend = self.backend.as_ref();
            let repo = &cfg.storage.template_repo_name;
            self.require_repo(repo).await?;
            let file = template_file_path(name);
            if !backend.file_exists(repo, &file).await.context("file_exists")? {
                return Err(Error::not_found("template", name));
            }
            backend.file_download(repo, &file).await.context("file_download")
        }
        .await
        .context("download_repo_template")
    }
}
