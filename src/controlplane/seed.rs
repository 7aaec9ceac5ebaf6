//! Seed storage reconciler
//!
//! Renders the node's cloud-init template into a `cidata` ISO image and
//! exposes it as the seed LUN. The seed LUN is always replaced, never updated
//! in place.

use crate::cloudinit::build_seed_image;
use crate::config::{base_name, NodeStorageConfig, RemoteFile, StorageDiscovery};
use crate::controlplane::boot::SEED_FILE;
use crate::controlplane::content::ContentFetcher;
use crate::domain::ports::{ContentRendererRef, IsoImageWriterRef, StorageBackendRef};
use crate::error::{Error, Result, ResultExt};
use bytes::Bytes;
use tracing::{debug, info};

/// Reconciler for the cloud-init seed LUN
pub struct SeedStorage {
    backend: StorageBackendRef,
    renderer: ContentRendererRef,
    writer: IsoImageWriterRef,
    fetcher: ContentFetcher,
}

impl SeedStorage {
    pub fn new(
        backend: StorageBackendRef,
        renderer: ContentRendererRef,
        writer: IsoImageWriterRef,
    ) -> Result<Self> {
        Ok(Self {
            backend,
            renderer,
            writer,
            fetcher: ContentFetcher::new()?,
        })
    }

    /// Check the seed template is reachable
    pub async fn preflight(&self, cfg: &NodeStorageConfig) -> Result<()> {
        self.fetcher
            .probe_template(
                self.backend.as_ref(),
                &cfg.storage.template_repo_name,
                &cfg.storage.seed_lun.seed_template.location,
            )
            .await
            .context("create_seed_storage_preflight")
    }

    /// Render, upload and map a fresh seed image
    pub async fn create(&self, cfg: &NodeStorageConfig) -> Result<StorageDiscovery> {
        info!("Creating seed storage: {}", cfg.compute.host_name);
        self.replace(cfg).await.context("create_seed_storage")
    }

    async fn replace(&self, cfg: &NodeStorageConfig) -> Result<StorageDiscovery> {
        let backend = self.backend.as_ref();
        let location = &cfg.storage.seed_lun.seed_template.location;
        let volume = &cfg.storage.volume_name;
        let igroup = &cfg.storage.igroup_name;
        let seed_path = cfg.seed_lun_path();

        let raw = self
            .fetcher
            .fetch_template(backend, &cfg.storage.template_repo_name, location)
            .await?;
        let template = String::from_utf8(raw.to_vec())
            .map_err(|e| Error::Template(format!("template {} is not UTF-8: {}", location, e)))?;
        let image = build_seed_image(
            self.renderer.as_ref(),
            self.writer.as_ref(),
            &template,
            &cfg.to_context()?,
        )
        .context("build_seed_image")?;
        debug!("Seed image for {} is {} bytes", cfg.compute.host_name, image.len());

        if backend.lun_exists(&seed_path).await.context("lun_exists")? {
            info!("Unmapping seed LUN: {} <- {}", seed_path, igroup);
            backend
                .lun_unmap(&seed_path, igroup)
                .await
                .context("lun_unmap")?;
            info!("Deleting seed LUN: {}", seed_path);
            backend
                .lun_destroy(&seed_path)
                .await
                .context("lun_destroy")?;
        }
        if backend
            .file_exists(volume, SEED_FILE)
            .await
            .context("file_exists")?
        {
            backend
                .file_delete(volume, SEED_FILE)
                .await
                .context("file_delete")?;
        }

        info!("Uploading seed LUN: {}", seed_path);
        backend
            .lun_create_and_upload(volume, SEED_FILE, Bytes::from(image), &seed_path, location)
            .await
            .context("lun_create_and_upload")?;
        let id = cfg.storage.seed_lun.lun.id;
        info!("Mapping seed LUN: {} -> {} (id {})", seed_path, igroup, id);
        backend
            .lun_map(&seed_path, id, igroup)
            .await
            .context("lun_map")?;

        Ok(StorageDiscovery {
            seed_template: Some(RemoteFile {
                name: base_name(location).to_string(),
                location: location.clone(),
            }),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudinit::{FieldTemplate, IsoWriter};
    use crate::controlplane::backends::MemoryBackend;
    use crate::controlplane::boot::tests::{array, node};
    use crate::controlplane::boot::{BootStorage, ClassicBootStorage};
    use crate::domain::ports::Outcome;
    use crate::error::ErrorClass;
    use std::io::Write;
    use std::sync::Arc;

    const TEMPLATE: &str = r#"{{define "meta-data"}}instance-id: {{.Compute.HostName}}{{end}}
{{- define "network-config"}}version: 2{{end}}
{{- define "user-data"}}#cloud-config{{end}}"#;

    fn seed(backend: &Arc<MemoryBackend>) -> SeedStorage {
        SeedStorage::new(
            backend.clone(),
            Arc::new(FieldTemplate::new()),
            Arc::new(IsoWriter::new()),
        )
        .unwrap()
    }

    fn template_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", TEMPLATE).unwrap();
        file
    }

    #[tokio::test]
    async fn test_create_uploads_and_maps() {
        let backend = array();
        let file = template_file();
        let mut cfg = node();
        cfg.storage.seed_lun.seed_template.location = format!("file://{}", file.path().display());
        ClassicBootStorage::new(backend.clone()).create(&cfg).await.unwrap();

        let discovery = seed(&backend).create(&cfg).await.unwrap();
        let lun = backend.lun("/vol/node1_iboot/node1_seed").unwrap();
        assert_eq!(lun.comment, cfg.storage.seed_lun.seed_template.location);
        assert_eq!(lun.maps.get("node1_iboot"), Some(&2));
        let template = discovery.seed_template.unwrap();
        assert_eq!(template.location, cfg.storage.seed_lun.seed_template.location);
        assert!(!template.name.is_empty());
    }

    #[tokio::test]
    async fn test_create_replaces_existing_seed() {
        let backend = array();
        let file = template_file();
        let mut cfg = node();
        cfg.storage.seed_lun.seed_template.location = file.path().display().to_string();
        ClassicBootStorage::new(backend.clone()).create(&cfg).await.unwrap();
        let storage = seed(&backend);
        storage.create(&cfg).await.unwrap();
        backend.reset_calls();

        storage.create(&cfg).await.unwrap();
        let mutating = backend.mutating_calls();
        let unmap = mutating
            .iter()
            .position(|c| c == "lun_unmap /vol/node1_iboot/node1_seed node1_iboot")
            .unwrap();
        let destroy = mutating
            .iter()
            .position(|c| c == "lun_destroy /vol/node1_iboot/node1_seed")
            .unwrap();
        assert!(unmap < destroy);
        assert!(mutating.iter().any(|c| c.starts_with("lun_create_and_upload")));
        assert_eq!(
            backend.lun("/vol/node1_iboot/node1_seed").unwrap().maps.get("node1_iboot"),
            Some(&2)
        );
    }

    #[tokio::test]
    async fn test_failed_unmap_keeps_existing_seed() {
        let backend = array();
        let file = template_file();
        let mut cfg = node();
        cfg.storage.seed_lun.seed_template.location = file.path().display().to_string();
        ClassicBootStorage::new(backend.clone()).create(&cfg).await.unwrap();
        let storage = seed(&backend);
        storage.create(&cfg).await.unwrap();
        backend.reset_calls();

        backend.inject_fault("lun_unmap", Outcome::Transient, "503");
        let err = storage.create(&cfg).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Backend(Outcome::Transient));
        assert_eq!(err.breadcrumbs(), vec!["create_seed_storage", "lun_unmap"]);
        assert!(!backend.mutating_calls().iter().any(|c| c.starts_with("lun_destroy")));
        assert_eq!(
            backend.lun("/vol/node1_iboot/node1_seed").unwrap().maps.get("node1_iboot"),
            Some(&2)
        );
    }

    #[tokio::test]
    async fn test_unreachable_template() {
        let backend = array();
        let mut cfg = node();
        cfg.storage.seed_lun.seed_template.location = "/nonexistent/ubuntu.tmpl".into();
        let storage = seed(&backend);

        let err = storage.preflight(&cfg).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Configuration);
        let err = storage.create(&cfg).await.unwrap_err();
        assert_matches::assert_matches!(err.root(), Error::ContentSource { .. });
        assert!(backend.mutating_calls().is_empty());
    }
}
