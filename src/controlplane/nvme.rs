//! NVMe-oF data namespace reconciler
//!
//! Runs only when the record names at least one NVMe host and a positive
//! namespace size; otherwise every operation here is a no-op.
//!
//! Create always tears down and recreates both the namespace and its
//! subsystem. It is not idempotent with respect to in-place updates: existing
//! NVMe consumers see an outage window on every create.

use crate::config::{NodeStorageConfig, NvmeTarget, StorageDiscovery};
use crate::domain::ports::{gib_to_bytes, StorageBackendRef};
use crate::error::{Error, Result, ResultExt};
use tracing::{debug, info};

/// Reconciler for the NVMe namespace, subsystem and host registration
pub struct NvmeStorage {
    backend: StorageBackendRef,
}

impl NvmeStorage {
    pub fn new(backend: StorageBackendRef) -> Self {
        Self { backend }
    }

    /// Require at least one NVMe data interface in scope
    pub async fn preflight(&self, cfg: &NodeStorageConfig) -> Result<()> {
        if !cfg.nvme_enabled() {
            return Ok(());
        }
        let lifs = self
            .backend
            .nvme_lifs()
            .await
            .context("nvme_lifs")
            .context("create_nvme_storage_preflight")?;
        if lifs.is_empty() {
            return Err(Error::UnreachableFabric {
                protocol: "NVMe".into(),
                target: self.backend.svm_name().to_string(),
                subnet: "any".into(),
            }
            .context("create_nvme_storage_preflight"));
        }
        Ok(())
    }

    /// Recreate namespace and subsystem, register the host and discover targets
    pub async fn create(&self, cfg: &NodeStorageConfig) -> Result<StorageDiscovery> {
        if !cfg.nvme_enabled() {
            debug!("NVMe storage not requested for {}", cfg.compute.host_name);
            return Ok(StorageDiscovery::default());
        }
        self.recreate(cfg).await.context("create_nvme_storage")
    }

    async fn recreate(&self, cfg: &NodeStorageConfig) -> Result<StorageDiscovery> {
        let nvme = &cfg.storage.data_nvme;
        let path = cfg.nvme_namespace_path();

        self.remove_namespace(&path).await?;
        info!("Creating NVMe namespace: {} ({}GiB)", path, nvme.size);
        self.backend
            .nvme_namespace_create(&path, gib_to_bytes(nvme.size))
            .await
            .context("nvme_namespace_create")?;

        if self
            .backend
            .nvme_subsystem_exists(&nvme.subsystem)
            .await
            .context("nvme_subsystem_exists")?
        {
            info!("Recreating NVMe subsystem: {}", nvme.subsystem);
            self.backend
                .nvme_subsystem_destroy(&nvme.subsystem)
                .await
                .context("nvme_subsystem_destroy")?;
        }
        self.backend
            .nvme_subsystem_create(&nvme.subsystem)
            .await
            .context("nvme_subsystem_create")?;

        if let Some(host) = cfg.network.nvme_host.first() {
            info!("Adding host {} to subsystem {}", host.host_nqn, nvme.subsystem);
            self.backend
                .nvme_subsystem_add_host(&nvme.subsystem, &host.host_nqn)
                .await
                .context("nvme_subsystem_add_host")?;
        }
        self.backend
            .nvme_namespace_map(&path, &nvme.subsystem)
            .await
            .context("nvme_namespace_map")?;

        Ok(StorageDiscovery {
            nvme_targets: Some(self.discover_targets(cfg).await?),
            ..Default::default()
        })
    }

    /// Observed namespace size and targets; empty when the namespace is absent
    pub async fn discover(&self, cfg: &NodeStorageConfig) -> Result<StorageDiscovery> {
        if !cfg.nvme_enabled() {
            return Ok(StorageDiscovery::default());
        }
        async {
            let path = cfg.nvme_namespace_path();
            if !self
                .backend
                .nvme_namespace_exists(&path)
                .await
                .context("nvme_namespace_exists")?
            {
                debug!("NVMe namespace {} not present", path);
                return Ok(StorageDiscovery::default());
            }
            let info = self
                .backend
                .nvme_namespace_get_info(&path)
                .await
                .context("nvme_namespace_get_info")?;
            Ok(StorageDiscovery {
                nvme_size: Some(info.size_gib()),
                nvme_targets: Some(self.discover_targets(cfg).await?),
                ..Default::default()
            })
        }
        .await
        .context("discover_nvme_storage")
    }

    /// Remove the namespace and its subsystem
    pub async fn delete(&self, cfg: &NodeStorageConfig) -> Result<()> {
        if !cfg.nvme_enabled() {
            return Ok(());
        }
        async {
            self.remove_namespace(&cfg.nvme_namespace_path()).await?;
            let subsystem = &cfg.storage.data_nvme.subsystem;
            if self
                .backend
                .nvme_subsystem_exists(subsystem)
                .await
                .context("nvme_subsystem_exists")?
            {
                info!("Deleting NVMe subsystem: {}", subsystem);
                self.backend
                    .nvme_subsystem_destroy(subsystem)
                    .await
                    .context("nvme_subsystem_destroy")?;
            }
            Ok(())
        }
        .await
        .context("delete_nvme_storage")
    }

    /// Current namespace size in GiB, `None` when NVMe is off or absent
    pub async fn current_size_gib(&self, cfg: &NodeStorageConfig) -> Result<Option<u64>> {
        if !cfg.nvme_enabled() {
            return Ok(None);
        }
        let path = cfg.nvme_namespace_path();
        if !self
            .backend
            .nvme_namespace_exists(&path)
            .await
            .context("nvme_namespace_exists")?
        {
            return Ok(None);
        }
        let info = self
            .backend
            .nvme_namespace_get_info(&path)
            .await
            .context("nvme_namespace_get_info")?;
        Ok(Some(info.size_gib()))
    }

    /// Grow the namespace to the requested size
    pub async fn grow(&self, cfg: &NodeStorageConfig) -> Result<()> {
        let path = cfg.nvme_namespace_path();
        info!(
            "Resizing NVMe namespace: {} to {}GiB",
            path, cfg.storage.data_nvme.size
        );
        self.backend
            .nvme_namespace_resize(&path, gib_to_bytes(cfg.storage.data_nvme.size))
            .await
            .context("nvme_namespace_resize")
    }

    async fn remove_namespace(&self, path: &str) -> Result<()> {
        if !self
            .backend
            .nvme_namespace_exists(path)
            .await
            .context("nvme_namespace_exists")?
        {
            return Ok(());
        }
        if self
            .backend
            .nvme_namespace_is_mapped(path)
            .await
            .context("nvme_namespace_is_mapped")?
        {
            info!("Unmapping NVMe namespace: {}", path);
            self.backend
                .nvme_namespace_unmap(path)
                .await
                .context("nvme_namespace_unmap")?;
        }
        info!("Deleting NVMe namespace: {}", path);
        self.backend
            .nvme_namespace_destroy(path)
            .await
            .context("nvme_namespace_destroy")
    }

    async fn discover_targets(&self, cfg: &NodeStorageConfig) -> Result<Vec<NvmeTarget>> {
        let subsystem = &cfg.storage.data_nvme.subsystem;
        let path = cfg.nvme_namespace_path();
        let target_nqn = self
            .backend
            .nvme_target_nqn(subsystem)
            .await
            .context("nvme_target_nqn")?;

        let mut targets = Vec::with_capacity(cfg.network.nvme_host.len());
        for host in &cfg.network.nvme_host {
            let subnet = &host.interface.subnet;
            let interfaces = self
                .backend
                .discover_nvme_lifs(&path, subnet)
                .await
                .context("discover_nvme_lifs")?;
            if interfaces.is_empty() {
                return Err(Error::UnreachableFabric {
                    protocol: "NVMe".into(),
                    target: target_nqn,
                    subnet: subnet.clone(),
                });
            }
            debug!("NVMe host {} reaches {:?}", host.host_nqn, interfaces);
            targets.push(NvmeTarget {
                target_nqn: target_nqn.clone(),
                interfaces,
            });
        }
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NvmeHost;
    use crate::controlplane::backends::{LifProtocol, MemoryBackend};
    use crate::domain::ports::{StorageBackend, GIB};
    use crate::error::ErrorClass;
    use std::sync::Arc;

    fn node() -> NodeStorageConfig {
        let mut cfg = NodeStorageConfig::default();
        cfg.compute.host_name = "node1".into();
        cfg.storage.volume_name = "node1_iboot".into();
        cfg.storage.data_nvme.namespace = "node1_nvme".into();
        cfg.storage.data_nvme.subsystem = "node1_nvme".into();
        cfg.storage.data_nvme.size = 50;
        let mut host = NvmeHost::default();
        host.host_nqn = "nqn.2014-08.org.nvmexpress:uuid:node1".into();
        host.interface.subnet = "10.1.0.0/24".into();
        cfg.network.nvme_host.push(host);
        cfg
    }

    async fn array() -> Arc<MemoryBackend> {
        let backend = Arc::new(
            MemoryBackend::new("svm1")
                .with_aggregate("aggr1", 500)
                .with_lif("10.1.0.10", LifProtocol::NvmeTcp),
        );
        backend
            .volume_create_san("node1_iboot", "aggr1", 200 * GIB)
            .await
            .unwrap();
        backend
    }

    #[tokio::test]
    async fn test_disabled_is_noop() {
        let backend = array().await;
        let mut cfg = node();
        cfg.network.nvme_host.clear();
        backend.reset_calls();

        let nvme = NvmeStorage::new(backend.clone());
        assert_eq!(nvme.create(&cfg).await.unwrap(), StorageDiscovery::default());
        nvme.delete(&cfg).await.unwrap();
        nvme.preflight(&cfg).await.unwrap();
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_maps_namespace_and_registers_host() {
        let backend = array().await;
        let cfg = node();
        let nvme = NvmeStorage::new(backend.clone());

        let discovery = nvme.create(&cfg).await.unwrap();
        let path = "/vol/node1_iboot/node1_nvme";
        assert_eq!(backend.namespace_size(path), Some(50 * GIB));
        assert_eq!(backend.namespace_subsystem(path).as_deref(), Some("node1_nvme"));
        assert_eq!(
            backend.subsystem_hosts("node1_nvme").unwrap(),
            vec!["nqn.2014-08.org.nvmexpress:uuid:node1".to_string()]
        );
        let targets = discovery.nvme_targets.unwrap();
        assert_eq!(targets[0].interfaces, vec!["10.1.0.10".to_string()]);
        assert!(targets[0].target_nqn.ends_with("subsystem.node1_nvme"));
    }

    #[tokio::test]
    async fn test_create_always_recreates() {
        let backend = array().await;
        let cfg = node();
        let nvme = NvmeStorage::new(backend.clone());
        nvme.create(&cfg).await.unwrap();
        backend.reset_calls();

        nvme.create(&cfg).await.unwrap();
        let mutating = backend.mutating_calls();
        assert!(mutating.iter().any(|c| c.starts_with("nvme_namespace_unmap")));
        assert!(mutating.iter().any(|c| c.starts_with("nvme_namespace_destroy")));
        assert!(mutating.iter().any(|c| c.starts_with("nvme_subsystem_destroy")));
        assert!(mutating.iter().any(|c| c.starts_with("nvme_namespace_create")));
    }

    #[tokio::test]
    async fn test_unreachable_host_subnet() {
        let backend = array().await;
        let mut cfg = node();
        cfg.network.nvme_host[0].interface.subnet = "10.9.0.0/24".into();

        let err = NvmeStorage::new(backend).create(&cfg).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::PolicyViolation);
        assert_eq!(err.breadcrumbs(), vec!["create_nvme_storage"]);
    }

    #[tokio::test]
    async fn test_preflight_requires_nvme_interfaces() {
        let backend = Arc::new(MemoryBackend::new("svm1"));
        let err = NvmeStorage::new(backend).preflight(&node()).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::PolicyViolation);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let backend = array().await;
        let cfg = node();
        let nvme = NvmeStorage::new(backend.clone());
        nvme.create(&cfg).await.unwrap();

        nvme.delete(&cfg).await.unwrap();
        assert_eq!(backend.namespace_size("/vol/node1_iboot/node1_nvme"), None);
        assert_eq!(backend.subsystem_hosts("node1_nvme"), None);

        backend.reset_calls();
        nvme.delete(&cfg).await.unwrap();
        assert!(backend.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn test_discover_reads_size() {
        let backend = array().await;
        let cfg = node();
        let nvme = NvmeStorage::new(backend.clone());
        assert_eq!(nvme.discover(&cfg).await.unwrap(), StorageDiscovery::default());

        nvme.create(&cfg).await.unwrap();
        let discovery = nvme.discover(&cfg).await.unwrap();
        assert_eq!(discovery.nvme_size, Some(50));
        assert_eq!(nvme.current_size_gib(&cfg).await.unwrap(), Some(50));
    }
}
