//! Harvester HCI boot storage profile
//!
//! The installer boots from a bootstrap LUN copied from the image and mapped
//! at LUN id 0, and installs onto a blank boot LUN mapped at id 1. After
//! installation [`BootStorage::remap`] drops everything but the boot LUN and
//! maps it at id 0; the boot LUN is the durable artifact across re-provisioning.

use crate::config::{NodeStorageConfig, Profile, StorageDiscovery};
use crate::controlplane::aggregate::select_aggregate;
use crate::controlplane::boot::{check_lun_ids, BootStorage, NodeSteps};
use crate::controlplane::graph::{bootstrap_graph, LunRole, Resource};
use crate::controlplane::nvme::NvmeStorage;
use crate::domain::ports::StorageBackendRef;
use crate::error::{Error, Result, ResultExt};
use async_trait::async_trait;
use tracing::{debug, info};

/// Bootstrap LUNs are sized at this multiple of the image they are copied from
const BOOTSTRAP_SIZE_FACTOR: u64 = 2;

const TEARDOWN_ROLES: [LunRole; 3] = [LunRole::Boot, LunRole::Bootstrap, LunRole::Seed];

/// Image the bootstrap LUN is copied from, falling back to the boot image
pub fn bootstrap_image(cfg: &NodeStorageConfig) -> &str {
    let bootstrap = &cfg.storage.bootstrap_lun.os_image.name;
    if bootstrap.is_empty() {
        &cfg.storage.boot_lun.os_image.name
    } else {
        bootstrap
    }
}

/// Boot storage for Harvester nodes
pub struct HarvesterBootStorage {
    backend: StorageBackendRef,
    nvme: NvmeStorage,
}

impl HarvesterBootStorage {
    pub fn new(backend: StorageBackendRef) -> Self {
        Self {
            nvme: NvmeStorage::new(backend.clone()),
            backend,
        }
    }

    fn steps<'a>(&'a self, cfg: &'a NodeStorageConfig) -> NodeSteps<'a> {
        NodeSteps::new(self.backend.as_ref(), cfg, Profile::Harvester)
    }

    async fn converge(&self, cfg: &NodeStorageConfig) -> Result<StorageDiscovery> {
        check_lun_ids(Profile::Harvester, cfg)?;
        let steps = self.steps(cfg);
        let boot_gib = cfg.storage.boot_lun.lun.size;
        let aggregate = select_aggregate(self.backend.as_ref(), boot_gib)
            .await
            .context("select_aggregate")?;

        let image = steps.require_image(bootstrap_image(cfg)).await?;
        let image_info = self
            .backend
            .lun_get_info(&image)
            .await
            .context("lun_get_info")?;
        let bootstrap_gib = image_info.size_gib() * BOOTSTRAP_SIZE_FACTOR;

        let mut targets = None;
        for resource in bootstrap_graph().create_order()? {
            match resource {
                Resource::Volume => steps.ensure_volume(&aggregate, boot_gib).await?,
                Resource::Igroup => steps.ensure_igroup().await?,
                Resource::Lun(LunRole::Bootstrap) => {
                    steps
                        .ensure_copied(LunRole::Bootstrap, &image, bootstrap_gib)
                        .await?
                }
                Resource::Lun(role) => steps.ensure_created(role, boot_gib).await?,
                Resource::LunMap(role) => steps.ensure_mapped(role).await?,
                Resource::IscsiTargets => {
                    targets = Some(steps.discover_iscsi_targets(&cfg.boot_lun_path()).await?)
                }
            }
        }

        Ok(StorageDiscovery {
            svm_name: Some(self.backend.svm_name().to_string()),
            iscsi_targets: targets,
            bootstrap_lun_size: Some(bootstrap_gib),
            ..Default::default()
        })
    }

    async fn check(&self, cfg: &NodeStorageConfig) -> Result<()> {
        check_lun_ids(Profile::Harvester, cfg)?;
        let steps = self.steps(cfg);
        let image = bootstrap_image(cfg);
        select_aggregate(self.backend.as_ref(), cfg.storage.boot_lun.lun.size)
            .await
            .context("select_aggregate")?;
        steps.require_image_listed(image).await?;
        steps
            .discover_iscsi_targets(&cfg.image_lun_path(image))
            .await?;
        Ok(())
    }

    async fn read_back(&self, cfg: &NodeStorageConfig) -> Result<Option<StorageDiscovery>> {
        let steps = self.steps(cfg);
        let backend = self.backend.as_ref();
        if !backend
            .volume_exists(&cfg.storage.volume_name)
            .await
            .context("volume_exists")?
            || !backend
                .lun_exists(&cfg.boot_lun_path())
                .await
                .context("lun_exists")?
        {
            debug!("Boot storage of {} not present", cfg.compute.host_name);
            return Ok(None);
        }

        let boot = backend
            .lun_get_info(&cfg.boot_lun_path())
            .await
            .context("lun_get_info")?;
        let mut discovery = StorageDiscovery {
            svm_name: Some(backend.svm_name().to_string()),
            boot_lun_size: Some(boot.size_gib()),
            os_image: (!boot.comment.is_empty()).then(|| boot.comment.clone()),
            ..Default::default()
        };
        if backend
            .lun_exists(&cfg.bootstrap_lun_path())
            .await
            .context("lun_exists")?
        {
            discovery.bootstrap_lun_size = Some(steps.lun_size_gib(LunRole::Bootstrap).await?);
        }
        discovery.iscsi_targets = Some(steps.discover_iscsi_targets(&cfg.boot_lun_path()).await?);
        discovery.snapshots = Some(steps.snapshots().await?);
        Ok(Some(discovery))
    }

    async fn keep_boot(&self, cfg: &NodeStorageConfig) -> Result<()> {
        let steps = self.steps(cfg);
        let backend = self.backend.as_ref();
        let igroup = &cfg.storage.igroup_name;
        let boot_path = cfg.boot_lun_path();

        steps
            .teardown(&[LunRole::Bootstrap, LunRole::Seed], false, &self.nvme)
            .await?;
        if !backend.lun_exists(&boot_path).await.context("lun_exists")? {
            return Err(Error::not_found("boot LUN", boot_path));
        }
        if backend.igroup_exists(igroup).await.context("igroup_exists")? {
            info!("Unmapping boot LUN: {} from {}", boot_path, igroup);
            backend
                .lun_unmap(&boot_path, igroup)
                .await
                .context("lun_unmap")?;
        }
        info!("Mapping boot LUN: {} -> {} (id 0)", boot_path, igroup);
        backend
            .lun_map(&boot_path, 0, igroup)
            .await
            .context("lun_map")
    }
}

#[async_trait]
impl BootStorage for HarvesterBootStorage {
    fn profile(&self) -> Profile {
        Profile::Harvester
    }

    async fn preflight(&self, cfg: &NodeStorageConfig) -> Result<()> {
        self.check(cfg)
            .await
            .context("create_harvester_storage_preflight")
    }

    async fn create(&self, cfg: &NodeStorageConfig) -> Result<StorageDiscovery> {
        info!("Creating Harvester storage: {}", cfg.compute.host_name);
        self.converge(cfg).await.context("create_harvester_storage")
    }

    async fn discover(&self, cfg: &NodeStorageConfig) -> Result<Option<StorageDiscovery>> {
        self.read_back(cfg).await.context("discover_harvester_storage")
    }

    async fn delete(&self, cfg: &NodeStorageConfig) -> Result<()> {
        info!("Deleting Harvester storage: {}", cfg.compute.host_name);
        self.steps(cfg)
            .teardown(&TEARDOWN_ROLES, true, &self.nvme)
            .await
            .context("delete_harvester_storage")
    }

    async fn remap(&self, cfg: &NodeStorageConfig) -> Result<()> {
        info!("Remapping Harvester storage: {}", cfg.compute.host_name);
        self.keep_boot(cfg).await.context("remap_harvester_storage")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::boot::tests::{array, node};
    use crate::domain::ports::GIB;
    use crate::error::ErrorClass;
    use assert_matches::assert_matches;

    fn harvester_node() -> NodeStorageConfig {
        let mut cfg = node();
        cfg.storage.boot_lun.lun.size = 100;
        cfg.storage.boot_lun.lun.id = 1;
        cfg.storage.boot_lun.os_image.name = "harvester-1.2".into();
        cfg.storage.bootstrap_lun.lun.id = 0;
        cfg
    }

    #[tokio::test]
    async fn test_create_bootstrap_and_boot() {
        let backend = array();
        let cfg = harvester_node();
        let storage = HarvesterBootStorage::new(backend.clone());

        let discovery = storage.create(&cfg).await.unwrap();
        assert_eq!(backend.volume_size("node1_iboot"), Some(200 * GIB));

        let bootstrap = backend.lun("/vol/node1_iboot/node1_bootstrap").unwrap();
        assert_eq!(bootstrap.size_bytes, 8 * GIB);
        assert_eq!(bootstrap.maps.get("node1_iboot"), Some(&0));
        let boot = backend.lun("/vol/node1_iboot/node1_iboot").unwrap();
        assert_eq!(boot.size_bytes, 100 * GIB);
        assert_eq!(boot.maps.get("node1_iboot"), Some(&1));
        assert!(boot.comment.is_empty());

        assert_eq!(discovery.bootstrap_lun_size, Some(8));
        assert_eq!(discovery.iscsi_targets.unwrap().len(), 2);

        backend.reset_calls();
        assert_eq!(storage.create(&cfg).await.unwrap().bootstrap_lun_size, Some(8));
        assert!(backend.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_with_default_lun_ids() {
        let backend = array();
        let mut cfg = node();
        cfg.storage.boot_lun.lun.size = 100;
        cfg.storage.boot_lun.os_image.name = "harvester-1.2".into();
        assert_eq!(cfg.storage.boot_lun.lun.id, cfg.storage.bootstrap_lun.lun.id);

        HarvesterBootStorage::new(backend.clone())
            .create(&cfg)
            .await
            .unwrap();

        let bootstrap = backend.lun("/vol/node1_iboot/node1_bootstrap").unwrap();
        assert_eq!(bootstrap.maps.get("node1_iboot"), Some(&0));
        let boot = backend.lun("/vol/node1_iboot/node1_iboot").unwrap();
        assert_eq!(boot.maps.get("node1_iboot"), Some(&1));
    }

    #[tokio::test]
    async fn test_seed_id_colliding_with_boot_rejected() {
        let backend = array();
        let mut cfg = harvester_node();
        cfg.storage.seed_lun.lun.id = 1;
        let storage = HarvesterBootStorage::new(backend.clone());

        let err = storage.preflight(&cfg).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Configuration);
        let err = storage.create(&cfg).await.unwrap_err();
        assert_matches!(err.root(), Error::Configuration(_));
        assert!(backend.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_image() {
        let backend = array();
        let mut cfg = harvester_node();
        cfg.storage.bootstrap_lun.os_image.name = "harvester-9".into();

        let storage = HarvesterBootStorage::new(backend.clone());
        let err = storage.create(&cfg).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::NotFound);
        assert!(backend.mutating_calls().is_empty());

        let err = storage.preflight(&cfg).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::NotFound);
    }

    #[tokio::test]
    async fn test_remap_keeps_boot_lun() {
        let backend = array();
        let cfg = harvester_node();
        let storage = HarvesterBootStorage::new(backend.clone());
        storage.create(&cfg).await.unwrap();

        storage.remap(&cfg).await.unwrap();
        assert!(backend.lun("/vol/node1_iboot/node1_bootstrap").is_none());
        let boot = backend.lun("/vol/node1_iboot/node1_iboot").unwrap();
        assert_eq!(boot.maps.get("node1_iboot"), Some(&0));

        storage.remap(&cfg).await.unwrap();
        let boot = backend.lun("/vol/node1_iboot/node1_iboot").unwrap();
        assert_eq!(boot.maps.get("node1_iboot"), Some(&0));
    }

    #[tokio::test]
    async fn test_remap_without_boot_lun() {
        let backend = array();
        let err = HarvesterBootStorage::new(backend)
            .remap(&harvester_node())
            .await
            .unwrap_err();
        assert_matches!(err.root(), Error::NotFound { kind, .. } if kind == "boot LUN");
    }

    #[tokio::test]
    async fn test_discover_and_delete() {
        let backend = array();
        let cfg = harvester_node();
        let storage = HarvesterBootStorage::new(backend.clone());
        assert_eq!(storage.discover(&cfg).await.unwrap(), None);

        storage.create(&cfg).await.unwrap();
        let discovery = storage.discover(&cfg).await.unwrap().unwrap();
        assert_eq!(discovery.boot_lun_size, Some(100));
        assert_eq!(discovery.bootstrap_lun_size, Some(8));
        assert_eq!(discovery.os_image, None);
        assert_eq!(discovery.snapshots, Some(Vec::new()));

        storage.delete(&cfg).await.unwrap();
        assert_eq!(backend.volume_size("node1_iboot"), None);
        assert_eq!(backend.igroup_initiators("node1_iboot"), None);
        backend.reset_calls();
        storage.delete(&cfg).await.unwrap();
        assert!(backend.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn test_resize_not_supported() {
        let backend = array();
        let err = HarvesterBootStorage::new(backend)
            .resize(&harvester_node())
            .await
            .unwrap_err();
        assert_matches!(err, Error::Configuration(_));
    }
}
