//! Boot storage reconciler
//!
//! Converges the per-node resource graph (volume, igroup, LUNs, mappings,
//! iSCSI targets) toward the record's desired state. Every step checks
//! existence first, creates only what is absent and maps only what is
//! unmapped, so any operation can be re-run after a partial failure.
//!
//! [`BootStorage`] is the seam between profiles: [`ClassicBootStorage`] here,
//! and the bootstrap profile in [`crate::controlplane::platform`].

use crate::config::{IscsiTarget, LunSpec, NodeStorageConfig, Profile, RemoteFile, StorageDiscovery, base_name};
use crate::controlplane::aggregate::{select_aggregate, volume_size_gib};
use crate::controlplane::graph::{classic_graph, teardown_graph, LunRole, Resource};
use crate::controlplane::nvme::NvmeStorage;
use crate::domain::ports::{gib_to_bytes, StorageBackend, StorageBackendRef};
use crate::error::{Error, Result, ResultExt};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Boot Storage Port
// =============================================================================

/// Lifecycle of one node's boot storage under a given profile
#[async_trait]
pub trait BootStorage: Send + Sync {
    fn profile(&self) -> Profile;

    /// Validate capacity, image presence and fabric reachability without
    /// changing array state
    async fn preflight(&self, cfg: &NodeStorageConfig) -> Result<()>;

    /// Converge the resource graph and discover targets
    async fn create(&self, cfg: &NodeStorageConfig) -> Result<StorageDiscovery>;

    /// Read back observed state; `None` when the node's storage is absent
    async fn discover(&self, cfg: &NodeStorageConfig) -> Result<Option<StorageDiscovery>>;

    /// Tear down LUNs, igroup and volume
    async fn delete(&self, cfg: &NodeStorageConfig) -> Result<()>;

    /// Grow LUNs and volume; shrinking is refused
    async fn resize(&self, _cfg: &NodeStorageConfig) -> Result<StorageDiscovery> {
        Err(unsupported(self.profile(), "resize"))
    }

    /// Remove LUNs while keeping the volume and its snapshots
    async fn delete_luns(&self, _cfg: &NodeStorageConfig) -> Result<()> {
        Err(unsupported(self.profile(), "delete_luns"))
    }

    /// Re-create mappings removed behind the reconciler's back
    async fn restore_mapping(&self, _cfg: &NodeStorageConfig) -> Result<()> {
        Err(unsupported(self.profile(), "restore_mapping"))
    }

    /// Keep only the boot LUN, mapped at LUN id 0
    async fn remap(&self, _cfg: &NodeStorageConfig) -> Result<()> {
        Err(unsupported(self.profile(), "remap"))
    }
}

pub type BootStorageRef = Arc<dyn BootStorage>;

fn unsupported(profile: Profile, operation: &str) -> Error {
    Error::Configuration(format!(
        "{} is not supported by the {} profile",
        operation, profile
    ))
}

// =============================================================================
// Shared Steps
// =============================================================================

/// LUN settings for a role
pub fn lun_spec(cfg: &NodeStorageConfig, role: LunRole) -> &LunSpec {
    match role {
        LunRole::Boot => &cfg.storage.boot_lun.lun,
        LunRole::Data => &cfg.storage.data_lun,
        LunRole::Seed => &cfg.storage.seed_lun.lun,
        LunRole::Bootstrap => &cfg.storage.bootstrap_lun.lun,
    }
}

/// LUN path for a role
pub fn lun_path_of(cfg: &NodeStorageConfig, role: LunRole) -> String {
    match role {
        LunRole::Boot => cfg.boot_lun_path(),
        LunRole::Data => cfg.data_lun_path(),
        LunRole::Seed => cfg.seed_lun_path(),
        LunRole::Bootstrap => cfg.bootstrap_lun_path(),
    }
}

/// LUN id a role is mapped at under `profile`
///
/// Boot and bootstrap ids are fixed by the profile; data and seed ids come
/// from the record.
pub fn lun_id(profile: Profile, cfg: &NodeStorageConfig, role: LunRole) -> u32 {
    match (profile, role) {
        (Profile::Classic, LunRole::Boot) => 0,
        (Profile::Harvester, LunRole::Bootstrap) => 0,
        (Profile::Harvester, LunRole::Boot) => 1,
        (_, role) => lun_spec(cfg, role).id,
    }
}

/// Fail when two LUNs mapped under `profile` would share a LUN id
pub fn check_lun_ids(profile: Profile, cfg: &NodeStorageConfig) -> Result<()> {
    let mut roles = match profile {
        Profile::Classic => vec![LunRole::Boot],
        Profile::Harvester => vec![LunRole::Bootstrap, LunRole::Boot],
    };
    if cfg.storage.data_lun.size > 0 {
        roles.push(LunRole::Data);
    }
    roles.push(LunRole::Seed);

    let mut taken: Vec<(u32, LunRole)> = Vec::with_capacity(roles.len());
    for role in roles {
        let id = lun_id(profile, cfg, role);
        if let Some((_, other)) = taken.iter().find(|(used, _)| *used == id) {
            return Err(Error::Configuration(format!(
                "{} LUN id {} is already used by the {} LUN under the {} profile",
                role, id, other, profile
            )));
        }
        taken.push((id, role));
    }
    Ok(())
}

/// Graph steps shared by every profile, bound to one backend and record
pub(crate) struct NodeSteps<'a> {
    pub backend: &'a dyn StorageBackend,
    pub cfg: &'a NodeStorageConfig,
    pub profile: Profile,
}

impl<'a> NodeSteps<'a> {
    pub fn new(backend: &'a dyn StorageBackend, cfg: &'a NodeStorageConfig, profile: Profile) -> Self {
        Self { backend, cfg, profile }
    }

    /// Create the volume on `aggregate` when absent
    pub async fn ensure_volume(&self, aggregate: &str, luns_gib: u64) -> Result<()> {
        let volume = &self.cfg.storage.volume_name;
        if self.backend.volume_exists(volume).await.context("volume_exists")? {
            debug!("Volume {} exists", volume);
            return Ok(());
        }
        let size_gib = volume_size_gib(luns_gib);
        info!("Creating volume: {} ({}GiB on {})", volume, size_gib, aggregate);
        self.backend
            .volume_create_san(volume, aggregate, gib_to_bytes(size_gib))
            .await
            .context("volume_create_san")
    }

    /// Create the igroup when absent and register every initiator in it
    pub async fn ensure_igroup(&self) -> Result<()> {
        let igroup = &self.cfg.storage.igroup_name;
        if self.backend.igroup_exists(igroup).await.context("igroup_exists")? {
            debug!("Igroup {} exists", igroup);
            return Ok(());
        }
        info!("Creating igroup: {}", igroup);
        self.backend
            .igroup_create(igroup)
            .await
            .context("igroup_create")?;
        for initiator in &self.cfg.network.iscsi_initiator {
            debug!("Adding initiator {} to {}", initiator.initiator_name, igroup);
            self.backend
                .igroup_add_initiator(igroup, &initiator.initiator_name)
                .await
                .context("igroup_add_initiator")?;
        }
        Ok(())
    }

    /// Path of `image` in the image repository; fails when the image LUN is absent
    pub async fn require_image(&self, image: &str) -> Result<String> {
        let path = self.cfg.image_lun_path(image);
        if !self.backend.lun_exists(&path).await.context("lun_exists")? {
            return Err(Error::not_found("OS image", path));
        }
        Ok(path)
    }

    /// Fail unless `image` is listed in the image repository
    pub async fn require_image_listed(&self, image: &str) -> Result<()> {
        let repo = &self.cfg.storage.image_repo_name;
        if !self.backend.volume_exists(repo).await.context("volume_exists")? {
            return Err(Error::not_found("image repository", repo.as_str()));
        }
        let images = self.backend.lun_list(repo).await.context("lun_list")?;
        if !images.iter().any(|i| i == image) {
            return Err(Error::not_found("OS image", image));
        }
        Ok(())
    }

    /// Copy `image` into the role's LUN and size it, when the LUN is absent
    pub async fn ensure_copied(&self, role: LunRole, image_path: &str, size_gib: u64) -> Result<()> {
        let path = lun_path_of(self.cfg, role);
        if self.backend.lun_exists(&path).await.context("lun_exists")? {
            debug!("LUN {} exists", path);
            return Ok(());
        }
        info!("Copying {} LUN: {} -> {}", role, image_path, path);
        self.backend
            .lun_copy(image_path, &path)
            .await
            .context("lun_copy")?;
        info!("Resizing {} LUN: {} to {}GiB", role, path, size_gib);
        self.backend
            .lun_resize(&path, gib_to_bytes(size_gib))
            .await
            .context("lun_resize")
    }

    /// Create a blank LUN for the role when absent
    pub async fn ensure_created(&self, role: LunRole, size_gib: u64) -> Result<()> {
        let path = lun_path_of(self.cfg, role);
        if self.backend.lun_exists(&path).await.context("lun_exists")? {
            debug!("LUN {} exists", path);
            return Ok(());
        }
        info!("Creating {} LUN: {} ({}GiB)", role, path, size_gib);
        self.backend
            .lun_create(&path, gib_to_bytes(size_gib))
            .await
            .context("lun_create")
    }

    /// Map the role's LUN at its profile id when not mapped
    pub async fn ensure_mapped(&self, role: LunRole) -> Result<()> {
        let path = lun_path_of(self.cfg, role);
        let igroup = &self.cfg.storage.igroup_name;
        if self
            .backend
            .lun_is_mapped(&path, igroup)
            .await
            .context("lun_is_mapped")?
        {
            debug!("LUN {} already mapped to {}", path, igroup);
            return Ok(());
        }
        let id = lun_id(self.profile, self.cfg, role);
        info!("Mapping {} LUN: {} -> {} (id {})", role, path, igroup, id);
        self.backend
            .lun_map(&path, id, igroup)
            .await
            .context("lun_map")
    }

    /// Map the role's LUN when it exists but is unmapped
    pub async fn restore_mapped(&self, role: LunRole) -> Result<()> {
        let path = lun_path_of(self.cfg, role);
        if !self.backend.lun_exists(&path).await.context("lun_exists")? {
            return Ok(());
        }
        self.ensure_mapped(role).await
    }

    /// Target node name and per-initiator interfaces serving `lun_path`
    pub async fn discover_iscsi_targets(&self, lun_path: &str) -> Result<Vec<IscsiTarget>> {
        let node_name = self
            .backend
            .iscsi_target_name()
            .await
            .context("iscsi_target_name")?;
        let mut targets = Vec::with_capacity(self.cfg.network.iscsi_initiator.len());
        for initiator in &self.cfg.network.iscsi_initiator {
            let subnet = &initiator.interface.subnet;
            let interfaces = self
                .backend
                .discover_iscsi_lifs(lun_path, subnet)
                .await
                .context("discover_iscsi_lifs")?;
            if interfaces.is_empty() {
                return Err(Error::UnreachableFabric {
                    protocol: "iSCSI".into(),
                    target: node_name,
                    subnet: subnet.clone(),
                });
            }
            debug!("Initiator {} reaches {:?}", initiator.initiator_name, interfaces);
            targets.push(IscsiTarget {
                node_name: node_name.clone(),
                interfaces,
            });
        }
        Ok(targets)
    }

    /// Size of the role's LUN in GiB
    pub async fn lun_size_gib(&self, role: LunRole) -> Result<u64> {
        let info = self
            .backend
            .lun_get_info(&lun_path_of(self.cfg, role))
            .await
            .context("lun_get_info")?;
        Ok(info.size_gib())
    }

    /// Unmap and destroy the LUNs of `roles` in reverse dependency order.
    ///
    /// With `containers` set the igroup and volume are destroyed as well, the
    /// NVMe storage going just before the volume.
    pub async fn teardown(&self, roles: &[LunRole], containers: bool, nvme: &NvmeStorage) -> Result<()> {
        let igroup = &self.cfg.storage.igroup_name;
        let volume = &self.cfg.storage.volume_name;
        let igroup_exists = self.backend.igroup_exists(igroup).await.context("igroup_exists")?;

        for resource in teardown_graph(roles).delete_order()? {
            match resource {
                Resource::LunMap(role) => {
                    let path = lun_path_of(self.cfg, role);
                    if igroup_exists && self.backend.lun_exists(&path).await.context("lun_exists")? {
                        info!("Unmapping {} LUN: {} from {}", role, path, igroup);
                        self.backend
                            .lun_unmap(&path, igroup)
                            .await
                            .context("lun_unmap")?;
                    }
                }
                Resource::Lun(role) => {
                    let path = lun_path_of(self.cfg, role);
                    if self.backend.lun_exists(&path).await.context("lun_exists")? {
                        info!("Deleting {} LUN: {}", role, path);
                        self.backend
                            .lun_destroy(&path)
                            .await
                            .context("lun_destroy")?;
                    }
                }
                Resource::Igroup if containers && igroup_exists => {
                    info!("Deleting igroup: {}", igroup);
                    self.backend
                        .igroup_destroy(igroup)
                        .await
                        .context("igroup_destroy")?;
                }
                Resource::Volume if containers => {
                    if self.backend.volume_exists(volume).await.context("volume_exists")? {
                        nvme.delete(self.cfg).await?;
                        info!("Deleting volume: {}", volume);
                        self.backend
                            .volume_destroy(volume)
                            .await
                            .context("volume_destroy")?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Snapshots of the node volume
    pub async fn snapshots(&self) -> Result<Vec<String>> {
        self.backend
            .snapshot_list(&self.cfg.storage.volume_name)
            .await
            .context("snapshot_list")
    }
}

// =============================================================================
// Classic Profile
// =============================================================================

/// Boot LUN copied from an OS image at LUN id 0, optional data LUN
pub struct ClassicBootStorage {
    backend: StorageBackendRef,
    nvme: NvmeStorage,
}

impl ClassicBootStorage {
    pub fn new(backend: StorageBackendRef) -> Self {
        Self {
            nvme: NvmeStorage::new(backend.clone()),
            backend,
        }
    }

    fn steps<'a>(&'a self, cfg: &'a NodeStorageConfig) -> NodeSteps<'a> {
        NodeSteps::new(self.backend.as_ref(), cfg, Profile::Classic)
    }

    /// GiB of LUNs the volume holds
    fn luns_gib(cfg: &NodeStorageConfig) -> u64 {
        cfg.storage.boot_lun.lun.size + cfg.storage.data_lun.size + cfg.nvme_headroom_gib()
    }

    async fn converge(&self, cfg: &NodeStorageConfig) -> Result<StorageDiscovery> {
        check_lun_ids(Profile::Classic, cfg)?;
        let steps = self.steps(cfg);
        let boot = &cfg.storage.boot_lun;
        let luns_gib = Self::luns_gib(cfg);
        let aggregate = select_aggregate(self.backend.as_ref(), luns_gib)
            .await
            .context("select_aggregate")?;

        let graph = classic_graph(cfg.storage.data_lun.size > 0);
        let mut targets = None;
        for resource in graph.create_order()? {
            match resource {
                Resource::Volume => steps.ensure_volume(&aggregate, luns_gib).await?,
                Resource::Igroup => steps.ensure_igroup().await?,
                Resource::Lun(LunRole::Boot) => {
                    if !self
                        .backend
                        .lun_exists(&cfg.boot_lun_path())
                        .await
                        .context("lun_exists")?
                    {
                        let image = steps.require_image(&boot.os_image.name).await?;
                        steps.ensure_copied(LunRole::Boot, &image, boot.lun.size).await?;
                    }
                }
                Resource::Lun(role) => {
                    steps
                        .ensure_created(role, lun_spec(cfg, role).size)
                        .await?
                }
                Resource::LunMap(role) => steps.ensure_mapped(role).await?,
                Resource::IscsiTargets => {
                    targets = Some(steps.discover_iscsi_targets(&cfg.boot_lun_path()).await?)
                }
            }
        }

        Ok(StorageDiscovery {
            svm_name: Some(self.backend.svm_name().to_string()),
            iscsi_targets: targets,
            ..Default::default()
        })
    }

    async fn check(&self, cfg: &NodeStorageConfig) -> Result<()> {
        check_lun_ids(Profile::Classic, cfg)?;
        let steps = self.steps(cfg);
        let image = &cfg.storage.boot_lun.os_image.name;
        select_aggregate(self.backend.as_ref(), Self::luns_gib(cfg))
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
        {
            return Ok(None);
        }
        for role in [LunRole::Boot, LunRole::Seed] {
            let path = lun_path_of(cfg, role);
            if !backend.lun_exists(&path).await.context("lun_exists")? {
                debug!("{} LUN {} not present", role, path);
                return Ok(None);
            }
        }

        let mut discovery = StorageDiscovery {
            svm_name: Some(backend.svm_name().to_string()),
            ..Default::default()
        };

        let boot = backend
            .lun_get_info(&cfg.boot_lun_path())
            .await
            .context("lun_get_info")?;
        if !boot.comment.is_empty() {
            discovery.os_image = Some(boot.comment.clone());
        }
        discovery.boot_lun_size = Some(boot.size_gib());

        if cfg.storage.data_lun.size > 0 {
            match backend.lun_get_info(&cfg.data_lun_path()).await {
                Ok(data) => discovery.data_lun_size = Some(data.size_gib()),
                Err(e) => warn!("Ignoring data LUN read-back failure: {}", e),
            }
        }

        let seed = backend
            .lun_get_info(&cfg.seed_lun_path())
            .await
            .context("lun_get_info")?;
        if !seed.comment.is_empty() {
            discovery.seed_template = Some(RemoteFile {
                name: base_name(&seed.comment).to_string(),
                location: seed.comment.clone(),
            });
        }

        discovery.iscsi_targets = Some(steps.discover_iscsi_targets(&cfg.boot_lun_path()).await?);
        discovery = discovery.merge(self.nvme.discover(cfg).await?);
        discovery.snapshots = Some(steps.snapshots().await?);
        Ok(Some(discovery))
    }

    async fn grow(&self, cfg: &NodeStorageConfig) -> Result<StorageDiscovery> {
        let steps = self.steps(cfg);
        let requested_boot = cfg.storage.boot_lun.lun.size;
        let requested_data = cfg.storage.data_lun.size;
        let requested_nvme = cfg.storage.data_nvme.size;

        let current_boot = steps.lun_size_gib(LunRole::Boot).await?;
        refuse_shrink("boot LUN", &cfg.boot_lun_path(), current_boot, requested_boot)?;

        // Resize never creates a data LUN
        let mut current_data = 0;
        if requested_data > 0 {
            let path = cfg.data_lun_path();
            if !self.backend.lun_exists(&path).await.context("lun_exists")? {
                return Err(Error::not_found("data LUN", path));
            }
            current_data = steps.lun_size_gib(LunRole::Data).await?;
            refuse_shrink("data LUN", &cfg.data_lun_path(), current_data, requested_data)?;
        }

        let current_nvme = self.nvme.current_size_gib(cfg).await?.unwrap_or(0);
        if current_nvme > 0 {
            refuse_shrink(
                "NVMe namespace",
                &cfg.nvme_namespace_path(),
                current_nvme,
                requested_nvme,
            )?;
        }

        let grow_boot = requested_boot > current_boot;
        let grow_data = current_data > 0 && requested_data > current_data;
        let grow_nvme = current_nvme > 0 && requested_nvme > current_nvme;
        if grow_boot || grow_data || grow_nvme {
            let size_gib = volume_size_gib(Self::luns_gib(cfg));
            info!(
                "Resizing volume: {} to {}GiB",
                cfg.storage.volume_name, size_gib
            );
            self.backend
                .volume_resize(&cfg.storage.volume_name, gib_to_bytes(size_gib))
                .await
                .context("volume_resize")?;
        }
        if grow_boot {
            info!("Resizing boot LUN: {} to {}GiB", cfg.boot_lun_path(), requested_boot);
            self.backend
                .lun_resize(&cfg.boot_lun_path(), gib_to_bytes(requested_boot))
                .await
                .context("lun_resize")?;
        }
        if grow_data {
            info!("Resizing data LUN: {} to {}GiB", cfg.data_lun_path(), requested_data);
            self.backend
                .lun_resize(&cfg.data_lun_path(), gib_to_bytes(requested_data))
                .await
                .context("lun_resize")?;
        }
        if grow_nvme {
            self.nvme.grow(cfg).await?;
        }

        Ok(StorageDiscovery {
            boot_lun_size: Some(requested_boot.max(current_boot)),
            data_lun_size: (current_data > 0).then(|| requested_data.max(current_data)),
            nvme_size: (current_nvme > 0).then(|| requested_nvme.max(current_nvme)),
            ..Default::default()
        })
    }

    async fn remove_luns(&self, cfg: &NodeStorageConfig) -> Result<()> {
        self.steps(cfg)
            .teardown(&[LunRole::Boot, LunRole::Data, LunRole::Seed], false, &self.nvme)
            .await?;
        let volume = &cfg.storage.volume_name;
        if self.backend.volume_exists(volume).await.context("volume_exists")?
            && self
                .backend
                .file_exists(volume, SEED_FILE)
                .await
                .context("file_exists")?
        {
            info!("Deleting seed image file: {}{}", volume, SEED_FILE);
            self.backend
                .file_delete(volume, SEED_FILE)
                .await
                .context("file_delete")?;
        }
        self.nvme.delete(cfg).await
    }

    async fn remap_existing(&self, cfg: &NodeStorageConfig) -> Result<()> {
        let igroup = &cfg.storage.igroup_name;
        if !self.backend.igroup_exists(igroup).await.context("igroup_exists")? {
            return Err(Error::not_found("igroup", igroup.as_str()));
        }
        let steps = self.steps(cfg);
        for role in [LunRole::Boot, LunRole::Seed, LunRole::Data] {
            steps.restore_mapped(role).await?;
        }
        Ok(())
    }
}

/// File staging the seed image inside the node volume
pub const SEED_FILE: &str = "/seed";

/// Refuse a requested size below the current one
pub fn refuse_shrink(kind: &str, name: &str, current_gib: u64, requested_gib: u64) -> Result<()> {
    if requested_gib < current_gib {
        return Err(Error::ShrinkRefused {
            kind: kind.to_string(),
            name: name.to_string(),
            current_gib,
            requested_gib,
        });
    }
    Ok(())
}

#[async_trait]
impl BootStorage for ClassicBootStorage {
    fn profile(&self) -> Profile {
        Profile::Classic
    }

    async fn preflight(&self, cfg: &NodeStorageConfig) -> Result<()> {
        self.check(cfg).await.context("create_boot_storage_preflight")
    }

    async fn create(&self, cfg: &NodeStorageConfig) -> Result<StorageDiscovery> {
        info!("Creating boot storage: {}", cfg.compute.host_name);
        self.converge(cfg).await.context("create_boot_storage")
    }

    async fn discover(&self, cfg: &NodeStorageConfig) -> Result<Option<StorageDiscovery>> {
        self.read_back(cfg).await.context("discover_boot_storage")
    }

    async fn delete(&self, cfg: &NodeStorageConfig) -> Result<()> {
        info!("Deleting boot storage: {}", cfg.compute.host_name);
        self.steps(cfg)
            .teardown(&[LunRole::Boot, LunRole::Data, LunRole::Seed], true, &self.nvme)
            .await
            .context("delete_boot_storage")
    }

    async fn resize(&self, cfg: &NodeStorageConfig) -> Result<StorageDiscovery> {
        self.grow(cfg).await.context("resize_boot_storage")
    }

    async fn delete_luns(&self, cfg: &NodeStorageConfig) -> Result<()> {
        info!("Deleting boot storage LUNs: {}", cfg.compute.host_name);
        self.remove_luns(cfg).await.context("delete_boot_storage_luns")
    }

    async fn restore_mapping(&self, cfg: &NodeStorageConfig) -> Result<()> {
        self.remap_existing(cfg)
            .await
            .context("restore_boot_storage_lun_mapping")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{IscsiInitiator, NvmeHost};
    use crate::controlplane::backends::{LifProtocol, MemoryBackend};
    use crate::domain::ports::{Outcome, GIB};
    use crate::error::ErrorClass;
    use assert_matches::assert_matches;
    use bytes::Bytes;

    pub(crate) fn node() -> NodeStorageConfig {
        let mut cfg = NodeStorageConfig::default();
        cfg.compute.host_name = "node1".into();
        let storage = &mut cfg.storage;
        storage.image_repo_name = "image_repo".into();
        storage.template_repo_name = "template_repo".into();
        storage.volume_name = "node1_iboot".into();
        storage.igroup_name = "node1_iboot".into();
        storage.boot_lun.lun.name = "node1_iboot".into();
        storage.boot_lun.lun.size = 20;
        storage.boot_lun.os_image.name = "ubuntu-22.04".into();
        storage.data_lun.name = "node1_data".into();
        storage.data_lun.id = 1;
        storage.seed_lun.lun.name = "node1_seed".into();
        storage.seed_lun.lun.id = 2;
        storage.bootstrap_lun.lun.name = "node1_bootstrap".into();
        storage.data_nvme.namespace = "node1_nvme".into();
        storage.data_nvme.subsystem = "node1_nvme".into();
        for (n, subnet) in ["192.168.10.0/24", "192.168.20.0/24"].iter().enumerate() {
            let mut initiator = IscsiInitiator::default();
            initiator.initiator_name = format!("iqn.2005-02.com.open-iscsi:node1.{}", n + 1);
            initiator.interface.subnet = subnet.to_string();
            cfg.network.iscsi_initiator.push(initiator);
        }
        cfg
    }

    pub(crate) fn array() -> Arc<MemoryBackend> {
        Arc::new(
            MemoryBackend::new("svm1")
                .with_aggregate("aggr1", 500)
                .with_lif("192.168.10.5", LifProtocol::Iscsi)
                .with_lif("192.168.20.5", LifProtocol::Iscsi)
                .with_lif("10.1.0.10", LifProtocol::NvmeTcp)
                .with_image_repo("image_repo", &["ubuntu-22.04", "harvester-1.2"], 4),
        )
    }

    fn classic(backend: &Arc<MemoryBackend>) -> ClassicBootStorage {
        ClassicBootStorage::new(backend.clone())
    }

    #[tokio::test]
    async fn test_create_on_empty_array() {
        let backend = array();
        let cfg = node();

        let discovery = classic(&backend).create(&cfg).await.unwrap();

        assert_eq!(backend.volume_size("node1_iboot"), Some(40 * GIB));
        assert_eq!(backend.volume_aggregate("node1_iboot").as_deref(), Some("aggr1"));
        assert_eq!(backend.igroup_initiators("node1_iboot").unwrap().len(), 2);
        let boot = backend.lun("/vol/node1_iboot/node1_iboot").unwrap();
        assert_eq!(boot.size_bytes, 20 * GIB);
        assert_eq!(boot.comment, "ubuntu-22.04");
        assert_eq!(boot.maps.get("node1_iboot"), Some(&0));
        assert!(backend.lun("/vol/node1_iboot/node1_data").is_none());
        assert!(!backend.calls().iter().any(|c| c.contains("node1_data")));

        let targets = discovery.iscsi_targets.unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].interfaces, vec!["192.168.10.5".to_string()]);
        assert_eq!(targets[1].interfaces, vec!["192.168.20.5".to_string()]);
        assert_eq!(discovery.svm_name.as_deref(), Some("svm1"));
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let backend = array();
        let cfg = node();
        let storage = classic(&backend);
        let first = storage.create(&cfg).await.unwrap();
        backend.reset_calls();

        let second = storage.create(&cfg).await.unwrap();
        assert_eq!(first, second);
        assert!(backend.mutating_calls().is_empty(), "{:?}", backend.mutating_calls());
    }

    #[tokio::test]
    async fn test_create_with_data_lun() {
        let backend = array();
        let mut cfg = node();
        cfg.storage.data_lun.size = 30;

        classic(&backend).create(&cfg).await.unwrap();
        assert_eq!(backend.volume_size("node1_iboot"), Some(100 * GIB));
        let data = backend.lun("/vol/node1_iboot/node1_data").unwrap();
        assert_eq!(data.size_bytes, 30 * GIB);
        assert_eq!(data.maps.get("node1_iboot"), Some(&1));
    }

    #[tokio::test]
    async fn test_create_missing_image() {
        let backend = array();
        let mut cfg = node();
        cfg.storage.boot_lun.os_image.name = "rhel-9".into();

        let err = classic(&backend).create(&cfg).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::NotFound);
        assert_eq!(err.breadcrumbs(), vec!["create_boot_storage"]);
    }

    #[tokio::test]
    async fn test_create_insufficient_capacity() {
        let backend = array();
        let mut cfg = node();
        cfg.storage.boot_lun.lun.size = 300;

        let err = classic(&backend).create(&cfg).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Capacity);
        assert!(backend.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_subnet_fails_create() {
        let backend = array();
        let mut cfg = node();
        cfg.network.iscsi_initiator[1].interface.subnet = "172.16.0.0/24".into();

        let err = classic(&backend).create(&cfg).await.unwrap_err();
        assert_matches!(err.root(), Error::UnreachableFabric { subnet, .. } if subnet == "172.16.0.0/24");
    }

    #[tokio::test]
    async fn test_backend_failure_aborts_walk() {
        let backend = array();
        backend.inject_fault("lun_map", Outcome::Fatal, "13001");

        let err = classic(&backend).create(&node()).await.unwrap_err();
        assert_eq!(err.breadcrumbs(), vec!["create_boot_storage", "lun_map"]);
        assert_eq!(err.class(), ErrorClass::Backend(Outcome::Fatal));
        assert!(!backend.calls().iter().any(|c| c.starts_with("iscsi_target_name")));

        backend.clear_faults();
        classic(&backend).create(&node()).await.unwrap();
        assert_eq!(
            backend.lun("/vol/node1_iboot/node1_iboot").unwrap().maps.get("node1_iboot"),
            Some(&0)
        );
    }

    #[tokio::test]
    async fn test_preflight_is_side_effect_free() {
        let backend = array();
        let storage = classic(&backend);
        storage.preflight(&node()).await.unwrap();
        assert!(backend.mutating_calls().is_empty());

        let mut cfg = node();
        cfg.storage.boot_lun.os_image.name = "rhel-9".into();
        let err = storage.preflight(&cfg).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::NotFound);
        assert_eq!(err.breadcrumbs(), vec!["create_boot_storage_preflight"]);
    }

    #[tokio::test]
    async fn test_resize_refuses_shrink() {
        let backend = array();
        let mut cfg = node();
        let storage = classic(&backend);
        storage.create(&cfg).await.unwrap();
        backend.reset_calls();

        cfg.storage.boot_lun.lun.size = 10;
        let err = storage.resize(&cfg).await.unwrap_err();
        assert_matches!(
            err.root(),
            Error::ShrinkRefused {
                current_gib: 20,
                requested_gib: 10,
                ..
            }
        );
        assert!(backend.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn test_resize_missing_data_lun() {
        let backend = array();
        let mut cfg = node();
        let storage = classic(&backend);
        storage.create(&cfg).await.unwrap();
        backend.reset_calls();

        cfg.storage.data_lun.size = 10;
        let err = storage.resize(&cfg).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::NotFound);
        assert_matches!(err.root(), Error::NotFound { kind, .. } if kind == "data LUN");
        assert_eq!(err.breadcrumbs(), vec!["resize_boot_storage"]);
        assert!(backend.mutating_calls().is_empty());
        assert!(backend.lun("/vol/node1_iboot/node1_data").is_none());
    }

    #[tokio::test]
    async fn test_resize_grows_volume_first() {
        let backend = array();
        let mut cfg = node();
        cfg.storage.data_lun.size = 10;
        let storage = classic(&backend);
        storage.create(&cfg).await.unwrap();
        backend.reset_calls();

        cfg.storage.boot_lun.lun.size = 30;
        cfg.storage.data_lun.size = 20;
        let discovery = storage.resize(&cfg).await.unwrap();

        let mutating = backend.mutating_calls();
        assert!(mutating[0].starts_with("volume_resize"));
        assert_eq!(mutating.len(), 3);
        assert_eq!(backend.volume_size("node1_iboot"), Some(100 * GIB));
        assert_eq!(backend.lun("/vol/node1_iboot/node1_iboot").unwrap().size_bytes, 30 * GIB);
        assert_eq!(backend.lun("/vol/node1_iboot/node1_data").unwrap().size_bytes, 20 * GIB);
        assert_eq!(discovery.boot_lun_size, Some(30));
        assert_eq!(discovery.data_lun_size, Some(20));

        backend.reset_calls();
        storage.resize(&cfg).await.unwrap();
        assert!(backend.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn test_resize_refuses_nvme_shrink() {
        let backend = array();
        let mut cfg = node();
        cfg.storage.data_nvme.size = 50;
        let mut host = NvmeHost::default();
        host.host_nqn = "nqn.2014-08.org.nvmexpress:uuid:node1".into();
        host.interface.subnet = "10.1.0.0/24".into();
        cfg.network.nvme_host.push(host);

        let storage = classic(&backend);
        storage.create(&cfg).await.unwrap();
        NvmeStorage::new(backend.clone()).create(&cfg).await.unwrap();
        backend.reset_calls();

        cfg.storage.data_nvme.size = 40;
        let err = storage.resize(&cfg).await.unwrap_err();
        assert_matches!(err.root(), Error::ShrinkRefused { kind, .. } if kind == "NVMe namespace");
        assert!(backend.mutating_calls().is_empty());

        cfg.storage.data_nvme.size = 60;
        storage.resize(&cfg).await.unwrap();
        assert_eq!(backend.namespace_size("/vol/node1_iboot/node1_nvme"), Some(60 * GIB));
        assert_eq!(backend.volume_size("node1_iboot"), Some(160 * GIB));
    }

    #[tokio::test]
    async fn test_delete_full_graph() {
        let backend = array();
        let mut cfg = node();
        cfg.storage.data_lun.size = 10;
        let storage = classic(&backend);
        storage.create(&cfg).await.unwrap();

        storage.delete(&cfg).await.unwrap();
        assert_eq!(backend.volume_size("node1_iboot"), None);
        assert_eq!(backend.igroup_initiators("node1_iboot"), None);
        assert!(backend.lun("/vol/node1_iboot/node1_iboot").is_none());

        let mutating = backend.mutating_calls();
        let unmap = mutating.iter().position(|c| c.starts_with("lun_unmap /vol/node1_iboot/node1_iboot")).unwrap();
        let destroy = mutating.iter().position(|c| c.starts_with("lun_destroy /vol/node1_iboot/node1_iboot")).unwrap();
        let igroup = mutating.iter().position(|c| c.starts_with("igroup_destroy")).unwrap();
        let volume = mutating.iter().position(|c| c.starts_with("volume_destroy")).unwrap();
        assert!(unmap < destroy && destroy < igroup && igroup < volume);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let backend = array();
        let cfg = node();
        let storage = classic(&backend);
        storage.create(&cfg).await.unwrap();
        storage.delete(&cfg).await.unwrap();
        backend.reset_calls();

        storage.delete(&cfg).await.unwrap();
        assert!(backend.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_after_igroup_removed() {
        let backend = array();
        let cfg = node();
        let storage = classic(&backend);
        storage.create(&cfg).await.unwrap();
        backend.drop_igroup("node1_iboot");
        backend.reset_calls();

        storage.delete(&cfg).await.unwrap();
        let mutating = backend.mutating_calls();
        assert!(!mutating.iter().any(|c| c.starts_with("lun_unmap")));
        assert!(!mutating.iter().any(|c| c.starts_with("igroup_destroy")));
        assert!(mutating.iter().any(|c| c == "lun_destroy /vol/node1_iboot/node1_iboot"));
        assert_eq!(backend.volume_size("node1_iboot"), None);
    }

    #[tokio::test]
    async fn test_restore_mapping() {
        let backend = array();
        let cfg = node();
        let storage = classic(&backend);
        storage.create(&cfg).await.unwrap();
        backend.drop_mapping("/vol/node1_iboot/node1_iboot", "node1_iboot");

        storage.restore_mapping(&cfg).await.unwrap();
        let boot = backend.lun("/vol/node1_iboot/node1_iboot").unwrap();
        assert_eq!(boot.maps.get("node1_iboot"), Some(&0));

        backend.drop_igroup("node1_iboot");
        let err = storage.restore_mapping(&cfg).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::NotFound);
    }

    #[tokio::test]
    async fn test_discover_requires_seed_lun() {
        let backend = array();
        let cfg = node();
        let storage = classic(&backend);
        assert_eq!(storage.discover(&cfg).await.unwrap(), None);

        storage.create(&cfg).await.unwrap();
        assert_eq!(storage.discover(&cfg).await.unwrap(), None);

        backend
            .lun_create_and_upload(
                "node1_iboot",
                SEED_FILE,
                Bytes::from_static(b"iso"),
                "/vol/node1_iboot/node1_seed",
                "file:///templates/ubuntu.tmpl",
            )
            .await
            .unwrap();
        backend
            .snapshot_create("node1_iboot", "before-upgrade", "")
            .await
            .unwrap();

        let discovery = storage.discover(&cfg).await.unwrap().unwrap();
        assert_eq!(discovery.boot_lun_size, Some(20));
        assert_eq!(discovery.os_image.as_deref(), Some("ubuntu-22.04"));
        let template = discovery.seed_template.unwrap();
        assert_eq!(template.name, "ubuntu.tmpl");
        assert_eq!(template.location, "file:///templates/ubuntu.tmpl");
        assert_eq!(discovery.snapshots, Some(vec!["before-upgrade".to_string()]));
        assert_eq!(discovery.iscsi_targets.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_luns_keeps_volume() {
        let backend = array();
        let cfg = node();
        let storage = classic(&backend);
        storage.create(&cfg).await.unwrap();
        backend
            .file_upload_api("node1_iboot", SEED_FILE, Bytes::from_static(b"iso"))
            .await
            .unwrap();

        storage.delete_luns(&cfg).await.unwrap();
        assert!(backend.volume_size("node1_iboot").is_some());
        assert!(backend.igroup_initiators("node1_iboot").is_some());
        assert!(backend.lun("/vol/node1_iboot/node1_iboot").is_none());
        assert!(backend.file("node1_iboot", SEED_FILE).is_none());
    }

    #[tokio::test]
    async fn test_boot_lun_maps_at_zero_whatever_the_record_says() {
        let backend = array();
        let mut cfg = node();
        cfg.storage.boot_lun.lun.id = 1;
        cfg.storage.data_lun.id = 3;
        cfg.storage.data_lun.size = 10;

        classic(&backend).create(&cfg).await.unwrap();

        let boot = backend.lun("/vol/node1_iboot/node1_iboot").unwrap();
        assert_eq!(boot.maps.get("node1_iboot"), Some(&0));
        let data = backend.lun("/vol/node1_iboot/node1_data").unwrap();
        assert_eq!(data.maps.get("node1_iboot"), Some(&3));
    }

    #[tokio::test]
    async fn test_colliding_lun_ids_rejected_before_any_change() {
        let backend = array();
        let mut cfg = node();
        cfg.storage.seed_lun.lun.id = 0;
        let storage = classic(&backend);

        let err = storage.create(&cfg).await.unwrap_err();
        assert_matches!(err.root(), Error::Configuration(_));
        assert!(backend.mutating_calls().is_empty());

        let err = storage.preflight(&cfg).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Configuration);
    }

    #[test]
    fn test_lun_ids_per_profile() {
        let mut cfg = node();
        cfg.storage.boot_lun.lun.id = 7;
        assert_eq!(lun_id(Profile::Classic, &cfg, LunRole::Boot), 0);
        assert_eq!(lun_id(Profile::Harvester, &cfg, LunRole::Bootstrap), 0);
        assert_eq!(lun_id(Profile::Harvester, &cfg, LunRole::Boot), 1);
        assert_eq!(lun_id(Profile::Classic, &cfg, LunRole::Seed), 2);

        assert!(check_lun_ids(Profile::Classic, &cfg).is_ok());
        // data id 1 is only taken when a data LUN is requested
        cfg.storage.seed_lun.lun.id = 1;
        assert!(check_lun_ids(Profile::Classic, &cfg).is_ok());
        assert!(check_lun_ids(Profile::Harvester, &cfg).is_err());
        cfg.storage.data_lun.size = 10;
        assert!(check_lun_ids(Profile::Classic, &cfg).is_err());
    }

    #[tokio::test]
    async fn test_remap_unsupported_by_classic() {
        let backend = array();
        let err = classic(&backend).remap(&node()).await.unwrap_err();
        assert_matches!(err, Error::Configuration(_));
    }
}
