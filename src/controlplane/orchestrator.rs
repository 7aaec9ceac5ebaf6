//! Node Orchestrator
//!
//! Composes the reconcilers into the lifecycle of one node:
//! - Boot storage for the selected profile
//! - NVMe data namespace
//! - Cloud-init seed LUN
//! - Image/template repositories and volume snapshots
//!
//! Steps run strictly in sequence. A failed step aborts the operation with
//! the array left as the completed steps made it; re-running converges.

use crate::cloudinit::{FieldTemplate, IsoWriter};
use crate::config::{NodeStorageConfig, Profile, StorageDiscovery};
use crate::controlplane::backends::BackendFactory;
use crate::controlplane::boot::BootStorageRef;
use crate::controlplane::nvme::NvmeStorage;
use crate::controlplane::platform::PlatformFactory;
use crate::controlplane::repo::RepoManager;
use crate::controlplane::seed::SeedStorage;
use crate::controlplane::snapshot::SnapshotManager;
use crate::domain::ports::{ContentRendererRef, IsoImageWriterRef, StorageBackendRef};
use crate::error::{Result, ResultExt};
use std::sync::Arc;
use tracing::info;

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Configuration for the orchestrator
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    /// Boot storage layout
    pub profile: Profile,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Lifecycle operations for one node's storage on one array
pub struct Orchestrator {
    config: OrchestratorConfig,
    backend: StorageBackendRef,
    boot: BootStorageRef,
    nvme: NvmeStorage,
    seed: SeedStorage,
    repos: RepoManager,
    snapshots: SnapshotManager,
}

impl Orchestrator {
    /// Connect to the array named in the record and resolve its vserver scope
    pub async fn connect(cfg: &NodeStorageConfig, config: OrchestratorConfig) -> Result<Self> {
        let storage = &cfg.storage;
        let svm_hint = (!storage.svm_name.is_empty()).then(|| storage.svm_name.as_str());
        let backend = BackendFactory::connect(&storage.cdot_credentials, svm_hint).await?;
        Self::from_backend(backend, config)
    }

    /// Build on an already connected backend with the built-in seed renderer
    /// and ISO writer
    pub fn from_backend(backend: StorageBackendRef, config: OrchestratorConfig) -> Result<Self> {
        Self::with_collaborators(
            backend,
            config,
            Arc::new(FieldTemplate::new()),
            Arc::new(IsoWriter::new()),
        )
    }

    pub fn with_collaborators(
        backend: StorageBackendRef,
        config: OrchestratorConfig,
        renderer: ContentRendererRef,
        writer: IsoImageWriterRef,
    ) -> Result<Self> {
        info!(
            "Creating orchestrator: {} profile on {} ({})",
            config.profile,
            backend.svm_name(),
            backend.backend_name()
        );
        Ok(Self {
            boot: PlatformFactory::create(config.profile, backend.clone()),
            nvme: NvmeStorage::new(backend.clone()),
            seed: SeedStorage::new(backend.clone(), renderer, writer)?,
            repos: RepoManager::new(backend.clone())?,
            snapshots: SnapshotManager::new(backend.clone()),
            config,
            backend,
        })
    }

    pub fn profile(&self) -> Profile {
        self.config.profile
    }

    pub fn backend(&self) -> &StorageBackendRef {
        &self.backend
    }

    pub fn repos(&self) -> &RepoManager {
        &self.repos
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    /// Validate a provision without changing array state
    pub async fn preflight(&self, cfg: &NodeStorageConfig) -> Result<()> {
        self.boot.preflight(cfg).await?;
        self.nvme.preflight(cfg).await?;
        self.seed.preflight(cfg).await
    }

    /// Converge boot storage, NVMe storage and the seed LUN
    ///
    /// Each step sees the record with the previous steps' results applied, so
    /// the seed image renders against discovered targets.
    pub async fn provision(&self, cfg: &NodeStorageConfig) -> Result<StorageDiscovery> {
        info!("Provisioning node storage: {}", cfg.compute.host_name);
        let mut record = cfg.clone();

        let mut discovery = self.boot.create(&record).await?;
        record.apply(&discovery);

        let nvme = self.nvme.create(&record).await?;
        record.apply(&nvme);
        discovery = discovery.merge(nvme);

        let seed = self.seed.create(&record).await?;
        discovery = discovery.merge(seed);

        info!("Provisioned node storage: {} on {}", cfg.compute.host_name, self.backend.svm_name());
        Ok(discovery)
    }

    pub async fn discover(&self, cfg: &NodeStorageConfig) -> Result<Option<StorageDiscovery>> {
        self.boot.discover(cfg).await
    }

    pub async fn resize(&self, cfg: &NodeStorageConfig) -> Result<StorageDiscovery> {
        info!("Resizing node storage: {}", cfg.compute.host_name);
        self.boot.resize(cfg).await
    }

    /// Replace every LUN while keeping the volume and its snapshots
    pub async fn rebuild(&self, cfg: &NodeStorageConfig) -> Result<StorageDiscovery> {
        info!("Rebuilding node storage: {}", cfg.compute.host_name);
        self.boot.delete_luns(cfg).await.context("rebuild")?;
        self.provision(cfg).await.context("rebuild")
    }

    /// Roll the volume back to a snapshot and re-create its LUN mappings
    pub async fn restore_snapshot(&self, cfg: &NodeStorageConfig, name: &str) -> Result<()> {
        self.snapshots.restore(cfg, name).await?;
        self.boot.restore_mapping(cfg).await
    }

    pub async fn deprovision(&self, cfg: &NodeStorageConfig) -> Result<()> {
        info!("Deprovisioning node storage: {}", cfg.compute.host_name);
        self.boot.delete(cfg).await
    }

    pub async fn delete_luns(&self, cfg: &NodeStorageConfig) -> Result<()> {
        self.boot.delete_luns(cfg).await
    }

    pub async fn restore_mapping(&self, cfg: &NodeStorageConfig) -> Result<()> {
        self.boot.restore_mapping(cfg).await
    }

    pub async fn remap(&self, cfg: &NodeStorageConfig) -> Result<()> {
        self.boot.remap(cfg).await
    }
}
