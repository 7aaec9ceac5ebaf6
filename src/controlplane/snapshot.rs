//! Snapshots of a node's boot volume

use crate::config::NodeStorageConfig;
use crate::domain::ports::StorageBackendRef;
use crate::error::{Error, Result, ResultExt};
use chrono::Utc;
use tracing::{debug, info};

/// Comment stamped on snapshots created without one
pub fn default_comment() -> String {
    format!("created {}", Utc::now().to_rfc3339())
}

pub struct SnapshotManager {
    backend: StorageBackendRef,
}

impl SnapshotManager {
    pub fn new(backend: StorageBackendRef) -> Self {
        Self { backend }
    }

    pub async fn list(&self, cfg: &NodeStorageConfig) -> Result<Vec<String>> {
        self.backend
            .snapshot_list(&cfg.storage.volume_name)
            .await
            .context("get_snapshots")
    }

    pub async fn exists(&self, cfg: &NodeStorageConfig, name: &str) -> Result<bool> {
        Ok(self.list(cfg).await?.iter().any(|s| s == name))
    }

    pub async fn create(&self, cfg: &NodeStorageConfig, name: &str, comment: Option<&str>) -> Result<()> {
        let volume = &cfg.storage.volume_name;
        let comment = comment.map(str::to_string).unwrap_or_else(default_comment);
        info!("Creating snapshot: {}@{} ({})", volume, name, comment);
        self.backend
            .snapshot_create(volume, name, &comment)
            .await
            .context("create_snapshot")
    }

    /// Delete a snapshot; absent snapshots are not an error
    pub async fn delete(&self, cfg: &NodeStorageConfig, name: &str) -> Result<()> {
        async {
            let volume = &cfg.storage.volume_name;
            if !self.exists(cfg, name).await? {
                debug!("Snapshot {}@{} already absent", volume, name);
                return Ok(());
            }
            info!("Deleting snapshot: {}@{}", volume, name);
            self.backend
                .snapshot_delete(volume, name)
                .await
                .context("snapshot_delete")
        }
        .await
        .context("delete_snapshot")
    }

    /// Roll the volume back to a snapshot
    pub async fn restore(&self, cfg: &NodeStorageConfig, name: &str) -> Result<()> {
        async {
            let volume = &cfg.storage.volume_name;
            if !self.exists(cfg, name).await? {
                return Err(Error::not_found("snapshot", format!("{}@{}", volume, name)));
            }
            info!("Restoring snapshot: {}@{}", volume, name);
            self.backend
                .snapshot_restore(volume, name)
                .await
                .context("snapshot_restore")
        }
        .await
        .context("restore_snapshot")
    }
}
