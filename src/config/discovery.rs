//! Discovery results returned by the reconcilers
//!
//! Reconcilers never mutate the caller's record. They return a
//! [`StorageDiscovery`] that the caller merges with
//! [`NodeStorageConfig::apply`]; every field left `None` keeps its prior value.

use super::node::{IscsiTarget, NodeStorageConfig, NvmeTarget, RemoteFile};
use serde::{Deserialize, Serialize};

/// Observed state read back from the array
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageDiscovery {
    /// Resolved vserver scope
    pub svm_name: Option<String>,
    /// One target per configured iSCSI initiator, same order
    pub iscsi_targets: Option<Vec<IscsiTarget>>,
    /// One target per configured NVMe host, same order
    pub nvme_targets: Option<Vec<NvmeTarget>>,
    pub boot_lun_size: Option<u64>,
    pub data_lun_size: Option<u64>,
    pub bootstrap_lun_size: Option<u64>,
    pub nvme_size: Option<u64>,
    /// Image name recorded on the boot LUN
    pub os_image: Option<String>,
    /// Template recorded on the seed LUN
    pub seed_template: Option<RemoteFile>,
    pub snapshots: Option<Vec<String>>,
}

impl StorageDiscovery {
    /// Combine two partial results; fields set in `other` win
    pub fn merge(mut self, other: StorageDiscovery) -> Self {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        take!(
            svm_name,
            iscsi_targets,
            nvme_targets,
            boot_lun_size,
            data_lun_size,
            bootstrap_lun_size,
            nvme_size,
            os_image,
            seed_template,
            snapshots
        );
        self
    }
}

impl NodeStorageConfig {
    /// Overwrite discovered fields with a reconciler result
    pub fn apply(&mut self, discovery: &StorageDiscovery) {
        if let Some(svm) = &discovery.svm_name {
            self.storage.svm_name = svm.clone();
        }
        if let Some(targets) = &discovery.iscsi_targets {
            for (initiator, target) in self.network.iscsi_initiator.iter_mut().zip(targets) {
                initiator.iscsi_target = Some(target.clone());
            }
        }
        if let Some(targets) = &discovery.nvme_targets {
            for (host, target) in self.network.nvme_host.iter_mut().zip(targets) {
                host.nvme_target = Some(target.clone());
            }
        }
        if let Some(size) = discovery.boot_lun_size {
            self.storage.boot_lun.lun.size = size;
        }
        if let Some(size) = discovery.data_lun_size {
            self.storage.data_lun.size = size;
        }
        if let Some(size) = discovery.bootstrap_lun_size {
            self.storage.bootstrap_lun.lun.size = size;
        }
        if let Some(size) = discovery.nvme_size {
            self.storage.data_nvme.size = size;
        }
        if let Some(image) = &discovery.os_image {
            self.storage.boot_lun.os_image.name = image.clone();
        }
        if let Some(template) = &discovery.seed_template {
            self.storage.seed_lun.seed_template = template.clone();
        }
        if let Some(snapshots) = &discovery.snapshots {
            self.storage.snapshots = snapshots.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::node::IscsiInitiator;

    #[test]
    fn test_apply_overwrites_only_discovered_fields() {
        let mut cfg = NodeStorageConfig::default();
        cfg.storage.boot_lun.lun.size = 10;
        cfg.storage.data_lun.size = 5;
        cfg.network.iscsi_initiator = vec![IscsiInitiator::default(), IscsiInitiator::default()];

        let discovery = StorageDiscovery {
            boot_lun_size: Some(20),
            iscsi_targets: Some(vec![
                IscsiTarget {
                    node_name: "iqn.1992-08.com.netapp:sn.1".into(),
                    interfaces: vec!["10.0.0.1".into()],
                },
                IscsiTarget {
                    node_name: "iqn.1992-08.com.netapp:sn.1".into(),
                    interfaces: vec!["10.0.1.1".into()],
                },
            ]),
            ..Default::default()
        };
        cfg.apply(&discovery);

        assert_eq!(cfg.storage.boot_lun.lun.size, 20);
        assert_eq!(cfg.storage.data_lun.size, 5);
        let target = cfg.network.iscsi_initiator[1].iscsi_target.as_ref().unwrap();
        assert_eq!(target.interfaces, vec!["10.0.1.1".to_string()]);
    }

    #[test]
    fn test_merge_prefers_later_values() {
        let a = StorageDiscovery {
            svm_name: Some("svm1".into()),
            boot_lun_size: Some(10),
            ..Default::default()
        };
        let b = StorageDiscovery {
            boot_lun_size: Some(20),
            nvme_size: Some(100),
            ..Default::default()
        };
        let merged = a.merge(b);
        assert_eq!(merged.svm_name.as_deref(), Some("svm1"));
        assert_eq!(merged.boot_lun_size, Some(20));
        assert_eq!(merged.nvme_size, Some(100));
    }
}
