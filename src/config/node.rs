//! Node storage configuration record
//!
//! The record is read for desired state and, after a reconciler run, has the
//! discovered state merged back into it (see [`super::StorageDiscovery`]).

use crate::domain::ports::lun_path;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::credentials::ArrayCredentials;

// =============================================================================
// Storage
// =============================================================================

/// File reference by name and source location
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteFile {
    pub name: String,
    pub location: String,
}

/// LUN identity and desired size
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LunSpec {
    pub name: String,
    /// Logical unit number inside the igroup
    pub id: u32,
    /// Desired size in GiB on input, observed size after discovery
    pub size: u64,
}

/// LUN copied from an OS image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BootLunSpec {
    #[serde(flatten)]
    pub lun: LunSpec,
    pub os_image: RemoteFile,
}

/// LUN holding the rendered cloud-init image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SeedLunSpec {
    #[serde(flatten)]
    pub lun: LunSpec,
    pub seed_template: RemoteFile,
}

/// NVMe-oF data namespace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NvmeNamespaceSpec {
    pub namespace: String,
    pub subsystem: String,
    /// Size in GiB
    pub size: u64,
}

/// Storage side of the node record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    pub cdot_credentials: ArrayCredentials,
    /// Vserver scope; resolved and written back when empty
    pub svm_name: String,
    pub image_repo_name: String,
    pub template_repo_name: String,
    pub volume_name: String,
    pub igroup_name: String,
    pub boot_lun: BootLunSpec,
    pub data_lun: LunSpec,
    pub seed_lun: SeedLunSpec,
    pub bootstrap_lun: BootLunSpec,
    pub data_nvme: NvmeNamespaceSpec,
    /// Populated by discovery only
    pub snapshots: Vec<String>,
}

// =============================================================================
// Compute
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComputeConfig {
    pub host_name: String,
}

// =============================================================================
// Network
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkInterface {
    pub name: String,
    pub macaddr: String,
    pub ip: String,
    pub fqdn: String,
    /// CIDR notation, e.g. `192.168.10.0/24`
    pub subnet: String,
    /// Prefix length derived from `subnet`
    pub netlen: String,
    pub gateway: String,
    pub dns_server1: String,
    pub dns_server2: String,
    pub dns_domain: String,
}

/// Discovered iSCSI target for one initiator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IscsiTarget {
    pub node_name: String,
    pub interfaces: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IscsiInitiator {
    #[serde(flatten)]
    pub interface: NetworkInterface,
    pub initiator_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iscsi_target: Option<IscsiTarget>,
}

/// Discovered NVMe target for one host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NvmeTarget {
    pub target_nqn: String,
    pub interfaces: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NvmeHost {
    #[serde(flatten)]
    pub interface: NetworkInterface,
    pub host_nqn: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nvme_target: Option<NvmeTarget>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkConfig {
    pub node: Vec<NetworkInterface>,
    pub iscsi_initiator: Vec<IscsiInitiator>,
    pub nvme_host: Vec<NvmeHost>,
}

// =============================================================================
// Node Record
// =============================================================================

/// Desired and observed storage state of one compute node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeStorageConfig {
    pub compute: ComputeConfig,
    pub storage: StorageConfig,
    pub network: NetworkConfig,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub cloud_args: BTreeMap<String, String>,
}

impl NodeStorageConfig {
    pub fn boot_lun_path(&self) -> String {
        lun_path(&self.storage.volume_name, &self.storage.boot_lun.lun.name)
    }

    pub fn data_lun_path(&self) -> String {
        lun_path(&self.storage.volume_name, &self.storage.data_lun.name)
    }

    pub fn seed_lun_path(&self) -> String {
        lun_path(&self.storage.volume_name, &self.storage.seed_lun.lun.name)
    }

    pub fn bootstrap_lun_path(&self) -> String {
        lun_path(&self.storage.volume_name, &self.storage.bootstrap_lun.lun.name)
    }

    pub fn nvme_namespace_path(&self) -> String {
        lun_path(&self.storage.volume_name, &self.storage.data_nvme.namespace)
    }

    /// Path of an image LUN inside the image repository
    pub fn image_lun_path(&self, image: &str) -> String {
        lun_path(&self.storage.image_repo_name, image)
    }

    /// NVMe storage is managed only with at least one host and a positive size
    pub fn nvme_enabled(&self) -> bool {
        !self.network.nvme_host.is_empty() && self.storage.data_nvme.size > 0
    }

    /// NVMe size counted toward volume headroom
    pub fn nvme_headroom_gib(&self) -> u64 {
        if self.nvme_enabled() {
            self.storage.data_nvme.size
        } else {
            0
        }
    }

    /// Template data context
    pub fn to_context(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flattened_lun_fields_parse() {
        let yaml = r#"
compute:
  hostName: node-1
storage:
  volumeName: node_1_iboot
  bootLun:
    name: node_1_iboot
    size: 20
    osImage:
      name: ubuntu-22.04
  seedLun:
    name: node_1_seed
    id: 2
    seedTemplate:
      location: file:///tmp/ubuntu.tmpl
network:
  iscsiInitiator:
    - name: iscsi0
      subnet: 192.168.10.0/24
"#;
        let cfg: NodeStorageConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.storage.boot_lun.lun.size, 20);
        assert_eq!(cfg.storage.boot_lun.os_image.name, "ubuntu-22.04");
        assert_eq!(cfg.storage.seed_lun.lun.id, 2);
        assert_eq!(cfg.network.iscsi_initiator[0].interface.subnet, "192.168.10.0/24");
        assert_eq!(cfg.boot_lun_path(), "/vol/node_1_iboot/node_1_iboot");
    }

    #[test]
    fn test_nvme_enabled_requires_hosts_and_size() {
        let mut cfg = NodeStorageConfig::default();
        cfg.storage.data_nvme.size = 50;
        assert!(!cfg.nvme_enabled());
        assert_eq!(cfg.nvme_headroom_gib(), 0);

        cfg.network.nvme_host.push(NvmeHost::default());
        assert!(cfg.nvme_enabled());
        assert_eq!(cfg.nvme_headroom_gib(), 50);
    }

    #[test]
    fn test_context_uses_camel_case_keys() {
        let mut cfg = NodeStorageConfig::default();
        cfg.compute.host_name = "node-1".into();
        let ctx = cfg.to_context().unwrap();
        assert_eq!(ctx["compute"]["hostName"], "node-1");
    }
}
