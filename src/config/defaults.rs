//! Defaults and naming conventions applied to a loaded record

use super::credentials::DEFAULT_ZAPI_VERSION;
use super::node::NodeStorageConfig;
use crate::cloudinit::FieldTemplate;
use crate::error::{Error, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

pub const IMAGE_REPO_NAME: &str = "image_repo";
pub const TEMPLATE_REPO_NAME: &str = "template_repo";

/// Boot LUN size when none is requested, in GiB
pub const DEFAULT_BOOT_LUN_SIZE: u64 = 10;

const VOLUME_NAME_TEMPLATE: &str = "{{.Compute.HostName}}_iboot";
const IGROUP_NAME_TEMPLATE: &str = "{{.Compute.HostName}}_iboot";
const BOOT_LUN_NAME_TEMPLATE: &str = "{{.Compute.HostName}}_iboot";
const DATA_LUN_NAME_TEMPLATE: &str = "{{.Compute.HostName}}_data";
const SEED_LUN_NAME_TEMPLATE: &str = "{{.Compute.HostName}}_seed";
const BOOTSTRAP_LUN_NAME_TEMPLATE: &str = "{{.Compute.HostName}}_bootstrap";
const NVME_NAME_TEMPLATE: &str = "{{.Compute.HostName}}_nvme";

const INITIATOR_NAME_PREFIX: &str = "iqn.2005-02.com.open-iscsi:";
const UNSET_ADDRESS: &str = "0.0.0.0";

/// Resource graph layout used for a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Boot LUN copied from an image at id 0, optional data LUN
    #[default]
    Classic,
    /// Bootstrap LUN copied from an image at id 0, blank boot LUN at id 1
    Harvester,
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Profile::Classic => write!(f, "classic"),
            Profile::Harvester => write!(f, "harvester"),
        }
    }
}

impl std::str::FromStr for Profile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "classic" => Ok(Profile::Classic),
            "harvester" | "bootstrap" => Ok(Profile::Harvester),
            other => Err(Error::Configuration(format!("unknown profile \"{}\"", other))),
        }
    }
}

/// Values supplied on the command line that take precedence over the record
#[derive(Debug, Clone, Default)]
pub struct NodeOverrides {
    pub host_name: Option<String>,
    pub image: Option<String>,
    /// Seed template location; its base name becomes the template name
    pub template_location: Option<String>,
}

/// Prefix length of a CIDR subnet
pub fn prefix_len(subnet: &str) -> Result<u8> {
    let network: IpNetwork = subnet
        .parse()
        .map_err(|e| Error::Configuration(format!("failed to parse CIDR {}: {}", subnet, e)))?;
    Ok(network.prefix())
}

/// Last path component of a location, URL or path alike
pub fn base_name(location: &str) -> &str {
    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(location)
}

/// Apply overrides, naming conventions and defaults in place
pub fn apply_defaults(
    cfg: &mut NodeStorageConfig,
    profile: Profile,
    overrides: &NodeOverrides,
) -> Result<()> {
    let storage = &mut cfg.storage;
    if storage.cdot_credentials.zapi_version.is_empty() {
        storage.cdot_credentials.zapi_version = DEFAULT_ZAPI_VERSION.to_string();
    }
    if storage.image_repo_name.is_empty() {
        storage.image_repo_name = IMAGE_REPO_NAME.to_string();
    }
    if storage.template_repo_name.is_empty() {
        storage.template_repo_name = TEMPLATE_REPO_NAME.to_string();
    }

    if let Some(host) = &overrides.host_name {
        cfg.compute.host_name = host.clone();
    }
    if let Some(image) = &overrides.image {
        cfg.storage.boot_lun.os_image.name = image.clone();
        if profile == Profile::Harvester {
            cfg.storage.bootstrap_lun.os_image.name = image.clone();
        }
    }
    if let Some(location) = &overrides.template_location {
        cfg.storage.seed_lun.seed_template.name = base_name(location).to_string();
        cfg.storage.seed_lun.seed_template.location = location.clone();
    }
    if profile == Profile::Harvester && cfg.storage.bootstrap_lun.os_image.name.is_empty() {
        cfg.storage.bootstrap_lun.os_image.name = cfg.storage.boot_lun.os_image.name.clone();
    }

    if cfg.compute.host_name.is_empty() {
        return Ok(());
    }

    apply_network_defaults(cfg)?;

    let storage = &mut cfg.storage;
    set_if_empty(&mut storage.volume_name, VOLUME_NAME_TEMPLATE);
    set_if_empty(&mut storage.igroup_name, IGROUP_NAME_TEMPLATE);
    set_if_empty(&mut storage.boot_lun.lun.name, BOOT_LUN_NAME_TEMPLATE);
    set_if_empty(&mut storage.data_lun.name, DATA_LUN_NAME_TEMPLATE);
    set_if_empty(&mut storage.seed_lun.lun.name, SEED_LUN_NAME_TEMPLATE);
    set_if_empty(&mut storage.bootstrap_lun.lun.name, BOOTSTRAP_LUN_NAME_TEMPLATE);
    set_if_empty(&mut storage.data_nvme.namespace, NVME_NAME_TEMPLATE);
    set_if_empty(&mut storage.data_nvme.subsystem, NVME_NAME_TEMPLATE);
    if storage.boot_lun.lun.size == 0 {
        storage.boot_lun.lun.size = DEFAULT_BOOT_LUN_SIZE;
    }

    match profile {
        Profile::Classic => {
            storage.boot_lun.lun.id = 0;
            storage.data_lun.id = 1;
        }
        Profile::Harvester => {
            storage.bootstrap_lun.lun.id = 0;
            storage.boot_lun.lun.id = 1;
        }
    }
    storage.seed_lun.lun.id = 2;

    render_names(cfg)
}

fn set_if_empty(field: &mut String, template: &str) {
    if field.is_empty() {
        *field = template.to_string();
    }
}

fn apply_network_defaults(cfg: &mut NodeStorageConfig) -> Result<()> {
    for interface in cfg.network.node.iter_mut() {
        interface.netlen = prefix_len(&interface.subnet)?.to_string();
    }
    let host_name = cfg.compute.host_name.clone();
    for (i, initiator) in cfg.network.iscsi_initiator.iter_mut().enumerate() {
        let interface = &mut initiator.interface;
        interface.netlen = prefix_len(&interface.subnet)?.to_string();
        initiator.initiator_name = format!("{}{}.{}", INITIATOR_NAME_PREFIX, host_name, i + 1);
        for field in [
            &mut interface.gateway,
            &mut interface.dns_server1,
            &mut interface.dns_server2,
        ] {
            if field.is_empty() {
                *field = UNSET_ADDRESS.to_string();
            }
        }
    }
    for host in cfg.network.nvme_host.iter_mut() {
        host.interface.netlen = prefix_len(&host.interface.subnet)?.to_string();
    }
    Ok(())
}

/// Render every name template against the record; `-` becomes `_`
fn render_names(cfg: &mut NodeStorageConfig) -> Result<()> {
    let context = cfg.to_context()?;
    let template = FieldTemplate::new();
    let storage = &mut cfg.storage;
    for field in [
        &mut storage.volume_name,
        &mut storage.igroup_name,
        &mut storage.boot_lun.lun.name,
        &mut storage.data_lun.name,
        &mut storage.seed_lun.lun.name,
        &mut storage.bootstrap_lun.lun.name,
        &mut storage.data_nvme.namespace,
        &mut storage.data_nvme.subsystem,
    ] {
        *field = template.render_str(field, &context)?.replace('-', "_");
    }
    Ok(())
}
