//! Node Boot Storage - SAN Boot Provisioning
//!
//! Provisions and tears down the block storage a bare-metal node boots and
//! runs from: a volume, boot/data/seed LUNs, an igroup with mapped LUNs, an
//! optional NVMe-oF namespace and the iSCSI/NVMe targets that serve them, on
//! an ONTAP array reached over REST or ZAPI.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                            Node Orchestrator                                │
//! │         preflight · provision · discover · resize · rebuild · delete        │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │  Boot Storage   │  │  NVMe Storage   │  │      Seed Storage           │  │
//! │  │ classic/harvest │  │ namespace+subsys│  │  template → cidata ISO      │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │  resource graph    │                         │                  │
//! │           │  aggregate select  │    Repositories · Snapshots               │
//! │           └────────────────────┼─────────────────────────┘                  │
//! ├────────────────────────────────┼────────────────────────────────────────────┤
//! │                     StorageBackend (async trait)                            │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │      REST       │  │      ZAPI       │  │        In-memory            │  │
//! │  │  JSON / HTTPS   │  │   XML / HTTPS   │  │     (tests only)            │  │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: reconcilers, backends and the orchestrator
//! - [`config`]: node record, array credentials, defaults and discovery results
//! - [`cloudinit`]: seed template rendering and ISO-9660 packaging
//! - [`domain`]: the array capability port and size units
//! - [`error`]: error types and classification

pub mod cloudinit;
pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;

// Re-export commonly used types
pub use controlplane::{
    BackendFactory, BootStorage, BootStorageRef, ClassicBootStorage, HarvesterBootStorage,
    NvmeStorage, Orchestrator, OrchestratorConfig, PlatformFactory, RepoManager, SeedStorage,
    SnapshotManager,
};

pub use config::{
    apply_defaults, load_node_config, render_node_config, ApiMethod, ArrayCredentials,
    NodeOverrides, NodeStorageConfig, OutputFormat, Profile, StorageDiscovery,
};

pub use domain::ports::{
    ContentRenderer, IsoImageWriter, Outcome, StorageBackend, StorageBackendRef,
};

pub use error::{Error, ErrorClass, Result, ResultExt};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
