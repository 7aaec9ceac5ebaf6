//! Control Plane Module
//!
//! Reconcilers that converge a node's SAN boot storage on the array, the
//! backends they drive, and the orchestrator composing them.

pub mod aggregate;
pub mod backends;
pub mod boot;
pub mod content;
pub mod graph;
pub mod nvme;
pub mod orchestrator;
pub mod platform;
pub mod repo;
pub mod seed;
pub mod snapshot;

pub use aggregate::{largest_aggregate, select_aggregate, volume_size_gib, HEADROOM_FACTOR};
pub use backends::{BackendFactory, MemoryBackend, RestBackend, ZapiBackend};
pub use boot::{BootStorage, BootStorageRef, ClassicBootStorage};
pub use content::{ContentFetcher, ContentLocation};
pub use graph::{LunRole, Resource, ResourceGraph};
pub use nvme::NvmeStorage;
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use platform::{HarvesterBootStorage, PlatformFactory};
pub use repo::RepoManager;
pub use seed::SeedStorage;
pub use snapshot::SnapshotManager;
