//! Platform Profiles
//!
//! Provides the boot storage layout for each consuming platform:
//! - Classic bare-metal nodes (boot LUN from image, optional data LUN)
//! - Harvester HCI (bootstrap LUN from image, blank boot LUN)

pub mod harvester;

pub use harvester::{bootstrap_image, HarvesterBootStorage};

use crate::config::Profile;
use crate::controlplane::boot::{BootStorageRef, ClassicBootStorage};
use crate::domain::ports::StorageBackendRef;
use std::sync::Arc;
use tracing::debug;

/// Factory for boot storage reconcilers
pub struct PlatformFactory;

impl PlatformFactory {
    /// Create the reconciler for a profile
    pub fn create(profile: Profile, backend: StorageBackendRef) -> BootStorageRef {
        debug!("Using {} boot storage profile on {}", profile, backend.backend_name());
        match profile {
            Profile::Classic => Arc::new(ClassicBootStorage::new(backend)),
            Profile::Harvester => Arc::new(HarvesterBootStorage::new(backend)),
        }
    }
}
