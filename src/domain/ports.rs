//! Domain Ports - Core trait definitions for node boot storage
//!
//! These traits define the boundaries between the reconcilers and external systems.
//! Protocol adapters implement [`StorageBackend`]; the cloud-init module implements
//! [`ContentRenderer`] and [`IsoImageWriter`].

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Size Units
// =============================================================================

/// Bytes per GiB
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Convert a caller-facing GiB size to bytes
pub fn gib_to_bytes(gib: u64) -> u64 {
    gib.saturating_mul(GIB)
}

/// Convert an array-reported byte size to GiB, rounding to the nearest GiB
pub fn bytes_to_gib(bytes: u64) -> u64 {
    bytes.saturating_add(GIB / 2) / GIB
}

/// Structural path of a LUN or namespace inside a volume
pub fn lun_path(volume: &str, name: &str) -> String {
    format!("/vol/{}/{}", volume, name)
}

// =============================================================================
// Semantic Outcomes
// =============================================================================

/// Closed set of outcomes a raw array error code translates to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    /// Entry, mapping or online state is already gone
    AbsentOk,
    /// Entry already exists or conflicts with existing state
    Conflict,
    /// A referenced dependency does not exist
    NotFound,
    /// Array is busy or temporarily unavailable
    Transient,
    Fatal,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::AbsentOk => write!(f, "absent-ok"),
            Outcome::Conflict => write!(f, "conflict"),
            Outcome::NotFound => write!(f, "not-found"),
            Outcome::Transient => write!(f, "transient"),
            Outcome::Fatal => write!(f, "fatal"),
        }
    }
}

// =============================================================================
// Backend Types
// =============================================================================

/// Storage pool visible in the resolved vserver scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateInfo {
    pub name: String,
    pub available_bytes: u64,
}

/// Generic LUN attributes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LunInfo {
    /// Free-form comment; carries the image name or template location
    pub comment: String,
    pub size_bytes: u64,
}

impl LunInfo {
    /// Size rounded to the nearest GiB
    pub fn size_gib(&self) -> u64 {
        bytes_to_gib(self.size_bytes)
    }
}

/// Generic NVMe namespace attributes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceInfo {
    pub size_bytes: u64,
}

impl NamespaceInfo {
    pub fn size_gib(&self) -> u64 {
        bytes_to_gib(self.size_bytes)
    }
}

// =============================================================================
// Storage Backend Port
// =============================================================================

/// Protocol-independent array primitives.
///
/// Every `*_exists` / `*_is_mapped` query is side-effect free. Every destructive
/// call (`*_destroy`, `*_unmap`, `*_delete`) succeeds as a no-op when its target
/// is already absent; adapters enforce this by translating the array's error
/// codes, never the reconcilers. Sizes crossing this boundary are bytes.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Resolved vserver scope all calls are issued in
    fn svm_name(&self) -> &str;

    /// Adapter name for diagnostics
    fn backend_name(&self) -> &str;

    // --- aggregates -----------------------------------------------------------

    /// Storage pools visible in scope, in array order
    async fn aggregate_list(&self) -> Result<Vec<AggregateInfo>>;

    // --- volumes --------------------------------------------------------------

    async fn volume_exists(&self, name: &str) -> Result<bool>;

    /// Create a thin volume for block storage with no snapshot reserve
    async fn volume_create_san(&self, name: &str, aggregate: &str, size_bytes: u64) -> Result<()>;

    /// Create a file volume junctioned at `/<name>` under an export policy
    async fn volume_create_nas(
        &self,
        name: &str,
        aggregate: &str,
        export_policy: &str,
        size_bytes: u64,
    ) -> Result<()>;

    /// Offline then destroy a volume
    async fn volume_destroy(&self, name: &str) -> Result<()>;

    async fn volume_resize(&self, name: &str, size_bytes: u64) -> Result<()>;

    async fn export_policy_create(&self, name: &str) -> Result<()>;

    // --- initiator groups -----------------------------------------------------

    async fn igroup_exists(&self, name: &str) -> Result<bool>;

    async fn igroup_create(&self, name: &str) -> Result<()>;

    async fn igroup_add_initiator(&self, igroup: &str, initiator: &str) -> Result<()>;

    async fn igroup_destroy(&self, name: &str) -> Result<()>;

    // --- LUNs -----------------------------------------------------------------

    async fn lun_exists(&self, path: &str) -> Result<bool>;

    async fn lun_is_mapped(&self, path: &str, igroup: &str) -> Result<bool>;

    async fn lun_get_info(&self, path: &str) -> Result<LunInfo>;

    /// LUN names (last path component) inside a volume
    async fn lun_list(&self, volume: &str) -> Result<Vec<String>>;

    /// Copy a LUN and wait until the destination is online
    async fn lun_copy(&self, source_path: &str, dest_path: &str) -> Result<()>;

    async fn lun_resize(&self, path: &str, size_bytes: u64) -> Result<()>;

    async fn lun_map(&self, path: &str, lun_id: u32, igroup: &str) -> Result<()>;

    async fn lun_unmap(&self, path: &str, igroup: &str) -> Result<()>;

    async fn lun_create(&self, path: &str, size_bytes: u64) -> Result<()>;

    /// Create a LUN backed by an existing file inside `volume`
    async fn lun_create_from_file(
        &self,
        volume: &str,
        file_path: &str,
        lun_path: &str,
        comment: &str,
    ) -> Result<()>;

    /// Create a LUN holding `data`, staging it through `file_path` where the
    /// protocol requires it
    async fn lun_create_and_upload(
        &self,
        volume: &str,
        file_path: &str,
        data: Bytes,
        lun_path: &str,
        comment: &str,
    ) -> Result<()>;

    async fn lun_destroy(&self, path: &str) -> Result<()>;

    // --- iSCSI ----------------------------------------------------------------

    async fn iscsi_target_name(&self) -> Result<String>;

    /// iSCSI interface addresses homed on the node hosting `lun_path` that
    /// sit inside `subnet`. When the array reports no hosting node every
    /// interface in scope is considered. May be empty; the reconciler decides
    /// whether that is fatal.
    async fn discover_iscsi_lifs(&self, lun_path: &str, subnet: &str) -> Result<Vec<String>>;

    // --- files ----------------------------------------------------------------

    async fn file_exists(&self, volume: &str, path: &str) -> Result<bool>;

    /// Regular file names in a directory, hidden entries excluded
    async fn file_list(&self, volume: &str, dir: &str) -> Result<Vec<String>>;

    async fn file_delete(&self, volume: &str, path: &str) -> Result<()>;

    async fn file_download(&self, volume: &str, path: &str) -> Result<Bytes>;

    /// Upload through the management API in a single write
    async fn file_upload_api(&self, volume: &str, path: &str, data: Bytes) -> Result<()>;

    /// Upload through chunked offset writes, for large images
    async fn file_upload_nfs(&self, volume: &str, path: &str, data: Bytes) -> Result<()>;

    // --- snapshots ------------------------------------------------------------

    async fn snapshot_list(&self, volume: &str) -> Result<Vec<String>>;

    async fn snapshot_create(&self, volume: &str, name: &str, comment: &str) -> Result<()>;

    async fn snapshot_delete(&self, volume: &str, name: &str) -> Result<()>;

    async fn snapshot_restore(&self, volume: &str, name: &str) -> Result<()>;

    // --- NVMe -----------------------------------------------------------------

    async fn nvme_namespace_exists(&self, path: &str) -> Result<bool>;

    async fn nvme_namespace_create(&self, path: &str, size_bytes: u64) -> Result<()>;

    async fn nvme_namespace_destroy(&self, path: &str) -> Result<()>;

    async fn nvme_namespace_is_mapped(&self, path: &str) -> Result<bool>;

    async fn nvme_namespace_map(&self, path: &str, subsystem: &str) -> Result<()>;

    async fn nvme_namespace_unmap(&self, path: &str) -> Result<()>;

    async fn nvme_namespace_get_info(&self, path: &str) -> Result<NamespaceInfo>;

    async fn nvme_namespace_resize(&self, path: &str, size_bytes: u64) -> Result<()>;

    async fn nvme_subsystem_exists(&self, name: &str) -> Result<bool>;

    async fn nvme_subsystem_create(&self, name: &str) -> Result<()>;

    async fn nvme_subsystem_destroy(&self, name: &str) -> Result<()>;

    async fn nvme_subsystem_add_host(&self, subsystem: &str, host_nqn: &str) -> Result<()>;

    async fn nvme_target_nqn(&self, subsystem: &str) -> Result<String>;

    /// All NVMe data interface addresses in scope
    async fn nvme_lifs(&self) -> Result<Vec<String>>;

    /// NVMe/TCP counterpart of [`StorageBackend::discover_iscsi_lifs`]
    async fn discover_nvme_lifs(&self, namespace_path: &str, subnet: &str) -> Result<Vec<String>>;
}

// =============================================================================
// Content Collaborator Ports
// =============================================================================

/// Renders a text template against a data context
pub trait ContentRenderer: Send + Sync {
    /// Render `section` of `template`. A template with no block named
    /// `section` renders its top-level text.
    fn render(&self, template: &str, section: &str, context: &serde_json::Value) -> Result<Vec<u8>>;
}

/// One file placed in the root directory of an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    pub name: String,
    pub data: Vec<u8>,
}

impl ImageFile {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// Packages files into a single ISO-9660 image
pub trait IsoImageWriter: Send + Sync {
    fn write_iso(&self, volume_label: &str, files: &[ImageFile]) -> Result<Vec<u8>>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type StorageBackendRef = Arc<dyn StorageBackend>;
pub type ContentRendererRef = Arc<dyn ContentRenderer>;
pub type IsoImageWriterRef = Arc<dyn IsoImageWriter>;
