//! In-memory array
//!
//! A [`StorageBackend`] holding volumes, LUNs, mappings, files, snapshots and
//! NVMe objects in process memory. Every call is recorded so reconciler runs
//! can be inspected, and faults can be injected per operation.

use super::filter_subnet;
use super::outcome::backend_error;
use crate::domain::ports::{
    gib_to_bytes, AggregateInfo, LunInfo, NamespaceInfo, Outcome, StorageBackend,
};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Operations that never change array state
const READ_ONLY_OPERATIONS: &[&str] = &[
    "aggregate_list",
    "volume_exists",
    "igroup_exists",
    "lun_exists",
    "lun_is_mapped",
    "lun_get_info",
    "lun_list",
    "iscsi_target_name",
    "discover_iscsi_lifs",
    "file_exists",
    "file_list",
    "file_download",
    "snapshot_list",
    "nvme_namespace_exists",
    "nvme_namespace_is_mapped",
    "nvme_namespace_get_info",
    "nvme_subsystem_exists",
    "nvme_target_nqn",
    "nvme_lifs",
    "discover_nvme_lifs",
];

/// Protocol served by a data interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifProtocol {
    Iscsi,
    NvmeTcp,
}

/// Observable LUN state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryLun {
    pub size_bytes: u64,
    pub comment: String,
    /// igroup name to logical unit number
    pub maps: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Default)]
struct VolumeSnapshot {
    luns: BTreeMap<String, MemoryLun>,
    files: BTreeMap<String, Bytes>,
}

#[derive(Debug, Clone, Default)]
struct MemoryVolume {
    size_bytes: u64,
    aggregate: String,
    export_policy: Option<String>,
    files: BTreeMap<String, Bytes>,
    snapshots: BTreeMap<String, (String, VolumeSnapshot)>,
}

#[derive(Debug, Clone, Default)]
struct MemoryNamespace {
    size_bytes: u64,
    subsystem: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    aggregates: Vec<AggregateInfo>,
    volumes: BTreeMap<String, MemoryVolume>,
    export_policies: BTreeSet<String>,
    igroups: BTreeMap<String, Vec<String>>,
    luns: BTreeMap<String, MemoryLun>,
    namespaces: BTreeMap<String, MemoryNamespace>,
    subsystems: BTreeMap<String, Vec<String>>,
    lifs: Vec<(String, LifProtocol)>,
    calls: Vec<String>,
    faults: HashMap<String, (Outcome, String)>,
}

fn volume_of(path: &str) -> &str {
    path.trim_start_matches("/vol/")
        .split('/')
        .next()
        .unwrap_or_default()
}

fn missing(operation: &str, what: impl std::fmt::Display) -> crate::error::Error {
    backend_error(operation, Outcome::NotFound, "15661", format!("{} does not exist", what))
}

fn duplicate(operation: &str, what: impl std::fmt::Display) -> crate::error::Error {
    backend_error(operation, Outcome::Conflict, "17", format!("{} already exists", what))
}

fn parent_dir(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((dir, _)) => dir,
    }
}

/// Storage backend backed by process memory
pub struct MemoryBackend {
    svm: String,
    iscsi_target: String,
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new(svm: impl Into<String>) -> Self {
        let svm = svm.into();
        Self {
            iscsi_target: format!("iqn.1992-08.com.netapp:sn.memory:vs.{}", svm),
            svm,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn with_aggregate(self, name: &str, available_gib: u64) -> Self {
        self.state.lock().aggregates.push(AggregateInfo {
            name: name.to_string(),
            available_bytes: gib_to_bytes(available_gib),
        });
        self
    }

    pub fn with_lif(self, address: &str, protocol: LifProtocol) -> Self {
        self.state.lock().lifs.push((address.to_string(), protocol));
        self
    }

    /// Seed an image repository holding `images`, each a LUN of `size_gib`
    pub fn with_image_repo(self, repo: &str, images: &[&str], size_gib: u64) -> Self {
        {
            let mut state = self.state.lock();
            state.volumes.insert(
                repo.to_string(),
                MemoryVolume {
                    size_bytes: gib_to_bytes(64),
                    ..Default::default()
                },
            );
            for image in images {
                state.luns.insert(
                    format!("/vol/{}/{}", repo, image),
                    MemoryLun {
                        size_bytes: gib_to_bytes(size_gib),
                        comment: image.to_string(),
                        maps: BTreeMap::new(),
                    },
                );
            }
        }
        self
    }

    /// Fail every call to `operation` with the given outcome
    pub fn inject_fault(&self, operation: &str, outcome: Outcome, code: &str) {
        self.state
            .lock()
            .faults
            .insert(operation.to_string(), (outcome, code.to_string()));
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Every call in order, as `<operation> <arguments>`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Calls that may change array state
    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| {
                let op = c.split(' ').next().unwrap_or_default();
                !READ_ONLY_OPERATIONS.contains(&op)
            })
            .collect()
    }

    pub fn reset_calls(&self) {
        self.state.lock().calls.clear();
    }

    // --- inspection -----------------------------------------------------------

    pub fn lun(&self, path: &str) -> Option<MemoryLun> {
        self.state.lock().luns.get(path).cloned()
    }

    pub fn volume_size(&self, name: &str) -> Option<u64> {
        self.state.lock().volumes.get(name).map(|v| v.size_bytes)
    }

    pub fn volume_aggregate(&self, name: &str) -> Option<String> {
        self.state.lock().volumes.get(name).map(|v| v.aggregate.clone())
    }

    pub fn volume_export_policy(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .volumes
            .get(name)
            .and_then(|v| v.export_policy.clone())
    }

    pub fn igroup_initiators(&self, name: &str) -> Option<Vec<String>> {
        self.state.lock().igroups.get(name).cloned()
    }

    pub fn file(&self, volume: &str, path: &str) -> Option<Bytes> {
        self.state
            .lock()
            .volumes
            .get(volume)
            .and_then(|v| v.files.get(path).cloned())
    }

    pub fn namespace_size(&self, path: &str) -> Option<u64> {
        self.state.lock().namespaces.get(path).map(|n| n.size_bytes)
    }

    pub fn namespace_subsystem(&self, path: &str) -> Option<String> {
        self.state
            .lock()
            .namespaces
            .get(path)
            .and_then(|n| n.subsystem.clone())
    }

    pub fn subsystem_hosts(&self, name: &str) -> Option<Vec<String>> {
        self.state.lock().subsystems.get(name).cloned()
    }

    /// Remove a LUN mapping behind the reconciler's back
    pub fn drop_mapping(&self, path: &str, igroup: &str) {
        if let Some(lun) = self.state.lock().luns.get_mut(path) {
            lun.maps.remove(igroup);
        }
    }

    /// Remove an igroup behind the reconciler's back
    pub fn drop_igroup(&self, name: &str) {
        let mut state = self.state.lock();
        state.igroups.remove(name);
        for lun in state.luns.values_mut() {
            lun.maps.remove(name);
        }
    }

    /// Record a call and apply any injected fault
    fn enter(&self, operation: &str, args: std::fmt::Arguments<'_>) -> Result<MutexGuard<'_, MemoryState>> {
        let mut state = self.state.lock();
        state.calls.push(format!("{} {}", operation, args).trim_end().to_string());
        if let Some((outcome, code)) = state.faults.get(operation).cloned() {
            return Err(backend_error(operation, outcome, code, "injected fault"));
        }
        Ok(state)
    }

    fn interfaces(state: &MemoryState, protocol: LifProtocol) -> Vec<String> {
        state
            .lifs
            .iter()
            .filter(|(_, p)| *p == protocol)
            .map(|(a, _)| a.clone())
            .collect()
    }
}

impl MemoryState {
    fn volume_mut(&mut self, operation: &str, name: &str) -> Result<&mut MemoryVolume> {
        self.volumes
            .get_mut(name)
            .ok_or_else(|| missing(operation, format_args!("volume {}", name)))
    }

    fn lun_mut(&mut self, operation: &str, path: &str) -> Result<&mut MemoryLun> {
        self.luns
            .get_mut(path)
            .ok_or_else(|| missing(operation, format_args!("LUN {}", path)))
    }

    fn insert_lun(&mut self, operation: &str, path: &str, lun: MemoryLun) -> Result<()> {
        if !self.volumes.contains_key(volume_of(path)) {
            return Err(missing(operation, format_args!("volume {}", volume_of(path))));
        }
        if self.luns.contains_key(path) {
            return Err(duplicate(operation, format_args!("LUN {}", path)));
        }
        self.luns.insert(path.to_string(), lun);
        Ok(())
    }

    fn create_volume(&mut self, operation: &str, name: &str, aggregate: &str, size_bytes: u64) -> Result<&mut MemoryVolume> {
        if !self.aggregates.iter().any(|a| a.name == aggregate) {
            return Err(missing(operation, format_args!("aggregate {}", aggregate)));
        }
        if self.volumes.contains_key(name) {
            return Err(duplicate(operation, format_args!("volume {}", name)));
        }
        Ok(self.volumes.entry(name.to_string()).or_insert(MemoryVolume {
            size_bytes,
            aggregate: aggregate.to_string(),
            ..Default::default()
        }))
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn svm_name(&self) -> &str {
        &self.svm
    }

    fn backend_name(&self) -> &str {
        "memory"
    }

    async fn aggregate_list(&self) -> Result<Vec<AggregateInfo>> {
        let state = self.enter("aggregate_list", format_args!(""))?;
        Ok(state.aggregates.clone())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        let state = self.enter("volume_exists", format_args!("{}", name))?;
        Ok(state.volumes.contains_key(name))
    }

    async fn volume_create_san(&self, name: &str, aggregate: &str, size_bytes: u64) -> Result<()> {
        let mut state = self.enter(
            "volume_create_san",
            format_args!("{} {} {}", name, aggregate, size_bytes),
        )?;
        state.create_volume("volume_create_san", name, aggregate, size_bytes)?;
        Ok(())
    }

    async fn volume_create_nas(
        &self,
        name: &str,
        aggregate: &str,
        export_policy: &str,
        size_bytes: u64,
    ) -> Result<()> {
        let mut state = self.enter(
            "volume_create_nas",
            format_args!("{} {} {} {}", name, aggregate, export_policy, size_bytes),
        )?;
        if !state.export_policies.contains(export_policy) {
            return Err(missing("volume_create_nas", format_args!("export policy {}", export_policy)));
        }
        let volume = state.create_volume("volume_create_nas", name, aggregate, size_bytes)?;
        volume.export_policy = Some(export_policy.to_string());
        Ok(())
    }

    async fn volume_destroy(&self, name: &str) -> Result<()> {
        let mut state = self.enter("volume_destroy", format_args!("{}", name))?;
        if state.volumes.remove(name).is_some() {
            let prefix = format!("/vol/{}/", name);
            state.luns.retain(|path, _| !path.starts_with(&prefix));
            state.namespaces.retain(|path, _| !path.starts_with(&prefix));
        }
        Ok(())
    }

    async fn volume_resize(&self, name: &str, size_bytes: u64) -> Result<()> {
        let mut state = self.enter("volume_resize", format_args!("{} {}", name, size_bytes))?;
        state.volume_mut("volume_resize", name)?.size_bytes = size_bytes;
        Ok(())
    }

    async fn export_policy_create(&self, name: &str) -> Result<()> {
        let mut state = self.enter("export_policy_create", format_args!("{}", name))?;
        if !state.export_policies.insert(name.to_string()) {
            return Err(duplicate("export_policy_create", format_args!("export policy {}", name)));
        }
        Ok(())
    }

    async fn igroup_exists(&self, name: &str) -> Result<bool> {
        let state = self.enter("igroup_exists", format_args!("{}", name))?;
        Ok(state.igroups.contains_key(name))
    }

    async fn igroup_create(&self, name: &str) -> Result<()> {
        let mut state = self.enter("igroup_create", format_args!("{}", name))?;
        if state.igroups.contains_key(name) {
            return Err(duplicate("igroup_create", format_args!("igroup {}", name)));
        }
        state.igroups.insert(name.to_string(), Vec::new());
        Ok(())
    }

    async fn igroup_add_initiator(&self, igroup: &str, initiator: &str) -> Result<()> {
        let mut state = self.enter(
            "igroup_add_initiator",
            format_args!("{} {}", igroup, initiator),
        )?;
        let members = state
            .igroups
            .get_mut(igroup)
            .ok_or_else(|| missing("igroup_add_initiator", format_args!("igroup {}", igroup)))?;
        if members.iter().any(|m| m == initiator) {
            return Err(duplicate("igroup_add_initiator", format_args!("initiator {}", initiator)));
        }
        members.push(initiator.to_string());
        Ok(())
    }

    async fn igroup_destroy(&self, name: &str) -> Result<()> {
        let mut state = self.enter("igroup_destroy", format_args!("{}", name))?;
        state.igroups.remove(name);
        for lun in state.luns.values_mut() {
            lun.maps.remove(name);
        }
        Ok(())
    }

    async fn lun_exists(&self, path: &str) -> Result<bool> {
        let state = self.enter("lun_exists", format_args!("{}", path))?;
        Ok(state.luns.contains_key(path))
    }

    async fn lun_is_mapped(&self, path: &str, igroup: &str) -> Result<bool> {
        let state = self.enter("lun_is_mapped", format_args!("{} {}", path, igroup))?;
        Ok(state
            .luns
            .get(path)
            .map(|l| l.maps.contains_key(igroup))
            .unwrap_or(false))
    }

    async fn lun_get_info(&self, path: &str) -> Result<LunInfo> {
        let mut state = self.enter("lun_get_info", format_args!("{}", path))?;
        let lun = state.lun_mut("lun_get_info", path)?;
        Ok(LunInfo {
            comment: lun.comment.clone(),
            size_bytes: lun.size_bytes,
        })
    }

    async fn lun_list(&self, volume: &str) -> Result<Vec<String>> {
        let state = self.enter("lun_list", format_args!("{}", volume))?;
        let prefix = format!("/vol/{}/", volume);
        Ok(state
            .luns
            .keys()
            .filter_map(|p| p.strip_prefix(&prefix))
            .map(str::to_string)
            .collect())
    }

    async fn lun_copy(&self, source_path: &str, dest_path: &str) -> Result<()> {
        let mut state = self.enter("lun_copy", format_args!("{} {}", source_path, dest_path))?;
        let source = state.lun_mut("lun_copy", source_path)?.clone();
        state.insert_lun(
            "lun_copy",
            dest_path,
            MemoryLun {
                maps: BTreeMap::new(),
                ..source
            },
        )
    }

    async fn lun_resize(&self, path: &str, size_bytes: u64) -> Result<()> {
        let mut state = self.enter("lun_resize", format_args!("{} {}", path, size_bytes))?;
        state.lun_mut("lun_resize", path)?.size_bytes = size_bytes;
        Ok(())
    }

    async fn lun_map(&self, path: &str, lun_id: u32, igroup: &str) -> Result<()> {
        let mut state = self.enter("lun_map", format_args!("{} {} {}", path, lun_id, igroup))?;
        if !state.igroups.contains_key(igroup) {
            return Err(missing("lun_map", format_args!("igroup {}", igroup)));
        }
        let id_taken = state
            .luns
            .iter()
            .any(|(p, l)| p != path && l.maps.get(igroup) == Some(&lun_id));
        if id_taken {
            return Err(duplicate("lun_map", format_args!("LUN id {} in {}", lun_id, igroup)));
        }
        let lun = state.lun_mut("lun_map", path)?;
        if lun.maps.contains_key(igroup) {
            return Err(duplicate("lun_map", format_args!("mapping {} -> {}", path, igroup)));
        }
        lun.maps.insert(igroup.to_string(), lun_id);
        Ok(())
    }

    async fn lun_unmap(&self, path: &str, igroup: &str) -> Result<()> {
        let mut state = self.enter("lun_unmap", format_args!("{} {}", path, igroup))?;
        if let Some(lun) = state.luns.get_mut(path) {
            lun.maps.remove(igroup);
        }
        Ok(())
    }

    async fn lun_create(&self, path: &str, size_bytes: u64) -> Result<()> {
        let mut state = self.enter("lun_create", format_args!("{} {}", path, size_bytes))?;
        state.insert_lun(
            "lun_create",
            path,
            MemoryLun {
                size_bytes,
                ..Default::default()
            },
        )
    }

    async fn lun_create_from_file(
        &self,
        volume: &str,
        file_path: &str,
        lun_path: &str,
        comment: &str,
    ) -> Result<()> {
        let mut state = self.enter(
            "lun_create_from_file",
            format_args!("{} {} {}", volume, file_path, lun_path),
        )?;
        let data = state
            .volume_mut("lun_create_from_file", volume)?
            .files
            .get(file_path)
            .cloned()
            .ok_or_else(|| missing("lun_create_from_file", format_args!("file {}", file_path)))?;
        state.insert_lun(
            "lun_create_from_file",
            lun_path,
            MemoryLun {
                size_bytes: data.len() as u64,
                comment: comment.to_string(),
                maps: BTreeMap::new(),
            },
        )
    }

    async fn lun_create_and_upload(
        &self,
        volume: &str,
        file_path: &str,
        data: Bytes,
        lun_path: &str,
        comment: &str,
    ) -> Result<()> {
        let mut state = self.enter(
            "lun_create_and_upload",
            format_args!("{} {} {}", volume, file_path, lun_path),
        )?;
        state.insert_lun(
            "lun_create_and_upload",
            lun_path,
            MemoryLun {
                size_bytes: data.len() as u64 + 2 * 1024 * 1024,
                comment: comment.to_string(),
                maps: BTreeMap::new(),
            },
        )
    }

    async fn lun_destroy(&self, path: &str) -> Result<()> {
        let mut state = self.enter("lun_destroy", format_args!("{}", path))?;
        state.luns.remove(path);
        Ok(())
    }

    async fn iscsi_target_name(&self) -> Result<String> {
        self.enter("iscsi_target_name", format_args!(""))?;
        Ok(self.iscsi_target.clone())
    }

    async fn discover_iscsi_lifs(&self, lun_path: &str, subnet: &str) -> Result<Vec<String>> {
        let state = self.enter("discover_iscsi_lifs", format_args!("{} {}", lun_path, subnet))?;
        filter_subnet(Self::interfaces(&state, LifProtocol::Iscsi), subnet)
    }

    async fn file_exists(&self, volume: &str, path: &str) -> Result<bool> {
        let mut state = self.enter("file_exists", format_args!("{} {}", volume, path))?;
        Ok(state.volume_mut("file_exists", volume)?.files.contains_key(path))
    }

    async fn file_list(&self, volume: &str, dir: &str) -> Result<Vec<String>> {
        let mut state = self.enter("file_list", format_args!("{} {}", volume, dir))?;
        let dir = if dir.len() > 1 { dir.trim_end_matches('/') } else { dir };
        Ok(state
            .volume_mut("file_list", volume)?
            .files
            .keys()
            .filter(|p| parent_dir(p) == dir)
            .filter_map(|p| p.rsplit('/').next())
            .filter(|n| !n.starts_with('.'))
            .map(str::to_string)
            .collect())
    }

    async fn file_delete(&self, volume: &str, path: &str) -> Result<()> {
        let mut state = self.enter("file_delete", format_args!("{} {}", volume, path))?;
        if let Some(v) = state.volumes.get_mut(volume) {
            v.files.remove(path);
        }
        Ok(())
    }

    async fn file_download(&self, volume: &str, path: &str) -> Result<Bytes> {
        let mut state = self.enter("file_download", format_args!("{} {}", volume, path))?;
        state
            .volume_mut("file_download", volume)?
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| missing("file_download", format_args!("file {}", path)))
    }

    async fn file_upload_api(&self, volume: &str, path: &str, data: Bytes) -> Result<()> {
        let mut state = self.enter("file_upload_api", format_args!("{} {}", volume, path))?;
        state
            .volume_mut("file_upload_api", volume)?
            .files
            .insert(path.to_string(), data);
        Ok(())
    }

    async fn file_upload_nfs(&self, volume: &str, path: &str, data: Bytes) -> Result<()> {
        let mut state = self.enter("file_upload_nfs", format_args!("{} {}", volume, path))?;
        state
            .volume_mut("file_upload_nfs", volume)?
            .files
            .insert(path.to_string(), data);
        Ok(())
    }

    async fn snapshot_list(&self, volume: &str) -> Result<Vec<String>> {
        let mut state = self.enter("snapshot_list", format_args!("{}", volume))?;
        Ok(state
            .volume_mut("snapshot_list", volume)?
            .snapshots
            .keys()
            .cloned()
            .collect())
    }

    async fn snapshot_create(&self, volume: &str, name: &str, comment: &str) -> Result<()> {
        let mut state = self.enter("snapshot_create", format_args!("{} {}", volume, name))?;
        let prefix = format!("/vol/{}/", volume);
        let luns: BTreeMap<String, MemoryLun> = state
            .luns
            .iter()
            .filter(|(p, _)| p.starts_with(&prefix))
            .map(|(p, l)| (p.clone(), l.clone()))
            .collect();
        let v = state.volume_mut("snapshot_create", volume)?;
        if v.snapshots.contains_key(name) {
            return Err(duplicate("snapshot_create", format_args!("snapshot {}", name)));
        }
        let image = VolumeSnapshot {
            luns,
            files: v.files.clone(),
        };
        v.snapshots
            .insert(name.to_string(), (comment.to_string(), image));
        Ok(())
    }

    async fn snapshot_delete(&self, volume: &str, name: &str) -> Result<()> {
        let mut state = self.enter("snapshot_delete", format_args!("{} {}", volume, name))?;
        if let Some(v) = state.volumes.get_mut(volume) {
            v.snapshots.remove(name);
        }
        Ok(())
    }

    async fn snapshot_restore(&self, volume: &str, name: &str) -> Result<()> {
        let mut state = self.enter("snapshot_restore", format_args!("{} {}", volume, name))?;
        let v = state.volume_mut("snapshot_restore", volume)?;
        let (_, image) = v
            .snapshots
            .get(name)
            .cloned()
            .ok_or_else(|| missing("snapshot_restore", format_args!("snapshot {}", name)))?;
        v.files = image.files;
        let prefix = format!("/vol/{}/", volume);
        state.luns.retain(|p, _| !p.starts_with(&prefix));
        for (path, lun) in image.luns {
            state.luns.insert(
                path,
                MemoryLun {
                    maps: BTreeMap::new(),
                    ..lun
                },
            );
        }
        Ok(())
    }

    async fn nvme_namespace_exists(&self, path: &str) -> Result<bool> {
        let state = self.enter("nvme_namespace_exists", format_args!("{}", path))?;
        Ok(state.namespaces.contains_key(path))
    }

    async fn nvme_namespace_create(&self, path: &str, size_bytes: u64) -> Result<()> {
        let mut state = self.enter(
            "nvme_namespace_create",
            format_args!("{} {}", path, size_bytes),
        )?;
        if !state.volumes.contains_key(volume_of(path)) {
            return Err(missing("nvme_namespace_create", format_args!("volume {}", volume_of(path))));
        }
        if state.namespaces.contains_key(path) {
            return Err(duplicate("nvme_namespace_create", format_args!("namespace {}", path)));
        }
        state.namespaces.insert(
            path.to_string(),
            MemoryNamespace {
                size_bytes,
                subsystem: None,
            },
        );
        Ok(())
    }

    async fn nvme_namespace_destroy(&self, path: &str) -> Result<()> {
        let mut state = self.enter("nvme_namespace_destroy", format_args!("{}", path))?;
        state.namespaces.remove(path);
        Ok(())
    }

    async fn nvme_namespace_is_mapped(&self, path: &str) -> Result<bool> {
        let state = self.enter("nvme_namespace_is_mapped", format_args!("{}", path))?;
        Ok(state
            .namespaces
            .get(path)
            .map(|n| n.subsystem.is_some())
            .unwrap_or(false))
    }

    async fn nvme_namespace_map(&self, path: &str, subsystem: &str) -> Result<()> {
        let mut state = self.enter("nvme_namespace_map", format_args!("{} {}", path, subsystem))?;
        if !state.subsystems.contains_key(subsystem) {
            return Err(missing("nvme_namespace_map", format_args!("subsystem {}", subsystem)));
        }
        let namespace = state
            .namespaces
            .get_mut(path)
            .ok_or_else(|| missing("nvme_namespace_map", format_args!("namespace {}", path)))?;
        if namespace.subsystem.is_some() {
            return Err(duplicate("nvme_namespace_map", format_args!("mapping of {}", path)));
        }
        namespace.subsystem = Some(subsystem.to_string());
        Ok(())
    }

    async fn nvme_namespace_unmap(&self, path: &str) -> Result<()> {
        let mut state = self.enter("nvme_namespace_unmap", format_args!("{}", path))?;
        if let Some(namespace) = state.namespaces.get_mut(path) {
            namespace.subsystem = None;
        }
        Ok(())
    }

    async fn nvme_namespace_get_info(&self, path: &str) -> Result<NamespaceInfo> {
        let state = self.enter("nvme_namespace_get_info", format_args!("{}", path))?;
        state
            .namespaces
            .get(path)
            .map(|n| NamespaceInfo {
                size_bytes: n.size_bytes,
            })
            .ok_or_else(|| missing("nvme_namespace_get_info", format_args!("namespace {}", path)))
    }

    async fn nvme_namespace_resize(&self, path: &str, size_bytes: u64) -> Result<()> {
        let mut state = self.enter(
            "nvme_namespace_resize",
            format_args!("{} {}", path, size_bytes),
        )?;
        let namespace = state
            .namespaces
            .get_mut(path)
            .ok_or_else(|| missing("nvme_namespace_resize", format_args!("namespace {}", path)))?;
        namespace.size_bytes = size_bytes;
        Ok(())
    }

    async fn nvme_subsystem_exists(&self, name: &str) -> Result<bool> {
        let state = self.enter("nvme_subsystem_exists", format_args!("{}", name))?;
        Ok(state.subsystems.contains_key(name))
    }

    async fn nvme_subsystem_create(&self, name: &str) -> Result<()> {
        let mut state = self.enter("nvme_subsystem_create", format_args!("{}", name))?;
        if state.subsystems.contains_key(name) {
            return Err(duplicate("nvme_subsystem_create", format_args!("subsystem {}", name)));
        }
        state.subsystems.insert(name.to_string(), Vec::new());
        Ok(())
    }

    async fn nvme_subsystem_destroy(&self, name: &str) -> Result<()> {
        let mut state = self.enter("nvme_subsystem_destroy", format_args!("{}", name))?;
        if state.subsystems.remove(name).is_some() {
            for namespace in state.namespaces.values_mut() {
                if namespace.subsystem.as_deref() == Some(name) {
                    namespace.subsystem = None;
                }
            }
        }
        Ok(())
    }

    async fn nvme_subsystem_add_host(&self, subsystem: &str, host_nqn: &str) -> Result<()> {
        let mut state = self.enter(
            "nvme_subsystem_add_host",
            format_args!("{} {}", subsystem, host_nqn),
        )?;
        let hosts = state
            .subsystems
            .get_mut(subsystem)
            .ok_or_else(|| missing("nvme_subsystem_add_host", format_args!("subsystem {}", subsystem)))?;
        if !hosts.iter().any(|h| h == host_nqn) {
            hosts.push(host_nqn.to_string());
        }
        Ok(())
    }

    async fn nvme_target_nqn(&self, subsystem: &str) -> Result<String> {
        let state = self.enter("nvme_target_nqn", format_args!("{}", subsystem))?;
        if !state.subsystems.contains_key(subsystem) {
            return Err(missing("nvme_target_nqn", format_args!("subsystem {}", subsystem)));
        }
        Ok(format!(
            "nqn.1992-08.com.netapp:sn.memory:subsystem.{}",
            subsystem
        ))
    }

    async fn nvme_lifs(&self) -> Result<Vec<String>> {
        let state = self.enter("nvme_lifs", format_args!(""))?;
        Ok(Self::interfaces(&state, LifProtocol::NvmeTcp))
    }

    async fn discover_nvme_lifs(&self, namespace_path: &str, subnet: &str) -> Result<Vec<String>> {
        let state = self.enter(
            "discover_nvme_lifs",
            format_args!("{} {}", namespace_path, subnet),
        )?;
        filter_subnet(Self::interfaces(&state, LifProtocol::NvmeTcp), subnet)
    }
}
