//! REST Storage Adapter
//!
//! Implements [`StorageBackend`] over the array's JSON REST API. Every
//! collection query is scoped to the resolved vserver; destructive calls look
//! their target up first and succeed without a request when it is absent.

use super::outcome::{absent_ok, backend_error, rest_outcome};
use super::rest_session::{split_href, RestFault, RestReply, RestRequest, RestSession};
use super::{filter_subnet, resolve_scope};
use crate::domain::ports::{
    AggregateInfo, LunInfo, NamespaceInfo, Outcome, StorageBackend,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Maximum wait for a copied LUN to come online
pub const MAX_WAIT_FOR_LUN_SECS: u64 = 300;

/// Extra LUN capacity beyond the uploaded image
const LUN_UPLOAD_OVERHEAD: u64 = 2 * 1024 * 1024;

/// Chunk size for offset writes and reads
const FILE_CHUNK_SIZE: usize = 1024 * 1024;

// =============================================================================
// JSON Helpers
// =============================================================================

fn str_at(value: &Value, pointer: &str) -> String {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn u64_at(value: &Value, pointer: &str) -> u64 {
    value.pointer(pointer).and_then(Value::as_u64).unwrap_or(0)
}

/// Volume-relative file path encoded for the files endpoint
fn encode_file_path(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        ".".to_string()
    } else {
        urlencoding::encode(trimmed).into_owned()
    }
}

fn split_file_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((dir, name)) => (dir, name),
        None => ("/", path),
    }
}

/// Volume and LUN name from `/vol/<volume>/<name>`
fn split_lun_path(path: &str) -> (&str, &str) {
    let trimmed = path.trim_start_matches("/vol/");
    trimmed.split_once('/').unwrap_or((trimmed, ""))
}

// =============================================================================
// REST Adapter
// =============================================================================

/// Storage backend over the REST protocol
pub struct RestBackend {
    session: Arc<dyn RestSession>,
    svm: String,
}

impl RestBackend {
    /// Resolve the vserver scope and bind the session to it
    pub async fn connect(session: Arc<dyn RestSession>, svm_hint: Option<&str>) -> Result<Self> {
        let mut request = RestRequest::get("/api/svm/svms").query("fields", "name");
        if let Some(hint) = svm_hint.filter(|h| !h.is_empty()) {
            request = request.query("name", hint);
        }
        let records = collect(session.as_ref(), "svm_get_iter", request).await?;
        let candidates: Vec<String> = records.iter().map(|r| str_at(r, "/name")).collect();
        let svm = resolve_scope(svm_hint, &candidates)?;
        info!("REST session bound to vserver {}", svm);
        Ok(Self { session, svm })
    }

    /// Bind to a known vserver without resolution
    pub fn with_svm(session: Arc<dyn RestSession>, svm: impl Into<String>) -> Self {
        Self {
            session,
            svm: svm.into(),
        }
    }

    async fn call(&self, operation: &str, request: RestRequest) -> Result<RestReply> {
        send(self.session.as_ref(), operation, request).await
    }

    /// Scoped collection query over all pages
    async fn records(
        &self,
        operation: &str,
        path: &str,
        filters: &[(&str, &str)],
        fields: &str,
    ) -> Result<Vec<Value>> {
        let mut request = RestRequest::get(path).query("svm.name", self.svm.as_str());
        for (key, value) in filters {
            request = request.query(*key, *value);
        }
        if !fields.is_empty() {
            request = request.query("fields", fields);
        }
        collect(self.session.as_ref(), operation, request).await
    }

    async fn first(
        &self,
        operation: &str,
        path: &str,
        filters: &[(&str, &str)],
        fields: &str,
    ) -> Result<Option<Value>> {
        Ok(self
            .records(operation, path, filters, fields)
            .await?
            .into_iter()
            .next())
    }

    async fn exists(&self, operation: &str, path: &str, filters: &[(&str, &str)]) -> Result<bool> {
        Ok(self.first(operation, path, filters, "").await?.is_some())
    }

    /// UUID of a named entity, `None` when absent
    async fn find_uuid(&self, operation: &str, path: &str, name: &str) -> Result<Option<String>> {
        Ok(self
            .first(operation, path, &[("name", name)], "uuid")
            .await?
            .map(|r| str_at(&r, "/uuid")))
    }

    /// UUID of a named entity that must exist
    async fn require_uuid(&self, operation: &str, path: &str, kind: &str, name: &str) -> Result<String> {
        self.find_uuid(operation, path, name)
            .await?
            .ok_or_else(|| Error::not_found(kind, name))
    }

    async fn volume_uuid(&self, operation: &str, name: &str) -> Result<Option<String>> {
        self.find_uuid(operation, "/api/storage/volumes", name).await
    }

    async fn require_volume_uuid(&self, operation: &str, name: &str) -> Result<String> {
        self.require_uuid(operation, "/api/storage/volumes", "volume", name)
            .await
    }

    async fn delete_by_uuid(&self, operation: &str, path: String) -> Result<()> {
        absent_ok(self.call(operation, RestRequest::delete(path)).await.map(|_| ()))
    }

    /// Node currently hosting the LUN or namespace at `path`, if reported
    async fn hosting_node(&self, operation: &str, collection: &str, path: &str) -> Result<Option<String>> {
        Ok(self
            .first(operation, collection, &[("name", path)], "location.node.name")
            .await?
            .map(|r| str_at(&r, "/location/node/name"))
            .filter(|node| !node.is_empty()))
    }

    /// Enabled interfaces offering `service`, narrowed to `node` when known
    async fn interfaces(&self, operation: &str, service: &str, node: Option<&str>) -> Result<Vec<String>> {
        let mut filters = vec![("services", service), ("enabled", "true")];
        if let Some(node) = node {
            filters.push(("location.home_node.name", node));
        }
        let records = self
            .records(operation, "/api/network/ip/interfaces", &filters, "ip.address")
            .await?;
        Ok(records
            .iter()
            .map(|r| str_at(r, "/ip/address"))
            .filter(|a| !a.is_empty())
            .collect())
    }

    async fn upload_chunks(
        &self,
        operation: &str,
        volume: &str,
        path: &str,
        data: Bytes,
        chunk_size: usize,
    ) -> Result<()> {
        let uuid = self.require_volume_uuid(operation, volume).await?;
        let url = format!("/api/storage/volumes/{}/files/{}", uuid, encode_file_path(path));
        if data.is_empty() {
            let request = RestRequest::new(reqwest::Method::POST, url).form("data", data);
            return self.call(operation, request).await.map(|_| ());
        }
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + chunk_size).min(data.len());
            let chunk = data.slice(offset..end);
            let request = if offset == 0 {
                RestRequest::new(reqwest::Method::POST, url.clone()).form("data", chunk)
            } else {
                RestRequest::new(reqwest::Method::PATCH, url.clone())
                    .query("byte_offset", offset.to_string())
                    .form("data", chunk)
            };
            self.call(operation, request).await?;
            offset = end;
        }
        debug!("Uploaded {} bytes to {}:{}", data.len(), volume, path);
        Ok(())
    }
}

/// Send one request, translating faults into backend errors
async fn send(session: &dyn RestSession, operation: &str, request: RestRequest) -> Result<RestReply> {
    match session.send(request).await {
        Ok(reply) => Ok(reply),
        Err(RestFault::Api {
            status,
            code,
            message,
        }) => {
            let outcome = rest_outcome(status, &code);
            let code = if code.is_empty() { status.to_string() } else { code };
            Err(backend_error(operation, outcome, code, message))
        }
        Err(RestFault::Transport(e)) => Err(e.context(operation)),
    }
}

/// Follow `_links.next.href` until the collection is exhausted
async fn collect(session: &dyn RestSession, operation: &str, request: RestRequest) -> Result<Vec<Value>> {
    let mut records = Vec::new();
    let mut request = request;
    loop {
        let reply = send(session, operation, request).await?;
        records.extend(reply.records());
        match reply.next_href() {
            Some(href) => {
                let (path, query) = split_href(href)?;
                request = RestRequest::get(path);
                request.query = query;
            }
            None => return Ok(records),
        }
    }
}

#[async_trait]
impl StorageBackend for RestBackend {
    fn svm_name(&self) -> &str {
        &self.svm
    }

    fn backend_name(&self) -> &str {
        "rest"
    }

    // --- aggregates -----------------------------------------------------------

    async fn aggregate_list(&self) -> Result<Vec<AggregateInfo>> {
        let request = RestRequest::get("/api/svm/svms")
            .query("name", self.svm.as_str())
            .query("fields", "aggregates.name,aggregates.available_size");
        let records = collect(self.session.as_ref(), "aggregate_list", request).await?;
        let aggregates = records
            .first()
            .and_then(|r| r.get("aggregates"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(aggregates
            .iter()
            .map(|a| AggregateInfo {
                name: str_at(a, "/name"),
                available_bytes: u64_at(a, "/available_size"),
            })
            .collect())
    }

    // --- volumes --------------------------------------------------------------

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        self.exists("volume_exists", "/api/storage/volumes", &[("name", name)])
            .await
    }

    async fn volume_create_san(&self, name: &str, aggregate: &str, size_bytes: u64) -> Result<()> {
        let body = json!({
            "name": name,
            "svm": { "name": self.svm },
            "aggregates": [{ "name": aggregate }],
            "size": size_bytes,
            "guarantee": { "type": "none" },
            "space": { "snapshot": { "reserve_percent": 0 } },
            "snapshot_policy": { "name": "none" },
        });
        self.call("volume_create_san", RestRequest::post("/api/storage/volumes", body))
            .await
            .map(|_| ())
    }

    async fn volume_create_nas(
        &self,
        name: &str,
        aggregate: &str,
        export_policy: &str,
        size_bytes: u64,
    ) -> Result<()> {
        let body = json!({
            "name": name,
            "svm": { "name": self.svm },
            "aggregates": [{ "name": aggregate }],
            "size": size_bytes,
            "guarantee": { "type": "none" },
            "space": { "snapshot": { "reserve_percent": 0 } },
            "snapshot_policy": { "name": "none" },
            "nas": {
                "path": format!("/{}", name),
                "unix_permissions": 755,
                "export_policy": { "name": export_policy },
            },
        });
        self.call("volume_create_nas", RestRequest::post("/api/storage/volumes", body))
            .await
            .map(|_| ())
    }

    async fn volume_destroy(&self, name: &str) -> Result<()> {
        let Some(uuid) = self.volume_uuid("volume_destroy", name).await? else {
            return Ok(());
        };
        let url = format!("/api/storage/volumes/{}", uuid);
        let offline = RestRequest::patch(url.clone(), json!({ "state": "offline" }));
        absent_ok(self.call("volume_offline", offline).await.map(|_| ()))?;
        self.delete_by_uuid("volume_destroy", url).await
    }

    async fn volume_resize(&self, name: &str, size_bytes: u64) -> Result<()> {
        let uuid = self.require_volume_uuid("volume_resize", name).await?;
        let request = RestRequest::patch(
            format!("/api/storage/volumes/{}", uuid),
            json!({ "size": size_bytes }),
        );
        self.call("volume_resize", request).await.map(|_| ())
    }

    async fn export_policy_create(&self, name: &str) -> Result<()> {
        let body = json!({ "name": name, "svm": { "name": self.svm } });
        self.call(
            "export_policy_create",
            RestRequest::post("/api/protocols/nfs/export-policies", body),
        )
        .await
        .map(|_| ())
    }

    // --- initiator groups -----------------------------------------------------

    async fn igroup_exists(&self, name: &str) -> Result<bool> {
        self.exists("igroup_exists", "/api/protocols/san/igroups", &[("name", name)])
            .await
    }

    async fn igroup_create(&self, name: &str) -> Result<()> {
        let body = json!({
            "name": name,
            "svm": { "name": self.svm },
            "os_type": "linux",
            "protocol": "iscsi",
        });
        self.call("igroup_create", RestRequest::post("/api/protocols/san/igroups", body))
            .await
            .map(|_| ())
    }

    async fn igroup_add_initiator(&self, igroup: &str, initiator: &str) -> Result<()> {
        let uuid = self
            .require_uuid("igroup_add_initiator", "/api/protocols/san/igroups", "igroup", igroup)
            .await?;
        let request = RestRequest::post(
            format!("/api/protocols/san/igroups/{}/initiators", uuid),
            json!({ "records": [{ "name": initiator }] }),
        );
        self.call("igroup_add_initiator", request).await.map(|_| ())
    }

    async fn igroup_destroy(&self, name: &str) -> Result<()> {
        match self
            .find_uuid("igroup_destroy", "/api/protocols/san/igroups", name)
            .await?
        {
            Some(uuid) => {
                self.delete_by_uuid("igroup_destroy", format!("/api/protocols/san/igroups/{}", uuid))
                    .await
            }
            None => Ok(()),
        }
    }

    // --- LUNs -----------------------------------------------------------------

    async fn lun_exists(&self, path: &str) -> Result<bool> {
        self.exists("lun_exists", "/api/storage/luns", &[("name", path)])
            .await
    }

    async fn lun_is_mapped(&self, path: &str, igroup: &str) -> Result<bool> {
        self.exists(
            "lun_is_mapped",
            "/api/protocols/san/lun-maps",
            &[("lun.name", path), ("igroup.name", igroup)],
        )
        .await
    }

    async fn lun_get_info(&self, path: &str) -> Result<LunInfo> {
        let record = self
            .first("lun_get_info", "/api/storage/luns", &[("name", path)], "comment,space.size")
            .await?
            .ok_or_else(|| Error::not_found("LUN", path))?;
        Ok(LunInfo {
            comment: str_at(&record, "/comment"),
            size_bytes: u64_at(&record, "/space/size"),
        })
    }

    async fn lun_list(&self, volume: &str) -> Result<Vec<String>> {
        let records = self
            .records(
                "lun_list",
                "/api/storage/luns",
                &[("location.volume.name", volume)],
                "location.logical_unit",
            )
            .await?;
        Ok(records
            .iter()
            .map(|r| str_at(r, "/location/logical_unit"))
            .collect())
    }

    async fn lun_copy(&self, source_path: &str, dest_path: &str) -> Result<()> {
        let (volume, name) = split_lun_path(dest_path);
        let body = json!({
            "name": dest_path,
            "svm": { "name": self.svm },
            "location": { "logical_unit": name, "volume": { "name": volume } },
            "copy": { "source": { "name": source_path } },
        });
        self.call("lun_copy", RestRequest::post("/api/storage/luns", body))
            .await?;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(MAX_WAIT_FOR_LUN_SECS);
        loop {
            let state = self
                .first("lun_copy", "/api/storage/luns", &[("name", dest_path)], "status.state")
                .await?
                .map(|r| str_at(&r, "/status/state"))
                .unwrap_or_default();
            if state == "online" {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout {
                    operation: format!("lun_copy {} -> {}", source_path, dest_path),
                    seconds: MAX_WAIT_FOR_LUN_SECS,
                });
            }
            debug!("Waiting for {} to come online (state {:?})", dest_path, state);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn lun_resize(&self, path: &str, size_bytes: u64) -> Result<()> {
        let uuid = self
            .require_uuid("lun_resize", "/api/storage/luns", "LUN", path)
            .await?;
        let request = RestRequest::patch(
            format!("/api/storage/luns/{}", uuid),
            json!({ "space": { "size": size_bytes } }),
        );
        self.call("lun_resize", request).await.map(|_| ())
    }

    async fn lun_map(&self, path: &str, lun_id: u32, igroup: &str) -> Result<()> {
        let body = json!({
            "svm": { "name": self.svm },
            "igroup": { "name": igroup },
            "lun": { "name": path },
            "logical_unit_number": lun_id,
        });
        self.call("lun_map", RestRequest::post("/api/protocols/san/lun-maps", body))
            .await
            .map(|_| ())
    }

    async fn lun_unmap(&self, path: &str, igroup: &str) -> Result<()> {
        let map = self
            .first(
                "lun_unmap",
                "/api/protocols/san/lun-maps",
                &[("lun.name", path), ("igroup.name", igroup)],
                "lun.uuid,igroup.uuid",
            )
            .await?;
        match map {
            Some(map) => {
                let url = format!(
                    "/api/protocols/san/lun-maps/{}/{}",
                    str_at(&map, "/lun/uuid"),
                    str_at(&map, "/igroup/uuid")
                );
                self.delete_by_uuid("lun_unmap", url).await
            }
            None => Ok(()),
        }
    }

    async fn lun_create(&self, path: &str, size_bytes: u64) -> Result<()> {
        let (volume, name) = split_lun_path(path);
        let body = json!({
            "name": path,
            "svm": { "name": self.svm },
            "os_type": "linux",
            "space": { "size": size_bytes },
            "location": { "logical_unit": name, "volume": { "name": volume } },
        });
        self.call("lun_create", RestRequest::post("/api/storage/luns", body))
            .await
            .map(|_| ())
    }

    async fn lun_create_from_file(
        &self,
        volume: &str,
        file_path: &str,
        lun_path: &str,
        comment: &str,
    ) -> Result<()> {
        let body = json!({
            "vserver": self.svm,
            "path": lun_path,
            "file-path": format!("/vol/{}{}", volume, file_path),
            "ostype": "linux",
        });
        self.call("lun_create_from_file", RestRequest::post("/api/private/cli/lun", body))
            .await?;
        if comment.is_empty() {
            return Ok(());
        }
        let uuid = self
            .require_uuid("lun_create_from_file", "/api/storage/luns", "LUN", lun_path)
            .await?;
        let request = RestRequest::patch(
            format!("/api/storage/luns/{}", uuid),
            json!({ "comment": comment }),
        );
        self.call("lun_create_from_file", request).await.map(|_| ())
    }

    async fn lun_create_and_upload(
        &self,
        volume: &str,
        _file_path: &str,
        data: Bytes,
        lun_path: &str,
        comment: &str,
    ) -> Result<()> {
        let (_, name) = split_lun_path(lun_path);
        let body = json!({
            "name": lun_path,
            "comment": comment,
            "svm": { "name": self.svm },
            "os_type": "linux",
            "space": { "size": data.len() as u64 + LUN_UPLOAD_OVERHEAD },
            "location": { "logical_unit": name, "volume": { "name": volume } },
        });
        let reply = self
            .call(
                "lun_create_and_upload",
                RestRequest::post("/api/storage/luns", body).query("return_records", "true"),
            )
            .await?;
        let uuid = match reply.records().first().map(|r| str_at(r, "/uuid")) {
            Some(uuid) if !uuid.is_empty() => uuid,
            _ => {
                self.require_uuid("lun_create_and_upload", "/api/storage/luns", "LUN", lun_path)
                    .await?
            }
        };
        let request = RestRequest::new(reqwest::Method::PATCH, format!("/api/storage/luns/{}", uuid))
            .query("data.offset", "0")
            .octets(data);
        self.call("lun_create_and_upload", request).await.map(|_| ())
    }

    async fn lun_destroy(&self, path: &str) -> Result<()> {
        match self.find_uuid("lun_destroy", "/api/storage/luns", path).await? {
            Some(uuid) => {
                self.delete_by_uuid("lun_destroy", format!("/api/storage/luns/{}", uuid))
                    .await
            }
            None => Ok(()),
        }
    }

    // --- iSCSI ----------------------------------------------------------------

    async fn iscsi_target_name(&self) -> Result<String> {
        self.first(
            "iscsi_target_name",
            "/api/protocols/san/iscsi/services",
            &[("enabled", "true")],
            "target.name",
        )
        .await?
        .map(|r| str_at(&r, "/target/name"))
        .ok_or_else(|| Error::not_found("iSCSI service", &self.svm))
    }

    async fn discover_iscsi_lifs(&self, lun_path: &str, subnet: &str) -> Result<Vec<String>> {
        let node = self
            .hosting_node("discover_iscsi_lifs", "/api/storage/luns", lun_path)
            .await?;
        let addresses = self
            .interfaces("discover_iscsi_lifs", "data_iscsi", node.as_deref())
            .await?;
        filter_subnet(addresses, subnet)
    }

    // --- files ----------------------------------------------------------------

    async fn file_exists(&self, volume: &str, path: &str) -> Result<bool> {
        let uuid = self.require_volume_uuid("file_exists", volume).await?;
        let (dir, name) = split_file_path(path);
        let request = RestRequest::get(format!(
            "/api/storage/volumes/{}/files/{}",
            uuid,
            encode_file_path(dir)
        ))
        .query("name", name)
        .query("type", "file");
        match collect(self.session.as_ref(), "file_exists", request).await {
            Ok(records) => Ok(!records.is_empty()),
            Err(Error::Backend {
                outcome: Outcome::AbsentOk,
                ..
            }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn file_list(&self, volume: &str, dir: &str) -> Result<Vec<String>> {
        let uuid = self.require_volume_uuid("file_list", volume).await?;
        let request = RestRequest::get(format!(
            "/api/storage/volumes/{}/files/{}",
            uuid,
            encode_file_path(dir)
        ))
        .query("type", "file")
        .query("fields", "name");
        let records = match collect(self.session.as_ref(), "file_list", request).await {
            Ok(records) => records,
            Err(Error::Backend {
                outcome: Outcome::AbsentOk,
                ..
            }) => Vec::new(),
            Err(e) => return Err(e),
        };
        Ok(records
            .iter()
            .map(|r| str_at(r, "/name"))
            .filter(|n| !n.is_empty() && !n.starts_with('.'))
            .collect())
    }

    async fn file_delete(&self, volume: &str, path: &str) -> Result<()> {
        match self.volume_uuid("file_delete", volume).await? {
            Some(uuid) => {
                let url = format!("/api/storage/volumes/{}/files/{}", uuid, encode_file_path(path));
                self.delete_by_uuid("file_delete", url).await
            }
            None => Ok(()),
        }
    }

    async fn file_download(&self, volume: &str, path: &str) -> Result<Bytes> {
        let uuid = self.require_volume_uuid("file_download", volume).await?;
        let (dir, name) = split_file_path(path);
        let info = collect(
            self.session.as_ref(),
            "file_download",
            RestRequest::get(format!(
                "/api/storage/volumes/{}/files/{}",
                uuid,
                encode_file_path(dir)
            ))
            .query("name", name)
            .query("fields", "size"),
        )
        .await?;
        let size = info
            .first()
            .map(|r| u64_at(r, "/size") as usize)
            .ok_or_else(|| Error::not_found("file", format!("{}:{}", volume, path)))?;

        let url = format!("/api/storage/volumes/{}/files/{}", uuid, encode_file_path(path));
        let mut content = Vec::with_capacity(size);
        while content.len() < size {
            let length = (size - content.len()).min(FILE_CHUNK_SIZE);
            let request = RestRequest::get(url.clone())
                .query("byte_offset", content.len().to_string())
                .query("length", length.to_string())
                .accept_multipart();
            let reply = self.call("file_download", request).await?;
            if reply.content.is_empty() {
                break;
            }
            content.extend_from_slice(&reply.content);
        }
        Ok(Bytes::from(content))
    }

    async fn file_upload_api(&self, volume: &str, path: &str, data: Bytes) -> Result<()> {
        let len = data.len().max(1);
        self.upload_chunks("file_upload_api", volume, path, data, len)
            .await
    }

    async fn file_upload_nfs(&self, volume: &str, path: &str, data: Bytes) -> Result<()> {
        self.upload_chunks("file_upload_nfs", volume, path, data, FILE_CHUNK_SIZE)
            .await
    }

    // --- snapshots ------------------------------------------------------------

    async fn snapshot_list(&self, volume: &str) -> Result<Vec<String>> {
        let uuid = self.require_volume_uuid("snapshot_list", volume).await?;
        let request = RestRequest::get(format!("/api/storage/volumes/{}/snapshots", uuid))
            .query("fields", "name");
        let records = collect(self.session.as_ref(), "snapshot_list", request).await?;
        Ok(records.iter().map(|r| str_at(r, "/name")).collect())
    }

    async fn snapshot_create(&self, volume: &str, name: &str, comment: &str) -> Result<()> {
        let uuid = self.require_volume_uuid("snapshot_create", volume).await?;
        let request = RestRequest::post(
            format!("/api/storage/volumes/{}/snapshots", uuid),
            json!({ "name": name, "comment": comment }),
        );
        self.call("snapshot_create", request).await.map(|_| ())
    }

    async fn snapshot_delete(&self, volume: &str, name: &str) -> Result<()> {
        let Some(uuid) = self.volume_uuid("snapshot_delete", volume).await? else {
            return Ok(());
        };
        let request = RestRequest::get(format!("/api/storage/volumes/{}/snapshots", uuid))
            .query("name", name)
            .query("fields", "uuid");
        let snapshot = collect(self.session.as_ref(), "snapshot_delete", request).await?;
        match snapshot.first().map(|r| str_at(r, "/uuid")) {
            Some(snap_uuid) => {
                self.delete_by_uuid(
                    "snapshot_delete",
                    format!("/api/storage/volumes/{}/snapshots/{}", uuid, snap_uuid),
                )
                .await
            }
            None => Ok(()),
        }
    }

    async fn snapshot_restore(&self, volume: &str, name: &str) -> Result<()> {
        let uuid = self.require_volume_uuid("snapshot_restore", volume).await?;
        let request = RestRequest::get(format!("/api/storage/volumes/{}/snapshots", uuid))
            .query("name", name)
            .query("fields", "uuid");
        let snap_uuid = collect(self.session.as_ref(), "snapshot_restore", request)
            .await?
            .first()
            .map(|r| str_at(r, "/uuid"))
            .ok_or_else(|| Error::not_found("snapshot", format!("{}@{}", volume, name)))?;
        let request = RestRequest::patch(format!("/api/storage/volumes/{}", uuid), json!({}))
            .query("restore_to.snapshot.uuid", snap_uuid);
        self.call("snapshot_restore", request).await.map(|_| ())
    }

    // --- NVMe -----------------------------------------------------------------

    async fn nvme_namespace_exists(&self, path: &str) -> Result<bool> {
        self.exists("nvme_namespace_exists", "/api/storage/namespaces", &[("name", path)])
            .await
    }

    async fn nvme_namespace_create(&self, path: &str, size_bytes: u64) -> Result<()> {
        let (volume, name) = split_lun_path(path);
        let body = json!({
            "name": path,
            "svm": { "name": self.svm },
            "os_type": "linux",
            "space": { "size": size_bytes, "block_size": 4096 },
            "location": { "namespace": name, "volume": { "name": volume } },
        });
        self.call("nvme_namespace_create", RestRequest::post("/api/storage/namespaces", body))
            .await
            .map(|_| ())
    }

    async fn nvme_namespace_destroy(&self, path: &str) -> Result<()> {
        match self
            .find_uuid("nvme_namespace_destroy", "/api/storage/namespaces", path)
            .await?
        {
            Some(uuid) => {
                self.delete_by_uuid(
                    "nvme_namespace_destroy",
                    format!("/api/storage/namespaces/{}", uuid),
                )
                .await
            }
            None => Ok(()),
        }
    }

    async fn nvme_namespace_is_mapped(&self, path: &str) -> Result<bool> {
        self.exists(
            "nvme_namespace_is_mapped",
            "/api/protocols/nvme/subsystem-maps",
            &[("namespace.name", path)],
        )
        .await
    }

    async fn nvme_namespace_map(&self, path: &str, subsystem: &str) -> Result<()> {
        let body = json!({
            "svm": { "name": self.svm },
            "namespace": { "name": path },
            "subsystem": { "name": subsystem },
        });
        self.call(
            "nvme_namespace_map",
            RestRequest::post("/api/protocols/nvme/subsystem-maps", body),
        )
        .await
        .map(|_| ())
    }

    async fn nvme_namespace_unmap(&self, path: &str) -> Result<()> {
        let map = self
            .first(
                "nvme_namespace_unmap",
                "/api/protocols/nvme/subsystem-maps",
                &[("namespace.name", path)],
                "subsystem.uuid,namespace.uuid",
            )
            .await?;
        match map {
            Some(map) => {
                let url = format!(
                    "/api/protocols/nvme/subsystem-maps/{}/{}",
                    str_at(&map, "/subsystem/uuid"),
                    str_at(&map, "/namespace/uuid")
                );
                self.delete_by_uuid("nvme_namespace_unmap", url).await
            }
            None => Ok(()),
        }
    }

    async fn nvme_namespace_get_info(&self, path: &str) -> Result<NamespaceInfo> {
        let record = self
            .first(
                "nvme_namespace_get_info",
                "/api/storage/namespaces",
                &[("name", path)],
                "space.size",
            )
            .await?
            .ok_or_else(|| Error::not_found("NVMe namespace", path))?;
        Ok(NamespaceInfo {
            size_bytes: u64_at(&record, "/space/size"),
        })
    }

    async fn nvme_namespace_resize(&self, path: &str, size_bytes: u64) -> Result<()> {
        let uuid = self
            .require_uuid(
                "nvme_namespace_resize",
                "/api/storage/namespaces",
                "NVMe namespace",
                path,
            )
            .await?;
        let request = RestRequest::patch(
            format!("/api/storage/namespaces/{}", uuid),
            json!({ "space": { "size": size_bytes } }),
        );
        self.call("nvme_namespace_resize", request).await.map(|_| ())
    }

    async fn nvme_subsystem_exists(&self, name: &str) -> Result<bool> {
        self.exists(
            "nvme_subsystem_exists",
            "/api/protocols/nvme/subsystems",
            &[("name", name)],
        )
        .await
    }

    async fn nvme_subsystem_create(&self, name: &str) -> Result<()> {
        let body = json!({
            "name": name,
            "svm": { "name": self.svm },
            "os_type": "linux",
        });
        self.call(
            "nvme_subsystem_create",
            RestRequest::post("/api/protocols/nvme/subsystems", body),
        )
        .await
        .map(|_| ())
    }

    async fn nvme_subsystem_destroy(&self, name: &str) -> Result<()> {
        match self
            .find_uuid("nvme_subsystem_destroy", "/api/protocols/nvme/subsystems", name)
            .await?
        {
            Some(uuid) => {
                let request = RestRequest::delete(format!("/api/protocols/nvme/subsystems/{}", uuid))
                    .query("allow_delete_while_mapped", "true")
                    .query("allow_delete_with_hosts", "true");
                absent_ok(self.call("nvme_subsystem_destroy", request).await.map(|_| ()))
            }
            None => Ok(()),
        }
    }

    async fn nvme_subsystem_add_host(&self, subsystem: &str, host_nqn: &str) -> Result<()> {
        let uuid = self
            .require_uuid(
                "nvme_subsystem_add_host",
                "/api/protocols/nvme/subsystems",
                "NVMe subsystem",
                subsystem,
            )
            .await?;
        let request = RestRequest::post(
            format!("/api/protocols/nvme/subsystems/{}/hosts", uuid),
            json!({ "records": [{ "nqn": host_nqn }] }),
        );
        self.call("nvme_subsystem_add_host", request).await.map(|_| ())
    }

    async fn nvme_target_nqn(&self, subsystem: &str) -> Result<String> {
        self.first(
            "nvme_target_nqn",
            "/api/protocols/nvme/subsystems",
            &[("name", subsystem)],
            "target_nqn",
        )
        .await?
        .map(|r| str_at(&r, "/target_nqn"))
        .ok_or_else(|| Error::not_found("NVMe subsystem", subsystem))
    }

    async fn nvme_lifs(&self) -> Result<Vec<String>> {
        self.interfaces("nvme_lifs", "data_nvme_tcp", None).await
    }

    async fn discover_nvme_lifs(&self, namespace_path: &str, subnet: &str) -> Result<Vec<String>> {
        let node = self
            .hosting_node("discover_nvme_lifs", "/api/storage/namespaces", namespace_path)
            .await?;
        let addresses = self
            .interfaces("discover_nvme_lifs", "data_nvme_tcp", node.as_deref())
            .await?;
        filter_subnet(addresses, subnet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::rest_session::RestBody;
    use crate::error::ErrorClass;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use reqwest::Method;

    type Scripted = std::result::Result<RestReply, (u16, &'static str)>;

    /// Session answering requests from a script, in order
    #[derive(Default)]
    struct ScriptedSession {
        script: Mutex<Vec<(Method, String, Scripted)>>,
        sent: Mutex<Vec<RestRequest>>,
    }

    impl ScriptedSession {
        fn expect(&self, method: Method, path: &str, reply: Scripted) -> &Self {
            self.script.lock().push((method, path.to_string(), reply));
            self
        }

        fn sent(&self) -> Vec<RestRequest> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl RestSession for ScriptedSession {
        async fn send(&self, request: RestRequest) -> std::result::Result<RestReply, RestFault> {
            self.sent.lock().push(request.clone());
            let mut script = self.script.lock();
            assert!(!script.is_empty(), "unexpected request {} {}", request.method, request.path);
            let (method, path, reply) = script.remove(0);
            assert_eq!((request.method.clone(), request.path.as_str()), (method, path.as_str()));
            reply.map_err(|(status, code)| RestFault::Api {
                status,
                code: code.to_string(),
                message: format!("scripted failure {}", code),
            })
        }
    }

    fn records(values: Value) -> Scripted {
        Ok(RestReply::json(200, json!({ "records": values })))
    }

    fn backend(session: &Arc<ScriptedSession>) -> RestBackend {
        RestBackend::with_svm(session.clone(), "svm1")
    }

    #[tokio::test]
    async fn test_connect_resolves_single_scope() {
        let session = Arc::new(ScriptedSession::default());
        session.expect(Method::GET, "/api/svm/svms", records(json!([{ "name": "svm1" }])));
        let backend = RestBackend::connect(session.clone(), None).await.unwrap();
        assert_eq!(backend.svm_name(), "svm1");
    }

    #[tokio::test]
    async fn test_connect_rejects_ambiguous_and_missing_scope() {
        let session = Arc::new(ScriptedSession::default());
        session.expect(
            Method::GET,
            "/api/svm/svms",
            records(json!([{ "name": "svm1" }, { "name": "svm2" }])),
        );
        let err = RestBackend::connect(session.clone(), None).await.err().unwrap();
        assert_matches!(err, Error::AmbiguousScope { candidates: 2 });

        let session = Arc::new(ScriptedSession::default());
        session.expect(Method::GET, "/api/svm/svms", records(json!([])));
        let err = RestBackend::connect(session.clone(), Some("svm9")).await.err().unwrap();
        assert_eq!(err.class(), ErrorClass::NotFound);
        assert_eq!(session.sent()[0].query_value("name"), Some("svm9"));
    }

    #[tokio::test]
    async fn test_collect_follows_next_link() {
        let session = Arc::new(ScriptedSession::default());
        session
            .expect(
                Method::GET,
                "/api/storage/luns",
                Ok(RestReply::json(
                    200,
                    json!({
                        "records": [{ "location": { "logical_unit": "a" } }],
                        "_links": { "next": { "href": "/api/storage/luns?start.uuid=u1&location.volume.name=v1" } }
                    }),
                )),
            )
            .expect(
                Method::GET,
                "/api/storage/luns",
                records(json!([{ "location": { "logical_unit": "b" } }])),
            );
        let luns = backend(&session).lun_list("v1").await.unwrap();
        assert_eq!(luns, vec!["a", "b"]);
        assert_eq!(session.sent()[1].query_value("start.uuid"), Some("u1"));
    }

    #[tokio::test]
    async fn test_destroy_of_absent_lun_sends_no_delete() {
        let session = Arc::new(ScriptedSession::default());
        session.expect(Method::GET, "/api/storage/luns", records(json!([])));
        backend(&session).lun_destroy("/vol/v1/boot").await.unwrap();
        assert_eq!(session.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_destroy_race_translates_entry_absent() {
        let session = Arc::new(ScriptedSession::default());
        session
            .expect(Method::GET, "/api/storage/luns", records(json!([{ "uuid": "l1" }])))
            .expect(Method::DELETE, "/api/storage/luns/l1", Err((404, "4")));
        backend(&session).lun_destroy("/vol/v1/boot").await.unwrap();
    }

    #[tokio::test]
    async fn test_unmap_uses_both_uuids() {
        let session = Arc::new(ScriptedSession::default());
        session
            .expect(
                Method::GET,
                "/api/protocols/san/lun-maps",
                records(json!([{ "lun": { "uuid": "l1" }, "igroup": { "uuid": "g1" } }])),
            )
            .expect(
                Method::DELETE,
                "/api/protocols/san/lun-maps/l1/g1",
                Ok(RestReply::json(200, Value::Null)),
            );
        backend(&session).lun_unmap("/vol/v1/boot", "ig1").await.unwrap();
    }

    #[tokio::test]
    async fn test_create_conflict_is_not_swallowed() {
        let session = Arc::new(ScriptedSession::default());
        session.expect(Method::POST, "/api/protocols/san/igroups", Err((409, "1")));
        let err = backend(&session).igroup_create("ig1").await.unwrap_err();
        assert_matches!(
            err,
            Error::Backend {
                outcome: Outcome::Conflict,
                ref operation,
                ..
            } if operation == "igroup_create"
        );
    }

    #[tokio::test]
    async fn test_lun_get_info_rounds_size() {
        let session = Arc::new(ScriptedSession::default());
        session.expect(
            Method::GET,
            "/api/storage/luns",
            records(json!([{ "comment": "ubuntu-22.04", "space": { "size": 21_474_836_480u64 + 1000 } }])),
        );
        let info = backend(&session).lun_get_info("/vol/v1/boot").await.unwrap();
        assert_eq!(info.comment, "ubuntu-22.04");
        assert_eq!(info.size_gib(), 20);
    }

    #[tokio::test]
    async fn test_iscsi_lifs_filtered_by_node_and_subnet() {
        let session = Arc::new(ScriptedSession::default());
        session
            .expect(
                Method::GET,
                "/api/storage/luns",
                records(json!([{ "location": { "node": { "name": "cluster-02" } } }])),
            )
            .expect(
                Method::GET,
                "/api/network/ip/interfaces",
                records(json!([
                    { "ip": { "address": "192.168.10.11" } },
                    { "ip": { "address": "192.168.11.11" } },
                    { "ip": { "address": "192.168.10.12" } }
                ])),
            );
        let lifs = backend(&session)
            .discover_iscsi_lifs("/vol/v1/boot", "192.168.10.0/24")
            .await
            .unwrap();
        assert_eq!(lifs, vec!["192.168.10.11", "192.168.10.12"]);
        let sent = session.sent();
        assert_eq!(sent[0].query_value("name"), Some("/vol/v1/boot"));
        assert_eq!(sent[1].query_value("services"), Some("data_iscsi"));
        assert_eq!(sent[1].query_value("location.home_node.name"), Some("cluster-02"));
    }

    #[tokio::test]
    async fn test_nvme_lifs_unscoped_without_hosting_node() {
        let session = Arc::new(ScriptedSession::default());
        session
            .expect(Method::GET, "/api/storage/namespaces", records(json!([])))
            .expect(
                Method::GET,
                "/api/network/ip/interfaces",
                records(json!([{ "ip": { "address": "10.1.0.10" } }])),
            );
        let lifs = backend(&session)
            .discover_nvme_lifs("/vol/v1/nvme", "10.1.0.0/24")
            .await
            .unwrap();
        assert_eq!(lifs, vec!["10.1.0.10"]);
        let sent = session.sent();
        assert_eq!(sent[1].query_value("services"), Some("data_nvme_tcp"));
        assert_eq!(sent[1].query_value("location.home_node.name"), None);
    }

    #[tokio::test]
    async fn test_volume_offline_before_delete() {
        let session = Arc::new(ScriptedSession::default());
        session
            .expect(Method::GET, "/api/storage/volumes", records(json!([{ "uuid": "v1" }])))
            .expect(Method::PATCH, "/api/storage/volumes/v1", Ok(RestReply::json(202, Value::Null)))
            .expect(Method::DELETE, "/api/storage/volumes/v1", Ok(RestReply::json(202, Value::Null)));
        backend(&session).volume_destroy("node1_iboot").await.unwrap();
        let sent = session.sent();
        assert_eq!(sent[1].body, RestBody::Json(json!({ "state": "offline" })));
        assert_eq!(sent[2].method, Method::DELETE);
    }

    #[tokio::test]
    async fn test_volume_offline_failure_keeps_volume() {
        let session = Arc::new(ScriptedSession::default());
        session
            .expect(Method::GET, "/api/storage/volumes", records(json!([{ "uuid": "v1" }])))
            .expect(Method::PATCH, "/api/storage/volumes/v1", Err((503, "0")));
        let err = backend(&session).volume_destroy("node1_iboot").await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Backend(Outcome::Transient));
        assert_eq!(session.sent().len(), 2);

        // Vanished between lookup and offline
        let session = Arc::new(ScriptedSession::default());
        session
            .expect(Method::GET, "/api/storage/volumes", records(json!([{ "uuid": "v1" }])))
            .expect(Method::PATCH, "/api/storage/volumes/v1", Err((404, "4")))
            .expect(Method::DELETE, "/api/storage/volumes/v1", Err((404, "4")));
        backend(&session).volume_destroy("node1_iboot").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lun_copy_waits_for_online() {
        let session = Arc::new(ScriptedSession::default());
        session
            .expect(Method::POST, "/api/storage/luns", Ok(RestReply::json(201, Value::Null)))
            .expect(
                Method::GET,
                "/api/storage/luns",
                records(json!([{ "status": { "state": "offline" } }])),
            )
            .expect(
                Method::GET,
                "/api/storage/luns",
                records(json!([{ "status": { "state": "online" } }])),
            );
        backend(&session)
            .lun_copy("/vol/image_repo/ubuntu", "/vol/v1/boot")
            .await
            .unwrap();
        assert_eq!(session.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_file_list_hides_dotfiles_and_missing_dir() {
        let session = Arc::new(ScriptedSession::default());
        session
            .expect(Method::GET, "/api/storage/volumes", records(json!([{ "uuid": "v1" }])))
            .expect(
                Method::GET,
                "/api/storage/volumes/v1/files/cloud-init",
                records(json!([{ "name": ".snapshot" }, { "name": "ubuntu.tmpl" }])),
            )
            .expect(Method::GET, "/api/storage/volumes", records(json!([{ "uuid": "v1" }])))
            .expect(Method::GET, "/api/storage/volumes/v1/files/cloud-init", Err((404, "2")));
        let backend = backend(&session);
        assert_eq!(
            backend.file_list("template_repo", "/cloud-init").await.unwrap(),
            vec!["ubuntu.tmpl"]
        );
        assert!(backend.file_list("template_repo", "/cloud-init").await.unwrap().is_empty());
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(split_lun_path("/vol/v1/boot"), ("v1", "boot"));
        assert_eq!(split_file_path("/seed"), ("/", "seed"));
        assert_eq!(split_file_path("/cloud-init/a.tmpl"), ("/cloud-init", "a.tmpl"));
        assert_eq!(encode_file_path("/cloud-init/a.tmpl"), "cloud-init%2Fa.tmpl");
        assert_eq!(encode_file_path("/"), ".");
    }
}
