//! ZAPI Storage Adapter
//!
//! Implements [`StorageBackend`] over the legacy XML API. Calls are tunnelled
//! to the resolved vserver; only scope resolution and aggregate listing run at
//! cluster level.

use super::outcome::{absent_ok, backend_error, zapi_outcome};
use super::zapi_session::{ZapiElement, ZapiFault, ZapiSession};
use super::{filter_subnet, resolve_scope};
use crate::domain::ports::{
    AggregateInfo, LunInfo, NamespaceInfo, Outcome, StorageBackend,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Page size requested from `*-get-iter` calls
const MAX_RECORDS: u32 = 1024;

/// Maximum bytes per `file-read-file` / `file-write-file` call
const FILE_CHUNK_SIZE: usize = 1024 * 1024;

/// Maximum wait for a copied LUN to come online
const MAX_WAIT_FOR_LUN_SECS: u64 = 300;

fn query(info: &str, fields: &[(&str, &str)]) -> ZapiElement {
    fields
        .iter()
        .fold(ZapiElement::new(info), |e, (k, v)| e.field(*k, *v))
}

fn text_of(element: &ZapiElement, name: &str) -> String {
    element.child_text(name).unwrap_or_default().to_string()
}

fn u64_of(element: &ZapiElement, name: &str) -> u64 {
    element
        .child_text(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Invoke one API and translate faults into backend errors
async fn invoke(
    session: &dyn ZapiSession,
    vserver: Option<&str>,
    request: ZapiElement,
) -> Result<ZapiElement> {
    let operation = request.name.clone();
    match session.invoke(vserver, request).await {
        Ok(results) => Ok(results),
        Err(ZapiFault::Api { errno, reason }) => Err(backend_error(
            &operation,
            zapi_outcome(errno),
            errno.to_string(),
            reason,
        )),
        Err(ZapiFault::Transport(e)) => Err(e.context(operation)),
    }
}

/// Collect every record of an iterator API, following `next-tag`
async fn get_iter(
    session: &dyn ZapiSession,
    vserver: Option<&str>,
    api: &str,
    query: Option<ZapiElement>,
) -> Result<Vec<ZapiElement>> {
    let mut records = Vec::new();
    let mut tag: Option<String> = None;
    loop {
        let mut request = ZapiElement::new(api).field("max-records", MAX_RECORDS);
        if let Some(query) = &query {
            request = request.with(ZapiElement::new("query").with(query.clone()));
        }
        if let Some(tag) = &tag {
            request = request.field("tag", tag);
        }
        let mut results = invoke(session, vserver, request).await?;
        if let Some(list) = results
            .children
            .iter_mut()
            .find(|c| c.name == "attributes-list")
        {
            records.append(&mut list.children);
        }
        match results.child_text("next-tag").filter(|t| !t.is_empty()) {
            Some(next) => tag = Some(next.to_string()),
            None => return Ok(records),
        }
    }
}

// =============================================================================
// ZAPI Adapter
// =============================================================================

/// Storage backend over the ZAPI protocol
pub struct ZapiBackend {
    session: Arc<dyn ZapiSession>,
    svm: String,
}

impl ZapiBackend {
    /// Resolve the vserver scope among data vservers
    pub async fn connect(session: Arc<dyn ZapiSession>, svm_hint: Option<&str>) -> Result<Self> {
        let records = get_iter(
            session.as_ref(),
            None,
            "vserver-get-iter",
            Some(query("vserver-info", &[("vserver-type", "data")])),
        )
        .await?;
        let candidates: Vec<String> = records
            .iter()
            .map(|r| text_of(r, "vserver-name"))
            .collect();
        let svm = resolve_scope(svm_hint, &candidates)?;
        info!("ZAPI session bound to vserver {}", svm);
        Ok(Self { session, svm })
    }

    pub fn with_svm(session: Arc<dyn ZapiSession>, svm: impl Into<String>) -> Self {
        Self {
            session,
            svm: svm.into(),
        }
    }

    async fn call(&self, request: ZapiElement) -> Result<ZapiElement> {
        invoke(self.session.as_ref(), Some(&self.svm), request).await
    }

    async fn call_unit(&self, request: ZapiElement) -> Result<()> {
        self.call(request).await.map(|_| ())
    }

    async fn records(&self, api: &str, filter: ZapiElement) -> Result<Vec<ZapiElement>> {
        get_iter(self.session.as_ref(), Some(&self.svm), api, Some(filter)).await
    }

    async fn first(&self, api: &str, filter: ZapiElement) -> Result<Option<ZapiElement>> {
        Ok(self.records(api, filter).await?.into_iter().next())
    }

    /// Node currently hosting the LUN or namespace at `path`, if reported
    async fn hosting_node(&self, api: &str, info: &str, path: &str) -> Result<Option<String>> {
        Ok(self
            .first(api, query(info, &[("path", path)]))
            .await?
            .map(|r| text_of(&r, "node"))
            .filter(|node| !node.is_empty()))
    }

    async fn interfaces(&self, protocol: &str, node: Option<&str>) -> Result<Vec<String>> {
        let mut filter = ZapiElement::new("net-interface-info").with(
            ZapiElement::new("data-protocols").field("data-protocol", protocol),
        );
        if let Some(node) = node {
            filter = filter.field("home-node", node);
        }
        let records = self.records("net-interface-get-iter", filter).await?;
        Ok(records
            .iter()
            .map(|r| text_of(r, "address"))
            .filter(|a| !a.is_empty())
            .collect())
    }

    async fn write_file(&self, volume: &str, path: &str, data: &[u8], chunk_size: usize) -> Result<()> {
        let full_path = format!("/vol/{}{}", volume, path);
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(chunk_size).collect()
        };
        let mut offset = 0;
        for chunk in chunks {
            let request = ZapiElement::new("file-write-file")
                .field("path", &full_path)
                .field("offset", offset)
                .field("data", hex::encode(chunk))
                .field("overwrite", offset == 0);
            self.call_unit(request).await?;
            offset += chunk.len();
        }
        debug!("Wrote {} bytes to {}", data.len(), full_path);
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for ZapiBackend {
    fn svm_name(&self) -> &str {
        &self.svm
    }

    fn backend_name(&self) -> &str {
        "zapi"
    }

    async fn aggregate_list(&self) -> Result<Vec<AggregateInfo>> {
        let request = ZapiElement::new("vserver-show-aggr-get-iter")
            .field("max-records", MAX_RECORDS)
            .field("vserver", &self.svm);
        let results = invoke(self.session.as_ref(), None, request).await?;
        Ok(results
            .child("attributes-list")
            .map(|list| {
                list.children
                    .iter()
                    .map(|a| AggregateInfo {
                        name: text_of(a, "aggregate-name"),
                        available_bytes: u64_of(a, "available-size"),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        let filter = ZapiElement::new("volume-attributes")
            .with(query("volume-id-attributes", &[("name", name)]));
        Ok(self.first("volume-get-iter", filter).await?.is_some())
    }

    async fn volume_create_san(&self, name: &str, aggregate: &str, size_bytes: u64) -> Result<()> {
        let request = ZapiElement::new("volume-create")
            .field("volume", name)
            .field("containing-aggr-name", aggregate)
            .field("size", size_bytes)
            .field("space-reserve", "none")
            .field("percentage-snapshot-reserve", 0)
            .field("snapshot-policy", "none");
        self.call_unit(request).await
    }

    async fn volume_create_nas(
        &self,
        name: &str,
        aggregate: &str,
        export_policy: &str,
        size_bytes: u64,
    ) -> Result<()> {
        let request = ZapiElement::new("volume-create")
            .field("volume", name)
            .field("containing-aggr-name", aggregate)
            .field("size", size_bytes)
            .field("space-reserve", "none")
            .field("percentage-snapshot-reserve", 0)
            .field("snapshot-policy", "none")
            .field("junction-path", format!("/{}", name))
            .field("export-policy", export_policy)
            .field("volume-security-style", "unix")
            .field("unix-permissions", "0755");
        self.call_unit(request).await
    }

    async fn volume_destroy(&self, name: &str) -> Result<()> {
        absent_ok(
            self.call_unit(ZapiElement::new("volume-offline").field("name", name))
                .await,
        )?;
        absent_ok(
            self.call_unit(ZapiElement::new("volume-destroy").field("name", name))
                .await,
        )
    }

    async fn volume_resize(&self, name: &str, size_bytes: u64) -> Result<()> {
        let request = ZapiElement::new("volume-size")
            .field("volume", name)
            .field("new-size", size_bytes);
        self.call_unit(request).await
    }

    async fn export_policy_create(&self, name: &str) -> Result<()> {
        self.call_unit(ZapiElement::new("export-policy-create").field("policy-name", name))
            .await
    }

    async fn igroup_exists(&self, name: &str) -> Result<bool> {
        let filter = query("initiator-group-info", &[("initiator-group-name", name)]);
        Ok(self.first("igroup-get-iter", filter).await?.is_some())
    }

    async fn igroup_create(&self, name: &str) -> Result<()> {
        let request = ZapiElement::new("igroup-create")
            .field("initiator-group-name", name)
            .field("initiator-group-type", "iscsi")
            .field("os-type", "linux");
        self.call_unit(request).await
    }

    async fn igroup_add_initiator(&self, igroup: &str, initiator: &str) -> Result<()> {
        let request = ZapiElement::new("igroup-add")
            .field("initiator-group-name", igroup)
            .field("initiator", initiator);
        self.call_unit(request).await
    }

    async fn igroup_destroy(&self, name: &str) -> Result<()> {
        absent_ok(
            self.call_unit(ZapiElement::new("igroup-destroy").field("initiator-group-name", name))
                .await,
        )
    }

    async fn lun_exists(&self, path: &str) -> Result<bool> {
        let filter = query("lun-info", &[("path", path)]);
        Ok(self.first("lun-get-iter", filter).await?.is_some())
    }

    async fn lun_is_mapped(&self, path: &str, igroup: &str) -> Result<bool> {
        let filter = query("lun-map-info", &[("path", path), ("initiator-group", igroup)]);
        Ok(self.first("lun-map-get-iter", filter).await?.is_some())
    }

    async fn lun_get_info(&self, path: &str) -> Result<LunInfo> {
        let record = self
            .first("lun-get-iter", query("lun-info", &[("path", path)]))
            .await?
            .ok_or_else(|| Error::not_found("LUN", path))?;
        Ok(LunInfo {
            comment: text_of(&record, "comment"),
            size_bytes: u64_of(&record, "size"),
        })
    }

    async fn lun_list(&self, volume: &str) -> Result<Vec<String>> {
        let records = self
            .records("lun-get-iter", query("lun-info", &[("volume", volume)]))
            .await?;
        Ok(records
            .iter()
            .map(|r| {
                let path = text_of(r, "path");
                path.rsplit('/').next().unwrap_or_default().to_string()
            })
            .collect())
    }

    async fn lun_copy(&self, source_path: &str, dest_path: &str) -> Result<()> {
        let request = ZapiElement::new("lun-copy-start")
            .field("source-vserver", &self.svm)
            .with(
                ZapiElement::new("paths").with(
                    ZapiElement::new("lun-path-pair")
                        .field("source-path", source_path)
                        .field("destination-path", dest_path),
                ),
            );
        self.call_unit(request).await?;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(MAX_WAIT_FOR_LUN_SECS);
        loop {
            let state = self
                .first("lun-get-iter", query("lun-info", &[("path", dest_path)]))
                .await?
                .map(|r| text_of(&r, "state"))
                .unwrap_or_default();
            if state == "online" {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout {
                    operation: format!("lun-copy-start {} -> {}", source_path, dest_path),
                    seconds: MAX_WAIT_FOR_LUN_SECS,
                });
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn lun_resize(&self, path: &str, size_bytes: u64) -> Result<()> {
        let request = ZapiElement::new("lun-resize")
            .field("path", path)
            .field("size", size_bytes);
        self.call_unit(request).await
    }

    async fn lun_map(&self, path: &str, lun_id: u32, igroup: &str) -> Result<()> {
        let request = ZapiElement::new("lun-map")
            .field("path", path)
            .field("initiator-group", igroup)
            .field("lun-id", lun_id);
        self.call_unit(request).await
    }

    async fn lun_unmap(&self, path: &str, igroup: &str) -> Result<()> {
        let request = ZapiElement::new("lun-unmap")
            .field("path", path)
            .field("initiator-group", igroup);
        absent_ok(self.call_unit(request).await)
    }

    async fn lun_create(&self, path: &str, size_bytes: u64) -> Result<()> {
        let request = ZapiElement::new("lun-create-by-size")
            .field("path", path)
            .field("size", size_bytes)
            .field("ostype", "linux")
            .field("space-reservation-enabled", false);
        self.call_unit(request).await
    }

    async fn lun_create_from_file(
        &self,
        volume: &str,
        file_path: &str,
        lun_path: &str,
        comment: &str,
    ) -> Result<()> {
        let request = ZapiElement::new("lun-create-from-file")
            .field("path", lun_path)
            .field("file-name", format!("/vol/{}{}", volume, file_path))
            .field("ostype", "linux")
            .field("comment", comment);
        self.call_unit(request).await
    }

    async fn lun_create_and_upload(
        &self,
        volume: &str,
        file_path: &str,
        data: Bytes,
        lun_path: &str,
        comment: &str,
    ) -> Result<()> {
        if file_path == "/seed" {
            self.file_upload_api(volume, file_path, data).await?;
        } else {
            self.file_upload_nfs(volume, file_path, data).await?;
        }
        self.lun_create_from_file(volume, file_path, lun_path, comment)
            .await
    }

    async fn lun_destroy(&self, path: &str) -> Result<()> {
        absent_ok(
            self.call_unit(ZapiElement::new("lun-destroy").field("path", path))
                .await,
        )
    }

    async fn iscsi_target_name(&self) -> Result<String> {
        let results = self.call(ZapiElement::new("iscsi-node-get-name")).await?;
        Ok(text_of(&results, "node-name"))
    }

    async fn discover_iscsi_lifs(&self, lun_path: &str, subnet: &str) -> Result<Vec<String>> {
        let node = self.hosting_node("lun-get-iter", "lun-info", lun_path).await?;
        filter_subnet(self.interfaces("iscsi", node.as_deref()).await?, subnet)
    }

    async fn file_exists(&self, volume: &str, path: &str) -> Result<bool> {
        let request =
            ZapiElement::new("file-get-file-info").field("path", format!("/vol/{}{}", volume, path));
        match self.call(request).await {
            Ok(_) => Ok(true),
            Err(Error::Backend {
                outcome: Outcome::AbsentOk,
                ..
            }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn file_list(&self, volume: &str, dir: &str) -> Result<Vec<String>> {
        let request = ZapiElement::new("file-list-directory-iter")
            .field("path", format!("/vol/{}{}", volume, dir))
            .field("max-records", MAX_RECORDS);
        let results = match self.call(request).await {
            Ok(results) => results,
            Err(Error::Backend {
                outcome: Outcome::AbsentOk,
                ..
            }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(results
            .child("attributes-list")
            .map(|list| {
                list.children_named("file-info")
                    .map(|f| text_of(f, "name"))
                    .filter(|n| !n.is_empty() && !n.starts_with('.'))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn file_delete(&self, volume: &str, path: &str) -> Result<()> {
        let request =
            ZapiElement::new("file-delete-file").field("path", format!("/vol/{}{}", volume, path));
        absent_ok(self.call_unit(request).await)
    }

    async fn file_download(&self, volume: &str, path: &str) -> Result<Bytes> {
        let full_path = format!("/vol/{}{}", volume, path);
        let info = self
            .call(ZapiElement::new("file-get-file-info").field("path", &full_path))
            .await?;
        let size = info
            .descend(&["file-info", "file-size"])
            .and_then(|e| e.text.parse::<usize>().ok())
            .unwrap_or(0);

        let mut content = Vec::with_capacity(size);
        while content.len() < size {
            let length = (size - content.len()).min(FILE_CHUNK_SIZE);
            let request = ZapiElement::new("file-read-file")
                .field("path", &full_path)
                .field("offset", content.len())
                .field("length", length);
            let results = self.call(request).await?;
            let chunk = hex::decode(text_of(&results, "data"))
                .map_err(|e| Error::Xml(format!("file-read-file {}: {}", full_path, e)))?;
            if chunk.is_empty() {
                break;
            }
            content.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(content))
    }

    async fn file_upload_api(&self, volume: &str, path: &str, data: Bytes) -> Result<()> {
        let len = data.len().max(1);
        self.write_file(volume, path, &data, len).await
    }

    async fn file_upload_nfs(&self, volume: &str, path: &str, data: Bytes) -> Result<()> {
        self.write_file(volume, path, &data, FILE_CHUNK_SIZE).await
    }

    async fn snapshot_list(&self, volume: &str) -> Result<Vec<String>> {
        let records = self
            .records("snapshot-get-iter", query("snapshot-info", &[("volume", volume)]))
            .await?;
        Ok(records.iter().map(|r| text_of(r, "name")).collect())
    }

    async fn snapshot_create(&self, volume: &str, name: &str, comment: &str) -> Result<()> {
        let request = ZapiElement::new("snapshot-create")
            .field("volume", volume)
            .field("snapshot", name)
            .field("comment", comment);
        self.call_unit(request).await
    }

    async fn snapshot_delete(&self, volume: &str, name: &str) -> Result<()> {
        let request = ZapiElement::new("snapshot-delete")
            .field("volume", volume)
            .field("snapshot", name);
        absent_ok(self.call_unit(request).await)
    }

    async fn snapshot_restore(&self, volume: &str, name: &str) -> Result<()> {
        let request = ZapiElement::new("snapshot-restore-volume")
            .field("volume", volume)
            .field("snapshot", name)
            .field("preserve-lun-ids", false);
        self.call_unit(request).await
    }

    async fn nvme_namespace_exists(&self, path: &str) -> Result<bool> {
        let filter = query("nvme-namespace-info", &[("path", path)]);
        Ok(self.first("nvme-namespace-get-iter", filter).await?.is_some())
    }

    async fn nvme_namespace_create(&self, path: &str, size_bytes: u64) -> Result<()> {
        let request = ZapiElement::new("nvme-namespace-create")
            .field("path", path)
            .field("size", size_bytes)
            .field("ostype", "linux");
        self.call_unit(request).await
    }

    async fn nvme_namespace_destroy(&self, path: &str) -> Result<()> {
        absent_ok(
            self.call_unit(ZapiElement::new("nvme-namespace-delete").field("path", path))
                .await,
        )
    }

    async fn nvme_namespace_is_mapped(&self, path: &str) -> Result<bool> {
        let filter = query("nvme-target-subsystem-map-info", &[("path", path)]);
        Ok(self
            .first("nvme-subsystem-map-get-iter", filter)
            .await?
            .is_some())
    }

    async fn nvme_namespace_map(&self, path: &str, subsystem: &str) -> Result<()> {
        let request = ZapiElement::new("nvme-subsystem-map-add")
            .field("path", path)
            .field("subsystem", subsystem);
        self.call_unit(request).await
    }

    async fn nvme_namespace_unmap(&self, path: &str) -> Result<()> {
        let filter = query("nvme-target-subsystem-map-info", &[("path", path)]);
        let Some(map) = self.first("nvme-subsystem-map-get-iter", filter).await? else {
            return Ok(());
        };
        let request = ZapiElement::new("nvme-subsystem-map-remove")
            .field("path", path)
            .field("subsystem", text_of(&map, "subsystem"));
        absent_ok(self.call_unit(request).await)
    }

    async fn nvme_namespace_get_info(&self, path: &str) -> Result<NamespaceInfo> {
        let record = self
            .first("nvme-namespace-get-iter", query("nvme-namespace-info", &[("path", path)]))
            .await?
            .ok_or_else(|| Error::not_found("NVMe namespace", path))?;
        Ok(NamespaceInfo {
            size_bytes: u64_of(&record, "size"),
        })
    }

    async fn nvme_namespace_resize(&self, path: &str, size_bytes: u64) -> Result<()> {
        let request = ZapiElement::new("nvme-namespace-resize")
            .field("path", path)
            .field("size", size_bytes);
        self.call_unit(request).await
    }

    async fn nvme_subsystem_exists(&self, name: &str) -> Result<bool> {
        let filter = query("nvme-subsystem-info", &[("subsystem", name)]);
        Ok(self.first("nvme-subsystem-get-iter", filter).await?.is_some())
    }

    async fn nvme_subsystem_create(&self, name: &str) -> Result<()> {
        let request = ZapiElement::new("nvme-subsystem-create")
            .field("subsystem", name)
            .field("ostype", "linux");
        self.call_unit(request).await
    }

    async fn nvme_subsystem_destroy(&self, name: &str) -> Result<()> {
        let request = ZapiElement::new("nvme-subsystem-delete")
            .field("subsystem", name)
            .field("skip-host-check", true)
            .field("skip-mapped-check", true);
        absent_ok(self.call_unit(request).await)
    }

    async fn nvme_subsystem_add_host(&self, subsystem: &str, host_nqn: &str) -> Result<()> {
        let request = ZapiElement::new("nvme-subsystem-host-add")
            .field("subsystem", subsystem)
            .field("host-nqn", host_nqn);
        self.call_unit(request).await
    }

    async fn nvme_target_nqn(&self, subsystem: &str) -> Result<String> {
        self.first(
            "nvme-subsystem-get-iter",
            query("nvme-subsystem-info", &[("subsystem", subsystem)]),
        )
        .await?
        .map(|r| text_of(&r, "target-nqn"))
        .ok_or_else(|| Error::not_found("NVMe subsystem", subsystem))
    }

    async fn nvme_lifs(&self) -> Result<Vec<String>> {
        self.interfaces("nvme_tcp", None).await
    }

    async fn discover_nvme_lifs(&self, namespace_path: &str, subnet: &str) -> Result<Vec<String>> {
        let node = self
            .hosting_node("nvme-namespace-get-iter", "nvme-namespace-info", namespace_path)
            .await?;
        filter_subnet(self.interfaces("nvme_tcp", node.as_deref()).await?, subnet)
    }
}

#[cfg(test)]
mod tests {
    use super::super::zapi_session::decode_document;
    use super::*;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;

    type Scripted = std::result::Result<&'static str, u32>;

    /// Session answering invocations from a script, in order
    #[derive(Default)]
    struct ScriptedSession {
        script: Mutex<Vec<(&'static str, Scripted)>>,
        sent: Mutex<Vec<(Option<String>, ZapiElement)>>,
    }

    impl ScriptedSession {
        fn expect(&self, api: &'static str, reply: Scripted) -> &Self {
            self.script.lock().push((api, reply));
            self
        }

        fn sent(&self) -> Vec<(Option<String>, ZapiElement)> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl ZapiSession for ScriptedSession {
        async fn invoke(
            &self,
            vserver: Option<&str>,
            request: ZapiElement,
        ) -> std::result::Result<ZapiElement, ZapiFault> {
            self.sent
                .lock()
                .push((vserver.map(str::to_string), request.clone()));
            let mut script = self.script.lock();
            assert!(!script.is_empty(), "unexpected call {}", request.name);
            let (api, reply) = script.remove(0);
            assert_eq!(request.name, api);
            match reply {
                Ok(body) => Ok(decode_document(&format!("<results status=\"passed\">{}</results>", body))
                    .expect("scripted reply parses")),
                Err(errno) => Err(ZapiFault::Api {
                    errno,
                    reason: "scripted failure".to_string(),
                }),
            }
        }
    }

    fn backend(session: &Arc<ScriptedSession>) -> ZapiBackend {
        ZapiBackend::with_svm(session.clone(), "svm1")
    }

    #[tokio::test]
    async fn test_connect_resolves_scope_at_cluster_level() {
        let session = Arc::new(ScriptedSession::default());
        session.expect(
            "vserver-get-iter",
            Ok("<attributes-list><vserver-info><vserver-name>svm1</vserver-name></vserver-info></attributes-list>"),
        );
        let backend = ZapiBackend::connect(session.clone(), Some("svm1")).await.unwrap();
        assert_eq!(backend.svm_name(), "svm1");
        assert_eq!(session.sent()[0].0, None);

        let session = Arc::new(ScriptedSession::default());
        session.expect(
            "vserver-get-iter",
            Ok("<attributes-list><vserver-info><vserver-name>a</vserver-name></vserver-info><vserver-info><vserver-name>b</vserver-name></vserver-info></attributes-list>"),
        );
        let err = ZapiBackend::connect(session.clone(), None).await.err().unwrap();
        assert_matches!(err, Error::AmbiguousScope { candidates: 2 });
    }

    #[tokio::test]
    async fn test_get_iter_follows_next_tag() {
        let session = Arc::new(ScriptedSession::default());
        session
            .expect(
                "lun-get-iter",
                Ok("<attributes-list><lun-info><path>/vol/v1/boot</path></lun-info></attributes-list><next-tag>t1</next-tag>"),
            )
            .expect(
                "lun-get-iter",
                Ok("<attributes-list><lun-info><path>/vol/v1/data</path></lun-info></attributes-list>"),
            );
        let luns = backend(&session).lun_list("v1").await.unwrap();
        assert_eq!(luns, vec!["boot", "data"]);
        let sent = session.sent();
        assert_eq!(sent[1].1.child_text("tag"), Some("t1"));
        assert_eq!(sent[1].0.as_deref(), Some("svm1"));
    }

    #[tokio::test]
    async fn test_volume_destroy_tolerates_offline_volume() {
        let session = Arc::new(ScriptedSession::default());
        session
            .expect("volume-offline", Err(13042))
            .expect("volume-destroy", Ok(""));
        backend(&session).volume_destroy("v1").await.unwrap();

        let session = Arc::new(ScriptedSession::default());
        session
            .expect("volume-offline", Err(13040))
            .expect("volume-destroy", Err(13040));
        backend(&session).volume_destroy("v1").await.unwrap();
    }

    #[tokio::test]
    async fn test_map_conflict_surfaces() {
        let session = Arc::new(ScriptedSession::default());
        session.expect("lun-map", Err(9029));
        let err = backend(&session).lun_map("/vol/v1/boot", 0, "ig").await.unwrap_err();
        assert_matches!(
            err,
            Error::Backend {
                outcome: Outcome::Conflict,
                ref code,
                ..
            } if code == "9029"
        );
    }

    #[tokio::test]
    async fn test_unmap_of_absent_map_succeeds() {
        let session = Arc::new(ScriptedSession::default());
        session.expect("lun-unmap", Err(9016));
        backend(&session).lun_unmap("/vol/v1/boot", "ig").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_download_decodes_hex() {
        let session = Arc::new(ScriptedSession::default());
        session
            .expect("file-get-file-info", Ok("<file-info><file-size>5</file-size></file-info>"))
            .expect("file-read-file", Ok("<data>68656c6c6f</data>"));
        let data = backend(&session)
            .file_download("template_repo", "/cloud-init/a.tmpl")
            .await
            .unwrap();
        assert_eq!(&data[..], b"hello");
        assert_eq!(
            session.sent()[1].1.child_text("path"),
            Some("/vol/template_repo/cloud-init/a.tmpl")
        );
    }

    #[tokio::test]
    async fn test_seed_upload_writes_once_then_creates_lun() {
        let session = Arc::new(ScriptedSession::default());
        session
            .expect("file-write-file", Ok(""))
            .expect("lun-create-from-file", Ok(""));
        backend(&session)
            .lun_create_and_upload(
                "v1",
                "/seed",
                Bytes::from_static(b"iso"),
                "/vol/v1/seed",
                "file:///tmp/a.tmpl",
            )
            .await
            .unwrap();
        let sent = session.sent();
        assert_eq!(sent[0].1.child_text("data"), Some("69736f"));
        assert_eq!(sent[1].1.child_text("file-name"), Some("/vol/v1/seed"));
        assert_eq!(sent[1].1.child_text("comment"), Some("file:///tmp/a.tmpl"));
    }

    #[tokio::test]
    async fn test_file_list_skips_dotfiles() {
        let session = Arc::new(ScriptedSession::default());
        session.expect(
            "file-list-directory-iter",
            Ok("<attributes-list><file-info><name>.</name></file-info><file-info><name>..</name></file-info><file-info><name>ubuntu</name></file-info></attributes-list>"),
        );
        let files = backend(&session).file_list("image_repo", "/").await.unwrap();
        assert_eq!(files, vec!["ubuntu"]);
    }

    #[tokio::test]
    async fn test_nvme_lifs_filtered_by_subnet() {
        let session = Arc::new(ScriptedSession::default());
        session
            .expect("nvme-namespace-get-iter", Ok("<num-records>0</num-records>"))
            .expect(
                "net-interface-get-iter",
                Ok("<attributes-list><net-interface-info><address>10.1.0.5</address></net-interface-info><net-interface-info><address>10.2.0.5</address></net-interface-info></attributes-list>"),
            );
        let lifs = backend(&session)
            .discover_nvme_lifs("/vol/v1/nvme", "10.1.0.0/16")
            .await
            .unwrap();
        assert_eq!(lifs, vec!["10.1.0.5"]);
        let sent = session.sent();
        let filter = sent[1].1.descend(&["query", "net-interface-info"]).unwrap();
        assert_eq!(filter.child_text("home-node"), None);
    }

    #[tokio::test]
    async fn test_iscsi_lifs_scoped_to_lun_node() {
        let session = Arc::new(ScriptedSession::default());
        session
            .expect(
                "lun-get-iter",
                Ok("<attributes-list><lun-info><path>/vol/v1/boot</path><node>cluster-01</node></lun-info></attributes-list>"),
            )
            .expect(
                "net-interface-get-iter",
                Ok("<attributes-list><net-interface-info><address>192.168.10.5</address></net-interface-info></attributes-list>"),
            );
        let lifs = backend(&session)
            .discover_iscsi_lifs("/vol/v1/boot", "192.168.10.0/24")
            .await
            .unwrap();
        assert_eq!(lifs, vec!["192.168.10.5"]);
        let sent = session.sent();
        let lun = sent[0].1.descend(&["query", "lun-info"]).unwrap();
        assert_eq!(lun.child_text("path"), Some("/vol/v1/boot"));
        let filter = sent[1].1.descend(&["query", "net-interface-info"]).unwrap();
        assert_eq!(filter.child_text("home-node"), Some("cluster-01"));
    }
}
