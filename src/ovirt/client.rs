//! [`RemoteClient`] over the oVirt REST API v4.
//!
//! ```text
//! OvirtClient { base url, credentials }
//!     ├─► GET    /vms?search=name=<n>           find_vms_by_name
//!     ├─► GET    /vms/{id}[?all_content=true]   get_vm
//!     ├─► POST   /vms/{id}/migrate              migrate_vm
//!     ├─► POST   /vms/{id}/snapshots            create_snapshot
//!     ├─► GET    /vms/{id}/snapshots/{sid}      snapshot_status
//!     ├─► DELETE /vms/{id}/snapshots/{sid}      remove_snapshot
//!     ├─► GET    /vms/{id}/snapshots/{sid}/disks
//!     ├─► POST   /vms/{agent}/diskattachments
//!     ├─► DELETE /vms/{agent}/diskattachments/{aid}
//!     └─► POST   /events
//! ```

use std::time::Duration;

use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use url::Url;

use super::types::{
    AttachmentDisk, DiskAttachment, DiskList, Fault, Link, MigrateAction, NewDiskAttachment,
    NewEvent, NewSnapshot, Snapshot, Vm, VmList,
};
use super::{
    AttachmentHandle, AttachmentSpec, AuditEvent, DiskDescriptor, RemoteClient, SnapshotHandle,
    SnapshotStatus, VmHandle, VmInfo,
};
use crate::config::ApiConfig;
use crate::error::{BackupError, BackupResult};

/// Authenticated client for one engine.
#[derive(Debug, Clone)]
pub struct OvirtClient {
    http: reqwest::Client,
    base: Url,
    username: String,
    password: String,
}

impl OvirtClient {
    /// Build a client from the `[api]` configuration section.
    pub fn new(config: &ApiConfig) -> BackupResult<Self> {
        let base = Url::parse(config.url.trim_end_matches('/'))
            .map_err(|e| BackupError::remote("parse api url", e))?;
        if base.cannot_be_a_base() {
            return Err(BackupError::remote(
                "parse api url",
                format!("'{}' cannot be used as a base url", config.url),
            ));
        }

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .danger_accept_invalid_certs(config.insecure);

        if let Some(ca_file) = &config.ca_file {
            let pem = std::fs::read(ca_file).map_err(|e| {
                BackupError::local_io(format!("read CA file {}", ca_file.display()), e)
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| BackupError::remote("load CA certificate", e))?;
            builder = builder.add_root_certificate(cert);
        }

        let http = builder
            .build()
            .map_err(|e| BackupError::remote("build http client", e))?;

        info!(url = %base, user = %config.username, "Configured engine API client");

        Ok(Self {
            http,
            base,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> BackupResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| BackupError::remote("build url", "api url cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .header("Version", "4")
    }

    async fn send(&self, operation: &str, req: RequestBuilder) -> BackupResult<reqwest::Response> {
        let resp = req
            .send()
            .await
            .map_err(|e| BackupError::remote(operation, e))?;

        let status = resp.status();
        debug!(operation, http_status = status.as_u16(), "engine response");
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        Err(BackupError::remote(operation, describe_failure(status, &body)))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        url: Url,
        query: &[(&str, &str)],
    ) -> BackupResult<T> {
        let resp = self
            .send(operation, self.request(Method::GET, url).query(query))
            .await?;
        resp.json()
            .await
            .map_err(|e| BackupError::remote(operation, format!("decode response: {e}")))
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        operation: &str,
        url: Url,
        body: &B,
    ) -> BackupResult<T> {
        let resp = self
            .send(operation, self.request(Method::POST, url).json(body))
            .await?;
        resp.json()
            .await
            .map_err(|e| BackupError::remote(operation, format!("decode response: {e}")))
    }

    async fn post_discard<B: Serialize>(
        &self,
        operation: &str,
        url: Url,
        body: &B,
    ) -> BackupResult<()> {
        self.send(operation, self.request(Method::POST, url).json(body))
            .await
            .map(drop)
    }

    async fn delete(&self, operation: &str, url: Url, wait: bool) -> BackupResult<()> {
        let query = [("async", if wait { "false" } else { "true" })];
        self.send(operation, self.request(Method::DELETE, url).query(&query))
            .await
            .map(drop)
    }
}

fn describe_failure(status: StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<Fault>(body)
        .ok()
        .and_then(|f| f.message())
        .unwrap_or_else(|| body.trim().chars().take(200).collect());
    if detail.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {detail}", status.as_u16())
    }
}

impl RemoteClient for OvirtClient {
    async fn find_vms_by_name(&self, name: &str) -> BackupResult<Vec<VmHandle>> {
        let search = format!("name={name}");
        let list: VmList = self
            .get_json("list vms", self.endpoint(&["vms"])?, &[("search", search.as_str())])
            .await?;
        Ok(list
            .vm
            .into_iter()
            // The search language is a pattern match; keep exact names only.
            .filter(|vm| vm.name == name)
            .map(|vm| VmHandle {
                id: vm.id,
                name: vm.name,
            })
            .collect())
    }

    async fn get_vm(&self, vm: &VmHandle, include_config: bool) -> BackupResult<VmInfo> {
        let query: &[(&str, &str)] = if include_config {
            &[("all_content", "true")]
        } else {
            &[]
        };
        let raw: Vm = self
            .get_json("get vm", self.endpoint(&["vms", &vm.id])?, query)
            .await?;
        Ok(raw.into())
    }

    async fn migrate_vm(
        &self,
        vm: &VmHandle,
        cluster: &str,
        host: &str,
        wait: bool,
    ) -> BackupResult<()> {
        let action = MigrateAction {
            host: Link::new(host),
            cluster: Link::new(cluster),
            run_async: !wait,
        };
        self.post_discard(
            "migrate vm",
            self.endpoint(&["vms", &vm.id, "migrate"])?,
            &action,
        )
        .await
    }

    async fn create_snapshot(
        &self,
        vm: &VmHandle,
        description: &str,
        persist_memory: bool,
    ) -> BackupResult<SnapshotHandle> {
        let body = NewSnapshot {
            description,
            persist_memorystate: persist_memory,
        };
        let snap: Snapshot = self
            .post_json(
                "create snapshot",
                self.endpoint(&["vms", &vm.id, "snapshots"])?,
                &body,
            )
            .await?;
        Ok(SnapshotHandle {
            vm_id: vm.id.clone(),
            id: snap.id,
            description: description.to_string(),
        })
    }

    async fn snapshot_status(&self, snapshot: &SnapshotHandle) -> BackupResult<SnapshotStatus> {
        let snap: Snapshot = self
            .get_json(
                "get snapshot",
                self.endpoint(&["vms", &snapshot.vm_id, "snapshots", &snapshot.id])?,
                &[],
            )
            .await?;
        Ok(snap.status())
    }

    async fn remove_snapshot(&self, snapshot: &SnapshotHandle, wait: bool) -> BackupResult<()> {
        self.delete(
            "remove snapshot",
            self.endpoint(&["vms", &snapshot.vm_id, "snapshots", &snapshot.id])?,
            wait,
        )
        .await
    }

    async fn list_snapshot_disks(
        &self,
        snapshot: &SnapshotHandle,
    ) -> BackupResult<Vec<DiskDescriptor>> {
        let list: DiskList = self
            .get_json(
                "list snapshot disks",
                self.endpoint(&["vms", &snapshot.vm_id, "snapshots", &snapshot.id, "disks"])?,
                &[],
            )
            .await?;
        Ok(list.disk.into_iter().map(DiskDescriptor::from).collect())
    }

    async fn create_disk_attachment(
        &self,
        vm: &VmHandle,
        spec: &AttachmentSpec,
    ) -> BackupResult<AttachmentHandle> {
        let body = NewDiskAttachment {
            disk: AttachmentDisk {
                id: &spec.disk_id,
                snapshot: Link::new(&spec.snapshot_id),
            },
            interface: spec.interface.as_str(),
            active: spec.active,
            bootable: spec.bootable,
        };
        let attachment: DiskAttachment = self
            .post_json(
                "attach disk",
                self.endpoint(&["vms", &vm.id, "diskattachments"])?,
                &body,
            )
            .await?;
        let disk_id = attachment
            .disk
            .map(|d| d.id)
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| spec.disk_id.clone());
        Ok(AttachmentHandle {
            vm_id: vm.id.clone(),
            id: attachment.id,
            disk_id,
        })
    }

    async fn remove_disk_attachment(
        &self,
        attachment: &AttachmentHandle,
        wait: bool,
    ) -> BackupResult<()> {
        self.delete(
            "detach disk",
            self.endpoint(&["vms", &attachment.vm_id, "diskattachments", &attachment.id])?,
            wait,
        )
        .await
    }

    async fn post_audit_event(&self, event: &AuditEvent) -> BackupResult<()> {
        let body = NewEvent {
            vm: Link::new(&event.vm_id),
            origin: &event.origin,
            severity: event.severity.as_str(),
            custom_id: event.custom_id,
            description: &event.description,
        };
        self.post_discard("add event", self.endpoint(&["events"])?, &body)
            .await
    }
}
