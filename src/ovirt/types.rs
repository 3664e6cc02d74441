//! JSON wire models for the oVirt REST API v4.
//!
//! The engine renders numbers and booleans as strings (`"provisioned_size":
//! "10737418240"`, `"active": "true"`) and omits empty collections entirely,
//! so every field is lenient and defaulted.

use serde::{Deserialize, Deserializer, Serialize};

use super::{DiskDescriptor, SnapshotStatus, VmInfo, VmStatus};

/// `{"id": "..."}` reference to another resource.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Link {
    #[serde(default)]
    pub id: String,
}

impl Link {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VmList {
    #[serde(default)]
    pub vm: Vec<Vm>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Vm {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub host: Option<Link>,
    #[serde(default)]
    pub cluster: Option<Link>,
    #[serde(default)]
    pub initialization: Option<Initialization>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Initialization {
    #[serde(default)]
    pub configuration: Option<Configuration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub data: Option<String>,
}

impl From<Vm> for VmInfo {
    fn from(vm: Vm) -> Self {
        let configuration = vm
            .initialization
            .and_then(|i| i.configuration)
            .and_then(|c| c.data)
            .filter(|d| !d.is_empty());
        Self {
            id: vm.id,
            name: vm.name,
            status: VmStatus::parse(vm.status.as_deref().unwrap_or("unknown")),
            host: vm.host.map(|h| h.id).filter(|id| !id.is_empty()),
            cluster: vm.cluster.map(|c| c.id).filter(|id| !id.is_empty()),
            configuration,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrateAction {
    pub host: Link,
    pub cluster: Link,
    #[serde(rename = "async")]
    pub run_async: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewSnapshot<'a> {
    pub description: &'a str,
    pub persist_memorystate: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub snapshot_status: Option<String>,
}

impl Snapshot {
    pub fn status(&self) -> SnapshotStatus {
        SnapshotStatus::parse(self.snapshot_status.as_deref().unwrap_or("locked"))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiskList {
    #[serde(default)]
    pub disk: Vec<Disk>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Disk {
    pub id: String,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub provisioned_size: u64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
}

impl From<Disk> for DiskDescriptor {
    fn from(disk: Disk) -> Self {
        // Single-volume disks report no separate image id; the volume then
        // shares the disk id.
        let image_id = disk
            .image_id
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| disk.id.clone());
        Self {
            id: disk.id,
            image_id,
            provisioned_size: disk.provisioned_size,
            description: disk.description.filter(|d| !d.is_empty()).or(disk.alias),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NewDiskAttachment<'a> {
    pub disk: AttachmentDisk<'a>,
    pub interface: &'a str,
    pub active: bool,
    pub bootable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttachmentDisk<'a> {
    pub id: &'a str,
    pub snapshot: Link,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiskAttachment {
    pub id: String,
    #[serde(default)]
    pub disk: Option<Link>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewEvent<'a> {
    pub vm: Link,
    pub origin: &'a str,
    pub severity: &'a str,
    pub custom_id: i64,
    pub description: &'a str,
}

/// Error body returned by the engine on non-2xx responses.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Fault {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl Fault {
    pub fn message(&self) -> Option<String> {
        match (&self.reason, &self.detail) {
            (Some(r), Some(d)) => Some(format!("{r}: {d}")),
            (Some(r), None) => Some(r.clone()),
            (None, Some(d)) => Some(d.clone()),
            (None, None) => None,
        }
    }
}

fn lenient_u64<'de, D: Deserializer<'de>>(de: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(u64),
        Str(String),
    }

    match NumOrStr::deserialize(de)? {
        NumOrStr::Num(n) => Ok(n),
        NumOrStr::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
