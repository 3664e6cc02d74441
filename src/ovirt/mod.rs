//! Remote resource client for the virtualization management API.
//!
//! The backup core only talks to the engine through [`RemoteClient`]: VM
//! lookup and migration, the snapshot lifecycle, disk attachments to the agent
//! VM, and audit events. [`OvirtClient`] implements it over the oVirt REST
//! API v4; tests drive the orchestrator through in-memory implementations.

use std::fmt;
use std::future::Future;

use crate::error::{BackupError, BackupResult};

pub mod client;
pub mod types;

pub use client::OvirtClient;

// ---------------------------------------------------------------------------
// Handles and descriptors
// ---------------------------------------------------------------------------

/// Identity of a remote VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmHandle {
    pub id: String,
    pub name: String,
}

/// Lifecycle status of a VM as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmStatus {
    Up,
    Down,
    Paused,
    PoweringUp,
    PoweringDown,
    MigratingFrom,
    MigratingTo,
    Other(String),
}

impl VmStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "up" => Self::Up,
            "down" => Self::Down,
            "paused" => Self::Paused,
            "powering_up" => Self::PoweringUp,
            "powering_down" => Self::PoweringDown,
            "migrating" | "migrating_from" => Self::MigratingFrom,
            "migrating_to" => Self::MigratingTo,
            other => Self::Other(other.to_string()),
        }
    }

    /// `true` while a live migration of this VM is in flight.
    pub fn is_migrating(&self) -> bool {
        matches!(self, Self::MigratingFrom | Self::MigratingTo)
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Paused => "paused",
            Self::PoweringUp => "powering_up",
            Self::PoweringDown => "powering_down",
            Self::MigratingFrom => "migrating_from",
            Self::MigratingTo => "migrating_to",
            Self::Other(s) => s,
        };
        f.write_str(s)
    }
}

/// Placement and configuration of a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInfo {
    pub id: String,
    pub name: String,
    pub status: VmStatus,
    /// Id of the host the VM currently runs on; `None` when not running.
    pub host: Option<String>,
    pub cluster: Option<String>,
    /// OVF document, present only when requested and available.
    pub configuration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHandle {
    pub vm_id: String,
    pub id: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotStatus {
    /// Being created or deleted.
    Locked,
    /// Usable.
    Ok,
    InPreview,
    Other(String),
}

impl SnapshotStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "locked" => Self::Locked,
            "ok" => Self::Ok,
            "in_preview" => Self::InPreview,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Locked => f.write_str("locked"),
            Self::Ok => f.write_str("ok"),
            Self::InPreview => f.write_str("in_preview"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

/// A disk belonging to a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDescriptor {
    pub id: String,
    pub image_id: String,
    /// Virtual size in bytes.
    pub provisioned_size: u64,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskInterface {
    Virtio,
}

impl DiskInterface {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Virtio => "virtio",
        }
    }
}

/// Request to expose a snapshot disk to a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentSpec {
    pub disk_id: String,
    pub snapshot_id: String,
    pub interface: DiskInterface,
    pub active: bool,
    pub bootable: bool,
}

impl AttachmentSpec {
    /// Active, non-bootable virtio attachment of a snapshot disk.
    pub fn snapshot_disk(disk_id: &str, snapshot_id: &str) -> Self {
        Self {
            disk_id: disk_id.to_string(),
            snapshot_id: snapshot_id.to_string(),
            interface: DiskInterface::Virtio,
            active: true,
            bootable: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentHandle {
    /// VM the disk is attached to.
    pub vm_id: String,
    pub id: String,
    pub disk_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditSeverity {
    Normal,
    Warning,
    Error,
}

impl AuditSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// An external event for the engine's audit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub vm_id: String,
    pub origin: String,
    pub severity: AuditSeverity,
    /// Must be unique per origin.
    pub custom_id: i64,
    pub description: String,
}

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

/// The operations the backup core needs from the management API.
pub trait RemoteClient: Send + Sync {
    /// All VMs whose name equals `name`.
    fn find_vms_by_name(
        &self,
        name: &str,
    ) -> impl Future<Output = BackupResult<Vec<VmHandle>>> + Send;

    fn get_vm(
        &self,
        vm: &VmHandle,
        include_config: bool,
    ) -> impl Future<Output = BackupResult<VmInfo>> + Send;

    /// Request live migration of `vm` to `host` in `cluster`.
    fn migrate_vm(
        &self,
        vm: &VmHandle,
        cluster: &str,
        host: &str,
        wait: bool,
    ) -> impl Future<Output = BackupResult<()>> + Send;

    /// Issue a snapshot creation. Returns before the snapshot is usable.
    fn create_snapshot(
        &self,
        vm: &VmHandle,
        description: &str,
        persist_memory: bool,
    ) -> impl Future<Output = BackupResult<SnapshotHandle>> + Send;

    fn snapshot_status(
        &self,
        snapshot: &SnapshotHandle,
    ) -> impl Future<Output = BackupResult<SnapshotStatus>> + Send;

    fn remove_snapshot(
        &self,
        snapshot: &SnapshotHandle,
        wait: bool,
    ) -> impl Future<Output = BackupResult<()>> + Send;

    fn list_snapshot_disks(
        &self,
        snapshot: &SnapshotHandle,
    ) -> impl Future<Output = BackupResult<Vec<DiskDescriptor>>> + Send;

    fn create_disk_attachment(
        &self,
        vm: &VmHandle,
        spec: &AttachmentSpec,
    ) -> impl Future<Output = BackupResult<AttachmentHandle>> + Send;

    fn remove_disk_attachment(
        &self,
        attachment: &AttachmentHandle,
        wait: bool,
    ) -> impl Future<Output = BackupResult<()>> + Send;

    fn post_audit_event(&self, event: &AuditEvent)
    -> impl Future<Output = BackupResult<()>> + Send;
}

/// Resolve `name` to exactly one VM.
///
/// Zero matches is [`BackupError::ResourceNotFound`]; more than one is
/// [`BackupError::AmbiguousResource`], since acting on an arbitrary match
/// could snapshot the wrong machine.
pub async fn resolve_vm<C: RemoteClient>(
    client: &C,
    kind: &'static str,
    name: &str,
) -> BackupResult<VmHandle> {
    let mut matches = client.find_vms_by_name(name).await?;
    match matches.len() {
        0 => Err(BackupError::ResourceNotFound {
            kind,
            name: name.to_string(),
        }),
        1 => Ok(matches.remove(0)),
        count => Err(BackupError::AmbiguousResource {
            kind,
            name: name.to_string(),
            count,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_status_parses_engine_values() {
        assert_eq!(VmStatus::parse("up"), VmStatus::Up);
        assert_eq!(VmStatus::parse("migrating"), VmStatus::MigratingFrom);
        assert!(VmStatus::parse("migrating_to").is_migrating());
        assert!(!VmStatus::parse("up").is_migrating());
        assert_eq!(
            VmStatus::parse("image_locked"),
            VmStatus::Other("image_locked".into())
        );
    }

    #[test]
    fn snapshot_status_display_matches_wire() {
        for s in ["locked", "ok", "in_preview"] {
            assert_eq!(SnapshotStatus::parse(s).to_string(), s);
        }
    }

    #[test]
    fn snapshot_disk_attachment_is_active_virtio_non_bootable() {
        let spec = AttachmentSpec::snapshot_disk("d1", "s1");
        assert_eq!(spec.interface, DiskInterface::Virtio);
        assert!(spec.active);
        assert!(!spec.bootable);
    }
}
