//! In-memory engine, device resolver and copier shared by the integration
//! tests.
//!
//! `FakeClient` records every call in order so tests can assert on the
//! sequence of remote mutations, and scripts snapshot status, migration and
//! failures. `FakeResolver` makes a disk appear after a number of probes.
//! `FakeCopier` writes a small payload instead of running `dd`.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone};

use ov_backup::backup::BackupRequest;
use ov_backup::config::Timing;
use ov_backup::error::{BackupError, BackupResult};
use ov_backup::host::{BlockCopier, CopyReport, DeviceResolver};
use ov_backup::ovirt::{
    AttachmentHandle, AttachmentSpec, AuditEvent, AuditSeverity, DiskDescriptor, RemoteClient,
    SnapshotHandle, SnapshotStatus, VmHandle, VmInfo, VmStatus,
};

// ---------------------------------------------------------------------------
// Recorded calls
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    FindVms(String),
    GetVm { id: String, include_config: bool },
    Migrate { vm_id: String, host: String },
    CreateSnapshot { vm_id: String, description: String },
    SnapshotStatus(String),
    RemoveSnapshot(String),
    ListDisks(String),
    Attach { vm_id: String, disk_id: String },
    Detach { vm_id: String, disk_id: String },
    Audit { severity: AuditSeverity, description: String },
}

impl Call {
    /// Calls that change engine state.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Call::Migrate { .. }
                | Call::CreateSnapshot { .. }
                | Call::RemoveSnapshot(_)
                | Call::Attach { .. }
                | Call::Detach { .. }
                | Call::Audit { .. }
        )
    }
}

/// Remote operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    CreateSnapshot,
    RemoveSnapshot,
    ListDisks,
    Attach,
    Detach,
    Migrate,
    Audit,
}

// ---------------------------------------------------------------------------
// FakeClient
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FakeVm {
    pub id: String,
    pub name: String,
    pub status: VmStatus,
    pub host: Option<String>,
    pub cluster: Option<String>,
    pub ovf: Option<String>,
}

impl FakeVm {
    pub fn up(id: &str, name: &str, host: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            status: VmStatus::Up,
            host: Some(host.to_string()),
            cluster: Some("cluster-1".to_string()),
            ovf: None,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    vms: Vec<FakeVm>,
    disks: Vec<DiskDescriptor>,
    /// Statuses returned by successive status checks; `ok` once exhausted.
    snapshot_script: VecDeque<BackupResult<SnapshotStatus>>,
    removed_snapshots: HashSet<String>,
    /// `(vm_id, migrating polls left, target host)`.
    migration: Option<(String, u32, String)>,
    migrating_polls: u32,
    failing: HashSet<Op>,
    calls: Vec<Call>,
    next_id: u32,
}

#[derive(Debug, Clone, Default)]
pub struct FakeClient {
    state: Arc<Mutex<State>>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// `db01` on host-a, agent `ov-backup` on host-a.
    pub fn db01() -> Self {
        let client = Self::new();
        client.add_vm(FakeVm::up("vm-db01", "db01", "host-a"));
        client.add_vm(FakeVm::up("vm-agent", "ov-backup", "host-a"));
        client.set_disks(vec![disk("disk-1", "img-1"), disk("disk-2", "img-2")]);
        client
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("fake client state poisoned")
    }

    pub fn add_vm(&self, vm: FakeVm) {
        self.lock().vms.push(vm);
    }

    pub fn update_vm(&self, name: &str, f: impl FnOnce(&mut FakeVm)) {
        let mut state = self.lock();
        if let Some(vm) = state.vms.iter_mut().find(|vm| vm.name == name) {
            f(vm);
        }
    }

    pub fn set_disks(&self, disks: Vec<DiskDescriptor>) {
        self.lock().disks = disks;
    }

    pub fn script_snapshot(&self, statuses: Vec<BackupResult<SnapshotStatus>>) {
        self.lock().snapshot_script = statuses.into();
    }

    /// Number of status checks answered with `migrating` after a migrate call.
    pub fn set_migrating_polls(&self, polls: u32) {
        self.lock().migrating_polls = polls;
    }

    pub fn fail(&self, op: Op) {
        self.lock().failing.insert(op);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutation).collect()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn audits(&self) -> Vec<(AuditSeverity, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Audit {
                    severity,
                    description,
                } => Some((severity, description)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.lock().calls.push(call);
    }

    fn check(&self, op: Op) -> BackupResult<()> {
        if self.lock().failing.contains(&op) {
            Err(BackupError::remote(format!("{op:?}"), "HTTP 409: injected failure"))
        } else {
            Ok(())
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut state = self.lock();
        state.next_id += 1;
        format!("{prefix}-{}", state.next_id)
    }
}

impl RemoteClient for FakeClient {
    async fn find_vms_by_name(&self, name: &str) -> BackupResult<Vec<VmHandle>> {
        self.record(Call::FindVms(name.to_string()));
        Ok(self
            .lock()
            .vms
            .iter()
            .filter(|vm| vm.name == name)
            .map(|vm| VmHandle {
                id: vm.id.clone(),
                name: vm.name.clone(),
            })
            .collect())
    }

    async fn get_vm(&self, vm: &VmHandle, include_config: bool) -> BackupResult<VmInfo> {
        self.record(Call::GetVm {
            id: vm.id.clone(),
            include_config,
        });
        let mut state = self.lock();

        let mut migrating = false;
        let mut arrived: Option<String> = None;
        if let Some((vm_id, left, target)) = state.migration.as_mut() {
            if *vm_id == vm.id {
                if *left > 0 {
                    *left -= 1;
                    migrating = true;
                } else {
                    arrived = Some(target.clone());
                }
            }
        }
        if let Some(target) = arrived {
            state.migration = None;
            if let Some(found) = state.vms.iter_mut().find(|v| v.id == vm.id) {
                found.host = Some(target);
            }
        }

        let found = state
            .vms
            .iter()
            .find(|v| v.id == vm.id)
            .ok_or_else(|| BackupError::remote("get vm", "HTTP 404"))?;
        Ok(VmInfo {
            id: found.id.clone(),
            name: found.name.clone(),
            status: if migrating {
                VmStatus::MigratingFrom
            } else {
                found.status.clone()
            },
            host: found.host.clone(),
            cluster: found.cluster.clone(),
            configuration: if include_config { found.ovf.clone() } else { None },
        })
    }

    async fn migrate_vm(
        &self,
        vm: &VmHandle,
        _cluster: &str,
        host: &str,
        _wait: bool,
    ) -> BackupResult<()> {
        self.record(Call::Migrate {
            vm_id: vm.id.clone(),
            host: host.to_string(),
        });
        self.check(Op::Migrate)?;
        let mut state = self.lock();
        let polls = state.migrating_polls;
        state.migration = Some((vm.id.clone(), polls, host.to_string()));
        Ok(())
    }

    async fn create_snapshot(
        &self,
        vm: &VmHandle,
        description: &str,
        _persist_memory: bool,
    ) -> BackupResult<SnapshotHandle> {
        self.record(Call::CreateSnapshot {
            vm_id: vm.id.clone(),
            description: description.to_string(),
        });
        self.check(Op::CreateSnapshot)?;
        Ok(SnapshotHandle {
            vm_id: vm.id.clone(),
            id: self.next_id("snap"),
            description: description.to_string(),
        })
    }

    async fn snapshot_status(&self, snapshot: &SnapshotHandle) -> BackupResult<SnapshotStatus> {
        self.record(Call::SnapshotStatus(snapshot.id.clone()));
        let mut state = self.lock();
        if state.removed_snapshots.contains(&snapshot.id) {
            return Err(BackupError::remote("get snapshot", "HTTP 404"));
        }
        state
            .snapshot_script
            .pop_front()
            .unwrap_or(Ok(SnapshotStatus::Ok))
    }

    async fn remove_snapshot(&self, snapshot: &SnapshotHandle, _wait: bool) -> BackupResult<()> {
        self.record(Call::RemoveSnapshot(snapshot.id.clone()));
        self.check(Op::RemoveSnapshot)?;
        self.lock().removed_snapshots.insert(snapshot.id.clone());
        Ok(())
    }

    async fn list_snapshot_disks(
        &self,
        snapshot: &SnapshotHandle,
    ) -> BackupResult<Vec<DiskDescriptor>> {
        self.record(Call::ListDisks(snapshot.id.clone()));
        self.check(Op::ListDisks)?;
        Ok(self.lock().disks.clone())
    }

    async fn create_disk_attachment(
        &self,
        vm: &VmHandle,
        spec: &AttachmentSpec,
    ) -> BackupResult<AttachmentHandle> {
        self.record(Call::Attach {
            vm_id: vm.id.clone(),
            disk_id: spec.disk_id.clone(),
        });
        self.check(Op::Attach)?;
        Ok(AttachmentHandle {
            vm_id: vm.id.clone(),
            id: self.next_id("att"),
            disk_id: spec.disk_id.clone(),
        })
    }

    async fn remove_disk_attachment(
        &self,
        attachment: &AttachmentHandle,
        _wait: bool,
    ) -> BackupResult<()> {
        self.record(Call::Detach {
            vm_id: attachment.vm_id.clone(),
            disk_id: attachment.disk_id.clone(),
        });
        self.check(Op::Detach)
    }

    async fn post_audit_event(&self, event: &AuditEvent) -> BackupResult<()> {
        self.record(Call::Audit {
            severity: event.severity,
            description: event.description.clone(),
        });
        self.check(Op::Audit)
    }
}

// ---------------------------------------------------------------------------
// FakeResolver
// ---------------------------------------------------------------------------

/// Reports `<dev_dir>/<disk_id>` once a disk has been probed `misses` times.
#[derive(Debug, Clone, Default)]
pub struct FakeResolver {
    misses: u32,
    probes: Arc<Mutex<HashMap<String, u32>>>,
    settles: Arc<Mutex<u32>>,
}

impl FakeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn appearing_after(misses: u32) -> Self {
        Self {
            misses,
            ..Self::default()
        }
    }

    pub fn probes(&self, disk_id: &str) -> u32 {
        self.probes
            .lock()
            .expect("probes poisoned")
            .get(disk_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn settles(&self) -> u32 {
        *self.settles.lock().expect("settles poisoned")
    }
}

impl DeviceResolver for FakeResolver {
    async fn probe(&self, disk_id: &str) -> BackupResult<Option<PathBuf>> {
        let mut probes = self.probes.lock().expect("probes poisoned");
        let seen = probes.entry(disk_id.to_string()).or_insert(0);
        *seen += 1;
        if *seen > self.misses {
            Ok(Some(PathBuf::from("/dev/fake").join(disk_id)))
        } else {
            Ok(None)
        }
    }

    async fn settle(&self) {
        *self.settles.lock().expect("settles poisoned") += 1;
    }
}

// ---------------------------------------------------------------------------
// FakeCopier
// ---------------------------------------------------------------------------

/// Writes a fixed payload to the destination instead of reading a device.
#[derive(Debug, Clone)]
pub struct FakeCopier {
    payload: Vec<u8>,
    /// 1-based copy number that fails.
    fail_on: Option<usize>,
    delay: Option<Duration>,
    copies: Arc<Mutex<Vec<(PathBuf, PathBuf)>>>,
}

impl Default for FakeCopier {
    fn default() -> Self {
        Self {
            payload: b"disk-bytes".to_vec(),
            fail_on: None,
            delay: None,
            copies: Arc::default(),
        }
    }
}

impl FakeCopier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(n: usize) -> Self {
        Self {
            fail_on: Some(n),
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn copies(&self) -> Vec<(PathBuf, PathBuf)> {
        self.copies.lock().expect("copies poisoned").clone()
    }
}

impl BlockCopier for FakeCopier {
    async fn copy(&self, source: &Path, destination: &Path) -> BackupResult<CopyReport> {
        let n = {
            let mut copies = self.copies.lock().expect("copies poisoned");
            copies.push((source.to_path_buf(), destination.to_path_buf()));
            copies.len()
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_on == Some(n) {
            return Err(BackupError::CopyFailed {
                source_path: source.to_path_buf(),
                destination: destination.to_path_buf(),
                code: 1,
            });
        }

        std::fs::write(destination, &self.payload)
            .map_err(|e| BackupError::local_io("fake copy", e))?;
        Ok(CopyReport {
            bytes: self.payload.len() as u64,
            elapsed: Duration::ZERO,
        })
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn disk(id: &str, image_id: &str) -> DiskDescriptor {
    DiskDescriptor {
        id: id.to_string(),
        image_id: image_id.to_string(),
        provisioned_size: 1024 * 1024 * 1024,
        description: Some(format!("{id}-alias")),
    }
}

/// Default bounds; tests run on a paused clock so the delays cost nothing.
pub fn timing() -> Timing {
    Timing {
        snapshot_poll_interval: Duration::from_secs(2),
        snapshot_poll_attempts: 50,
        snapshot_remove_attempts: 5,
        snapshot_settle: Duration::ZERO,
        attach_settle: Duration::from_secs(5),
        device_retry_interval: Duration::from_secs(5),
        device_attempts: 6,
        migration_poll_interval: Duration::from_secs(10),
        migration_timeout: Duration::from_secs(1800),
        run_timeout: None,
    }
}

/// Noon on day `day` of March 2026, local time.
pub fn at(day: u32) -> DateTime<Local> {
    Local
        .with_ymd_and_hms(2026, 3, day, 12, 0, 0)
        .single()
        .expect("unambiguous local time")
}

pub fn request(root: &Path, vm: &str, day: u32) -> BackupRequest {
    let mut request = BackupRequest::new(vm, "ov-backup", root);
    request.started_at = at(day);
    request
}
