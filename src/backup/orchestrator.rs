//! Drives one run through its steps.
//!
//! The orchestrator is generic over the engine client, the device resolver
//! and the block copier so the whole sequence runs against in-memory fakes in
//! tests. Remote resources are only ever created through the guards in
//! [`super::guard`]; the run deadline bounds waits but never a create or
//! remove call, so a timed-out run still cleans up after itself.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::guard::{AttachmentGuard, SnapshotGuard};
use super::layout::{RunDir, VolumeMeta, link_export_domain};
use super::lock::RunLock;
use super::migration::{Colocation, co_locate};
use super::retention::RetentionManager;
use super::{BackupRequest, DiskBackup, RunOutcome, RunReport};
use crate::config::Timing;
use crate::error::{BackupError, BackupResult};
use crate::logging::FILE_ONLY_TARGET;
use crate::host::{BlockCopier, DeviceResolver, resolve_device};
use crate::ovirt::{
    AttachmentHandle, AttachmentSpec, AuditEvent, AuditSeverity, DiskDescriptor, RemoteClient,
    SnapshotHandle, VmHandle, VmStatus, resolve_vm,
};

/// Default origin of audit events.
pub const DEFAULT_ORIGIN: &str = "ov-backup";

// ---------------------------------------------------------------------------
// Deadline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Deadline(Option<(Instant, Duration)>);

impl Deadline {
    fn start(limit: Option<Duration>) -> Self {
        Self(limit.map(|limit| (Instant::now() + limit, limit)))
    }

    async fn bound<T>(&self, fut: impl Future<Output = BackupResult<T>>) -> BackupResult<T> {
        match self.0 {
            None => fut.await,
            Some((at, limit)) => tokio::time::timeout_at(at, fut)
                .await
                .unwrap_or(Err(BackupError::RunTimeout { limit })),
        }
    }
}

/// Result of the part of a run that holds the snapshot.
struct Guarded {
    colocation: Option<Colocation>,
    disks: Vec<DiskDescriptor>,
    backups: Vec<DiskBackup>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator<C, R, B> {
    client: C,
    resolver: R,
    copier: B,
    timing: Timing,
    origin: String,
    export_root: Option<PathBuf>,
    /// Audit event ids must be unique per origin; seeded from the clock.
    next_event_id: AtomicI64,
}

impl<C, R, B> Orchestrator<C, R, B>
where
    C: RemoteClient,
    R: DeviceResolver,
    B: BlockCopier,
{
    pub fn new(client: C, resolver: R, copier: B, timing: Timing) -> Self {
        Self {
            client,
            resolver,
            copier,
            timing,
            origin: DEFAULT_ORIGIN.to_string(),
            export_root: None,
            next_event_id: AtomicI64::new(Utc::now().timestamp()),
        }
    }

    /// Origin tag for audit events.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Directory holding export storage domains. Defaults to the backup root.
    pub fn with_export_root(mut self, export_root: Option<PathBuf>) -> Self {
        self.export_root = export_root;
        self
    }

    /// Back up `request.vm_name` once.
    pub async fn run(&self, request: &BackupRequest) -> BackupResult<RunOutcome> {
        let data_vm = resolve_vm(&self.client, "VM", &request.vm_name).await?;
        let agent_vm = resolve_vm(&self.client, "agent VM", &request.agent_vm_name).await?;
        info!(
            vm = %data_vm.name,
            vm_id = %data_vm.id,
            agent = %agent_vm.name,
            agent_id = %agent_vm.id,
            "Resolved virtual machines"
        );

        if request.only_if_up {
            let info = self.client.get_vm(&data_vm, false).await?;
            if info.status != VmStatus::Up {
                info!(vm = %data_vm.name, status = %info.status, "VM is not up; skipping backup");
                return Ok(RunOutcome::Skipped {
                    vm_name: data_vm.name,
                    status: info.status,
                });
            }
        }

        let vm_root = request.backup_root.join(&data_vm.name);
        let _lock = RunLock::acquire(&vm_root, &data_vm.name)?;
        match RetentionManager::sweep_incomplete(&vm_root, None) {
            Ok(swept) if !swept.is_empty() => {
                info!(count = swept.len(), "Cleaned up leftovers of incomplete runs");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to clean up incomplete runs"),
        }

        let run = RunDir::create(&request.backup_root, &data_vm.name, &request.started_at)?;

        match self.run_in(request, &data_vm, &agent_vm, &run).await {
            Ok(report) => Ok(RunOutcome::Completed(report)),
            Err(e) => {
                // main reports the failure on stderr; keep this one in the log file.
                error!(
                    target: FILE_ONLY_TARGET,
                    vm = %data_vm.name,
                    run_dir = %run.path().display(),
                    error = %e,
                    "Backup failed"
                );
                if let Err(discard_err) = run.discard() {
                    error!(error = %discard_err, "Failed to remove incomplete run directory");
                }
                self.audit(
                    &data_vm,
                    AuditSeverity::Error,
                    format!("Backup of virtual machine '{}' failed: {e}", data_vm.name),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn run_in(
        &self,
        request: &BackupRequest,
        data_vm: &VmHandle,
        agent_vm: &VmHandle,
        run: &RunDir,
    ) -> BackupResult<RunReport> {
        self.export_ovf(data_vm, run).await;

        let description = format!("{}-backup-{}-{}", data_vm.name, run.name(), Uuid::new_v4());
        self.audit(
            data_vm,
            AuditSeverity::Normal,
            format!(
                "Backup of virtual machine '{}' using snapshot '{}' is starting.",
                data_vm.name, description
            ),
        )
        .await;

        info!(snapshot = %description, "Sending request to create snapshot");
        let snapshot = self
            .client
            .create_snapshot(data_vm, &description, false)
            .await?;
        let guard = SnapshotGuard::acquire(&self.client, snapshot, &self.timing).await?;

        let deadline = Deadline::start(self.timing.run_timeout);
        let body = self
            .guarded(request, data_vm, agent_vm, guard.snapshot(), run, &deadline)
            .await;

        let snapshot_removed = match guard.release().await {
            Ok(()) => true,
            Err(e) => {
                error!(snapshot = %description, error = %e, "Failed to remove snapshot");
                self.audit(
                    data_vm,
                    AuditSeverity::Warning,
                    format!(
                        "Backup of virtual machine '{}': snapshot '{}' could not be removed: {e}",
                        data_vm.name, description
                    ),
                )
                .await;
                false
            }
        };
        let body = body?;

        let pruned =
            RetentionManager::new(request.retention).prune(run.vm_root(), Some(run.name()))?;

        if let Some(domain) = &request.export_domain {
            let export_root = self
                .export_root
                .clone()
                .unwrap_or_else(|| request.backup_root.clone());
            if let Err(e) =
                link_export_domain(run, &export_root, domain, &data_vm.id, &body.disks)
            {
                warn!(domain = %domain, error = %e, "Failed to link run into export domain");
            }
        }

        let marker = run.mark_complete()?;
        self.audit(
            data_vm,
            AuditSeverity::Normal,
            format!(
                "Backup of virtual machine '{}' using snapshot '{}' is completed.",
                data_vm.name, description
            ),
        )
        .await;

        info!(
            vm = %data_vm.name,
            run_dir = %run.path().display(),
            disks = body.backups.len(),
            pruned = pruned.len(),
            "Backup completed"
        );

        Ok(RunReport {
            vm_name: data_vm.name.clone(),
            run_dir: run.path().to_path_buf(),
            marker,
            snapshot_description: description,
            disks: body.backups,
            pruned,
            colocation: body.colocation,
            clean: snapshot_removed,
        })
    }

    async fn guarded(
        &self,
        request: &BackupRequest,
        data_vm: &VmHandle,
        agent_vm: &VmHandle,
        snapshot: &SnapshotHandle,
        run: &RunDir,
        deadline: &Deadline,
    ) -> BackupResult<Guarded> {
        let colocation = if request.migrate {
            match deadline
                .bound(co_locate(&self.client, data_vm, agent_vm, &self.timing))
                .await
            {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    warn!(
                        error = %e,
                        "Agent VM co-location failed; continuing on the current host"
                    );
                    None
                }
            }
        } else {
            None
        };

        let disks = deadline
            .bound(self.client.list_snapshot_disks(snapshot))
            .await?;
        info!(count = disks.len(), "Found snapshot disks");

        let mut backups = Vec::with_capacity(disks.len());
        for disk in &disks {
            let backup = self
                .backup_disk(request, data_vm, agent_vm, snapshot, disk, run, deadline)
                .await?;
            backups.push(backup);
        }

        Ok(Guarded {
            colocation,
            disks,
            backups,
        })
    }

    /// Attach, copy and detach one disk.
    ///
    /// A failed detach fails the disk: the next disk must not be attached
    /// while this one may still be. A copy error takes precedence over it.
    #[allow(clippy::too_many_arguments)]
    async fn backup_disk(
        &self,
        request: &BackupRequest,
        data_vm: &VmHandle,
        agent_vm: &VmHandle,
        snapshot: &SnapshotHandle,
        disk: &DiskDescriptor,
        run: &RunDir,
        deadline: &Deadline,
    ) -> BackupResult<DiskBackup> {
        info!(
            disk_id = %disk.id,
            image_id = %disk.image_id,
            agent = %agent_vm.name,
            "Attaching snapshot disk"
        );
        let spec = AttachmentSpec::snapshot_disk(&disk.id, &snapshot.id);
        let attachment = self.client.create_disk_attachment(agent_vm, &spec).await?;
        let guard = AttachmentGuard::acquire(
            &self.client,
            attachment,
            self.timing.attach_settle,
            &self.resolver,
        )
        .await;

        let copied = deadline
            .bound(self.copy_disk(request, data_vm, snapshot, disk, guard.attachment(), run))
            .await;
        let detached = guard.release(&self.resolver).await;

        match (copied, detached) {
            (Ok(backup), Ok(())) => Ok(backup),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(detach_err)) => {
                error!(
                    disk_id = %disk.id,
                    error = %detach_err,
                    "Failed to detach disk from agent VM"
                );
                Err(e)
            }
        }
    }

    async fn copy_disk(
        &self,
        request: &BackupRequest,
        data_vm: &VmHandle,
        snapshot: &SnapshotHandle,
        disk: &DiskDescriptor,
        attachment: &AttachmentHandle,
        run: &RunDir,
    ) -> BackupResult<DiskBackup> {
        let device = resolve_device(
            &self.resolver,
            &attachment.disk_id,
            self.timing.device_attempts,
            self.timing.device_retry_interval,
        )
        .await?;

        let image_path = run.prepare_image(disk)?;
        info!(
            device = %device.display(),
            image = %image_path.display(),
            size = disk.provisioned_size,
            "Copying disk"
        );
        let report = self.copier.copy(&device, &image_path).await?;

        let meta = VolumeMeta::new(
            disk,
            &data_vm.name,
            &snapshot.description,
            request.export_domain.as_deref(),
            Utc::now(),
        );
        run.write_sidecar(disk, &meta)?;

        Ok(DiskBackup {
            disk_id: disk.id.clone(),
            image_id: disk.image_id.clone(),
            device,
            image_path,
            bytes: report.bytes,
        })
    }

    async fn export_ovf(&self, vm: &VmHandle, run: &RunDir) {
        match self.client.get_vm(vm, true).await {
            Ok(info) => match info.configuration {
                Some(ovf) => match run.write_ovf(&vm.id, &ovf) {
                    Ok(path) => info!(path = %path.display(), "Saved VM configuration"),
                    Err(e) => warn!(error = %e, "Failed to save VM configuration"),
                },
                None => info!(vm = %vm.name, "No VM configuration available; skipping OVF export"),
            },
            Err(e) => warn!(vm = %vm.name, error = %e, "Failed to fetch VM configuration"),
        }
    }

    /// Post an audit event. Failures are logged only.
    async fn audit(&self, vm: &VmHandle, severity: AuditSeverity, description: String) {
        let event = AuditEvent {
            vm_id: vm.id.clone(),
            origin: self.origin.clone(),
            severity,
            custom_id: self.next_event_id.fetch_add(1, Ordering::Relaxed),
            description,
        };
        if let Err(e) = self.client.post_audit_event(&event).await {
            warn!(severity = severity.as_str(), error = %e, "Failed to post audit event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_turns_slow_waits_into_run_timeout() {
        let deadline = Deadline::start(Some(Duration::from_secs(5)));
        let err = deadline
            .bound(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, BackupError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BackupError::RunTimeout { limit } if limit == Duration::from_secs(5)
        ));
    }

    #[tokio::test]
    async fn unbounded_deadline_passes_results_through() {
        let deadline = Deadline::start(None);
        assert_eq!(deadline.bound(async { Ok::<_, BackupError>(7) }).await.unwrap(), 7);
    }
}
