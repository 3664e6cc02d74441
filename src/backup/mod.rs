//! One backup run of one VM.
//!
//! ```text
//!  resolve VMs ─► lock ─► sweep ─► run dir ─► OVF ─► snapshot ─┐
//!                                                              │ SnapshotGuard
//!        ┌─────────────────────────────────────────────────────┘
//!        ├─ co-locate agent (optional)
//!        ├─ per disk: attach ─► resolve device ─► dd ─► .meta ─► detach
//!        └─ remove snapshot
//!  retention ─► export links ─► <timestamp>.OK ─► audit "completed"
//! ```
//!
//! Any failure after the run directory exists deletes it, so a run either
//! leaves a marked directory or nothing.

use std::path::PathBuf;

use chrono::{DateTime, Local};

use crate::ovirt::VmStatus;

pub mod guard;
pub mod layout;
pub mod lock;
pub mod migration;
pub mod orchestrator;
pub mod retention;

pub use guard::{AttachmentGuard, SnapshotGuard};
pub use layout::{RunDir, VolumeMeta};
pub use lock::RunLock;
pub use migration::{Colocation, co_locate};
pub use orchestrator::Orchestrator;
pub use retention::RetentionManager;

/// Parameters of a single run.
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub vm_name: String,
    pub agent_vm_name: String,
    pub backup_root: PathBuf,
    /// Completed runs to keep, including this one.
    pub retention: usize,
    /// Move the agent VM to the data VM's host first.
    pub migrate: bool,
    /// Export storage domain id to link the run into.
    pub export_domain: Option<String>,
    /// Skip the run unless the data VM is `up`.
    pub only_if_up: bool,
    /// Names the run directory.
    pub started_at: DateTime<Local>,
}

impl BackupRequest {
    pub fn new(
        vm_name: impl Into<String>,
        agent_vm_name: impl Into<String>,
        backup_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            vm_name: vm_name.into(),
            agent_vm_name: agent_vm_name.into(),
            backup_root: backup_root.into(),
            retention: 3,
            migrate: false,
            export_domain: None,
            only_if_up: false,
            started_at: Local::now(),
        }
    }
}

/// A disk that made it into the run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskBackup {
    pub disk_id: String,
    pub image_id: String,
    pub device: PathBuf,
    pub image_path: PathBuf,
    pub bytes: u64,
}

/// Summary of a completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub vm_name: String,
    pub run_dir: PathBuf,
    pub marker: PathBuf,
    pub snapshot_description: String,
    pub disks: Vec<DiskBackup>,
    /// Older runs deleted by retention.
    pub pruned: Vec<String>,
    pub colocation: Option<Colocation>,
    /// `false` when the snapshot could not be removed after every disk was copied.
    pub clean: bool,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(RunReport),
    Skipped { vm_name: String, status: VmStatus },
}
