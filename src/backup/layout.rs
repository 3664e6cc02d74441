//! On-disk layout of a backup run.
//!
//! ```text
//! <root>/<vm>/<YYYYMMDDHHMM>/
//!     ovf/<vmId>/<vmId>.ovf
//!     images/<diskId>/<imageId>
//!     images/<diskId>/<imageId>.meta
//! <root>/<vm>/<YYYYMMDDHHMM>.OK
//! ```
//!
//! The `images/` and `ovf/` trees follow the export storage domain layout so
//! a run can be exposed as an export domain through symlinks
//! ([`link_export_domain`]).

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use tracing::{debug, info};

use crate::error::{BackupError, BackupResult};
use crate::ovirt::DiskDescriptor;

/// `strftime` format of run directory names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M";

/// Suffix of the completion marker, a sibling of the run directory.
pub const MARKER_SUFFIX: &str = ".OK";

const SECTOR_SIZE: u64 = 512;
const BLANK_UUID: &str = "00000000-0000-0000-0000-000000000000";

/// `true` for names produced by [`TIMESTAMP_FORMAT`].
pub fn is_run_name(name: &str) -> bool {
    name.len() == 12 && name.bytes().all(|b| b.is_ascii_digit())
}

/// Completion marker path for the run `name` under `vm_root`.
pub fn marker_path(vm_root: &Path, name: &str) -> PathBuf {
    vm_root.join(format!("{name}{MARKER_SUFFIX}"))
}

// ---------------------------------------------------------------------------
// RunDir
// ---------------------------------------------------------------------------

/// A timestamp-named run directory owned by the current run.
#[derive(Debug, Clone)]
pub struct RunDir {
    vm_root: PathBuf,
    name: String,
    path: PathBuf,
}

impl RunDir {
    /// Create `<root>/<vm>/<timestamp>`. Fails if it already exists.
    pub fn create(root: &Path, vm_name: &str, started_at: &DateTime<Local>) -> BackupResult<Self> {
        let vm_root = root.join(vm_name);
        fs::create_dir_all(&vm_root)
            .map_err(|e| BackupError::local_io(format!("create {}", vm_root.display()), e))?;

        let name = started_at.format(TIMESTAMP_FORMAT).to_string();
        let path = vm_root.join(&name);
        fs::create_dir(&path)
            .map_err(|e| {
                BackupError::local_io(format!("create run directory {}", path.display()), e)
            })?;

        info!(run_dir = %path.display(), "Created run directory");
        Ok(Self {
            vm_root,
            name,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vm_root(&self) -> &Path {
        &self.vm_root
    }

    pub fn marker_path(&self) -> PathBuf {
        marker_path(&self.vm_root, &self.name)
    }

    pub fn image_dir(&self, disk_id: &str) -> PathBuf {
        self.path.join("images").join(disk_id)
    }

    pub fn image_path(&self, disk: &DiskDescriptor) -> PathBuf {
        self.image_dir(&disk.id).join(&disk.image_id)
    }

    pub fn ovf_dir(&self, vm_id: &str) -> PathBuf {
        self.path.join("ovf").join(vm_id)
    }

    /// Write the VM's OVF to `ovf/<vmId>/<vmId>.ovf`.
    pub fn write_ovf(&self, vm_id: &str, data: &str) -> BackupResult<PathBuf> {
        let dir = self.ovf_dir(vm_id);
        fs::create_dir_all(&dir)
            .map_err(|e| BackupError::local_io(format!("create {}", dir.display()), e))?;
        let file = dir.join(format!("{vm_id}.ovf"));
        fs::write(&file, data)
            .map_err(|e| BackupError::local_io(format!("write {}", file.display()), e))?;
        Ok(file)
    }

    /// Create `images/<diskId>/` and return the image file path.
    pub fn prepare_image(&self, disk: &DiskDescriptor) -> BackupResult<PathBuf> {
        let dir = self.image_dir(&disk.id);
        fs::create_dir_all(&dir)
            .map_err(|e| BackupError::local_io(format!("create {}", dir.display()), e))?;
        Ok(self.image_path(disk))
    }

    /// Write `<imageId>.meta` next to the image.
    pub fn write_sidecar(&self, disk: &DiskDescriptor, meta: &VolumeMeta) -> BackupResult<PathBuf> {
        let file = self.image_dir(&disk.id).join(format!("{}.meta", disk.image_id));
        fs::write(&file, meta.render())
            .map_err(|e| BackupError::local_io(format!("write {}", file.display()), e))?;
        Ok(file)
    }

    /// Write the completion marker. After this the run counts for retention.
    pub fn mark_complete(&self) -> BackupResult<PathBuf> {
        let marker = self.marker_path();
        fs::write(&marker, format!("{}\n", Utc::now().to_rfc3339()))
            .map_err(|e| BackupError::local_io(format!("write {}", marker.display()), e))?;
        info!(marker = %marker.display(), "Backup run marked complete");
        Ok(marker)
    }

    /// Delete the run directory and any marker for it.
    pub fn discard(&self) -> BackupResult<()> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(BackupError::local_io(
                    format!("remove {}", self.path.display()),
                    e,
                ));
            }
        }
        let marker = self.marker_path();
        match fs::remove_file(&marker) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(BackupError::local_io(
                    format!("remove {}", marker.display()),
                    e,
                ));
            }
        }
        info!(run_dir = %self.path.display(), "Discarded incomplete run");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Volume metadata sidecar
// ---------------------------------------------------------------------------

/// `key=value` volume metadata in the storage domain `.meta` format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMeta {
    /// Creation time, seconds since the epoch.
    pub ctime: i64,
    /// JSON provenance blob (`DiskAlias`, `DiskDescription`).
    pub description: String,
    /// Export domain id, empty when not linked into one.
    pub domain: String,
    pub image: String,
    /// Virtual size in 512-byte sectors.
    pub size_sectors: u64,
}

impl VolumeMeta {
    pub fn new(
        disk: &DiskDescriptor,
        vm_name: &str,
        snapshot_description: &str,
        domain: Option<&str>,
        created: DateTime<Utc>,
    ) -> Self {
        let alias = disk.description.clone().unwrap_or_else(|| disk.id.clone());
        let description = serde_json::json!({
            "DiskAlias": alias,
            "DiskDescription": format!("backup of {vm_name} from snapshot {snapshot_description}"),
        })
        .to_string();

        Self {
            ctime: created.timestamp(),
            description,
            domain: domain.unwrap_or_default().to_string(),
            image: disk.id.clone(),
            size_sectors: disk.provisioned_size.div_ceil(SECTOR_SIZE),
        }
    }

    /// Render the sidecar body, terminated by `EOF`.
    pub fn render(&self) -> String {
        // The copy is a flat raw image regardless of the source volume format.
        let lines = [
            format!("CTIME={}", self.ctime),
            format!("DESCRIPTION={}", self.description.replace('\n', " ")),
            "DISKTYPE=2".to_string(),
            format!("DOMAIN={}", self.domain),
            "FORMAT=RAW".to_string(),
            format!("IMAGE={}", self.image),
            "LEGALITY=LEGAL".to_string(),
            format!("PUUID={BLANK_UUID}"),
            format!("SIZE={}", self.size_sectors),
            "TYPE=SPARSE".to_string(),
            "VOLTYPE=LEAF".to_string(),
            "EOF".to_string(),
        ];
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }
}

// ---------------------------------------------------------------------------
// Export domain symlinks
// ---------------------------------------------------------------------------

/// Point an export storage domain at this run.
///
/// Creates `<export_root>/<domain>/images/<diskId>` and
/// `<export_root>/<domain>/master/vms/<vmId>` as symlinks into the run
/// directory, replacing links left by an earlier run.
#[cfg(unix)]
pub fn link_export_domain(
    run: &RunDir,
    export_root: &Path,
    domain: &str,
    vm_id: &str,
    disks: &[DiskDescriptor],
) -> BackupResult<()> {
    let domain_dir = export_root.join(domain);
    let images = domain_dir.join("images");
    let vms = domain_dir.join("master").join("vms");
    for dir in [&images, &vms] {
        fs::create_dir_all(dir)
            .map_err(|e| BackupError::local_io(format!("create {}", dir.display()), e))?;
    }

    for disk in disks {
        replace_symlink(&run.image_dir(&disk.id), &images.join(&disk.id))?;
    }

    let ovf_dir = run.ovf_dir(vm_id);
    if ovf_dir.is_dir() {
        replace_symlink(&ovf_dir, &vms.join(vm_id))?;
    }

    info!(domain = %domain_dir.display(), disks = disks.len(), "Linked run into export domain");
    Ok(())
}

#[cfg(not(unix))]
pub fn link_export_domain(
    _run: &RunDir,
    _export_root: &Path,
    _domain: &str,
    _vm_id: &str,
    _disks: &[DiskDescriptor],
) -> BackupResult<()> {
    Err(BackupError::local_io(
        "link export domain",
        std::io::Error::new(std::io::ErrorKind::Unsupported, "symlinks require unix"),
    ))
}

#[cfg(unix)]
fn replace_symlink(target: &Path, link: &Path) -> BackupResult<()> {
    match fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_symlink() => {
            fs::remove_file(link)
                .map_err(|e| BackupError::local_io(format!("remove {}", link.display()), e))?;
        }
        Ok(_) => {
            return Err(BackupError::local_io(
                format!("replace {}", link.display()),
                std::io::Error::new(std::io::ErrorKind::AlreadyExists, "not a symlink"),
            ));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(BackupError::local_io(format!("stat {}", link.display()), e));
        }
    }
    std::os::unix::fs::symlink(target, link)
        .map_err(|e| BackupError::local_io(format!("symlink {}", link.display()), e))?;
    debug!(link = %link.display(), target = %target.display(), "symlink updated");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
