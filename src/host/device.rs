//! Mapping attached snapshot disks to local block devices.
//!
//! The engine's disk id is not a device name. virtio-blk exposes the first 20
//! characters of the disk id as the device serial, which appears both as
//! `/sys/block/<dev>/serial` and inside the `/dev/disk/by-id/` symlink names.
//! Device nodes appear asynchronously after the attach call returns, so
//! [`resolve_device`] retries on a fixed interval.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::error::{BackupError, BackupResult};

/// Length of the serial virtio-blk derives from the disk id.
pub const SERIAL_LEN: usize = 20;

/// The part of a disk id that shows up in the device serial.
pub fn serial_fragment(disk_id: &str) -> &str {
    disk_id.get(..SERIAL_LEN).unwrap_or(disk_id)
}

/// Locates the local block device of an attached disk.
pub trait DeviceResolver: Send + Sync {
    /// One lookup attempt. `Ok(None)` means "not there yet".
    fn probe(&self, disk_id: &str) -> impl Future<Output = BackupResult<Option<PathBuf>>> + Send;

    /// Wait for the local device manager to process pending events.
    fn settle(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Retry `resolver.probe` up to `attempts` times, `interval` apart.
///
/// Probe errors are logged and count as a failed attempt.
pub async fn resolve_device<R: DeviceResolver>(
    resolver: &R,
    disk_id: &str,
    attempts: u32,
    interval: Duration,
) -> BackupResult<PathBuf> {
    for attempt in 1..=attempts {
        match resolver.probe(disk_id).await {
            Ok(Some(path)) => {
                info!(disk_id, device = %path.display(), attempt, "Resolved local device");
                return Ok(path);
            }
            Ok(None) => debug!(disk_id, attempt, "Device not present yet"),
            Err(e) => warn!(disk_id, attempt, error = %e, "Device lookup failed"),
        }

        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }

    Err(BackupError::DeviceNotFound {
        disk_id: disk_id.to_string(),
        attempts,
    })
}

// ---------------------------------------------------------------------------
// sysfs serial matching
// ---------------------------------------------------------------------------

/// Matches `/sys/block/<dev>/serial` against the disk id prefix.
#[derive(Debug, Clone)]
pub struct SerialResolver {
    pub sys_block_dir: PathBuf,
    pub dev_dir: PathBuf,
}

impl SerialResolver {
    async fn read_serial(dev: &Path) -> Option<String> {
        for candidate in [dev.join("serial"), dev.join("device").join("serial")] {
            if let Ok(s) = tokio::fs::read_to_string(&candidate).await {
                return Some(s.trim().to_string());
            }
        }
        None
    }
}

impl DeviceResolver for SerialResolver {
    async fn probe(&self, disk_id: &str) -> BackupResult<Option<PathBuf>> {
        let wanted = serial_fragment(disk_id);
        let mut entries = match tokio::fs::read_dir(&self.sys_block_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(BackupError::local_io(
                    format!("list {}", self.sys_block_dir.display()),
                    e,
                ));
            }
        };

        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            BackupError::local_io(format!("list {}", self.sys_block_dir.display()), e)
        })? {
            let Some(serial) = Self::read_serial(&entry.path()).await else {
                continue;
            };
            if serial == wanted {
                return Ok(Some(self.dev_dir.join(entry.file_name())));
            }
        }
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// /dev/disk/by-id symlinks
// ---------------------------------------------------------------------------

/// Finds a `/dev/disk/by-id/*<serial>*` link and resolves it to the device.
#[derive(Debug, Clone)]
pub struct ByIdResolver {
    pub by_id_dir: PathBuf,
    /// When set, the match is cross-checked with `lsblk -sln -o name`.
    pub lsblk: Option<PathBuf>,
    pub dev_dir: PathBuf,
}

impl ByIdResolver {
    async fn find_link(&self, fragment: &str) -> BackupResult<Option<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.by_id_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(BackupError::local_io(
                    format!("list {}", self.by_id_dir.display()),
                    e,
                ));
            }
        };

        let mut matches = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BackupError::local_io(format!("list {}", self.by_id_dir.display()), e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            // Partition links carry a -partN suffix; the copy wants the whole disk.
            if name.contains(fragment) && !name.contains("-part") {
                matches.push(entry.path());
            }
        }
        matches.sort();
        Ok(matches.into_iter().next())
    }

    /// Last line of `lsblk -sln -o name <link>` is the underlying disk.
    async fn lsblk_device(&self, lsblk: &Path, link: &Path) -> BackupResult<PathBuf> {
        let output = Command::new(lsblk)
            .args(["-sln", "-o", "name"])
            .arg(link)
            .output()
            .await
            .map_err(|e| BackupError::local_io(format!("spawn {}", lsblk.display()), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackupError::local_io(
                format!("lsblk {}", link.display()),
                std::io::Error::other(stderr.trim().to_string()),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let name = stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .ok_or_else(|| {
                BackupError::local_io(
                    format!("lsblk {}", link.display()),
                    std::io::Error::other("empty output"),
                )
            })?;
        Ok(self.dev_dir.join(name))
    }
}

impl DeviceResolver for ByIdResolver {
    async fn probe(&self, disk_id: &str) -> BackupResult<Option<PathBuf>> {
        let Some(link) = self.find_link(serial_fragment(disk_id)).await? else {
            return Ok(None);
        };

        let device = tokio::fs::canonicalize(&link)
            .await
            .map_err(|e| BackupError::local_io(format!("resolve {}", link.display()), e))?;

        if let Some(lsblk) = &self.lsblk {
            let checked = self.lsblk_device(lsblk, &link).await?;
            if checked != device {
                warn!(
                    link = %link.display(),
                    symlink_target = %device.display(),
                    lsblk = %checked.display(),
                    "lsblk disagrees with by-id link; using lsblk"
                );
            }
            return Ok(Some(checked));
        }

        Ok(Some(device))
    }
}

// ---------------------------------------------------------------------------
// Combined host resolver
// ---------------------------------------------------------------------------

/// Serial match first, by-id link second; settles through `udevadm`.
#[derive(Debug, Clone)]
pub struct HostDeviceResolver {
    pub serial: SerialResolver,
    pub by_id: ByIdResolver,
    pub udevadm: PathBuf,
    pub settle_timeout: Duration,
}

impl HostDeviceResolver {
    pub fn from_config(host: &HostConfig, settle_timeout: Duration) -> Self {
        Self {
            serial: SerialResolver {
                sys_block_dir: host.sys_block_dir.clone(),
                dev_dir: host.dev_dir.clone(),
            },
            by_id: ByIdResolver {
                by_id_dir: host.disk_by_id_dir.clone(),
                lsblk: host.lsblk_check.then(|| host.lsblk_path.clone()),
                dev_dir: host.dev_dir.clone(),
            },
            udevadm: host.udevadm_path.clone(),
            settle_timeout,
        }
    }
}

impl DeviceResolver for HostDeviceResolver {
    async fn probe(&self, disk_id: &str) -> BackupResult<Option<PathBuf>> {
        match self.serial.probe(disk_id).await {
            Ok(Some(path)) => return Ok(Some(path)),
            Ok(None) => {}
            Err(e) => debug!(disk_id, error = %e, "serial lookup failed, trying by-id"),
        }
        self.by_id.probe(disk_id).await
    }

    async fn settle(&self) {
        let timeout = format!("--timeout={}", self.settle_timeout.as_secs());
        match Command::new(&self.udevadm)
            .args(["settle", &timeout])
            .output()
            .await
        {
            Ok(output) if output.status.success() => debug!("udev queue settled"),
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(
                    exit = ?output.status.code(),
                    stderr = %stderr.trim(),
                    "udevadm settle failed"
                );
            }
            Err(e) => warn!(error = %e, "failed to run udevadm"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
