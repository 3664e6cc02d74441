//! Per-VM run lock: `<root>/<vm>/.lock` holding the owner's pid.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{BackupError, BackupResult};

pub const LOCK_FILE: &str = ".lock";

/// Held for the duration of a run; the file is removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Take the lock for `vm_name` under `vm_root`, creating the directory.
    ///
    /// A lock whose pid is no longer alive is taken over.
    pub fn acquire(vm_root: &Path, vm_name: &str) -> BackupResult<Self> {
        fs::create_dir_all(vm_root)
            .map_err(|e| BackupError::local_io(format!("create {}", vm_root.display()), e))?;
        let path = vm_root.join(LOCK_FILE);

        for _ in 0..3 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut f) => {
                    writeln!(f, "{}", std::process::id())
                        .map_err(|e| BackupError::local_io(format!("write {}", path.display()), e))?;
                    debug!(lock = %path.display(), "run lock acquired");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let pid = match fs::read_to_string(&path) {
                        Ok(text) => text.trim().parse::<u32>().ok(),
                        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                        Err(e) => {
                            return Err(BackupError::local_io(format!("read {}", path.display()), e));
                        }
                    };
                    if pid.is_none_or(owner_alive) {
                        return Err(BackupError::AlreadyRunning {
                            vm: vm_name.to_string(),
                            lock: path,
                        });
                    }
                    warn!(lock = %path.display(), pid = ?pid, "Removing stale run lock");
                    match fs::remove_file(&path) {
                        Ok(()) => continue,
                        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                        Err(e) => {
                            return Err(BackupError::local_io(format!("remove {}", path.display()), e));
                        }
                    }
                }
                Err(e) => {
                    return Err(BackupError::local_io(format!("create {}", path.display()), e));
                }
            }
        }

        Err(BackupError::AlreadyRunning {
            vm: vm_name.to_string(),
            lock: path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "failed to remove run lock");
        }
    }
}

/// Without procfs liveness cannot be checked, so the owner is assumed alive.
fn owner_alive(pid: u32) -> bool {
    let proc_root = Path::new("/proc");
    !proc_root.is_dir() || proc_root.join(pid.to_string()).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_already_running() {
        let tmp = tempfile::tempdir().unwrap();
        let first = RunLock::acquire(tmp.path(), "db01").expect("first");

        let err = RunLock::acquire(tmp.path(), "db01").unwrap_err();
        assert!(matches!(err, BackupError::AlreadyRunning { .. }), "got {err:?}");

        drop(first);
        assert!(!tmp.path().join(LOCK_FILE).exists());
        RunLock::acquire(tmp.path(), "db01").expect("reacquire after drop");
    }

    #[test]
    fn lock_records_own_pid() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = RunLock::acquire(&tmp.path().join("vm"), "vm").expect("acquire");
        let pid = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn stale_lock_is_taken_over() {
        let tmp = tempfile::tempdir().unwrap();
        // Beyond the kernel's pid_max ceiling, so never a live process.
        fs::write(tmp.path().join(LOCK_FILE), "4194305\n").unwrap();

        let lock = RunLock::acquire(tmp.path(), "db01").expect("take over stale lock");
        let pid = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());
    }
}
