//! Error taxonomy for a backup run.
//!
//! Every fallible operation in the backup core returns [`BackupError`]. The
//! orchestrator decides which variants abort a run and which are absorbed
//! (migration, metadata export, symlinks, audit events).

use std::path::PathBuf;
use std::time::Duration;

/// Errors raised while orchestrating a backup run.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// A named remote resource matched nothing.
    #[error("{kind} '{name}' not found")]
    ResourceNotFound { kind: &'static str, name: String },

    /// A name lookup matched more than one remote resource.
    #[error("{kind} name '{name}' is ambiguous: {count} matches")]
    AmbiguousResource {
        kind: &'static str,
        name: String,
        count: usize,
    },

    /// The snapshot never reached `ok` within the poll bound.
    #[error("snapshot '{description}' not ready after {attempts} status checks")]
    SnapshotTimeout { description: String, attempts: u32 },

    /// The attached disk never showed up as a local block device.
    #[error("no local block device for disk {disk_id} after {attempts} attempts")]
    DeviceNotFound { disk_id: String, attempts: u32 },

    /// The copy utility exited unsuccessfully.
    #[error("copy from {} to {} failed (exit {code})", source_path.display(), destination.display())]
    CopyFailed {
        source_path: PathBuf,
        destination: PathBuf,
        code: i32,
    },

    /// A local filesystem or process operation failed.
    #[error("{context}: {source}")]
    LocalIo {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Any other failure talking to the management API.
    #[error("{operation} failed: {message}")]
    RemoteApi { operation: String, message: String },

    /// Another run holds the lock for this VM.
    #[error("another backup of '{vm}' is running (lock {})", lock.display())]
    AlreadyRunning { vm: String, lock: PathBuf },

    /// The run deadline expired.
    #[error("backup run exceeded its deadline of {}s", limit.as_secs())]
    RunTimeout { limit: Duration },

    /// The agent VM did not finish migrating in time.
    #[error("VM '{vm}' still migrating after {}s", waited.as_secs())]
    MigrationTimeout { vm: String, waited: Duration },
}

impl BackupError {
    pub fn local_io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::LocalIo {
            context: context.into(),
            source,
        }
    }

    pub fn remote(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::RemoteApi {
            operation: operation.into(),
            message: message.to_string(),
        }
    }
}

/// Result type for backup operations.
pub type BackupResult<T> = Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_failed_names_both_paths() {
        let err = BackupError::CopyFailed {
            source_path: PathBuf::from("/dev/vdb"),
            destination: PathBuf::from("/backup/img"),
            code: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("/dev/vdb"));
        assert!(msg.contains("/backup/img"));
        assert!(msg.contains("exit 1"));
    }

    #[test]
    fn local_io_keeps_source() {
        let err = BackupError::local_io(
            "create run directory",
            std::io::Error::new(std::io::ErrorKind::AlreadyExists, "exists"),
        );
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.to_string(), "create run directory: exists");
    }
}
