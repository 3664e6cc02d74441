//! ov-backup: snapshot-based VM backups for oVirt.
//!
//! A run snapshots a VM, attaches the snapshot disks to an agent VM (the one
//! this process runs in), copies each disk with `dd` into a timestamped
//! directory, releases everything it created and rotates old runs.

pub mod backup;
pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod ovirt;

pub use backup::{BackupRequest, Orchestrator, RunOutcome, RunReport};
pub use error::{BackupError, BackupResult};
