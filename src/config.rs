//! Configuration for ov-backup.
//!
//! All settings live in a single TOML file (default
//! `/etc/ov-backup/config.toml`, overridable with `OV_BACKUP_CONFIG` or
//! `--config`). Every section and key is optional; missing values fall back to
//! the defaults below. CLI flags override whatever the file says.
//!
//! ```toml
//! [api]
//! url = "https://engine.example.com/ovirt-engine/api"
//! username = "admin@internal"
//! password = "secret"
//!
//! [backup]
//! root = "/mnt/ovirt-backup"
//! agent_vm = "ov-backup"
//! retention = 3
//!
//! [timing]
//! attach_settle_secs = 5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ov-backup/config.toml";

/// Environment variable that points at an alternative configuration file.
pub const CONFIG_ENV: &str = "OV_BACKUP_CONFIG";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Root configuration container.
#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub backup: BackupConfig,
    pub timing: TimingConfig,
    pub host: HostConfig,
}

/// Connection details for the management API.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct ApiConfig {
    /// API entry point, e.g. `https://engine/ovirt-engine/api`.
    pub url: String,
    pub username: String,
    pub password: String,
    /// PEM file with the engine's CA certificate.
    pub ca_file: Option<PathBuf>,
    /// Skip TLS certificate verification.
    pub insecure: bool,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Directory holding one subdirectory per backed-up VM.
    pub root: PathBuf,
    /// Name of the VM the snapshot disks are attached to.
    pub agent_vm: String,
    /// Number of successful runs kept per VM.
    pub retention: usize,
    /// Mount point holding export storage domains, for symlink materialization.
    pub export_root: Option<PathBuf>,
    pub log_file: PathBuf,
    /// Origin tag on audit events.
    pub application_name: String,
}

/// Poll intervals, attempt bounds and settle delays, in seconds.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct TimingConfig {
    pub snapshot_poll_interval_secs: u64,
    pub snapshot_poll_attempts: u32,
    pub snapshot_remove_attempts: u32,
    pub snapshot_settle_secs: u64,
    pub attach_settle_secs: u64,
    pub device_retry_interval_secs: u64,
    pub device_attempts: u32,
    pub udev_settle_timeout_secs: u64,
    pub migration_poll_interval_secs: u64,
    pub migration_timeout_secs: u64,
    /// Overall deadline for the guarded part of a run. Unset means no deadline.
    pub run_timeout_secs: Option<u64>,
}

/// Local tools and device paths on the agent host.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct HostConfig {
    pub dd_path: PathBuf,
    pub block_size: String,
    /// Extra `dd` operands appended after `bs=`.
    pub dd_flags: Vec<String>,
    pub udevadm_path: PathBuf,
    pub lsblk_path: PathBuf,
    /// Cross-check by-id matches with `lsblk`.
    pub lsblk_check: bool,
    pub disk_by_id_dir: PathBuf,
    pub sys_block_dir: PathBuf,
    pub dev_dir: PathBuf,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            password: String::new(),
            ca_file: None,
            insecure: false,
            request_timeout_secs: 120,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/mnt/ovirt-backup"),
            agent_vm: "ov-backup".to_string(),
            retention: 3,
            export_root: None,
            log_file: PathBuf::from("/var/log/ov-backup.log"),
            application_name: "ov-backup".to_string(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            snapshot_poll_interval_secs: 2,
            snapshot_poll_attempts: 50,
            snapshot_remove_attempts: 30,
            snapshot_settle_secs: 0,
            attach_settle_secs: 5,
            device_retry_interval_secs: 5,
            device_attempts: 6,
            udev_settle_timeout_secs: 30,
            migration_poll_interval_secs: 10,
            migration_timeout_secs: 30 * 60,
            run_timeout_secs: None,
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            dd_path: PathBuf::from("dd"),
            block_size: "4M".to_string(),
            dd_flags: vec!["iflag=direct".to_string(), "conv=sparse".to_string()],
            udevadm_path: PathBuf::from("udevadm"),
            lsblk_path: PathBuf::from("lsblk"),
            lsblk_check: false,
            disk_by_id_dir: PathBuf::from("/dev/disk/by-id"),
            sys_block_dir: PathBuf::from("/sys/block"),
            dev_dir: PathBuf::from("/dev"),
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime timing
// ---------------------------------------------------------------------------

/// Timing bounds consumed by the guards, resolver and migration waits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timing {
    pub snapshot_poll_interval: Duration,
    pub snapshot_poll_attempts: u32,
    pub snapshot_remove_attempts: u32,
    pub snapshot_settle: Duration,
    pub attach_settle: Duration,
    pub device_retry_interval: Duration,
    pub device_attempts: u32,
    pub migration_poll_interval: Duration,
    pub migration_timeout: Duration,
    pub run_timeout: Option<Duration>,
}

impl Default for Timing {
    fn default() -> Self {
        TimingConfig::default().to_timing()
    }
}

impl TimingConfig {
    pub fn to_timing(&self) -> Timing {
        Timing {
            snapshot_poll_interval: Duration::from_secs(self.snapshot_poll_interval_secs),
            snapshot_poll_attempts: self.snapshot_poll_attempts.max(1),
            snapshot_remove_attempts: self.snapshot_remove_attempts,
            snapshot_settle: Duration::from_secs(self.snapshot_settle_secs),
            attach_settle: Duration::from_secs(self.attach_settle_secs),
            device_retry_interval: Duration::from_secs(self.device_retry_interval_secs),
            device_attempts: self.device_attempts.max(1),
            migration_poll_interval: Duration::from_secs(self.migration_poll_interval_secs),
            migration_timeout: Duration::from_secs(self.migration_timeout_secs),
            run_timeout: self.run_timeout_secs.map(Duration::from_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Deserialize from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Load the configuration.
    ///
    /// An explicit path (from `--config` or `OV_BACKUP_CONFIG`) must exist.
    /// The default path is optional: when it is absent, defaults are used.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let path = explicit.map(Path::to_path_buf).or(from_env);

        match path {
            Some(path) => Self::read(&path),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::read(&default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    fn read(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parse config file {}", path.display()))
    }

    /// Reject configurations that cannot possibly run a backup.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api.url.is_empty() {
            bail!("api.url is not set");
        }
        if self.api.username.is_empty() {
            bail!("api.username is not set");
        }
        if self.backup.retention == 0 {
            bail!("backup.retention must be at least 1");
        }
        if self.backup.agent_vm.is_empty() {
            bail!("backup.agent_vm is not set");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = Config::from_toml("").expect("empty toml parses");
        assert_eq!(cfg.backup.retention, 3);
        assert_eq!(cfg.backup.agent_vm, "ov-backup");
        assert_eq!(cfg.timing.device_attempts, 6);
        assert_eq!(cfg.host.block_size, "4M");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = Config::from_toml(
            r#"
            [api]
            url = "https://engine/ovirt-engine/api"
            username = "admin@internal"
            password = "pw"

            [timing]
            attach_settle_secs = 60
            run_timeout_secs = 3600
            "#,
        )
        .expect("parse");

        assert_eq!(cfg.api.url, "https://engine/ovirt-engine/api");
        assert_eq!(cfg.api.request_timeout_secs, 120);
        assert_eq!(cfg.timing.attach_settle_secs, 60);
        assert_eq!(cfg.timing.snapshot_poll_attempts, 50);

        let timing = cfg.timing.to_timing();
        assert_eq!(timing.attach_settle, Duration::from_secs(60));
        assert_eq!(timing.run_timeout, Some(Duration::from_secs(3600)));
        cfg.validate().expect("valid");
    }

    #[test]
    fn validate_rejects_missing_url_and_zero_retention() {
        let mut cfg = Config::default();
        assert!(cfg.validate().is_err());

        cfg.api.url = "https://engine/api".into();
        cfg.api.username = "admin@internal".into();
        cfg.backup.retention = 0;
        let msg = cfg.validate().unwrap_err().to_string();
        assert!(msg.contains("retention"), "got: {msg}");
    }

    #[test]
    fn zero_attempt_bounds_are_clamped() {
        let cfg = TimingConfig {
            snapshot_poll_attempts: 0,
            device_attempts: 0,
            ..TimingConfig::default()
        };
        let timing = cfg.to_timing();
        assert_eq!(timing.snapshot_poll_attempts, 1);
        assert_eq!(timing.device_attempts, 1);
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope.toml");
        assert!(Config::load(Some(&missing)).is_err());
    }
}
