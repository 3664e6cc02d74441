//! ov-backup: back up one oVirt VM from inside the agent VM.
//!
//! Intended to run from cron on the agent VM, once per data VM:
//!
//! ```text
//! ov-backup -d /mnt/ovirt-backup -n 3 db01
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use ov_backup::backup::{BackupRequest, Orchestrator, RunOutcome};
use ov_backup::config::Config;
use ov_backup::host::{DdCopier, HostDeviceResolver};
use ov_backup::logging;
use ov_backup::ovirt::OvirtClient;

/// Snapshot-based backup of an oVirt virtual machine
#[derive(Parser, Debug)]
#[command(name = "ov-backup", version, about = "Snapshot-based backup of an oVirt virtual machine")]
struct Args {
    /// Name of the VM to back up
    vm_name: String,

    /// Backup root directory (overrides backup.root)
    #[arg(short = 'd', long)]
    backup_root: Option<PathBuf>,

    /// Name of the agent VM the disks are attached to (overrides backup.agent_vm)
    #[arg(short = 'a', long)]
    agent_vm: Option<String>,

    /// Number of completed runs to keep (overrides backup.retention)
    #[arg(short = 'n', long)]
    retention: Option<usize>,

    /// Export storage domain id to link the finished run into
    #[arg(short = 'e', long)]
    export_domain: Option<String>,

    /// Migrate the agent VM to the data VM's host before copying
    #[arg(short = 'm', long)]
    migrate: bool,

    /// Skip the backup unless the VM is up
    #[arg(long)]
    only_if_up: bool,

    /// Configuration file (default /etc/ov-backup/config.toml or $OV_BACKUP_CONFIG)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Log file (overrides backup.log_file)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Deadline in seconds for the part of the run holding the snapshot
    #[arg(long)]
    run_timeout: Option<u64>,
}

impl Args {
    /// Fold CLI overrides into the loaded configuration.
    fn apply(&self, config: &mut Config) {
        if let Some(root) = &self.backup_root {
            config.backup.root = root.clone();
        }
        if let Some(agent) = &self.agent_vm {
            config.backup.agent_vm = agent.clone();
        }
        if let Some(retention) = self.retention {
            config.backup.retention = retention;
        }
        if let Some(log_file) = &self.log_file {
            config.backup.log_file = log_file.clone();
        }
        if let Some(secs) = self.run_timeout {
            config.timing.run_timeout_secs = Some(secs);
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ov-backup: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    args.apply(&mut config);

    let _log_guard = logging::init(&config.backup.log_file);

    match run(&args, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(
                target: logging::FILE_ONLY_TARGET,
                vm = %args.vm_name,
                error = %format!("{e:#}"),
                "Backup run failed"
            );
            eprintln!(
                "backup of '{}' failed: {e:#} (see {})",
                args.vm_name,
                config.backup.log_file.display()
            );
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args, config: &Config) -> Result<()> {
    config.validate().context("invalid configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("create tokio runtime")?;

    let timing = config.timing.to_timing();
    let client = OvirtClient::new(&config.api).context("create engine API client")?;
    let resolver = HostDeviceResolver::from_config(
        &config.host,
        Duration::from_secs(config.timing.udev_settle_timeout_secs),
    );
    let copier = DdCopier::from_config(&config.host);

    let orchestrator = Orchestrator::new(client, resolver, copier, timing)
        .with_origin(config.backup.application_name.clone())
        .with_export_root(config.backup.export_root.clone());

    let mut request = BackupRequest::new(
        args.vm_name.clone(),
        config.backup.agent_vm.clone(),
        config.backup.root.clone(),
    );
    request.retention = config.backup.retention;
    request.migrate = args.migrate;
    request.export_domain = args.export_domain.clone();
    request.only_if_up = args.only_if_up;

    info!(
        vm = %request.vm_name,
        agent = %request.agent_vm_name,
        root = %request.backup_root.display(),
        retention = request.retention,
        version = env!("CARGO_PKG_VERSION"),
        "Starting backup"
    );

    let outcome = runtime.block_on(orchestrator.run(&request))?;
    match outcome {
        RunOutcome::Completed(report) => {
            let bytes: u64 = report.disks.iter().map(|d| d.bytes).sum();
            info!(
                run_dir = %report.run_dir.display(),
                disks = report.disks.len(),
                bytes,
                clean = report.clean,
                "Backup finished"
            );
        }
        RunOutcome::Skipped { vm_name, status } => {
            info!(vm = %vm_name, %status, "Backup skipped");
        }
    }

    runtime.shutdown_timeout(Duration::from_secs(1));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_replace_config_values() {
        let args = Args::parse_from([
            "ov-backup", "-d", "/srv/backup", "-a", "agent01", "-n", "5", "--run-timeout", "600",
            "db01",
        ]);
        let mut config = Config::default();
        args.apply(&mut config);

        assert_eq!(args.vm_name, "db01");
        assert_eq!(config.backup.root, PathBuf::from("/srv/backup"));
        assert_eq!(config.backup.agent_vm, "agent01");
        assert_eq!(config.backup.retention, 5);
        assert_eq!(config.timing.run_timeout_secs, Some(600));
    }

    #[test]
    fn absent_flags_keep_config_values() {
        let args = Args::parse_from(["ov-backup", "db01"]);
        let mut config = Config::default();
        args.apply(&mut config);

        assert_eq!(config.backup.retention, 3);
        assert_eq!(config.backup.agent_vm, "ov-backup");
        assert!(!args.migrate);
        assert!(args.export_domain.is_none());
    }
}
