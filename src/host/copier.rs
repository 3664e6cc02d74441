//! Raw block copy from a device to an image file.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{error, info};

use crate::config::HostConfig;
use crate::error::{BackupError, BackupResult};

/// Outcome of a successful copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyReport {
    /// Apparent size of the destination file.
    pub bytes: u64,
    pub elapsed: Duration,
}

/// Copies every byte of a block device into a file.
pub trait BlockCopier: Send + Sync {
    fn copy(
        &self,
        source: &Path,
        destination: &Path,
    ) -> impl Future<Output = BackupResult<CopyReport>> + Send;
}

/// [`BlockCopier`] backed by `dd`.
///
/// Defaults to `bs=4M iflag=direct conv=sparse`: direct reads keep the page
/// cache out of the way and sparse writes keep mostly-empty volumes small.
#[derive(Debug, Clone)]
pub struct DdCopier {
    pub dd_path: PathBuf,
    pub block_size: String,
    pub flags: Vec<String>,
}

impl DdCopier {
    pub fn from_config(host: &HostConfig) -> Self {
        Self {
            dd_path: host.dd_path.clone(),
            block_size: host.block_size.clone(),
            flags: host.dd_flags.clone(),
        }
    }

    /// Operands passed to `dd`.
    pub fn operands(&self, source: &Path, destination: &Path) -> Vec<String> {
        let mut args = vec![
            format!("if={}", source.display()),
            format!("of={}", destination.display()),
            format!("bs={}", self.block_size),
        ];
        args.extend(self.flags.iter().cloned());
        args
    }
}

impl BlockCopier for DdCopier {
    async fn copy(&self, source: &Path, destination: &Path) -> BackupResult<CopyReport> {
        let args = self.operands(source, destination);
        info!(
            command = %format!("{} {}", self.dd_path.display(), args.join(" ")),
            "Executing command"
        );

        let started = Instant::now();
        let mut child = Command::new(&self.dd_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            // A dropped copy (run deadline) must not leave dd running.
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackupError::local_io(format!("spawn {}", self.dd_path.display()), e))?;

        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!("Command output: {}", line.trim_end());
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| BackupError::local_io(format!("wait for {}", self.dd_path.display()), e))?;

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            error!(
                source = %source.display(),
                destination = %destination.display(),
                code,
                "dd command failed"
            );
            return Err(BackupError::CopyFailed {
                source_path: source.to_path_buf(),
                destination: destination.to_path_buf(),
                code,
            });
        }

        let bytes = tokio::fs::metadata(destination)
            .await
            .map(|m| m.len())
            .map_err(|e| BackupError::local_io(format!("stat {}", destination.display()), e))?;

        let report = CopyReport {
            bytes,
            elapsed: started.elapsed(),
        };
        info!(
            destination = %destination.display(),
            bytes = report.bytes,
            secs = report.elapsed.as_secs(),
            "Copy finished"
        );
        Ok(report)
    }
}
