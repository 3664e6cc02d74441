//! Rotation of completed runs under a VM's backup directory.
//!
//! Only runs with a completion marker count. Pruning deletes the directory
//! before its marker, so an interrupted prune leaves an orphan marker (swept
//! later) rather than an unmarked directory that still looks like a backup.

use std::fs;
use std::path::Path;

use tracing::{info, warn};

use super::layout::{MARKER_SUFFIX, is_run_name, marker_path};
use crate::error::{BackupError, BackupResult};

/// Keeps at most `keep` completed runs per VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionManager {
    keep: usize,
}

impl RetentionManager {
    pub fn new(keep: usize) -> Self {
        Self { keep }
    }

    /// Names of completed runs under `vm_root`, oldest first.
    pub fn completed_runs(vm_root: &Path) -> BackupResult<Vec<String>> {
        let mut runs: Vec<String> = list_names(vm_root)?
            .into_iter()
            .filter(|name| is_run_name(name))
            .filter(|name| vm_root.join(name).is_dir() && marker_path(vm_root, name).is_file())
            .collect();
        runs.sort();
        Ok(runs)
    }

    /// Delete the oldest completed runs until at most `keep` remain.
    ///
    /// `current` names a run that has not been marked yet but is about to be;
    /// it counts toward `keep` and is never deleted. Returns the removed names.
    pub fn prune(&self, vm_root: &Path, current: Option<&str>) -> BackupResult<Vec<String>> {
        let mut runs = Self::completed_runs(vm_root)?;
        runs.retain(|name| Some(name.as_str()) != current);

        let budget = match current {
            Some(_) => self.keep.saturating_sub(1),
            None => self.keep,
        };
        if runs.len() <= budget {
            return Ok(Vec::new());
        }

        let excess = runs.len() - budget;
        info!(
            vm_root = %vm_root.display(),
            completed = runs.len(),
            keep = self.keep,
            "Rotating backup directories (oldest will be removed)"
        );

        let mut removed = Vec::with_capacity(excess);
        for name in runs.into_iter().take(excess) {
            let dir = vm_root.join(&name);
            fs::remove_dir_all(&dir)
                .map_err(|e| BackupError::local_io(format!("remove {}", dir.display()), e))?;
            let marker = marker_path(vm_root, &name);
            fs::remove_file(&marker)
                .map_err(|e| BackupError::local_io(format!("remove {}", marker.display()), e))?;
            info!(run = %name, "Removed expired backup run");
            removed.push(name);
        }
        Ok(removed)
    }

    /// Remove leftovers of runs that never completed.
    ///
    /// Deletes run directories without a marker (except `keep_current`) and
    /// markers whose directory is gone. Returns the names cleaned up.
    pub fn sweep_incomplete(
        vm_root: &Path,
        keep_current: Option<&str>,
    ) -> BackupResult<Vec<String>> {
        let names = list_names(vm_root)?;
        let mut swept = Vec::new();

        for name in &names {
            if Some(name.as_str()) == keep_current {
                continue;
            }

            if is_run_name(name) {
                let dir = vm_root.join(name);
                if dir.is_dir() && !marker_path(vm_root, name).exists() {
                    warn!(run_dir = %dir.display(), "Removing incomplete backup run");
                    fs::remove_dir_all(&dir)
                        .map_err(|e| BackupError::local_io(format!("remove {}", dir.display()), e))?;
                    swept.push(name.clone());
                }
                continue;
            }

            let Some(run) = name.strip_suffix(MARKER_SUFFIX) else {
                continue;
            };
            if is_run_name(run) && Some(run) != keep_current && !vm_root.join(run).is_dir() {
                let marker = vm_root.join(name);
                warn!(marker = %marker.display(), "Removing orphan completion marker");
                fs::remove_file(&marker)
                    .map_err(|e| BackupError::local_io(format!("remove {}", marker.display()), e))?;
                swept.push(name.clone());
            }
        }
        Ok(swept)
    }
}

fn list_names(dir: &Path) -> BackupResult<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BackupError::local_io(format!("list {}", dir.display()), e)),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| BackupError::local_io(format!("list {}", dir.display()), e))?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(root: &Path, name: &str) {
        fs::create_dir_all(root.join(name)).unwrap();
        fs::write(marker_path(root, name), "").unwrap();
    }

    #[test]
    fn prune_keeps_newest_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        for name in ["202601010000", "202601020000", "202601030000", "202601040000"] {
            completed(root, name);
        }

        let removed = RetentionManager::new(2).prune(root, None).expect("prune");
        assert_eq!(removed, vec!["202601010000", "202601020000"]);
        assert_eq!(
            RetentionManager::completed_runs(root).unwrap(),
            vec!["202601030000", "202601040000"]
        );
        assert!(!marker_path(root, "202601010000").exists());
    }

    #[test]
    fn prune_counts_the_current_run() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        for name in ["202601010000", "202601020000", "202601030000"] {
            completed(root, name);
        }
        fs::create_dir(root.join("202601040000")).unwrap();

        let removed = RetentionManager::new(3)
            .prune(root, Some("202601040000"))
            .expect("prune");
        assert_eq!(removed, vec!["202601010000"]);
        assert!(root.join("202601040000").is_dir());
    }

    #[test]
    fn prune_ignores_unmarked_and_foreign_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        completed(root, "202601010000");
        fs::create_dir(root.join("202601020000")).unwrap();
        fs::create_dir(root.join("notes")).unwrap();
        fs::write(root.join(".lock"), "1").unwrap();

        let removed = RetentionManager::new(1).prune(root, None).expect("prune");
        assert!(removed.is_empty());
        assert!(root.join("notes").is_dir());
        assert!(root.join("202601020000").is_dir());
    }

    #[test]
    fn prune_of_missing_root_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let removed = RetentionManager::new(1)
            .prune(&tmp.path().join("absent"), None)
            .expect("prune");
        assert!(removed.is_empty());
    }

    #[test]
    fn sweep_removes_unmarked_runs_and_orphan_markers() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        completed(root, "202601010000");
        fs::create_dir(root.join("202601020000")).unwrap();
        fs::write(marker_path(root, "202601030000"), "").unwrap();
        fs::create_dir(root.join("202601040000")).unwrap();

        let mut swept =
            RetentionManager::sweep_incomplete(root, Some("202601040000")).expect("sweep");
        swept.sort();
        assert_eq!(swept, vec!["202601020000", "202601030000.OK"]);
        assert!(root.join("202601010000").is_dir());
        assert!(root.join("202601040000").is_dir());
        assert!(!marker_path(root, "202601030000").exists());
    }
}
