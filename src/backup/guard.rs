//! Scoped ownership of remote resources created during a run.
//!
//! ```text
//! create_snapshot ──► SnapshotGuard::acquire (poll until ok)
//!                        │
//!                        ├─ create_disk_attachment ──► AttachmentGuard::acquire (settle)
//!                        │     copy ...
//!                        │  AttachmentGuard::release ──► remove_disk_attachment
//!                        │
//!                     SnapshotGuard::release ──► remove_snapshot
//! ```
//!
//! Release is async and consumes the guard, so it is always an explicit call.
//! Every create issued through a guard is matched by exactly one remove, on
//! success, failure and timeout alike. A guard dropped without release logs an
//! error naming the resource that may have been left behind.

use tracing::{debug, error, info, warn};

use crate::config::Timing;
use crate::error::{BackupError, BackupResult};
use crate::host::DeviceResolver;
use crate::ovirt::{AttachmentHandle, RemoteClient, SnapshotHandle, SnapshotStatus};

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// A snapshot that has reached `ok` and is removed on release.
pub struct SnapshotGuard<'a, C: RemoteClient> {
    client: &'a C,
    snapshot: SnapshotHandle,
    timing: &'a Timing,
    released: bool,
}

impl<'a, C: RemoteClient> SnapshotGuard<'a, C> {
    /// Wait for a just-created snapshot to become usable.
    ///
    /// The first status check happens immediately; each further check follows
    /// one `snapshot_poll_interval`. On [`BackupError::SnapshotTimeout`] the
    /// snapshot removal has already been issued.
    pub async fn acquire(
        client: &'a C,
        snapshot: SnapshotHandle,
        timing: &'a Timing,
    ) -> BackupResult<Self> {
        let guard = Self {
            client,
            snapshot,
            timing,
            released: false,
        };

        match guard.wait_ready().await {
            Ok(()) => {
                info!(snapshot = %guard.snapshot.description, "Snapshot is ready");
                Ok(guard)
            }
            Err(e) => {
                if let Err(release_err) = guard.release().await {
                    error!(error = %release_err, "Failed to remove snapshot after timeout");
                }
                Err(e)
            }
        }
    }

    async fn wait_ready(&self) -> BackupResult<()> {
        let attempts = self.timing.snapshot_poll_attempts;
        for attempt in 1..=attempts {
            match self.client.snapshot_status(&self.snapshot).await {
                Ok(SnapshotStatus::Ok) => return Ok(()),
                Ok(status) => debug!(attempt, %status, "Waiting for snapshot creation to finish"),
                Err(e) => warn!(attempt, error = %e, "Snapshot status check failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.timing.snapshot_poll_interval).await;
            }
        }
        Err(BackupError::SnapshotTimeout {
            description: self.snapshot.description.clone(),
            attempts,
        })
    }

    pub fn snapshot(&self) -> &SnapshotHandle {
        &self.snapshot
    }

    /// Issue the single removal, then wait for the snapshot to unlock.
    pub async fn release(mut self) -> BackupResult<()> {
        self.released = true;

        if !self.timing.snapshot_settle.is_zero() {
            tokio::time::sleep(self.timing.snapshot_settle).await;
        }

        info!(snapshot = %self.snapshot.description, "Sending request to remove snapshot");
        self.client.remove_snapshot(&self.snapshot, true).await?;
        self.wait_removed().await;
        Ok(())
    }

    async fn wait_removed(&self) {
        for _ in 0..self.timing.snapshot_remove_attempts {
            match self.client.snapshot_status(&self.snapshot).await {
                Ok(SnapshotStatus::Locked) => {
                    tokio::time::sleep(self.timing.snapshot_poll_interval).await;
                }
                Ok(status) => {
                    debug!(%status, "snapshot unlocked after remove");
                    return;
                }
                // The snapshot no longer exists.
                Err(_) => return,
            }
        }
        if self.timing.snapshot_remove_attempts > 0 {
            warn!(
                snapshot = %self.snapshot.description,
                "Snapshot still locked after removal request"
            );
        }
    }
}

impl<C: RemoteClient> Drop for SnapshotGuard<'_, C> {
    fn drop(&mut self) {
        if !self.released {
            error!(
                snapshot_id = %self.snapshot.id,
                snapshot = %self.snapshot.description,
                "Snapshot guard dropped without release; snapshot may be left behind"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Disk attachment
// ---------------------------------------------------------------------------

/// A snapshot disk attached to the agent VM, detached on release.
pub struct AttachmentGuard<'a, C: RemoteClient> {
    client: &'a C,
    attachment: AttachmentHandle,
    released: bool,
}

impl<'a, C: RemoteClient> AttachmentGuard<'a, C> {
    /// Take ownership of a created attachment and wait for it to surface.
    ///
    /// `settle` is the minimum wait; the resolver's settle is the readiness
    /// signal after it.
    pub async fn acquire<R: DeviceResolver>(
        client: &'a C,
        attachment: AttachmentHandle,
        settle: std::time::Duration,
        resolver: &R,
    ) -> Self {
        let guard = Self {
            client,
            attachment,
            released: false,
        };
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
        resolver.settle().await;
        guard
    }

    pub fn attachment(&self) -> &AttachmentHandle {
        &self.attachment
    }

    /// Issue the single detach, then let local devices settle.
    pub async fn release<R: DeviceResolver>(mut self, resolver: &R) -> BackupResult<()> {
        self.released = true;
        info!(disk_id = %self.attachment.disk_id, "Detaching disk from agent VM");
        let result = self
            .client
            .remove_disk_attachment(&self.attachment, true)
            .await;
        resolver.settle().await;
        result
    }
}

impl<C: RemoteClient> Drop for AttachmentGuard<'_, C> {
    fn drop(&mut self) {
        if !self.released {
            error!(
                attachment_id = %self.attachment.id,
                disk_id = %self.attachment.disk_id,
                "Attachment guard dropped without release; disk may still be attached"
            );
        }
    }
}
