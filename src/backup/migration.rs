//! Moving the agent VM onto the data VM's host.
//!
//! Attaching a snapshot disk works across hosts, but the copy then reads over
//! the storage network twice. Co-location is best-effort: the orchestrator
//! logs and ignores every error returned from here.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::Timing;
use crate::error::{BackupError, BackupResult};
use crate::ovirt::{RemoteClient, VmHandle};

/// What [`co_locate`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Colocation {
    AlreadyColocated { host: String },
    Migrated { from: Option<String>, to: String },
    /// The data VM is not placed on any host.
    NotRunning,
}

/// Migrate `agent` to the host running `data` and wait for it to settle.
pub async fn co_locate<C: RemoteClient>(
    client: &C,
    data: &VmHandle,
    agent: &VmHandle,
    timing: &Timing,
) -> BackupResult<Colocation> {
    let data_info = client.get_vm(data, false).await?;
    let agent_info = client.get_vm(agent, false).await?;

    let Some(target_host) = data_info.host else {
        info!(vm = %data.name, "VM is not running on a host; skipping migration");
        return Ok(Colocation::NotRunning);
    };

    if agent_info.host.as_deref() == Some(target_host.as_str()) {
        info!(host = %target_host, "Agent VM already runs on the same host");
        return Ok(Colocation::AlreadyColocated { host: target_host });
    }

    let cluster = data_info.cluster.ok_or_else(|| {
        BackupError::remote("migrate vm", format!("VM '{}' has no cluster", data.name))
    })?;

    info!(
        agent = %agent.name,
        from = ?agent_info.host,
        to = %target_host,
        "Migrating agent VM to the data VM's host"
    );
    client.migrate_vm(agent, &cluster, &target_host, true).await?;
    wait_while_migrating(client, agent, timing.migration_poll_interval, timing.migration_timeout)
        .await?;

    let settled = client.get_vm(agent, false).await?;
    if settled.host.as_deref() != Some(target_host.as_str()) {
        warn!(
            agent = %agent.name,
            host = ?settled.host,
            expected = %target_host,
            "Agent VM did not end up on the expected host"
        );
    }

    Ok(Colocation::Migrated {
        from: agent_info.host,
        to: target_host,
    })
}

async fn wait_while_migrating<C: RemoteClient>(
    client: &C,
    vm: &VmHandle,
    interval: Duration,
    timeout: Duration,
) -> BackupResult<()> {
    let started = Instant::now();
    loop {
        let info = client.get_vm(vm, false).await?;
        if !info.status.is_migrating() {
            info!(vm = %vm.name, status = %info.status, "Migration finished");
            return Ok(());
        }

        let waited = started.elapsed();
        if waited >= timeout {
            return Err(BackupError::MigrationTimeout {
                vm: vm.name.clone(),
                waited,
            });
        }
        info!(vm = %vm.name, secs = waited.as_secs(), "Waiting for migration to finish");
        tokio::time::sleep(interval).await;
    }
}
