//! Reachability reconciler.
//!
//! A bounded worker pool re-checks every host not monitored within the
//! reachability interval: read the cloud status; if the instance is
//! running, probe SSH and record the result; if the provider reports it
//! terminated, the record is marked terminated (the instance was removed
//! out-of-band).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mci_core::cloud::{CloudManager, CloudStatus};
use mci_core::model::{Host, HostStatus, SshOptions};
use mci_core::storage::{HostQuery, Storage};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::env::Env;

/// Hosts checked less recently than this are due.
pub const REACHABILITY_CHECK_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Width of the reachability worker pool.
pub const NUM_REACHABILITY_WORKERS: usize = 100;

/// Re-check every host due for a reachability check. Returns one error
/// string per host whose check failed.
pub async fn monitor_reachability(env: &Env) -> Vec<String> {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(REACHABILITY_CHECK_INTERVAL)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));

    let due = match env
        .storage
        .find_hosts(&HostQuery {
            statuses: Some(vec![HostStatus::Running, HostStatus::Unreachable]),
            monitored_before: Some(cutoff),
            ..HostQuery::default()
        })
        .await
    {
        Ok(hosts) => hosts,
        Err(err) => return vec![format!("finding hosts due for reachability: {err}")],
    };

    info!(count = due.len(), "running reachability checks");

    let semaphore = Arc::new(Semaphore::new(NUM_REACHABILITY_WORKERS));
    let mut join_set = JoinSet::new();
    for host in due {
        let env = env.clone();
        let semaphore = Arc::clone(&semaphore);
        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok()?;
            check_host_reachability(&env, &host)
                .await
                .err()
                .map(|err| format!("reachability check for host {}: {err}", host.id))
        });
    }

    let mut errors = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Some(err)) => errors.push(err),
            Ok(None) => {},
            Err(join_err) => errors.push(format!("reachability worker panicked: {join_err}")),
        }
    }
    errors
}

/// Check one host and record the outcome.
async fn check_host_reachability(env: &Env, host: &Host) -> Result<(), String> {
    let manager = env
        .cloud
        .manager_for(&host.provider)
        .map_err(|e| e.to_string())?;
    let cloud_status = manager.status(host).await.map_err(|e| e.to_string())?;

    match cloud_status {
        CloudStatus::Running => {
            let ssh = distro_ssh_options(env, host).await;
            let reachable = manager
                .is_ssh_reachable(host, &ssh)
                .await
                .map_err(|e| e.to_string())?;
            if reachable && host.status == HostStatus::Unreachable {
                info!(host_id = %host.id, "host is reachable again");
            } else if !reachable && host.status != HostStatus::Unreachable {
                warn!(host_id = %host.id, "marking host unreachable");
            }
            env.storage
                .update_host_reachability(&host.id, reachable)
                .await
                .map_err(|e| e.to_string())?;
        },
        CloudStatus::Terminated => {
            warn!(host_id = %host.id, "provider terminated host out-of-band");
            env.storage
                .mark_host_terminated(&host.id)
                .await
                .map_err(|e| e.to_string())?;
        },
        // initializing / stopped / unknown: leave the record alone and let
        // the next pass pick the host up again
        _ => {},
    }
    Ok(())
}

async fn distro_ssh_options(env: &Env, host: &Host) -> SshOptions {
    match env.storage.get_distro(&host.distro_id).await {
        Ok(Some(distro)) => distro.ssh,
        _ => SshOptions::default(),
    }
}
