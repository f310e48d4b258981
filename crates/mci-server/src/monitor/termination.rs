//! Host termination sweep.
//!
//! Flagged hosts are retired in a bounded fan-out with a hard per-host
//! timeout: run the teardown script over SSH if the host was provisioned,
//! call the cloud manager's terminate, then mark the host terminated in
//! storage. Partial failures are logged and do not abort the sweep.

use std::time::Duration;

use mci_core::cloud::CloudManager;
use mci_core::model::Host;
use mci_core::storage::Storage;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::env::Env;
use crate::metrics::SharedMetrics;
use crate::ssh;

/// Hard per-host timeout for the whole teardown + terminate sequence.
pub const TERMINATION_TIMEOUT: Duration = Duration::from_secs(12 * 60);

/// Timeout for the teardown script alone.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Terminate every flagged host concurrently. Returns one error string
/// per host that could not be retired.
pub async fn terminate_hosts(
    env: &Env,
    hosts: Vec<Host>,
    reason: &'static str,
    metrics: SharedMetrics,
) -> Vec<String> {
    let mut join_set = JoinSet::new();
    for host in hosts {
        let env = env.clone();
        let metrics = metrics.clone();
        join_set.spawn(async move {
            let host_id = host.id.clone();
            let outcome =
                tokio::time::timeout(TERMINATION_TIMEOUT, terminate_host(&env, &host)).await;
            match outcome {
                Ok(Ok(())) => {
                    info!(host_id = %host_id, reason, "terminated host");
                    metrics.host_terminated(reason);
                    None
                },
                Ok(Err(err)) => Some(format!("terminating host {host_id}: {err}")),
                Err(_) => Some(format!("timeout terminating host {host_id}")),
            }
        });
    }

    let mut errors = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Some(err)) => {
                error!("{err}");
                errors.push(err);
            },
            Ok(None) => {},
            Err(join_err) => errors.push(format!("termination worker panicked: {join_err}")),
        }
    }
    errors
}

/// Retire one host.
async fn terminate_host(env: &Env, host: &Host) -> Result<(), TerminationError> {
    let distro = env
        .storage
        .get_distro(&host.distro_id)
        .await
        .map_err(|e| TerminationError::Storage(e.to_string()))?;

    if let Some(distro) = &distro {
        if host.provisioned && !distro.teardown_script.is_empty() {
            if let Err(err) =
                ssh::run_script(host, &distro.ssh, &distro.teardown_script, TEARDOWN_TIMEOUT).await
            {
                // teardown is best-effort; the instance dies either way
                warn!(host_id = %host.id, "teardown script failed: {err}");
            }
        }
    }

    if !host.is_static() {
        let manager = env
            .cloud
            .manager_for(&host.provider)
            .map_err(|e| TerminationError::Cloud(e.to_string()))?;
        manager
            .terminate(host)
            .await
            .map_err(|e| TerminationError::Cloud(e.to_string()))?;
    }

    env.storage
        .mark_host_terminated(&host.id)
        .await
        .map_err(|e| TerminationError::Storage(e.to_string()))?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum TerminationError {
    #[error("cloud: {0}")]
    Cloud(String),

    #[error("storage: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mci_core::cloud::CloudStatus;
    use mci_core::model::{Distro, HostStatus};
    use mci_core::settings::Settings;

    use super::*;
    use crate::metrics::ServerMetrics;

    #[tokio::test]
    async fn test_sweep_terminates_and_marks() {
        let env = Env::in_memory(Settings::default());
        env.storage
            .upsert_distro(Distro::new("linux-64", "mock", 10))
            .await
            .unwrap();

        let provider = env.cloud.manager_for("mock").unwrap();
        let spawned = provider
            .spawn(&Distro::new("linux-64", "mock", 10))
            .await
            .unwrap();

        let mut host = Host::intent("linux-64", "mock");
        host.id = spawned.id;
        host.status = HostStatus::Running;
        env.storage.insert_host(host.clone()).await.unwrap();

        let metrics = Arc::new(ServerMetrics::new().unwrap());
        let errors = terminate_hosts(&env, vec![host.clone()], "idle", metrics).await;
        assert!(errors.is_empty());

        let stored = env.storage.get_host(&host.id).await.unwrap().unwrap();
        assert_eq!(stored.status, HostStatus::Terminated);
        assert_eq!(provider.status(&host).await.unwrap(), CloudStatus::Terminated);
    }

    #[tokio::test]
    async fn test_unknown_instance_surfaces_error_without_aborting() {
        let env = Env::in_memory(Settings::default());
        env.storage
            .upsert_distro(Distro::new("linux-64", "mock", 10))
            .await
            .unwrap();

        // the provider has never heard of this instance
        let mut ghost = Host::intent("linux-64", "mock");
        ghost.id = "ghost".to_string();
        ghost.status = HostStatus::Running;
        env.storage.insert_host(ghost.clone()).await.unwrap();

        let metrics = Arc::new(ServerMetrics::new().unwrap());
        let errors = terminate_hosts(&env, vec![ghost.clone()], "excess", metrics).await;
        assert_eq!(errors.len(), 1);

        // the record is untouched so the next sweep retries
        let stored = env.storage.get_host("ghost").await.unwrap().unwrap();
        assert_eq!(stored.status, HostStatus::Running);
    }
}
