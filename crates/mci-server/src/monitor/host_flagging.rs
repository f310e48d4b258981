//! Host flagging.
//!
//! A fixed, ordered set of predicates producing hosts to terminate. Static
//! hosts are never flagged by capacity or lifecycle policy; only an
//! operator decommission can retire them.

use chrono::{Duration as ChronoDuration, Utc};
use mci_core::model::{Host, HostStatus};
use mci_core::storage::{HostQuery, Storage, StorageError};

use crate::env::Env;

/// Why a host was flagged for termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagReason {
    /// Operator pulled the host.
    Decommissioned,

    /// Unreachable past the grace window.
    Unreachable,

    /// Free past the idle threshold with no upcoming demand.
    Idle,

    /// Capacity exceeds demand for the distro.
    Excess,

    /// Still provisioning past the window.
    ProvisionTimeout,

    /// Provisioning reported failure.
    ProvisionFailed,

    /// Past its explicit expiration.
    Expired,
}

impl FlagReason {
    /// All reasons, in sweep order.
    pub const ALL: [Self; 7] = [
        Self::Decommissioned,
        Self::Unreachable,
        Self::Idle,
        Self::Excess,
        Self::ProvisionTimeout,
        Self::ProvisionFailed,
        Self::Expired,
    ];

    /// Stable string for logs and metrics labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Decommissioned => "decommissioned",
            Self::Unreachable => "unreachable",
            Self::Idle => "idle",
            Self::Excess => "excess",
            Self::ProvisionTimeout => "provision_timeout",
            Self::ProvisionFailed => "provision_failed",
            Self::Expired => "expired",
        }
    }
}

/// Find the hosts to terminate under one flagging criterion.
///
/// # Errors
///
/// Returns an error if the underlying queries fail.
pub async fn flag_hosts(env: &Env, reason: FlagReason) -> Result<Vec<Host>, StorageError> {
    match reason {
        FlagReason::Decommissioned => flag_decommissioned(env).await,
        FlagReason::Unreachable => flag_unreachable(env).await,
        FlagReason::Idle => flag_idle(env).await,
        FlagReason::Excess => flag_excess(env).await,
        FlagReason::ProvisionTimeout => flag_provision_timeout(env).await,
        FlagReason::ProvisionFailed => flag_provision_failed(env).await,
        FlagReason::Expired => flag_expired(env).await,
    }
}

async fn flag_decommissioned(env: &Env) -> Result<Vec<Host>, StorageError> {
    env.storage
        .find_hosts(&HostQuery {
            statuses: Some(vec![HostStatus::Decommissioned]),
            ..HostQuery::default()
        })
        .await
}

/// The grace is counted from the check that first found the host
/// unreachable; a successful check in between resets it.
async fn flag_unreachable(env: &Env) -> Result<Vec<Host>, StorageError> {
    let grace = ChronoDuration::from_std(env.settings.monitor.unreachable_grace)
        .map_err(|e| StorageError::Fatal(e.to_string()))?;
    env.storage
        .find_hosts(&HostQuery {
            statuses: Some(vec![HostStatus::Unreachable]),
            unreachable_since_before: Some(Utc::now() - grace),
            ..HostQuery::default()
        })
        .await
}

async fn flag_idle(env: &Env) -> Result<Vec<Host>, StorageError> {
    let threshold = ChronoDuration::from_std(env.settings.monitor.idle_threshold)
        .map_err(|e| StorageError::Fatal(e.to_string()))?;
    let cutoff = Utc::now() - threshold;

    let free = env
        .storage
        .find_hosts(&HostQuery {
            only_free: true,
            ..HostQuery::default()
        })
        .await?;

    let mut flagged = Vec::new();
    for host in free {
        if host.is_static() {
            continue;
        }
        let idle_since = host.last_task_completed_time.unwrap_or(host.creation_time);
        if idle_since >= cutoff {
            continue;
        }
        // keep the host when its distro still has queued demand
        if !env.storage.get_task_queue(&host.distro_id).await?.is_empty() {
            continue;
        }
        flagged.push(host);
    }
    Ok(flagged)
}

async fn flag_excess(env: &Env) -> Result<Vec<Host>, StorageError> {
    let mut flagged = Vec::new();
    for distro in env.storage.all_distros().await? {
        let queue_len = env.storage.get_task_queue(&distro.id).await?.len();
        let mut free: Vec<Host> = env
            .storage
            .find_hosts(&HostQuery {
                distro_id: Some(distro.id.clone()),
                only_free: true,
                ..HostQuery::default()
            })
            .await?
            .into_iter()
            .filter(|host| !host.is_static())
            .collect();

        let excess = free.len().saturating_sub(queue_len);
        if excess == 0 {
            continue;
        }
        // retire the longest-idle hosts first
        free.sort_by_key(|host| host.last_task_completed_time.unwrap_or(host.creation_time));
        flagged.extend(free.into_iter().take(excess));
    }
    Ok(flagged)
}

async fn flag_provision_timeout(env: &Env) -> Result<Vec<Host>, StorageError> {
    let window = ChronoDuration::from_std(env.settings.monitor.provision_timeout)
        .map_err(|e| StorageError::Fatal(e.to_string()))?;
    let hosts = env
        .storage
        .find_hosts(&HostQuery {
            statuses: Some(vec![HostStatus::Uninitialized, HostStatus::Provisioning]),
            created_before: Some(Utc::now() - window),
            ..HostQuery::default()
        })
        .await?;
    Ok(hosts.into_iter().filter(|host| !host.is_static()).collect())
}

async fn flag_provision_failed(env: &Env) -> Result<Vec<Host>, StorageError> {
    env.storage
        .find_hosts(&HostQuery {
            statuses: Some(vec![HostStatus::ProvisionFailed]),
            ..HostQuery::default()
        })
        .await
}

async fn flag_expired(env: &Env) -> Result<Vec<Host>, StorageError> {
    let hosts = env
        .storage
        .find_hosts(&HostQuery {
            expires_before: Some(Utc::now()),
            ..HostQuery::default()
        })
        .await?;
    Ok(hosts
        .into_iter()
        .filter(|host| !host.is_static() && host.status != HostStatus::Terminated)
        .collect())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mci_core::model::Distro;
    use mci_core::settings::Settings;
    use mci_core::storage::Storage;
    use mci_core::queue::TaskQueueItem;
    use mci_core::model::Task;

    use super::*;

    async fn env_with_distro() -> Env {
        let env = Env::in_memory(Settings::default());
        env.storage
            .upsert_distro(Distro::new("linux-64", "mock", 10))
            .await
            .unwrap();
        env
    }

    fn idle_host(id: &str, idle_for: chrono::Duration) -> Host {
        let mut host = Host::intent("linux-64", "mock");
        host.id = id.to_string();
        host.status = HostStatus::Running;
        host.last_task_completed_time = Some(Utc::now() - idle_for);
        host
    }

    fn storage(env: &Env) -> Arc<dyn Storage> {
        Arc::clone(&env.storage)
    }

    #[tokio::test]
    async fn test_idle_flagging_spares_busy_queues() {
        let env = env_with_distro().await;
        let store = storage(&env);
        store
            .insert_host(idle_host("h1", chrono::Duration::hours(1)))
            .await
            .unwrap();

        let flagged = flag_hosts(&env, FlagReason::Idle).await.unwrap();
        assert_eq!(flagged.len(), 1);

        // queued demand keeps the host alive
        store
            .save_task_queue(
                "linux-64",
                vec![TaskQueueItem::from_task(
                    &Task::new("t1", "proj", "linux-64"),
                    None,
                )],
            )
            .await
            .unwrap();
        let flagged = flag_hosts(&env, FlagReason::Idle).await.unwrap();
        assert!(flagged.is_empty());
    }

    #[tokio::test]
    async fn test_idle_flagging_respects_threshold() {
        let env = env_with_distro().await;
        storage(&env)
            .insert_host(idle_host("h1", chrono::Duration::minutes(1)))
            .await
            .unwrap();

        let flagged = flag_hosts(&env, FlagReason::Idle).await.unwrap();
        assert!(flagged.is_empty());
    }

    #[tokio::test]
    async fn test_static_hosts_never_flagged_by_policy() {
        let env = env_with_distro().await;
        let mut host = idle_host("h1", chrono::Duration::hours(5));
        host.provider = mci_core::model::PROVIDER_STATIC.to_string();
        storage(&env).insert_host(host).await.unwrap();

        for reason in [FlagReason::Idle, FlagReason::Excess, FlagReason::Expired] {
            let flagged = flag_hosts(&env, reason).await.unwrap();
            assert!(flagged.is_empty(), "reason {:?}", reason);
        }
    }

    #[tokio::test]
    async fn test_excess_flags_longest_idle_first() {
        let env = env_with_distro().await;
        let store = storage(&env);
        store
            .insert_host(idle_host("recent", chrono::Duration::minutes(5)))
            .await
            .unwrap();
        store
            .insert_host(idle_host("stale", chrono::Duration::hours(3)))
            .await
            .unwrap();
        store
            .save_task_queue(
                "linux-64",
                vec![TaskQueueItem::from_task(
                    &Task::new("t1", "proj", "linux-64"),
                    None,
                )],
            )
            .await
            .unwrap();

        // two free hosts, one queued task: one host is excess
        let flagged = flag_hosts(&env, FlagReason::Excess).await.unwrap();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].id, "stale");
    }

    #[tokio::test]
    async fn test_decommissioned_and_provision_failed() {
        let env = env_with_distro().await;
        let store = storage(&env);

        let mut decom = Host::intent("linux-64", "mock");
        decom.id = "decom".to_string();
        decom.status = HostStatus::Decommissioned;
        store.insert_host(decom).await.unwrap();

        let mut failed = Host::intent("linux-64", "mock");
        failed.id = "failed".to_string();
        failed.status = HostStatus::ProvisionFailed;
        store.insert_host(failed).await.unwrap();

        let flagged = flag_hosts(&env, FlagReason::Decommissioned).await.unwrap();
        assert_eq!(flagged[0].id, "decom");
        let flagged = flag_hosts(&env, FlagReason::ProvisionFailed).await.unwrap();
        assert_eq!(flagged[0].id, "failed");
    }
}
