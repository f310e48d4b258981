//! Host and task monitoring.
//!
//! Three segments run under named global locks each pass: task cleanup
//! (stale heartbeats), host cleanup (the flagger sweep), and the
//! reachability checks. A failing segment logs its errors and never
//! blocks the others.

mod host_flagging;
mod reachability;
mod task_flagging;
mod termination;

pub use host_flagging::{flag_hosts, FlagReason};
pub use reachability::{
    monitor_reachability, NUM_REACHABILITY_WORKERS, REACHABILITY_CHECK_INTERVAL,
};
pub use task_flagging::flag_timed_out_heartbeats;
pub use termination::{terminate_hosts, TERMINATION_TIMEOUT};

use std::time::Duration;

use mci_core::lock::NamedLock;
use mci_core::storage::Storage;
use tracing::{error, info};

use crate::env::Env;
use crate::metrics::SharedMetrics;

/// How long a pass waits on a segment's lock before skipping it.
const LOCK_WAIT: Duration = Duration::from_secs(30);

/// The monitor component.
pub struct Monitor {
    env: Env,
    metrics: SharedMetrics,
}

impl Monitor {
    /// Create a monitor over the environment.
    #[must_use]
    pub fn new(env: Env, metrics: SharedMetrics) -> Self {
        Self { env, metrics }
    }

    /// Run one full monitoring pass. Errors are aggregated and logged;
    /// the pass itself only fails if a lock cannot be acquired at all.
    pub async fn run(&self) -> Vec<String> {
        let mut errors = Vec::new();

        errors.extend(
            self.locked_segment("monitor.task-cleanup", || async {
                flag_timed_out_heartbeats(&self.env).await
            })
            .await,
        );

        errors.extend(
            self.locked_segment("monitor.host-cleanup", || async {
                self.cleanup_hosts().await
            })
            .await,
        );

        errors.extend(
            self.locked_segment("monitor.reachability", || async {
                monitor_reachability(&self.env).await
            })
            .await,
        );

        if !errors.is_empty() {
            error!(count = errors.len(), "monitoring pass had failures: {errors:?}");
        }
        errors
    }

    /// The flagger sweep: find hosts to terminate under each criterion in
    /// order and retire them.
    async fn cleanup_hosts(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for reason in FlagReason::ALL {
            let flagged = match flag_hosts(&self.env, reason).await {
                Ok(flagged) => flagged,
                Err(err) => {
                    errors.push(format!("flagging hosts ({}): {err}", reason.as_str()));
                    continue;
                },
            };
            if flagged.is_empty() {
                continue;
            }
            info!(
                reason = reason.as_str(),
                count = flagged.len(),
                "flagged hosts for termination"
            );
            errors.extend(
                terminate_hosts(&self.env, flagged, reason.as_str(), self.metrics.clone()).await,
            );
        }
        errors
    }

    async fn locked_segment<F, Fut>(&self, name: &str, segment: F) -> Vec<String>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Vec<String>>,
    {
        let lock = NamedLock::new(std::sync::Arc::clone(&self.env.storage), name);
        match lock.acquire(LOCK_WAIT).await {
            Ok(true) => {},
            Ok(false) => {
                return vec![format!("timed out acquiring lock {name}")];
            },
            Err(err) => {
                return vec![format!("acquiring lock {name}: {err}")];
            },
        }

        let errors = segment().await;

        if let Err(err) = lock.release().await {
            error!("releasing lock {name}: {err}");
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mci_core::cloud::CloudManager;
    use mci_core::model::{Distro, Host, HostStatus};
    use mci_core::settings::Settings;

    use super::*;
    use crate::metrics::ServerMetrics;

    #[tokio::test]
    async fn test_full_pass_retires_decommissioned_host() {
        let env = Env::in_memory(Settings::default());
        env.storage
            .upsert_distro(Distro::new("linux-64", "mock", 10))
            .await
            .unwrap();

        let manager = env.cloud.manager_for("mock").unwrap();
        let spawned = manager
            .spawn(&Distro::new("linux-64", "mock", 10))
            .await
            .unwrap();
        let mut host = Host::intent("linux-64", "mock");
        host.id = spawned.id;
        host.status = HostStatus::Decommissioned;
        env.storage.insert_host(host.clone()).await.unwrap();

        let monitor = Monitor::new(env.clone(), Arc::new(ServerMetrics::new().unwrap()));
        let errors = monitor.run().await;
        assert!(errors.is_empty(), "{errors:?}");

        let stored = env.storage.get_host(&host.id).await.unwrap().unwrap();
        assert_eq!(stored.status, HostStatus::Terminated);
    }
}
