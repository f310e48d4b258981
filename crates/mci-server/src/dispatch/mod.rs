//! Task dispatcher.
//!
//! Pairs free hosts with queued tasks, one distro at a time under that
//! distro's named lock. Recording a dispatch is two compare-and-swaps:
//! the task's `undispatched -> dispatched` transition and the host's
//! `running_task` claim; a half-completed pair is reverted before moving
//! on. Starting the remote agent happens after the dispatch is recorded;
//! a failed start returns the task to the queue's source state.

mod host_gateway;

pub use host_gateway::{
    GatewayError, HostGateway, NoopHostGateway, SshHostGateway, AGENT_REVISION,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mci_core::lock::NamedLock;
use mci_core::model::{self, Distro, Host, Task};
use mci_core::queue::TaskQueue;
use mci_core::storage::{HostQuery, Storage, StorageError};
use tracing::{info, warn};

use crate::env::Env;
use crate::metrics::SharedMetrics;

/// How long a pass waits on a distro's dispatch lock before skipping it.
const LOCK_WAIT: Duration = Duration::from_secs(30);

enum PairOutcome {
    Dispatched(Task),
    HostClaimLost,
    TaskClaimLost,
}

/// The dispatcher component.
pub struct TaskRunner {
    env: Env,
    gateway: Arc<dyn HostGateway>,
    metrics: SharedMetrics,
}

impl TaskRunner {
    /// Create a dispatcher using the given gateway to start agents.
    #[must_use]
    pub fn new(env: Env, gateway: Arc<dyn HostGateway>, metrics: SharedMetrics) -> Self {
        Self {
            env,
            gateway,
            metrics,
        }
    }

    /// Run one dispatch pass over every distro with free hosts. Returns
    /// one error string per distro that failed; distros are isolated.
    pub async fn run(&self) -> Vec<String> {
        let free_hosts = match self
            .env
            .storage
            .find_hosts(&HostQuery {
                only_free: true,
                ..HostQuery::default()
            })
            .await
        {
            Ok(hosts) => hosts,
            Err(err) => return vec![format!("finding free hosts: {err}")],
        };
        info!(count = free_hosts.len(), "hosts available to take a task");

        let mut by_distro: HashMap<String, Vec<Host>> = HashMap::new();
        for host in free_hosts {
            by_distro
                .entry(host.distro_id.clone())
                .or_default()
                .push(host);
        }

        let mut errors = Vec::new();
        for (distro_id, hosts) in by_distro {
            if let Err(err) = self.process_distro(&distro_id, hosts).await {
                errors.push(format!("dispatching for distro {distro_id}: {err}"));
            }
        }
        errors
    }

    /// Dispatch as many queued tasks as there are free hosts in a distro.
    async fn process_distro(&self, distro_id: &str, hosts: Vec<Host>) -> Result<(), StorageError> {
        let Some(distro) = self.env.storage.get_distro(distro_id).await? else {
            warn!(distro_id = %distro_id, "free hosts reference an unknown distro");
            return Ok(());
        };

        let lock = NamedLock::new(
            Arc::clone(&self.env.storage),
            format!("taskrunner.{distro_id}"),
        );
        if !lock.acquire(LOCK_WAIT).await? {
            return Err(StorageError::Conflict(format!(
                "timed out acquiring dispatch lock for {distro_id}"
            )));
        }

        let result = self.dispatch_queue(&distro, hosts).await;

        if let Err(err) = lock.release().await {
            warn!(distro_id = %distro_id, "releasing dispatch lock: {err}");
        }
        result
    }

    async fn dispatch_queue(&self, distro: &Distro, hosts: Vec<Host>) -> Result<(), StorageError> {
        let mut queue = TaskQueue::load(Arc::clone(&self.env.storage), &distro.id).await?;
        let mut free_hosts = hosts.into_iter();
        let mut current_host = free_hosts.next();

        while let Some(host) = current_host.take() {
            let Some(item) = queue.next() else {
                break;
            };
            let task_id = item.task_id.clone();

            let Some(task) = self.env.storage.get_task(&task_id).await? else {
                warn!(task_id = %task_id, "queued task does not exist");
                queue.dequeue(&task_id).await?;
                current_host = Some(host);
                continue;
            };

            // a lost dequeue race means another dispatcher claimed the item
            if !queue.dequeue(&task_id).await? {
                current_host = Some(host);
                continue;
            }

            if !task.is_dispatchable() {
                warn!(
                    task_id = %task.id,
                    status = %task.status,
                    activated = task.activated,
                    "skipping queued task that is no longer dispatchable"
                );
                current_host = Some(host);
                continue;
            }

            match self.pair(&task, &host).await? {
                PairOutcome::Dispatched(dispatched) => {
                    self.metrics.dispatch("dispatcher");
                    self.start_agent(distro, dispatched, host).await;
                    current_host = free_hosts.next();
                },
                PairOutcome::HostClaimLost => {
                    // the host picked up work through next_task; move on
                    // to the next free host
                    current_host = free_hosts.next();
                },
                PairOutcome::TaskClaimLost => {
                    // the task went to another host; try the next queue
                    // item on this one
                    current_host = Some(host);
                },
            }
        }
        Ok(())
    }

    /// Record the task <-> host binding. A half-completed pair is
    /// reverted before reporting which side lost.
    async fn pair(&self, task: &Task, host: &Host) -> Result<PairOutcome, StorageError> {
        match self
            .env
            .storage
            .cas_running_task(&host.id, None, Some(&task.id))
            .await
        {
            Ok(()) => {},
            Err(StorageError::Conflict(_)) => return Ok(PairOutcome::HostClaimLost),
            Err(err) => return Err(err),
        }

        let secret = model::new_secret();
        match self
            .env
            .storage
            .mark_task_dispatched(&task.id, &host.id, &secret)
            .await
        {
            Ok(dispatched) => Ok(PairOutcome::Dispatched(dispatched)),
            Err(StorageError::Conflict(_)) => {
                self.env
                    .storage
                    .cas_running_task(&host.id, Some(&task.id), None)
                    .await?;
                Ok(PairOutcome::TaskClaimLost)
            },
            Err(err) => Err(err),
        }
    }

    /// Kick off the agent. A failed start returns the task to
    /// `undispatched` and frees the host for reuse.
    async fn start_agent(&self, distro: &Distro, task: Task, host: Host) {
        let api_url = format!("http://{}", self.env.settings.api.listen_addr);
        match self
            .gateway
            .start_agent(&host, distro, &task, &api_url)
            .await
        {
            Ok(agent_revision) => {
                info!(task_id = %task.id, host_id = %host.id, "task dispatched");
                if let Err(err) = self
                    .env
                    .storage
                    .set_host_agent_revision(&host.id, &agent_revision)
                    .await
                {
                    warn!(host_id = %host.id, "recording agent revision: {err}");
                }
            },
            Err(err) => {
                warn!(task_id = %task.id, host_id = %host.id, "agent start failed: {err}");
                if let Err(revert_err) = self.env.storage.mark_task_undispatched(&task.id).await {
                    warn!(task_id = %task.id, "reverting dispatch: {revert_err}");
                }
                if let Err(revert_err) = self
                    .env
                    .storage
                    .cas_running_task(&host.id, Some(&task.id), None)
                    .await
                {
                    warn!(host_id = %host.id, "releasing host after failed start: {revert_err}");
                }
            },
        }
    }
}
