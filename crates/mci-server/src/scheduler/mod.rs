//! Scheduler.
//!
//! Turns the set of runnable tasks into per-distro ordered queues and a
//! desired-new-hosts count per distro. The scheduler never mutates tasks:
//! it replaces queues and emits allocation requests. Per-distro failures
//! are isolated and surfaced as an aggregate log.

mod host_allocator;
mod prioritizer;

pub use host_allocator::{desired_new_hosts, DEFAULT_TASK_DURATION};
pub use prioritizer::prioritize;

use std::collections::HashMap;

use mci_core::model::{Distro, Task};
use mci_core::queue::TaskQueueItem;
use mci_core::storage::{HostQuery, Storage, StorageError, TaskQuery};
use tracing::{info, warn};

use crate::env::Env;

/// Error types for scheduling.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The runnable set or distro list could not be loaded.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result of one scheduling pass.
#[derive(Debug, Default)]
pub struct SchedulerOutput {
    /// Queue length written per distro.
    pub queued: HashMap<String, usize>,

    /// New hosts requested per distro; consumed by the allocator.
    pub desired_new_hosts: HashMap<String, usize>,

    /// Per-distro failures, isolated from each other.
    pub errors: Vec<String>,
}

/// The scheduler component.
pub struct Scheduler {
    env: Env,
}

impl Scheduler {
    /// Create a scheduler over the environment.
    #[must_use]
    pub fn new(env: Env) -> Self {
        Self { env }
    }

    /// Run one scheduling pass: find runnable tasks, prioritize, write
    /// per-distro queues, estimate host need.
    ///
    /// An empty runnable set yields empty queues and zero allocations.
    ///
    /// # Errors
    ///
    /// Returns an error only when the runnable set or the distro list
    /// cannot be loaded; per-distro failures land in the output.
    pub async fn schedule(&self) -> Result<SchedulerOutput, SchedulerError> {
        let runnable = self.find_runnable_tasks().await?;
        info!(count = runnable.len(), "found runnable tasks");

        let prioritized = prioritize(runnable);

        let mut by_distro: HashMap<String, Vec<Task>> = HashMap::new();
        for task in prioritized {
            by_distro
                .entry(task.distro_id.clone())
                .or_default()
                .push(task);
        }

        let mut output = SchedulerOutput::default();
        for distro in self.env.storage.all_distros().await? {
            let tasks = by_distro.remove(&distro.id).unwrap_or_default();
            match self.assemble_distro_queue(&distro, tasks).await {
                Ok((queued, desired)) => {
                    output.queued.insert(distro.id.clone(), queued);
                    output.desired_new_hosts.insert(distro.id.clone(), desired);
                },
                Err(err) => {
                    output
                        .errors
                        .push(format!("distro {}: {err}", distro.id));
                },
            }
        }

        for (distro_id, tasks) in by_distro {
            warn!(
                distro_id = %distro_id,
                count = tasks.len(),
                "tasks target an unregistered distro; not queued"
            );
        }

        if !output.errors.is_empty() {
            warn!(errors = ?output.errors, "scheduling pass had per-distro failures");
        }
        Ok(output)
    }

    /// Undispatched, activated tasks whose dependencies are all satisfied.
    async fn find_runnable_tasks(&self) -> Result<Vec<Task>, StorageError> {
        let candidates = self
            .env
            .storage
            .find_tasks(&TaskQuery::runnable())
            .await?;

        let mut runnable = Vec::with_capacity(candidates.len());
        for task in candidates {
            if self.dependencies_met(&task).await? {
                runnable.push(task);
            }
        }
        Ok(runnable)
    }

    async fn dependencies_met(&self, task: &Task) -> Result<bool, StorageError> {
        for dep in &task.depends_on {
            let Some(dep_task) = self.env.storage.get_task(&dep.task_id).await? else {
                warn!(
                    task_id = %task.id,
                    dep_id = %dep.task_id,
                    "dependency does not exist; blocking task"
                );
                return Ok(false);
            };
            if !dep.satisfied_by(dep_task.status) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Write one distro's queue and estimate its host need.
    async fn assemble_distro_queue(
        &self,
        distro: &Distro,
        tasks: Vec<Task>,
    ) -> Result<(usize, usize), StorageError> {
        let mut items = Vec::with_capacity(tasks.len());
        for task in &tasks {
            let expected = self
                .env
                .storage
                .expected_task_duration(&task.project, &task.build_variant, &task.display_name)
                .await?;
            items.push(TaskQueueItem::from_task(task, expected));
        }

        let queued = items.len();
        self.env
            .storage
            .save_task_queue(&distro.id, items.clone())
            .await?;

        let up_hosts = self
            .env
            .storage
            .find_hosts(&HostQuery::up_for_distro(&distro.id))
            .await?
            .len();
        let desired = desired_new_hosts(
            &items,
            up_hosts,
            distro.max_hosts,
            self.env.settings.scheduler.turnaround_window,
        );
        info!(
            distro_id = %distro.id,
            queued, up_hosts, desired, "assembled distro queue"
        );
        Ok((queued, desired))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use mci_core::model::{Dependency, HostStatus, TaskStatus};
    use mci_core::settings::Settings;
    use mci_core::storage::Storage;

    use super::*;

    async fn env_with_distro() -> Env {
        let env = Env::in_memory(Settings::default());
        env.storage
            .upsert_distro(Distro::new("linux-64", "mock", 10))
            .await
            .unwrap();
        env
    }

    fn storage(env: &Env) -> Arc<dyn Storage> {
        Arc::clone(&env.storage)
    }

    #[tokio::test]
    async fn test_empty_input_yields_empty_queues() {
        let env = env_with_distro().await;
        let out = Scheduler::new(env.clone()).schedule().await.unwrap();
        assert_eq!(out.queued.get("linux-64"), Some(&0));
        assert_eq!(out.desired_new_hosts.get("linux-64"), Some(&0));
        assert!(out.errors.is_empty());
    }

    #[tokio::test]
    async fn test_queue_is_prioritized_prefix() {
        let env = env_with_distro().await;
        let store = storage(&env);

        let mut urgent = Task::new("urgent", "proj", "linux-64");
        urgent.priority = 10;
        store.insert_task(urgent).await.unwrap();
        store
            .insert_task(Task::new("routine", "proj", "linux-64"))
            .await
            .unwrap();

        Scheduler::new(env.clone()).schedule().await.unwrap();

        let queue = store.get_task_queue("linux-64").await.unwrap();
        let ids: Vec<&str> = queue.iter().map(|i| i.task_id.as_str()).collect();
        assert_eq!(ids, ["urgent", "routine"]);
    }

    #[tokio::test]
    async fn test_blocked_dependencies_excluded() {
        let env = env_with_distro().await;
        let store = storage(&env);

        store
            .insert_task(Task::new("dep", "proj", "linux-64"))
            .await
            .unwrap();
        let mut blocked = Task::new("blocked", "proj", "linux-64");
        blocked.depends_on = vec![Dependency::on_success("dep")];
        store.insert_task(blocked).await.unwrap();

        let out = Scheduler::new(env.clone()).schedule().await.unwrap();
        // only "dep" itself queues; "blocked" waits for it to succeed
        assert_eq!(out.queued.get("linux-64"), Some(&1));

        store.mark_task_dispatched("dep", "h1", "s").await.unwrap();
        store.mark_task_started("dep").await.unwrap();
        store
            .mark_task_ended("dep", TaskStatus::Succeeded, chrono::Utc::now())
            .await
            .unwrap();

        let out = Scheduler::new(env.clone()).schedule().await.unwrap();
        let queue = store.get_task_queue("linux-64").await.unwrap();
        assert_eq!(out.queued.get("linux-64"), Some(&1));
        assert_eq!(queue[0].task_id, "blocked");
    }

    #[tokio::test]
    async fn test_host_need_counts_up_hosts() {
        let env = env_with_distro().await;
        let store = storage(&env);

        // 60 minutes of history-free work, default 10m estimate each
        for i in 0..6 {
            store
                .insert_task(Task::new(format!("t{i}"), "proj", "linux-64"))
                .await
                .unwrap();
        }
        let mut up = mci_core::model::Host::intent("linux-64", "mock");
        up.status = HostStatus::Running;
        store.insert_host(up).await.unwrap();

        let mut settings = Settings::default();
        settings.scheduler.turnaround_window = Duration::from_secs(30 * 60);
        let env = Env::new(store, env.cloud.clone(), settings);

        let out = Scheduler::new(env).schedule().await.unwrap();
        // 60m / 30m window = 2 hosts needed, 1 already up
        assert_eq!(out.desired_new_hosts.get("linux-64"), Some(&1));
    }
}
