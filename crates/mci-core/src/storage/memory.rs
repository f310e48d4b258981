//! In-memory storage engine.
//!
//! Backs tests and single-node deployments. All operations take the same
//! CAS semantics a database engine would provide, so control-plane code
//! exercises the identical conflict paths either way.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    HostQuery, ProcessRuntime, ServiceFlags, Storage, StorageError, StorageResult, TaskQuery,
};
use crate::logmsg::{LogMessage, TestLog, TestResults};
use crate::model::{
    self, Distro, Host, HostStatus, ProjectConfig, Task, TaskStatus, MAX_TASK_EXECUTION,
};
use crate::queue::TaskQueueItem;

#[derive(Debug, Clone)]
struct LockRecord {
    owner: String,
    acquired_at: DateTime<Utc>,
    ttl: Duration,
}

impl LockRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now - self.acquired_at > ttl,
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct DurationStat {
    total: Duration,
    count: u32,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, Task>,
    hosts: HashMap<String, Host>,
    distros: HashMap<String, Distro>,
    projects: HashMap<String, ProjectConfig>,
    queues: HashMap<String, Vec<TaskQueueItem>>,
    locks: HashMap<String, LockRecord>,
    flags: ServiceFlags,
    durations: HashMap<(String, String, String), DurationStat>,
    runtimes: HashMap<String, ProcessRuntime>,
    task_logs: HashMap<String, Vec<LogMessage>>,
    test_results: HashMap<String, Vec<TestResults>>,
    test_logs: HashMap<String, TestLog>,
}

/// In-memory [`Storage`] implementation.
#[derive(Default)]
pub struct MemStorage {
    inner: RwLock<Inner>,
}

impl MemStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn insert_task(&self, task: Task) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        if inner.tasks.contains_key(&task.id) {
            return Err(StorageError::Conflict(format!(
                "task {} already exists",
                task.id
            )));
        }
        inner.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> StorageResult<Option<Task>> {
        Ok(self.inner.read().await.tasks.get(task_id).cloned())
    }

    async fn find_tasks(&self, query: &TaskQuery) -> StorageResult<Vec<Task>> {
        let inner = self.inner.read().await;
        let mut found: Vec<Task> = inner
            .tasks
            .values()
            .filter(|task| query.matches(task))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn update_task(&self, task: &Task) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        match inner.tasks.get_mut(&task.id) {
            Some(stored) => {
                *stored = task.clone();
                Ok(())
            },
            None => Err(StorageError::NotFound(format!("task {}", task.id))),
        }
    }

    async fn mark_task_dispatched(
        &self,
        task_id: &str,
        host_id: &str,
        secret: &str,
    ) -> StorageResult<Task> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StorageError::NotFound(format!("task {task_id}")))?;
        if task.status != TaskStatus::Undispatched {
            return Err(StorageError::Conflict(format!(
                "task {task_id} is {}, not undispatched",
                task.status
            )));
        }
        task.status = TaskStatus::Dispatched;
        task.host_id = Some(host_id.to_string());
        task.secret = secret.to_string();
        task.dispatch_time = Some(Utc::now());
        task.last_heartbeat = Some(Utc::now());
        Ok(task.clone())
    }

    async fn mark_task_undispatched(&self, task_id: &str) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StorageError::NotFound(format!("task {task_id}")))?;
        task.status = TaskStatus::Undispatched;
        task.host_id = None;
        task.dispatch_time = None;
        Ok(())
    }

    async fn mark_task_started(&self, task_id: &str) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StorageError::NotFound(format!("task {task_id}")))?;
        match task.status {
            TaskStatus::Started => Ok(()),
            TaskStatus::Dispatched => {
                task.status = TaskStatus::Started;
                task.start_time = Some(Utc::now());
                Ok(())
            },
            other => Err(StorageError::Conflict(format!(
                "task {task_id} is {other}, not dispatched"
            ))),
        }
    }

    async fn mark_task_ended(
        &self,
        task_id: &str,
        status: TaskStatus,
        finish_time: DateTime<Utc>,
    ) -> StorageResult<Task> {
        if !status.is_finished() {
            return Err(StorageError::Fatal(format!(
                "{status} is not a terminal status"
            )));
        }
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StorageError::NotFound(format!("task {task_id}")))?;
        if task.status == status {
            // replayed end; leave the stored document untouched
            return Ok(task.clone());
        }
        if task.status.is_finished() {
            return Err(StorageError::Conflict(format!(
                "task {task_id} already finished as {}",
                task.status
            )));
        }
        task.status = status;
        task.finish_time = Some(finish_time);
        if let Some(start) = task.start_time {
            task.time_taken = (finish_time - start).to_std().ok();
        }
        Ok(task.clone())
    }

    async fn set_task_activated(&self, task_id: &str, activated: bool) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StorageError::NotFound(format!("task {task_id}")))?;
        task.activated = activated;
        Ok(())
    }

    async fn set_task_abort(&self, task_id: &str) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StorageError::NotFound(format!("task {task_id}")))?;
        if task.status.is_abortable() {
            task.abort_requested = true;
            task.activated = false;
        }
        Ok(())
    }

    async fn update_task_heartbeat(&self, task_id: &str, at: DateTime<Utc>) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StorageError::NotFound(format!("task {task_id}")))?;
        task.last_heartbeat = Some(at);
        Ok(())
    }

    async fn reset_task(&self, task_id: &str) -> StorageResult<Task> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StorageError::NotFound(format!("task {task_id}")))?;
        if task.execution >= MAX_TASK_EXECUTION {
            return Err(StorageError::Conflict(format!(
                "task {task_id} reached the execution limit"
            )));
        }
        task.execution += 1;
        task.status = TaskStatus::Undispatched;
        task.host_id = None;
        task.secret = model::new_secret();
        task.abort_requested = false;
        task.dispatch_time = None;
        task.start_time = None;
        task.finish_time = None;
        task.last_heartbeat = None;
        Ok(task.clone())
    }

    async fn set_task_cost(&self, task_id: &str, cost: f64) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StorageError::NotFound(format!("task {task_id}")))?;
        task.cost = Some(cost);
        Ok(())
    }

    async fn insert_host(&self, host: Host) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        if inner.hosts.contains_key(&host.id) {
            return Err(StorageError::Conflict(format!(
                "host {} already exists",
                host.id
            )));
        }
        inner.hosts.insert(host.id.clone(), host);
        Ok(())
    }

    async fn get_host(&self, host_id: &str) -> StorageResult<Option<Host>> {
        Ok(self.inner.read().await.hosts.get(host_id).cloned())
    }

    async fn find_hosts(&self, query: &HostQuery) -> StorageResult<Vec<Host>> {
        let inner = self.inner.read().await;
        let mut found: Vec<Host> = inner
            .hosts
            .values()
            .filter(|host| query.matches(host))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn delete_host(&self, host_id: &str) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .hosts
            .remove(host_id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(format!("host {host_id}")))
    }

    async fn update_host(&self, host: &Host) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        match inner.hosts.get_mut(&host.id) {
            Some(stored) => {
                *stored = host.clone();
                Ok(())
            },
            None => Err(StorageError::NotFound(format!("host {}", host.id))),
        }
    }

    async fn cas_running_task(
        &self,
        host_id: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let host = inner
            .hosts
            .get_mut(host_id)
            .ok_or_else(|| StorageError::NotFound(format!("host {host_id}")))?;
        if host.running_task.as_deref() != expected {
            return Err(StorageError::Conflict(format!(
                "host {host_id} running_task is {:?}, expected {expected:?}",
                host.running_task
            )));
        }
        if new.is_none() {
            if let Some(finished) = host.running_task.take() {
                host.last_task_completed = Some(finished);
                host.last_task_completed_time = Some(Utc::now());
            }
        }
        host.running_task = new.map(str::to_string);
        Ok(())
    }

    async fn set_host_status(&self, host_id: &str, status: HostStatus) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let host = inner
            .hosts
            .get_mut(host_id)
            .ok_or_else(|| StorageError::NotFound(format!("host {host_id}")))?;
        if host.status == HostStatus::Terminated && status != HostStatus::Terminated {
            return Err(StorageError::Conflict(format!(
                "host {host_id} is terminated"
            )));
        }
        host.status = status;
        Ok(())
    }

    async fn mark_host_terminated(&self, host_id: &str) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let host = inner
            .hosts
            .get_mut(host_id)
            .ok_or_else(|| StorageError::NotFound(format!("host {host_id}")))?;
        if host.status == HostStatus::Terminated {
            return Ok(());
        }
        host.status = HostStatus::Terminated;
        host.termination_time = Some(Utc::now());
        host.running_task = None;
        Ok(())
    }

    async fn update_host_reachability(&self, host_id: &str, reachable: bool) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let host = inner
            .hosts
            .get_mut(host_id)
            .ok_or_else(|| StorageError::NotFound(format!("host {host_id}")))?;
        host.last_monitored = Some(Utc::now());
        if reachable {
            if host.status == HostStatus::Unreachable {
                host.status = HostStatus::Running;
            }
            host.unreachable_since = None;
        } else if !matches!(
            host.status,
            HostStatus::Terminated | HostStatus::Decommissioned | HostStatus::Quarantined
        ) {
            host.status = HostStatus::Unreachable;
            if host.unreachable_since.is_none() {
                host.unreachable_since = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn set_host_pid(&self, host_id: &str, pid: u32) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let host = inner
            .hosts
            .get_mut(host_id)
            .ok_or_else(|| StorageError::NotFound(format!("host {host_id}")))?;
        host.agent_pid = Some(pid);
        Ok(())
    }

    async fn set_host_agent_revision(&self, host_id: &str, revision: &str) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let host = inner
            .hosts
            .get_mut(host_id)
            .ok_or_else(|| StorageError::NotFound(format!("host {host_id}")))?;
        host.agent_revision = revision.to_string();
        Ok(())
    }

    async fn set_host_provisioned(&self, host_id: &str) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let host = inner
            .hosts
            .get_mut(host_id)
            .ok_or_else(|| StorageError::NotFound(format!("host {host_id}")))?;
        host.provisioned = true;
        host.status = HostStatus::Running;
        Ok(())
    }

    async fn update_host_communicated(
        &self,
        host_id: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let host = inner
            .hosts
            .get_mut(host_id)
            .ok_or_else(|| StorageError::NotFound(format!("host {host_id}")))?;
        host.last_communicated = Some(at);
        Ok(())
    }

    async fn upsert_project(&self, project: ProjectConfig) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        inner.projects.insert(project.id.clone(), project);
        Ok(())
    }

    async fn get_project(&self, project_id: &str) -> StorageResult<Option<ProjectConfig>> {
        Ok(self.inner.read().await.projects.get(project_id).cloned())
    }

    async fn upsert_distro(&self, distro: Distro) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        inner.distros.insert(distro.id.clone(), distro);
        Ok(())
    }

    async fn get_distro(&self, distro_id: &str) -> StorageResult<Option<Distro>> {
        Ok(self.inner.read().await.distros.get(distro_id).cloned())
    }

    async fn all_distros(&self) -> StorageResult<Vec<Distro>> {
        let inner = self.inner.read().await;
        let mut distros: Vec<Distro> = inner.distros.values().cloned().collect();
        distros.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(distros)
    }

    async fn save_task_queue(
        &self,
        distro_id: &str,
        items: Vec<TaskQueueItem>,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        inner.queues.insert(distro_id.to_string(), items);
        Ok(())
    }

    async fn get_task_queue(&self, distro_id: &str) -> StorageResult<Vec<TaskQueueItem>> {
        Ok(self
            .inner
            .read()
            .await
            .queues
            .get(distro_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn dequeue_task(&self, distro_id: &str, task_id: &str) -> StorageResult<bool> {
        let mut inner = self.inner.write().await;
        let Some(queue) = inner.queues.get_mut(distro_id) else {
            return Ok(false);
        };
        let before = queue.len();
        queue.retain(|item| item.task_id != task_id);
        Ok(queue.len() != before)
    }

    async fn try_acquire_lock(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> StorageResult<bool> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        match inner.locks.get(name) {
            Some(record) if record.owner != owner && !record.is_expired(now) => Ok(false),
            _ => {
                inner.locks.insert(
                    name.to_string(),
                    LockRecord {
                        owner: owner.to_string(),
                        acquired_at: now,
                        ttl,
                    },
                );
                Ok(true)
            },
        }
    }

    async fn release_lock(&self, name: &str, owner: &str) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        match inner.locks.get(name) {
            Some(record) if record.owner == owner => {
                inner.locks.remove(name);
                Ok(())
            },
            Some(record) => Err(StorageError::Conflict(format!(
                "lock {name} held by {}",
                record.owner
            ))),
            None => Ok(()),
        }
    }

    async fn get_service_flags(&self) -> StorageResult<ServiceFlags> {
        Ok(self.inner.read().await.flags.clone())
    }

    async fn set_service_flags(&self, flags: ServiceFlags) -> StorageResult<()> {
        self.inner.write().await.flags = flags;
        Ok(())
    }

    async fn record_task_duration(
        &self,
        project: &str,
        build_variant: &str,
        display_name: &str,
        duration: Duration,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let stat = inner
            .durations
            .entry((
                project.to_string(),
                build_variant.to_string(),
                display_name.to_string(),
            ))
            .or_default();
        stat.total += duration;
        stat.count += 1;
        Ok(())
    }

    async fn expected_task_duration(
        &self,
        project: &str,
        build_variant: &str,
        display_name: &str,
    ) -> StorageResult<Option<Duration>> {
        let inner = self.inner.read().await;
        let key = (
            project.to_string(),
            build_variant.to_string(),
            display_name.to_string(),
        );
        Ok(inner
            .durations
            .get(&key)
            .filter(|stat| stat.count > 0)
            .map(|stat| stat.total / stat.count))
    }

    async fn set_process_runtime(&self, name: &str, runtime: Duration) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        inner.runtimes.insert(
            name.to_string(),
            ProcessRuntime {
                name: name.to_string(),
                finished_at: Utc::now(),
                runtime,
            },
        );
        Ok(())
    }

    async fn all_process_runtimes(&self) -> StorageResult<Vec<ProcessRuntime>> {
        let inner = self.inner.read().await;
        let mut runtimes: Vec<ProcessRuntime> = inner.runtimes.values().cloned().collect();
        runtimes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(runtimes)
    }

    async fn append_task_logs(
        &self,
        task_id: &str,
        mut messages: Vec<LogMessage>,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .task_logs
            .entry(task_id.to_string())
            .or_default()
            .append(&mut messages);
        Ok(())
    }

    async fn get_task_logs(&self, task_id: &str) -> StorageResult<Vec<LogMessage>> {
        Ok(self
            .inner
            .read()
            .await
            .task_logs
            .get(task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn attach_test_results(&self, task_id: &str, results: TestResults) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .test_results
            .entry(task_id.to_string())
            .or_default()
            .push(results);
        Ok(())
    }

    async fn insert_test_log(&self, log: TestLog) -> StorageResult<String> {
        let mut inner = self.inner.write().await;
        let id = uuid::Uuid::new_v4().to_string();
        inner.test_logs.insert(id.clone(), log);
        Ok(id)
    }

    async fn get_test_log(&self, log_id: &str) -> StorageResult<Option<TestLog>> {
        Ok(self.inner.read().await.test_logs.get(log_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> Task {
        Task::new(id, "proj", "linux-64")
    }

    fn running_host(id: &str) -> Host {
        let mut host = Host::intent("linux-64", "mock");
        host.id = id.to_string();
        host.status = HostStatus::Running;
        host
    }

    #[tokio::test]
    async fn test_dispatch_cas_rejects_non_undispatched() {
        let store = MemStorage::new();
        store.insert_task(task("t1")).await.unwrap();

        store.mark_task_dispatched("t1", "h1", "s1").await.unwrap();
        let err = store
            .mark_task_dispatched("t1", "h2", "s2")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_running_task_cas() {
        let store = MemStorage::new();
        store.insert_host(running_host("h1")).await.unwrap();

        store
            .cas_running_task("h1", None, Some("t1"))
            .await
            .unwrap();

        // second claim loses
        let err = store
            .cas_running_task("h1", None, Some("t2"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        // clearing records the completed task
        store
            .cas_running_task("h1", Some("t1"), None)
            .await
            .unwrap();
        let host = store.get_host("h1").await.unwrap().unwrap();
        assert_eq!(host.last_task_completed.as_deref(), Some("t1"));
        assert!(host.running_task.is_none());
    }

    #[tokio::test]
    async fn test_end_is_idempotent() {
        let store = MemStorage::new();
        store.insert_task(task("t1")).await.unwrap();
        store.mark_task_dispatched("t1", "h1", "s1").await.unwrap();
        store.mark_task_started("t1").await.unwrap();

        let finish = Utc::now();
        let first = store
            .mark_task_ended("t1", TaskStatus::Succeeded, finish)
            .await
            .unwrap();
        let replay = store
            .mark_task_ended("t1", TaskStatus::Succeeded, Utc::now())
            .await
            .unwrap();
        assert_eq!(first.finish_time, replay.finish_time);
        assert_eq!(replay.status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_reset_respects_execution_limit() {
        let store = MemStorage::new();
        let mut t = task("t1");
        t.execution = MAX_TASK_EXECUTION - 1;
        store.insert_task(t).await.unwrap();

        let reset = store.reset_task("t1").await.unwrap();
        assert_eq!(reset.execution, MAX_TASK_EXECUTION);
        assert_eq!(reset.status, TaskStatus::Undispatched);

        let err = store.reset_task("t1").await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_terminated_is_terminal() {
        let store = MemStorage::new();
        store.insert_host(running_host("h1")).await.unwrap();
        store.mark_host_terminated("h1").await.unwrap();

        let err = store
            .set_host_status("h1", HostStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        // re-termination is a no-op
        store.mark_host_terminated("h1").await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_takeover_after_ttl() {
        let store = MemStorage::new();
        assert!(store
            .try_acquire_lock("sweep", "a", Duration::from_secs(0))
            .await
            .unwrap());
        // zero ttl means immediately expired; another owner may take over
        assert!(store
            .try_acquire_lock("sweep", "b", Duration::from_secs(600))
            .await
            .unwrap());
        assert!(!store
            .try_acquire_lock("sweep", "a", Duration::from_secs(600))
            .await
            .unwrap());
        store.release_lock("sweep", "b").await.unwrap();
    }

    #[tokio::test]
    async fn test_expected_duration_average() {
        let store = MemStorage::new();
        store
            .record_task_duration("p", "v", "compile", Duration::from_secs(100))
            .await
            .unwrap();
        store
            .record_task_duration("p", "v", "compile", Duration::from_secs(200))
            .await
            .unwrap();
        let expected = store
            .expected_task_duration("p", "v", "compile")
            .await
            .unwrap();
        assert_eq!(expected, Some(Duration::from_secs(150)));
    }
}
