//! Storage abstraction.
//!
//! Typed operations on the persisted entities. All cross-entity
//! coordination is built on field-level compare-and-swap; there are no
//! cross-entity transactions. The two CAS operations that matter are
//! [`Storage::cas_running_task`] on hosts and the status transition inside
//! [`Storage::mark_task_dispatched`]: together they make the task <-> host
//! binding race-free without a global lock on the hot path.

mod memory;

pub use memory::MemStorage;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::logmsg::{LogMessage, TestLog, TestResults};
use crate::model::{Distro, Host, HostStatus, ProjectConfig, Task, TaskStatus};
use crate::queue::TaskQueueItem;

/// Error types for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A compare-and-swap lost to a concurrent writer; the caller should
    /// surrender and retry the outer operation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A transient engine failure; safe to retry with backoff.
    #[error("transient storage error: {0}")]
    Transient(String),

    /// Unrecoverable failure; the caller must abort.
    #[error("fatal storage error: {0}")]
    Fatal(String),
}

impl StorageError {
    /// Returns `true` if the operation may be retried as-is.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Predicate describing a task query.
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    /// Restrict to these statuses.
    pub statuses: Option<Vec<TaskStatus>>,

    /// Restrict by activation flag.
    pub activated: Option<bool>,

    /// Restrict to one distro.
    pub distro_id: Option<String>,

    /// Only tasks whose last heartbeat is older than this instant
    /// (tasks that have never heartbeated do not match).
    pub heartbeat_before: Option<DateTime<Utc>>,

    /// Restrict to these ids.
    pub ids: Option<Vec<String>>,
}

impl TaskQuery {
    /// Tasks eligible for scheduling: undispatched and activated.
    #[must_use]
    pub fn runnable() -> Self {
        Self {
            statuses: Some(vec![TaskStatus::Undispatched]),
            activated: Some(true),
            ..Self::default()
        }
    }

    fn matches(&self, task: &Task) -> bool {
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(activated) = self.activated {
            if task.activated != activated {
                return false;
            }
        }
        if let Some(distro_id) = &self.distro_id {
            if &task.distro_id != distro_id {
                return false;
            }
        }
        if let Some(cutoff) = self.heartbeat_before {
            match task.last_heartbeat {
                Some(beat) if beat < cutoff => {},
                _ => return false,
            }
        }
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &task.id) {
                return false;
            }
        }
        true
    }
}

/// Predicate describing a host query.
#[derive(Debug, Clone, Default)]
pub struct HostQuery {
    /// Restrict to these statuses.
    pub statuses: Option<Vec<HostStatus>>,

    /// Restrict to one distro.
    pub distro_id: Option<String>,

    /// Only the host whose `running_task` equals this id.
    pub running_task: Option<String>,

    /// Only free hosts (running, no bound task).
    pub only_free: bool,

    /// Only hosts not monitored since this instant (never-monitored hosts
    /// match).
    pub monitored_before: Option<DateTime<Utc>>,

    /// Only hosts that have been unreachable since before this instant.
    pub unreachable_since_before: Option<DateTime<Utc>>,

    /// Only hosts expiring before this instant.
    pub expires_before: Option<DateTime<Utc>>,

    /// Only hosts created before this instant.
    pub created_before: Option<DateTime<Utc>>,
}

impl HostQuery {
    /// Hosts of a distro counted toward capacity.
    #[must_use]
    pub fn up_for_distro(distro_id: impl Into<String>) -> Self {
        Self {
            statuses: Some(crate::model::UP_HOST_STATUSES.to_vec()),
            distro_id: Some(distro_id.into()),
            ..Self::default()
        }
    }

    fn matches(&self, host: &Host) -> bool {
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&host.status) {
                return false;
            }
        }
        if let Some(distro_id) = &self.distro_id {
            if &host.distro_id != distro_id {
                return false;
            }
        }
        if let Some(task_id) = &self.running_task {
            if host.running_task.as_deref() != Some(task_id.as_str()) {
                return false;
            }
        }
        if self.only_free && !host.is_free() {
            return false;
        }
        if let Some(cutoff) = self.monitored_before {
            if let Some(monitored) = host.last_monitored {
                if monitored >= cutoff {
                    return false;
                }
            }
        }
        if let Some(cutoff) = self.unreachable_since_before {
            match host.unreachable_since {
                Some(since) if since < cutoff => {},
                _ => return false,
            }
        }
        if let Some(cutoff) = self.expires_before {
            match host.expiration_time {
                Some(expiry) if expiry < cutoff => {},
                _ => return false,
            }
        }
        if let Some(cutoff) = self.created_before {
            if host.creation_time >= cutoff {
                return false;
            }
        }
        true
    }
}

/// Per-service kill switches plus the site banner, settable by admins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceFlags {
    /// Disable the scheduler loop.
    #[serde(default)]
    pub scheduler_disabled: bool,

    /// Disable the dispatcher loop.
    #[serde(default)]
    pub taskrunner_disabled: bool,

    /// Disable the monitor loop.
    #[serde(default)]
    pub monitor_disabled: bool,

    /// Disable the host allocator loop.
    #[serde(default)]
    pub hostinit_disabled: bool,

    /// Message shown to users, empty for none.
    #[serde(default)]
    pub banner: String,
}

/// Bookkeeping record for one control-plane loop's last pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRuntime {
    /// Loop name, e.g. `scheduler`.
    pub name: String,

    /// When the pass completed.
    pub finished_at: DateTime<Utc>,

    /// How long the pass took.
    #[serde(with = "humantime_serde")]
    pub runtime: Duration,
}

/// Typed entity storage with compare-and-swap coordination.
#[async_trait]
pub trait Storage: Send + Sync {
    // --- tasks ---

    /// Insert a new task.
    async fn insert_task(&self, task: Task) -> StorageResult<()>;

    /// Fetch a task by id.
    async fn get_task(&self, task_id: &str) -> StorageResult<Option<Task>>;

    /// Find tasks matching the query.
    async fn find_tasks(&self, query: &TaskQuery) -> StorageResult<Vec<Task>>;

    /// Replace a task document wholesale. Reserved for materialization and
    /// test setup; the control plane uses the targeted transitions below.
    async fn update_task(&self, task: &Task) -> StorageResult<()>;

    /// Atomically transition a task `undispatched -> dispatched`, binding
    /// it to `host_id` and rotating its secret. Fails with `Conflict` if
    /// the task is no longer undispatched.
    async fn mark_task_dispatched(
        &self,
        task_id: &str,
        host_id: &str,
        secret: &str,
    ) -> StorageResult<Task>;

    /// Return a task to `undispatched`, clearing its host binding. Used
    /// when agent startup fails after dispatch was recorded.
    async fn mark_task_undispatched(&self, task_id: &str) -> StorageResult<()>;

    /// Transition `dispatched -> started`. Idempotent when already started.
    async fn mark_task_started(&self, task_id: &str) -> StorageResult<()>;

    /// Transition to a terminal status, recording the finish time and the
    /// time taken. Idempotent: re-reporting the same terminal status
    /// returns the stored task unchanged.
    async fn mark_task_ended(
        &self,
        task_id: &str,
        status: TaskStatus,
        finish_time: DateTime<Utc>,
    ) -> StorageResult<Task>;

    /// Set the activation flag.
    async fn set_task_activated(&self, task_id: &str, activated: bool) -> StorageResult<()>;

    /// Request an out-of-band abort. No-op unless the task is abortable.
    async fn set_task_abort(&self, task_id: &str) -> StorageResult<()>;

    /// Record a heartbeat from the agent.
    async fn update_task_heartbeat(&self, task_id: &str, at: DateTime<Utc>) -> StorageResult<()>;

    /// Reset a task for a fresh execution: increment the execution
    /// counter, return to `undispatched`, clear the host binding, rotate
    /// the secret. Fails with `Conflict` once the execution limit is
    /// reached.
    async fn reset_task(&self, task_id: &str) -> StorageResult<Task>;

    /// Record the provider-computed cost of a finished task.
    async fn set_task_cost(&self, task_id: &str, cost: f64) -> StorageResult<()>;

    // --- hosts ---

    /// Insert a new host (intent or confirmed).
    async fn insert_host(&self, host: Host) -> StorageResult<()>;

    /// Fetch a host by id.
    async fn get_host(&self, host_id: &str) -> StorageResult<Option<Host>>;

    /// Find hosts matching the query.
    async fn find_hosts(&self, query: &HostQuery) -> StorageResult<Vec<Host>>;

    /// Delete a host record. Used to clean up failed intent hosts.
    async fn delete_host(&self, host_id: &str) -> StorageResult<()>;

    /// Replace a host document wholesale. Reserved for allocator
    /// confirmation and test setup.
    async fn update_host(&self, host: &Host) -> StorageResult<()>;

    /// Compare-and-swap the host's `running_task` field: succeeds only if
    /// the stored value equals `expected`. When clearing (`new` is
    /// `None`), the old task id is recorded as `last_task_completed`.
    ///
    /// This is the binding primitive; see the module docs.
    async fn cas_running_task(
        &self,
        host_id: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> StorageResult<()>;

    /// Set the host status. A `Terminated` host never transitions back.
    async fn set_host_status(&self, host_id: &str, status: HostStatus) -> StorageResult<()>;

    /// Terminate a host: set status, record the time, release any bound
    /// task id. Idempotent.
    async fn mark_host_terminated(&self, host_id: &str) -> StorageResult<()>;

    /// Record a reachability check result, flipping the host between
    /// `running` and `unreachable` and stamping `last_monitored`.
    async fn update_host_reachability(&self, host_id: &str, reachable: bool) -> StorageResult<()>;

    /// Record the agent pid reported at task start.
    async fn set_host_pid(&self, host_id: &str, pid: u32) -> StorageResult<()>;

    /// Record the agent revision deployed to the host.
    async fn set_host_agent_revision(&self, host_id: &str, revision: &str) -> StorageResult<()>;

    /// Mark provisioning complete and the host ready for tasks.
    async fn set_host_provisioned(&self, host_id: &str) -> StorageResult<()>;

    /// Stamp the host's last API communication time.
    async fn update_host_communicated(&self, host_id: &str, at: DateTime<Utc>) -> StorageResult<()>;

    // --- projects ---

    /// Insert or replace a project configuration.
    async fn upsert_project(&self, project: ProjectConfig) -> StorageResult<()>;

    /// Fetch a project configuration by id.
    async fn get_project(&self, project_id: &str) -> StorageResult<Option<ProjectConfig>>;

    // --- distros ---

    /// Insert or replace a distro template.
    async fn upsert_distro(&self, distro: Distro) -> StorageResult<()>;

    /// Fetch a distro by id.
    async fn get_distro(&self, distro_id: &str) -> StorageResult<Option<Distro>>;

    /// All registered distros.
    async fn all_distros(&self) -> StorageResult<Vec<Distro>>;

    // --- task queues ---

    /// Atomically replace the queue for a distro with the scheduler's
    /// freshly prioritized output.
    async fn save_task_queue(
        &self,
        distro_id: &str,
        items: Vec<TaskQueueItem>,
    ) -> StorageResult<()>;

    /// Fetch the queue for a distro.
    async fn get_task_queue(&self, distro_id: &str) -> StorageResult<Vec<TaskQueueItem>>;

    /// Remove one task from a distro's queue. Returns `false` if the item
    /// was already gone (a lost dequeue race, not an error).
    async fn dequeue_task(&self, distro_id: &str, task_id: &str) -> StorageResult<bool>;

    // --- named global locks ---

    /// Try to acquire a named advisory lock. Returns `true` on success.
    /// A lock whose owner has not refreshed it within `ttl` is considered
    /// abandoned and may be taken over.
    async fn try_acquire_lock(&self, name: &str, owner: &str, ttl: Duration)
        -> StorageResult<bool>;

    /// Release a named lock. Releasing a lock held by someone else is a
    /// `Conflict`.
    async fn release_lock(&self, name: &str, owner: &str) -> StorageResult<()>;

    // --- service flags & bookkeeping ---

    /// Fetch the admin service flags.
    async fn get_service_flags(&self) -> StorageResult<ServiceFlags>;

    /// Replace the admin service flags.
    async fn set_service_flags(&self, flags: ServiceFlags) -> StorageResult<()>;

    /// Fold a completed task duration into the expected-duration average
    /// for its (project, variant, display name) key.
    async fn record_task_duration(
        &self,
        project: &str,
        build_variant: &str,
        display_name: &str,
        duration: Duration,
    ) -> StorageResult<()>;

    /// Historical expected duration for a task key, if any completions
    /// have been recorded.
    async fn expected_task_duration(
        &self,
        project: &str,
        build_variant: &str,
        display_name: &str,
    ) -> StorageResult<Option<Duration>>;

    /// Record a control-plane loop's pass completion.
    async fn set_process_runtime(&self, name: &str, runtime: Duration) -> StorageResult<()>;

    /// All recorded loop runtimes.
    async fn all_process_runtimes(&self) -> StorageResult<Vec<ProcessRuntime>>;

    // --- logs & results ---

    /// Append a batch of log messages to a task's log stream.
    async fn append_task_logs(
        &self,
        task_id: &str,
        messages: Vec<LogMessage>,
    ) -> StorageResult<()>;

    /// The task's full log stream, in append order.
    async fn get_task_logs(&self, task_id: &str) -> StorageResult<Vec<LogMessage>>;

    /// Attach a test results document to a task.
    async fn attach_test_results(&self, task_id: &str, results: TestResults) -> StorageResult<()>;

    /// Store an individual test log, returning its generated id so results
    /// can cross-reference it.
    async fn insert_test_log(&self, log: TestLog) -> StorageResult<String>;

    /// Fetch a stored test log by id.
    async fn get_test_log(&self, log_id: &str) -> StorageResult<Option<TestLog>>;
}
