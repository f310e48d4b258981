//! Task entity and status machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum (zero based) execution number for a task. A task that has been
/// reset this many times is failed instead of re-dispatched.
pub const MAX_TASK_EXECUTION: u32 = 3;

/// Requester value for tasks created from a repository commit.
pub const REPO_REQUESTER: &str = "repo";

/// Requester value for tasks created from a user-submitted patch.
pub const PATCH_REQUESTER: &str = "patch";

/// Task status machine.
///
/// A task is terminal on `Succeeded` or `Failed` once its execution counter
/// has reached [`MAX_TASK_EXECUTION`]. An aborted task is reported by the
/// agent as `Undispatched` with the activation flag cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not yet paired with a host.
    Undispatched,

    /// Paired with a host; agent has not reported in yet.
    Dispatched,

    /// Agent has reported the task started.
    Started,

    /// Finished successfully.
    #[serde(rename = "success")]
    Succeeded,

    /// Finished with a failure.
    Failed,
}

impl TaskStatus {
    /// Returns `true` for the two terminal statuses.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Returns `true` if an out-of-band abort may still reach the agent.
    #[must_use]
    pub const fn is_abortable(self) -> bool {
        matches!(self, Self::Dispatched | Self::Started)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Undispatched => write!(f, "undispatched"),
            Self::Dispatched => write!(f, "dispatched"),
            Self::Started => write!(f, "started"),
            Self::Succeeded => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Origin of a task's parent version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Requester {
    /// Created by the repository tracker from a commit.
    Repo,

    /// Created from a user patch submission.
    Patch,
}

impl Requester {
    /// The wire string for this requester.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Repo => REPO_REQUESTER,
            Self::Patch => PATCH_REQUESTER,
        }
    }
}

/// A dependency edge to another task.
///
/// The dependency is satisfied when the depended-on task reaches
/// `required_status` (default: success). A `None` required status means any
/// terminal status satisfies the edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Id of the depended-on task.
    pub task_id: String,

    /// Status the dependency must reach, or `None` for any terminal status.
    #[serde(default)]
    pub required_status: Option<TaskStatus>,
}

impl Dependency {
    /// Dependency on another task finishing successfully.
    #[must_use]
    pub fn on_success(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            required_status: Some(TaskStatus::Succeeded),
        }
    }

    /// Returns `true` if `status` satisfies this edge.
    #[must_use]
    pub fn satisfied_by(&self, status: TaskStatus) -> bool {
        match self.required_status {
            Some(required) => status == required,
            None => status.is_finished(),
        }
    }
}

/// One executable unit; the smallest schedulable entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: String,

    /// Owning project identifier.
    pub project: String,

    /// Build variant within the project.
    pub build_variant: String,

    /// Distro the task must run on.
    pub distro_id: String,

    /// Human-readable name shown in queues and logs.
    pub display_name: String,

    /// Current status.
    pub status: TaskStatus,

    /// Whether the task is eligible for dispatch at all.
    pub activated: bool,

    /// Source revision the task was built from.
    pub revision: String,

    /// Commit order of the revision, used for patch interleaving.
    pub revision_order_number: i64,

    /// Origin of the task's parent version.
    pub requester: Requester,

    /// Tasks that must finish before this one may run.
    #[serde(default)]
    pub depends_on: Vec<Dependency>,

    /// Task group tag; members of a group are co-located on one host.
    #[serde(default)]
    pub task_group: String,

    /// Opaque token the agent must present; rotates on each dispatch.
    pub secret: String,

    /// Explicit scheduling priority; higher runs earlier.
    #[serde(default)]
    pub priority: i64,

    /// Execution counter, bounded by [`MAX_TASK_EXECUTION`].
    #[serde(default)]
    pub execution: u32,

    /// Host the task is or was bound to.
    #[serde(default)]
    pub host_id: Option<String>,

    /// When the task was last dispatched.
    #[serde(default)]
    pub dispatch_time: Option<DateTime<Utc>>,

    /// When the agent reported the task started.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,

    /// When the task reached a terminal status.
    #[serde(default)]
    pub finish_time: Option<DateTime<Utc>>,

    /// Last heartbeat received from the agent.
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// Wall-clock duration of the last completed execution.
    #[serde(default, with = "humantime_serde::option")]
    pub time_taken: Option<Duration>,

    /// Historical expected duration, attached by the scheduler.
    #[serde(default, with = "humantime_serde::option")]
    pub expected_duration: Option<Duration>,

    /// Whether an abort has been requested out-of-band.
    #[serde(default)]
    pub abort_requested: bool,

    /// Status of the previous completed execution of the same
    /// (project, variant, display name), when known.
    #[serde(default)]
    pub previous_status: Option<TaskStatus>,

    /// Cost attributed to the task by the host's provider, if computable.
    #[serde(default)]
    pub cost: Option<f64>,
}

impl Task {
    /// Create a new activated, undispatched task.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        project: impl Into<String>,
        distro_id: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            project: project.into(),
            build_variant: String::new(),
            distro_id: distro_id.into(),
            status: TaskStatus::Undispatched,
            activated: true,
            revision: String::new(),
            revision_order_number: 0,
            requester: Requester::Repo,
            depends_on: Vec::new(),
            task_group: String::new(),
            secret: super::new_secret(),
            priority: 0,
            execution: 0,
            host_id: None,
            dispatch_time: None,
            start_time: None,
            finish_time: None,
            last_heartbeat: None,
            time_taken: None,
            expected_duration: None,
            abort_requested: false,
            previous_status: None,
            cost: None,
        }
    }

    /// Returns `true` if the task may be handed to a host right now.
    #[must_use]
    pub const fn is_dispatchable(&self) -> bool {
        matches!(self.status, TaskStatus::Undispatched) && self.activated
    }

    /// Returns `true` if the execution counter still permits a reset.
    #[must_use]
    pub const fn may_restart(&self) -> bool {
        self.execution < MAX_TASK_EXECUTION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display_round_trip() {
        assert_eq!(TaskStatus::Succeeded.to_string(), "success");
        assert_eq!(TaskStatus::Undispatched.to_string(), "undispatched");

        let json = serde_json::to_string(&TaskStatus::Succeeded).unwrap();
        assert_eq!(json, "\"success\"");
        let back: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TaskStatus::Succeeded);
    }

    #[test]
    fn test_dispatchable_requires_activation() {
        let mut task = Task::new("t1", "proj", "linux-64");
        assert!(task.is_dispatchable());

        task.activated = false;
        assert!(!task.is_dispatchable());

        task.activated = true;
        task.status = TaskStatus::Dispatched;
        assert!(!task.is_dispatchable());
    }

    #[test]
    fn test_execution_cap() {
        let mut task = Task::new("t1", "proj", "linux-64");
        task.execution = MAX_TASK_EXECUTION;
        assert!(!task.may_restart());
    }

    #[test]
    fn test_dependency_satisfaction() {
        let dep = Dependency::on_success("t0");
        assert!(dep.satisfied_by(TaskStatus::Succeeded));
        assert!(!dep.satisfied_by(TaskStatus::Failed));

        let any_terminal = Dependency {
            task_id: "t0".to_string(),
            required_status: None,
        };
        assert!(any_terminal.satisfied_by(TaskStatus::Failed));
        assert!(!any_terminal.satisfied_by(TaskStatus::Started));
    }
}
