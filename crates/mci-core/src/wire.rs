//! Wire types for the agent <-> API protocol.
//!
//! All requests carry JSON bodies and the three authentication headers;
//! the base path is `{server}/api/{version}/task/{task_id}/{op}`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::logmsg::LogMessage;
use crate::model::TaskStatus;

/// Protocol version segment of the API base path.
pub const AGENT_API_VERSION: u32 = 2;

/// Header carrying the task secret.
pub const TASK_SECRET_HEADER: &str = "Task-Secret";

/// Header carrying the host id.
pub const HOST_ID_HEADER: &str = "Host-Id";

/// Header carrying the host secret.
pub const HOST_SECRET_HEADER: &str = "Host-Secret";

/// Maximum accepted size for a test log upload.
pub const MAX_TEST_LOG_BYTES: usize = 16 * 1024 * 1024;

/// Body of `start`: the agent reports its pid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStartRequest {
    /// Pid of the agent process on the host.
    pub pid: u32,
}

/// Response to `heartbeat`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// When `true`, the task was aborted out-of-band and the agent must
    /// stop the running command.
    #[serde(default)]
    pub abort: bool,
}

/// Agent-reported detail accompanying `end`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndTaskDetail {
    /// Terminal status: success, failed, or undispatched for an abort.
    pub status: TaskStatus,

    /// Kind of failure, e.g. the failing command's type.
    #[serde(default, rename = "type")]
    pub kind: String,

    /// Human-readable description of how the task ended.
    #[serde(default)]
    pub description: String,

    /// Whether the pipeline ended on a command deadline.
    #[serde(default)]
    pub timed_out: bool,
}

impl EndTaskDetail {
    /// Detail for a clean success.
    #[must_use]
    pub fn success() -> Self {
        Self {
            status: TaskStatus::Succeeded,
            kind: String::new(),
            description: String::new(),
            timed_out: false,
        }
    }

    /// Returns `true` if the status is one the API accepts for `end`.
    #[must_use]
    pub const fn is_valid_status(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Undispatched
        )
    }
}

/// Response to `end`: either a successor task or an exit instruction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndTaskResponse {
    /// When `true`, the agent must exit instead of continuing.
    #[serde(default)]
    pub should_exit: bool,

    /// When `true`, `task_id`/`task_secret` name the successor task.
    #[serde(default)]
    pub run_next: bool,

    /// Successor task id.
    #[serde(default)]
    pub task_id: Option<String>,

    /// Successor task secret.
    #[serde(default)]
    pub task_secret: Option<String>,

    /// Operator-readable explanation.
    #[serde(default)]
    pub message: String,
}

/// Response to `next_task`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NextTaskResponse {
    /// Task bound to the calling host, if any.
    #[serde(default)]
    pub task_id: Option<String>,

    /// Secret for the bound task.
    #[serde(default)]
    pub task_secret: Option<String>,

    /// When `true`, the host is being retired and the agent must exit.
    #[serde(default)]
    pub should_exit: bool,
}

/// Project-scoped variables returned by `fetch_vars`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpansionVars {
    /// Name -> value substitutions.
    #[serde(flatten)]
    pub vars: HashMap<String, String>,
}

/// A batch of log messages uploaded by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBatch {
    /// Owning task.
    pub task_id: String,

    /// When the batch was assembled.
    pub timestamp: DateTime<Utc>,

    /// The messages, oldest first.
    pub messages: Vec<LogMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_detail_status_validation() {
        let mut detail = EndTaskDetail::success();
        assert!(detail.is_valid_status());

        detail.status = TaskStatus::Undispatched;
        assert!(detail.is_valid_status());

        detail.status = TaskStatus::Started;
        assert!(!detail.is_valid_status());
    }

    #[test]
    fn test_end_detail_kind_renamed_on_wire() {
        let detail = EndTaskDetail {
            status: TaskStatus::Failed,
            kind: "test".to_string(),
            description: "command exited 1".to_string(),
            timed_out: false,
        };
        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["type"], "test");
        assert_eq!(json["status"], "failed");
    }

    #[test]
    fn test_expansion_vars_flatten() {
        let json = r#"{"token":"abc","workdir":"/data"}"#;
        let vars: ExpansionVars = serde_json::from_str(json).unwrap();
        assert_eq!(vars.vars.get("token").map(String::as_str), Some("abc"));
    }
}
