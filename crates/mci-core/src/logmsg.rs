//! Task log messages and test result documents.
//!
//! The agent batches [`LogMessage`]s and ships them to the API; tasks own
//! their log stream, append-only. Test results may reference separately
//! uploaded test logs by id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Logical log channel a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogChannel {
    /// Output of the task's own commands.
    Task,

    /// Agent orchestration around the commands.
    Execution,

    /// Host-level diagnostics (metrics, cleanup, dumps).
    System,
}

/// Message severity, mirrored from the agent's log levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogSeverity {
    /// Verbose diagnostics.
    Debug,

    /// Routine progress.
    Info,

    /// Suspicious but non-fatal.
    Warn,

    /// Failures.
    Error,
}

/// One log line in a task's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    /// Channel the line belongs to.
    pub channel: LogChannel,

    /// Severity.
    pub severity: LogSeverity,

    /// The line itself.
    pub message: String,

    /// When the line was produced on the agent.
    pub timestamp: DateTime<Utc>,
}

impl LogMessage {
    /// Build a message stamped with the current time.
    #[must_use]
    pub fn new(channel: LogChannel, severity: LogSeverity, message: impl Into<String>) -> Self {
        Self {
            channel,
            severity,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Outcome of one test within a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    /// The test passed.
    Pass,

    /// The test failed.
    Fail,

    /// The test was skipped.
    Skip,
}

/// One test's result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    /// Test name.
    pub test_name: String,

    /// Outcome.
    pub status: TestStatus,

    /// Seconds the test ran for.
    #[serde(default)]
    pub elapsed: f64,

    /// Id of a separately uploaded test log, if any.
    #[serde(default)]
    pub log_id: Option<String>,

    /// URL of an externally hosted log, if any.
    #[serde(default)]
    pub url: Option<String>,
}

/// A batch of test results attached to a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestResults {
    /// The individual results.
    pub results: Vec<TestResult>,
}

/// An individually uploaded test log, cross-referenced from results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestLog {
    /// Test name the log belongs to.
    pub name: String,

    /// Owning task.
    pub task_id: String,

    /// Execution number of the owning task.
    #[serde(default)]
    pub task_execution: u32,

    /// The log lines.
    pub lines: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(LogSeverity::Debug < LogSeverity::Info);
        assert!(LogSeverity::Warn < LogSeverity::Error);
    }

    #[test]
    fn test_log_message_wire_shape() {
        let msg = LogMessage::new(LogChannel::Task, LogSeverity::Info, "hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["channel"], "task");
        assert_eq!(json["severity"], "INFO");
        assert_eq!(json["message"], "hello");
    }
}
