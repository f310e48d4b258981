//! Process-tree cleanup.
//!
//! Every child the runtime spawns carries two environment markers: the
//! current task id and the agent's pid. At task boundaries and on
//! cancellation, the agent enumerates processes on the host, finds those
//! carrying both markers, and terminates them with SIGTERM followed by
//! SIGKILL after a grace window. This sweep is the sole guarantee that no
//! orphaned children leak across tasks; it is idempotent and safe to run
//! on every exit path.

use std::time::Duration;

use nix::sys::signal::{kill, Signal as NixSignal};
use nix::unistd::Pid;
use tracing::{info, warn};

/// Environment marker naming the owning task.
pub const TASK_ID_MARKER: &str = "EVR_TASK_ID";

/// Environment marker naming the spawning agent's pid.
pub const AGENT_PID_MARKER: &str = "EVR_AGENT_PID";

/// Grace window between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// The marker environment entries for children of the current agent.
#[must_use]
pub fn marker_env(task_id: &str) -> Vec<(String, String)> {
    vec![
        (TASK_ID_MARKER.to_string(), task_id.to_string()),
        (AGENT_PID_MARKER.to_string(), std::process::id().to_string()),
    ]
}

/// Returns `true` if the environment block contains both markers with
/// the expected values.
fn env_has_markers(environ: &[u8], task_marker: &str, pid_marker: &str) -> bool {
    let mut has_task = false;
    let mut has_pid = false;
    for entry in environ.split(|byte| *byte == 0) {
        let Ok(entry) = std::str::from_utf8(entry) else {
            continue;
        };
        if entry == task_marker {
            has_task = true;
        }
        if entry == pid_marker {
            has_pid = true;
        }
    }
    has_task && has_pid
}

/// Pids of live processes spawned by this agent for `task_id`.
fn find_marked_processes(task_id: &str) -> Vec<i32> {
    let task_marker = format!("{TASK_ID_MARKER}={task_id}");
    let pid_marker = format!("{AGENT_PID_MARKER}={}", std::process::id());
    let own_pid = std::process::id() as i32;

    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };

    let mut marked = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        if pid == own_pid {
            continue;
        }
        // unreadable environs (other users' processes) are skipped
        let Ok(environ) = std::fs::read(entry.path().join("environ")) else {
            continue;
        };
        if env_has_markers(&environ, &task_marker, &pid_marker) {
            marked.push(pid);
        }
    }
    marked
}

fn is_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Terminate every process spawned for `task_id` by this agent:
/// SIGTERM, a grace window, then SIGKILL for survivors.
pub async fn kill_spawned_procs(task_id: &str) {
    let marked = tokio::task::spawn_blocking({
        let task_id = task_id.to_string();
        move || find_marked_processes(&task_id)
    })
    .await
    .unwrap_or_default();

    if marked.is_empty() {
        return;
    }
    info!(count = marked.len(), "cleaning up spawned processes");

    for pid in &marked {
        if let Err(err) = kill(Pid::from_raw(*pid), NixSignal::SIGTERM) {
            warn!(pid, "SIGTERM failed: {err}");
        }
    }

    tokio::time::sleep(KILL_GRACE).await;

    for pid in marked {
        if is_alive(pid) {
            warn!(pid, "process survived SIGTERM; sending SIGKILL");
            if let Err(err) = kill(Pid::from_raw(pid), NixSignal::SIGKILL) {
                warn!(pid, "SIGKILL failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_has_markers() {
        let environ = b"PATH=/bin\0EVR_TASK_ID=t1\0EVR_AGENT_PID=42\0HOME=/root\0";
        assert!(env_has_markers(environ, "EVR_TASK_ID=t1", "EVR_AGENT_PID=42"));
        assert!(!env_has_markers(environ, "EVR_TASK_ID=t2", "EVR_AGENT_PID=42"));
        assert!(!env_has_markers(b"PATH=/bin\0", "EVR_TASK_ID=t1", "EVR_AGENT_PID=42"));
    }

    #[test]
    fn test_marker_env_values() {
        let env = marker_env("t1");
        assert_eq!(env[0], ("EVR_TASK_ID".to_string(), "t1".to_string()));
        assert_eq!(env[1].0, "EVR_AGENT_PID");
        assert_eq!(env[1].1, std::process::id().to_string());
    }

    #[tokio::test]
    async fn test_sweep_kills_marked_children() {
        use std::process::Command;

        let mut child = Command::new("sleep")
            .arg("300")
            .env(TASK_ID_MARKER, "cleanup-test-task")
            .env(AGENT_PID_MARKER, std::process::id().to_string())
            .spawn()
            .unwrap();

        kill_spawned_procs("cleanup-test-task").await;

        // reaped promptly rather than still sleeping
        let status = tokio::task::spawn_blocking(move || child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }
}
