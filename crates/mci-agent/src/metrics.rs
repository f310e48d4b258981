//! Metrics collectors.
//!
//! Two concurrent collectors post to the API while a task runs: a system
//! info sampler on a fixed interval, and a process-tree sampler that
//! starts at high frequency and falls back to a lower one. Both stop when
//! the task's context is canceled.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cleanup::{AGENT_PID_MARKER, TASK_ID_MARKER};
use crate::comm::HttpCommunicator;

/// Interval for the system info collector.
pub const SYS_INFO_INTERVAL: Duration = Duration::from_secs(30);

/// Process-tree interval while the task is young.
pub const PROC_INFO_FIRST_INTERVAL: Duration = Duration::from_secs(5);

/// Iterations sampled at the first interval.
pub const PROC_INFO_FIRST_ITERATIONS: u32 = 30;

/// Process-tree interval after the initial burst.
pub const PROC_INFO_SECOND_INTERVAL: Duration = Duration::from_secs(10);

/// Launch both collectors. They terminate when `cancel` fires.
pub fn start(comm: Arc<HttpCommunicator>, task_id: String, cancel: CancellationToken) {
    tokio::spawn(sys_info_collector(Arc::clone(&comm), cancel.clone()));
    tokio::spawn(process_info_collector(comm, task_id, cancel));
}

async fn sys_info_collector(comm: Arc<HttpCommunicator>, cancel: CancellationToken) {
    info!("starting system metrics collector");
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(SYS_INFO_INTERVAL) => {},
        }
        let sample = collect_system_info();
        comm.try_post("system_info", &sample).await;
    }
    info!("system metrics collector terminated");
}

/// High granularity right after task start, lower for the rest of the
/// task's life.
async fn process_info_collector(
    comm: Arc<HttpCommunicator>,
    task_id: String,
    cancel: CancellationToken,
) {
    info!("starting process metrics collector");
    let mut count: u32 = 0;
    loop {
        let interval = if count <= PROC_INFO_FIRST_ITERATIONS {
            PROC_INFO_FIRST_INTERVAL
        } else {
            PROC_INFO_SECOND_INTERVAL
        };
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {},
        }
        let sample = collect_process_info(&task_id);
        comm.try_post("process_info", &sample).await;
        count += 1;
    }
    info!("process metrics collector terminated");
}

/// One aggregated system sample from /proc.
fn collect_system_info() -> serde_json::Value {
    let loadavg = std::fs::read_to_string("/proc/loadavg").unwrap_or_default();
    let load_one = loadavg
        .split_whitespace()
        .next()
        .and_then(|field| field.parse::<f64>().ok())
        .unwrap_or(0.0);

    let meminfo = std::fs::read_to_string("/proc/meminfo").unwrap_or_default();
    let mem_kb = |key: &str| -> u64 {
        meminfo
            .lines()
            .find(|line| line.starts_with(key))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|field| field.parse().ok())
            .unwrap_or(0)
    };

    json!({
        "load_1m": load_one,
        "mem_total_kb": mem_kb("MemTotal:"),
        "mem_available_kb": mem_kb("MemAvailable:"),
        "num_cpus": std::thread::available_parallelism().map_or(0, std::num::NonZeroUsize::get),
    })
}

/// The agent process plus every marked child, with pid and command line.
fn collect_process_info(task_id: &str) -> serde_json::Value {
    let task_marker = format!("{TASK_ID_MARKER}={task_id}");
    let pid_marker = format!("{AGENT_PID_MARKER}={}", std::process::id());

    let mut procs = vec![json!({
        "pid": std::process::id(),
        "cmdline": "mci-agent",
    })];

    if let Ok(entries) = std::fs::read_dir("/proc") {
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            let Ok(environ) = std::fs::read_to_string(entry.path().join("environ")) else {
                continue;
            };
            let mut parts = environ.split('\0');
            let marked = parts.clone().any(|e| e == task_marker)
                && parts.any(|e| e == pid_marker);
            if !marked {
                continue;
            }
            let cmdline = std::fs::read_to_string(entry.path().join("cmdline"))
                .unwrap_or_default()
                .replace('\0', " ")
                .trim()
                .to_string();
            procs.push(json!({ "pid": pid, "cmdline": cmdline }));
        }
    }
    json!(procs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_sample_shape() {
        let sample = collect_system_info();
        assert!(sample.get("load_1m").is_some());
        assert!(sample["num_cpus"].as_u64().unwrap_or(0) >= 1);
    }

    #[test]
    fn test_process_sample_includes_self() {
        let sample = collect_process_info("no-such-task");
        let procs = sample.as_array().unwrap();
        assert_eq!(procs[0]["pid"], std::process::id());
    }
}
