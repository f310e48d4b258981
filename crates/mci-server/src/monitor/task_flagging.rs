//! Task heartbeat flagging.
//!
//! Tasks in flight whose agent has stopped heartbeating are reclaimed:
//! the host binding is released and the task is reset for a fresh
//! execution, or failed once the execution limit is reached.

use chrono::Utc;
use mci_core::model::TaskStatus;
use mci_core::storage::{Storage, StorageError, TaskQuery};
use tracing::{info, warn};

use crate::env::Env;

/// Reset or fail every task whose heartbeat has gone stale. Returns one
/// error string per task that could not be cleaned up.
pub async fn flag_timed_out_heartbeats(env: &Env) -> Vec<String> {
    let timeout = match chrono::Duration::from_std(env.settings.monitor.heartbeat_timeout) {
        Ok(timeout) => timeout,
        Err(err) => return vec![format!("invalid heartbeat timeout: {err}")],
    };
    let cutoff = Utc::now() - timeout;

    let stale = match env
        .storage
        .find_tasks(&TaskQuery {
            statuses: Some(vec![TaskStatus::Dispatched, TaskStatus::Started]),
            heartbeat_before: Some(cutoff),
            ..TaskQuery::default()
        })
        .await
    {
        Ok(tasks) => tasks,
        Err(err) => return vec![format!("finding stale-heartbeat tasks: {err}")],
    };

    let mut errors = Vec::new();
    for task in stale {
        if let Err(err) = reclaim_task(env, &task.id, task.host_id.as_deref()).await {
            errors.push(format!("reclaiming task {}: {err}", task.id));
        }
    }
    errors
}

async fn reclaim_task(
    env: &Env,
    task_id: &str,
    host_id: Option<&str>,
) -> Result<(), StorageError> {
    // release the host first so it can pick up new work either way
    if let Some(host_id) = host_id {
        match env
            .storage
            .cas_running_task(host_id, Some(task_id), None)
            .await
        {
            Ok(()) | Err(StorageError::Conflict(_)) | Err(StorageError::NotFound(_)) => {},
            Err(err) => return Err(err),
        }
    }

    match env.storage.reset_task(task_id).await {
        Ok(task) => {
            info!(
                task_id = %task_id,
                execution = task.execution,
                "reset task after heartbeat timeout"
            );
            Ok(())
        },
        Err(StorageError::Conflict(_)) => {
            warn!(
                task_id = %task_id,
                "task exceeded the execution limit; failing it"
            );
            env.storage
                .mark_task_ended(task_id, TaskStatus::Failed, Utc::now())
                .await
                .map(|_| ())
        },
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration as ChronoDuration;
    use mci_core::model::{Host, HostStatus, Task, MAX_TASK_EXECUTION};
    use mci_core::settings::Settings;
    use mci_core::storage::Storage;

    use super::*;

    async fn stale_running_task(store: &Arc<dyn Storage>, id: &str, execution: u32) {
        let mut task = Task::new(id, "proj", "linux-64");
        task.execution = execution;
        store.insert_task(task).await.unwrap();
        store.mark_task_dispatched(id, "h1", "s").await.unwrap();
        store.mark_task_started(id).await.unwrap();
        store
            .update_task_heartbeat(id, Utc::now() - ChronoDuration::hours(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stale_task_reset_and_host_released() {
        let env = Env::in_memory(Settings::default());
        let store = Arc::clone(&env.storage);

        let mut host = Host::intent("linux-64", "mock");
        host.id = "h1".to_string();
        host.status = HostStatus::Running;
        host.running_task = Some("t1".to_string());
        store.insert_host(host).await.unwrap();
        stale_running_task(&store, "t1", 0).await;

        let errors = flag_timed_out_heartbeats(&env).await;
        assert!(errors.is_empty());

        let task = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Undispatched);
        assert_eq!(task.execution, 1);

        let host = store.get_host("h1").await.unwrap().unwrap();
        assert!(host.running_task.is_none());
    }

    #[tokio::test]
    async fn test_exhausted_task_failed_not_reset() {
        let env = Env::in_memory(Settings::default());
        let store = Arc::clone(&env.storage);
        stale_running_task(&store, "t1", MAX_TASK_EXECUTION).await;

        let errors = flag_timed_out_heartbeats(&env).await;
        assert!(errors.is_empty());

        let task = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_fresh_heartbeats_left_alone() {
        let env = Env::in_memory(Settings::default());
        let store = Arc::clone(&env.storage);

        let task = Task::new("t1", "proj", "linux-64");
        store.insert_task(task).await.unwrap();
        store.mark_task_dispatched("t1", "h1", "s").await.unwrap();
        store.mark_task_started("t1").await.unwrap();
        store
            .update_task_heartbeat("t1", Utc::now())
            .await
            .unwrap();

        let errors = flag_timed_out_heartbeats(&env).await;
        assert!(errors.is_empty());
        let task = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Started);
    }
}
