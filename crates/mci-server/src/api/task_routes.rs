//! Handlers for the agent protocol operations.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use mci_core::cloud::CloudManager;
use mci_core::model::{self, Distro, Host, HostStatus, ProjectConfig, Task, TaskStatus};
use mci_core::queue::TaskQueue;
use mci_core::storage::{HostQuery, Storage, StorageError};
use mci_core::wire::{
    EndTaskDetail, EndTaskResponse, ExpansionVars, HeartbeatResponse, LogBatch, NextTaskResponse,
    TaskStartRequest,
};
use mci_core::logmsg::{LogChannel, LogMessage, LogSeverity, TestLog, TestResults};
use serde::Serialize;
use tracing::{info, warn};

use super::auth::{must_have_host, must_have_task, must_have_task_unauthorized};
use super::error::ApiError;
use super::ApiState;

/// Plain acknowledgement body.
#[derive(Debug, Serialize)]
pub struct Ack {
    /// Operator-readable confirmation.
    pub message: String,
}

/// Body returned by `test_logs`.
#[derive(Debug, Serialize)]
pub struct TestLogIdResponse {
    /// Generated log id, referenced from test results.
    pub id: String,
}

/// `GET /task/{task_id}`: the task document.
pub async fn get_task_doc(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Task>, ApiError> {
    let task = must_have_task(&state, &task_id, &headers).await?;
    Ok(Json(task))
}

/// `GET /task/{task_id}/distro`: the task's distro template.
pub async fn get_distro(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Distro>, ApiError> {
    let task = must_have_task(&state, &task_id, &headers).await?;
    let distro = state
        .env
        .storage
        .get_distro(&task.distro_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("distro {} not found", task.distro_id)))?;
    Ok(Json(distro))
}

/// `GET /task/{task_id}/project`: the project's command pipelines.
pub async fn get_project(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ProjectConfig>, ApiError> {
    let task = must_have_task(&state, &task_id, &headers).await?;
    let project = state
        .env
        .storage
        .get_project(&task.project)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("empty project ref for task {task_id}")))?;
    Ok(Json(project))
}

/// `GET /task/{task_id}/fetch_vars`: project-scoped expansion variables.
/// Unlike the other operations this answers 401 on a wrong secret.
pub async fn fetch_vars(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ExpansionVars>, ApiError> {
    let task = must_have_task_unauthorized(&state, &task_id, &headers).await?;

    let mut vars = ExpansionVars::default();
    for (name, value) in &state.env.settings.expansions {
        vars.vars.insert(name.clone(), value.clone());
    }
    if let Some(project) = state.env.storage.get_project(&task.project).await? {
        vars.vars.extend(project.vars);
    }
    Ok(Json(vars))
}

/// `POST /task/{task_id}/start`: transition to started and record the
/// agent pid on the host.
pub async fn start_task(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<TaskStartRequest>,
) -> Result<Json<Ack>, ApiError> {
    let task = must_have_task(&state, &task_id, &headers).await?;
    info!(task_id = %task.id, pid = body.pid, "marking task started");

    state.env.storage.mark_task_started(&task.id).await?;

    let hosts = state
        .env
        .storage
        .find_hosts(&HostQuery {
            running_task: Some(task.id.clone()),
            ..HostQuery::default()
        })
        .await?;
    let Some(host) = hosts.first() else {
        return Err(ApiError::internal(format!(
            "no host found running task {task_id}"
        )));
    };
    state.env.storage.set_host_pid(&host.id, body.pid).await?;
    state
        .env
        .storage
        .update_host_communicated(&host.id, Utc::now())
        .await?;

    Ok(Json(Ack {
        message: format!("task {} started on host {}", task.id, host.id),
    }))
}

/// `POST /task/{task_id}/heartbeat`: record liveness; the response tells
/// the agent whether an out-of-band abort was requested.
pub async fn heartbeat(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    let task = must_have_task(&state, &task_id, &headers).await?;

    state
        .env
        .storage
        .update_task_heartbeat(&task.id, Utc::now())
        .await?;
    if let Some(host_id) = &task.host_id {
        let _ = state
            .env
            .storage
            .update_host_communicated(host_id, Utc::now())
            .await;
    }

    let abort = task.abort_requested;
    state
        .metrics
        .heartbeat(if abort { "abort" } else { "ok" });
    Ok(Json(HeartbeatResponse { abort }))
}

/// `POST /task/{task_id}/end`: transition to a terminal status, update
/// duration bookkeeping, and answer with a successor task or an exit
/// instruction.
pub async fn end_task(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    Json(detail): Json<EndTaskDetail>,
) -> Result<Json<EndTaskResponse>, ApiError> {
    let task = must_have_task(&state, &task_id, &headers).await?;
    let mut host = must_have_host(&state, &headers).await?;

    if !detail.is_valid_status() {
        return Err(ApiError::bad_request(format!(
            "invalid end status '{}' for task {task_id}",
            detail.status
        )));
    }
    let finish_time = Utc::now();

    // release the host's claim; a replayed end finds it already clear
    if host.running_task.as_deref() == Some(task.id.as_str()) {
        match state
            .env
            .storage
            .cas_running_task(&host.id, Some(&task.id), None)
            .await
        {
            Ok(()) => {
                host.running_task = None;
            },
            Err(StorageError::Conflict(_)) => {},
            Err(err) => return Err(err.into()),
        }
    }

    let mut response = EndTaskResponse::default();

    if detail.status == TaskStatus::Undispatched {
        // an aborted task was already deactivated by the abort request;
        // anything else is left alone with a warning
        if task.activated {
            warn!(
                task_id = %task.id,
                "task is active and undispatched after being reported finished"
            );
            response.message = format!("task {task_id} is still active; leaving it alone");
            return Ok(Json(response));
        }
        info!(task_id = %task.id, "task aborted and will not run");
        state.env.storage.mark_task_undispatched(&task.id).await?;
        response.message = format!("task {task_id} has been aborted");
    } else {
        let ended = state
            .env
            .storage
            .mark_task_ended(&task.id, detail.status, finish_time)
            .await?;
        info!(task_id = %task.id, status = %detail.status, "marked task finished");

        if let Some(time_taken) = ended.time_taken {
            if let Err(err) = state
                .env
                .storage
                .record_task_duration(
                    &ended.project,
                    &ended.build_variant,
                    &ended.display_name,
                    time_taken,
                )
                .await
            {
                warn!(task_id = %task.id, "updating expected duration: {err}");
            }
        }
        update_task_cost(&state, &ended, &host, finish_time).await;
    }

    if matches!(
        host.status,
        HostStatus::Decommissioned | HostStatus::Quarantined
    ) {
        response.should_exit = true;
        response.message = format!(
            "host {} is {} and the agent should exit",
            host.id, host.status
        );
        return Ok(Json(response));
    }

    // an agent built from an older deploy exits so the dispatcher can
    // relaunch the current binary
    if !host.agent_revision.is_empty() && host.agent_revision != crate::dispatch::AGENT_REVISION {
        response.should_exit = true;
        response.message = format!(
            "agent revision {} is stale; exiting for redeploy",
            host.agent_revision
        );
        return Ok(Json(response));
    }

    if host.running_task.is_none() {
        match assign_next_available_task(&state, &host).await? {
            Some(next) => {
                state.metrics.dispatch("end");
                response.run_next = true;
                response.task_id = Some(next.id);
                response.task_secret = Some(next.secret);
                response.message = "proceed with next task".to_string();
            },
            None => {
                if response.message.is_empty() {
                    response.message = "no next task on queue".to_string();
                }
            },
        }
    }
    Ok(Json(response))
}

/// `POST /task/{task_id}/next_task`: return the task bound to this host,
/// or atomically bind the next eligible one. Host-authenticated; never
/// takes a global lock.
pub async fn next_task(
    State(state): State<Arc<ApiState>>,
    Path(_task_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<NextTaskResponse>, ApiError> {
    let host = must_have_host(&state, &headers).await?;
    let mut response = NextTaskResponse::default();

    if matches!(
        host.status,
        HostStatus::Decommissioned | HostStatus::Quarantined | HostStatus::Terminated
    ) {
        response.should_exit = true;
        return Ok(Json(response));
    }
    let _ = state
        .env
        .storage
        .update_host_communicated(&host.id, Utc::now())
        .await;

    // re-entry after a crash or restart: hand back the bound task
    if let Some(running_id) = host.running_task.clone() {
        if let Some(task) = state.env.storage.get_task(&running_id).await? {
            if task.is_dispatchable() {
                // bound but never recorded as dispatched; record it now
                let secret = model::new_secret();
                let task = state
                    .env
                    .storage
                    .mark_task_dispatched(&task.id, &host.id, &secret)
                    .await?;
                response.task_id = Some(task.id);
                response.task_secret = Some(task.secret);
                return Ok(Json(response));
            }
            if task.activated && !task.status.is_finished() {
                response.task_id = Some(task.id.clone());
                response.task_secret = Some(task.secret.clone());
                return Ok(Json(response));
            }
        }
        // missing, finished, or deactivated: unbind and hand out new work
        match state
            .env
            .storage
            .cas_running_task(&host.id, Some(&running_id), None)
            .await
        {
            Ok(()) | Err(StorageError::Conflict(_)) => {},
            Err(err) => return Err(err.into()),
        }
        info!(host_id = %host.id, task_id = %running_id, "released stale running task");
    }

    let mut free_host = host;
    free_host.running_task = None;
    if let Some(task) = assign_next_available_task(&state, &free_host).await? {
        state.metrics.dispatch("next_task");
        info!(task_id = %task.id, host_id = %free_host.id, "assigned task to host");
        response.task_id = Some(task.id);
        response.task_secret = Some(task.secret);
    }
    Ok(Json(response))
}

/// `POST /task/{task_id}/log`: append a batch of log messages.
pub async fn append_log(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    Json(batch): Json<LogBatch>,
) -> Result<Json<Ack>, ApiError> {
    let task = must_have_task(&state, &task_id, &headers).await?;
    let count = batch.messages.len();
    state
        .env
        .storage
        .append_task_logs(&task.id, batch.messages)
        .await?;
    Ok(Json(Ack {
        message: format!("appended {count} log messages"),
    }))
}

/// `POST /task/{task_id}/system_info`: one system-stats sample from the
/// agent's collector, kept on the task's system log channel.
pub async fn post_system_info(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    Json(sample): Json<serde_json::Value>,
) -> Result<Json<Ack>, ApiError> {
    let task = must_have_task(&state, &task_id, &headers).await?;
    let message = LogMessage::new(LogChannel::System, LogSeverity::Debug, sample.to_string());
    state
        .env
        .storage
        .append_task_logs(&task.id, vec![message])
        .await?;
    Ok(Json(Ack {
        message: "system info recorded".to_string(),
    }))
}

/// `POST /task/{task_id}/process_info`: a process-tree sample from the
/// agent's collector.
pub async fn post_process_info(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    Json(sample): Json<serde_json::Value>,
) -> Result<Json<Ack>, ApiError> {
    let task = must_have_task(&state, &task_id, &headers).await?;
    let message = LogMessage::new(LogChannel::System, LogSeverity::Debug, sample.to_string());
    state
        .env
        .storage
        .append_task_logs(&task.id, vec![message])
        .await?;
    Ok(Json(Ack {
        message: "process info recorded".to_string(),
    }))
}

/// `POST /task/{task_id}/results`: attach a test results document.
pub async fn attach_results(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    Json(results): Json<TestResults>,
) -> Result<Json<Ack>, ApiError> {
    let task = must_have_task(&state, &task_id, &headers).await?;
    let count = results.results.len();
    state
        .env
        .storage
        .attach_test_results(&task.id, results)
        .await?;
    Ok(Json(Ack {
        message: format!("attached {count} test results"),
    }))
}

/// `POST /task/{task_id}/test_logs`: store one test log, returning its id
/// for cross-reference from results.
pub async fn upload_test_log(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    Json(log): Json<TestLog>,
) -> Result<Json<TestLogIdResponse>, ApiError> {
    must_have_task(&state, &task_id, &headers).await?;
    let id = state.env.storage.insert_test_log(log).await?;
    Ok(Json(TestLogIdResponse { id }))
}

/// Bind the next eligible queue item to a free host.
///
/// The two CAS operations (host claim, then task transition) make this
/// safe against concurrent callers: at most one host ever binds a given
/// task, and at most one task a given host.
pub(super) async fn assign_next_available_task(
    state: &ApiState,
    host: &Host,
) -> Result<Option<Task>, ApiError> {
    if host.running_task.is_some() {
        return Err(ApiError::internal(format!(
            "host {} already has a running task",
            host.id
        )));
    }

    let mut queue = TaskQueue::load(Arc::clone(&state.env.storage), &host.distro_id).await?;
    while let Some(item) = queue.next() {
        let task_id = item.task_id.clone();

        let Some(task) = state.env.storage.get_task(&task_id).await? else {
            warn!(task_id = %task_id, "queued task does not exist; dequeueing");
            queue.dequeue(&task_id).await?;
            continue;
        };
        if !task.is_dispatchable() {
            warn!(
                task_id = %task.id,
                status = %task.status,
                activated = task.activated,
                "skipping undispatchable queued task"
            );
            queue.dequeue(&task_id).await?;
            continue;
        }

        match state
            .env
            .storage
            .cas_running_task(&host.id, None, Some(&task_id))
            .await
        {
            Ok(()) => {},
            Err(StorageError::Conflict(_)) => {
                // the host acquired a task through another path; surface it
                let current = state.env.storage.get_host(&host.id).await?;
                if let Some(running_id) = current.and_then(|h| h.running_task) {
                    return Ok(state.env.storage.get_task(&running_id).await?);
                }
                return Ok(None);
            },
            Err(err) => return Err(err.into()),
        }

        let secret = model::new_secret();
        match state
            .env
            .storage
            .mark_task_dispatched(&task_id, &host.id, &secret)
            .await
        {
            Ok(dispatched) => {
                queue.dequeue(&task_id).await?;
                return Ok(Some(dispatched));
            },
            Err(StorageError::Conflict(_)) => {
                // lost the task to another host; undo the claim and move on
                let _ = state
                    .env
                    .storage
                    .cas_running_task(&host.id, Some(&task_id), None)
                    .await;
                queue.dequeue(&task_id).await?;
                continue;
            },
            Err(err) => return Err(err.into()),
        }
    }
    Ok(None)
}

/// Attribute a provider-computed cost to a finished task. Failures are
/// logged only; cost never affects task status.
async fn update_task_cost(
    state: &ApiState,
    task: &Task,
    host: &Host,
    finish_time: chrono::DateTime<Utc>,
) {
    let Ok(manager) = state.env.cloud.manager_for(&host.provider) else {
        return;
    };
    let Some(start_time) = task.start_time else {
        return;
    };
    if let Some(cost) = manager.cost_for(host, start_time, finish_time) {
        if let Err(err) = state.env.storage.set_task_cost(&task.id, cost).await {
            warn!(task_id = %task.id, "recording task cost: {err}");
        }
    }
}
