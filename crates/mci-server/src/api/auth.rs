//! Request authentication for the agent protocol.
//!
//! Every request carries the task secret plus the host id and host
//! secret as headers. A wrong secret is a 409 so the agent treats it as
//! fatal; `fetch_vars` alone answers 401 for compatibility with setups
//! that proxy it.

use axum::http::HeaderMap;
use mci_core::model::{Host, Task};
use mci_core::storage::Storage;
use mci_core::wire::{HOST_ID_HEADER, HOST_SECRET_HEADER, TASK_SECRET_HEADER};

use super::error::ApiError;
use super::ApiState;

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

/// Load the task from the path and check the task secret. Wrong or
/// missing secrets are a 409.
pub async fn must_have_task(
    state: &ApiState,
    task_id: &str,
    headers: &HeaderMap,
) -> Result<Task, ApiError> {
    let task = state
        .env
        .storage
        .get_task(task_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task {task_id} not found")))?;

    if header_value(headers, TASK_SECRET_HEADER) != task.secret {
        return Err(ApiError::conflict("wrong task secret"));
    }
    Ok(task)
}

/// Load the host named by the headers and check the host secret. Wrong or
/// missing secrets are a 409.
pub async fn must_have_host(state: &ApiState, headers: &HeaderMap) -> Result<Host, ApiError> {
    let host_id = header_value(headers, HOST_ID_HEADER);
    if host_id.is_empty() {
        return Err(ApiError::bad_request("missing Host-Id header"));
    }

    let host = state
        .env
        .storage
        .get_host(host_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("host {host_id} not found")))?;

    if header_value(headers, HOST_SECRET_HEADER) != host.secret {
        return Err(ApiError::conflict("wrong host secret"));
    }
    Ok(host)
}

/// Task authentication for `fetch_vars`: same check, 401 on mismatch.
pub async fn must_have_task_unauthorized(
    state: &ApiState,
    task_id: &str,
    headers: &HeaderMap,
) -> Result<Task, ApiError> {
    match must_have_task(state, task_id, headers).await {
        Err(err) if err.is_conflict() => Err(ApiError::unauthorized("wrong task secret")),
        other => other,
    }
}
