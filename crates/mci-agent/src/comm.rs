//! HTTP communication with the API server.
//!
//! A communicator is scoped to a single task; everything it does is
//! relevant only to that task. Two clients are held: a general one for
//! fetches and uploads, and a dedicated short-timeout client for
//! heartbeats so a stuck general request cannot starve the liveness
//! signal.

use std::path::Path;
use std::time::Duration;

use mci_core::model::{Distro, ProjectConfig, Task};
use mci_core::retry::{retry, RetryConfig, RetryDecision, RetryError};
use mci_core::wire::{
    EndTaskDetail, EndTaskResponse, ExpansionVars, HeartbeatResponse, LogBatch, NextTaskResponse,
    TaskStartRequest, AGENT_API_VERSION, HOST_ID_HEADER, HOST_SECRET_HEADER, TASK_SECRET_HEADER,
};
use mci_core::logmsg::TestResults;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Request timeout for the heartbeat client.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Connect timeout for both clients.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Error types for API communication.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    /// Transport-level failure; retryable.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// 409: the secret is wrong or has rotated. Fatal for this agent.
    #[error("conflict: wrong secret")]
    Conflict,

    /// 401 from `fetch_vars`.
    #[error("unauthorized")]
    Unauthorized,

    /// Any other unexpected status.
    #[error("unexpected status code {0}")]
    BadStatus(u16),

    /// The response body could not be decoded.
    #[error("could not decode response: {0}")]
    Decode(String),

    /// The operation was canceled.
    #[error("canceled")]
    Canceled,

    /// The retry budget was exhausted.
    #[error("gave up after {attempts} attempts: {message}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Last error seen.
        message: String,
    },

    /// Client construction failed.
    #[error("could not build http client: {0}")]
    Setup(String),
}

impl CommError {
    fn classify(&self) -> RetryDecision {
        match self {
            Self::Network(_) => RetryDecision::Retry,
            Self::BadStatus(code) if *code >= 500 || *code == 408 || *code == 429 => {
                RetryDecision::Retry
            },
            _ => RetryDecision::Fatal,
        }
    }
}

fn flatten_retry(err: RetryError<CommError>) -> CommError {
    match err {
        RetryError::Fatal(inner) => inner,
        RetryError::Canceled => CommError::Canceled,
        RetryError::Exhausted { attempts, source } => CommError::Exhausted {
            attempts,
            message: source.to_string(),
        },
    }
}

/// Task-scoped API client.
#[derive(Clone)]
pub struct HttpCommunicator {
    base_url: String,
    task_id: String,
    task_secret: String,
    host_id: String,
    host_secret: String,
    client: reqwest::Client,
    heartbeat_client: reqwest::Client,
    retry_config: RetryConfig,
}

impl HttpCommunicator {
    /// Build a communicator for one task.
    ///
    /// `https_cert` may point to a PEM file for self-signed API servers.
    ///
    /// # Errors
    ///
    /// Returns an error if a client cannot be constructed or the
    /// certificate cannot be read.
    pub fn new(
        api_server: &str,
        task_id: impl Into<String>,
        task_secret: impl Into<String>,
        host_id: impl Into<String>,
        host_secret: impl Into<String>,
        https_cert: Option<&Path>,
    ) -> Result<Self, CommError> {
        let certificate = match https_cert {
            Some(path) => {
                let pem = std::fs::read(path)
                    .map_err(|e| CommError::Setup(format!("reading {}: {e}", path.display())))?;
                Some(
                    reqwest::Certificate::from_pem(&pem)
                        .map_err(|e| CommError::Setup(format!("decoding certificate: {e}")))?,
                )
            },
            None => None,
        };

        let build = |timeout: Option<Duration>| -> Result<reqwest::Client, CommError> {
            let mut builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);
            if let Some(timeout) = timeout {
                builder = builder.timeout(timeout);
            }
            if let Some(cert) = &certificate {
                builder = builder.add_root_certificate(cert.clone());
            }
            builder.build().map_err(|e| CommError::Setup(e.to_string()))
        };

        Ok(Self {
            base_url: format!(
                "{}/api/{AGENT_API_VERSION}",
                api_server.trim_end_matches('/')
            ),
            task_id: task_id.into(),
            task_secret: task_secret.into(),
            host_id: host_id.into(),
            host_secret: host_secret.into(),
            client: build(None)?,
            heartbeat_client: build(Some(HEARTBEAT_TIMEOUT))?,
            retry_config: RetryConfig::default(),
        })
    }

    /// A communicator for a successor task, reusing the clients.
    #[must_use]
    pub fn for_task(&self, task_id: impl Into<String>, task_secret: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            task_secret: task_secret.into(),
            ..self.clone()
        }
    }

    /// The task this communicator is scoped to.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    fn url(&self, op: &str) -> String {
        if op.is_empty() {
            format!("{}/task/{}", self.base_url, self.task_id)
        } else {
            format!("{}/task/{}/{op}", self.base_url, self.task_id)
        }
    }

    fn with_headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header(TASK_SECRET_HEADER, &self.task_secret)
            .header(HOST_ID_HEADER, &self.host_id)
            .header(HOST_SECRET_HEADER, &self.host_secret)
            .header("Content-Type", "application/json")
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, CommError> {
        match response.status().as_u16() {
            200 => response
                .json::<T>()
                .await
                .map_err(|e| CommError::Decode(e.to_string())),
            409 => Err(CommError::Conflict),
            401 => Err(CommError::Unauthorized),
            code => Err(CommError::BadStatus(code)),
        }
    }

    async fn get_once<T: DeserializeOwned>(&self, op: &str) -> Result<T, CommError> {
        let response = self.with_headers(self.client.get(self.url(op))).send().await?;
        Self::decode(response).await
    }

    async fn post_once<B: Serialize, T: DeserializeOwned>(
        &self,
        op: &str,
        body: &B,
    ) -> Result<T, CommError> {
        let response = self
            .with_headers(self.client.post(self.url(op)))
            .json(body)
            .send()
            .await?;
        Self::decode(response).await
    }

    /// GET with the standard retry policy.
    async fn get_retrying<T: DeserializeOwned>(
        &self,
        op: &str,
        cancel: &CancellationToken,
    ) -> Result<T, CommError> {
        retry(self.retry_config, cancel, CommError::classify, || {
            self.get_once(op)
        })
        .await
        .map_err(flatten_retry)
    }

    /// POST with the standard retry policy.
    ///
    /// # Errors
    ///
    /// Returns an error once the retry policy is exhausted or the
    /// classifier declares a failure fatal.
    pub async fn post_retrying<B: Serialize, T: DeserializeOwned>(
        &self,
        op: &str,
        body: &B,
        cancel: &CancellationToken,
    ) -> Result<T, CommError> {
        retry(self.retry_config, cancel, CommError::classify, || {
            self.post_once(op, body)
        })
        .await
        .map_err(flatten_retry)
    }

    /// Fetch the task document.
    ///
    /// # Errors
    ///
    /// Returns an error once the retry policy is exhausted or on a
    /// wrong-secret conflict.
    pub async fn get_task(&self, cancel: &CancellationToken) -> Result<Task, CommError> {
        self.get_retrying("", cancel).await
    }

    /// Fetch the task's distro template.
    ///
    /// # Errors
    ///
    /// See [`Self::get_task`].
    pub async fn get_distro(&self, cancel: &CancellationToken) -> Result<Distro, CommError> {
        self.get_retrying("distro", cancel).await
    }

    /// Fetch the project configuration.
    ///
    /// # Errors
    ///
    /// See [`Self::get_task`].
    pub async fn get_project(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ProjectConfig, CommError> {
        self.get_retrying("project", cancel).await
    }

    /// Fetch project-scoped expansion variables.
    ///
    /// # Errors
    ///
    /// See [`Self::get_task`]; a wrong secret here is a 401.
    pub async fn fetch_vars(&self, cancel: &CancellationToken) -> Result<ExpansionVars, CommError> {
        self.get_retrying("fetch_vars", cancel).await
    }

    /// Report the task started, with the agent's pid.
    ///
    /// # Errors
    ///
    /// See [`Self::get_task`].
    pub async fn start(&self, pid: u32, cancel: &CancellationToken) -> Result<(), CommError> {
        let body = TaskStartRequest { pid };
        let _: serde_json::Value = self.post_retrying("start", &body, cancel).await?;
        Ok(())
    }

    /// Report end-of-task and receive the successor instruction.
    ///
    /// # Errors
    ///
    /// See [`Self::get_task`].
    pub async fn end(
        &self,
        detail: &EndTaskDetail,
        cancel: &CancellationToken,
    ) -> Result<EndTaskResponse, CommError> {
        self.post_retrying("end", detail, cancel).await
    }

    /// Ask the API for the task bound to this host, or the next eligible
    /// one.
    ///
    /// # Errors
    ///
    /// See [`Self::get_task`].
    pub async fn next_task(
        &self,
        cancel: &CancellationToken,
    ) -> Result<NextTaskResponse, CommError> {
        self.post_retrying("next_task", &serde_json::json!("next"), cancel)
            .await
    }

    /// One heartbeat on the dedicated client. No retries here; the
    /// heartbeat loop owns the failure policy. Returns the abort flag.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` on 409, which the agent must treat as fatal.
    pub async fn heartbeat(&self) -> Result<bool, CommError> {
        let response = self
            .with_headers(self.heartbeat_client.post(self.url("heartbeat")))
            .json(&serde_json::json!("heartbeat"))
            .send()
            .await?;
        let beat: HeartbeatResponse = Self::decode(response).await?;
        Ok(beat.abort)
    }

    /// Upload a batch of log messages.
    ///
    /// # Errors
    ///
    /// See [`Self::get_task`].
    pub async fn send_logs(
        &self,
        batch: &LogBatch,
        cancel: &CancellationToken,
    ) -> Result<(), CommError> {
        let _: serde_json::Value = self.post_retrying("log", batch, cancel).await?;
        Ok(())
    }

    /// Attach test results to the task.
    ///
    /// # Errors
    ///
    /// See [`Self::get_task`].
    pub async fn send_test_results(
        &self,
        results: &TestResults,
        cancel: &CancellationToken,
    ) -> Result<(), CommError> {
        let _: serde_json::Value = self.post_retrying("results", results, cancel).await?;
        Ok(())
    }

    /// Best-effort fire-and-forget post used by the metrics collectors.
    pub async fn try_post(&self, op: &str, body: &serde_json::Value) {
        if let Err(err) = self.post_once::<_, serde_json::Value>(op, body).await {
            warn!(op, "metrics post failed: {err}");
        }
    }
}
