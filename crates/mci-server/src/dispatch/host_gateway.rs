//! Starting remote agents.
//!
//! After a dispatch is recorded, the gateway launches the agent binary on
//! the host over SSH with the task and host credentials as flags. The
//! gateway is a trait so tests and single-host deployments can skip the
//! remote start.

use std::time::Duration;

use async_trait::async_trait;
use mci_core::model::{Distro, Host, Task};

use crate::ssh;

/// Timeout for the remote agent launch.
const START_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Revision string recorded for agents this build deploys.
pub const AGENT_REVISION: &str = env!("CARGO_PKG_VERSION");

/// Error types for agent startup.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The remote launch failed.
    #[error("starting agent on {host_id}: {message}")]
    StartFailed {
        /// Target host.
        host_id: String,
        /// What went wrong.
        message: String,
    },
}

/// Capability to start an agent for a dispatched task.
#[async_trait]
pub trait HostGateway: Send + Sync {
    /// Launch the agent on `host` for `task`. Returns the revision of the
    /// agent binary that was started.
    async fn start_agent(
        &self,
        host: &Host,
        distro: &Distro,
        task: &Task,
        api_url: &str,
    ) -> Result<String, GatewayError>;
}

/// Gateway that launches agents over SSH.
pub struct SshHostGateway {
    /// Path of the agent binary on worker hosts.
    pub agent_path: String,
}

impl SshHostGateway {
    /// Create a gateway launching the binary at `agent_path`.
    #[must_use]
    pub fn new(agent_path: impl Into<String>) -> Self {
        Self {
            agent_path: agent_path.into(),
        }
    }
}

#[async_trait]
impl HostGateway for SshHostGateway {
    async fn start_agent(
        &self,
        host: &Host,
        distro: &Distro,
        task: &Task,
        api_url: &str,
    ) -> Result<String, GatewayError> {
        let command_line = format!(
            "{} agent --task_id {} --task_secret {} --host_id {} --host_secret {} \
             --api_server {} --working_dir {} --pid_file {}/agent.pid",
            self.agent_path,
            task.id,
            task.secret,
            host.id,
            host.secret,
            api_url,
            distro.work_dir,
            distro.work_dir,
        );

        ssh::start_detached(host, &distro.ssh, &command_line, START_TIMEOUT)
            .await
            .map_err(|err| GatewayError::StartFailed {
                host_id: host.id.clone(),
                message: err.to_string(),
            })?;
        Ok(AGENT_REVISION.to_string())
    }
}

/// Gateway that records the dispatch without starting anything. Used in
/// tests and in deployments where agents poll `next_task` on their own.
#[derive(Default)]
pub struct NoopHostGateway;

#[async_trait]
impl HostGateway for NoopHostGateway {
    async fn start_agent(
        &self,
        _host: &Host,
        _distro: &Distro,
        _task: &Task,
        _api_url: &str,
    ) -> Result<String, GatewayError> {
        Ok(AGENT_REVISION.to_string())
    }
}

/// Gateway that always fails, for exercising the dispatch revert path.
#[cfg(test)]
pub struct FailingHostGateway;

#[cfg(test)]
#[async_trait]
impl HostGateway for FailingHostGateway {
    async fn start_agent(
        &self,
        host: &Host,
        _distro: &Distro,
        _task: &Task,
        _api_url: &str,
    ) -> Result<String, GatewayError> {
        Err(GatewayError::StartFailed {
            host_id: host.id.clone(),
            message: "scripted failure".to_string(),
        })
    }
}
