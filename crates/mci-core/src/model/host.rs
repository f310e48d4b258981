//! Host entity and status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider name for user-owned machines with no cloud lifecycle.
pub const PROVIDER_STATIC: &str = "static";

/// Host statuses considered "up" for capacity math, in both the
/// scheduler's host-need estimation and the monitor's excess flagger.
pub const UP_HOST_STATUSES: [HostStatus; 4] = [
    HostStatus::Uninitialized,
    HostStatus::Provisioning,
    HostStatus::ProvisionFailed,
    HostStatus::Running,
];

/// Host status machine.
///
/// `Terminated` is terminal; a host never transitions back out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    /// Intent record created; cloud call not yet confirmed.
    Uninitialized,

    /// Instance up; setup script still running.
    Provisioning,

    /// Setup failed; the host will be replaced.
    ProvisionFailed,

    /// Ready to take tasks.
    Running,

    /// SSH probe failed on the last reachability check.
    Unreachable,

    /// Pulled from rotation by an operator; tasks drain but none start.
    Quarantined,

    /// Marked for termination by policy or an operator.
    Decommissioned,

    /// Instance terminated. Terminal.
    Terminated,
}

impl HostStatus {
    /// Returns `true` if the status counts toward capacity.
    #[must_use]
    pub fn is_up(self) -> bool {
        UP_HOST_STATUSES.contains(&self)
    }
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "starting"),
            Self::Provisioning => write!(f, "provisioning"),
            Self::ProvisionFailed => write!(f, "provision failed"),
            Self::Running => write!(f, "running"),
            Self::Unreachable => write!(f, "unreachable"),
            Self::Quarantined => write!(f, "quarantined"),
            Self::Decommissioned => write!(f, "decommissioned"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// A worker machine, provisioned from a distro template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    /// Unique identifier. For intent hosts this is generated locally and
    /// replaced by the provider-assigned id once the cloud call returns.
    pub id: String,

    /// Cloud provider name, or [`PROVIDER_STATIC`].
    pub provider: String,

    /// Distro this host was built from.
    pub distro_id: String,

    /// Network address for SSH and the agent.
    #[serde(default)]
    pub host_address: String,

    /// Login user for SSH.
    #[serde(default)]
    pub user: String,

    /// Current status.
    pub status: HostStatus,

    /// Id of the task currently bound to this host, if any. Mutated only
    /// through the storage layer's compare-and-swap.
    #[serde(default)]
    pub running_task: Option<String>,

    /// Last task that completed on this host.
    #[serde(default)]
    pub last_task_completed: Option<String>,

    /// When the host last went free, for idle accounting.
    #[serde(default)]
    pub last_task_completed_time: Option<DateTime<Utc>>,

    /// Revision of the agent binary deployed to the host.
    #[serde(default)]
    pub agent_revision: String,

    /// Pid of the agent process, recorded at task start.
    #[serde(default)]
    pub agent_pid: Option<u32>,

    /// Opaque token the agent presents in `Host-Secret`.
    pub secret: String,

    /// Whether the setup script has completed.
    #[serde(default)]
    pub provisioned: bool,

    /// When the host record was created.
    pub creation_time: DateTime<Utc>,

    /// When the host was last touched by a reachability check.
    #[serde(default)]
    pub last_monitored: Option<DateTime<Utc>>,

    /// When the host was first found unreachable; cleared when a check
    /// succeeds again.
    #[serde(default)]
    pub unreachable_since: Option<DateTime<Utc>>,

    /// When the host last communicated with the API.
    #[serde(default)]
    pub last_communicated: Option<DateTime<Utc>>,

    /// Explicit expiration, after which the host is flagged.
    #[serde(default)]
    pub expiration_time: Option<DateTime<Utc>>,

    /// When the host reached `Terminated`.
    #[serde(default)]
    pub termination_time: Option<DateTime<Utc>>,
}

impl Host {
    /// Create a new intent host for a distro.
    #[must_use]
    pub fn intent(distro_id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: format!("mci-{}", uuid::Uuid::new_v4()),
            provider: provider.into(),
            distro_id: distro_id.into(),
            host_address: String::new(),
            user: String::new(),
            status: HostStatus::Uninitialized,
            running_task: None,
            last_task_completed: None,
            last_task_completed_time: None,
            agent_revision: String::new(),
            agent_pid: None,
            secret: super::new_secret(),
            provisioned: false,
            creation_time: Utc::now(),
            last_monitored: None,
            unreachable_since: None,
            last_communicated: None,
            expiration_time: None,
            termination_time: None,
        }
    }

    /// Returns `true` if the host can take a task right now.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.status == HostStatus::Running && self.running_task.is_none()
    }

    /// Returns `true` for hosts whose lifecycle MCI does not manage.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.provider == PROVIDER_STATIC
    }
}
