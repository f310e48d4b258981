//! Cloud manager interface.
//!
//! A uniform capability over heterogeneous providers. Implementations are
//! opaque to the control plane: the monitor, allocator and dispatcher only
//! ever see this trait.

mod mock;
mod static_provider;

pub use mock::MockProvider;
pub use static_provider::StaticProvider;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{Distro, Host, SshOptions, PROVIDER_STATIC};

/// Provider name for the deterministic in-process provider.
pub const PROVIDER_MOCK: &str = "mock";

/// Provider-reported instance status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudStatus {
    /// Instance is booting.
    Initializing,

    /// Instance is up.
    Running,

    /// Instance exists but is not running.
    Stopped,

    /// Instance is gone.
    Terminated,

    /// The provider could not say.
    Unknown,
}

impl std::fmt::Display for CloudStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Terminated => write!(f, "terminated"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Identity assigned by a provider on spawn.
#[derive(Debug, Clone)]
pub struct SpawnedHost {
    /// Provider-assigned instance id.
    pub id: String,

    /// Network address, may be empty until DNS resolves.
    pub dns: String,
}

/// Error types for cloud operations.
#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    /// The provider does not know the instance.
    #[error("instance not found: {0}")]
    NotFound(String),

    /// The provider rejected or failed the call.
    #[error("provider error: {0}")]
    Provider(String),

    /// The named provider is not configured.
    #[error("no cloud manager for provider '{0}'")]
    UnknownProvider(String),
}

/// A uniform capability for one provider.
#[async_trait]
pub trait CloudManager: Send + Sync {
    /// Spawn an instance from a distro template.
    async fn spawn(&self, distro: &Distro) -> Result<SpawnedHost, CloudError>;

    /// The provider's view of the instance.
    async fn status(&self, host: &Host) -> Result<CloudStatus, CloudError>;

    /// Terminate the instance.
    async fn terminate(&self, host: &Host) -> Result<(), CloudError>;

    /// Probe the host over SSH.
    async fn is_ssh_reachable(&self, host: &Host, ssh: &SshOptions) -> Result<bool, CloudError>;

    /// Resolve the host's network address.
    async fn get_dns(&self, host: &Host) -> Result<String, CloudError>;

    /// Cost of running the host for a window, for providers that can
    /// compute it.
    fn cost_for(&self, _host: &Host, _start: DateTime<Utc>, _end: DateTime<Utc>) -> Option<f64> {
        None
    }
}

/// Registry of configured cloud managers, keyed by provider name.
#[derive(Clone)]
pub struct CloudRegistry {
    managers: HashMap<String, Arc<dyn CloudManager>>,
}

impl CloudRegistry {
    /// Build a registry with the built-in providers.
    #[must_use]
    pub fn new() -> Self {
        let mut managers: HashMap<String, Arc<dyn CloudManager>> = HashMap::new();
        managers.insert(
            PROVIDER_STATIC.to_string(),
            Arc::new(StaticProvider::new()) as Arc<dyn CloudManager>,
        );
        managers.insert(
            PROVIDER_MOCK.to_string(),
            Arc::new(MockProvider::new()) as Arc<dyn CloudManager>,
        );
        Self { managers }
    }

    /// Register (or replace) a provider.
    pub fn register(&mut self, name: impl Into<String>, manager: Arc<dyn CloudManager>) {
        self.managers.insert(name.into(), manager);
    }

    /// Look up the manager for a provider name.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::UnknownProvider`] for an unconfigured name.
    pub fn manager_for(&self, provider: &str) -> Result<Arc<dyn CloudManager>, CloudError> {
        self.managers
            .get(provider)
            .cloned()
            .ok_or_else(|| CloudError::UnknownProvider(provider.to_string()))
    }
}

impl Default for CloudRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_knows_builtins() {
        let registry = CloudRegistry::new();
        assert!(registry.manager_for(PROVIDER_STATIC).is_ok());
        assert!(registry.manager_for(PROVIDER_MOCK).is_ok());
        assert!(matches!(
            registry.manager_for("ec2"),
            Err(CloudError::UnknownProvider(_))
        ));
    }
}
