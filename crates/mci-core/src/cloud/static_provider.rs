//! Provider for user-owned machines with no cloud lifecycle.

use async_trait::async_trait;

use super::{CloudError, CloudManager, CloudStatus, SpawnedHost};
use crate::model::{Distro, Host, SshOptions};

/// Static hosts are registered by operators and never spawned or
/// terminated by the control plane; lifecycle calls reflect that.
pub struct StaticProvider {
    _priv: (),
}

impl StaticProvider {
    /// Create the provider.
    #[must_use]
    pub const fn new() -> Self {
        Self { _priv: () }
    }
}

impl Default for StaticProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudManager for StaticProvider {
    async fn spawn(&self, distro: &Distro) -> Result<SpawnedHost, CloudError> {
        Err(CloudError::Provider(format!(
            "cannot spawn static hosts (distro {})",
            distro.id
        )))
    }

    async fn status(&self, _host: &Host) -> Result<CloudStatus, CloudError> {
        Ok(CloudStatus::Running)
    }

    async fn terminate(&self, host: &Host) -> Result<(), CloudError> {
        Err(CloudError::Provider(format!(
            "cannot terminate static host {}",
            host.id
        )))
    }

    async fn is_ssh_reachable(&self, host: &Host, _ssh: &SshOptions) -> Result<bool, CloudError> {
        // reachability of statics is judged by the monitor's own probe;
        // the provider has no better information than the address itself
        Ok(!host.host_address.is_empty())
    }

    async fn get_dns(&self, host: &Host) -> Result<String, CloudError> {
        Ok(host.host_address.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PROVIDER_STATIC;

    #[tokio::test]
    async fn test_static_lifecycle_refused() {
        let provider = StaticProvider::new();
        let distro = Distro::new("linux-64", PROVIDER_STATIC, 4);
        assert!(provider.spawn(&distro).await.is_err());

        let mut host = Host::intent("linux-64", PROVIDER_STATIC);
        host.host_address = "10.0.0.1".to_string();
        assert!(provider.terminate(&host).await.is_err());
        assert_eq!(provider.status(&host).await.unwrap(), CloudStatus::Running);
        assert_eq!(provider.get_dns(&host).await.unwrap(), "10.0.0.1");
    }
}
