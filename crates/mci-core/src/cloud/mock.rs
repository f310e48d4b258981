//! Deterministic in-process provider for tests and local development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{CloudError, CloudManager, CloudStatus, SpawnedHost};
use crate::model::{Distro, Host, SshOptions};

#[derive(Debug, Clone)]
struct MockInstance {
    status: CloudStatus,
    reachable: bool,
}

/// In-process [`CloudManager`] with scriptable failures.
pub struct MockProvider {
    instances: Mutex<HashMap<String, MockInstance>>,
    spawn_counter: AtomicU64,
    fail_spawns: AtomicU64,
    /// Per-hour cost attributed to mock hosts, or `None` to report no cost.
    hourly_cost: Option<f64>,
}

impl MockProvider {
    /// Create a provider with no cost model.
    #[must_use]
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            spawn_counter: AtomicU64::new(0),
            fail_spawns: AtomicU64::new(0),
            hourly_cost: None,
        }
    }

    /// Create a provider that reports the given hourly cost.
    #[must_use]
    pub fn with_hourly_cost(cost: f64) -> Self {
        Self {
            hourly_cost: Some(cost),
            ..Self::new()
        }
    }

    /// Make the next `count` spawn calls fail.
    pub fn fail_next_spawns(&self, count: u64) {
        self.fail_spawns.store(count, Ordering::SeqCst);
    }

    /// Override the status of a known instance.
    pub fn set_status(&self, instance_id: &str, status: CloudStatus) {
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(instance) = instances.get_mut(instance_id) {
            instance.status = status;
        }
    }

    /// Override the SSH reachability of a known instance.
    pub fn set_reachable(&self, instance_id: &str, reachable: bool) {
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(instance) = instances.get_mut(instance_id) {
            instance.reachable = reachable;
        }
    }

    /// Number of spawn calls that succeeded.
    #[must_use]
    pub fn spawned_count(&self) -> u64 {
        self.spawn_counter.load(Ordering::SeqCst)
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudManager for MockProvider {
    async fn spawn(&self, distro: &Distro) -> Result<SpawnedHost, CloudError> {
        let remaining = self.fail_spawns.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_spawns.store(remaining - 1, Ordering::SeqCst);
            return Err(CloudError::Provider(format!(
                "scripted spawn failure for distro {}",
                distro.id
            )));
        }

        let n = self.spawn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("mock-{}-{n}", distro.id);
        let dns = format!("{id}.mock.local");
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        instances.insert(
            id.clone(),
            MockInstance {
                status: CloudStatus::Running,
                reachable: true,
            },
        );
        Ok(SpawnedHost { id, dns })
    }

    async fn status(&self, host: &Host) -> Result<CloudStatus, CloudError> {
        let instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        instances
            .get(&host.id)
            .map(|instance| instance.status)
            .ok_or_else(|| CloudError::NotFound(host.id.clone()))
    }

    async fn terminate(&self, host: &Host) -> Result<(), CloudError> {
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        match instances.get_mut(&host.id) {
            Some(instance) => {
                instance.status = CloudStatus::Terminated;
                Ok(())
            },
            None => Err(CloudError::NotFound(host.id.clone())),
        }
    }

    async fn is_ssh_reachable(&self, host: &Host, _ssh: &SshOptions) -> Result<bool, CloudError> {
        let instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        Ok(instances
            .get(&host.id)
            .map(|instance| instance.reachable && instance.status == CloudStatus::Running)
            .unwrap_or(false))
    }

    async fn get_dns(&self, host: &Host) -> Result<String, CloudError> {
        Ok(format!("{}.mock.local", host.id))
    }

    fn cost_for(&self, _host: &Host, start: DateTime<Utc>, end: DateTime<Utc>) -> Option<f64> {
        let hourly = self.hourly_cost?;
        let secs = (end - start).num_seconds().max(0) as f64;
        Some(hourly * secs / 3600.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::PROVIDER_MOCK;

    #[tokio::test]
    async fn test_spawn_then_terminate() {
        let provider = MockProvider::new();
        let distro = Distro::new("linux-64", PROVIDER_MOCK, 4);

        let spawned = provider.spawn(&distro).await.unwrap();
        assert!(spawned.id.starts_with("mock-linux-64-"));

        let mut host = Host::intent("linux-64", PROVIDER_MOCK);
        host.id = spawned.id.clone();
        assert_eq!(provider.status(&host).await.unwrap(), CloudStatus::Running);

        provider.terminate(&host).await.unwrap();
        assert_eq!(
            provider.status(&host).await.unwrap(),
            CloudStatus::Terminated
        );
    }

    #[tokio::test]
    async fn test_scripted_spawn_failures() {
        let provider = MockProvider::new();
        provider.fail_next_spawns(1);
        let distro = Distro::new("linux-64", PROVIDER_MOCK, 4);

        assert!(provider.spawn(&distro).await.is_err());
        assert!(provider.spawn(&distro).await.is_ok());
        assert_eq!(provider.spawned_count(), 1);
    }

    #[tokio::test]
    async fn test_cost_model() {
        let provider = MockProvider::with_hourly_cost(0.50);
        let host = Host::intent("linux-64", PROVIDER_MOCK);
        let start = Utc::now();
        let end = start + chrono::Duration::hours(2);
        let cost = provider.cost_for(&host, start, end).unwrap();
        assert!((cost - 1.0).abs() < f64::EPSILON);
    }
}
