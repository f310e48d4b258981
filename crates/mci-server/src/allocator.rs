//! Host allocator.
//!
//! Consumes the scheduler's desired-new-hosts counts. For every new host
//! an intent record is written before the cloud call so crash recovery
//! can reconcile; on success the intent is replaced by the confirmed
//! record, on failure it is deleted. A second step provisions confirmed
//! hosts by running the distro's setup script.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mci_core::cloud::CloudManager;
use mci_core::model::{Distro, Host, HostStatus};
use mci_core::storage::{HostQuery, Storage};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::env::Env;
use crate::ssh;

/// Timeout for one setup-script run.
const SETUP_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// The allocator component.
pub struct Allocator {
    env: Env,
}

impl Allocator {
    /// Create an allocator over the environment.
    #[must_use]
    pub fn new(env: Env) -> Self {
        Self { env }
    }

    /// Spawn the requested number of hosts per distro. Returns one error
    /// string per host that could not be spawned.
    pub async fn allocate(&self, requests: &HashMap<String, usize>) -> Vec<String> {
        let semaphore = Arc::new(Semaphore::new(
            self.env.settings.hostinit.provision_concurrency.max(1),
        ));
        let mut join_set = JoinSet::new();

        for (distro_id, count) in requests {
            if *count == 0 {
                continue;
            }
            let distro = match self.env.storage.get_distro(distro_id).await {
                Ok(Some(distro)) => distro,
                Ok(None) => {
                    warn!(distro_id = %distro_id, "allocation requested for unknown distro");
                    continue;
                },
                Err(err) => {
                    return vec![format!("loading distro {distro_id}: {err}")];
                },
            };
            info!(distro_id = %distro_id, count, "spawning hosts");

            for _ in 0..*count {
                let env = self.env.clone();
                let distro = distro.clone();
                let semaphore = Arc::clone(&semaphore);
                join_set.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok()?;
                    spawn_one(&env, &distro).await.err()
                });
            }
        }

        let mut errors = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Some(err)) => errors.push(err),
                Ok(None) => {},
                Err(join_err) => errors.push(format!("spawn worker panicked: {join_err}")),
            }
        }
        errors
    }

    /// Run the setup script on every confirmed-but-unprovisioned host and
    /// mark it ready. A failed setup marks the host `provision failed` so
    /// the monitor replaces it.
    pub async fn provision_ready_hosts(&self) -> Vec<String> {
        let pending = match self
            .env
            .storage
            .find_hosts(&HostQuery {
                statuses: Some(vec![HostStatus::Provisioning]),
                ..HostQuery::default()
            })
            .await
        {
            Ok(hosts) => hosts,
            Err(err) => return vec![format!("finding provisioning hosts: {err}")],
        };

        let mut errors = Vec::new();
        for host in pending {
            if let Err(err) = self.provision_host(&host).await {
                errors.push(format!("provisioning host {}: {err}", host.id));
            }
        }
        errors
    }

    async fn provision_host(&self, host: &Host) -> Result<(), String> {
        let distro = self
            .env
            .storage
            .get_distro(&host.distro_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("unknown distro {}", host.distro_id))?;

        if !distro.setup_script.is_empty() {
            if let Err(err) =
                ssh::run_script(host, &distro.ssh, &distro.setup_script, SETUP_TIMEOUT).await
            {
                warn!(host_id = %host.id, "setup script failed: {err}");
                self.env
                    .storage
                    .set_host_status(&host.id, HostStatus::ProvisionFailed)
                    .await
                    .map_err(|e| e.to_string())?;
                return Err(format!("setup script: {err}"));
            }
        }

        self.env
            .storage
            .set_host_provisioned(&host.id)
            .await
            .map_err(|e| e.to_string())?;
        info!(host_id = %host.id, "host provisioned");
        Ok(())
    }
}

/// Create the intent record, make the cloud call, and confirm or clean up.
async fn spawn_one(env: &Env, distro: &Distro) -> Result<(), String> {
    let manager = env
        .cloud
        .manager_for(&distro.provider)
        .map_err(|e| e.to_string())?;

    let intent = Host::intent(&distro.id, &distro.provider);
    let intent_id = intent.id.clone();
    env.storage
        .insert_host(intent.clone())
        .await
        .map_err(|e| e.to_string())?;

    match manager.spawn(distro).await {
        Ok(spawned) => {
            env.storage
                .delete_host(&intent_id)
                .await
                .map_err(|e| e.to_string())?;
            let mut confirmed = intent;
            confirmed.id = spawned.id;
            confirmed.host_address = spawned.dns;
            confirmed.user = distro.ssh.user.clone();
            confirmed.status = HostStatus::Provisioning;
            env.storage
                .insert_host(confirmed)
                .await
                .map_err(|e| e.to_string())?;
            Ok(())
        },
        Err(spawn_err) => {
            // remove the intent so capacity math does not count a ghost
            if let Err(del_err) = env.storage.delete_host(&intent_id).await {
                warn!(host_id = %intent_id, "deleting failed intent host: {del_err}");
            }
            Err(format!("spawning host for {}: {spawn_err}", distro.id))
        },
    }
}
