//! `mci host` - host lifecycle operations.

use anyhow::{bail, Context, Result};
use mci_core::cloud::CloudManager;
use mci_core::model::{Host, HostStatus};
use mci_core::settings::Settings;
use mci_core::storage::{HostQuery, Storage};

use super::build_env;
use crate::HostCommands;

/// Apply one host command.
pub async fn run(settings: Settings, command: HostCommands) -> Result<()> {
    let env = build_env(settings);

    match command {
        HostCommands::Create { distro } => {
            let Some(distro) = env.storage.get_distro(&distro).await? else {
                bail!("unknown distro '{distro}'");
            };
            let manager = env
                .cloud
                .manager_for(&distro.provider)
                .context("loading cloud manager")?;
            let spawned = manager.spawn(&distro).await.context("spawning host")?;

            let mut host = Host::intent(&distro.id, &distro.provider);
            host.id = spawned.id;
            host.host_address = spawned.dns;
            host.user = distro.ssh.user.clone();
            host.status = HostStatus::Provisioning;
            env.storage.insert_host(host.clone()).await?;
            println!("created host {} ({})", host.id, host.host_address);
        },
        HostCommands::List => {
            let hosts = env.storage.find_hosts(&HostQuery::default()).await?;
            if hosts.is_empty() {
                println!("no hosts");
            }
            for host in hosts {
                println!(
                    "{}\t{}\t{}\t{}\trunning_task={}",
                    host.id,
                    host.distro_id,
                    host.status,
                    host.host_address,
                    host.running_task.as_deref().unwrap_or("-"),
                );
            }
        },
        HostCommands::Terminate { host_id } => {
            let Some(host) = env.storage.get_host(&host_id).await? else {
                bail!("unknown host '{host_id}'");
            };
            if !host.is_static() {
                let manager = env
                    .cloud
                    .manager_for(&host.provider)
                    .context("loading cloud manager")?;
                manager.terminate(&host).await.context("terminating host")?;
            }
            env.storage.mark_host_terminated(&host.id).await?;
            println!("terminated host {host_id}");
        },
        HostCommands::Status { host_id } => {
            let Some(host) = env.storage.get_host(&host_id).await? else {
                bail!("unknown host '{host_id}'");
            };
            println!("id:            {}", host.id);
            println!("distro:        {}", host.distro_id);
            println!("provider:      {}", host.provider);
            println!("status:        {}", host.status);
            println!("address:       {}", host.host_address);
            println!(
                "running task:  {}",
                host.running_task.as_deref().unwrap_or("-")
            );
            println!("provisioned:   {}", host.provisioned);
            println!("created:       {}", host.creation_time.to_rfc3339());
        },
    }
    Ok(())
}
