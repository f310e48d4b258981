//! `mci admin` - service flags and the site banner.

use anyhow::{bail, Result};
use mci_core::settings::Settings;
use mci_core::storage::Storage;

use super::build_env;
use crate::AdminCommands;

/// Apply one admin command.
pub async fn run(settings: Settings, command: AdminCommands) -> Result<()> {
    let env = build_env(settings);
    let mut flags = env.storage.get_service_flags().await?;

    match command {
        AdminCommands::Banner { message } => {
            if message.is_empty() {
                println!("clearing banner");
            } else {
                println!("setting banner: {message}");
            }
            flags.banner = message;
        },
        AdminCommands::DisableService { name } => {
            set_service_flag(&mut flags, &name, true)?;
            println!("disabled service '{name}'");
        },
        AdminCommands::EnableService { name } => {
            set_service_flag(&mut flags, &name, false)?;
            println!("enabled service '{name}'");
        },
    }

    env.storage.set_service_flags(flags).await?;
    Ok(())
}

fn set_service_flag(
    flags: &mut mci_core::storage::ServiceFlags,
    name: &str,
    disabled: bool,
) -> Result<()> {
    match name {
        "scheduler" => flags.scheduler_disabled = disabled,
        "taskrunner" => flags.taskrunner_disabled = disabled,
        "monitor" => flags.monitor_disabled = disabled,
        "hostinit" => flags.hostinit_disabled = disabled,
        other => bail!(
            "unknown service '{other}' (expected scheduler, taskrunner, monitor or hostinit)"
        ),
    }
    Ok(())
}
