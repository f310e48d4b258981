//! Remote execution over SSH.
//!
//! The monitor runs teardown scripts and the dispatcher starts agents by
//! shelling out to the system `ssh`. Commands inherit the distro's SSH
//! options; every call carries an explicit timeout.

use std::process::Stdio;
use std::time::Duration;

use mci_core::model::{Host, SshOptions};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Connect timeout applied to every ssh invocation.
const SSH_CONNECT_TIMEOUT_SECS: u32 = 10;

/// Error types for remote execution.
#[derive(Debug, thiserror::Error)]
pub enum SshError {
    /// The host has no address to connect to.
    #[error("host {0} has no address")]
    NoAddress(String),

    /// ssh could not be spawned.
    #[error("failed to spawn ssh: {0}")]
    Spawn(#[from] std::io::Error),

    /// The remote command exited nonzero.
    #[error("remote command exited {code:?}: {output}")]
    RemoteFailure {
        /// Exit code, if the process was not signaled.
        code: Option<i32>,
        /// Combined output for diagnosis.
        output: String,
    },

    /// The call exceeded its timeout.
    #[error("ssh to {0} timed out")]
    TimedOut(String),
}

fn base_command(host: &Host, ssh: &SshOptions) -> Result<Command, SshError> {
    if host.host_address.is_empty() {
        return Err(SshError::NoAddress(host.id.clone()));
    }

    let mut cmd = Command::new("ssh");
    cmd.arg("-o")
        .arg("BatchMode=yes")
        .arg("-o")
        .arg(format!("ConnectTimeout={SSH_CONNECT_TIMEOUT_SECS}"));
    for option in &ssh.options {
        cmd.arg("-o").arg(option);
    }
    if let Some(port) = ssh.port {
        cmd.arg("-p").arg(port.to_string());
    }
    if let Some(key_file) = &ssh.key_file {
        cmd.arg("-i").arg(key_file);
    }

    let user = if host.user.is_empty() {
        ssh.user.as_str()
    } else {
        host.user.as_str()
    };
    if user.is_empty() {
        cmd.arg(&host.host_address);
    } else {
        cmd.arg(format!("{user}@{}", host.host_address));
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    Ok(cmd)
}

/// Run a script on the host by piping it to a remote shell. Returns the
/// combined output.
///
/// # Errors
///
/// Returns an error if ssh cannot run, the remote command fails, or the
/// timeout elapses.
pub async fn run_script(
    host: &Host,
    ssh: &SshOptions,
    script: &str,
    timeout: Duration,
) -> Result<String, SshError> {
    let mut cmd = base_command(host, ssh)?;
    cmd.arg("sh -s");

    let run = async {
        let mut child = cmd.spawn()?;
        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(script.as_bytes()).await?;
        }
        drop(child.stdin.take());
        let output = child.wait_with_output().await?;
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if output.status.success() {
            Ok(combined)
        } else {
            Err(SshError::RemoteFailure {
                code: output.status.code(),
                output: combined,
            })
        }
    };

    tokio::time::timeout(timeout, run)
        .await
        .map_err(|_| SshError::TimedOut(host.host_address.clone()))?
}

/// Start a command on the host without waiting for it to finish. Used to
/// launch agents; the ssh session exits once the remote command is
/// backgrounded.
///
/// # Errors
///
/// Returns an error if ssh cannot run, the launch fails, or the timeout
/// elapses.
pub async fn start_detached(
    host: &Host,
    ssh: &SshOptions,
    command_line: &str,
    timeout: Duration,
) -> Result<(), SshError> {
    let mut cmd = base_command(host, ssh)?;
    cmd.arg(format!("nohup {command_line} >/dev/null 2>&1 &"));

    let run = async {
        let output = cmd.output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SshError::RemoteFailure {
                code: output.status.code(),
                output: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    };

    tokio::time::timeout(timeout, run)
        .await
        .map_err(|_| SshError::TimedOut(host.host_address.clone()))?
}

/// Probe the host: `true` when an ssh session can run a trivial command
/// within the timeout.
pub async fn probe(host: &Host, ssh: &SshOptions, timeout: Duration) -> bool {
    let Ok(mut cmd) = base_command(host, ssh) else {
        return false;
    };
    cmd.arg("true");
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output.status.success(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_address_rejected() {
        let host = Host::intent("linux-64", "mock");
        let err = run_script(&host, &SshOptions::default(), "true", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::NoAddress(_)));
    }

    #[tokio::test]
    async fn test_probe_unroutable_address_fails_fast() {
        let mut host = Host::intent("linux-64", "mock");
        host.host_address = "127.0.0.1".to_string();
        let mut ssh = SshOptions::default();
        // an almost-certainly-closed port keeps the probe local and quick
        ssh.port = Some(1);
        assert!(!probe(&host, &ssh, Duration::from_secs(2)).await);
    }
}
