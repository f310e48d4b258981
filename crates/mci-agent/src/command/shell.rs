//! The shell plugin: arbitrary script execution on the worker.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use mci_core::expansion::Expansions;
use mci_core::logmsg::{LogChannel, LogSeverity};
use nix::sys::signal::{kill, Signal as NixSignal};
use nix::unistd::Pid;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command as ProcessCommand};

use super::{Command, CommandError, ExecContext, TaskConfig};
use crate::cleanup::marker_env;
use crate::logger::TaskLogger;

/// Grace between SIGTERM and SIGKILL when stopping a canceled script.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
struct ShellExecParams {
    /// The shell code to run.
    script: String,

    /// Hide the script and its output from the task logs.
    #[serde(default)]
    silent: bool,

    /// Shell to execute with; defaults to `sh`.
    #[serde(default)]
    shell: String,

    /// Launch and return immediately instead of waiting.
    #[serde(default)]
    background: bool,

    /// Working directory relative to the task's work dir.
    #[serde(default)]
    working_dir: String,

    /// Send output to the system log channel instead of the task logs.
    #[serde(default)]
    system_log: bool,

    /// A nonzero exit does not fail the pipeline.
    #[serde(default)]
    continue_on_err: bool,

    /// Per-command deadline in seconds.
    #[serde(default)]
    timeout_secs: Option<u64>,
}

/// `shell.exec`: run a script under a configured shell.
pub struct ShellExecCommand {
    params: ShellExecParams,
}

impl ShellExecCommand {
    /// Decode and validate parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if required fields are missing or mistyped.
    pub fn parse(params: &serde_json::Value) -> Result<Box<dyn Command>, CommandError> {
        let params: ShellExecParams = serde_json::from_value(params.clone()).map_err(|e| {
            CommandError::InvalidParams {
                command: "shell.exec".to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(Box::new(Self { params }))
    }

    fn shell(&self) -> &str {
        if self.params.shell.is_empty() {
            "sh"
        } else {
            &self.params.shell
        }
    }
}

#[async_trait]
impl Command for ShellExecCommand {
    fn name(&self) -> &'static str {
        "exec"
    }

    fn plugin(&self) -> &'static str {
        "shell"
    }

    fn expand(&mut self, expansions: &Expansions) -> Result<(), CommandError> {
        self.params.script = expansions.expand(&self.params.script)?;
        self.params.working_dir = expansions.expand(&self.params.working_dir)?;
        Ok(())
    }

    fn continue_on_err(&self) -> bool {
        self.params.continue_on_err
    }

    fn timeout(&self) -> Option<Duration> {
        self.params.timeout_secs.map(Duration::from_secs)
    }

    async fn execute(
        &self,
        ctx: &ExecContext,
        config: &mut TaskConfig,
    ) -> Result<(), CommandError> {
        let cwd = if self.params.working_dir.is_empty() {
            config.work_dir.clone()
        } else {
            config.work_dir.join(&self.params.working_dir)
        };
        tokio::fs::create_dir_all(&cwd).await?;

        if self.params.silent {
            ctx.logger
                .execution(format!("Executing script with {} (source hidden)", self.shell()));
        } else {
            ctx.logger.execution(format!(
                "Executing script with {}: {}",
                self.shell(),
                self.params.script
            ));
        }

        let mut cmd = ProcessCommand::new(self.shell());
        cmd.arg("-s")
            .current_dir(&cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(!self.params.background);
        for (key, value) in marker_env(&config.task.id) {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| CommandError::Failed(format!("could not spawn shell: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(self.params.script.as_bytes())
                .await
                .map_err(|e| CommandError::Failed(format!("writing script: {e}")))?;
            drop(stdin);
        }
        let pid = child.id();
        ctx.logger
            .system(format!("spawned shell process with pid {pid:?}"));

        let out_channel = if self.params.system_log {
            LogChannel::System
        } else {
            LogChannel::Task
        };
        let silent = self.params.silent;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_handle = stdout.map(|stream| {
            forward_lines(stream, ctx.logger.clone(), out_channel, LogSeverity::Info, silent)
        });
        let err_handle = stderr.map(|stream| {
            forward_lines(stream, ctx.logger.clone(), out_channel, LogSeverity::Error, silent)
        });

        if self.params.background {
            ctx.logger.execution("running command in the background");
            return Ok(());
        }

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            () = ctx.cancel.cancelled() => None,
        };
        let Some(status) = waited else {
            ctx.logger.execution("got kill signal; stopping process");
            stop_child(&mut child, pid, &ctx.logger).await;
            return Err(CommandError::Interrupted);
        };
        let status =
            status.map_err(|e| CommandError::Failed(format!("waiting on shell: {e}")))?;

        if let Some(handle) = out_handle {
            let _ = handle.await;
        }
        if let Some(handle) = err_handle {
            let _ = handle.await;
        }

        if status.success() {
            ctx.logger.execution("Script execution complete.");
            Ok(())
        } else {
            Err(CommandError::Failed(format!(
                "script finished with {status}"
            )))
        }
    }
}

/// Forward each line of a child stream into the task logs.
fn forward_lines<R>(
    stream: R,
    logger: TaskLogger,
    channel: LogChannel,
    severity: LogSeverity,
    silent: bool,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !silent {
                logger.log(channel, severity, line);
            }
        }
    })
}

/// SIGTERM, grace, then SIGKILL for a canceled script.
async fn stop_child(child: &mut Child, pid: Option<u32>, logger: &TaskLogger) {
    if let Some(pid) = pid {
        #[allow(clippy::cast_possible_wrap)]
        let raw = Pid::from_raw(pid as i32);
        if kill(raw, NixSignal::SIGTERM).is_ok() {
            if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_ok() {
                logger.system(format!("shell process {pid} terminated"));
                return;
            }
        }
    }
    if let Err(err) = child.kill().await {
        logger.system(format!("could not kill shell process: {err}"));
    }
}

/// `shell.cleanup`: deprecated no-op kept for old project files.
pub struct ShellCleanupCommand;

impl ShellCleanupCommand {
    /// Accepts and ignores any parameters.
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn parse(_params: &serde_json::Value) -> Result<Box<dyn Command>, CommandError> {
        Ok(Box::new(Self))
    }
}

#[async_trait]
impl Command for ShellCleanupCommand {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    fn plugin(&self) -> &'static str {
        "shell"
    }

    async fn execute(
        &self,
        ctx: &ExecContext,
        _config: &mut TaskConfig,
    ) -> Result<(), CommandError> {
        ctx.logger
            .execution("shell.cleanup is deprecated; process cleanup is always on");
        Ok(())
    }
}

/// `shell.track`: deprecated no-op kept for old project files.
pub struct ShellTrackCommand;

impl ShellTrackCommand {
    /// Accepts and ignores any parameters.
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn parse(_params: &serde_json::Value) -> Result<Box<dyn Command>, CommandError> {
        Ok(Box::new(Self))
    }
}

#[async_trait]
impl Command for ShellTrackCommand {
    fn name(&self) -> &'static str {
        "track"
    }

    fn plugin(&self) -> &'static str {
        "shell"
    }

    async fn execute(
        &self,
        ctx: &ExecContext,
        _config: &mut TaskConfig,
    ) -> Result<(), CommandError> {
        ctx.logger
            .execution("shell.track is deprecated; process tracking is always on");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_requires_script() {
        assert!(ShellExecCommand::parse(&json!({})).is_err());
        assert!(ShellExecCommand::parse(&json!({"script": "true"})).is_ok());
    }

    #[test]
    fn test_expand_script_and_working_dir() {
        let mut expansions = Expansions::new();
        expansions.put("target", "release");

        let boxed = ShellExecCommand::parse(&json!({
            "script": "make ${target}",
            "working_dir": "build/${target}",
        }))
        .unwrap();
        let mut cmd = boxed;
        cmd.expand(&expansions).unwrap();
        // behavior checked end-to-end in the pipeline tests; here we only
        // confirm expansion does not error on defined tokens
    }

    #[test]
    fn test_timeout_and_continue_flags_surface() {
        let cmd = ShellExecCommand::parse(&json!({
            "script": "true",
            "continue_on_err": true,
            "timeout_secs": 30,
        }))
        .unwrap();
        assert!(cmd.continue_on_err());
        assert_eq!(cmd.timeout(), Some(Duration::from_secs(30)));
    }
}
