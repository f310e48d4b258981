//! Command runtime.
//!
//! A task's project defines an ordered list of command descriptors. The
//! runtime builds each into a typed command (validation happens at
//! construction), substitutes expansions into the fields that declare
//! them, and executes the list sequentially. A failure terminates the
//! pipeline unless the command opts into `continue_on_err`; a per-command
//! deadline is enforced when set.

mod expansions_cmd;
mod shell;

pub use expansions_cmd::{ExpansionsFetchVarsCommand, ExpansionsUpdateCommand};
pub use shell::{ShellCleanupCommand, ShellExecCommand, ShellTrackCommand};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mci_core::expansion::{ExpansionError, Expansions};
use mci_core::model::{CommandDescriptor, Distro, ProjectConfig, Task};
use tokio_util::sync::CancellationToken;

use crate::comm::HttpCommunicator;
use crate::dump::SharedState;
use crate::logger::TaskLogger;

/// Error types for command construction and execution.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The descriptor names no registered command.
    #[error("no such command: {0}")]
    UnknownCommand(String),

    /// The parameter map did not decode against the command's schema.
    #[error("invalid parameters for {command}: {message}")]
    InvalidParams {
        /// The command identifier.
        command: String,
        /// Decode failure detail.
        message: String,
    },

    /// An expandable field had an unresolved or cyclic token.
    #[error(transparent)]
    Expansion(#[from] ExpansionError),

    /// The command ran and failed.
    #[error("{0}")]
    Failed(String),

    /// The command exceeded its deadline.
    #[error("command timed out after {0:?}")]
    TimedOut(Duration),

    /// Cancellation reached the command mid-run.
    #[error("command interrupted")]
    Interrupted,

    /// Host-level I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a command may read or mutate about the running task.
pub struct TaskConfig {
    /// The task document.
    pub task: Task,

    /// The distro the host was built from.
    pub distro: Distro,

    /// The project configuration.
    pub project: ProjectConfig,

    /// The live expansion map; commands may update it.
    pub expansions: Expansions,

    /// Root working directory for the task.
    pub work_dir: PathBuf,
}

/// Execution facilities shared by all commands in a pipeline.
pub struct ExecContext {
    /// Cancellation for the whole task.
    pub cancel: CancellationToken,

    /// Task-scoped logger.
    pub logger: TaskLogger,

    /// API client for commands that talk to the server.
    pub comm: Arc<HttpCommunicator>,
}

/// One executable command.
#[async_trait]
pub trait Command: Send + Sync {
    /// Command name within its plugin.
    fn name(&self) -> &'static str;

    /// Owning plugin name.
    fn plugin(&self) -> &'static str;

    /// Substitute expansions into the fields that declare them.
    ///
    /// # Errors
    ///
    /// Returns an error for unresolved or cyclic tokens.
    fn expand(&mut self, _expansions: &Expansions) -> Result<(), CommandError> {
        Ok(())
    }

    /// Whether a failure of this command lets the pipeline continue.
    fn continue_on_err(&self) -> bool {
        false
    }

    /// Per-command deadline, when the parameters set one.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Run the command.
    async fn execute(
        &self,
        ctx: &ExecContext,
        config: &mut TaskConfig,
    ) -> Result<(), CommandError>;
}

type Constructor = fn(&serde_json::Value) -> Result<Box<dyn Command>, CommandError>;

/// Registry mapping `plugin.name` identifiers to typed constructors.
pub struct CommandRegistry {
    constructors: HashMap<&'static str, Constructor>,
}

impl CommandRegistry {
    /// Registry with the built-in commands.
    #[must_use]
    pub fn new() -> Self {
        let mut constructors: HashMap<&'static str, Constructor> = HashMap::new();
        constructors.insert("shell.exec", ShellExecCommand::parse);
        constructors.insert("shell.cleanup", ShellCleanupCommand::parse);
        constructors.insert("shell.track", ShellTrackCommand::parse);
        constructors.insert("expansions.update", ExpansionsUpdateCommand::parse);
        constructors.insert("expansions.fetch_vars", ExpansionsFetchVarsCommand::parse);
        Self { constructors }
    }

    /// Build a typed command from a descriptor, validating parameters.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown identifier or invalid parameters.
    pub fn build(&self, descriptor: &CommandDescriptor) -> Result<Box<dyn Command>, CommandError> {
        let constructor = self
            .constructors
            .get(descriptor.command.as_str())
            .ok_or_else(|| CommandError::UnknownCommand(descriptor.command.clone()))?;
        constructor(&descriptor.params)
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// How a pipeline ended short of completing every command.
#[derive(Debug)]
pub struct PipelineFailure {
    /// The failing command's identifier or display name.
    pub command: String,

    /// The descriptor's failure kind, e.g. `test`.
    pub kind: String,

    /// Whether a per-command deadline fired.
    pub timed_out: bool,

    /// Failure detail.
    pub message: String,
}

/// Run a list of descriptors in order.
///
/// # Errors
///
/// Returns the first failure that the failing command did not opt out of
/// via `continue_on_err`.
pub async fn run_pipeline(
    registry: &CommandRegistry,
    descriptors: &[CommandDescriptor],
    ctx: &ExecContext,
    config: &mut TaskConfig,
    state: &SharedState,
) -> Result<(), PipelineFailure> {
    for descriptor in descriptors {
        if ctx.cancel.is_cancelled() {
            return Err(failure(descriptor, CommandError::Interrupted));
        }

        let display = if descriptor.display_name.is_empty() {
            descriptor.command.clone()
        } else {
            descriptor.display_name.clone()
        };
        {
            let mut current = state.lock().unwrap_or_else(|e| e.into_inner());
            current.command = display.clone();
        }
        ctx.logger.execution(format!("Running command '{display}'"));

        let result = run_one(registry, descriptor, ctx, config).await;

        {
            let mut current = state.lock().unwrap_or_else(|e| e.into_inner());
            current.command.clear();
        }

        match result {
            Ok(()) => {
                ctx.logger
                    .execution(format!("Finished command '{display}'"));
            },
            Err((err, continue_on_err)) => {
                if continue_on_err {
                    ctx.logger
                        .execution(format!("(ignoring) command '{display}' failed: {err}"));
                    continue;
                }
                ctx.logger
                    .execution(format!("command '{display}' failed: {err}"));
                return Err(failure(descriptor, err));
            },
        }
    }
    Ok(())
}

/// Build, expand and execute one command, enforcing its deadline.
async fn run_one(
    registry: &CommandRegistry,
    descriptor: &CommandDescriptor,
    ctx: &ExecContext,
    config: &mut TaskConfig,
) -> Result<(), (CommandError, bool)> {
    let mut command = registry.build(descriptor).map_err(|e| (e, false))?;
    command
        .expand(&config.expansions)
        .map_err(|e| (e, command.continue_on_err()))?;

    let continue_on_err = command.continue_on_err();
    let result = match command.timeout() {
        Some(deadline) => match tokio::time::timeout(deadline, command.execute(ctx, config)).await
        {
            Ok(result) => result,
            Err(_) => Err(CommandError::TimedOut(deadline)),
        },
        None => command.execute(ctx, config).await,
    };
    result.map_err(|e| (e, continue_on_err))
}

fn failure(descriptor: &CommandDescriptor, err: CommandError) -> PipelineFailure {
    PipelineFailure {
        command: descriptor.command.clone(),
        kind: if descriptor.kind.is_empty() {
            "test".to_string()
        } else {
            descriptor.kind.clone()
        },
        timed_out: matches!(err, CommandError::TimedOut(_)),
        message: err.to_string(),
    }
}
