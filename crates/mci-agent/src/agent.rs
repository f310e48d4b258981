//! Agent core loop.
//!
//! One pass of [`Agent::run_task`] owns one task: fetch the bundle,
//! start the heartbeat and metrics collectors, run pre / main / post
//! pipelines with cancellation, sweep spawned processes, and report
//! `end`. The outer [`run`] loop rebinds to successor tasks until the
//! API says stop.

use std::path::PathBuf;
use std::sync::Arc;

use mci_core::expansion::Expansions;
use mci_core::model::TaskStatus;
use mci_core::wire::{EndTaskDetail, EndTaskResponse};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cleanup;
use crate::comm::{CommError, HttpCommunicator};
use crate::command::{run_pipeline, CommandRegistry, ExecContext, TaskConfig};
use crate::dump::{self, SharedState};
use crate::heartbeat::{self, Signal};
use crate::logger::TaskLogger;
use crate::metrics;
use crate::{EXIT_FATAL, EXIT_OK, EXIT_WRONG_SECRET};

/// Startup configuration, usually from CLI flags.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Base URL of the API server.
    pub api_server: String,

    /// Task to run.
    pub task_id: String,

    /// Secret for the task.
    pub task_secret: String,

    /// Host this agent runs on.
    pub host_id: String,

    /// Secret for the host.
    pub host_secret: String,

    /// Optional PEM certificate for a self-signed API server.
    pub https_cert: Option<PathBuf>,

    /// Directory tasks execute in.
    pub working_dir: PathBuf,

    /// Pid file path, if one should be maintained.
    pub pid_file: Option<PathBuf>,
}

/// Error types for a task run.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// API communication failed beyond the retry budget.
    #[error(transparent)]
    Comm(CommError),

    /// The server rejected our secret; this agent must exit nonzero.
    #[error("secret rejected by the API server")]
    IncorrectSecret,

    /// Local filesystem failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CommError> for AgentError {
    fn from(err: CommError) -> Self {
        match err {
            CommError::Conflict => Self::IncorrectSecret,
            other => Self::Comm(other),
        }
    }
}

/// Run tasks until the API stops handing them out. Returns the process
/// exit code.
pub async fn run(options: AgentOptions) -> i32 {
    if let Err(err) = write_pid_file(options.pid_file.as_deref()).await {
        error!("could not write pid file: {err}");
        return EXIT_FATAL;
    }

    let mut comm = match HttpCommunicator::new(
        &options.api_server,
        &options.task_id,
        &options.task_secret,
        &options.host_id,
        &options.host_secret,
        options.https_cert.as_deref(),
    ) {
        Ok(comm) => Arc::new(comm),
        Err(err) => {
            error!("could not create communicator: {err}");
            remove_pid_file(options.pid_file.as_deref()).await;
            return EXIT_FATAL;
        },
    };

    let state = dump::shared_state();
    let mut exit_code = EXIT_OK;

    loop {
        let agent = Agent {
            comm: Arc::clone(&comm),
            working_dir: options.working_dir.clone(),
            state: Arc::clone(&state),
        };

        match agent.run_task().await {
            Ok(response) => {
                if response.should_exit {
                    info!("server instructed the agent to exit: {}", response.message);
                    break;
                }
                match (response.run_next, response.task_id, response.task_secret) {
                    (true, Some(next_id), Some(next_secret)) => {
                        info!(task_id = %next_id, "rebinding to next task");
                        comm = Arc::new(comm.for_task(next_id, next_secret));
                    },
                    _ => break,
                }
            },
            Err(AgentError::IncorrectSecret) => {
                error!("wrong secret; exiting without relaunch");
                exit_code = EXIT_WRONG_SECRET;
                break;
            },
            Err(err) => {
                error!("error running task: {err}");
                exit_code = EXIT_FATAL;
                break;
            },
        }
    }

    remove_pid_file(options.pid_file.as_deref()).await;
    exit_code
}

async fn write_pid_file(path: Option<&std::path::Path>) -> std::io::Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, std::process::id().to_string()).await
}

async fn remove_pid_file(path: Option<&std::path::Path>) {
    if let Some(path) = path {
        if let Err(err) = tokio::fs::remove_file(path).await {
            warn!("could not remove pid file: {err}");
        }
    }
}

/// One task's execution context.
pub struct Agent {
    comm: Arc<HttpCommunicator>,
    working_dir: PathBuf,
    state: SharedState,
}

impl Agent {
    /// Create an agent for the communicator's task.
    #[must_use]
    pub fn new(comm: Arc<HttpCommunicator>, working_dir: PathBuf, state: SharedState) -> Self {
        Self {
            comm,
            working_dir,
            state,
        }
    }

    /// Run the bound task to completion and report `end`.
    ///
    /// # Errors
    ///
    /// Returns an error when the API cannot be reached within the retry
    /// budget or rejects our secret.
    pub async fn run_task(&self) -> Result<EndTaskResponse, AgentError> {
        let cancel = CancellationToken::new();

        // fetch the task bundle, each with retry + backoff
        let task = self.comm.get_task(&cancel).await?;
        let distro = self.comm.get_distro(&cancel).await?;
        let project = self.comm.get_project(&cancel).await?;
        let vars = self.comm.fetch_vars(&cancel).await?;
        info!(task_id = %task.id, display_name = %task.display_name, "starting task");

        let mut expansions = Expansions::new();
        expansions.update(project.expansions.clone());
        expansions.update(vars.vars);
        expansions.put("task_id", task.id.clone());
        expansions.put("task_name", task.display_name.clone());
        expansions.put("execution", task.execution.to_string());
        expansions.put("project", task.project.clone());
        expansions.put("revision", task.revision.clone());
        expansions.put("distro_id", distro.id.clone());
        expansions.put("workdir", self.working_dir.display().to_string());

        let mut config = TaskConfig {
            task: task.clone(),
            distro,
            project: project.clone(),
            expansions,
            work_dir: self.working_dir.clone(),
        };

        let logger = TaskLogger::new(Arc::clone(&self.comm));
        {
            let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
            current.task_id = task.id.clone();
            current.command.clear();
        }

        let flusher = tokio::spawn({
            let logger = logger.clone();
            let cancel = cancel.child_token();
            async move { logger.run_flusher(cancel).await }
        });
        let dumper = tokio::spawn(dump::dump_on_sigquit(
            Arc::clone(&self.state),
            logger.clone(),
            self.working_dir.clone(),
        ));
        metrics::start(Arc::clone(&self.comm), task.id.clone(), cancel.child_token());

        let (signal_tx, mut signal_rx) = mpsc::channel(1);
        tokio::spawn(heartbeat::run(
            Arc::clone(&self.comm),
            signal_tx,
            cancel.child_token(),
        ));

        self.comm.start(std::process::id(), &cancel).await?;

        let registry = CommandRegistry::new();
        let ctx = ExecContext {
            cancel: cancel.child_token(),
            logger: logger.clone(),
            comm: Arc::clone(&self.comm),
        };

        let mut aborted = false;
        let mut secret_conflict = false;
        let mut heartbeat_failed = false;

        let main_result = {
            let main_commands = project
                .commands_for(&config.task.display_name)
                .map(<[_]>::to_vec);

            let run = async {
                if !project.pre.is_empty() {
                    if let Err(failure) =
                        run_pipeline(&registry, &project.pre, &ctx, &mut config, &self.state).await
                    {
                        // pre-task failures are logged, never fatal
                        ctx.logger.execution(format!(
                            "pre-task commands failed: {}",
                            failure.message
                        ));
                    }
                }
                match &main_commands {
                    Some(commands) => {
                        run_pipeline(&registry, commands, &ctx, &mut config, &self.state).await
                    },
                    None => Err(crate::command::PipelineFailure {
                        command: String::new(),
                        kind: "setup".to_string(),
                        timed_out: false,
                        message: format!(
                            "project defines no commands for task '{}'",
                            config.task.display_name
                        ),
                    }),
                }
            };
            tokio::pin!(run);

            let mut signals_open = true;
            loop {
                tokio::select! {
                    result = &mut run => break result,
                    signal = signal_rx.recv(), if signals_open => match signal {
                        Some(Signal::AbortedByUser) => {
                            warn!("task aborted by user");
                            aborted = true;
                            ctx.cancel.cancel();
                        },
                        Some(Signal::IncorrectSecret) => {
                            secret_conflict = true;
                            ctx.cancel.cancel();
                        },
                        Some(Signal::HeartbeatFailed) => {
                            heartbeat_failed = true;
                            ctx.cancel.cancel();
                        },
                        None => signals_open = false,
                    },
                }
            }
        };

        // post commands always run, on a fresh context
        if !project.post.is_empty() {
            let post_ctx = ExecContext {
                cancel: CancellationToken::new(),
                logger: logger.clone(),
                comm: Arc::clone(&self.comm),
            };
            if let Err(failure) =
                run_pipeline(&registry, &project.post, &post_ctx, &mut config, &self.state).await
            {
                ctx.logger
                    .execution(format!("post-task commands failed: {}", failure.message));
            }
        }

        // the sweep is idempotent and runs on every exit path
        cleanup::kill_spawned_procs(&task.id).await;

        if secret_conflict {
            cancel.cancel();
            dumper.abort();
            return Err(AgentError::IncorrectSecret);
        }

        let detail = if aborted {
            EndTaskDetail {
                status: TaskStatus::Undispatched,
                kind: String::new(),
                description: "task aborted by user".to_string(),
                timed_out: false,
            }
        } else if heartbeat_failed {
            EndTaskDetail {
                status: TaskStatus::Failed,
                kind: "system".to_string(),
                description: "heartbeat delivery failed repeatedly".to_string(),
                timed_out: false,
            }
        } else {
            match &main_result {
                Ok(()) => EndTaskDetail::success(),
                Err(failure) => EndTaskDetail {
                    status: TaskStatus::Failed,
                    kind: failure.kind.clone(),
                    description: failure.message.clone(),
                    timed_out: failure.timed_out,
                },
            }
        };

        logger.flush().await;
        cancel.cancel();
        let _ = flusher.await;

        let end_cancel = CancellationToken::new();
        let response = self.comm.end(&detail, &end_cancel).await?;
        info!(
            status = %detail.status,
            run_next = response.run_next,
            "task complete"
        );

        dumper.abort();
        {
            let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
            current.task_id.clear();
            current.command.clear();
        }
        Ok(response)
    }
}
