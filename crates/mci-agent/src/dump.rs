//! Diagnostic stack dump on SIGQUIT.
//!
//! On a quit signal the agent writes a dump to a timestamped file in the
//! working directory and to the task's system log channel, tagged with
//! the current task and command. Both writes are fire-and-forget so a
//! wedged logger can never deadlock the dump.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::logger::TaskLogger;

/// Timestamp layout used in dump filenames.
const FILENAME_TIMESTAMP: &str = "%Y-%m-%d_%H_%M_%S";

/// Shared record of what the agent is doing right now.
#[derive(Debug, Default)]
pub struct CurrentState {
    /// Task being executed.
    pub task_id: String,

    /// Command currently running, empty between commands.
    pub command: String,
}

/// Handle the pipeline updates as it progresses.
pub type SharedState = Arc<Mutex<CurrentState>>;

/// Create an empty shared state.
#[must_use]
pub fn shared_state() -> SharedState {
    Arc::new(Mutex::new(CurrentState::default()))
}

/// Listen for SIGQUIT and dump on each one. Runs until the process
/// exits; spawn it once at startup.
pub async fn dump_on_sigquit(state: SharedState, logger: TaskLogger, working_dir: PathBuf) {
    let mut quits = match signal(SignalKind::quit()) {
        Ok(quits) => quits,
        Err(err) => {
            warn!("could not install SIGQUIT handler: {err}");
            return;
        },
    };

    while quits.recv().await.is_some() {
        let (task_id, command) = {
            let current = state.lock().unwrap_or_else(|e| e.into_inner());
            (current.task_id.clone(), current.command.clone())
        };
        let dump = render_dump(&task_id, &command);

        let path = working_dir.join(format!(
            "mci_agent_{}_dump_{}.log",
            std::process::id(),
            chrono::Utc::now().format(FILENAME_TIMESTAMP),
        ));
        let file_dump = dump.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::fs::write(&path, file_dump).await {
                warn!("could not write dump file: {err}");
            } else {
                info!(path = %path.display(), "wrote stack dump");
            }
        });

        let log_dump = dump;
        let logger = logger.clone();
        tokio::spawn(async move {
            logger.system(log_dump);
            logger.flush().await;
        });
    }
}

fn render_dump(task_id: &str, command: &str) -> String {
    let task = if task_id.is_empty() {
        "no running task"
    } else {
        task_id
    };
    let command = if command.is_empty() {
        "no running command"
    } else {
        command
    };
    format!(
        "Agent dump taken on {}.\n\nRunning command '{}' for task '{}'.\n\n{}",
        chrono::Utc::now().to_rfc3339(),
        command,
        task,
        std::backtrace::Backtrace::force_capture(),
    )
}
