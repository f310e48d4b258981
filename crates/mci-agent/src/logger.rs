//! Task-scoped logging.
//!
//! The agent never logs through a process-global sink; a [`TaskLogger`]
//! value is threaded through the command runtime. Messages are buffered
//! and shipped to the API when the batch fills or the flush interval
//! fires, whichever comes first.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use mci_core::logmsg::{LogChannel, LogMessage, LogSeverity};
use mci_core::wire::LogBatch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::comm::HttpCommunicator;

/// Messages buffered before a send is forced.
const BATCH_SIZE: usize = 100;

/// Interval between flushes of a non-empty buffer.
const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

struct Inner {
    comm: Arc<HttpCommunicator>,
    buffer: Mutex<Vec<LogMessage>>,
}

/// Buffered, batched sender for a task's log stream.
#[derive(Clone)]
pub struct TaskLogger {
    inner: Arc<Inner>,
}

impl TaskLogger {
    /// Create a logger shipping to the given communicator.
    #[must_use]
    pub fn new(comm: Arc<HttpCommunicator>) -> Self {
        Self {
            inner: Arc::new(Inner {
                comm,
                buffer: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Queue one message. Triggers an async flush when the batch fills.
    pub fn log(&self, channel: LogChannel, severity: LogSeverity, message: impl Into<String>) {
        let full = {
            let mut buffer = self
                .inner
                .buffer
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            buffer.push(LogMessage::new(channel, severity, message));
            buffer.len() >= BATCH_SIZE
        };
        if full {
            let logger = self.clone();
            tokio::spawn(async move { logger.flush().await });
        }
    }

    /// Task-channel info line (command output).
    pub fn task(&self, message: impl Into<String>) {
        self.log(LogChannel::Task, LogSeverity::Info, message);
    }

    /// Task-channel error line.
    pub fn task_error(&self, message: impl Into<String>) {
        self.log(LogChannel::Task, LogSeverity::Error, message);
    }

    /// Execution-channel line (agent orchestration).
    pub fn execution(&self, message: impl Into<String>) {
        self.log(LogChannel::Execution, LogSeverity::Info, message);
    }

    /// System-channel line (host diagnostics).
    pub fn system(&self, message: impl Into<String>) {
        self.log(LogChannel::System, LogSeverity::Info, message);
    }

    /// Ship everything buffered right now.
    pub async fn flush(&self) {
        let messages: Vec<LogMessage> = {
            let mut buffer = self
                .inner
                .buffer
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *buffer)
        };
        if messages.is_empty() {
            return;
        }
        let batch = LogBatch {
            task_id: self.inner.comm.task_id().to_string(),
            timestamp: Utc::now(),
            messages,
        };
        // uploads get their own token: a canceled task still flushes
        let cancel = CancellationToken::new();
        if let Err(err) = self.inner.comm.send_logs(&batch, &cancel).await {
            warn!("log upload failed, dropping batch: {err}");
        }
    }

    /// Run the periodic flusher until `cancel` fires, then flush once
    /// more.
    pub async fn run_flusher(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(FLUSH_INTERVAL) => self.flush().await,
            }
        }
        self.flush().await;
    }

    /// Number of messages currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.inner
            .buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
