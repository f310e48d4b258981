//! Heartbeat loop.
//!
//! Pings the API every [`HEARTBEAT_INTERVAL`] on the dedicated
//! short-timeout client and surfaces what it learns on a bounded signal
//! channel: an out-of-band abort, a wrong-secret conflict, or too many
//! consecutive delivery failures. The main loop selects on this channel
//! alongside command completion.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::comm::{CommError, HttpCommunicator};

/// Interval between heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive delivery failures tolerated before the task is failed.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Out-of-band conditions the heartbeat loop can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The server requested an abort.
    AbortedByUser,

    /// The server answered 409: this agent's secret is stale.
    IncorrectSecret,

    /// The API has been unreachable for too many beats.
    HeartbeatFailed,
}

/// Run the heartbeat loop until `cancel` fires or a fatal signal is
/// sent. The channel is bounded; a signal that cannot be enqueued is
/// dropped because an earlier one is already pending.
pub async fn run(
    comm: Arc<HttpCommunicator>,
    signals: mpsc::Sender<Signal>,
    cancel: CancellationToken,
) {
    let mut failures: u32 = 0;
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(HEARTBEAT_INTERVAL) => {},
        }

        match comm.heartbeat().await {
            Ok(true) => {
                warn!("server requested abort");
                let _ = signals.try_send(Signal::AbortedByUser);
                return;
            },
            Ok(false) => {
                failures = 0;
            },
            Err(CommError::Conflict) => {
                error!("heartbeat got 409; secret is stale");
                let _ = signals.try_send(Signal::IncorrectSecret);
                return;
            },
            Err(err) => {
                failures += 1;
                warn!(failures, "heartbeat failed: {err}");
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    error!("heartbeat failed {failures} times; giving up");
                    let _ = signals.try_send(Signal::HeartbeatFailed);
                    return;
                }
            },
        }
    }
}
