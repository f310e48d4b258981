//! Bounded retry combinator.
//!
//! All remote I/O in MCI (API calls, SSH probes, uploads) retries through
//! this one combinator: a bounded attempt count, a fixed base sleep, and a
//! caller-supplied classifier deciding which errors are worth another try.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Default attempt bound for remote calls.
pub const DEFAULT_ATTEMPTS: u32 = 10;

/// Default sleep between attempts.
pub const DEFAULT_RETRY_SLEEP: Duration = Duration::from_secs(3);

/// Classifier verdict for one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Worth another attempt.
    Retry,

    /// Give up immediately.
    Fatal,
}

/// Retry policy: attempt bound plus inter-attempt sleep.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    pub attempts: u32,

    /// Sleep between attempts.
    pub sleep: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            sleep: DEFAULT_RETRY_SLEEP,
        }
    }
}

impl RetryConfig {
    /// Policy with the given attempt bound and the default sleep.
    #[must_use]
    pub const fn with_attempts(attempts: u32) -> Self {
        Self {
            attempts,
            sleep: DEFAULT_RETRY_SLEEP,
        }
    }
}

/// Error types for a retried operation.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    #[error("operation failed after {attempts} attempts: {source}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// The last error.
        source: E,
    },

    /// The classifier declared an error fatal.
    #[error("operation failed: {0}")]
    Fatal(E),

    /// The cancellation token fired while retrying.
    #[error("operation canceled")]
    Canceled,
}

impl<E> RetryError<E> {
    /// The underlying error, when one exists.
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::Exhausted { source, .. } | Self::Fatal(source) => Some(source),
            Self::Canceled => None,
        }
    }
}

/// Run `op` until it succeeds, the attempts are exhausted, the classifier
/// declares an error fatal, or `cancel` fires.
///
/// # Errors
///
/// Returns [`RetryError`] describing which of the three ways the retry
/// loop ended without a success.
pub async fn retry<T, E, F, Fut, C>(
    config: RetryConfig,
    cancel: &CancellationToken,
    classify: C,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryDecision,
{
    let attempts = config.attempts.max(1);
    let mut last_err = None;

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(RetryError::Canceled);
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => match classify(&err) {
                RetryDecision::Fatal => return Err(RetryError::Fatal(err)),
                RetryDecision::Retry => {
                    last_err = Some(err);
                },
            },
        }

        if attempt < attempts {
            tokio::select! {
                () = cancel.cancelled() => return Err(RetryError::Canceled),
                () = tokio::time::sleep(config.sleep) => {},
            }
        }
    }

    match last_err {
        Some(source) => Err(RetryError::Exhausted { attempts, source }),
        // unreachable in practice: attempts >= 1 means we either returned
        // or recorded an error
        None => Err(RetryError::Canceled),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast() -> RetryConfig {
        RetryConfig {
            attempts: 3,
            sleep: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result = retry(fast(), &cancel, |_: &&str| RetryDecision::Retry, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient")
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_stops_immediately() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<(), _> =
            retry(fast(), &cancel, |_: &&str| RetryDecision::Fatal, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("conflict") }
            })
            .await;

        assert!(matches!(result.unwrap_err(), RetryError::Fatal("conflict")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempt_count() {
        let cancel = CancellationToken::new();

        let result: Result<(), _> =
            retry(fast(), &cancel, |_: &&str| RetryDecision::Retry, || async {
                Err("down")
            })
            .await;

        match result.unwrap_err() {
            RetryError::Exhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert_eq!(source, "down");
            },
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_retry() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), _> =
            retry(fast(), &cancel, |_: &&str| RetryDecision::Retry, || async {
                Err("down")
            })
            .await;

        assert!(matches!(result.unwrap_err(), RetryError::Canceled));
    }
}
