// mediator.rs - the request mediator
//
// Runs an operation against a remote endpoint with a bounded deadline,
// retries idempotent-safe failures with exponential backoff and
// jitter, and publishes a "reachable" liveness pulse on every attempt's
// outcome. Deadline elapsed-time tracking goes through an injected
// clock rather than a bare `Instant::now()`, so tests can simulate a
// deadline running out without actually waiting for it.

use crate::clock::{SharedClock, SystemClock};
use crate::config::RetryConfig;
use crate::error::Error;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const MIN_DEADLINE: Duration = Duration::from_secs(1);
const MAX_DEADLINE: Duration = Duration::from_secs(300);

/// Per-call options.
#[derive(Debug, Clone, Copy)]
pub struct CallOptions {
    pub deadline: Duration,
    pub idempotent: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(30),
            idempotent: true,
        }
    }
}

pub struct RequestMediator {
    retry: RetryConfig,
    clock: SharedClock,
    reachable_tx: watch::Sender<bool>,
}

impl RequestMediator {
    pub fn new(retry: RetryConfig) -> Self {
        Self::with_clock(retry, Arc::new(SystemClock))
    }

    /// Same as [`Self::new`], but with an injected clock so the deadline
    /// math in [`Self::execute`] can be driven deterministically in
    /// tests instead of depending on real elapsed wall time.
    pub fn with_clock(retry: RetryConfig, clock: SharedClock) -> Self {
        let (reachable_tx, _rx) = watch::channel(true);
        Self { retry, clock, reachable_tx }
    }

    /// Subscribe to the reachability pulse (consumed by the Push
    /// Channel's backoff scheduler and the Sync Coordinator's
    /// online/offline heuristic).
    pub fn reachability(&self) -> watch::Receiver<bool> {
        self.reachable_tx.subscribe()
    }

    /// Run `f`, retrying per the policy below. `f` is called
    /// once per attempt and must itself be cancellation-safe (it is
    /// raced against the deadline on every attempt).
    pub async fn execute<F, Fut, T>(&self, op_name: &str, opts: CallOptions, f: F) -> Result<T, Error>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let deadline = opts.deadline.clamp(MIN_DEADLINE, MAX_DEADLINE);
        let started = self.clock.now();
        let mut backoff = self.retry.initial_backoff;

        for attempt in 1..=self.retry.max_attempts {
            let remaining = deadline.saturating_sub(self.elapsed_since(started));
            if remaining.is_zero() {
                self.pulse(false);
                return Err(Error::Unavailable);
            }

            let outcome = tokio::time::timeout(remaining, f()).await;

            let err = match outcome {
                Err(_elapsed) => Error::Transient(crate::error::TransientKind::Timeout),
                Ok(Ok(value)) => {
                    self.pulse(true);
                    return Ok(value);
                }
                Ok(Err(e)) => e,
            };

            self.pulse(false);

            let Some(wait) = self.retry_delay(&err, attempt, opts.idempotent, backoff) else {
                tracing::warn!(op = op_name, attempt, error = %err, "request mediator: not retrying");
                return Err(err);
            };

            let remaining = deadline.saturating_sub(self.elapsed_since(started));
            if remaining.is_zero() {
                return Err(err);
            }
            let wait = wait.min(remaining);

            tracing::debug!(op = op_name, attempt, wait_ms = wait.as_millis(), "request mediator: retrying");
            tokio::time::sleep(wait).await;
            backoff = (backoff * 2).min(self.retry.max_backoff);
        }

        Err(Error::Unavailable)
    }

    /// Decide whether `err` should be retried and, if so, how long to
    /// wait. Returns `None` when the error is terminal for this call.
    fn retry_delay(&self, err: &Error, attempt: u32, idempotent: bool, backoff: Duration) -> Option<Duration> {
        if attempt >= self.retry.max_attempts {
            return None;
        }

        match err {
            Error::Transient(_) => Some(self.jittered(backoff)),
            Error::Remote { code, retry_after_ms, .. } => {
                if *code == 503 {
                    let hint = retry_after_ms.map(Duration::from_millis);
                    Some(hint.unwrap_or_else(|| self.jittered(backoff)))
                } else if idempotent && matches!(code, 500 | 502 | 504) {
                    Some(self.jittered(backoff))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    fn elapsed_since(&self, started: chrono::DateTime<chrono::Utc>) -> Duration {
        (self.clock.now() - started).to_std().unwrap_or(Duration::ZERO)
    }

    fn jittered(&self, base: Duration) -> Duration {
        let jitter = self.retry.jitter.clamp(0.0, 1.0);
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
    }

    fn pulse(&self, reachable: bool) {
        let _ = self.reachable_tx.send(reachable);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            jitter: 0.25,
        }
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let mediator = RequestMediator::new(fast_retry_config());
        let result = mediator
            .execute("noop", CallOptions::default(), || async { Ok::<_, Error>(42) })
            .await
            .unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let mediator = RequestMediator::new(fast_retry_config());
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = attempts.clone();

        let result = mediator
            .execute("flaky", CallOptions::default(), move || {
                let attempts = attempts2.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(Error::Transient(crate::error::TransientKind::Transport))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn never_retries_non_idempotent_4xx() {
        let mediator = RequestMediator::new(fast_retry_config());
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = attempts.clone();

        let opts = CallOptions {
            deadline: Duration::from_secs(5),
            idempotent: false,
        };
        let err = mediator
            .execute("create", opts, move || {
                let attempts = attempts2.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Error::Remote {
                        code: 400,
                        message: "bad request".into(),
                        retry_after_ms: None,
                    })
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Remote { code: 400, .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_503_honoring_retry_after() {
        let mediator = RequestMediator::new(fast_retry_config());
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = attempts.clone();

        let result = mediator
            .execute("rate-limited", CallOptions::default(), move || {
                let attempts = attempts2.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        Err(Error::Remote {
                            code: 503,
                            message: "slow down".into(),
                            retry_after_ms: Some(1),
                        })
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausting_retries_surfaces_unavailable() {
        let mut config = fast_retry_config();
        config.max_attempts = 2;
        let mediator = RequestMediator::new(config);

        let err = mediator
            .execute("always-fails", CallOptions::default(), || async {
                Err::<(), _>(Error::Transient(crate::error::TransientKind::Timeout))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Unavailable) || matches!(err, Error::Transient(_)));
    }

    #[tokio::test]
    async fn deadline_exceeded_is_detected_through_the_injected_clock_without_waiting() {
        let clock = FixedClock::new(chrono::Utc::now());
        let mediator = RequestMediator::with_clock(fast_retry_config(), clock.clone());
        let opts = CallOptions { deadline: Duration::from_millis(50), idempotent: true };

        let clock_for_call = clock.clone();
        let err = mediator
            .execute("op", opts, move || {
                let clock_for_call = clock_for_call.clone();
                async move {
                    // The clock, not the wall, decides the call ran past its deadline.
                    clock_for_call.advance(chrono::Duration::milliseconds(100));
                    Err::<(), _>(Error::Transient(crate::error::TransientKind::Transport))
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Transient(_)));
    }
}
