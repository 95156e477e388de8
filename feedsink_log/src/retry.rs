//! Bounded retry with a fixed or exponential delay between attempts.

use std::{future::Future, ops::ControlFlow, time::Duration};

use backoff::BackoffConfig;
use thiserror::Error;

/// Delay between two attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Wait the same amount of time before every retry
    Fixed(Duration),
    /// Grow the delay after every failed attempt, capped at `max`
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    /// The first delay, used for clients that only support an initial backoff
    pub fn initial(&self) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { initial, .. } => initial,
        }
    }

    /// The largest delay this backoff will ever wait
    pub fn max(&self) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { max, .. } => max,
        }
    }

    /// The jittered backoff this delay maps to, retrying is bounded by attempts, not by time.
    pub fn config(&self) -> BackoffConfig {
        // jitter is drawn from [init, previous * base), which must not be empty
        let init_backoff = self.initial().max(Duration::from_millis(1));
        BackoffConfig {
            init_backoff,
            max_backoff: self.max().max(init_backoff),
            base: 2.0,
            deadline: None,
        }
    }
}

/// How many times a failed request is retried, and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt, `0` disables retrying
    pub max_retries: usize,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::Exponential {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(5),
            },
        }
    }
}

/// The last error of an operation that was given up on
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Total attempts made, including the first one
    pub attempts: usize,
    pub error: E,
}

/// A failed attempt that is retried
#[derive(Debug, Error)]
#[error("attempt {attempt} failed: {message}")]
struct AttemptFailed {
    attempt: usize,
    message: String,
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn never() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::Fixed(Duration::ZERO),
        }
    }

    /// Run `op` until it succeeds, it fails with an error that `retryable` rejects, or the retry
    /// budget is spent.
    pub async fn run<T, E, F, Fut, R>(
        &self,
        task_name: &str,
        mut op: F,
        retryable: R,
    ) -> Result<T, Exhausted<E>>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        R: Fn(&E) -> bool + Send + Sync,
        T: Send,
        E: std::fmt::Display + Send,
    {
        let max_retries = self.max_retries;
        let retryable = &retryable;
        let mut attempts = 0;
        backoff::Backoff::new(&self.backoff.config())
            .retry_with_backoff(task_name, || {
                attempts += 1;
                let attempt = attempts;
                let fut = op();
                async move {
                    match fut.await {
                        Ok(v) => ControlFlow::Break(Ok(v)),
                        Err(error) if attempt > max_retries || !retryable(&error) => {
                            ControlFlow::Break(Err(Exhausted {
                                attempts: attempt,
                                error,
                            }))
                        }
                        Err(error) => ControlFlow::Continue(AttemptFailed {
                            attempt,
                            message: error.to_string(),
                        }),
                    }
                }
            })
            .await
            .expect("retry without deadline")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn backoff_config() {
        let exponential = Backoff::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
        }
        .config();
        assert_eq!(exponential.init_backoff, Duration::from_millis(100));
        assert_eq!(exponential.max_backoff, Duration::from_millis(500));
        assert_eq!(exponential.deadline, None);

        let fixed = Backoff::Fixed(Duration::from_millis(250)).config();
        assert_eq!(fixed.init_backoff, Duration::from_millis(250));
        assert_eq!(fixed.max_backoff, Duration::from_millis(250));

        let zero = RetryPolicy::never().backoff.config();
        assert_eq!(zero.init_backoff, Duration::from_millis(1));
        assert_eq!(zero.max_backoff, Duration::from_millis(1));
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy {
            max_retries: 2,
            backoff: Backoff::Fixed(Duration::from_millis(10)),
        };

        let res: Result<(), _> = policy
            .run(
                "fail",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("boom")
                },
                |_| true,
            )
            .await;

        let exhausted = res.unwrap_err();
        assert_eq!(exhausted.attempts, 3);
        assert_eq!(exhausted.error, "boom");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let res: Result<(), _> = RetryPolicy::default()
            .run(
                "fail",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("permanent")
                },
                |_| false,
            )
            .await;

        assert_eq!(res.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy {
            max_retries: 5,
            backoff: Backoff::Fixed(Duration::from_millis(1)),
        };
        let res = policy
            .run(
                "flaky",
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("transient")
                    } else {
                        Ok(42)
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(res.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
