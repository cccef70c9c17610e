//! Backend call retry with exponential backoff
//!
//! Each attempt runs under its own timeout. Only backend-family errors are
//! retried; anything else (an unreadable file, a storage failure) ends the
//! call immediately.

use constellation_core::Error;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry behavior for backend calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial one)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Maximum delay between retries (backoff is capped here)
    pub max_delay: Duration,
    /// Time allowed for a single attempt
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1 for the first retry)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep, then try again
    Retry(Duration),
    /// Surface the error
    GiveUp,
}

/// Attempt counter for one backend call
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempts: u32,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempts: 0 }
    }

    /// Record the start of an attempt and return its 1-based number
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Decide how to proceed after `error` ended the current attempt
    pub fn on_failure(&self, error: &Error) -> RetryDecision {
        if !error.is_backend() || self.attempts >= self.policy.max_attempts {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry(self.policy.delay_for(self.attempts))
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Run `op` until it succeeds, a non-retryable error occurs, or attempts run out
///
/// `op` receives the 1-based attempt number.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut state = RetryState::new(policy.clone());
    loop {
        let attempt = state.begin_attempt();
        let result = match tokio::time::timeout(policy.timeout, op(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(Error::BackendTimeout(policy.timeout)),
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        match state.on_failure(&error) {
            RetryDecision::Retry(delay) => {
                warn!(
                    call = label,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "backend call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            RetryDecision::GiveUp => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy(10);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn test_state_machine_decisions() {
        let mut state = RetryState::new(policy(2));
        let backend = Error::Backend("503".into());

        state.begin_attempt();
        assert_eq!(state.on_failure(&backend), RetryDecision::Retry(Duration::from_millis(100)));
        state.begin_attempt();
        assert_eq!(state.on_failure(&backend), RetryDecision::GiveUp);
        assert_eq!(state.attempts(), 2);

        let fresh = RetryState::new(policy(5));
        let not_backend = Error::NotYetAvailable("x".into());
        assert_eq!(fresh.on_failure(&not_backend), RetryDecision::GiveUp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = retry_with_backoff(&policy(3), "generate", move |attempt| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(Error::MalformedResponse("empty".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), Error> = retry_with_backoff(&policy(3), "generate", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Backend("boom".into())) }
        })
        .await;

        assert!(matches!(result, Err(Error::Backend(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_backend_failure() {
        let mut policy = policy(2);
        policy.timeout = Duration::from_millis(50);

        let result: Result<(), Error> = retry_with_backoff(&policy, "summarize", |_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(Error::BackendTimeout(d)) if d == Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn test_non_backend_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), Error> = retry_with_backoff(&policy(5), "summarize", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                Err(Error::IoUnreadable {
                    path: "gone.rs".into(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(Error::IoUnreadable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
