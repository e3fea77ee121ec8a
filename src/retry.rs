//! Retry policy and the per-stream retry state machine.
//!
//! A route carries a [`RetryPolicy`]; each stream derives a [`RetryState`]
//! from it. The engine asks the state for a verdict on every upstream
//! response or reset, and on `ShouldRetry` the state schedules the resume
//! callback after a policy-determined back-off (which may be zero).

use crate::codec::{StreamResetReason, STATUS_HEADER};
use crate::headers::Headers;
use crate::timeout::Timer;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Request header that disables retries for a single stream.
pub const RETRY_ON_HEADER: &str = "x-mesh-retry-on";

/// Configuration for retry behavior, attached to a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (excluding the initial request).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay between retries, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay between retries, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    #[serde(default = "default_use_jitter")]
    pub use_jitter: bool,
    /// Response status codes that should trigger a retry.
    #[serde(default = "default_retryable_status_codes")]
    pub retryable_status_codes: Vec<u16>,
    /// Whether upstream resets (connect failures, terminations, per-try
    /// timeouts) should trigger a retry.
    #[serde(default = "default_retry_on_reset")]
    pub retry_on_reset: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_use_jitter() -> bool {
    true
}

fn default_retryable_status_codes() -> Vec<u16> {
    vec![502, 503, 504]
}

fn default_retry_on_reset() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            use_jitter: default_use_jitter(),
            retryable_status_codes: default_retryable_status_codes(),
            retry_on_reset: default_retry_on_reset(),
        }
    }
}

impl RetryPolicy {
    /// Creates a retry policy with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Sets the maximum number of retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the base delay between retries.
    pub fn with_base_delay_ms(mut self, delay_ms: u64) -> Self {
        self.base_delay_ms = delay_ms;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, use_jitter: bool) -> Self {
        self.use_jitter = use_jitter;
        self
    }

    /// Sets the response status codes that should trigger a retry.
    pub fn with_retryable_status_codes(mut self, codes: Vec<u16>) -> Self {
        self.retryable_status_codes = codes;
        self
    }

    /// Enables or disables retries on upstream resets.
    pub fn with_retry_on_reset(mut self, retry: bool) -> Self {
        self.retry_on_reset = retry;
        self
    }

    /// Checks if a status code should trigger a retry.
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    /// Checks if a reset reason should trigger a retry.
    pub fn is_retryable_reset(&self, reason: StreamResetReason) -> bool {
        if !self.retry_on_reset {
            return false;
        }
        !matches!(reason, StreamResetReason::Overflow)
    }
}

/// Verdict on whether a failure or response warrants another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    /// Do not retry; process the event normally.
    NoRetry,
    /// A retry was scheduled; abandon the failing event.
    ShouldRetry,
    /// The event would retry but the budget is spent. Sticky.
    RetryOverflow,
}

/// Per-stream retry bookkeeping.
pub struct RetryState {
    policy: RetryPolicy,
    attempts: u32,
    retry_on: bool,
    overflowed: bool,
    backoff: Option<Timer>,
}

impl RetryState {
    /// Builds retry state for one stream. The request may opt out via
    /// [`RETRY_ON_HEADER`].
    pub fn new(policy: &RetryPolicy, request_headers: &Headers) -> Self {
        let header_opt_out = request_headers
            .get(RETRY_ON_HEADER)
            .is_some_and(|v| v.eq_ignore_ascii_case("false"));

        Self {
            retry_on: policy.max_retries > 0 && !header_opt_out,
            policy: policy.clone(),
            attempts: 0,
            overflowed: false,
            backoff: None,
        }
    }

    /// True while a retry is still possible given what is buffered.
    pub fn retry_on(&self) -> bool {
        self.retry_on
    }

    /// Number of retries consumed so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Decides whether the given response headers or reset reason warrant a
    /// retry. On `ShouldRetry` the `resume` callback is scheduled on the
    /// current context after the back-off delay.
    pub fn retry(
        &mut self,
        response_headers: Option<&Headers>,
        reset_reason: Option<StreamResetReason>,
        resume: impl FnOnce() + 'static,
    ) -> RetryVerdict {
        if self.overflowed || !self.retry_on {
            return RetryVerdict::NoRetry;
        }

        let wants_retry = match (response_headers, reset_reason) {
            (Some(headers), _) => headers
                .get(STATUS_HEADER)
                .and_then(|v| v.parse::<u16>().ok())
                .is_some_and(|status| self.policy.is_retryable_status(status)),
            (None, Some(reason)) => self.policy.is_retryable_reset(reason),
            (None, None) => false,
        };

        if !wants_retry {
            return RetryVerdict::NoRetry;
        }

        if self.attempts >= self.policy.max_retries {
            self.overflowed = true;
            return RetryVerdict::RetryOverflow;
        }

        let delay = self.next_delay();
        self.attempts += 1;

        debug!(
            attempt = self.attempts,
            max_retries = self.policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            "scheduling retry"
        );

        if let Some(mut previous) = self.backoff.take() {
            previous.stop();
        }
        self.backoff = Some(Timer::spawn(delay, resume));

        RetryVerdict::ShouldRetry
    }

    /// Back-off delay for the next attempt.
    fn next_delay(&self) -> Duration {
        let base_ms = self.policy.base_delay_ms as f64;
        let multiplier = self.policy.backoff_multiplier.powi(self.attempts as i32);
        let delay_ms = (base_ms * multiplier).min(self.policy.max_delay_ms as f64);

        let delay_ms = if self.policy.use_jitter && delay_ms > 0.0 {
            delay_ms * rand::thread_rng().gen_range(0.5..1.5)
        } else {
            delay_ms
        };

        Duration::from_millis(delay_ms as u64)
    }

    /// Cancels any pending back-off and marks further retries impossible:
    /// once a response is being forwarded downstream it cannot be replayed.
    pub fn reset(&mut self) {
        self.retry_on = false;
        if let Some(mut backoff) = self.backoff.take() {
            backoff.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn policy_no_jitter() -> RetryPolicy {
        RetryPolicy::new().with_jitter(false).with_base_delay_ms(0)
    }

    #[test]
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert!(policy.is_retryable_status(502));
        assert!(!policy.is_retryable_status(200));
        assert!(policy.is_retryable_reset(StreamResetReason::ConnectionFailure));
        assert!(!policy.is_retryable_reset(StreamResetReason::Overflow));
    }

    #[test]
    fn test_no_retry_on_success_status() {
        let mut state = RetryState::new(&policy_no_jitter(), &Headers::new());
        let headers = Headers::from([(STATUS_HEADER, "200")]);

        let verdict = state.retry(Some(&headers), None, || {});
        assert_eq!(verdict, RetryVerdict::NoRetry);
        assert_eq!(state.attempts(), 0);
    }

    #[test]
    fn test_header_opt_out() {
        let request = Headers::from([(RETRY_ON_HEADER, "false")]);
        let mut state = RetryState::new(&policy_no_jitter(), &request);
        let headers = Headers::from([(STATUS_HEADER, "503")]);

        assert_eq!(state.retry(Some(&headers), None, || {}), RetryVerdict::NoRetry);
    }

    #[test]
    fn test_disabled_policy() {
        let mut state = RetryState::new(&RetryPolicy::disabled(), &Headers::new());
        assert!(!state.retry_on());
        assert_eq!(
            state.retry(None, Some(StreamResetReason::ConnectionFailure), || {}),
            RetryVerdict::NoRetry
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_and_sticky_overflow() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let policy = policy_no_jitter().with_max_retries(1);
                let mut state = RetryState::new(&policy, &Headers::new());
                let bad = Headers::from([(STATUS_HEADER, "503")]);

                assert_eq!(
                    state.retry(Some(&bad), None, || {}),
                    RetryVerdict::ShouldRetry
                );
                assert_eq!(
                    state.retry(Some(&bad), None, || {}),
                    RetryVerdict::RetryOverflow
                );
                // Overflow is sticky.
                assert_eq!(state.retry(Some(&bad), None, || {}), RetryVerdict::NoRetry);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_scheduled_on_should_retry() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut state = RetryState::new(&policy_no_jitter(), &Headers::new());
                let resumed = Rc::new(Cell::new(false));
                let flag = Rc::clone(&resumed);

                let verdict = state.retry(None, Some(StreamResetReason::ConnectionFailure), move || {
                    flag.set(true);
                });
                assert_eq!(verdict, RetryVerdict::ShouldRetry);
                assert!(!resumed.get());

                tokio::time::sleep(Duration::from_millis(1)).await;
                assert!(resumed.get());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_cancels_pending_resume() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let policy = policy_no_jitter().with_base_delay_ms(50);
                let mut state = RetryState::new(&policy, &Headers::new());
                let resumed = Rc::new(Cell::new(false));
                let flag = Rc::clone(&resumed);

                state.retry(None, Some(StreamResetReason::ConnectionFailure), move || {
                    flag.set(true);
                });
                state.reset();

                tokio::time::sleep(Duration::from_millis(100)).await;
                assert!(!resumed.get());
                assert!(!state.retry_on());
            })
            .await;
    }
}
