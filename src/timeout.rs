//! Per-try and global deadlines, plus the one-shot timer they run on.

use crate::headers::Headers;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Name of the header overriding the route's global timeout, in milliseconds.
pub const GLOBAL_TIMEOUT_HEADER: &str = "x-mesh-global-timeout-ms";

/// Name of the header overriding the route's per-try timeout, in milliseconds.
pub const PER_TRY_TIMEOUT_HEADER: &str = "x-mesh-try-timeout-ms";

/// Route-level timeout configuration. Zero disables the corresponding timer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    /// Overall deadline across all upstream attempts, in milliseconds.
    #[serde(default = "default_global_timeout_ms")]
    pub global_timeout_ms: u64,
    /// Deadline for a single upstream attempt, in milliseconds.
    #[serde(default)]
    pub per_try_timeout_ms: u64,
}

fn default_global_timeout_ms() -> u64 {
    30_000
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            global_timeout_ms: default_global_timeout_ms(),
            per_try_timeout_ms: 0,
        }
    }
}

/// Resolved deadlines for one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyTimeout {
    /// Overall deadline across all attempts. Zero means unbounded.
    pub global: Duration,
    /// Deadline for a single attempt. Zero means unbounded.
    pub per_try: Duration,
}

impl ProxyTimeout {
    /// Builds the stream's deadlines from the route policy overlaid with
    /// header hints. A malformed header value falls back to the route.
    pub fn parse(policy: &TimeoutPolicy, headers: &Headers) -> Self {
        let global = header_ms(headers, GLOBAL_TIMEOUT_HEADER).unwrap_or(policy.global_timeout_ms);
        let per_try = header_ms(headers, PER_TRY_TIMEOUT_HEADER).unwrap_or(policy.per_try_timeout_ms);

        Self {
            global: Duration::from_millis(global),
            per_try: Duration::from_millis(per_try),
        }
    }
}

fn header_ms(headers: &Headers, name: &str) -> Option<u64> {
    headers.get(name).and_then(|v| v.parse::<u64>().ok())
}

/// A cancellable one-shot timer bound to the current `LocalSet`.
///
/// The callback runs at most once. `stop` is idempotent and guarantees the
/// callback never runs afterwards, even if the fire task was already
/// scheduled; dropping the timer stops it.
pub struct Timer {
    armed: Rc<Cell<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    /// Arms a timer that invokes `callback` after `delay`.
    pub fn spawn(delay: Duration, callback: impl FnOnce() + 'static) -> Self {
        let armed = Rc::new(Cell::new(true));
        let flag = Rc::clone(&armed);

        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            if flag.replace(false) {
                callback();
            }
        });

        Self {
            armed,
            handle: Some(handle),
        }
    }

    /// Disarms the timer. Safe to call multiple times.
    pub fn stop(&mut self) {
        self.armed.set(false);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults_from_policy() {
        let policy = TimeoutPolicy {
            global_timeout_ms: 1000,
            per_try_timeout_ms: 200,
        };
        let timeout = ProxyTimeout::parse(&policy, &Headers::new());

        assert_eq!(timeout.global, Duration::from_millis(1000));
        assert_eq!(timeout.per_try, Duration::from_millis(200));
    }

    #[test]
    fn test_parse_header_override() {
        let policy = TimeoutPolicy::default();
        let headers = Headers::from([
            (GLOBAL_TIMEOUT_HEADER, "750"),
            (PER_TRY_TIMEOUT_HEADER, "50"),
        ]);
        let timeout = ProxyTimeout::parse(&policy, &headers);

        assert_eq!(timeout.global, Duration::from_millis(750));
        assert_eq!(timeout.per_try, Duration::from_millis(50));
    }

    #[test]
    fn test_parse_malformed_header_falls_back() {
        let policy = TimeoutPolicy {
            global_timeout_ms: 1000,
            per_try_timeout_ms: 0,
        };
        let headers = Headers::from([(GLOBAL_TIMEOUT_HEADER, "soon")]);
        let timeout = ProxyTimeout::parse(&policy, &headers);

        assert_eq!(timeout.global, Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let fired = Rc::new(Cell::new(0u32));
                let count = Rc::clone(&fired);
                let _timer = Timer::spawn(Duration::from_millis(10), move || {
                    count.set(count.get() + 1);
                });

                tokio::time::sleep(Duration::from_millis(20)).await;
                assert_eq!(fired.get(), 1);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_stop_prevents_fire() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let fired = Rc::new(Cell::new(false));
                let flag = Rc::clone(&fired);
                let mut timer = Timer::spawn(Duration::from_millis(10), move || {
                    flag.set(true);
                });

                timer.stop();
                timer.stop();

                tokio::time::sleep(Duration::from_millis(20)).await;
                assert!(!fired.get());
            })
            .await;
    }
}
