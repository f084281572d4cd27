//! Poll an external condition until it holds, a deadline passes, or an
//! attempt budget runs out.
//!
//! Used by the launch orchestrator to wait for units and hosts, and by the
//! health monitor for its retry burst against the peer.

use crate::clock::{self, Clock};
use crate::error::PollError;
use std::future::Future;
use std::time::Duration;
use tracing::trace;

/// How long and how often to poll
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    /// Delay between checks
    pub interval: Duration,
    /// Give up once this much clock time has passed since the first check
    pub timeout: Option<Duration>,
    /// Give up after this many checks
    pub max_attempts: Option<u32>,
}

impl PollPolicy {
    /// Poll every `interval` until `timeout` has elapsed
    pub fn deadline(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout: Some(timeout),
            max_attempts: None,
        }
    }

    /// Make at most `attempts` checks, `interval` apart
    pub fn attempts(attempts: u32, interval: Duration) -> Self {
        Self {
            interval,
            timeout: None,
            max_attempts: Some(attempts.max(1)),
        }
    }
}

/// Repeatedly run `check` until it yields `Some`.
///
/// A check error aborts the wait immediately. The condition is always checked
/// at least once, and once more at the deadline, so a condition that becomes
/// true exactly at the deadline is still observed.
pub async fn poll_until<T, F, Fut>(
    clock: &dyn Clock,
    policy: PollPolicy,
    what: &str,
    mut check: F,
) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<Option<T>>>,
{
    let start = clock.now();
    let deadline = policy.timeout.map(|t| clock::add(start, t));
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if let Some(value) = check().await.map_err(PollError::Check)? {
            return Ok(value);
        }
        trace!(what, attempts, "condition not met yet");

        if let Some(max) = policy.max_attempts {
            if attempts >= max {
                return Err(PollError::Exhausted {
                    what: what.to_string(),
                    attempts,
                });
            }
        }

        if let Some(deadline) = deadline {
            let now = clock.now();
            if now >= deadline {
                let waited = (now - start).to_std().unwrap_or_default();
                return Err(PollError::Timeout {
                    what: what.to_string(),
                    waited,
                });
            }
            let remaining = (deadline - now).to_std().unwrap_or_default();
            clock.sleep(policy.interval.min(remaining)).await;
        } else {
            clock.sleep(policy.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_returns_first_success() {
        let clock = ManualClock::starting_now();
        let calls = AtomicU32::new(0);
        let result = poll_until(
            clock.as_ref(),
            PollPolicy::deadline(Duration::from_secs(3), Duration::from_secs(300)),
            "third call",
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok((n == 3).then_some(n))
            },
        )
        .await
        .unwrap();
        assert_eq!(result, 3);
    }

    #[tokio::test]
    async fn test_deadline_is_enforced_in_clock_time() {
        let clock = ManualClock::starting_now();
        let start = clock.now();
        let err = poll_until(
            clock.as_ref(),
            PollPolicy::deadline(Duration::from_secs(3), Duration::from_secs(300)),
            "never",
            || async { Ok(None::<()>) },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PollError::Timeout { .. }));
        assert_eq!((clock.now() - start).num_seconds(), 300);
    }

    #[tokio::test]
    async fn test_attempt_budget() {
        let clock = ManualClock::starting_now();
        let calls = AtomicU32::new(0);
        let err = poll_until(
            clock.as_ref(),
            PollPolicy::attempts(5, Duration::from_secs(1)),
            "peer health",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(None::<()>)
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PollError::Exhausted { attempts: 5, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_check_error_aborts() {
        let clock = ManualClock::starting_now();
        let calls = AtomicU32::new(0);
        let err = poll_until(
            clock.as_ref(),
            PollPolicy::deadline(Duration::from_secs(1), Duration::from_secs(60)),
            "broken",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Option<()>, _>(anyhow::anyhow!("api down"))
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PollError::Check(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
