//! Time source shared by every waiting loop
//!
//! Components never call `tokio::time::sleep` or `Utc::now` directly; they go
//! through a [`Clock`] so tests can run multi-minute waits instantly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the caller for `duration`
    async fn sleep(&self, duration: Duration);
}

pub type SharedClock = Arc<dyn Clock>;

/// Real time backed by tokio's timer
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Simulated time. `sleep` advances the clock and yields to the scheduler
/// instead of waiting.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(start),
        })
    }

    /// Start at the current wall-clock time
    pub fn starting_now() -> Arc<Self> {
        Self::new(Utc::now())
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock();
        *now = add(*now, duration);
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// Milliseconds since the Unix epoch, as stored in the database
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Upper bound for any single offset, keeps date arithmetic in range
const MAX_OFFSET_MS: u128 = 100 * 365 * 24 * 3600 * 1000;

pub fn add(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    at + chrono::Duration::milliseconds(duration.as_millis().min(MAX_OFFSET_MS) as i64)
}
