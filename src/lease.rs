//! Distributed mutual exclusion with TTL-based abandonment recovery
//!
//! A lease is granted by a conditional write: it succeeds when no record
//! exists for the key or the existing record has expired. Expired leases are
//! reclaimed by the next acquirer, never by a sweeper, so the TTL is the only
//! thing that frees a lease whose holder crashed.

use crate::clock::{self, SharedClock};
use crate::db::Database;
use crate::name::WorkloadName;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Lease keys. Launch coordination and fleet evaluation live in disjoint
/// namespaces so they never contend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LeaseKey {
    /// Serializes launches of one workload
    Launch(WorkloadName),
    /// Serializes fleet evaluations
    FleetEvaluation,
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseKey::Launch(name) => write!(f, "launch/{}", name),
            LeaseKey::FleetEvaluation => f.write_str("fleet/evaluation"),
        }
    }
}

/// A granted lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result of an acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Granted(Lease),
    /// Someone else holds an unexpired lease
    InProgress,
}

impl LeaseOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, LeaseOutcome::Granted(_))
    }

    /// Why the lease was not granted
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            LeaseOutcome::Granted(_) => None,
            LeaseOutcome::InProgress => Some("in progress"),
        }
    }
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Atomically take the lease for `key` on behalf of `holder`
    async fn acquire(&self, key: &LeaseKey, holder: &str, ttl: Duration) -> anyhow::Result<LeaseOutcome>;

    /// Give the lease back. Best-effort: failures are logged, and a lease
    /// that could not be released simply expires.
    async fn release(&self, key: &LeaseKey, holder: &str);

    /// Whether an unexpired lease exists for `key`
    async fn is_held(&self, key: &LeaseKey) -> anyhow::Result<bool>;
}

pub type SharedLeaseStore = Arc<dyn LeaseStore>;

/// A granted lease that is given back when the guard goes away.
///
/// `release` returns it explicitly. If the owning future is dropped first,
/// for example because the client disconnected, the release is spawned onto
/// the runtime so the key does not stay blocked until the TTL runs out.
pub struct LeaseGuard {
    leases: SharedLeaseStore,
    key: LeaseKey,
    holder: String,
    armed: bool,
}

impl LeaseGuard {
    pub fn new(leases: SharedLeaseStore, key: LeaseKey, holder: impl Into<String>) -> Self {
        Self {
            leases,
            key,
            holder: holder.into(),
            armed: true,
        }
    }

    pub async fn release(mut self) {
        self.leases.release(&self.key, &self.holder).await;
        self.armed = false;
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let key = self.key.clone();
        let holder = std::mem::take(&mut self.holder);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(key = %key, holder = %holder, "Lease dropped while held, releasing");
                let leases = Arc::clone(&self.leases);
                handle.spawn(async move { leases.release(&key, &holder).await });
            }
            Err(_) => warn!(key = %key, holder = %holder, "Lease dropped outside a runtime, it will expire"),
        }
    }
}

/// Lease store on the shared SQLite database
pub struct SqliteLeaseStore {
    db: Database,
    clock: SharedClock,
}

impl SqliteLeaseStore {
    pub fn new(db: Database, clock: SharedClock) -> Self {
        Self { db, clock }
    }
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn acquire(&self, key: &LeaseKey, holder: &str, ttl: Duration) -> anyhow::Result<LeaseOutcome> {
        let key = key.to_string();
        let now = self.clock.now();
        let expires_at = clock::add(now, ttl);

        let granted = self.db.try_acquire_lease(
            &key,
            holder,
            clock::to_millis(now),
            clock::to_millis(expires_at),
        )?;

        if granted {
            debug!(key, holder, ttl_secs = ttl.as_secs(), "Lease granted");
            Ok(LeaseOutcome::Granted(Lease {
                key,
                holder: holder.to_string(),
                acquired_at: now,
                expires_at,
            }))
        } else {
            debug!(key, holder, "Lease held by another caller");
            Ok(LeaseOutcome::InProgress)
        }
    }

    async fn release(&self, key: &LeaseKey, holder: &str) {
        let key = key.to_string();
        match self.db.release_lease(&key, holder) {
            Ok(true) => debug!(key, holder, "Lease released"),
            Ok(false) => debug!(key, holder, "Lease already expired or taken over"),
            Err(e) => warn!(key, holder, error = %e, "Failed to release lease, it will expire"),
        }
    }

    async fn is_held(&self, key: &LeaseKey) -> anyhow::Result<bool> {
        let now = clock::to_millis(self.clock.now());
        Ok(self
            .db
            .get_lease(&key.to_string())?
            .map(|lease| lease.expires_at_ms > now)
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn demo() -> LeaseKey {
        LeaseKey::Launch(WorkloadName::parse("demo").unwrap())
    }

    fn store(clock: Arc<ManualClock>) -> SqliteLeaseStore {
        SqliteLeaseStore::new(Database::open_in_memory().unwrap(), clock)
    }

    #[test]
    fn test_key_namespaces_are_disjoint() {
        assert_eq!(demo().to_string(), "launch/demo");
        assert_eq!(LeaseKey::FleetEvaluation.to_string(), "fleet/evaluation");
        // A workload cannot be named so that its key collides with the fleet key
        assert!(WorkloadName::parse("evaluation").is_ok());
        assert_ne!(
            LeaseKey::Launch(WorkloadName::parse("evaluation").unwrap()).to_string(),
            LeaseKey::FleetEvaluation.to_string()
        );
    }

    #[tokio::test]
    async fn test_second_acquire_is_in_progress() {
        let clock = ManualClock::starting_now();
        let leases = store(clock);
        let ttl = Duration::from_secs(900);

        let first = leases.acquire(&demo(), "a", ttl).await.unwrap();
        assert!(first.is_granted());
        let second = leases.acquire(&demo(), "b", ttl).await.unwrap();
        assert_eq!(second, LeaseOutcome::InProgress);
        assert_eq!(second.reason(), Some("in progress"));
        assert!(leases.is_held(&demo()).await.unwrap());
    }

    #[tokio::test]
    async fn test_abandoned_lease_is_taken_over_after_ttl() {
        let clock = ManualClock::starting_now();
        let leases = store(clock.clone());
        let ttl = Duration::from_secs(900);

        assert!(leases.acquire(&demo(), "crashed", ttl).await.unwrap().is_granted());

        clock.advance(Duration::from_secs(899));
        assert!(!leases.acquire(&demo(), "b", ttl).await.unwrap().is_granted());

        clock.advance(Duration::from_secs(2));
        assert!(!leases.is_held(&demo()).await.unwrap());
        let outcome = leases.acquire(&demo(), "b", ttl).await.unwrap();
        match outcome {
            LeaseOutcome::Granted(lease) => {
                assert_eq!(lease.holder, "b");
                assert_eq!(lease.key, "launch/demo");
            }
            LeaseOutcome::InProgress => panic!("expired lease should be reclaimed"),
        }
    }

    #[tokio::test]
    async fn test_release_frees_the_key() {
        let clock = ManualClock::starting_now();
        let leases = store(clock);
        let ttl = Duration::from_secs(300);

        assert!(leases.acquire(&LeaseKey::FleetEvaluation, "a", ttl).await.unwrap().is_granted());
        leases.release(&LeaseKey::FleetEvaluation, "a").await;
        assert!(!leases.is_held(&LeaseKey::FleetEvaluation).await.unwrap());
        assert!(leases.acquire(&LeaseKey::FleetEvaluation, "b", ttl).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_lease() {
        let clock = ManualClock::starting_now();
        let leases: SharedLeaseStore = Arc::new(store(clock));
        let ttl = Duration::from_secs(900);

        assert!(leases.acquire(&demo(), "a", ttl).await.unwrap().is_granted());
        drop(LeaseGuard::new(leases.clone(), demo(), "a"));

        for _ in 0..10 {
            if !leases.is_held(&demo()).await.unwrap() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!leases.is_held(&demo()).await.unwrap());
    }

    #[tokio::test]
    async fn test_released_guard_does_not_release_again() {
        let clock = ManualClock::starting_now();
        let leases: SharedLeaseStore = Arc::new(store(clock));
        let ttl = Duration::from_secs(900);

        assert!(leases.acquire(&demo(), "a", ttl).await.unwrap().is_granted());
        LeaseGuard::new(leases.clone(), demo(), "a").release().await;
        assert!(leases.acquire(&demo(), "b", ttl).await.unwrap().is_granted());
        tokio::task::yield_now().await;
        assert!(leases.is_held(&demo()).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_holder_cannot_release_new_lease() {
        let clock = ManualClock::starting_now();
        let leases = store(clock.clone());
        let ttl = Duration::from_secs(60);

        assert!(leases.acquire(&demo(), "old", ttl).await.unwrap().is_granted());
        clock.advance(Duration::from_secs(61));
        assert!(leases.acquire(&demo(), "new", ttl).await.unwrap().is_granted());

        leases.release(&demo(), "old").await;
        assert!(leases.is_held(&demo()).await.unwrap());
    }
}
