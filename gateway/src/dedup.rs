use crate::metrics_defs::{DEDUP_DUPLICATES, DEDUP_UNAVAILABLE};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

/// Outcome of a dedup claim. `Unavailable` means the store could not answer
/// within its deadline and the gateway degrades open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    Fresh,
    Duplicate,
    Unavailable,
}

#[derive(thiserror::Error, Debug)]
pub enum DedupError {
    #[error("dedup store error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Atomic set-if-absent keyed store. `true` means the key was newly set.
#[async_trait]
pub trait DedupBackend: Send + Sync {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, DedupError>;
}

pub struct RedisDedup {
    conn: ConnectionManager,
}

impl RedisDedup {
    pub async fn connect(url: &str) -> Result<Self, DedupError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(RedisDedup { conn })
    }
}

#[async_trait]
impl DedupBackend for RedisDedup {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, DedupError> {
        let mut conn = self.conn.clone();
        // SET key 1 NX EX ttl; true when the key was set, false when it
        // already existed.
        let was_set: bool = conn
            .set_options(
                key,
                "1",
                redis::SetOptions::default()
                    .conditional_set(redis::ExistenceCheck::NX)
                    .with_expiration(redis::SetExpiry::EX(ttl.as_secs().max(1))),
            )
            .await?;
        Ok(was_set)
    }
}

/// Tenant-scoped dedup claims with a hard per-call deadline.
///
/// The redirect SLO and "never lose data" both outrank perfect dedup, so a
/// slow or unreachable store degrades open: the click is treated as fresh
/// and never tagged. A circuit breaker keeps a dead store from costing the
/// deadline on every request.
pub struct DedupCache {
    backend: Arc<dyn DedupBackend>,
    ttl: Duration,
    deadline: Duration,
    breaker: CircuitBreaker,
}

impl DedupCache {
    pub fn new(backend: Arc<dyn DedupBackend>, ttl: Duration, deadline: Duration) -> Self {
        DedupCache {
            backend,
            ttl,
            deadline,
            breaker: CircuitBreaker::new(5, Duration::from_secs(10)),
        }
    }

    /// Claims `(tenant_id, click_id)` within the dedup window. At most one
    /// caller per key receives `Fresh` while the key lives.
    pub async fn claim(&self, tenant_id: &str, click_id: &str) -> ClaimOutcome {
        if !self.breaker.allow() {
            metrics::counter!(DEDUP_UNAVAILABLE.name).increment(1);
            tracing::warn!(tenant_id, "dedup circuit open, treating click as fresh");
            return ClaimOutcome::Unavailable;
        }

        let key = format!("dedup:{tenant_id}:{click_id}");
        match timeout(self.deadline, self.backend.set_if_absent(&key, self.ttl)).await {
            Ok(Ok(true)) => {
                self.breaker.record_success();
                ClaimOutcome::Fresh
            }
            Ok(Ok(false)) => {
                self.breaker.record_success();
                metrics::counter!(DEDUP_DUPLICATES.name, "tenant_id" => tenant_id.to_string())
                    .increment(1);
                ClaimOutcome::Duplicate
            }
            Ok(Err(e)) => {
                self.breaker.record_failure();
                metrics::counter!(DEDUP_UNAVAILABLE.name).increment(1);
                tracing::warn!(tenant_id, error = %e, "dedup claim failed, treating click as fresh");
                ClaimOutcome::Unavailable
            }
            Err(_) => {
                self.breaker.record_failure();
                metrics::counter!(DEDUP_UNAVAILABLE.name).increment(1);
                tracing::warn!(tenant_id, "dedup claim deadline expired, treating click as fresh");
                ClaimOutcome::Unavailable
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Minimal circuit breaker: opens after a run of failures, lets a single
/// probe through once the open window has elapsed.
struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    open_for: Duration,
}

impl CircuitBreaker {
    fn new(failure_threshold: u32, open_for: Duration) -> Self {
        CircuitBreaker {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            failure_threshold,
            open_for,
        }
    }

    fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.open_for)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = BreakerState::HalfOpen;
                    tracing::info!("dedup circuit half-open, probing");
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            tracing::info!("dedup circuit closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        if inner.state == BreakerState::HalfOpen
            || inner.consecutive_failures >= self.failure_threshold
        {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{FailingDedup, InMemoryDedup};

    fn cache(backend: Arc<dyn DedupBackend>) -> DedupCache {
        DedupCache::new(backend, Duration::from_secs(5), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn first_claim_is_fresh_then_duplicate() {
        let cache = cache(Arc::new(InMemoryDedup::new()));

        assert_eq!(cache.claim("org_A", "dup1").await, ClaimOutcome::Fresh);
        assert_eq!(cache.claim("org_A", "dup1").await, ClaimOutcome::Duplicate);
    }

    #[tokio::test]
    async fn claims_are_namespaced_by_tenant() {
        let cache = cache(Arc::new(InMemoryDedup::new()));

        assert_eq!(cache.claim("org_A", "x").await, ClaimOutcome::Fresh);
        assert_eq!(
            cache.claim("org_B", "x").await,
            ClaimOutcome::Fresh,
            "a claim in one tenant must never affect another"
        );
    }

    #[tokio::test]
    async fn expired_window_allows_a_new_fresh_claim() {
        let backend = Arc::new(InMemoryDedup::new());
        let cache = DedupCache::new(
            backend.clone(),
            Duration::from_millis(20),
            Duration::from_millis(50),
        );

        assert_eq!(cache.claim("org_A", "x").await, ClaimOutcome::Fresh);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.claim("org_A", "x").await, ClaimOutcome::Fresh);
    }

    #[tokio::test]
    async fn slow_store_degrades_open() {
        // Backend sleeps past the 50ms deadline.
        let cache = cache(Arc::new(FailingDedup::slow(Duration::from_millis(500))));
        assert_eq!(cache.claim("org_A", "x").await, ClaimOutcome::Unavailable);
    }

    #[tokio::test]
    async fn breaker_opens_after_consecutive_failures() {
        let backend = Arc::new(FailingDedup::erroring());
        let cache = DedupCache::new(
            backend.clone(),
            Duration::from_secs(5),
            Duration::from_millis(50),
        );

        for _ in 0..5 {
            assert_eq!(cache.claim("org_A", "x").await, ClaimOutcome::Unavailable);
        }
        assert_eq!(backend.calls(), 5);

        // Circuit is now open; the backend must not be consulted again.
        assert_eq!(cache.claim("org_A", "x").await, ClaimOutcome::Unavailable);
        assert_eq!(backend.calls(), 5);
    }

    #[tokio::test]
    async fn breaker_probes_and_recovers() {
        let backend = Arc::new(FailingDedup::erroring());
        let cache = DedupCache {
            backend: backend.clone(),
            ttl: Duration::from_secs(5),
            deadline: Duration::from_millis(50),
            breaker: CircuitBreaker::new(2, Duration::from_millis(20)),
        };

        let _ = cache.claim("org_A", "a").await;
        let _ = cache.claim("org_A", "b").await;
        assert!(!cache.breaker.allow(), "breaker should be open");

        tokio::time::sleep(Duration::from_millis(30)).await;
        backend.set_healthy();
        assert_eq!(cache.claim("org_A", "c").await, ClaimOutcome::Fresh);
        assert_eq!(cache.claim("org_A", "c").await, ClaimOutcome::Duplicate);
    }
}
