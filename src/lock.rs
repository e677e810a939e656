//! Leased distributed mutual exclusion
//!
//! A lock is the string key `ged_L:<name>` holding the holder's token, created
//! with `SET NX EX` and removed by a compare-and-delete script. Holders never
//! renew: a crashed holder lets the lease lapse. Failing to acquire is a
//! normal outcome, reported as [`Acquisition::NotAcquired`], not an error.

use crate::metrics::Metrics;
use crate::router::ShardRouter;
use crate::storage::RemoteStore;
use crate::{Result, StoreError};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub const LOCK_KEY_PREFIX: &str = "ged_L:";

/// Last token handed out in this process
static LAST_TOKEN: AtomicI64 = AtomicI64::new(0);

/// Holder identity stored as the lock value: a nanosecond timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockToken(i64);

impl LockToken {
    /// A fresh token, strictly greater than any earlier one from this process
    pub fn generate() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        let previous = LAST_TOKEN
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        Self(now.max(previous + 1))
    }

    pub fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }

    fn encode(self) -> Vec<u8> {
        itoa::Buffer::new().format(self.0).as_bytes().to_vec()
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of an acquire attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Acquisition {
    Acquired(LockToken),
    NotAcquired,
}

impl Acquisition {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }

    pub fn token(&self) -> Option<LockToken> {
        match self {
            Self::Acquired(token) => Some(*token),
            Self::NotAcquired => None,
        }
    }
}

/// Remote key of the lock named `key`
pub fn lock_key(key: &str) -> String {
    format!("{LOCK_KEY_PREFIX}{key}")
}

/// Try to take the lock named `key` on a specific store
pub async fn acquire_on<S: RemoteStore>(
    store: &S,
    key: &str,
    ttl_secs: u64,
) -> std::result::Result<Acquisition, StoreError> {
    let token = LockToken::generate();
    let created = store
        .set_nx_ex(&lock_key(key), &token.encode(), ttl_secs.max(1))
        .await?;
    debug!(%key, %token, acquired = created, "acquire lock");
    Ok(if created {
        Acquisition::Acquired(token)
    } else {
        Acquisition::NotAcquired
    })
}

/// Release the lock named `key` if it still holds `token`
pub async fn release_on<S: RemoteStore>(
    store: &S,
    key: &str,
    token: LockToken,
) -> std::result::Result<bool, StoreError> {
    let released = store
        .compare_and_delete(&lock_key(key), &token.encode())
        .await?;
    if released {
        debug!(%key, %token, "lock released");
    } else {
        warn!(%key, %token, "lock release: lease expired or held by another token");
    }
    Ok(released)
}

/// Named locks, each living on the shard its name routes to
pub struct DistributedLock<S> {
    router: Arc<ShardRouter<S>>,
    metrics: Arc<Metrics>,
}

impl<S: RemoteStore> DistributedLock<S> {
    pub fn new(router: Arc<ShardRouter<S>>, metrics: Arc<Metrics>) -> Self {
        Self { router, metrics }
    }

    /// Take the lock for `ttl_secs` seconds, or report it as held
    pub async fn acquire(&self, key: &str, ttl_secs: u64) -> Result<Acquisition> {
        let store = self.router.route(key).store();
        let acquisition = acquire_on(store, key, ttl_secs)
            .await
            .inspect_err(|_| self.metrics.store_errors.inc())?;
        if acquisition.is_acquired() {
            self.metrics.lock_acquired.inc();
        } else {
            self.metrics.lock_contended.inc();
        }
        Ok(acquisition)
    }

    /// Delete the lock only if `token` still holds it
    pub async fn release(&self, key: &str, token: LockToken) -> Result<bool> {
        let store = self.router.route(key).store();
        let released = release_on(store, key, token)
            .await
            .inspect_err(|_| self.metrics.store_errors.inc())?;
        if released {
            self.metrics.lock_released.inc();
        } else {
            self.metrics.lock_release_lost.inc();
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardConfig;
    use crate::storage::MemoryStore;
    use std::time::Duration;

    fn lock_over(store: &MemoryStore) -> DistributedLock<MemoryStore> {
        let router = ShardRouter::new(vec![(ShardConfig::default(), store.clone())]).unwrap();
        DistributedLock::new(Arc::new(router), Arc::new(Metrics::new()))
    }

    #[test]
    fn test_tokens_are_unique_and_increasing() {
        let mut last = LockToken::generate();
        for _ in 0..1000 {
            let next = LockToken::generate();
            assert!(next > last);
            last = next;
        }
    }

    #[tokio::test]
    async fn test_lock_key_layout() {
        let store = MemoryStore::new();
        let lock = lock_over(&store);

        let token = lock.acquire("orders", 5).await.unwrap().token().unwrap();
        let stored = store.get("ged_L:orders").unwrap();
        assert_eq!(stored, token.to_string().as_bytes());
    }

    #[tokio::test]
    async fn test_second_acquire_not_acquired() {
        let store = MemoryStore::new();
        let lock = lock_over(&store);

        assert!(lock.acquire("k", 5).await.unwrap().is_acquired());
        assert_eq!(lock.acquire("k", 5).await.unwrap(), Acquisition::NotAcquired);
        assert!(lock.acquire("other", 5).await.unwrap().is_acquired());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exactly_one_concurrent_winner() {
        let store = MemoryStore::new();
        let lock = Arc::new(lock_over(&store));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let lock = Arc::clone(&lock);
                tokio::spawn(async move { lock.acquire("contended", 30).await.unwrap() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_acquired() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(lock.metrics.lock_contended.get(), 31);
    }

    #[tokio::test]
    async fn test_release_then_reacquire() {
        let store = MemoryStore::new();
        let lock = lock_over(&store);

        let token = lock.acquire("k", 5).await.unwrap().token().unwrap();
        assert!(lock.release("k", token).await.unwrap());
        assert!(!store.contains("ged_L:k"));
        assert!(lock.acquire("k", 5).await.unwrap().is_acquired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_after_expiry_keeps_new_holder() {
        let store = MemoryStore::new();
        let lock = lock_over(&store);

        let stale = lock.acquire("k", 1).await.unwrap().token().unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let fresh = lock.acquire("k", 10).await.unwrap().token().unwrap();
        assert_ne!(stale, fresh);

        assert!(!lock.release("k", stale).await.unwrap());
        assert_eq!(
            store.get("ged_L:k").unwrap(),
            fresh.to_string().as_bytes()
        );
        assert_eq!(lock.metrics.lock_release_lost.get(), 1);
        assert!(lock.release("k", fresh).await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_ttl_still_expires() {
        let store = MemoryStore::new();
        let acquisition = acquire_on(&store, "k", 0).await.unwrap();
        assert!(acquisition.is_acquired());
        assert!(store.ttl("ged_L:k").is_some());
    }
}
