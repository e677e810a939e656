//! Stampede-protected read-through cache over one remote hash per key
//!
//! Lookup flow for `get(key, now, timeout, rebuild)`:
//!
//! ```text
//! HGETALL ged_C:<key>
//!   ├─ fresh (updated_at + timeout > now) ─────────────▶ value, no lock
//!   ├─ stale ─▶ SET ged_L:ged_C:<key> NX EX
//!   │            ├─ held elsewhere ──────────────────────▶ stale value
//!   │            └─ acquired ─▶ rebuild ─▶ write ─▶ release ─▶ new value
//!   └─ miss ──▶ SET ged_L:ged_C:<key> NX EX
//!                ├─ held elsewhere ─▶ poll until written or lease lapses
//!                └─ acquired ─▶ rebuild ─▶ write ─▶ release ─▶ new value
//! ```
//!
//! A failed rebuild keeps its lease until expiry so a second caller does not
//! immediately repeat it.

use crate::config::CacheConfig;
use crate::lock::{Acquisition, LockToken, acquire_on, release_on};
use crate::metrics::Metrics;
use crate::router::ShardRouter;
use crate::storage::{CacheItem, FIELD_UPDATED_AT, FIELD_UPDATED_COUNT, RemoteStore};
use crate::{Error, Result, StoreError};
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

pub const CACHE_KEY_PREFIX: &str = "ged_C:";

/// Remote key of the cache item for `key`
pub fn cache_key(key: &str) -> String {
    format!("{CACHE_KEY_PREFIX}{key}")
}

/// How a lookup was answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// Stored value within its freshness window
    Hit(Bytes),
    /// This caller ran the rebuild
    Rebuilt(Bytes),
    /// Stale value; another caller holds the refresh lease
    Stale(Bytes),
}

impl Resolved {
    pub fn into_value(self) -> Bytes {
        match self {
            Self::Hit(v) | Self::Rebuilt(v) | Self::Stale(v) => v,
        }
    }
}

/// Progress of a lookup that may stop at a contended miss
pub(crate) enum Step<F> {
    Done(Resolved),
    /// Missing, and another caller holds the rebuild lock
    MissContended(F),
}

/// Read-through cache with one refresh per key cluster-wide
pub struct ReadThroughCache<S> {
    router: Arc<ShardRouter<S>>,
    metrics: Arc<Metrics>,
    config: CacheConfig,
}

impl<S: RemoteStore> ReadThroughCache<S> {
    pub fn new(router: Arc<ShardRouter<S>>, metrics: Arc<Metrics>, config: CacheConfig) -> Self {
        Self {
            router,
            metrics,
            config,
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Value for `key`, rebuilding it when missing or older than `timeout_secs`
    pub async fn get<F, Fut>(
        &self,
        key: &str,
        now: i64,
        timeout_secs: i64,
        rebuild: F,
    ) -> Result<Bytes>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send,
    {
        let start = Instant::now();
        let resolved = self.resolve(key, now, timeout_secs, rebuild).await;
        self.metrics
            .cache_latency
            .observe(start.elapsed().as_secs_f64());
        resolved.map(Resolved::into_value)
    }

    /// Force the next lookup to miss; the hash and its counters are kept
    pub async fn invalidate(&self, key: &str) -> Result<bool> {
        let ckey = cache_key(key);
        let store = self.router.route(key).store();
        store
            .hset(&ckey, FIELD_UPDATED_AT, b"0")
            .await
            .map_err(|e| self.store_error(e))?;
        // HSET on a missing key creates the hash without an expiry
        store
            .expire(&ckey, self.config.item_ttl_secs)
            .await
            .map_err(|e| self.store_error(e))?;
        Ok(true)
    }

    /// Current remote item without any refresh
    pub async fn peek(&self, key: &str) -> Result<CacheItem> {
        let store = self.router.route(key).store();
        self.read(store, &cache_key(key)).await
    }

    /// Full lookup, reporting how the value was obtained
    pub async fn resolve<F, Fut>(
        &self,
        key: &str,
        now: i64,
        timeout_secs: i64,
        rebuild: F,
    ) -> Result<Resolved>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send,
    {
        match self.begin(key, now, timeout_secs, rebuild).await? {
            Step::Done(resolved) => Ok(resolved),
            Step::MissContended(rebuild) => {
                self.wait_for_rebuild(key, now, timeout_secs, rebuild)
                    .await
            }
        }
    }

    /// Everything up to the first contended lock on a miss. The rebuild
    /// function is handed back in that case so the caller picks between
    /// waiting and a fallback of its own.
    pub(crate) async fn begin<F, Fut>(
        &self,
        key: &str,
        now: i64,
        timeout_secs: i64,
        rebuild: F,
    ) -> Result<Step<F>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send,
    {
        let ckey = cache_key(key);
        let store = self.router.route(key).store();
        let item = self.read(store, &ckey).await?;

        if let Some(value) = fresh_value(&item, timeout_secs, now) {
            self.metrics.cache_hits.inc();
            return Ok(Step::Done(Resolved::Hit(value)));
        }

        let stale = if item.is_miss() {
            self.metrics.cache_misses.inc();
            None
        } else {
            item.value
        };

        match (self.try_lock(store, &ckey).await?, stale) {
            (Acquisition::Acquired(token), _) => self
                .refresh_locked(store, &ckey, token, now, timeout_secs, rebuild)
                .await
                .map(Step::Done),
            (Acquisition::NotAcquired, Some(stale)) => {
                debug!(%key, "refresh in progress elsewhere, serving stale value");
                self.metrics.cache_stale_served.inc();
                Ok(Step::Done(Resolved::Stale(stale)))
            }
            (Acquisition::NotAcquired, None) => Ok(Step::MissContended(rebuild)),
        }
    }

    /// Poll a missing item until the lock holder writes it, or take over
    /// once its lease lapses
    pub(crate) async fn wait_for_rebuild<F, Fut>(
        &self,
        key: &str,
        now: i64,
        timeout_secs: i64,
        rebuild: F,
    ) -> Result<Resolved>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send,
    {
        debug!(%key, "miss is being rebuilt elsewhere, waiting");
        self.metrics.cache_miss_waits.inc();

        let ckey = cache_key(key);
        let store = self.router.route(key).store();
        loop {
            tokio::time::sleep(self.config.miss_poll_interval()).await;

            let item = self.read(store, &ckey).await?;
            if let (false, Some(value)) = (item.is_miss(), item.value) {
                return Ok(Resolved::Hit(value));
            }
            if let Acquisition::Acquired(token) = self.try_lock(store, &ckey).await? {
                return self
                    .refresh_locked(store, &ckey, token, now, timeout_secs, rebuild)
                    .await;
            }
        }
    }

    /// Holding the lease: re-check, rebuild, write, then release
    async fn refresh_locked<F, Fut>(
        &self,
        store: &S,
        ckey: &str,
        token: LockToken,
        now: i64,
        timeout_secs: i64,
        rebuild: F,
    ) -> Result<Resolved>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send,
    {
        // the previous holder may have written between our read and our lock
        let mut item = self.read(store, ckey).await?;
        if let Some(value) = fresh_value(&item, timeout_secs, now) {
            self.release(store, ckey, token).await;
            self.metrics.cache_hits.inc();
            return Ok(Resolved::Hit(value));
        }

        let value = self.rebuild_into(store, ckey, &mut item, now, rebuild).await?;
        self.release(store, ckey, token).await;
        Ok(Resolved::Rebuilt(value))
    }

    /// Run `rebuild` and write the result; nothing is written on failure
    pub(crate) async fn rebuild_into<F, Fut>(
        &self,
        store: &S,
        ckey: &str,
        item: &mut CacheItem,
        now: i64,
        rebuild: F,
    ) -> Result<Bytes>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send,
    {
        let value = match rebuild().await {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %ckey, error = %e, "rebuild failed, lease left to expire");
                self.metrics.cache_rebuild_failures.inc();
                return Err(Error::Rebuild(e));
            }
        };

        item.refresh(now, value.clone());
        self.write(store, ckey, item).await?;
        self.metrics.cache_rebuilds.inc();
        Ok(value)
    }

    async fn write(&self, store: &S, ckey: &str, item: &mut CacheItem) -> Result<()> {
        let fields = item.to_fields();
        match store
            .write_hash(ckey, &fields, FIELD_UPDATED_COUNT, self.config.item_ttl_secs)
            .await
        {
            Ok(count) => item.updated_count = count,
            Err(StoreError::Overflow) => {
                warn!(key = %ckey, "updated_count overflowed, resetting to 0");
                self.metrics.counter_resets.inc();
                store
                    .hset(ckey, FIELD_UPDATED_COUNT, b"0")
                    .await
                    .map_err(|e| self.store_error(e))?;
                item.updated_count = 0;
            }
            Err(e) => return Err(self.store_error(e)),
        }
        Ok(())
    }

    pub(crate) async fn read(&self, store: &S, ckey: &str) -> Result<CacheItem> {
        store
            .hget_all(ckey)
            .await
            .map(CacheItem::from_fields)
            .map_err(|e| self.store_error(e))
    }

    async fn try_lock(&self, store: &S, ckey: &str) -> Result<Acquisition> {
        let acquisition = acquire_on(store, ckey, self.config.lock_ttl_secs)
            .await
            .map_err(|e| self.store_error(e))?;
        if acquisition.is_acquired() {
            self.metrics.lock_acquired.inc();
        } else {
            self.metrics.lock_contended.inc();
        }
        Ok(acquisition)
    }

    /// Best effort: the value is already written, an unreleased lease just expires
    async fn release(&self, store: &S, ckey: &str, token: LockToken) {
        match release_on(store, ckey, token).await {
            Ok(true) => self.metrics.lock_released.inc(),
            Ok(false) => self.metrics.lock_release_lost.inc(),
            Err(e) => {
                warn!(key = %ckey, error = %e, "lock release failed");
                self.metrics.store_errors.inc();
            }
        }
    }

    fn store_error(&self, err: StoreError) -> Error {
        self.metrics.store_errors.inc();
        Error::Store(err)
    }
}

fn fresh_value(item: &CacheItem, timeout_secs: i64, now: i64) -> Option<Bytes> {
    if item.is_miss() || !item.is_fresh(timeout_secs, now) {
        return None;
    }
    item.value.clone()
}
