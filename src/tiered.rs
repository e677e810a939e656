//! Two-tier cache: process-local entries in front of [`ReadThroughCache`]
//!
//! A fresh local entry answers without touching the remote tier. When it goes
//! stale, one task per process takes the entry's local lease and consults the
//! remote tier; concurrent readers keep getting the local value meanwhile.
//! Whenever the remote tier cannot produce an answer without blocking or
//! failing, a local value, if there is one, is preferred.

use crate::cache::{ReadThroughCache, Resolved, Step};
use crate::config::CacheConfig;
use crate::local::{LocalEntry, LocalLease, LocalStats};
use crate::metrics::Metrics;
use crate::router::ShardRouter;
use crate::storage::RemoteStore;
use crate::Result;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Per-process cache tier over a shared remote cache
pub struct TieredCache<S> {
    remote: ReadThroughCache<S>,
    entries: DashMap<String, Arc<LocalEntry>>,
    lease_secs: i64,
}

impl<S: RemoteStore> TieredCache<S> {
    pub fn new(router: Arc<ShardRouter<S>>, metrics: Arc<Metrics>, config: CacheConfig) -> Self {
        let lease_secs = i64::try_from(config.lock_ttl_secs).unwrap_or(i64::MAX);
        Self {
            remote: ReadThroughCache::new(router, metrics, config),
            entries: DashMap::new(),
            lease_secs,
        }
    }

    /// The remote tier on its own
    pub fn remote(&self) -> &ReadThroughCache<S> {
        &self.remote
    }

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
        let value = self.lookup(key, now, timeout_secs, rebuild).await;
        self.metrics()
            .cache_latency
            .observe(start.elapsed().as_secs_f64());
        value
    }

    /// Force the next lookup to miss in both tiers
    pub async fn invalidate(&self, key: &str) -> Result<bool> {
        if let Some(entry) = self.entries.get(key) {
            entry.invalidate();
        }
        self.remote.invalidate(key).await
    }

    /// Counters of the local entry for `key`, if one exists
    pub fn local_stats(&self, key: &str) -> Option<LocalStats> {
        self.entries.get(key).map(|entry| entry.stats())
    }

    /// Number of keys held locally
    pub fn local_len(&self) -> usize {
        self.entries.len()
    }

    async fn lookup<F, Fut>(
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
        let entry = self.entries.get(key).map(|e| Arc::clone(e.value()));

        // held until the remote round trip is over, on every path
        let _lease: Option<LocalLease> = match &entry {
            Some(entry) => {
                if entry.is_fresh(timeout_secs, now) {
                    return Ok(self.serve_local(entry, now));
                }
                match entry.try_lease(now, self.lease_secs) {
                    Some(lease) => Some(lease),
                    None => return Ok(self.serve_local(entry, now)),
                }
            }
            None => None,
        };

        let resolved = match self.remote.begin(key, now, timeout_secs, rebuild).await {
            Ok(Step::Done(resolved)) => Ok(resolved),
            Ok(Step::MissContended(rebuild)) => match &entry {
                Some(entry) => {
                    return Ok(self.fall_back(key, entry, "miss being rebuilt elsewhere"));
                }
                None => {
                    self.remote
                        .wait_for_rebuild(key, now, timeout_secs, rebuild)
                        .await
                }
            },
            Err(e) => Err(e),
        };

        match (resolved, &entry) {
            (Ok(Resolved::Hit(value) | Resolved::Rebuilt(value)), _) => {
                self.store_local(key, entry.as_ref(), now, value.clone());
                Ok(value)
            }
            (Ok(Resolved::Stale(_)), Some(entry)) => {
                Ok(self.fall_back(key, entry, "remote stale and locked"))
            }
            (Ok(Resolved::Stale(value)), None) => Ok(value),
            (Err(e), Some(entry)) => {
                warn!(%key, error = %e, "remote tier failed, serving local value");
                Ok(self.fall_back(key, entry, "remote error"))
            }
            (Err(e), None) => Err(e),
        }
    }

    fn serve_local(&self, entry: &LocalEntry, now: i64) -> Bytes {
        entry.touch(now);
        self.metrics().local_hits.inc();
        entry.value()
    }

    fn fall_back(&self, key: &str, entry: &LocalEntry, reason: &str) -> Bytes {
        debug!(%key, reason, "serving local value");
        self.metrics().local_fallbacks.inc();
        entry.value()
    }

    fn store_local(&self, key: &str, known: Option<&Arc<LocalEntry>>, now: i64, value: Bytes) {
        if let Some(entry) = known {
            entry.update(now, value);
            return;
        }
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) => occupied.get().update(now, value),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(LocalEntry::new(now, value)));
            }
        }
    }

    fn metrics(&self) -> &Metrics {
        self.remote.metrics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardConfig;
    use crate::lock::acquire_on;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn tiered_over(store: &MemoryStore) -> TieredCache<MemoryStore> {
        let router = ShardRouter::new(vec![(ShardConfig::default(), store.clone())]).unwrap();
        TieredCache::new(
            Arc::new(router),
            Arc::new(Metrics::new()),
            CacheConfig {
                miss_poll_interval_ms: 5,
                ..CacheConfig::default()
            },
        )
    }

    fn counted(
        calls: &Arc<AtomicUsize>,
        value: &'static str,
    ) -> impl FnOnce() -> std::future::Ready<anyhow::Result<Bytes>> + Send {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(Bytes::from_static(value.as_bytes())))
        }
    }

    fn failing() -> std::future::Ready<anyhow::Result<Bytes>> {
        std::future::ready(Err(anyhow::anyhow!("origin down")))
    }

    #[tokio::test]
    async fn test_local_hit_skips_remote() {
        let store = MemoryStore::new();
        let cache = tiered_over(&store);
        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(cache.get("k", 1000, 10, counted(&calls, "v")).await.unwrap(), "v");
        // drop the remote copy: a local hit must not notice
        store.delete("ged_C:k");

        assert_eq!(cache.get("k", 1005, 10, counted(&calls, "other")).await.unwrap(), "v");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.local_stats("k").unwrap();
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.last_access_at, 1005);
        assert_eq!(cache.metrics().local_hits.get(), 1);
    }

    #[tokio::test]
    async fn test_stale_local_refreshed_from_remote() {
        let store = MemoryStore::new();
        let first = tiered_over(&store);
        let second = tiered_over(&store);
        let calls = Arc::new(AtomicUsize::new(0));

        first.get("k", 1000, 10, counted(&calls, "v1")).await.unwrap();
        // another process refreshes the remote copy
        second.get("k", 1020, 10, counted(&calls, "v2")).await.unwrap();

        let value = first.get("k", 1021, 10, counted(&calls, "v3")).await.unwrap();
        assert_eq!(value, "v2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(first.local_stats("k").unwrap().updated_at, 1021);
    }

    #[tokio::test]
    async fn test_busy_lease_serves_local() {
        let store = MemoryStore::new();
        let cache = tiered_over(&store);
        let calls = Arc::new(AtomicUsize::new(0));
        cache.get("k", 1000, 10, counted(&calls, "v1")).await.unwrap();

        let entry = cache.entries.get("k").map(|e| Arc::clone(e.value())).unwrap();
        let _lease = entry.try_lease(2000, 5).unwrap();

        let value = cache.get("k", 2001, 10, counted(&calls, "v2")).await.unwrap();
        assert_eq!(value, "v1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remote_stale_and_locked_prefers_local() {
        let store = MemoryStore::new();
        let cache = tiered_over(&store);
        let calls = Arc::new(AtomicUsize::new(0));
        cache.get("k", 1000, 10, counted(&calls, "local")).await.unwrap();
        store.hset("ged_C:k", "value", b"remote").await.unwrap();
        assert!(acquire_on(&store, "ged_C:k", 30).await.unwrap().is_acquired());

        let value = cache.get("k", 2000, 10, counted(&calls, "new")).await.unwrap();
        assert_eq!(value, "local");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.metrics().local_fallbacks.get(), 1);
    }

    #[tokio::test]
    async fn test_remote_stale_without_local_serves_remote() {
        let store = MemoryStore::new();
        let writer = tiered_over(&store);
        let reader = tiered_over(&store);
        let calls = Arc::new(AtomicUsize::new(0));
        writer.get("k", 1000, 10, counted(&calls, "old")).await.unwrap();
        assert!(acquire_on(&store, "ged_C:k", 30).await.unwrap().is_acquired());

        let value = reader.get("k", 2000, 10, counted(&calls, "new")).await.unwrap();
        assert_eq!(value, "old");
        // a stale remote value is not cached locally
        assert!(reader.local_stats("k").is_none());
    }

    #[tokio::test]
    async fn test_rebuild_failure_falls_back_to_local() {
        let store = MemoryStore::new();
        let cache = tiered_over(&store);
        let calls = Arc::new(AtomicUsize::new(0));
        cache.get("k", 1000, 10, counted(&calls, "v1")).await.unwrap();

        let value = cache.get("k", 2000, 10, failing).await.unwrap();
        assert_eq!(value, "v1");
        assert_eq!(cache.metrics().local_fallbacks.get(), 1);
        // the local lease was released on the way out
        let entry = cache.entries.get("k").map(|e| Arc::clone(e.value())).unwrap();
        assert!(entry.try_lease(2000, 5).is_some());
    }

    #[tokio::test]
    async fn test_rebuild_failure_without_local_propagates() {
        let store = MemoryStore::new();
        let cache = tiered_over(&store);

        let err = cache.get("k", 1000, 10, failing).await.unwrap_err();
        assert!(matches!(err, crate::Error::Rebuild(_)));
        assert!(cache.local_stats("k").is_none());
        assert!(store.hget_all("ged_C:k").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_clears_both_tiers() {
        let store = MemoryStore::new();
        let cache = tiered_over(&store);
        let calls = Arc::new(AtomicUsize::new(0));
        cache.get("k", 1000, 10, counted(&calls, "v1")).await.unwrap();

        assert!(cache.invalidate("k").await.unwrap());
        assert_eq!(cache.local_stats("k").unwrap().updated_at, 0);

        let value = cache.get("k", 1001, 10, counted(&calls, "v2")).await.unwrap();
        assert_eq!(value, "v2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.local_stats("k").unwrap().updated_at, 1001);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_processes_rebuild_once() {
        let store = MemoryStore::new();
        let processes = [Arc::new(tiered_over(&store)), Arc::new(tiered_over(&store))];

        let handles: Vec<_> = processes
            .iter()
            .map(|cache| {
                let cache = Arc::clone(cache);
                let store = store.clone();
                tokio::spawn(async move {
                    cache
                        .get("k", 1000, 10, move || async move {
                            let n = store.incr_by("rebuild_calls", 1).await?;
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, anyhow::Error>(Bytes::from(format!("built-{n}")))
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.unwrap());
        }
        assert_eq!(values[0], values[1]);
        assert_eq!(values[0], "built-1");
        assert_eq!(store.get("rebuild_calls").unwrap(), "1");
    }
}
