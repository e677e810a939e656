//! Process-local cache entries
//!
//! One [`LocalEntry`] per key, shared through an `Arc`. Every field is an
//! atomic and the value is swapped whole through [`ArcSwap`], so readers never
//! wait on a refresh in progress.

use arc_swap::ArcSwap;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Cached value plus the bookkeeping for the local refresh lease
pub struct LocalEntry {
    created_at: AtomicI64,
    updated_at: AtomicI64,
    last_access_at: AtomicI64,
    hit_count: AtomicU64,
    /// Time the current lease was taken, 0 when free
    lease: AtomicI64,
    value: ArcSwap<Bytes>,
}

/// Point-in-time copy of an entry's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalStats {
    pub created_at: i64,
    pub updated_at: i64,
    pub last_access_at: i64,
    pub hit_count: u64,
}

impl LocalEntry {
    pub fn new(now: i64, value: Bytes) -> Self {
        Self {
            created_at: AtomicI64::new(now),
            updated_at: AtomicI64::new(now),
            last_access_at: AtomicI64::new(now),
            hit_count: AtomicU64::new(0),
            lease: AtomicI64::new(0),
            value: ArcSwap::from_pointee(value),
        }
    }

    pub fn value(&self) -> Bytes {
        Bytes::clone(&self.value.load())
    }

    /// Same rule as the remote item: fresh iff `updated_at + timeout > now`
    pub fn is_fresh(&self, timeout_secs: i64, now: i64) -> bool {
        self.updated_at
            .load(Ordering::Acquire)
            .saturating_add(timeout_secs)
            > now
    }

    /// Record a read served from this entry
    pub fn touch(&self, now: i64) -> u64 {
        self.last_access_at.store(now, Ordering::Relaxed);
        self.hit_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Replace the value and mark it fresh as of `now`
    pub fn update(&self, now: i64, value: Bytes) {
        self.value.store(Arc::new(value));
        self.updated_at.store(now, Ordering::Release);
    }

    /// Mark stale so the next read goes to the remote tier
    pub fn invalidate(&self) {
        self.updated_at.store(0, Ordering::Release);
    }

    /// Take the refresh lease unless another task took it less than
    /// `lease_secs` ago. The lease is dropped with the returned guard.
    pub fn try_lease(self: &Arc<Self>, now: i64, lease_secs: i64) -> Option<LocalLease> {
        let held = self.lease.load(Ordering::Acquire);
        if now.saturating_sub(held) < lease_secs {
            return None;
        }
        self.lease
            .compare_exchange(held, now, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(LocalLease {
            entry: Arc::clone(self),
            stamp: now,
        })
    }

    pub fn stats(&self) -> LocalStats {
        LocalStats {
            created_at: self.created_at.load(Ordering::Relaxed),
            updated_at: self.updated_at.load(Ordering::Acquire),
            last_access_at: self.last_access_at.load(Ordering::Relaxed),
            hit_count: self.hit_count.load(Ordering::Relaxed),
        }
    }
}

/// Held local refresh lease
pub struct LocalLease {
    entry: Arc<LocalEntry>,
    stamp: i64,
}

impl Drop for LocalLease {
    fn drop(&mut self) {
        // a lease that lapsed and was retaken by someone else stays theirs
        let _ = self.entry.lease.compare_exchange(
            self.stamp,
            0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}
