//! In-process store
//!
//! Keeps strings and hashes in one map behind a mutex, with lazy TTL
//! expiration on access. Every [`RemoteStore`] call holds the mutex for its
//! whole body, which gives the scripted operations the same atomicity a
//! server-side script has. Clones share state, so several routers (or
//! simulated processes) can point at one store.

use super::{BucketRequest, RemoteStore};
use crate::StoreError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::{Future, ready};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

const FIELD_LAST_ADD_TIME: &str = "last_add_time";
const FIELD_REMAIN_TOKEN_NUM: &str = "remain_token_num";

#[derive(Debug, Clone)]
enum Value {
    Str(Bytes),
    Hash(HashMap<String, Bytes>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Default)]
struct Inner {
    slots: Mutex<HashMap<String, Slot>>,
    expired_removed: AtomicU64,
}

/// Shared in-memory [`RemoteStore`]
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys removed by lazy expiration so far
    pub fn expired_removed(&self) -> u64 {
        self.inner.expired_removed.load(Ordering::Relaxed)
    }

    /// Read a string value (test and debugging helper)
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.with_key(key, |slots| match slots.get(key) {
            Some(Slot {
                value: Value::Str(v),
                ..
            }) => Some(v.clone()),
            _ => None,
        })
    }

    /// Remaining time to live of a key, if it has one
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.with_key(key, |slots| {
            slots
                .get(key)
                .and_then(|slot| slot.expires_at)
                .map(|at| at.saturating_duration_since(now))
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.with_key(key, |slots| slots.contains_key(key))
    }

    pub fn delete(&self, key: &str) -> bool {
        self.with_key(key, |slots| slots.remove(key).is_some())
    }

    /// Run `f` on the slots after dropping `key` if it has expired
    fn with_key<T>(&self, key: &str, f: impl FnOnce(&mut HashMap<String, Slot>) -> T) -> T {
        let mut slots = self.inner.slots.lock();
        if slots
            .get(key)
            .is_some_and(|slot| slot.is_expired(Instant::now()))
        {
            slots.remove(key);
            trace!(%key, "Lazy expiration: removed expired key");
            self.inner.expired_removed.fetch_add(1, Ordering::Relaxed);
        }
        f(&mut slots)
    }

    fn hash_mut<'a>(
        slots: &'a mut HashMap<String, Slot>,
        key: &str,
    ) -> Result<&'a mut HashMap<String, Bytes>, StoreError> {
        let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut slot.value {
            Value::Hash(hash) => Ok(hash),
            Value::Str(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn set_expiry(slots: &mut HashMap<String, Slot>, key: &str, ttl_secs: u64) -> bool {
        match slots.get_mut(key) {
            Some(slot) => {
                slot.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
                true
            }
            None => false,
        }
    }
}

fn incr_bytes(current: Option<&Bytes>, delta: i64) -> Result<i64, StoreError> {
    let current = match current {
        Some(bytes) => super::parse_i64(bytes)
            .ok_or_else(|| StoreError::InvalidValue("value is not an integer".to_string()))?,
        None => 0,
    };
    current.checked_add(delta).ok_or(StoreError::Overflow)
}

fn int_bytes(n: i64) -> Bytes {
    Bytes::copy_from_slice(itoa::Buffer::new().format(n).as_bytes())
}

/// Token bucket arithmetic on a bucket hash; returns (allowed, wrote)
fn apply_bucket(bucket: &mut HashMap<String, Bytes>, request: &BucketRequest) -> (bool, bool) {
    let last_add_time = bucket
        .get(FIELD_LAST_ADD_TIME)
        .and_then(|v| super::parse_i64(v));

    let Some(mut last_add_time) = last_add_time else {
        let (remain, allowed) = if request.cost > request.capacity {
            (request.capacity, false)
        } else {
            (request.capacity - request.cost, true)
        };
        bucket.insert(FIELD_LAST_ADD_TIME.to_string(), int_bytes(request.now));
        bucket.insert(FIELD_REMAIN_TOKEN_NUM.to_string(), int_bytes(remain));
        return (allowed, true);
    };

    let mut remain = bucket
        .get(FIELD_REMAIN_TOKEN_NUM)
        .and_then(|v| super::parse_i64(v))
        .unwrap_or(0);

    let mut wrote = false;
    let added = request
        .now
        .saturating_sub(last_add_time)
        .saturating_mul(request.refill_rate);
    if added > 0 {
        last_add_time = request.now;
        remain = remain.saturating_add(added).min(request.capacity);
        bucket.insert(FIELD_LAST_ADD_TIME.to_string(), int_bytes(last_add_time));
        bucket.insert(FIELD_REMAIN_TOKEN_NUM.to_string(), int_bytes(remain));
        wrote = true;
    }

    if request.cost > remain {
        return (false, wrote);
    }

    bucket.insert(
        FIELD_REMAIN_TOKEN_NUM.to_string(),
        int_bytes(remain - request.cost),
    );
    (true, true)
}

impl RemoteStore for MemoryStore {
    fn set_nx_ex(
        &self,
        key: &str,
        value: &[u8],
        ttl_secs: u64,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send {
        let created = self.with_key(key, |slots| {
            if slots.contains_key(key) {
                return false;
            }
            slots.insert(
                key.to_string(),
                Slot {
                    value: Value::Str(Bytes::copy_from_slice(value)),
                    expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
                },
            );
            true
        });
        ready(Ok(created))
    }

    fn compare_and_delete(
        &self,
        key: &str,
        expected: &[u8],
    ) -> impl Future<Output = Result<bool, StoreError>> + Send {
        let deleted = self.with_key(key, |slots| {
            let matches = matches!(
                slots.get(key),
                Some(Slot { value: Value::Str(v), .. }) if v.as_ref() == expected
            );
            if matches {
                slots.remove(key);
            }
            matches
        });
        ready(Ok(deleted))
    }

    fn hget_all(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<HashMap<String, Bytes>, StoreError>> + Send {
        let result = self.with_key(key, |slots| match slots.get(key) {
            Some(Slot {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.clone()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(HashMap::new()),
        });
        ready(result)
    }

    fn hset(
        &self,
        key: &str,
        field: &str,
        value: &[u8],
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        let result = self.with_key(key, |slots| {
            Self::hash_mut(slots, key)?.insert(field.to_string(), Bytes::copy_from_slice(value));
            Ok(())
        });
        ready(result)
    }

    fn write_hash(
        &self,
        key: &str,
        fields: &[(&str, Bytes)],
        counter_field: &str,
        ttl_secs: u64,
    ) -> impl Future<Output = Result<i64, StoreError>> + Send {
        let result = self.with_key(key, |slots| {
            let hash = Self::hash_mut(slots, key)?;
            for (field, value) in fields {
                hash.insert((*field).to_string(), value.clone());
            }
            let counter = incr_bytes(hash.get(counter_field), 1);
            if let Ok(n) = counter {
                hash.insert(counter_field.to_string(), int_bytes(n));
            }
            Self::set_expiry(slots, key, ttl_secs);
            counter
        });
        ready(result)
    }

    fn incr_by(
        &self,
        key: &str,
        delta: i64,
    ) -> impl Future<Output = Result<i64, StoreError>> + Send {
        let result = self.with_key(key, |slots| {
            let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
                value: Value::Str(Bytes::from_static(b"0")),
                expires_at: None,
            });
            let Value::Str(current) = &mut slot.value else {
                return Err(StoreError::WrongType(key.to_string()));
            };
            let next = incr_bytes(Some(&*current), delta)?;
            *current = int_bytes(next);
            Ok(next)
        });
        ready(result)
    }

    fn expire(
        &self,
        key: &str,
        ttl_secs: u64,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send {
        ready(Ok(self.with_key(key, |slots| Self::set_expiry(slots, key, ttl_secs))))
    }

    fn take_tokens(
        &self,
        key: &str,
        request: &BucketRequest,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send {
        let result = self.with_key(key, |slots| {
            let (allowed, wrote) = apply_bucket(Self::hash_mut(slots, key)?, request);
            if wrote {
                Self::set_expiry(slots, key, request.ttl_secs);
            }
            Ok(allowed)
        });
        ready(result)
    }

    fn ping(&self) -> impl Future<Output = Result<(), StoreError>> + Send {
        ready(Ok(()))
    }
}
