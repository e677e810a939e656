//! Remote store layer
//!
//! [`RemoteStore`] is the narrow set of primitives the coordination layer
//! needs from one backend instance. Anything that must be atomic across
//! processes (compare-and-delete, token bucket arithmetic) is a single
//! method here so implementations can run it as one server-side script.

mod memory;
mod redis_store;
mod value;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use value::{
    CacheItem, FIELD_CREATED_AT, FIELD_UPDATED_AT, FIELD_UPDATED_COUNT, FIELD_VALUE,
    current_timestamp, parse_i64,
};

use crate::StoreError;
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;

/// Arguments of one token bucket evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketRequest {
    /// Maximum tokens the bucket holds
    pub capacity: i64,
    /// Tokens added per elapsed second
    pub refill_rate: i64,
    /// Tokens this request spends
    pub cost: i64,
    /// Caller clock, unix seconds
    pub now: i64,
    /// Expiry of the bucket hash after the last write
    pub ttl_secs: u64,
}

/// Primitives of one backend instance
pub trait RemoteStore: Send + Sync + 'static {
    /// `SET key value NX EX ttl`; true when the key was created
    fn set_nx_ex(
        &self,
        key: &str,
        value: &[u8],
        ttl_secs: u64,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Delete `key` only if it still holds `expected`, atomically
    fn compare_and_delete(
        &self,
        key: &str,
        expected: &[u8],
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// All fields of a hash; empty when the key does not exist
    fn hget_all(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<HashMap<String, Bytes>, StoreError>> + Send;

    fn hset(
        &self,
        key: &str,
        field: &str,
        value: &[u8],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Write `fields`, increment `counter_field` by one and set the expiry in
    /// one round trip. Returns the new counter, or [`StoreError::Overflow`]
    /// when the increment would overflow; the fields and expiry are written
    /// either way.
    fn write_hash(
        &self,
        key: &str,
        fields: &[(&str, Bytes)],
        counter_field: &str,
        ttl_secs: u64,
    ) -> impl Future<Output = Result<i64, StoreError>> + Send;

    fn incr_by(&self, key: &str, delta: i64)
    -> impl Future<Output = Result<i64, StoreError>> + Send;

    fn expire(&self, key: &str, ttl_secs: u64)
    -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Refill-then-spend on the bucket hash at `key`, atomically
    fn take_tokens(
        &self,
        key: &str,
        request: &BucketRequest,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn ping(&self) -> impl Future<Output = Result<(), StoreError>> + Send;
}
