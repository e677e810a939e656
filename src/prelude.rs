//! Prelude module for common imports.
//!
//! # Usage
//!
//! ```ignore
//! use leasehold::prelude::*;
//! ```

// Error types
pub use crate::error::{Error, Result, StoreError};

// Configuration
pub use crate::config::{CacheConfig, Config, GroupConfig, MetricsConfig, ShardConfig};

// Routing and storage
pub use crate::registry::{Registry, spawn_reaper};
pub use crate::router::{BackendInstance, ShardRouter};
pub use crate::storage::{CacheItem, MemoryStore, RedisStore, RemoteStore, current_timestamp};

// Coordination
pub use crate::cache::{ReadThroughCache, Resolved};
pub use crate::limiter::{Granularity, RateLimiter};
pub use crate::local::LocalStats;
pub use crate::lock::{Acquisition, DistributedLock, LockToken};
pub use crate::tiered::TieredCache;

// Metrics
pub use crate::metrics::Metrics;

// Common external crates
pub use bytes::Bytes;
pub use std::sync::Arc;
