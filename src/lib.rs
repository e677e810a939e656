//! # leasehold
//!
//! Coordination primitives over a sharded set of Redis instances.
//!
//! ## Features
//!
//! - Consistent-hash routing with weighted virtual nodes
//! - Leased distributed locks with token-checked release
//! - Stampede-protected read-through cache with stale-while-revalidate
//! - Process-local tier with lock-free entries in front of the remote cache
//! - Token bucket and fixed window rate limiting
//!
//! ## Example
//!
//! ```ignore
//! use leasehold::prelude::*;
//!
//! let config = Config::from_file("leasehold.toml")?;
//! let registry = Registry::connect(&config)?;
//! let router = registry.get("sessions").unwrap();
//!
//! let cache = TieredCache::new(router, Arc::new(Metrics::new()), config.cache.clone());
//! let profile = cache
//!     .get("user:42", current_timestamp(), 30, || async { load_profile(42).await })
//!     .await?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌─────────────┐   ┌─────────┐
//! │ TieredCache  │──▶│ ReadThroughCache │──▶│             │──▶│ redis 0 │
//! │ (LocalEntry) │   │ (lock + rebuild) │   │ ShardRouter │   ├─────────┤
//! └──────────────┘   └──────────────────┘   │ (crc32 ring)│──▶│ redis 1 │
//!   DistributedLock, RateLimiter ──────────▶│             │   ├─────────┤
//!                                           └─────────────┘──▶│ redis 2 │
//!                                                             └─────────┘
//! ```

// Modules
pub mod cache;
pub mod config;
pub mod error;
pub mod limiter;
pub mod local;
pub mod lock;
pub mod metrics;
pub mod prelude;
pub mod registry;
pub mod router;
pub mod storage;
pub mod tiered;

// Re-exports for convenience
pub use error::{Error, Result, StoreError};
