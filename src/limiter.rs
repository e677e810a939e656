//! Distributed rate limiting
//!
//! Two independent algorithms, both keyed through the shard router:
//!
//! - Token bucket: one atomic script per call against a hash holding
//!   `last_add_time` and `remain_token_num`. Capacity and refill rate come with
//!   every call, so a bucket can be reconfigured without migration.
//! - Fixed window: `INCRBY <key>:<bucket>` where the bucket is the current
//!   local time formatted at second, minute, hour or day granularity. The
//!   call that creates the counter also sets its expiry. Bursts of up to twice
//!   the limit are possible across a window boundary.

use crate::metrics::Metrics;
use crate::router::ShardRouter;
use crate::storage::{BucketRequest, RemoteStore, current_timestamp};
use crate::{Error, Result, StoreError};
use chrono::{DateTime, Local, TimeZone};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Bucket expiry used by [`RateLimiter::allow_per_second`]
const PER_SECOND_BUCKET_TTL_SECS: u64 = 5;

/// Width of a fixed window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    Second,
    Minute,
    Hour,
    Day,
}

impl Granularity {
    /// strftime pattern naming the current window
    pub fn format(self) -> &'static str {
        match self {
            Self::Second => "%H%M%S",
            Self::Minute => "%H%M",
            Self::Hour => "%H",
            Self::Day => "%Y%m%d",
        }
    }

    /// Window length, used as the counter's expiry
    pub fn window_secs(self) -> u64 {
        match self {
            Self::Second => 1,
            Self::Minute => 60,
            Self::Hour => 3600,
            Self::Day => 86400,
        }
    }

    /// Counter key for the window containing `at`
    pub fn window_key<Tz>(self, key: &str, at: &DateTime<Tz>) -> String
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        format!("{key}:{}", at.format(self.format()))
    }
}

/// Capacity used by [`RateLimiter::allow_per_second`] for `limit` requests/s
pub fn per_second_capacity(limit: i64) -> i64 {
    if limit < 8 {
        limit.saturating_mul(2)
    } else {
        (limit as f64 * 1.25) as i64
    }
}

pub struct RateLimiter<S> {
    router: Arc<ShardRouter<S>>,
    metrics: Arc<Metrics>,
}

impl<S: RemoteStore> RateLimiter<S> {
    pub fn new(router: Arc<ShardRouter<S>>, metrics: Arc<Metrics>) -> Self {
        Self { router, metrics }
    }

    /// Token bucket check at the current time
    pub async fn allow(
        &self,
        key: &str,
        capacity: i64,
        refill_rate: i64,
        cost: i64,
        bucket_ttl_secs: u64,
    ) -> Result<bool> {
        self.allow_at(key, capacity, refill_rate, cost, bucket_ttl_secs, current_timestamp())
            .await
    }

    /// Token bucket check with an explicit clock, in unix seconds
    pub async fn allow_at(
        &self,
        key: &str,
        capacity: i64,
        refill_rate: i64,
        cost: i64,
        bucket_ttl_secs: u64,
        now: i64,
    ) -> Result<bool> {
        let request = BucketRequest {
            capacity,
            refill_rate,
            cost,
            now,
            ttl_secs: bucket_ttl_secs,
        };
        let allowed = self
            .router
            .route(key)
            .store()
            .take_tokens(key, &request)
            .await
            .map_err(|e| self.store_error(e))?;

        debug!(%key, capacity, refill_rate, cost, allowed, "token bucket");
        Ok(self.record(allowed))
    }

    /// Roughly `limit` requests per second, with some burst headroom
    pub async fn allow_per_second(&self, key: &str, limit: i64, cost: i64) -> Result<bool> {
        self.allow(
            key,
            per_second_capacity(limit),
            limit,
            cost,
            PER_SECOND_BUCKET_TTL_SECS,
        )
        .await
    }

    /// Fixed window check in the current local-time window
    pub async fn allow_window(
        &self,
        key: &str,
        limit: i64,
        cost: i64,
        granularity: Granularity,
    ) -> Result<bool> {
        self.allow_window_at(key, limit, cost, granularity, &Local::now())
            .await
    }

    /// Fixed window check in the window containing `at`
    pub async fn allow_window_at<Tz>(
        &self,
        key: &str,
        limit: i64,
        cost: i64,
        granularity: Granularity,
        at: &DateTime<Tz>,
    ) -> Result<bool>
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        let window_key = granularity.window_key(key, at);
        let store = self.router.route(key).store();

        let count = match store.incr_by(&window_key, cost).await {
            Ok(count) => count,
            Err(StoreError::Overflow) => {
                // already past any limit
                warn!(key = %window_key, "window counter would overflow, denying");
                return Ok(self.record(false));
            }
            Err(e) => return Err(self.store_error(e)),
        };

        if count == cost {
            store
                .expire(&window_key, granularity.window_secs())
                .await
                .map_err(|e| self.store_error(e))?;
        }

        let allowed = count <= limit;
        debug!(key = %window_key, count, limit, allowed, "fixed window");
        Ok(self.record(allowed))
    }

    pub async fn allow_second(&self, key: &str, limit: i64, cost: i64) -> Result<bool> {
        self.allow_window(key, limit, cost, Granularity::Second).await
    }

    pub async fn allow_minute(&self, key: &str, limit: i64, cost: i64) -> Result<bool> {
        self.allow_window(key, limit, cost, Granularity::Minute).await
    }

    pub async fn allow_hour(&self, key: &str, limit: i64, cost: i64) -> Result<bool> {
        self.allow_window(key, limit, cost, Granularity::Hour).await
    }

    pub async fn allow_day(&self, key: &str, limit: i64, cost: i64) -> Result<bool> {
        self.allow_window(key, limit, cost, Granularity::Day).await
    }

    fn record(&self, allowed: bool) -> bool {
        if allowed {
            self.metrics.limiter_allowed.inc();
        } else {
            self.metrics.limiter_denied.inc();
        }
        allowed
    }

    fn store_error(&self, err: StoreError) -> Error {
        self.metrics.store_errors.inc();
        Error::Store(err)
    }
}
