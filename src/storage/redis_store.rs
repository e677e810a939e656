//! Redis backend
//!
//! One [`deadpool_redis`] pool per backend instance. The lock release and the
//! token bucket run as Lua scripts through [`redis::Script`], which sends
//! EVALSHA and falls back to EVAL when the server has not cached the script.

use super::{BucketRequest, RemoteStore};
use crate::StoreError;
use crate::config::ShardConfig;
use bytes::Bytes;
use deadpool_redis::{Config as PoolSetup, Pool, PoolConfig, Runtime, Timeouts};
use std::collections::HashMap;
use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info};

/// Error text Redis returns when INCRBY/HINCRBY would leave the i64 range
const OVERFLOW_FLAG: &[u8] = b"increment or decrement would overflow";

static RELEASE_SCRIPT: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
    ",
    )
});

static TOKEN_BUCKET_SCRIPT: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        local key      = KEYS[1]
        local capacity = tonumber(ARGV[1])
        local now      = tonumber(ARGV[2])
        local rate     = tonumber(ARGV[3])
        local cost     = tonumber(ARGV[4])
        local ttl      = tonumber(ARGV[5])

        local bucket = redis.call('HMGET', key, 'last_add_time', 'remain_token_num')
        if not bucket[1] then
            if cost > capacity then
                redis.call('HSET', key, 'last_add_time', now, 'remain_token_num', capacity)
                redis.call('EXPIRE', key, ttl)
                return 0
            end
            redis.call('HSET', key, 'last_add_time', now, 'remain_token_num', capacity - cost)
            redis.call('EXPIRE', key, ttl)
            return 1
        end

        local lastAddTime = tonumber(bucket[1])
        local remain      = tonumber(bucket[2]) or 0

        local added = (now - lastAddTime) * rate
        if added > 0 then
            remain = math.min(remain + added, capacity)
            redis.call('HSET', key, 'last_add_time', now, 'remain_token_num', remain)
            redis.call('EXPIRE', key, ttl)
        end

        if cost > remain then
            return 0
        end

        redis.call('HSET', key, 'remain_token_num', remain - cost)
        redis.call('EXPIRE', key, ttl)
        return 1
    ",
    )
});

/// Pooled connection to one Redis instance
pub struct RedisStore {
    pool: Pool,
    id: String,
    command_timeout: Option<Duration>,
    max_idle: usize,
    max_conn_lifetime: Option<Duration>,
    idle_timeout: Option<Duration>,
}

impl RedisStore {
    /// Build the pool for a shard. No connection is made until first use.
    pub fn open(config: &ShardConfig) -> Result<Self, StoreError> {
        let mut timeouts = Timeouts::default();
        // wait = false fails fast when every connection is checked out
        timeouts.wait = if config.wait {
            None
        } else {
            Some(Duration::ZERO)
        };
        timeouts.create = config.connect_timeout();
        timeouts.recycle = config.command_timeout();

        let mut pool_config = PoolConfig::new(config.max_active);
        pool_config.timeouts = timeouts;

        let mut setup = PoolSetup::from_connection_info(config.connection_info());
        setup.pool = Some(pool_config);
        let pool = setup.create_pool(Some(Runtime::Tokio1))?;

        info!(
            shard = %config.instance_id(),
            db = config.db,
            max_active = config.max_active,
            wait = config.wait,
            "Redis pool created"
        );

        Ok(Self {
            pool,
            id: config.instance_id(),
            command_timeout: config.command_timeout(),
            max_idle: config.max_idle,
            max_conn_lifetime: config.max_conn_lifetime(),
            idle_timeout: config.idle_timeout(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Open and idle connection counts
    pub fn pool_status(&self) -> (usize, usize) {
        let status = self.pool.status();
        (status.size, status.available)
    }

    /// Drop pooled connections past their lifetime or idle timeout, and idle
    /// connections beyond `max_idle`. Returns how many were closed.
    pub fn reap(&self) -> usize {
        let mut kept = 0usize;
        let result = self.pool.retain(|_, metrics| {
            if self
                .max_conn_lifetime
                .is_some_and(|max| metrics.age() >= max)
            {
                return false;
            }
            if self
                .idle_timeout
                .is_some_and(|max| metrics.last_used() >= max)
            {
                return false;
            }
            kept += 1;
            kept <= self.max_idle
        });
        let removed = result.removed.len();
        if removed > 0 {
            debug!(shard = %self.id, removed, "Reaped pooled connections");
        }
        removed
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, StoreError> {
        let mut conn = self.pool.get().await?;
        self.bounded(cmd.query_async(&mut conn)).await
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = redis::RedisResult<T>>,
    ) -> Result<T, StoreError> {
        match self.command_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| StoreError::Timeout)?
                .map_err(classify),
            None => fut.await.map_err(classify),
        }
    }
}

/// Map the overflow reply onto its own variant
fn classify(err: redis::RedisError) -> StoreError {
    if memchr::memmem::find(err.to_string().as_bytes(), OVERFLOW_FLAG).is_some() {
        StoreError::Overflow
    } else {
        StoreError::Redis(err)
    }
}

impl RemoteStore for RedisStore {
    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("EX").arg(ttl_secs);
        // SET … NX replies OK when the key was set, nil otherwise
        let reply: Option<String> = self.query(&cmd).await?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        let mut conn = self.pool.get().await?;
        let mut invocation = RELEASE_SCRIPT.key(key);
        invocation.arg(expected);
        let deleted: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        Ok(deleted == 1)
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, Bytes>, StoreError> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        let raw: HashMap<String, Vec<u8>> = self.query(&cmd).await?;
        Ok(raw.into_iter().map(|(k, v)| (k, Bytes::from(v))).collect())
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key).arg(field).arg(value);
        let _: i64 = self.query(&cmd).await?;
        Ok(())
    }

    async fn write_hash(
        &self,
        key: &str,
        fields: &[(&str, Bytes)],
        counter_field: &str,
        ttl_secs: u64,
    ) -> Result<i64, StoreError> {
        let mut hset = redis::cmd("HSET");
        hset.arg(key);
        for (field, value) in fields {
            hset.arg(*field).arg(value.as_ref());
        }

        let mut pipe = redis::pipe();
        pipe.add_command(hset)
            .ignore()
            .cmd("HINCRBY")
            .arg(key)
            .arg(counter_field)
            .arg(1)
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .ignore();

        let mut conn = self.pool.get().await?;
        // a failed HINCRBY fails the reply, but HSET and EXPIRE still ran
        let (count,): (i64,) = self.bounded(pipe.query_async(&mut conn)).await?;
        Ok(count)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut cmd = redis::cmd("INCRBY");
        cmd.arg(key).arg(delta);
        self.query(&cmd).await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("EXPIRE");
        cmd.arg(key).arg(ttl_secs);
        let set: i64 = self.query(&cmd).await?;
        Ok(set == 1)
    }

    async fn take_tokens(&self, key: &str, request: &BucketRequest) -> Result<bool, StoreError> {
        let mut conn = self.pool.get().await?;
        let mut invocation = TOKEN_BUCKET_SCRIPT.key(key);
        invocation
            .arg(request.capacity)
            .arg(request.now)
            .arg(request.refill_rate)
            .arg(request.cost)
            .arg(request.ttl_secs);
        let allowed: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        Ok(allowed == 1)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let _: String = self.query(&redis::cmd("PING")).await?;
        Ok(())
    }
}
