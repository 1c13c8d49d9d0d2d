//! Redis-based rate limit storage shared by all gateway instances.

use std::future::Future;
use std::time::Duration;

use redis::{RedisError, RedisResult, Script};

use super::redis_pool::{Pool, create_pool};
use super::{RateLimitStorage, SlidingWindow, StorageError, TokenBucket, window_allows};
use crate::key::CounterKey;
use config::RedisConfig;

// Mirrors `TokenBucket::take`. Values are integers well below 2^53, so Lua
// doubles represent them exactly.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])

if tokens == nil or ts == nil then
  tokens = capacity
  ts = now
end

local elapsed = now - ts
if elapsed < 0 then
  elapsed = 0
end

tokens = math.min(capacity, tokens + elapsed * rate)

if now > ts then
  ts = now
end

local allowed = 0
if tokens >= cost then
  tokens = tokens - cost
  allowed = 1
end

redis.call('HSET', KEYS[1], 'tokens', string.format('%.0f', tokens), 'ts', string.format('%.0f', ts))
redis.call('PEXPIRE', KEYS[1], ttl)

return allowed
"#;

/// Redis-based rate limit storage implementation.
pub struct RedisStorage {
    pool: Pool,
    key_prefix: String,
    response_timeout: Duration,
    token_bucket: Script,
}

impl RedisStorage {
    /// Create a new Redis storage instance and verify the server answers.
    pub async fn new(config: &RedisConfig) -> Result<Self, StorageError> {
        let storage = Self::lazy(config)?;
        let mut conn = storage.connection().await?;

        let _: String = storage
            .timed(redis::cmd("PING").query_async(&mut *conn))
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to ping Redis server: {e}")))?;

        log::debug!("Connected to Redis rate limit storage with key prefix '{}'", storage.key_prefix);

        Ok(storage)
    }

    /// Create the storage without contacting the server.
    pub(crate) fn lazy(config: &RedisConfig) -> Result<Self, StorageError> {
        let pool = create_pool(config)
            .map_err(|e| StorageError::Connection(format!("Failed to create Redis connection pool: {e}")))?;

        Ok(Self {
            pool,
            key_prefix: config.key_prefix.clone(),
            response_timeout: config.response_timeout.unwrap_or(Duration::from_secs(1)),
            token_bucket: Script::new(TOKEN_BUCKET_SCRIPT),
        })
    }

    fn storage_key(&self, key: &CounterKey) -> String {
        format!("{}{}", self.key_prefix, key.canonical())
    }

    async fn connection(&self) -> Result<deadpool::managed::Object<super::redis_pool::Manager>, StorageError> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to get Redis connection from pool: {e}")))
    }

    async fn timed<T>(&self, operation: impl Future<Output = RedisResult<T>>) -> Result<T, StorageError> {
        match tokio::time::timeout(self.response_timeout, operation).await {
            Ok(result) => result.map_err(command_error),
            Err(_) => Err(StorageError::Timeout(self.response_timeout)),
        }
    }
}

fn command_error(error: RedisError) -> StorageError {
    if error.is_io_error() || error.is_connection_dropped() || error.is_connection_refusal() {
        StorageError::Connection(error.to_string())
    } else {
        StorageError::Query(error.to_string())
    }
}

impl RateLimitStorage for RedisStorage {
    async fn allow(&self, key: &CounterKey, bucket: TokenBucket, now: Duration) -> Result<bool, StorageError> {
        let key = self.storage_key(key);
        let mut conn = self.connection().await?;

        let allowed: i64 = self
            .timed(
                self.token_bucket
                    .key(&key)
                    .arg(bucket.capacity)
                    .arg(bucket.rate)
                    .arg(bucket.cost)
                    .arg(now.as_millis() as u64)
                    .arg(bucket.ttl().as_millis() as u64)
                    .invoke_async(&mut *conn),
            )
            .await?;

        Ok(allowed == 1)
    }

    async fn check_window(&self, key: &CounterKey, window: SlidingWindow, now: Duration) -> Result<bool, StorageError> {
        if window.max_count == 0 {
            return Ok(true);
        }

        let key = self.storage_key(key);
        let mut conn = self.connection().await?;

        let (len, oldest): (usize, Option<String>) = self
            .timed(redis::pipe().atomic().llen(&key).lindex(&key, -1).query_async(&mut *conn))
            .await?;

        let oldest = match oldest {
            Some(value) => match value.parse::<u64>() {
                Ok(secs) => Some(secs),
                Err(_) => return Err(StorageError::MalformedData { key, value }),
            },
            None => None,
        };

        let allowed = window_allows(window, len, oldest, now);

        if !allowed {
            // Keep a log that is saturated from expiring in the middle of a burst.
            let () = self
                .timed(
                    redis::cmd("EXPIRE")
                        .arg(&key)
                        .arg(window.window.as_secs())
                        .query_async(&mut *conn),
                )
                .await?;
        }

        Ok(allowed)
    }

    async fn record_entry(&self, key: &CounterKey, window: SlidingWindow, now: Duration) -> Result<(), StorageError> {
        if window.max_count == 0 {
            return Ok(());
        }

        let key = self.storage_key(key);
        let mut conn = self.connection().await?;

        let () = self
            .timed(
                redis::pipe()
                    .atomic()
                    .lpush(&key, now.as_secs())
                    .ignore()
                    .ltrim(&key, 0, window.max_count as isize - 1)
                    .ignore()
                    .expire(&key, window.window.as_secs() as i64)
                    .ignore()
                    .query_async(&mut *conn),
            )
            .await?;

        Ok(())
    }
}
