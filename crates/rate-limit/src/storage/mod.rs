//! Storage backends for rate limiting.

use std::time::Duration;

use crate::key::CounterKey;

pub mod memory;
pub mod redis;
mod redis_pool;

pub use memory::InMemoryStorage;
pub use self::redis::RedisStorage;

/// Parameters of a token bucket, in milli-tokens and milliseconds.
///
/// A bucket built with [`TokenBucket::for_limit`] admits at most `max` requests
/// per window on average, with bursts of up to one full window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucket {
    /// Maximum number of milli-tokens the bucket holds.
    pub capacity: u64,
    /// Milli-tokens added per elapsed millisecond.
    pub rate: u64,
    /// Milli-tokens one request consumes.
    pub cost: u64,
}

impl TokenBucket {
    /// A bucket admitting `max` requests per `window_secs` seconds.
    ///
    /// The capacity is `max * window_secs` tokens refilled at `max` tokens per
    /// second, and one request costs `window_secs` tokens.
    pub fn for_limit(max: u32, window_secs: u64) -> Self {
        let max = u64::from(max);

        Self {
            capacity: max.saturating_mul(window_secs).saturating_mul(1000),
            rate: max,
            cost: window_secs.saturating_mul(1000),
        }
    }

    /// How long an untouched bucket needs to refill completely, at least a second.
    pub fn ttl(&self) -> Duration {
        let millis = self.capacity.div_ceil(self.rate.max(1)).max(1000);
        Duration::from_millis(millis)
    }

    /// Refill `tokens` for the time elapsed since `last_ms` and try to take one
    /// request's cost. Returns the new state and whether the request fits.
    ///
    /// The returned timestamp never moves backwards.
    pub fn take(&self, tokens: u64, last_ms: u64, now_ms: u64) -> (u64, u64, bool) {
        let elapsed = now_ms.saturating_sub(last_ms);
        let tokens = tokens.saturating_add(elapsed.saturating_mul(self.rate)).min(self.capacity);
        let ts = last_ms.max(now_ms);

        if tokens >= self.cost {
            (tokens - self.cost, ts, true)
        } else {
            (tokens, ts, false)
        }
    }
}

/// Parameters of a sliding window log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindow {
    /// Maximum number of entries within the window. `0` means unlimited.
    pub max_count: u32,
    /// Window length. Also the idle expiry of the log.
    pub window: Duration,
}

/// Trait for rate limit storage backends.
///
/// `now` is the time since the Unix epoch, sampled once by the caller.
#[allow(async_fn_in_trait)]
pub trait RateLimitStorage: Send + Sync {
    /// Atomically refill the bucket at `key` and consume one request's cost.
    async fn allow(&self, key: &CounterKey, bucket: TokenBucket, now: Duration) -> Result<bool, StorageError>;

    /// Whether one more entry fits the log at `key`, without recording it.
    async fn check_window(&self, key: &CounterKey, window: SlidingWindow, now: Duration) -> Result<bool, StorageError>;

    /// Push an entry for `now` to the log at `key` and trim it to `max_count`.
    async fn record_entry(&self, key: &CounterKey, window: SlidingWindow, now: Duration) -> Result<(), StorageError>;
}

/// Errors that can occur in storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backend could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A command failed.
    #[error("Query error: {0}")]
    Query(String),

    /// A command did not answer in time.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Stored data could not be interpreted.
    #[error("Malformed data at {key}: {value}")]
    MalformedData {
        /// Storage key holding the value.
        key: String,
        /// The offending value.
        value: String,
    },
}

/// Decision of the sliding window log for a list of `len` entries whose oldest
/// entry is `oldest_secs`.
pub(crate) fn window_allows(window: SlidingWindow, len: usize, oldest_secs: Option<u64>, now: Duration) -> bool {
    if window.max_count == 0 || len < window.max_count as usize {
        return true;
    }

    match oldest_secs {
        Some(oldest) => now.as_secs().saturating_sub(oldest) >= window.window.as_secs(),
        None => true,
    }
}
