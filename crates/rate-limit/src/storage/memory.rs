//! In-memory rate limit storage for single-instance deployments.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::{RateLimitStorage, SlidingWindow, StorageError, TokenBucket, window_allows};
use crate::key::CounterKey;

const SWEEP_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Default)]
struct BucketState {
    tokens: u64,
    ts: u64,
    expires_at: u64,
}

#[derive(Debug, Default)]
struct WindowLog {
    /// Unix seconds, newest first.
    entries: VecDeque<u64>,
    expires_at: u64,
}

trait Expiring {
    fn expires_at(&self) -> u64;
}

impl Expiring for BucketState {
    fn expires_at(&self) -> u64 {
        self.expires_at
    }
}

impl Expiring for WindowLog {
    fn expires_at(&self) -> u64 {
        self.expires_at
    }
}

/// In-memory rate limit storage implementation.
///
/// Every key owns its own lock, so requests for unrelated keys never wait on
/// each other. A key expires like its Redis counterpart: a bucket once it
/// would have refilled completely, a log one window after it was last
/// written or found saturated. Expiry is measured against the `now` of each
/// call with the window of that call, and expired keys are swept from memory
/// at most once a minute.
pub struct InMemoryStorage {
    buckets: DashMap<CounterKey, Arc<Mutex<BucketState>>>,
    windows: DashMap<CounterKey, Arc<Mutex<WindowLog>>>,
    next_sweep: AtomicU64,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    /// Create a new, empty in-memory storage.
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
            windows: DashMap::new(),
            next_sweep: AtomicU64::new(0),
        }
    }

    fn get_or_create<T>(map: &DashMap<CounterKey, Arc<Mutex<T>>>, key: &CounterKey) -> Arc<Mutex<T>>
    where
        T: Default,
    {
        if let Some(state) = map.get(key) {
            return Arc::clone(state.value());
        }

        let entry = map.entry(key.clone()).or_insert_with(|| {
            log::debug!("Creating in-memory rate limit state for {key}");
            Arc::new(Mutex::new(T::default()))
        });

        Arc::clone(entry.value())
    }

    /// Drop every expired key nobody is using, if the last sweep is a minute old.
    fn sweep(&self, now_ms: u64) {
        let due = self.next_sweep.load(Ordering::Relaxed);

        if now_ms < due {
            return;
        }

        let next = now_ms.saturating_add(SWEEP_INTERVAL_MS);

        if self
            .next_sweep
            .compare_exchange(due, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let evicted = evict_expired(&self.buckets, now_ms) + evict_expired(&self.windows, now_ms);

        if evicted > 0 {
            log::debug!("Evicted {evicted} expired in-memory rate limit counters");
        }
    }
}

fn evict_expired<T: Expiring>(map: &DashMap<CounterKey, Arc<Mutex<T>>>, now_ms: u64) -> usize {
    let before = map.len();

    // States are only cloned out under the shard lock, so a count of one means
    // no request holds this state and locking it here cannot block.
    map.retain(|_, state| Arc::strong_count(state) > 1 || state.lock().expires_at() > now_ms);

    before.saturating_sub(map.len())
}

impl RateLimitStorage for InMemoryStorage {
    async fn allow(&self, key: &CounterKey, bucket: TokenBucket, now: Duration) -> Result<bool, StorageError> {
        let now_ms = now.as_millis() as u64;
        self.sweep(now_ms);

        let state = Self::get_or_create(&self.buckets, key);
        let mut state = state.lock();

        if now_ms >= state.expires_at {
            state.tokens = bucket.capacity;
            state.ts = now_ms;
        }

        let (tokens, ts, allowed) = bucket.take(state.tokens, state.ts, now_ms);

        state.tokens = tokens;
        state.ts = ts;
        state.expires_at = now_ms.saturating_add(bucket.ttl().as_millis() as u64);

        Ok(allowed)
    }

    async fn check_window(&self, key: &CounterKey, window: SlidingWindow, now: Duration) -> Result<bool, StorageError> {
        if window.max_count == 0 {
            return Ok(true);
        }

        let now_ms = now.as_millis() as u64;
        self.sweep(now_ms);

        let Some(log) = self.windows.get(key).map(|log| Arc::clone(log.value())) else {
            return Ok(true);
        };

        let mut log = log.lock();

        if now_ms >= log.expires_at {
            log.entries.clear();
            return Ok(true);
        }

        let allowed = window_allows(window, log.entries.len(), log.entries.back().copied(), now);

        if !allowed {
            log.expires_at = now_ms.saturating_add(window.window.as_millis() as u64);
        }

        Ok(allowed)
    }

    async fn record_entry(&self, key: &CounterKey, window: SlidingWindow, now: Duration) -> Result<(), StorageError> {
        if window.max_count == 0 {
            return Ok(());
        }

        let now_ms = now.as_millis() as u64;
        self.sweep(now_ms);

        let log = Self::get_or_create(&self.windows, key);
        let mut log = log.lock();

        if now_ms >= log.expires_at {
            log.entries.clear();
        }

        log.entries.push_front(now.as_secs());
        log.entries.truncate(window.max_count as usize);
        log.expires_at = now_ms.saturating_add(window.window.as_millis() as u64);

        Ok(())
    }
}
