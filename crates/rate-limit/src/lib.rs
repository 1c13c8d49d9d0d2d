//! Admission control for the gateway.
//!
//! Every request is checked against up to five independent quota dimensions:
//! - Global total requests (token bucket)
//! - Global requests per model (token bucket)
//! - Successful requests per principal (sliding window log)
//! - Total requests per principal (token bucket)
//! - Total requests per principal and model (token bucket)
//!
//! Counters live either in process memory or in Redis, shared by all gateway
//! instances. Both backends make the same decisions for the same inputs.

#![deny(missing_docs)]

mod clock;
mod error;
mod key;
mod manager;
mod metrics;
mod request;
mod rules;
mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CHECK_FAILED_MESSAGE, Dimension, RateLimitError};
pub use key::CounterKey;
pub use manager::{Admission, RateLimitManager};
pub use metrics::{RATE_LIMIT_DECISIONS, RATE_LIMIT_RECORD_FAILURES};
pub use request::{RateLimitRequest, RateLimitRequestBuilder};
pub use rules::{EffectiveLimits, RateLimitSettings, RuleError, RuleLimits, RuleScope, RuleStore};
pub use storage::{InMemoryStorage, RateLimitStorage, RedisStorage, SlidingWindow, StorageError, TokenBucket};
