//! Rate limit manager implementation.

use std::sync::Arc;
use std::time::Duration;

use config::{RateLimitConfig, StorageConfig};

use crate::clock::{Clock, SystemClock};
use crate::error::{Dimension, RateLimitError};
use crate::key::CounterKey;
use crate::metrics::{Metrics, Outcome};
use crate::request::RateLimitRequest;
use crate::rules::{EffectiveLimits, RuleStore};
use crate::storage::{InMemoryStorage, RateLimitStorage, RedisStorage, SlidingWindow, StorageError, TokenBucket};

/// Storage backend for rate limiting.
enum Storage {
    Memory(InMemoryStorage),
    Redis(RedisStorage),
}

impl Storage {
    async fn allow(&self, key: &CounterKey, bucket: TokenBucket, now: Duration) -> Result<bool, StorageError> {
        match self {
            Storage::Memory(storage) => storage.allow(key, bucket, now).await,
            Storage::Redis(storage) => storage.allow(key, bucket, now).await,
        }
    }

    async fn check_window(&self, key: &CounterKey, window: SlidingWindow, now: Duration) -> Result<bool, StorageError> {
        match self {
            Storage::Memory(storage) => storage.check_window(key, window, now).await,
            Storage::Redis(storage) => storage.check_window(key, window, now).await,
        }
    }

    async fn record_entry(&self, key: &CounterKey, window: SlidingWindow, now: Duration) -> Result<(), StorageError> {
        match self {
            Storage::Memory(storage) => storage.record_entry(key, window, now).await,
            Storage::Redis(storage) => storage.record_entry(key, window, now).await,
        }
    }
}

/// Permission for one request to proceed.
///
/// Hand it back to [`RateLimitManager::record_outcome`] once the response status
/// is known, so the success of the request is counted.
#[derive(Debug)]
#[must_use = "an admission must be handed back to record_outcome"]
pub struct Admission {
    principal: Option<String>,
    window: SlidingWindow,
}

impl Admission {
    fn pass_through() -> Self {
        Self {
            principal: None,
            window: SlidingWindow {
                max_count: 0,
                window: Duration::ZERO,
            },
        }
    }

    /// Whether admission control ran for this request.
    pub fn is_pass_through(&self) -> bool {
        self.principal.is_none()
    }
}

/// Manager for multi-tier admission control.
pub struct RateLimitManager {
    rules: Arc<RuleStore>,
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

impl RateLimitManager {
    /// Create a new rate limit manager with configured storage backend.
    ///
    /// A Redis backend is verified with a `PING` only when rate limiting starts
    /// enabled. Otherwise its first connection happens once it is enabled.
    pub async fn new(config: &RateLimitConfig) -> Result<Self, RateLimitError> {
        let rules = RuleStore::from_config(config)?;

        let storage = match &config.storage {
            StorageConfig::Memory => Storage::Memory(InMemoryStorage::new()),
            StorageConfig::Redis(redis_config) if config.enabled => {
                Storage::Redis(RedisStorage::new(redis_config).await?)
            }
            StorageConfig::Redis(redis_config) => Storage::Redis(RedisStorage::lazy(redis_config)?),
        };

        log::debug!(
            "Rate limiting initialized with {} storage, enabled: {}",
            match storage {
                Storage::Memory(_) => "memory",
                Storage::Redis(_) => "redis",
            },
            config.enabled
        );

        Ok(Self {
            rules: Arc::new(rules),
            storage: Arc::new(storage),
            clock: Arc::new(SystemClock),
            metrics: Metrics::new(),
        })
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Check if rate limiting is enabled.
    pub fn is_enabled(&self) -> bool {
        self.rules.settings().enabled
    }

    /// The rules and settings in effect. Updates apply to the next request.
    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    /// Whether the model of a request matters for any configured rule.
    pub fn needs_model(&self) -> bool {
        self.rules.has_model_rules()
    }

    /// Check all applicable rate limits for a request.
    ///
    /// This checks in order: global total, global per model, the success window
    /// of the principal, the total of the principal and the total of the
    /// principal for the model. The first denial stops the pipeline. All checks
    /// but the success window consume their quota immediately.
    pub async fn check_request(&self, request: &RateLimitRequest) -> Result<Admission, RateLimitError> {
        if !self.is_enabled() {
            return Ok(Admission::pass_through());
        }

        let limits = self
            .rules
            .resolve(&request.principal, request.group.as_deref(), request.model.as_deref());

        let now = self.clock.now();

        log::debug!("Checking rate limits for principal {}: {limits:?}", request.principal);

        self.check_global_total(&limits, now).await?;
        self.check_global_model(&limits, now).await?;
        let window = self.check_user_success(request, &limits, now).await?;
        self.check_user_total(request, &limits, now).await?;
        self.check_user_model(request, &limits, now).await?;

        Ok(Admission {
            principal: Some(request.principal.clone()),
            window,
        })
    }

    /// Report the outcome of an admitted request.
    ///
    /// A successful request adds one entry to the success window of its
    /// principal. Failures to record are logged and otherwise ignored.
    pub async fn record_outcome(&self, admission: Admission, success: bool) {
        let Some(principal) = admission.principal else {
            return;
        };

        if !success {
            log::debug!("Request of principal {principal} failed, not counting it as a success");
            return;
        }

        let key = CounterKey::UserSuccess { principal };

        if let Err(e) = self.storage.record_entry(&key, admission.window, self.clock.now()).await {
            log::warn!("Failed to record successful request for {key}: {e}");
            self.metrics.record_failure();
        }
    }

    async fn check_global_total(&self, limits: &EffectiveLimits, now: Duration) -> Result<(), RateLimitError> {
        if limits.global_total_max == 0 {
            return Ok(());
        }

        let key = CounterKey::GlobalTotal;
        let bucket = TokenBucket::for_limit(limits.global_total_max, limits.duration_secs);
        let result = self.storage.allow(&key, bucket, now).await;

        self.conclude(Dimension::GlobalTotal, &key, result, || RateLimitError::GlobalLimitExceeded)
    }

    async fn check_global_model(&self, limits: &EffectiveLimits, now: Duration) -> Result<(), RateLimitError> {
        let Some(model) = &limits.model else {
            return Ok(());
        };

        if limits.global_model_max == 0 {
            return Ok(());
        }

        let key = CounterKey::GlobalModel { model: model.clone() };
        let bucket = TokenBucket::for_limit(limits.global_model_max, limits.duration_secs);
        let result = self.storage.allow(&key, bucket, now).await;

        self.conclude(Dimension::GlobalModel, &key, result, || {
            RateLimitError::GlobalModelLimitExceeded { model: model.clone() }
        })
    }

    async fn check_user_success(
        &self,
        request: &RateLimitRequest,
        limits: &EffectiveLimits,
        now: Duration,
    ) -> Result<SlidingWindow, RateLimitError> {
        let window = SlidingWindow {
            max_count: limits.success_max,
            window: Duration::from_secs(limits.duration_secs),
        };

        let key = CounterKey::UserSuccess {
            principal: request.principal.clone(),
        };

        let result = self.storage.check_window(&key, window, now).await;
        self.conclude(Dimension::UserSuccess, &key, result, || RateLimitError::SuccessLimitExceeded)?;

        Ok(window)
    }

    async fn check_user_total(
        &self,
        request: &RateLimitRequest,
        limits: &EffectiveLimits,
        now: Duration,
    ) -> Result<(), RateLimitError> {
        if limits.total_max == 0 {
            return Ok(());
        }

        let key = CounterKey::UserTotal {
            principal: request.principal.clone(),
        };

        let bucket = TokenBucket::for_limit(limits.total_max, limits.duration_secs);
        let result = self.storage.allow(&key, bucket, now).await;

        self.conclude(Dimension::UserTotal, &key, result, || RateLimitError::TotalLimitExceeded)
    }

    async fn check_user_model(
        &self,
        request: &RateLimitRequest,
        limits: &EffectiveLimits,
        now: Duration,
    ) -> Result<(), RateLimitError> {
        let Some(model) = &limits.model else {
            return Ok(());
        };

        if limits.model_total_max == 0 {
            return Ok(());
        }

        let key = CounterKey::UserModel {
            principal: request.principal.clone(),
            model: model.clone(),
        };

        let bucket = TokenBucket::for_limit(limits.model_total_max, limits.duration_secs);
        let result = self.storage.allow(&key, bucket, now).await;

        self.conclude(Dimension::UserModel, &key, result, || RateLimitError::ModelLimitExceeded {
            model: model.clone(),
        })
    }

    fn conclude(
        &self,
        dimension: Dimension,
        key: &CounterKey,
        result: Result<bool, StorageError>,
        denial: impl FnOnce() -> RateLimitError,
    ) -> Result<(), RateLimitError> {
        match result {
            Ok(true) => {
                self.metrics.decision(dimension, Outcome::Allowed);
                Ok(())
            }
            Ok(false) => {
                log::debug!("Rate limit exceeded for {key}");
                self.metrics.decision(dimension, Outcome::Denied);
                Err(denial())
            }
            Err(e) => {
                log::error!("Rate limit check of {dimension} for {key} failed: {e}");
                self.metrics.decision(dimension, Outcome::Error);
                Err(e.into())
            }
        }
    }
}
