//! Mutable rate limit rules and their resolution into effective limits.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use config::RateLimitConfig;
use parking_lot::RwLock;

type RuleMap = BTreeMap<String, RuleLimits>;

/// The configuration tier a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleScope {
    /// Rules keyed by group name, as `[total, success]`.
    Group,
    /// Rules keyed by principal id, as `[total, success]`. Users win over groups.
    User,
    /// Per-principal rules keyed by model name, as `[total, reserved]`.
    Model,
    /// Rules keyed by model name counted across all principals, as a single ceiling.
    GlobalModel,
}

impl RuleScope {
    fn as_str(self) -> &'static str {
        match self {
            RuleScope::Group => "group",
            RuleScope::User => "user",
            RuleScope::Model => "model",
            RuleScope::GlobalModel => "global model",
        }
    }
}

impl fmt::Display for RuleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limits of one rule. A `total` of `0` means unlimited.
///
/// For global model rules `success` is always `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuleLimits {
    /// Ceiling of attempted requests per window.
    pub total: u32,
    /// Ceiling of successful requests per window.
    pub success: u32,
}

/// Process-wide settings that apply when no rule overrides them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSettings {
    /// Whether admission control runs at all.
    pub enabled: bool,
    /// Counting window, a whole number of seconds.
    pub duration: Duration,
    /// Default per-principal total ceiling.
    pub total_limit: u32,
    /// Default per-principal success ceiling.
    pub success_limit: u32,
    /// Ceiling across all principals and models.
    pub global_limit: u32,
}

impl From<&RateLimitConfig> for RateLimitSettings {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            duration: config.duration,
            total_limit: config.total_limit,
            success_limit: config.success_limit,
            global_limit: config.global_limit,
        }
    }
}

/// Fully resolved ceilings for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveLimits {
    /// Window length in seconds.
    pub duration_secs: u64,
    /// Per-principal total ceiling, `0` for unlimited.
    pub total_max: u32,
    /// Per-principal success ceiling, `0` for unlimited.
    pub success_max: u32,
    /// Model the request targets, if known.
    pub model: Option<String>,
    /// Per-principal total ceiling for the model, `0` when no rule applies.
    pub model_total_max: u32,
    /// Reserved second field of the model rule.
    pub model_success_max: u32,
    /// Ceiling across all principals and models, `0` for unlimited.
    pub global_total_max: u32,
    /// Ceiling for the model across all principals, `0` when no rule applies.
    pub global_model_max: u32,
}

/// Rejected rule or settings update. The previous configuration stays active.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// The candidate was not a JSON object of the expected shape.
    #[error("{scope} rules are not valid JSON: {source}")]
    Parse {
        /// Scope being replaced.
        scope: RuleScope,
        /// Underlying parse failure.
        source: serde_json::Error,
    },

    /// A `[total, success]` pair is out of range.
    #[error("{scope} {key} has invalid rate limit values: [{total}, {success}], {requirement}")]
    InvalidLimits {
        /// Scope being replaced.
        scope: RuleScope,
        /// Rule key.
        key: String,
        /// Submitted total ceiling.
        total: i64,
        /// Submitted success ceiling.
        success: i64,
        /// The violated requirement.
        requirement: &'static str,
    },

    /// A global model ceiling is out of range.
    #[error("global model {key} has invalid rate limit value: {value}, limit must be between 0 and {max}", max = u32::MAX)]
    InvalidGlobalModelLimit {
        /// Model name.
        key: String,
        /// Submitted ceiling.
        value: i64,
    },

    /// The window is shorter than a second or not a whole number of seconds.
    #[error("rate limit duration must be a whole number of seconds of at least one second, got {0:?}")]
    InvalidDuration(Duration),
}

/// Thread-safe holder of the active rules and settings.
///
/// Every map is replaced wholesale. Readers take a cheap snapshot of the current
/// map and never wait on parsing or validation of an update.
pub struct RuleStore {
    settings: RwLock<Arc<RateLimitSettings>>,
    groups: RwLock<Arc<RuleMap>>,
    users: RwLock<Arc<RuleMap>>,
    models: RwLock<Arc<RuleMap>>,
    global_models: RwLock<Arc<RuleMap>>,
}

impl RuleStore {
    /// Create a store with the given settings and no rules.
    pub fn new(settings: RateLimitSettings) -> Result<Self, RuleError> {
        validate_duration(settings.duration)?;

        Ok(Self {
            settings: RwLock::new(Arc::new(settings)),
            groups: RwLock::default(),
            users: RwLock::default(),
            models: RwLock::default(),
            global_models: RwLock::default(),
        })
    }

    /// Create a store from the server configuration.
    pub fn from_config(config: &RateLimitConfig) -> Result<Self, RuleError> {
        let store = Self::new(RateLimitSettings::from(config))?;

        for (scope, rules) in [
            (RuleScope::Group, &config.groups),
            (RuleScope::User, &config.users),
            (RuleScope::Model, &config.models),
        ] {
            let candidate = rules
                .iter()
                .map(|(key, [total, success])| (key.clone(), [i64::from(*total), i64::from(*success)]))
                .collect();

            store.install(scope, validate_pairs(scope, candidate)?);
        }

        let candidate = config
            .global_models
            .iter()
            .map(|(key, limit)| (key.clone(), i64::from(*limit)))
            .collect();

        store.install(RuleScope::GlobalModel, validate_global_models(candidate)?);

        Ok(store)
    }

    /// Look up the rule for `key` in `scope`.
    pub fn get(&self, scope: RuleScope, key: &str) -> Option<RuleLimits> {
        self.map(scope).read().get(key).copied()
    }

    /// Whether `scope` holds at least one rule.
    pub fn has_rules(&self, scope: RuleScope) -> bool {
        !self.map(scope).read().is_empty()
    }

    /// Whether any model scoped rule exists, which decides if the model of a
    /// request needs to be known at all.
    pub fn has_model_rules(&self) -> bool {
        self.has_rules(RuleScope::Model) || self.has_rules(RuleScope::GlobalModel)
    }

    /// Parse and validate a full candidate map, then swap it in.
    ///
    /// Group and user rules are `{"key": [total, success]}` with `total >= 0` and
    /// `success >= 1`. Model rules share the shape with both fields `>= 0`.
    /// Global model rules are `{"model": max}` with `max >= 0`.
    pub fn replace_all(&self, scope: RuleScope, json: &str) -> Result<(), RuleError> {
        let candidate = parse(scope, json)?;
        self.install(scope, candidate);

        log::debug!("Replaced {scope} rate limit rules");

        Ok(())
    }

    /// Validate a candidate map without applying it.
    pub fn check_json(&self, scope: RuleScope, json: &str) -> Result<(), RuleError> {
        parse(scope, json).map(|_| ())
    }

    /// Serialize the rules of `scope` in the format `replace_all` accepts.
    pub fn export_json(&self, scope: RuleScope) -> String {
        let snapshot = self.map(scope).read().clone();

        let serialized = match scope {
            RuleScope::GlobalModel => {
                let rules: BTreeMap<&str, u32> = snapshot.iter().map(|(k, v)| (k.as_str(), v.total)).collect();
                serde_json::to_string(&rules)
            }
            _ => {
                let rules: BTreeMap<&str, [u32; 2]> = snapshot
                    .iter()
                    .map(|(k, v)| (k.as_str(), [v.total, v.success]))
                    .collect();

                serde_json::to_string(&rules)
            }
        };

        serialized.unwrap_or_else(|e| {
            log::error!("Failed to serialize {scope} rate limit rules: {e}");
            "{}".to_string()
        })
    }

    /// The active settings.
    pub fn settings(&self) -> Arc<RateLimitSettings> {
        self.settings.read().clone()
    }

    /// Replace the process-wide settings.
    pub fn replace_settings(&self, settings: RateLimitSettings) -> Result<(), RuleError> {
        validate_duration(settings.duration)?;
        *self.settings.write() = Arc::new(settings);

        Ok(())
    }

    /// Resolve the effective limits for one request.
    ///
    /// Per-principal limits start from the defaults, are overridden by the group
    /// rule and then by the user rule. Model and global limits are added on top.
    pub fn resolve(&self, principal: &str, group: Option<&str>, model: Option<&str>) -> EffectiveLimits {
        let settings = self.settings();

        let mut limits = EffectiveLimits {
            duration_secs: settings.duration.as_secs(),
            total_max: settings.total_limit,
            success_max: settings.success_limit,
            model: model.map(str::to_string),
            model_total_max: 0,
            model_success_max: 0,
            global_total_max: settings.global_limit,
            global_model_max: 0,
        };

        if let Some(group) = group
            && let Some(rule) = self.get(RuleScope::Group, group)
        {
            limits.total_max = rule.total;
            limits.success_max = rule.success;
        }

        if let Some(rule) = self.get(RuleScope::User, principal) {
            limits.total_max = rule.total;
            limits.success_max = rule.success;
        }

        if let Some(model) = model {
            // A model rule whose second field is 0 is kept but inactive.
            if let Some(rule) = self.get(RuleScope::Model, model)
                && rule.success >= 1
            {
                limits.model_total_max = rule.total;
                limits.model_success_max = rule.success;
            }

            if let Some(rule) = self.get(RuleScope::GlobalModel, model) {
                limits.global_model_max = rule.total;
            }
        }

        limits
    }

    fn map(&self, scope: RuleScope) -> &RwLock<Arc<RuleMap>> {
        match scope {
            RuleScope::Group => &self.groups,
            RuleScope::User => &self.users,
            RuleScope::Model => &self.models,
            RuleScope::GlobalModel => &self.global_models,
        }
    }

    fn install(&self, scope: RuleScope, rules: RuleMap) {
        *self.map(scope).write() = Arc::new(rules);
    }
}

fn parse(scope: RuleScope, json: &str) -> Result<RuleMap, RuleError> {
    match scope {
        RuleScope::GlobalModel => {
            let candidate = serde_json::from_str(json).map_err(|source| RuleError::Parse { scope, source })?;
            validate_global_models(candidate)
        }
        _ => {
            let candidate = serde_json::from_str(json).map_err(|source| RuleError::Parse { scope, source })?;
            validate_pairs(scope, candidate)
        }
    }
}

fn validate_pairs(scope: RuleScope, candidate: BTreeMap<String, [i64; 2]>) -> Result<RuleMap, RuleError> {
    let min_success = match scope {
        RuleScope::Group | RuleScope::User => 1,
        _ => 0,
    };

    let mut rules = RuleMap::new();

    for (key, [total, success]) in candidate {
        let requirement = if total < 0 {
            Some("total limit must be >= 0")
        } else if success < min_success {
            Some(if min_success == 1 {
                "success limit must be >= 1"
            } else {
                "second value must be >= 0"
            })
        } else if total > i64::from(u32::MAX) || success > i64::from(u32::MAX) {
            Some("values must fit in 32 bits")
        } else {
            None
        };

        if let Some(requirement) = requirement {
            return Err(RuleError::InvalidLimits {
                scope,
                key,
                total,
                success,
                requirement,
            });
        }

        let limits = RuleLimits {
            total: total as u32,
            success: success as u32,
        };

        rules.insert(key, limits);
    }

    Ok(rules)
}

fn validate_global_models(candidate: BTreeMap<String, i64>) -> Result<RuleMap, RuleError> {
    let mut rules = RuleMap::new();

    for (key, value) in candidate {
        let Ok(total) = u32::try_from(value) else {
            return Err(RuleError::InvalidGlobalModelLimit { key, value });
        };

        rules.insert(key, RuleLimits { total, success: 0 });
    }

    Ok(rules)
}

fn validate_duration(duration: Duration) -> Result<(), RuleError> {
    if duration.as_secs() == 0 || duration.subsec_nanos() != 0 {
        return Err(RuleError::InvalidDuration(duration));
    }

    Ok(())
}
