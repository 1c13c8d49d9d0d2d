//! Error types for rate limiting.

use std::fmt;

use http::StatusCode;

use crate::rules::RuleError;
use crate::storage::StorageError;

/// Message returned to clients when a backend operation fails.
pub const CHECK_FAILED_MESSAGE: &str = "rate_limit_check_failed";

/// One independently gated quota axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    /// Attempted requests across all principals and models.
    GlobalTotal,
    /// Attempted requests for one model across all principals.
    GlobalModel,
    /// Successful requests of one principal.
    UserSuccess,
    /// Attempted requests of one principal.
    UserTotal,
    /// Attempted requests of one principal for one model.
    UserModel,
}

impl Dimension {
    /// Stable name used in logs and metric attributes.
    pub fn as_str(self) -> &'static str {
        match self {
            Dimension::GlobalTotal => "global_total",
            Dimension::GlobalModel => "global_model",
            Dimension::UserSuccess => "user_success",
            Dimension::UserTotal => "user_total",
            Dimension::UserModel => "user_model",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during rate limiting.
///
/// The `Display` output of the limit variants is the message shown to clients.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// Global rate limit exceeded.
    #[error("当前负载已饱和，请稍后再试")]
    GlobalLimitExceeded,

    /// Global limit of one model exceeded.
    #[error("当前模型 {model} 负载已饱和，请稍后再试")]
    GlobalModelLimitExceeded {
        /// Name of the saturated model.
        model: String,
    },

    /// The principal has used up its successful requests for this window.
    #[error("当前分组上游负载已饱和，请稍后再试")]
    SuccessLimitExceeded,

    /// The principal has used up its attempted requests for this window.
    #[error("当前分组上游负载已饱和，请稍后再试")]
    TotalLimitExceeded,

    /// The principal has used up its requests for one model.
    #[error("当前模型 {model} 负载已饱和，请稍后再试")]
    ModelLimitExceeded {
        /// Name of the saturated model.
        model: String,
    },

    /// Storage backend error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Rejected rule or settings update.
    #[error("Invalid rate limit configuration: {0}")]
    Configuration(#[from] RuleError),
}

impl RateLimitError {
    /// The HTTP status this error maps to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Storage(_) | Self::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    /// The saturated dimension, if this is a policy denial.
    pub fn dimension(&self) -> Option<Dimension> {
        match self {
            Self::GlobalLimitExceeded => Some(Dimension::GlobalTotal),
            Self::GlobalModelLimitExceeded { .. } => Some(Dimension::GlobalModel),
            Self::SuccessLimitExceeded => Some(Dimension::UserSuccess),
            Self::TotalLimitExceeded => Some(Dimension::UserTotal),
            Self::ModelLimitExceeded { .. } => Some(Dimension::UserModel),
            Self::Storage(_) | Self::Configuration(_) => None,
        }
    }

    /// Whether this is a policy denial rather than a failure.
    pub fn is_denial(&self) -> bool {
        self.dimension().is_some()
    }

    /// The message safe to show to clients.
    ///
    /// Backend failures are not described to clients.
    pub fn client_message(&self) -> String {
        if self.is_denial() {
            self.to_string()
        } else {
            CHECK_FAILED_MESSAGE.to_string()
        }
    }
}
