//! Request information for rate limiting.

/// Information about a request that needs to be admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRequest {
    /// Authenticated principal the request belongs to.
    pub principal: String,
    /// Group the principal belongs to.
    pub group: Option<String>,
    /// Model the request targets, when known.
    pub model: Option<String>,
}

impl RateLimitRequest {
    /// Create a new builder for a rate limit request of `principal`.
    pub fn builder(principal: impl Into<String>) -> RateLimitRequestBuilder {
        RateLimitRequestBuilder {
            principal: principal.into(),
            group: None,
            model: None,
        }
    }
}

/// Builder for creating rate limit requests.
#[derive(Debug)]
pub struct RateLimitRequestBuilder {
    principal: String,
    group: Option<String>,
    model: Option<String>,
}

impl RateLimitRequestBuilder {
    /// Set the group of the principal.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Set the targeted model.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Build the rate limit request.
    pub fn build(self) -> RateLimitRequest {
        RateLimitRequest {
            principal: self.principal,
            group: self.group.filter(|group| !group.is_empty()),
            model: self.model.filter(|model| !model.is_empty()),
        }
    }
}
