//! Gateway configuration structures to map the gateway.toml configuration.

#![deny(missing_docs)]

mod client_identity;
mod health;
mod loader;
mod rate_limit;

use std::{net::SocketAddr, path::Path};

pub use client_identity::ClientIdentity;
pub use health::HealthConfig;
pub use rate_limit::*;
use serde::Deserialize;

/// Main configuration structure for the gateway.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration settings.
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Validates the admission control settings and returns non-fatal warnings.
    pub fn validate(&self) -> anyhow::Result<Vec<String>> {
        loader::validate_rate_limits(&self.server.rate_limits)
    }
}

/// HTTP server configuration settings.
#[derive(Default, Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// The socket address the server should listen on.
    pub listen_address: Option<SocketAddr>,
    /// Health endpoint configuration.
    #[serde(default)]
    pub health: HealthConfig,
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
}
