//! Gateway server library.
//!
//! Puts admission control in front of an upstream router and serves it, either
//! for an application binary or for the integration tests.

#![deny(missing_docs)]

mod health;
mod model;
mod rate_limit;

use std::net::SocketAddr;
use std::sync::Arc;

use ::rate_limit::RateLimitManager;
use anyhow::anyhow;
use axum::{Router, routing::get};
use config::Config;
use tokio::net::TcpListener;

pub use model::RequestedModel;
pub use self::rate_limit::{RateLimitLayer, RateLimitService};

/// Configuration for serving the gateway.
pub struct ServeConfig {
    /// The socket address (IP and port) the server will bind to
    pub listen_address: SocketAddr,
    /// The deserialized gateway TOML configuration.
    pub config: Config,
    /// Handlers dispatching admitted requests to the upstream providers.
    pub upstream: Router,
    /// Admission control to install, created from `config` when not given.
    ///
    /// Keep a clone to replace rules and settings while the server runs.
    pub manager: Option<Arc<RateLimitManager>>,
}

/// Creates the admission control described by the configuration.
///
/// The manager is created even with rate limiting disabled, so it can be
/// enabled at runtime through [`RateLimitManager::rules`].
pub async fn rate_limit_manager(config: &Config) -> anyhow::Result<Arc<RateLimitManager>> {
    log::debug!("Initializing rate limit manager with configured limits");

    let manager = RateLimitManager::new(&config.server.rate_limits).await?;

    Ok(Arc::new(manager))
}

/// Wraps `upstream` in admission control and adds the health endpoint.
///
/// The health endpoint is never rate limited. While `manager` is disabled the
/// layer passes every request through untouched.
pub fn router(config: &Config, manager: Arc<RateLimitManager>, upstream: Router) -> Router {
    let mut app = upstream.layer(RateLimitLayer::new(manager));

    if config.server.health.enabled {
        if let Some(listen) = config.server.health.listen {
            let health_config = config.server.health.clone();

            tokio::spawn(async move {
                if let Err(e) = health::bind_health_endpoint(listen, health_config).await {
                    log::error!("{e}");
                }
            });
        } else {
            app = app.route(&config.server.health.path, get(health::health));
        }
    }

    app
}

/// Starts and runs the gateway with the provided configuration.
pub async fn serve(
    ServeConfig {
        listen_address,
        config,
        upstream,
        manager,
    }: ServeConfig,
) -> anyhow::Result<()> {
    let manager = match manager {
        Some(manager) => manager,
        None => rate_limit_manager(&config).await?,
    };

    let app = router(&config, manager, upstream);

    let listener = TcpListener::bind(listen_address)
        .await
        .map_err(|e| anyhow!("Failed to bind to {listen_address}: {e}"))?;

    log::info!("Gateway listening on http://{listen_address}");

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow!("Failed to start HTTP server: {e}"))?;

    Ok(())
}
