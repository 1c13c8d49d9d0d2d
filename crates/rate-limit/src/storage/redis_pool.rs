//! Managed pool of multiplexed Redis connections.

use std::sync::atomic::{AtomicUsize, Ordering};

use deadpool::managed::{self, Metrics};
use redis::{Client, ErrorKind, RedisError, RedisResult, aio::MultiplexedConnection};

use config::{RedisConfig, RedisTlsConfig};

/// Redis connection pool.
pub(super) type Pool = managed::Pool<Manager>;

/// Creates connections and checks idle ones with a numbered `PING` before reuse.
#[derive(Debug)]
pub(super) struct Manager {
    client: Client,
    ping_number: AtomicUsize,
}

impl Manager {
    fn new(config: &RedisConfig) -> RedisResult<Self> {
        let client = match &config.tls {
            Some(tls) if tls.enabled => Client::build_with_tls(config.url.as_str(), load_certificates(tls)?)?,
            _ => Client::open(config.url.as_str())?,
        };

        Ok(Self {
            client,
            ping_number: AtomicUsize::new(0),
        })
    }
}

impl managed::Manager for Manager {
    type Type = MultiplexedConnection;
    type Error = RedisError;

    async fn create(&self) -> Result<MultiplexedConnection, Self::Error> {
        self.client.get_multiplexed_async_connection().await
    }

    async fn recycle(&self, conn: &mut MultiplexedConnection, _: &Metrics) -> managed::RecycleResult<Self::Error> {
        let ping_number = self.ping_number.fetch_add(1, Ordering::Relaxed).to_string();

        let (n,) = redis::Pipeline::with_capacity(2)
            .cmd("UNWATCH")
            .ignore()
            .cmd("PING")
            .arg(&ping_number)
            .query_async::<(String,)>(conn)
            .await?;

        if n == ping_number {
            Ok(())
        } else {
            Err(managed::RecycleError::message("Invalid PING response"))
        }
    }
}

fn read_pem(path: &str, what: &'static str) -> RedisResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| RedisError::from((ErrorKind::IoError, what, format!("{path}: {e}"))))
}

/// Load the CA and client certificates named in the TLS configuration.
///
/// With `insecure`, only the CA is loaded and a missing file is ignored.
fn load_certificates(config: &RedisTlsConfig) -> RedisResult<redis::TlsCertificates> {
    if config.insecure.unwrap_or(false) {
        let root_cert = config.ca_cert_path.as_deref().and_then(|path| std::fs::read(path).ok());

        return Ok(redis::TlsCertificates {
            client_tls: None,
            root_cert,
        });
    }

    let client_tls = match (&config.client_cert_path, &config.client_key_path) {
        (Some(cert_path), Some(key_path)) => Some(redis::ClientTlsConfig {
            client_cert: read_pem(cert_path, "Failed to read client certificate")?,
            client_key: read_pem(key_path, "Failed to read client key")?,
        }),
        _ => None,
    };

    let root_cert = match &config.ca_cert_path {
        Some(path) => Some(read_pem(path, "Failed to read CA certificate")?),
        None => None,
    };

    Ok(redis::TlsCertificates { client_tls, root_cert })
}

/// Create a Redis connection pool from configuration.
///
/// No connection is opened until the pool is first used.
pub(super) fn create_pool(config: &RedisConfig) -> RedisResult<Pool> {
    let manager = Manager::new(config)?;
    let mut pool_config = managed::PoolConfig::default();

    if let Some(max_size) = config.pool.max_size {
        pool_config.max_size = max_size;
    }

    pool_config.timeouts.create = config.pool.timeout_create.or(config.connection_timeout);
    pool_config.timeouts.wait = config.pool.timeout_wait;
    pool_config.timeouts.recycle = config.pool.timeout_recycle;

    Pool::builder(manager)
        .config(pool_config)
        .runtime(deadpool::Runtime::Tokio1)
        .build()
        .map_err(|e| RedisError::from((ErrorKind::IoError, "Failed to create pool", e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_is_created_lazily() {
        let config = RedisConfig {
            url: "redis://127.0.0.1:1/0".to_string(),
            ..Default::default()
        };

        let pool = create_pool(&config).unwrap();

        assert_eq!(pool.status().size, 0);
        assert_eq!(pool.status().max_size, 16);
    }

    #[test]
    fn missing_client_certificate_is_an_error() {
        let tls = RedisTlsConfig {
            enabled: true,
            insecure: None,
            ca_cert_path: None,
            client_cert_path: Some("/nonexistent/client.crt".to_string()),
            client_key_path: Some("/nonexistent/client.key".to_string()),
        };

        assert!(load_certificates(&tls).is_err());
    }

    #[test]
    fn insecure_mode_tolerates_missing_ca() {
        let tls = RedisTlsConfig {
            enabled: true,
            insecure: Some(true),
            ca_cert_path: Some("/nonexistent/ca.crt".to_string()),
            client_cert_path: None,
            client_key_path: None,
        };

        let certificates = load_certificates(&tls).unwrap();

        assert!(certificates.root_cert.is_none());
        assert!(certificates.client_tls.is_none());
    }
}
