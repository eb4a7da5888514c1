//! Managed Redis connection pool.
//!
//! The builder verifies connectivity with a bounded PING before the new
//! pool replaces the current one, so a bad address in a reload never
//! takes down a working client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::ResourceBuilder;
use crate::error::ResourceError;

/// Settings for the `redis` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RedisOptions {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_url")]
    pub url: String,

    /// Bound on the connectivity probe at build time.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_ping_timeout() -> u64 {
    2
}

/// One connected pool generation.
pub struct RedisInstance {
    connection: redis::aio::ConnectionManager,
    url: String,
}

impl RedisInstance {
    /// Returns a handle to the multiplexed connection pool.
    pub fn connection(&self) -> redis::aio::ConnectionManager {
        self.connection.clone()
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Debug for RedisInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisInstance")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// Builds pooled Redis clients.
pub struct RedisBuilder;

impl RedisBuilder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RedisBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceBuilder for RedisBuilder {
    type Options = RedisOptions;
    type Instance = RedisInstance;

    fn section(&self) -> &'static str {
        "redis"
    }

    fn enabled(&self, options: &RedisOptions) -> bool {
        options.enabled
    }

    async fn build(&self, options: &RedisOptions) -> Result<RedisInstance, ResourceError> {
        let client =
            redis::Client::open(options.url.as_str()).map_err(|e| ResourceError::BuildFailed {
                section: "redis".into(),
                message: e.to_string(),
            })?;

        let mut connection =
            client
                .get_connection_manager()
                .await
                .map_err(|e| ResourceError::BuildFailed {
                    section: "redis".into(),
                    message: format!("failed to connect to {}: {e}", options.url),
                })?;

        let cmd = redis::cmd("PING");
        let ping = cmd.query_async::<_, String>(&mut connection);
        tokio::time::timeout(Duration::from_secs(options.ping_timeout_secs), ping)
            .await
            .map_err(|_| ResourceError::BuildFailed {
                section: "redis".into(),
                message: format!("PING timed out after {}s", options.ping_timeout_secs),
            })?
            .map_err(|e| ResourceError::BuildFailed {
                section: "redis".into(),
                message: format!("PING failed: {e}"),
            })?;

        info!(url = %options.url, "Redis client connected");
        Ok(RedisInstance {
            connection,
            url: options.url.clone(),
        })
    }

    async fn retire(&self, instance: Arc<RedisInstance>, _grace: Duration) {
        // The multiplexed pool closes when the last handle drops; in-flight
        // commands on clones of the old pool complete on their own.
        debug!(url = %instance.url, "Redis client released");
    }
}
