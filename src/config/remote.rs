//! Pluggable remote configuration sources.
//!
//! A remote source supplies a configuration overlay from outside the
//! process and pushes change notifications into the manager's reload
//! pipeline. At most one source is active per manager; others may stay
//! registered.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::settings::SettingsTree;

/// A pluggable adapter to an external configuration backend.
///
/// `close` must be idempotent and safe to call on a never-initialized
/// adapter.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Registry name of this adapter.
    fn name(&self) -> &'static str;

    /// Connects to the backend using settings from the current tree.
    async fn init(&mut self, tree: &SettingsTree) -> Result<(), ConfigError>;

    /// Performs one blocking fetch of the remote payload.
    async fn fetch(&mut self) -> Result<SettingsTree, ConfigError>;

    /// Installs an asynchronous push-change listener. Each parsed payload
    /// is sent over `tx`; malformed payloads are dropped with a warning
    /// and never forwarded.
    async fn watch(&mut self, tx: mpsc::UnboundedSender<SettingsTree>) -> Result<(), ConfigError>;

    /// Releases network resources held by the adapter.
    async fn close(&mut self);
}

/// Connection settings for the Redis-backed source, read from the
/// `remote.redis` section of the current tree.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RedisSourceOptions {
    #[serde(default = "default_url")]
    pub url: String,

    /// Key holding the full YAML configuration payload.
    #[serde(default = "default_key")]
    pub key: String,

    /// Pub/sub channel carrying pushed payloads.
    #[serde(default = "default_channel")]
    pub channel: String,
}

fn default_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key() -> String {
    "appboot:config".to_string()
}

fn default_channel() -> String {
    "appboot:config:changed".to_string()
}

/// Remote source backed by Redis: the payload lives under a key, change
/// pushes arrive over a pub/sub channel whose message body is the new
/// payload.
pub struct RedisSource {
    options: Option<RedisSourceOptions>,
    client: Option<redis::Client>,
    connection: Option<redis::aio::ConnectionManager>,
    watch_task: Option<tokio::task::JoinHandle<()>>,
    last_hash: Arc<Mutex<Option<String>>>,
}

impl RedisSource {
    pub fn new() -> Self {
        Self {
            options: None,
            client: None,
            connection: None,
            watch_task: None,
            last_hash: Arc::new(Mutex::new(None)),
        }
    }

    fn remote_err(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::RemoteFailed {
            name: self.name().to_string(),
            message: message.into(),
        }
    }
}

impl Default for RedisSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteSource for RedisSource {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn init(&mut self, tree: &SettingsTree) -> Result<(), ConfigError> {
        let options: RedisSourceOptions = tree
            .decode("remote.redis")
            .map_err(|e| self.remote_err(format!("invalid remote.redis settings: {e}")))?;

        let client = redis::Client::open(options.url.as_str())
            .map_err(|e| self.remote_err(e.to_string()))?;

        let connection = client
            .get_connection_manager()
            .await
            .map_err(|e| self.remote_err(e.to_string()))?;

        info!(url = %options.url, key = %options.key, "Redis remote source connected");

        self.options = Some(options);
        self.client = Some(client);
        self.connection = Some(connection);
        Ok(())
    }

    async fn fetch(&mut self) -> Result<SettingsTree, ConfigError> {
        let options = self
            .options
            .clone()
            .ok_or_else(|| self.remote_err("fetch before init"))?;
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| ConfigError::RemoteFailed {
                name: "redis".to_string(),
                message: "fetch before init".to_string(),
            })?;

        let payload: Option<String> = redis::cmd("GET")
            .arg(&options.key)
            .query_async(connection)
            .await
            .map_err(|e| ConfigError::RemoteFailed {
                name: "redis".to_string(),
                message: e.to_string(),
            })?;

        let payload = match payload {
            Some(p) => p,
            None => {
                info!(key = %options.key, "No remote payload present yet");
                return Ok(SettingsTree::new());
            }
        };

        let tree = SettingsTree::from_yaml_str(&payload).map_err(|e| ConfigError::RemoteFailed {
            name: "redis".to_string(),
            message: format!("malformed remote payload: {e}"),
        })?;

        *self.last_hash.lock().expect("hash lock poisoned") = Some(payload_hash(&payload));
        Ok(tree)
    }

    async fn watch(&mut self, tx: mpsc::UnboundedSender<SettingsTree>) -> Result<(), ConfigError> {
        let client = self
            .client
            .clone()
            .ok_or_else(|| self.remote_err("watch before init"))?;
        let options = self
            .options
            .clone()
            .ok_or_else(|| self.remote_err("watch before init"))?;
        let last_hash = Arc::clone(&self.last_hash);

        let task = tokio::spawn(async move {
            loop {
                let pubsub = match client.get_async_connection().await {
                    Ok(conn) => conn.into_pubsub(),
                    Err(e) => {
                        warn!(error = %e, "Redis pub/sub connect failed, retrying");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let mut pubsub = pubsub;
                if let Err(e) = pubsub.subscribe(&options.channel).await {
                    warn!(error = %e, channel = %options.channel, "Redis subscribe failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                }

                info!(channel = %options.channel, "Watching remote configuration channel");

                let mut messages = pubsub.on_message();
                while let Some(msg) = messages.next().await {
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(error = %e, "Dropping unreadable remote payload");
                            continue;
                        }
                    };

                    let hash = payload_hash(&payload);
                    {
                        let mut seen = last_hash.lock().expect("hash lock poisoned");
                        if seen.as_deref() == Some(hash.as_str()) {
                            continue;
                        }
                        *seen = Some(hash);
                    }

                    match SettingsTree::from_yaml_str(&payload) {
                        Ok(tree) => {
                            if tx.send(tree).is_err() {
                                // Manager side is gone; stop watching.
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Dropping malformed remote payload");
                        }
                    }
                }

                warn!("Remote configuration subscription ended, reconnecting");
            }
        });

        self.watch_task = Some(task);
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(task) = self.watch_task.take() {
            task.abort();
        }
        self.connection = None;
        self.client = None;
        info!("Redis remote source closed");
    }
}

fn payload_hash(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}
