//! Configuration management: local file, remote sources, and reload fan-out.
//!
//! The manager owns the merged settings tree. The local file and the
//! active remote overlay are kept as separate inputs; every trigger
//! (file change, remote push, activation) recomputes `local ⊕ remote`
//! with the same deep-merge function and swaps the tree wholesale, so
//! readers never observe a partial write and merge semantics are
//! identical on every path.

pub mod loader;
pub mod remote;
pub mod watcher;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::ConfigError;
use crate::metrics::Metrics;
use crate::settings::SettingsTree;
pub use remote::{RedisSource, RemoteSource};
pub use watcher::ConfigWatcher;

/// A subscriber notified whenever the merged configuration changes.
#[async_trait]
pub trait Reloader: Send + Sync {
    /// Applies a new configuration snapshot. Errors are logged by the
    /// manager and never affect other subscribers.
    async fn reload(&self, tree: Arc<SettingsTree>) -> anyhow::Result<()>;
}

struct Trees {
    local: Arc<SettingsTree>,
    remote: Arc<SettingsTree>,
    merged: Arc<SettingsTree>,
}

struct RemoteRegistry {
    adapters: HashMap<String, Box<dyn RemoteSource>>,
    active: Option<String>,
}

struct Inner {
    config_path: PathBuf,
    trees: RwLock<Trees>,
    reloaders: std::sync::Mutex<HashMap<String, Arc<dyn Reloader>>>,
    remotes: Mutex<RemoteRegistry>,
    metrics: Arc<Metrics>,
}

/// Central configuration store with hot reload.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct ConfigManager {
    inner: Arc<Inner>,
}

impl ConfigManager {
    /// Creates a manager for the given configuration file path. The tree
    /// starts empty; call [`load`](Self::load) to populate it.
    pub fn new(config_path: impl Into<PathBuf>, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config_path: config_path.into(),
                trees: RwLock::new(Trees {
                    local: Arc::new(SettingsTree::new()),
                    remote: Arc::new(SettingsTree::new()),
                    merged: Arc::new(SettingsTree::new()),
                }),
                reloaders: std::sync::Mutex::new(HashMap::new()),
                remotes: Mutex::new(RemoteRegistry {
                    adapters: HashMap::new(),
                    active: None,
                }),
                metrics,
            }),
        }
    }

    /// Returns the path of the local configuration file.
    pub fn config_path(&self) -> &Path {
        &self.inner.config_path
    }

    /// Returns the current merged configuration snapshot.
    pub async fn snapshot(&self) -> Arc<SettingsTree> {
        self.inner.trees.read().await.merged.clone()
    }

    /// Loads the local file and optionally activates a remote source.
    ///
    /// A missing or malformed local file is logged and non-fatal: a remote
    /// source may still supply configuration, and if both fail the manager
    /// holds an empty tree (callers must tolerate missing keys via
    /// defaults). Requesting an unregistered remote source is a caller
    /// error and does fail.
    pub async fn load(
        &self,
        remote_name: Option<&str>,
    ) -> Result<Arc<SettingsTree>, ConfigError> {
        match loader::load_from_path(&self.inner.config_path) {
            Ok(local) => {
                let mut trees = self.inner.trees.write().await;
                trees.local = Arc::new(local);
                let merged = Arc::new(trees.local.merged(&trees.remote));
                trees.merged = merged;
            }
            Err(e) => {
                warn!(
                    path = ?self.inner.config_path,
                    error = %e,
                    "Local config unavailable, continuing with empty tree"
                );
            }
        }

        if let Some(name) = remote_name {
            self.activate_remote_source(name).await?;
        }

        Ok(self.snapshot().await)
    }

    /// Starts watching the local configuration file for modifications.
    pub fn watch_local(&self) -> Result<(), ConfigError> {
        ConfigWatcher::new(self.clone(), self.inner.config_path.clone()).start()
    }

    /// Adds a remote source to the registry. No side effects until the
    /// source is activated.
    pub async fn register_remote_source(&self, adapter: Box<dyn RemoteSource>) {
        let mut remotes = self.inner.remotes.lock().await;
        remotes.adapters.insert(adapter.name().to_string(), adapter);
    }

    /// Activates a registered remote source by name.
    ///
    /// Closes the previously active source, initializes the new one
    /// against the current tree, performs one synchronous fetch-and-merge
    /// (the remote configuration is observable as soon as this returns),
    /// and wires its push listener into the reload pipeline.
    pub async fn activate_remote_source(&self, name: &str) -> Result<(), ConfigError> {
        let overlay = {
            let mut remotes = self.inner.remotes.lock().await;

            if !remotes.adapters.contains_key(name) {
                return Err(ConfigError::RemoteSourceNotFound {
                    name: name.to_string(),
                });
            }

            if let Some(active) = remotes.active.take() {
                if let Some(adapter) = remotes.adapters.get_mut(&active) {
                    adapter.close().await;
                    info!(source = %active, "Closed previously active remote source");
                }
            }

            let snapshot = self.snapshot().await;
            let adapter =
                remotes
                    .adapters
                    .get_mut(name)
                    .ok_or_else(|| ConfigError::RemoteSourceNotFound {
                        name: name.to_string(),
                    })?;

            adapter.init(&snapshot).await?;
            let overlay = adapter.fetch().await?;

            let (tx, rx) = mpsc::unbounded_channel();
            adapter.watch(tx).await?;
            self.spawn_remote_listener(name.to_string(), rx);

            remotes.active = Some(name.to_string());
            overlay
        };

        info!(source = %name, "Remote source activated");
        self.apply_remote_overlay(overlay, "activation").await;
        Ok(())
    }

    fn spawn_remote_listener(&self, name: String, mut rx: mpsc::UnboundedReceiver<SettingsTree>) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(overlay) = rx.recv().await {
                info!(source = %name, "Remote configuration push received");
                manager.apply_remote_overlay(overlay, "remote").await;
            }
            debug!(source = %name, "Remote listener channel closed");
        });
    }

    /// Registers a reload subscriber under a unique name.
    pub fn register_reloader(
        &self,
        name: &str,
        reloader: Arc<dyn Reloader>,
    ) -> Result<(), ConfigError> {
        let mut reloaders = self
            .inner
            .reloaders
            .lock()
            .expect("reloader registry poisoned");

        if reloaders.contains_key(name) {
            return Err(ConfigError::ReloaderAlreadyRegistered {
                name: name.to_string(),
            });
        }

        reloaders.insert(name.to_string(), reloader);
        Ok(())
    }

    /// Re-reads the local file and runs the reload pipeline.
    ///
    /// A file that has become unreadable or malformed keeps the current
    /// tree authoritative.
    pub async fn reload_local(&self) {
        let local = match loader::load_from_path(&self.inner.config_path) {
            Ok(tree) => tree,
            Err(e) => {
                warn!(error = %e, "Ignoring unloadable local config, keeping current tree");
                return;
            }
        };

        {
            let mut trees = self.inner.trees.write().await;
            trees.local = Arc::new(local);
            let merged = Arc::new(trees.local.merged(&trees.remote));
            trees.merged = merged;
        }

        self.inner
            .metrics
            .reloads_total
            .with_label_values(&["file"])
            .inc();
        self.fire_reload().await;
    }

    /// Replaces the remote overlay and runs the reload pipeline.
    async fn apply_remote_overlay(&self, overlay: SettingsTree, trigger: &str) {
        {
            let mut trees = self.inner.trees.write().await;
            trees.remote = Arc::new(overlay);
            let merged = Arc::new(trees.local.merged(&trees.remote));
            trees.merged = merged;
        }

        self.inner
            .metrics
            .reloads_total
            .with_label_values(&[trigger])
            .inc();
        self.fire_reload().await;
    }

    /// Notifies every registered reloader of the current snapshot.
    ///
    /// Each subscriber runs in its own task; a failure or panic in one is
    /// logged and never blocks or corrupts delivery to the others. No
    /// ordering between subscribers is guaranteed.
    pub async fn fire_reload(&self) {
        let snapshot = self.snapshot().await;

        let subscribers: Vec<(String, Arc<dyn Reloader>)> = {
            let reloaders = self
                .inner
                .reloaders
                .lock()
                .expect("reloader registry poisoned");
            reloaders
                .iter()
                .map(|(name, r)| (name.clone(), Arc::clone(r)))
                .collect()
        };

        let mut handles = Vec::with_capacity(subscribers.len());
        for (name, reloader) in subscribers {
            let snapshot = Arc::clone(&snapshot);
            let handle = tokio::spawn(async move { reloader.reload(snapshot).await });
            handles.push((name, handle));
        }

        // Supervising collector: observe every outcome without letting one
        // subscriber's failure propagate.
        let metrics = Arc::clone(&self.inner.metrics);
        tokio::spawn(async move {
            for (name, handle) in handles {
                match handle.await {
                    Ok(Ok(())) => {
                        debug!(component = %name, "Reload applied");
                    }
                    Ok(Err(e)) => {
                        warn!(component = %name, error = %e, "Reload failed");
                        metrics
                            .reloader_failures_total
                            .with_label_values(&[name.as_str()])
                            .inc();
                    }
                    Err(e) if e.is_panic() => {
                        error!(component = %name, "Reloader panicked");
                        metrics
                            .reloader_failures_total
                            .with_label_values(&[name.as_str()])
                            .inc();
                    }
                    Err(_) => {
                        debug!(component = %name, "Reload task cancelled");
                    }
                }
            }
        });
    }

    /// Closes the active remote source, if any.
    pub async fn close(&self) {
        let mut remotes = self.inner.remotes.lock().await;
        if let Some(active) = remotes.active.take() {
            if let Some(adapter) = remotes.adapters.get_mut(&active) {
                adapter.close().await;
            }
        }
    }
}
