//! Configuration file watcher feeding the reload pipeline.

use std::path::PathBuf;
use std::time::Duration;

use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::ConfigManager;
use crate::error::ConfigError;

const DEBOUNCE: Duration = Duration::from_millis(500);

/// Watches the local configuration file and triggers manager reloads.
pub struct ConfigWatcher {
    manager: ConfigManager,
    config_path: PathBuf,
}

impl ConfigWatcher {
    /// Creates a new watcher for the manager's configuration file.
    pub fn new(manager: ConfigManager, config_path: PathBuf) -> Self {
        Self {
            manager,
            config_path,
        }
    }

    /// Starts watching the configuration file for changes.
    ///
    /// Spawns a background task that owns the watcher for the lifetime of
    /// the process; modification events re-read the file and run the same
    /// merge-and-fan-out pipeline as a remote push.
    pub fn start(self) -> Result<(), ConfigError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            Config::default(),
        )?;

        watcher.watch(&self.config_path, RecursiveMode::NonRecursive)?;

        tokio::spawn(async move {
            // The watcher must stay alive as long as events are consumed.
            let _watcher = watcher;
            self.handle_changes(rx).await;
        });

        Ok(())
    }

    /// Handles file change events with debouncing.
    async fn handle_changes(self, mut rx: mpsc::UnboundedReceiver<notify::Event>) {
        let mut last_reload = std::time::Instant::now() - DEBOUNCE;

        while let Some(event) = rx.recv().await {
            if !event.kind.is_modify() && !event.kind.is_create() {
                continue;
            }

            // Debounce rapid changes
            if last_reload.elapsed() < DEBOUNCE {
                continue;
            }

            // Wait a bit for the file to be fully written
            tokio::time::sleep(DEBOUNCE).await;

            tracing::info!(path = ?self.config_path, "Config file change detected");
            self.manager.reload_local().await;

            last_reload = std::time::Instant::now();
        }

        tracing::warn!("Config watcher channel closed");
    }
}
