//! Application orchestration: starters, boot sequencing, and shutdown.
//!
//! Boot is fail-fast: every enabled starter is initialized in list
//! order, then started in the same order; the first failure aborts with
//! an error naming the starter. Shutdown is best-effort: starters stop
//! in reverse order and a failure is logged without stopping the rest.

pub mod starters;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::ConfigManager;

pub use starters::{HttpStarter, LoggerStarter, RedisStarter, SchedulerStarter};

/// Uniform lifecycle contract consumed by the orchestrator.
#[async_trait]
pub trait Starter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this starter participates in the current boot cycle,
    /// judged against the current configuration.
    async fn enabled(&self, config: &ConfigManager) -> bool;

    async fn init(&self, config: &ConfigManager) -> anyhow::Result<()>;

    async fn start(&self, config: &ConfigManager) -> anyhow::Result<()>;

    async fn stop(&self, config: &ConfigManager) -> anyhow::Result<()>;
}

/// Sequences starters through boot and shutdown.
///
/// Membership is fixed once [`boot`](Self::boot) runs; `enabled` is
/// evaluated once per boot cycle and reused for shutdown.
pub struct App {
    config: ConfigManager,
    starters: Vec<Box<dyn Starter>>,
    enabled: std::sync::Mutex<Vec<bool>>,
}

impl App {
    pub fn new(config: ConfigManager) -> Self {
        Self {
            config,
            starters: Vec::new(),
            enabled: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Appends a starter; boot order is append order, shutdown order is
    /// the exact reverse.
    pub fn with_starter(mut self, starter: Box<dyn Starter>) -> Self {
        self.starters.push(starter);
        self
    }

    /// Returns the configuration manager this app was built with.
    pub fn config(&self) -> &ConfigManager {
        &self.config
    }

    /// Initializes then starts every enabled starter, in order.
    pub async fn boot(&self) -> anyhow::Result<()> {
        let mut enabled = Vec::with_capacity(self.starters.len());
        for starter in &self.starters {
            enabled.push(starter.enabled(&self.config).await);
        }
        *self.enabled.lock().expect("enabled flags poisoned") = enabled.clone();

        for (starter, on) in self.starters.iter().zip(&enabled) {
            if !on {
                info!(starter = starter.name(), "Starter disabled, skipping");
                continue;
            }
            starter
                .init(&self.config)
                .await
                .with_context(|| format!("starter '{}' init failed", starter.name()))?;
            info!(starter = starter.name(), "Starter initialized");
        }

        for (starter, on) in self.starters.iter().zip(&enabled) {
            if !on {
                continue;
            }
            starter
                .start(&self.config)
                .await
                .with_context(|| format!("starter '{}' start failed", starter.name()))?;
            info!(starter = starter.name(), "Starter started");
        }

        Ok(())
    }

    /// Stops enabled starters in reverse order, continuing past failures.
    pub async fn shutdown(&self) {
        let enabled = self.enabled.lock().expect("enabled flags poisoned").clone();

        for (starter, on) in self.starters.iter().zip(&enabled).rev() {
            if !on {
                continue;
            }
            if let Err(e) = starter.stop(&self.config).await {
                warn!(starter = starter.name(), error = %e, "Starter stop failed");
            } else {
                info!(starter = starter.name(), "Starter stopped");
            }
        }

        self.config.close().await;
    }

    /// Blocks until SIGTERM or SIGINT, then drives shutdown.
    pub async fn run_until_signal(&self) {
        wait_for_signal().await;
        info!("Shutdown signal received, stopping starters");
        self.shutdown().await;
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler, falling back to Ctrl+C");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
