//! Hot-swappable log filtering.
//!
//! A tracing subscriber can only be installed once per process, so the
//! swap unit is the env-filter behind a `reload::Handle`: reloads
//! replace the active filter in place, output format is fixed at boot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use super::ResourceBuilder;
use crate::error::ResourceError;

/// Handle to the process-wide log filter slot.
pub type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Installs the global tracing subscriber and returns the reload handle
/// for the log-sink resource.
///
/// `RUST_LOG` overrides the default level when set.
pub fn init_tracing(default_level: &str, json: bool) -> FilterHandle {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let (filter_layer, handle) = reload::Layer::new(filter);

    let registry = tracing_subscriber::registry().with(filter_layer);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }

    handle
}

/// Settings for the `logger` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogSinkOptions {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Filter directive, e.g. `info` or `appboot=debug,warn`.
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_level() -> String {
    "info".to_string()
}

/// One applied filter generation.
#[derive(Debug)]
pub struct LogSinkInstance {
    level: String,
}

impl LogSinkInstance {
    pub fn level(&self) -> &str {
        &self.level
    }
}

/// Swaps the active log filter on configuration change.
pub struct LogSinkBuilder {
    handle: FilterHandle,
}

impl LogSinkBuilder {
    pub fn new(handle: FilterHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl ResourceBuilder for LogSinkBuilder {
    type Options = LogSinkOptions;
    type Instance = LogSinkInstance;

    fn section(&self) -> &'static str {
        "logger"
    }

    fn enabled(&self, options: &LogSinkOptions) -> bool {
        options.enabled
    }

    async fn build(&self, options: &LogSinkOptions) -> Result<LogSinkInstance, ResourceError> {
        // Validate before touching the live filter; a bad directive keeps
        // the previous filter active.
        let filter = EnvFilter::try_new(&options.level).map_err(|e| ResourceError::BuildFailed {
            section: "logger".into(),
            message: format!("invalid filter directive '{}': {e}", options.level),
        })?;

        self.handle
            .reload(filter)
            .map_err(|e| ResourceError::BuildFailed {
                section: "logger".into(),
                message: e.to_string(),
            })?;

        info!(level = %options.level, "Log filter applied");
        Ok(LogSinkInstance {
            level: options.level.clone(),
        })
    }

    async fn retire(&self, instance: Arc<LogSinkInstance>, _grace: Duration) {
        debug!(level = %instance.level, "Log filter generation retired");
    }
}
