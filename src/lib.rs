//! appboot - a configuration-driven bootstrap framework.
//!
//! A central configuration store backed by a local file and pluggable
//! remote sources, a change-notification pipeline that fans updates out
//! to subscribed components, hot-swappable resources rebuilt from new
//! settings with no serving gap, and an orchestrator that sequences
//! starters through boot and shutdown.

pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod resource;
pub mod settings;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::app::{App, HttpStarter, LoggerStarter, RedisStarter, SchedulerStarter};
use crate::cli::{Cli, Commands, RunArgs};
use crate::config::{ConfigManager, RedisSource};
use crate::metrics::Metrics;
use crate::resource::http::HttpBuilder;
use crate::resource::logsink::{init_tracing, LogSinkBuilder};
use crate::resource::redis::RedisBuilder;
use crate::resource::scheduler::SchedulerBuilder;
use crate::resource::HotSwap;

/// Runs the framework with the provided CLI arguments.
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run(ref args) => run_app(&cli, args).await,
        Commands::ConfigValidate => validate_config(&cli).await,
        Commands::ConfigShow => show_config(&cli).await,
    }
}

/// Boots the application: wires components leaf-first, boots the
/// starter list, and runs until a termination signal.
async fn run_app(cli: &Cli, args: &RunArgs) -> Result<()> {
    let filter_handle = init_tracing(cli.log_level(), !args.plain_logs);

    info!(config = ?cli.config, "Starting appboot");

    let metrics = Arc::new(Metrics::new()?);
    let config = ConfigManager::new(&cli.config, Arc::clone(&metrics));
    config.register_remote_source(Box::new(RedisSource::new())).await;

    config.load(args.remote.as_deref()).await?;
    config.watch_local()?;
    info!("Configuration loaded, watching for changes");

    let logsink = HotSwap::new(LogSinkBuilder::new(filter_handle), Arc::clone(&metrics));
    let http = HotSwap::new(HttpBuilder::new(Arc::clone(&metrics)), Arc::clone(&metrics));
    let redis = HotSwap::new(RedisBuilder::new(), Arc::clone(&metrics));

    let scheduler_builder = SchedulerBuilder::new().with_job("heartbeat", || async {
        info!("Heartbeat");
    });
    let scheduler = HotSwap::new(scheduler_builder, Arc::clone(&metrics));

    let app = App::new(config)
        .with_starter(Box::new(LoggerStarter::new(logsink)))
        .with_starter(Box::new(HttpStarter::new(http)))
        .with_starter(Box::new(RedisStarter::new(redis)))
        .with_starter(Box::new(SchedulerStarter::new(scheduler)));

    app.boot().await?;
    info!("Application is running. Press Ctrl+C to stop.");

    app.run_until_signal().await;
    info!("Shutdown complete");
    Ok(())
}

/// Validates the local configuration file and reports any issues.
async fn validate_config(cli: &Cli) -> Result<()> {
    let tree = config::loader::load_from_path(&cli.config)?;
    println!("Configuration is valid ({} top-level sections).", tree.len());
    Ok(())
}

/// Displays the merged configuration.
async fn show_config(cli: &Cli) -> Result<()> {
    let metrics = Arc::new(Metrics::new()?);
    let config = ConfigManager::new(&cli.config, metrics);
    let tree = config.load(None).await?;

    let yaml = serde_yaml::to_string(&tree.to_value())?;
    println!("{yaml}");
    Ok(())
}
