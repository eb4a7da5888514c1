//! Periodic-task scheduler resource.
//!
//! Job bodies are registered on the builder at wiring time; configuration
//! selects which jobs run and at what interval. Reloads rebuild the
//! ticker set, letting a running tick finish within the grace period.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ResourceBuilder;
use crate::error::ResourceError;

/// A registered job body.
pub type JobFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// One scheduled job in the `scheduler.jobs` list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobSpec {
    pub name: String,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

fn default_interval() -> u64 {
    60
}

/// Settings for the `scheduler` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SchedulerOptions {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

fn default_enabled() -> bool {
    true
}

/// One scheduler generation: the resolved ticker set.
pub struct SchedulerInstance {
    tickers: Vec<(String, Duration, JobFn)>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SchedulerInstance {
    /// Number of jobs this generation will tick.
    pub fn job_count(&self) -> usize {
        self.tickers.len()
    }
}

impl std::fmt::Debug for SchedulerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerInstance")
            .field("jobs", &self.tickers.len())
            .finish_non_exhaustive()
    }
}

/// Builds scheduler instances from the registered job set.
pub struct SchedulerBuilder {
    jobs: HashMap<String, JobFn>,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
        }
    }

    /// Registers a job body under a name referenced from configuration.
    pub fn with_job<F, Fut>(mut self, name: &str, job: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let job = Arc::new(job);
        self.jobs.insert(
            name.to_string(),
            Arc::new(move || Box::pin(job()) as Pin<Box<dyn Future<Output = ()> + Send>>),
        );
        self
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceBuilder for SchedulerBuilder {
    type Options = SchedulerOptions;
    type Instance = SchedulerInstance;

    fn section(&self) -> &'static str {
        "scheduler"
    }

    fn enabled(&self, options: &SchedulerOptions) -> bool {
        options.enabled
    }

    async fn build(&self, options: &SchedulerOptions) -> Result<SchedulerInstance, ResourceError> {
        let mut tickers = Vec::new();
        for spec in &options.jobs {
            if spec.interval_secs == 0 {
                return Err(ResourceError::BuildFailed {
                    section: "scheduler".into(),
                    message: format!("job '{}' has a zero interval", spec.name),
                });
            }
            match self.jobs.get(&spec.name) {
                Some(job) => tickers.push((
                    spec.name.clone(),
                    Duration::from_secs(spec.interval_secs),
                    Arc::clone(job),
                )),
                None => {
                    warn!(job = %spec.name, "Ignoring unknown scheduled job");
                }
            }
        }

        let (shutdown, _) = watch::channel(false);
        info!(jobs = tickers.len(), "Scheduler built");
        Ok(SchedulerInstance {
            tickers,
            shutdown,
            handles: Mutex::new(Vec::new()),
        })
    }

    async fn start(&self, instance: &Arc<SchedulerInstance>) -> Result<(), ResourceError> {
        let mut handles = instance.handles.lock().await;
        if !handles.is_empty() {
            // Already ticking.
            return Ok(());
        }

        for (name, interval, job) in &instance.tickers {
            let name = name.clone();
            let period = *interval;
            let job = Arc::clone(job);
            let mut shutdown_rx = instance.shutdown.subscribe();

            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                // The first tick fires immediately; skip it so jobs run
                // one period after start.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = ticker.tick() => {
                            debug!(job = %name, "Running scheduled job");
                            job().await;
                        }
                    }
                }
                debug!(job = %name, "Scheduled job stopped");
            }));
        }

        info!(jobs = instance.tickers.len(), "Scheduler started");
        Ok(())
    }

    async fn retire(&self, instance: Arc<SchedulerInstance>, grace: Duration) {
        let _ = instance.shutdown.send(true);

        let handles: Vec<JoinHandle<()>> = instance.handles.lock().await.drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        let drain = futures_util::future::join_all(handles);
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("Grace period elapsed, aborting scheduler jobs");
            for abort in aborts {
                abort.abort();
            }
        }
        info!("Scheduler retired");
    }
}
