//! Hot-swappable resources: build-swap-retire with no observable gap.
//!
//! Every stateful subsystem (HTTP listener, pooled client, scheduler,
//! log sink) follows the same discipline: decode typed options from its
//! settings section, build a replacement instance before touching the
//! current one, swap the pointer under a short write lock, and retire
//! the old instance in the background with a bounded grace period. A
//! failed build never leaves the resource without a working instance.

pub mod http;
pub mod logsink;
pub mod redis;
pub mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Reloader;
use crate::error::ResourceError;
use crate::metrics::Metrics;
use crate::settings::SettingsTree;

/// Default bound on graceful retirement of a replaced instance.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(30);

/// Constructs and retires instances of one managed resource type.
#[async_trait]
pub trait ResourceBuilder: Send + Sync + 'static {
    /// Typed projection of this resource's settings section.
    type Options: DeserializeOwned + PartialEq + Clone + Send + Sync + 'static;
    /// The underlying resource instance.
    type Instance: Send + Sync + 'static;

    /// Dotted settings path of this resource's section (e.g. `"http"`).
    fn section(&self) -> &'static str;

    /// Whether the decoded options enable this resource.
    fn enabled(&self, options: &Self::Options) -> bool;

    /// Builds a new instance from options. Must not disturb any currently
    /// running instance.
    async fn build(&self, options: &Self::Options) -> Result<Self::Instance, ResourceError>;

    /// Begins external work (accepting connections, ticking). Resources
    /// without an explicit serve phase keep the default no-op.
    async fn start(&self, instance: &Arc<Self::Instance>) -> Result<(), ResourceError> {
        let _ = instance;
        Ok(())
    }

    /// Retires an instance, allowing in-flight work to drain for at most
    /// `grace` before force-releasing.
    async fn retire(&self, instance: Arc<Self::Instance>, grace: Duration);
}

struct SwapState<B: ResourceBuilder> {
    options: Option<B::Options>,
    instance: Option<Arc<B::Instance>>,
    started: bool,
    closed: bool,
}

/// Holds the currently-active instance of one resource and swaps it on
/// configuration change.
pub struct HotSwap<B: ResourceBuilder> {
    builder: Arc<B>,
    grace: Duration,
    metrics: Arc<Metrics>,
    state: RwLock<SwapState<B>>,
}

impl<B: ResourceBuilder> HotSwap<B> {
    /// Creates an unbuilt resource with the default grace period.
    pub fn new(builder: B, metrics: Arc<Metrics>) -> Arc<Self> {
        Self::with_grace(builder, metrics, DEFAULT_GRACE)
    }

    /// Creates an unbuilt resource with an explicit grace period.
    pub fn with_grace(builder: B, metrics: Arc<Metrics>, grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            builder: Arc::new(builder),
            grace,
            metrics,
            state: RwLock::new(SwapState {
                options: None,
                instance: None,
                started: false,
                closed: false,
            }),
        })
    }

    /// Settings section this resource is configured from.
    pub fn section(&self) -> &'static str {
        self.builder.section()
    }

    /// Returns the active instance, or `Disabled` when configuration has
    /// turned this resource off.
    pub async fn get(&self) -> Result<Arc<B::Instance>, ResourceError> {
        let state = self.state.read().await;
        if state.closed {
            return Err(ResourceError::Closed {
                section: self.section().to_string(),
            });
        }
        state.instance.clone().ok_or_else(|| ResourceError::Disabled {
            section: self.section().to_string(),
        })
    }

    /// Returns the currently applied options, if any configuration has
    /// been applied yet.
    pub async fn current_options(&self) -> Option<B::Options> {
        self.state.read().await.options.clone()
    }

    /// Decodes this resource's section from the tree and applies it.
    ///
    /// Structurally identical options are a no-op. Otherwise a
    /// replacement instance is built first; only on success is the
    /// pointer swapped and the old instance retired in the background.
    /// On any failure the previous options and instance stay
    /// authoritative.
    pub async fn apply(&self, tree: &SettingsTree) -> Result<(), ResourceError> {
        let section = self.section();
        let options: B::Options =
            tree.decode(section)
                .map_err(|e| ResourceError::DecodeFailed {
                    section: section.to_string(),
                    message: e.to_string(),
                })?;

        let started = {
            let state = self.state.read().await;
            if state.closed {
                return Err(ResourceError::Closed {
                    section: section.to_string(),
                });
            }
            if state.options.as_ref() == Some(&options) {
                debug!(section, "Options unchanged, skipping reload");
                return Ok(());
            }
            state.started
        };

        if !self.builder.enabled(&options) {
            let old = {
                let mut state = self.state.write().await;
                state.options = Some(options);
                state.instance.take()
            };
            if let Some(old) = old {
                self.retire_in_background(old);
            }
            info!(section, "Resource disabled by configuration");
            return Ok(());
        }

        let new_instance = match self.builder.build(&options).await {
            Ok(instance) => Arc::new(instance),
            Err(e) => {
                self.metrics
                    .resource_build_failures_total
                    .with_label_values(&[section])
                    .inc();
                warn!(section, error = %e, "Replacement build failed, previous instance stays active");
                return Err(e);
            }
        };

        // New work must have somewhere to go before the old instance
        // starts draining.
        if started {
            if let Err(e) = self.builder.start(&new_instance).await {
                self.metrics
                    .resource_build_failures_total
                    .with_label_values(&[section])
                    .inc();
                warn!(section, error = %e, "Replacement failed to start, previous instance stays active");
                self.retire_in_background(new_instance);
                return Err(e);
            }
        }

        let mut state = self.state.write().await;
        if state.closed {
            drop(state);
            self.retire_in_background(new_instance);
            return Err(ResourceError::Closed {
                section: section.to_string(),
            });
        }
        // start() may have landed while the replacement was building; the
        // instance being swapped in must be serving in that case.
        if state.started && !started {
            if let Err(e) = self.builder.start(&new_instance).await {
                drop(state);
                self.metrics
                    .resource_build_failures_total
                    .with_label_values(&[section])
                    .inc();
                warn!(section, error = %e, "Replacement failed to start, previous instance stays active");
                self.retire_in_background(new_instance);
                return Err(e);
            }
        }
        state.options = Some(options);
        let old = state.instance.replace(new_instance);
        drop(state);

        if let Some(old) = old {
            self.retire_in_background(old);
        }

        self.metrics
            .resource_swaps_total
            .with_label_values(&[section])
            .inc();
        info!(section, "Resource instance swapped");
        Ok(())
    }

    /// Enters the serve phase. Idempotent; a disabled resource starts
    /// successfully but does no work until configuration enables it.
    pub async fn start(&self) -> Result<(), ResourceError> {
        let instance = {
            let mut state = self.state.write().await;
            if state.closed {
                return Err(ResourceError::Closed {
                    section: self.section().to_string(),
                });
            }
            if state.started {
                return Ok(());
            }
            state.started = true;
            state.instance.clone()
        };

        if let Some(instance) = instance {
            if let Err(e) = self.builder.start(&instance).await {
                self.state.write().await.started = false;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Retires the current instance and marks the resource closed.
    ///
    /// Waits for the drain (bounded by the grace period) so shutdown
    /// sequencing observes completion. Terminal: a closed resource
    /// rejects further applies.
    pub async fn close(&self) {
        let old = {
            let mut state = self.state.write().await;
            if state.closed {
                return;
            }
            state.closed = true;
            state.started = false;
            state.instance.take()
        };

        if let Some(old) = old {
            self.builder.retire(old, self.grace).await;
        }
        info!(section = self.section(), "Resource closed");
    }

    fn retire_in_background(&self, instance: Arc<B::Instance>) {
        let builder = Arc::clone(&self.builder);
        let grace = self.grace;
        let section = self.section();
        tokio::spawn(async move {
            builder.retire(instance, grace).await;
            debug!(section, "Old instance retired");
        });
    }
}

#[async_trait]
impl<B: ResourceBuilder> Reloader for HotSwap<B> {
    async fn reload(&self, tree: Arc<SettingsTree>) -> anyhow::Result<()> {
        self.apply(&tree).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct FakeOptions {
        #[serde(default = "default_true")]
        enabled: bool,
        #[serde(default)]
        generation: u64,
    }

    fn default_true() -> bool {
        true
    }

    #[derive(Debug)]
    struct FakeInstance {
        generation: u64,
    }

    struct FakeBuilder {
        builds: AtomicUsize,
        retired: AtomicUsize,
        fail_builds: AtomicBool,
    }

    impl FakeBuilder {
        fn new() -> Self {
            Self {
                builds: AtomicUsize::new(0),
                retired: AtomicUsize::new(0),
                fail_builds: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ResourceBuilder for FakeBuilder {
        type Options = FakeOptions;
        type Instance = FakeInstance;

        fn section(&self) -> &'static str {
            "fake"
        }

        fn enabled(&self, options: &FakeOptions) -> bool {
            options.enabled
        }

        async fn build(&self, options: &FakeOptions) -> Result<FakeInstance, ResourceError> {
            if self.fail_builds.load(Ordering::SeqCst) {
                return Err(ResourceError::BuildFailed {
                    section: "fake".into(),
                    message: "forced failure".into(),
                });
            }
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(FakeInstance {
                generation: options.generation,
            })
        }

        async fn retire(&self, _instance: Arc<FakeInstance>, _grace: Duration) {
            self.retired.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tree(yaml: &str) -> SettingsTree {
        SettingsTree::from_yaml_str(yaml).unwrap()
    }

    fn metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new().unwrap())
    }

    #[tokio::test]
    async fn identical_options_are_a_no_op() {
        let swap = HotSwap::new(FakeBuilder::new(), metrics());
        swap.apply(&tree("fake:\n  generation: 1\n")).await.unwrap();

        let before = swap.get().await.unwrap();
        swap.apply(&tree("fake:\n  generation: 1\n")).await.unwrap();
        let after = swap.get().await.unwrap();

        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(swap.builder.builds.load(Ordering::SeqCst), 1);
        assert_eq!(swap.builder.retired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn changed_options_swap_and_retire_old() {
        let swap = HotSwap::new(FakeBuilder::new(), metrics());
        swap.apply(&tree("fake:\n  generation: 1\n")).await.unwrap();
        swap.apply(&tree("fake:\n  generation: 2\n")).await.unwrap();

        let current = swap.get().await.unwrap();
        assert_eq!(current.generation, 2);

        // Retirement runs in the background.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(swap.builder.retired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_build_keeps_previous_instance_serving() {
        let swap = HotSwap::new(FakeBuilder::new(), metrics());
        swap.apply(&tree("fake:\n  generation: 1\n")).await.unwrap();
        let before = swap.get().await.unwrap();

        swap.builder.fail_builds.store(true, Ordering::SeqCst);
        let err = swap
            .apply(&tree("fake:\n  generation: 2\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResourceError::BuildFailed { .. }));

        // Health probe: the old instance still answers.
        let after = swap.get().await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.generation, 1);
    }

    #[tokio::test]
    async fn decode_failure_keeps_previous_options() {
        let swap = HotSwap::new(FakeBuilder::new(), metrics());
        swap.apply(&tree("fake:\n  generation: 1\n")).await.unwrap();

        let err = swap
            .apply(&tree("fake:\n  generation: not-a-number\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResourceError::DecodeFailed { .. }));

        let options = swap.current_options().await.unwrap();
        assert_eq!(options.generation, 1);
        assert_eq!(swap.get().await.unwrap().generation, 1);
    }

    #[tokio::test]
    async fn disabled_resource_answers_disabled() {
        let swap = HotSwap::new(FakeBuilder::new(), metrics());
        swap.apply(&tree("fake:\n  enabled: false\n")).await.unwrap();

        let err = swap.get().await.unwrap_err();
        assert!(err.is_disabled());
    }

    #[tokio::test]
    async fn disabling_a_running_resource_retires_it() {
        let swap = HotSwap::new(FakeBuilder::new(), metrics());
        swap.apply(&tree("fake:\n  generation: 1\n")).await.unwrap();
        swap.apply(&tree("fake:\n  enabled: false\n")).await.unwrap();

        assert!(swap.get().await.unwrap_err().is_disabled());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(swap.builder.retired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_applies_never_expose_a_gap() {
        let swap = HotSwap::new(FakeBuilder::new(), metrics());
        swap.apply(&tree("fake:\n  generation: 0\n")).await.unwrap();

        let mut tasks = Vec::new();
        for generation in 1..=8u64 {
            let swap = Arc::clone(&swap);
            tasks.push(tokio::spawn(async move {
                let yaml = format!("fake:\n  generation: {generation}\n");
                let _ = swap.apply(&tree(&yaml)).await;
            }));
        }

        // Observe continuously while the swaps race.
        let observer = {
            let swap = Arc::clone(&swap);
            tokio::spawn(async move {
                for _ in 0..100 {
                    assert!(swap.get().await.is_ok(), "observed a zero-instance gap");
                    tokio::time::sleep(Duration::from_micros(100)).await;
                }
            })
        };

        for task in tasks {
            task.await.unwrap();
        }
        observer.await.unwrap();
    }

    #[derive(Debug)]
    struct GatedInstance {
        generation: u64,
        started: AtomicBool,
    }

    /// Parks every build after the first until the gate is released.
    struct GatedBuilder {
        gate: Arc<tokio::sync::Notify>,
        builds: AtomicUsize,
    }

    #[async_trait]
    impl ResourceBuilder for GatedBuilder {
        type Options = FakeOptions;
        type Instance = GatedInstance;

        fn section(&self) -> &'static str {
            "fake"
        }

        fn enabled(&self, options: &FakeOptions) -> bool {
            options.enabled
        }

        async fn build(&self, options: &FakeOptions) -> Result<GatedInstance, ResourceError> {
            if self.builds.fetch_add(1, Ordering::SeqCst) > 0 {
                self.gate.notified().await;
            }
            Ok(GatedInstance {
                generation: options.generation,
                started: AtomicBool::new(false),
            })
        }

        async fn start(&self, instance: &Arc<GatedInstance>) -> Result<(), ResourceError> {
            instance.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn retire(&self, _instance: Arc<GatedInstance>, _grace: Duration) {}
    }

    #[tokio::test]
    async fn start_during_build_starts_the_replacement() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let builder = GatedBuilder {
            gate: Arc::clone(&gate),
            builds: AtomicUsize::new(0),
        };
        let swap = HotSwap::new(builder, metrics());
        swap.apply(&tree("fake:\n  generation: 1\n")).await.unwrap();

        // The second apply parks inside build while start() lands.
        let apply_task = {
            let swap = Arc::clone(&swap);
            tokio::spawn(async move { swap.apply(&tree("fake:\n  generation: 2\n")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        swap.start().await.unwrap();
        gate.notify_one();
        apply_task.await.unwrap().unwrap();

        let current = swap.get().await.unwrap();
        assert_eq!(current.generation, 2);
        assert!(
            current.started.load(Ordering::SeqCst),
            "swapped-in instance never entered the serve phase"
        );
    }

    #[tokio::test]
    async fn close_is_terminal() {
        let swap = HotSwap::new(FakeBuilder::new(), metrics());
        swap.apply(&tree("fake:\n  generation: 1\n")).await.unwrap();

        swap.close().await;
        assert_eq!(swap.builder.retired.load(Ordering::SeqCst), 1);

        let err = swap.apply(&tree("fake:\n  generation: 2\n")).await.unwrap_err();
        assert!(matches!(err, ResourceError::Closed { .. }));
        assert!(matches!(
            swap.get().await.unwrap_err(),
            ResourceError::Closed { .. }
        ));

        // Idempotent.
        swap.close().await;
        assert_eq!(swap.builder.retired.load(Ordering::SeqCst), 1);
    }
}
