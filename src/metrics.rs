//! Prometheus metrics for the framework.

use prometheus::{CounterVec, Opts, Registry};

/// Counters for reload and hot-swap activity.
///
/// Handed to components at construction; served by the managed HTTP
/// listener at `/metrics`.
pub struct Metrics {
    /// Registry for all metrics.
    registry: Registry,
    /// Reload pipeline firings by trigger (file, remote, activation).
    pub reloads_total: CounterVec,
    /// Per-subscriber reload failures.
    pub reloader_failures_total: CounterVec,
    /// Successful instance swaps by resource section.
    pub resource_swaps_total: CounterVec,
    /// Failed replacement builds by resource section.
    pub resource_build_failures_total: CounterVec,
}

impl Metrics {
    /// Creates a new metrics instance with all counters registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reloads_total = CounterVec::new(
            Opts::new("config_reloads_total", "Configuration reload firings"),
            &["trigger"],
        )?;

        let reloader_failures_total = CounterVec::new(
            Opts::new(
                "config_reloader_failures_total",
                "Reload notifications that failed or panicked",
            ),
            &["component"],
        )?;

        let resource_swaps_total = CounterVec::new(
            Opts::new(
                "resource_swaps_total",
                "Hot-swap instance replacements by resource",
            ),
            &["section"],
        )?;

        let resource_build_failures_total = CounterVec::new(
            Opts::new(
                "resource_build_failures_total",
                "Failed replacement builds by resource",
            ),
            &["section"],
        )?;

        registry.register(Box::new(reloads_total.clone()))?;
        registry.register(Box::new(reloader_failures_total.clone()))?;
        registry.register(Box::new(resource_swaps_total.clone()))?;
        registry.register(Box::new(resource_build_failures_total.clone()))?;

        Ok(Self {
            registry,
            reloads_total,
            reloader_failures_total,
            resource_swaps_total,
            resource_build_failures_total,
        })
    }

    /// Returns the metrics in Prometheus text format.
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
