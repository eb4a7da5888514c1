//! Starter adapters for the built-in hot-swap resources.
//!
//! Each starter registers its resource as a reload subscriber and applies
//! the boot-time configuration during `init`, enters the serve phase in
//! `start`, and retires the resource in `stop`.

use std::sync::Arc;

use async_trait::async_trait;

use super::Starter;
use crate::config::{ConfigManager, Reloader};
use crate::resource::http::HttpBuilder;
use crate::resource::logsink::LogSinkBuilder;
use crate::resource::redis::RedisBuilder;
use crate::resource::scheduler::SchedulerBuilder;
use crate::resource::{HotSwap, ResourceBuilder};

/// A section participates in boot when an explicit `<section>.enabled`
/// key says so, or, absent that key, when the section is present at all.
async fn enabled_by_config(config: &ConfigManager, section: &str) -> bool {
    let tree = config.snapshot().await;
    match tree.get_bool(&format!("{section}.enabled")) {
        Some(explicit) => explicit,
        None => tree.contains(section),
    }
}

async fn init_resource<B: ResourceBuilder>(
    config: &ConfigManager,
    resource: &Arc<HotSwap<B>>,
) -> anyhow::Result<()> {
    let tree = config.snapshot().await;
    resource.apply(&tree).await?;
    let reloader = Arc::clone(resource) as Arc<dyn Reloader>;
    config.register_reloader(resource.section(), reloader)?;
    Ok(())
}

macro_rules! resource_starter {
    ($(#[$doc:meta])* $starter:ident, $builder:ty, $name:literal) => {
        $(#[$doc])*
        pub struct $starter {
            resource: Arc<HotSwap<$builder>>,
        }

        impl $starter {
            pub fn new(resource: Arc<HotSwap<$builder>>) -> Self {
                Self { resource }
            }

            pub fn resource(&self) -> Arc<HotSwap<$builder>> {
                Arc::clone(&self.resource)
            }
        }

        #[async_trait]
        impl Starter for $starter {
            fn name(&self) -> &'static str {
                $name
            }

            async fn enabled(&self, config: &ConfigManager) -> bool {
                enabled_by_config(config, $name).await
            }

            async fn init(&self, config: &ConfigManager) -> anyhow::Result<()> {
                init_resource(config, &self.resource).await
            }

            async fn start(&self, _config: &ConfigManager) -> anyhow::Result<()> {
                self.resource.start().await?;
                Ok(())
            }

            async fn stop(&self, _config: &ConfigManager) -> anyhow::Result<()> {
                self.resource.close().await;
                Ok(())
            }
        }
    };
}

resource_starter!(
    /// Lifecycle adapter for the log-sink resource.
    LoggerStarter,
    LogSinkBuilder,
    "logger"
);

resource_starter!(
    /// Lifecycle adapter for the HTTP listener resource.
    HttpStarter,
    HttpBuilder,
    "http"
);

resource_starter!(
    /// Lifecycle adapter for the pooled Redis client resource.
    RedisStarter,
    RedisBuilder,
    "redis"
);

resource_starter!(
    /// Lifecycle adapter for the periodic-task scheduler resource.
    SchedulerStarter,
    SchedulerBuilder,
    "scheduler"
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use std::io::Write;

    fn manager_with(content: &str) -> (ConfigManager, tempfile::NamedTempFile) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{content}").unwrap();
        file.flush().unwrap();
        let manager = ConfigManager::new(file.path(), Arc::new(Metrics::new().unwrap()));
        (manager, file)
    }

    #[tokio::test]
    async fn section_presence_enables_a_starter() {
        let (config, _file) = manager_with("http:\n  port: 8080\n");
        config.load(None).await.unwrap();

        assert!(enabled_by_config(&config, "http").await);
        assert!(!enabled_by_config(&config, "redis").await);
    }

    #[tokio::test]
    async fn explicit_enabled_key_wins_over_presence() {
        let (config, _file) = manager_with("http:\n  enabled: false\n  port: 8080\n");
        config.load(None).await.unwrap();

        assert!(!enabled_by_config(&config, "http").await);
    }

    #[tokio::test]
    async fn init_registers_the_resource_as_a_reloader() {
        let (config, _file) = manager_with("http:\n  addr: 127.0.0.1\n  port: 0\n");
        config.load(None).await.unwrap();

        let metrics = Arc::new(Metrics::new().unwrap());
        let starter = HttpStarter::new(HotSwap::new(HttpBuilder::new(Arc::clone(&metrics)), metrics));
        starter.init(&config).await.unwrap();

        // The section name is now taken in the reloader registry.
        let dup: Arc<dyn Reloader> = starter.resource();
        assert!(config.register_reloader("http", dup).is_err());

        starter.stop(&config).await.unwrap();
    }
}
