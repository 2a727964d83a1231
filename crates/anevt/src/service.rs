//! The shared state behind all HTTP request handlers.

use std::sync::Arc;

use anyhow::{Context, Result};

use anevt_service::caching::{CacheStoreRef, FilesystemStore, InMemoryStore, QueryArgs};
use anevt_service::config::{CacheStoreConfig, Config};
use anevt_service::cron::{CronSchedule, spawn_cron};
use anevt_service::events::EventSink;
use anevt_service::registry::Registry;

use crate::builtin;

/// The underlying state for the HTTP request handlers.
///
/// Cheap to clone; all request handlers share one instance.
#[derive(Clone, Debug)]
pub struct AppService {
    inner: Arc<AppServiceInner>,
}

#[derive(Debug)]
struct AppServiceInner {
    config: Config,
    registry: Registry,
    sink: Arc<EventSink>,
}

impl AppService {
    /// Creates the shared store, registers the builtin module and spawns the
    /// configured background schedule.
    ///
    /// Must run inside a tokio runtime.
    pub async fn create(config: Config) -> Result<Self> {
        let store: CacheStoreRef = match &config.cache_store {
            CacheStoreConfig::InMemory { capacity } => Arc::new(InMemoryStore::new(*capacity)),
            CacheStoreConfig::Filesystem { path } => Arc::new(
                FilesystemStore::new(path.clone())
                    .context("failed to open the cache store directory")?,
            ),
        };

        let registry = Registry::new();
        let sink = Arc::new(EventSink::default());
        let warmed = builtin::register(&registry, &config, sink.clone(), store)
            .context("failed to register the builtin module")?;

        if let Some(ref cron) = config.cron {
            spawn_cron(
                CronSchedule {
                    run_every: cron.run_every,
                    force_memoize: cron.force_memoize,
                    params: QueryArgs::new(),
                },
                warmed,
            );
        }

        Ok(AppService {
            inner: Arc::new(AppServiceInner {
                config,
                registry,
                sink,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn sink(&self) -> &Arc<EventSink> {
        &self.inner.sink
    }
}
