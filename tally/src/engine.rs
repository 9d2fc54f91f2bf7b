//! Wiring of stores, coordinator and scheduler into a running engine.
//!
//! An [`Engine`] owns the background flush tasks. Producers get a cheap
//! [`Handle`] to record increments and end sessions; neither call waits on
//! the durable store. [`Engine::shutdown`] drains and then releases both
//! stores. A configuration reload is a shutdown followed by a fresh
//! [`Engine::start`].
//!
//! ## Metrics
//!
//! `increment_failure`: Increments the counter store did not accept
//!

use std::{num::NonZeroU64, sync::Arc};

use metrics::counter;
use tracing::{info, warn};

use crate::{
    EntityId, Metric,
    config::{self, Config},
    counter::{self as counters, CounterStore},
    dirty::DirtySet,
    durable::{self, DurableStore},
    flush::Coordinator,
    scheduler::{Router, Scheduler, Settings, ShutdownReport, request_flush},
};

/// Errors produced by [`Engine::start`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configuration is invalid.
    #[error("Invalid configuration: {0}")]
    Config(#[from] config::Error),
    /// The counter store could not be prepared.
    #[error("Counter store could not be prepared: {0}")]
    Counter(#[from] counters::Error),
    /// The durable store could not be constructed.
    #[error("Durable store could not be constructed: {0}")]
    Durable(#[from] durable::Error),
    /// The durable store schema could not be ensured.
    #[error("Durable store schema could not be ensured: {0}")]
    Schema(#[source] durable::Error),
}

/// Records increments and session ends on behalf of producers.
#[derive(Debug, Clone)]
pub struct Handle {
    counters: Arc<dyn CounterStore>,
    dirty: Arc<DirtySet>,
    router: Arc<Router>,
    debug: bool,
}

impl Handle {
    /// Record `delta` more of `metric` for `entity`.
    ///
    /// Never fails from the caller's point of view. A counter store failure
    /// is counted and, in debug mode, logged; the increment may be lost.
    pub async fn increment(&self, entity: &EntityId, metric: Metric, delta: NonZeroU64) {
        if let Err(err) = self.counters.increment(entity, metric, delta).await {
            counter!("increment_failure").increment(1);
            if self.debug {
                warn!("Failed to record {delta} {metric} for {entity}: {err}");
            }
        }
        // Marked even on failure: the store may have applied the increment.
        self.dirty.mark(entity);
    }

    /// Request a prompt flush of `entity` because its session ended.
    ///
    /// Returns immediately. When the flush queue is full the request is
    /// dropped and the entity waits for the next periodic flush.
    pub fn session_end(&self, entity: &EntityId) {
        request_flush(&self.router, entity);
    }

    /// Number of entities currently marked dirty.
    #[must_use]
    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }
}

/// A running write-behind engine.
#[derive(Debug)]
pub struct Engine {
    handle: Handle,
    scheduler: Scheduler,
    counters: Arc<dyn CounterStore>,
    durable: Arc<dyn DurableStore>,
}

impl Engine {
    /// Build the stores described by `config`, provision them and start the
    /// background tasks. Entities the counter store already holds pending
    /// deltas for are marked dirty.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or either store
    /// cannot be provisioned. A missing durable schema is fatal.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub async fn start(config: &Config) -> Result<Self, Error> {
        config.validate()?;
        let settings = config.settings()?;

        let counters: Arc<dyn CounterStore> = match &config.counter_store {
            config::CounterStore::Memory(memory) => {
                Arc::new(counters::memory::Memory::new(memory.shard_count()?))
            }
            config::CounterStore::Sqlite(sqlite) => Arc::new(counters::sqlite::Sqlite::new(sqlite)),
        };
        let durable: Arc<dyn DurableStore> = match &config.durable_store {
            config::DurableStore::Memory => Arc::new(durable::memory::Memory::new()),
            config::DurableStore::Sqlite(sqlite) => Arc::new(durable::sqlite::Sqlite::new(sqlite)?),
        };

        counters.prepare().await?;
        durable.ensure_schema().await.map_err(Error::Schema)?;
        info!("Durable store schema ensured.");

        // Deltas left by an earlier process are otherwise never flushed.
        let recovered = counters.pending_entities().await?;
        let engine = Self::with_stores(counters, durable, settings);
        if !recovered.is_empty() {
            info!(
                "Recovered {} entities with pending counts from the counter store.",
                recovered.len()
            );
            for entity in &recovered {
                engine.handle.dirty.mark(entity);
            }
        }
        Ok(engine)
    }

    /// Start the background tasks over already provisioned stores.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    #[must_use]
    pub fn with_stores(
        counters: Arc<dyn CounterStore>,
        durable: Arc<dyn DurableStore>,
        settings: Settings,
    ) -> Self {
        let dirty = Arc::new(DirtySet::new());
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&counters),
            Arc::clone(&durable),
            Arc::clone(&dirty),
        ));
        let scheduler = Scheduler::start(coordinator, Arc::clone(&dirty), settings);
        let handle = Handle {
            counters: Arc::clone(&counters),
            dirty,
            router: scheduler.router(),
            debug: settings.debug,
        };
        info!(
            "Engine started with {} flush workers, flushing every {:?}.",
            settings.flush_workers, settings.flush_interval
        );
        Self {
            handle,
            scheduler,
            counters,
            durable,
        }
    }

    /// A producer handle. Clones share the engine.
    #[must_use]
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Stop flushing in the background, drain every dirty entity and close
    /// both stores.
    pub async fn shutdown(self) -> ShutdownReport {
        let report = self.scheduler.shutdown().await;
        self.counters.close().await;
        self.durable.close().await;
        info!("Engine stopped.");
        report
    }
}
