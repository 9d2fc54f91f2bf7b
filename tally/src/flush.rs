//! Moving pending deltas from the counter store into the durable store.
//!
//! The [`Coordinator`] flushes one entity at a time and never runs two
//! flushes of the same entity concurrently. A flush reads and subtracts the
//! pending deltas, merges them into the durable store and then settles the
//! entity's dirty membership. Increments that land while a flush is running
//! are left pending and keep the entity dirty.
//!
//! When the durable merge fails the deltas are added back to the counter
//! store and the entity stays dirty, so a later flush retries them. If adding
//! them back fails too the amounts are logged at error level; they are lost
//! from the counter store and must be reconciled by hand.
//!
//! ## Metrics
//!
//! `flush_success`: Entities whose deltas were merged
//! `flush_failure`: Flushes that left their deltas pending
//! `flush_busy`: Flushes skipped because the entity was already being flushed
//! `flush_clean`: Flushes that found nothing pending
//! `restore_failure`: Deltas that could not be added back after a failed merge
//! `flushed_delta`: Amount merged, labeled by metric
//!

use std::{num::NonZeroUsize, sync::Arc};

use futures::{StreamExt, stream};
use metrics::counter;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::{debug, error, warn};

use crate::{
    EntityId, counter::CounterStore, dirty::DirtySet, durable::DurableStore, metric::Deltas,
};

/// Result of a single [`Coordinator::flush_entity`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Another flush of the same entity was in progress. Nothing was done.
    Busy,
    /// Nothing was pending.
    Clean,
    /// The contained deltas were merged into the durable store.
    Flushed(Deltas),
    /// Deltas stay pending and the entity stays dirty.
    Failed,
}

/// Tally of outcomes from [`Coordinator::flush_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    /// Entities whose deltas were merged.
    pub flushed: usize,
    /// Entities with nothing pending.
    pub clean: usize,
    /// Entities skipped because a flush was already running.
    pub busy: usize,
    /// Entities whose flush failed.
    pub failed: usize,
}

impl Summary {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Busy => self.busy += 1,
            Outcome::Clean => self.clean += 1,
            Outcome::Flushed(_) => self.flushed += 1,
            Outcome::Failed => self.failed += 1,
        }
    }
}

/// Runs flushes with at most one in flight per entity.
#[derive(Debug)]
pub struct Coordinator {
    counters: Arc<dyn CounterStore>,
    durable: Arc<dyn DurableStore>,
    dirty: Arc<DirtySet>,
    in_flight: Mutex<FxHashSet<EntityId>>,
}

/// Membership in `in_flight`, released on drop.
struct Claim<'a> {
    in_flight: &'a Mutex<FxHashSet<EntityId>>,
    entity: EntityId,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.entity);
    }
}

impl Coordinator {
    /// Create a new coordinator over the given stores.
    #[must_use]
    pub fn new(
        counters: Arc<dyn CounterStore>,
        durable: Arc<dyn DurableStore>,
        dirty: Arc<DirtySet>,
    ) -> Self {
        Self {
            counters,
            durable,
            dirty,
            in_flight: Mutex::new(FxHashSet::default()),
        }
    }

    fn claim(&self, entity: &EntityId) -> Option<Claim<'_>> {
        let mut in_flight = self.in_flight.lock();
        if in_flight.contains(entity) {
            return None;
        }
        in_flight.insert(entity.clone());
        Some(Claim {
            in_flight: &self.in_flight,
            entity: entity.clone(),
        })
    }

    /// Flush every pending delta of `entity` into the durable store.
    pub async fn flush_entity(&self, entity: &EntityId) -> Outcome {
        let Some(_claim) = self.claim(entity) else {
            debug!("Flush of {entity} already in progress, skipping.");
            counter!("flush_busy").increment(1);
            return Outcome::Busy;
        };

        let deltas = match self.counters.snapshot_and_reduce(entity).await {
            Ok(deltas) => deltas,
            Err(err) => {
                warn!("Failed to read pending counters of {entity}, will retry: {err}");
                counter!("flush_failure").increment(1);
                self.dirty.mark(entity);
                return Outcome::Failed;
            }
        };

        if deltas.is_zero() {
            self.settle(entity).await;
            counter!("flush_clean").increment(1);
            return Outcome::Clean;
        }

        if let Err(err) = self.durable.merge_add(entity, &deltas).await {
            warn!("Failed to merge counters of {entity} into durable store, restoring: {err}");
            counter!("flush_failure").increment(1);
            if let Err(restore_err) = self.counters.restore(entity, &deltas).await {
                error!(
                    ?deltas,
                    "Failed to restore pending counters of {entity} after a failed merge, these amounts are lost: {restore_err}"
                );
                counter!("restore_failure").increment(1);
            }
            self.dirty.mark(entity);
            return Outcome::Failed;
        }

        for (metric, amount) in deltas.nonzero() {
            counter!("flushed_delta", "metric" => metric.as_str()).increment(amount);
        }
        counter!("flush_success").increment(1);
        debug!("Flushed {} counts for {entity}.", deltas.total());
        self.settle(entity).await;
        Outcome::Flushed(deltas)
    }

    /// Drop `entity` from the dirty set unless something is still pending.
    ///
    /// Removal happens first so that an increment racing with this call
    /// either shows up in the pending check or re-marks the entity itself.
    async fn settle(&self, entity: &EntityId) {
        self.dirty.remove(entity);
        match self.counters.is_pending(entity).await {
            Ok(false) => {}
            Ok(true) => self.dirty.mark(entity),
            Err(err) => {
                debug!("Could not check pending counters of {entity}, keeping it dirty: {err}");
                self.dirty.mark(entity);
            }
        }
    }

    /// Flush each of `entities`, running up to `concurrency` flushes at once.
    pub async fn flush_all(&self, entities: Vec<EntityId>, concurrency: NonZeroUsize) -> Summary {
        stream::iter(entities)
            .map(|entity| async move { self.flush_entity(&entity).await })
            .buffer_unordered(concurrency.get())
            .fold(Summary::default(), |mut summary, outcome| async move {
                summary.record(outcome);
                summary
            })
            .await
    }
}
