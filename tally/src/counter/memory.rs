//! In-process counter store.
//!
//! Pending deltas live in a fixed number of mutex-guarded shards keyed by
//! entity. Each operation touches exactly one shard and never holds its lock
//! across an await point.

use std::num::{NonZeroU64, NonZeroUsize};

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{CounterStore, Error};
use crate::{EntityId, Metric, metric::Deltas};

/// Sharded in-memory [`CounterStore`].
#[derive(Debug)]
pub struct Memory {
    shards: Box<[Mutex<FxHashMap<EntityId, Deltas>>]>,
}

impl Memory {
    /// Create a store with `shards` independent shards.
    #[must_use]
    pub fn new(shards: NonZeroUsize) -> Self {
        let shards = (0..shards.get())
            .map(|_| Mutex::new(FxHashMap::default()))
            .collect();
        Self { shards }
    }

    fn shard(&self, entity: &EntityId) -> &Mutex<FxHashMap<EntityId, Deltas>> {
        &self.shards[entity.bucket(self.shards.len())]
    }

    /// Pending deltas for `entity`, left untouched.
    #[must_use]
    pub fn pending(&self, entity: &EntityId) -> Deltas {
        self.shard(entity)
            .lock()
            .get(entity)
            .copied()
            .unwrap_or_default()
    }

    /// Number of entities with pending deltas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// True when nothing is pending for any entity.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.lock().is_empty())
    }
}

#[async_trait]
impl CounterStore for Memory {
    async fn increment(
        &self,
        entity: &EntityId,
        metric: Metric,
        delta: NonZeroU64,
    ) -> Result<(), Error> {
        let mut shard = self.shard(entity).lock();
        shard.entry(entity.clone()).or_default().add(metric, delta.get());
        Ok(())
    }

    async fn snapshot_and_reduce(&self, entity: &EntityId) -> Result<Deltas, Error> {
        let mut shard = self.shard(entity).lock();
        let Some(pending) = shard.get_mut(entity) else {
            return Ok(Deltas::new());
        };
        let taken = *pending;
        pending.saturating_sub(&taken);
        if pending.is_zero() {
            shard.remove(entity);
        }
        Ok(taken)
    }

    async fn restore(&self, entity: &EntityId, deltas: &Deltas) -> Result<(), Error> {
        if deltas.is_zero() {
            return Ok(());
        }
        let mut shard = self.shard(entity).lock();
        shard.entry(entity.clone()).or_default().merge(deltas);
        Ok(())
    }

    async fn pending_entities(&self) -> Result<Vec<EntityId>, Error> {
        Ok(self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .iter()
                    .filter(|(_, pending)| !pending.is_zero())
                    .map(|(entity, _)| entity.clone())
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    async fn is_pending(&self, entity: &EntityId) -> Result<bool, Error> {
        Ok(self
            .shard(entity)
            .lock()
            .get(entity)
            .is_some_and(|pending| !pending.is_zero()))
    }
}
