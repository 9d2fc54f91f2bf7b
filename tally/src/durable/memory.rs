//! In-process durable store, for embedding and tests.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{DurableRecord, DurableStore, Error, unix_now};
use crate::{EntityId, metric::Deltas};

/// [`DurableStore`] kept in a mutex-guarded map.
#[derive(Debug, Default)]
pub struct Memory {
    records: Mutex<FxHashMap<EntityId, DurableRecord>>,
    merges: AtomicU64,
}

impl Memory {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The record for `entity`, if any merge has created it.
    #[must_use]
    pub fn record(&self, entity: &EntityId) -> Option<DurableRecord> {
        self.records.lock().get(entity).copied()
    }

    /// Number of successful merges so far.
    #[must_use]
    pub fn merges(&self) -> u64 {
        self.merges.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DurableStore for Memory {
    async fn ensure_schema(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn merge_add(&self, entity: &EntityId, deltas: &Deltas) -> Result<(), Error> {
        let mut records = self.records.lock();
        let record = records.entry(entity.clone()).or_insert(DurableRecord {
            totals: Deltas::new(),
            last_seen: 0,
        });
        record.totals.merge(deltas);
        record.last_seen = unix_now();
        self.merges.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
