//! The fast counter tier.
//!
//! Every producer increment lands here first. A [`CounterStore`] holds the
//! pending, not yet durable delta for each `(entity, metric)` pair. The flush
//! path reads those deltas and subtracts exactly what it read, leaving any
//! increment that raced in behind for the next flush.
//!
//! The store is not a durable source of truth. A metric whose pending value
//! is missing reads as zero.

use std::num::NonZeroU64;

use async_trait::async_trait;

use crate::{EntityId, Metric, metric::Deltas, pool};

pub mod memory;
pub mod sqlite;

/// Errors produced by [`CounterStore`] implementations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error from the connection pool.
    #[error("Connection pool error: {0}")]
    Pool(#[from] pool::Error),
    /// Error from SQLite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A delta does not fit the store's signed representation.
    #[error("Delta {value} for {metric} exceeds the counter store range")]
    Overflow {
        /// Metric being written.
        metric: Metric,
        /// Offending amount.
        value: u64,
    },
}

/// Storage of pending per-entity deltas.
#[async_trait]
pub trait CounterStore: Send + Sync + std::fmt::Debug {
    /// Provision whatever the store needs before first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be provisioned.
    async fn prepare(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Atomically add `delta` to the pending value of `metric` for `entity`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable. The increment may or may
    /// not have been applied.
    async fn increment(
        &self,
        entity: &EntityId,
        metric: Metric,
        delta: NonZeroU64,
    ) -> Result<(), Error>;

    /// Read every pending delta for `entity` and subtract exactly the amounts
    /// read. Metrics that reach zero are removed.
    ///
    /// Increments applied after the read survive in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable, in which case nothing was
    /// subtracted.
    async fn snapshot_and_reduce(&self, entity: &EntityId) -> Result<Deltas, Error>;

    /// Add `deltas` back after a failed durable merge.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    async fn restore(&self, entity: &EntityId, deltas: &Deltas) -> Result<(), Error> {
        for (metric, amount) in deltas.nonzero() {
            if let Some(delta) = NonZeroU64::new(amount) {
                self.increment(entity, metric, delta).await?;
            }
        }
        Ok(())
    }

    /// Whether any non-zero delta is pending for `entity`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    async fn is_pending(&self, entity: &EntityId) -> Result<bool, Error>;

    /// Every entity with a non-zero pending delta, in no particular order.
    ///
    /// Used at startup to mark deltas left behind by an earlier process as
    /// dirty.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    async fn pending_entities(&self) -> Result<Vec<EntityId>, Error>;

    /// Release held resources.
    async fn close(&self) {}
}
