//! The durable tier.
//!
//! A [`DurableStore`] holds one record per entity with a running total for
//! every metric and a last-seen timestamp. Flushed deltas are merged in with
//! an additive upsert: an absent record is created, a present one has each
//! delta added to its total. Writes never overwrite totals.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::{EntityId, Metric, metric::Deltas, pool};

pub mod memory;
pub mod sqlite;

/// Errors produced by [`DurableStore`] implementations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error from the connection pool.
    #[error("Connection pool error: {0}")]
    Pool(#[from] pool::Error),
    /// Error from SQLite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A total or delta does not fit the store's signed representation.
    #[error("Value {value} for {metric} exceeds the durable store range")]
    Overflow {
        /// Metric being written.
        metric: Metric,
        /// Offending amount.
        value: u64,
    },
    /// The configured table name is not a plain SQL identifier.
    #[error("Invalid table name: {0}")]
    InvalidTable(String),
    /// Failure reported by a store implemented outside this crate.
    #[error("Durable store unavailable: {0}")]
    Unavailable(String),
}

/// A durable, per-entity record of totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurableRecord {
    /// Running total per metric.
    pub totals: Deltas,
    /// Unix seconds of the most recent merge.
    pub last_seen: u64,
}

/// Storage of durable per-entity totals.
#[async_trait]
pub trait DurableStore: Send + Sync + std::fmt::Debug {
    /// Create the record schema if it does not exist. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created. Callers treat this
    /// as fatal at startup.
    async fn ensure_schema(&self) -> Result<(), Error>;

    /// Add `deltas` to the totals of `entity` in one atomic write, creating
    /// the record if absent, and set its last-seen time to now.
    ///
    /// # Errors
    ///
    /// Returns an error if the write did not commit. Nothing was applied.
    async fn merge_add(&self, entity: &EntityId, deltas: &Deltas) -> Result<(), Error>;

    /// Release held resources.
    async fn close(&self) {}
}

/// Current wall clock time in unix seconds.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since| since.as_secs())
}
