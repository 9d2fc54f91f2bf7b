//! Counter store backed by a shared SQLite database.
//!
//! Pending deltas are kept one row per `(key, field)` in the
//! `pending_counters` table where the key is `"{namespace}:{entity}"` and the
//! field is the metric's storage name. Several processes may share the same
//! database file; SQLite's write lock makes each increment and each
//! read-and-subtract atomic.
//!
//! A stored value that is not an integer, or that is negative, reads as zero
//! and is deleted on the next reduction, as is a field that names no known
//! metric. Increments saturate at `i64::MAX`.

use std::{num::NonZeroU64, sync::Arc, time::Duration};

use async_trait::async_trait;
use rusqlite::{TransactionBehavior, params, types::Value};
use rustc_hash::FxHashSet;
use tracing::warn;

use super::{CounterStore, Error};
use crate::{
    EntityId, Metric,
    config::SqliteCounterConfig,
    metric::Deltas,
    pool::{Pool, SqliteManager},
};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS pending_counters (
    key TEXT NOT NULL,
    field TEXT NOT NULL,
    value INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (key, field)
)";

// Saturates at i64::MAX. Left unchecked SQLite would overflow into a REAL.
const INCREMENT: &str = "INSERT INTO pending_counters (key, field, value) VALUES (?1, ?2, ?3)
    ON CONFLICT (key, field) DO UPDATE SET value = CASE
        WHEN typeof(value) = 'integer' AND value > 9223372036854775807 - excluded.value
            THEN 9223372036854775807
        ELSE value + excluded.value
    END";

const SELECT: &str = "SELECT field, value FROM pending_counters WHERE key = ?1";

const SUBTRACT: &str = "UPDATE pending_counters SET value = value - ?3 WHERE key = ?1 AND field = ?2";

const DROP_FIELD: &str = "DELETE FROM pending_counters WHERE key = ?1 AND field = ?2";

const PENDING_KEYS: &str = "SELECT key, field FROM pending_counters
    WHERE substr(key, 1, length(?1)) = ?1 AND typeof(value) = 'integer' AND value > 0";

const PRUNE: &str = "DELETE FROM pending_counters
    WHERE key = ?1 AND (typeof(value) != 'integer' OR value <= 0)";

/// SQLite-backed [`CounterStore`].
#[derive(Debug)]
pub struct Sqlite {
    pool: Pool<SqliteManager>,
    namespace: Arc<str>,
}

impl Sqlite {
    /// Create the store. The database is not touched until first use.
    #[must_use]
    pub fn new(config: &SqliteCounterConfig) -> Self {
        let manager = SqliteManager::new(
            config.path.clone(),
            Duration::from_millis(config.pool.busy_timeout_milliseconds),
        );
        Self {
            pool: Pool::new(
                manager,
                config.pool.connection_limit(),
                Duration::from_millis(config.pool.wait_timeout_milliseconds),
            ),
            namespace: Arc::from(config.namespace.as_str()),
        }
    }

    fn key(&self, entity: &EntityId) -> String {
        format!("{}:{}", self.namespace, entity)
    }
}

fn amount(value: &Value) -> u64 {
    match value {
        Value::Integer(int) => u64::try_from(*int).unwrap_or(0),
        _ => 0,
    }
}

fn signed(metric: Metric, value: u64) -> Result<i64, Error> {
    i64::try_from(value).map_err(|_| Error::Overflow { metric, value })
}

#[async_trait]
impl CounterStore for Sqlite {
    async fn prepare(&self) -> Result<(), Error> {
        self.pool
            .run(|conn| conn.execute_batch(SCHEMA).map_err(Error::from))
            .await
    }

    async fn increment(
        &self,
        entity: &EntityId,
        metric: Metric,
        delta: NonZeroU64,
    ) -> Result<(), Error> {
        let key = self.key(entity);
        let delta = signed(metric, delta.get())?;
        self.pool
            .run(move |conn| {
                conn.prepare_cached(INCREMENT)?
                    .execute(params![key, metric.as_str(), delta])?;
                Ok(())
            })
            .await
    }

    async fn snapshot_and_reduce(&self, entity: &EntityId) -> Result<Deltas, Error> {
        let key = self.key(entity);
        self.pool
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut taken = Deltas::new();
                let mut unknown = Vec::new();
                {
                    let mut select = tx.prepare_cached(SELECT)?;
                    let rows = select.query_map([&key], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, Value>(1)?))
                    })?;
                    for row in rows {
                        let (field, value) = row?;
                        match field.parse::<Metric>() {
                            Ok(metric) => taken.add(metric, amount(&value)),
                            Err(err) => {
                                warn!("Dropping pending field under {key}: {err}");
                                unknown.push(field);
                            }
                        }
                    }
                }
                for field in unknown {
                    tx.execute(DROP_FIELD, params![key, field])?;
                }
                {
                    let mut subtract = tx.prepare_cached(SUBTRACT)?;
                    for (metric, value) in taken.nonzero() {
                        subtract.execute(params![key, metric.as_str(), signed(metric, value)?])?;
                    }
                }
                tx.execute(PRUNE, [&key])?;
                tx.commit()?;
                Ok(taken)
            })
            .await
    }

    async fn restore(&self, entity: &EntityId, deltas: &Deltas) -> Result<(), Error> {
        if deltas.is_zero() {
            return Ok(());
        }
        let key = self.key(entity);
        let deltas = *deltas;
        self.pool
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                {
                    let mut increment = tx.prepare_cached(INCREMENT)?;
                    for (metric, value) in deltas.nonzero() {
                        increment.execute(params![key, metric.as_str(), signed(metric, value)?])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    async fn is_pending(&self, entity: &EntityId) -> Result<bool, Error> {
        let key = self.key(entity);
        self.pool
            .run(move |conn| {
                let mut select = conn.prepare_cached(SELECT)?;
                let rows = select.query_map([&key], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Value>(1)?))
                })?;
                for row in rows {
                    let (field, value) = row?;
                    if field.parse::<Metric>().is_ok() && amount(&value) > 0 {
                        return Ok(true);
                    }
                }
                Ok(false)
            })
            .await
    }

    async fn pending_entities(&self) -> Result<Vec<EntityId>, Error> {
        let prefix = format!("{}:", self.namespace);
        self.pool
            .run(move |conn| {
                let mut select = conn.prepare_cached(PENDING_KEYS)?;
                let rows = select.query_map([&prefix], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                let mut entities = FxHashSet::default();
                for row in rows {
                    let (key, field) = row?;
                    if field.parse::<Metric>().is_err() {
                        continue;
                    }
                    if let Some(entity) = key.strip_prefix(prefix.as_str()) {
                        entities.insert(EntityId::from(entity));
                    }
                }
                Ok(entities.into_iter().collect())
            })
            .await
    }

    async fn close(&self) {
        self.pool.close();
    }
}
