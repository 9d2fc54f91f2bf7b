//! Durable store backed by SQLite.
//!
//! One row per entity, keyed by `entity_id`, with an INTEGER column per
//! metric and `last_seen` in unix seconds. Merges are a single
//! `INSERT .. ON CONFLICT DO UPDATE` statement that adds each delta to the
//! stored total, so a merge either commits entirely or not at all.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rusqlite::{OptionalExtension, params_from_iter, types::Value};

use super::{DurableRecord, DurableStore, Error, unix_now};
use crate::{
    EntityId, Metric,
    config::{SqliteDurableConfig, is_identifier},
    metric::Deltas,
    pool::{Pool, SqliteManager},
};

#[derive(Debug)]
struct Statements {
    schema: String,
    merge: String,
    select: String,
}

impl Statements {
    fn new(table: &str) -> Self {
        let columns: Vec<&str> = Metric::ALL.into_iter().map(Metric::as_str).collect();

        let definitions = columns
            .iter()
            .map(|column| format!("    {column} INTEGER NOT NULL DEFAULT 0,\n"))
            .collect::<Vec<_>>()
            .concat();
        let schema = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n    entity_id TEXT PRIMARY KEY,\n{definitions}    last_seen INTEGER NOT NULL DEFAULT 0\n)"
        );

        let placeholders = (1..=columns.len() + 2)
            .map(|idx| format!("?{idx}"))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = columns
            .iter()
            .map(|column| format!("{column} = {column} + excluded.{column}"))
            .collect::<Vec<_>>()
            .join(", ");
        let merge = format!(
            "INSERT INTO {table} (entity_id, {list}, last_seen) VALUES ({placeholders}) \
             ON CONFLICT (entity_id) DO UPDATE SET {updates}, last_seen = excluded.last_seen",
            list = columns.join(", "),
        );

        let select = format!(
            "SELECT {list}, last_seen FROM {table} WHERE entity_id = ?1",
            list = columns.join(", "),
        );

        Self {
            schema,
            merge,
            select,
        }
    }
}

/// SQLite-backed [`DurableStore`].
#[derive(Debug)]
pub struct Sqlite {
    pool: Pool<SqliteManager>,
    statements: Arc<Statements>,
}

impl Sqlite {
    /// Create the store. The database is not touched until first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTable`] if the configured table name is not a
    /// plain SQL identifier.
    pub fn new(config: &SqliteDurableConfig) -> Result<Self, Error> {
        if !is_identifier(&config.table) {
            return Err(Error::InvalidTable(config.table.clone()));
        }
        let manager = SqliteManager::new(
            config.path.clone(),
            Duration::from_millis(config.pool.busy_timeout_milliseconds),
        );
        Ok(Self {
            pool: Pool::new(
                manager,
                config.pool.connection_limit(),
                Duration::from_millis(config.pool.wait_timeout_milliseconds),
            ),
            statements: Arc::new(Statements::new(&config.table)),
        })
    }

    /// The stored record for `entity`, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be read.
    pub async fn record(&self, entity: &EntityId) -> Result<Option<DurableRecord>, Error> {
        let statements = Arc::clone(&self.statements);
        let entity = entity.to_string();
        self.pool
            .run(move |conn| {
                conn.prepare_cached(&statements.select)?
                    .query_row([&entity], |row| {
                        let mut totals = Deltas::new();
                        for (idx, metric) in Metric::ALL.into_iter().enumerate() {
                            let stored: i64 = row.get(idx)?;
                            totals.add(metric, u64::try_from(stored).unwrap_or(0));
                        }
                        let last_seen: i64 = row.get(Metric::COUNT)?;
                        Ok(DurableRecord {
                            totals,
                            last_seen: u64::try_from(last_seen).unwrap_or(0),
                        })
                    })
                    .optional()
                    .map_err(Error::from)
            })
            .await
    }
}

fn signed(metric: Metric, value: u64) -> Result<i64, Error> {
    i64::try_from(value).map_err(|_| Error::Overflow { metric, value })
}

#[async_trait]
impl DurableStore for Sqlite {
    async fn ensure_schema(&self) -> Result<(), Error> {
        let statements = Arc::clone(&self.statements);
        self.pool
            .run(move |conn| conn.execute_batch(&statements.schema).map_err(Error::from))
            .await
    }

    async fn merge_add(&self, entity: &EntityId, deltas: &Deltas) -> Result<(), Error> {
        let mut values = Vec::with_capacity(Metric::COUNT + 2);
        values.push(Value::Text(entity.to_string()));
        for metric in Metric::ALL {
            values.push(Value::Integer(signed(metric, deltas.get(metric))?));
        }
        values.push(Value::Integer(i64::try_from(unix_now()).unwrap_or(i64::MAX)));

        let statements = Arc::clone(&self.statements);
        self.pool
            .run(move |conn| {
                conn.prepare_cached(&statements.merge)?
                    .execute(params_from_iter(values))?;
                Ok(())
            })
            .await
    }

    async fn close(&self) {
        self.pool.close();
    }
}
