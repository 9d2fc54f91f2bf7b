//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes are most likely
//! to originate from this code, intentionally.

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    time::Duration,
};

use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::scheduler::Settings;

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// A value that must be positive is zero.
    #[error("Configuration value `{0}` must be greater than zero")]
    Zero(&'static str),
    /// A name used in SQL is not a plain identifier.
    #[error("Configuration value `{field}` is not a valid identifier: {value:?}")]
    InvalidIdentifier {
        /// Offending field
        field: &'static str,
        /// Offending value
        value: String,
    },
    /// The counter namespace is empty.
    #[error("Counter store namespace must not be empty")]
    EmptyNamespace,
}

fn default_flush_interval_seconds() -> u64 {
    120
}

fn default_flush_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_shards() -> usize {
    16
}

fn default_namespace() -> String {
    "player_stats".to_string()
}

fn default_table() -> String {
    "entity_statistics".to_string()
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Seconds between periodic flushes of every dirty entity.
    #[serde(default = "default_flush_interval_seconds")]
    pub flush_interval_seconds: u64,
    /// Number of background flush workers.
    #[serde(default = "default_flush_workers")]
    pub flush_workers: usize,
    /// Bound on each worker's pending flush queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Log increments the counter store rejected and raise tally's own log
    /// level to debug.
    #[serde(default)]
    pub debug: bool,
    /// Where pending deltas are kept.
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub counter_store: CounterStore,
    /// Where durable totals are kept.
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub durable_store: DurableStore,
    /// The method by which to express telemetry
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub telemetry: Option<Telemetry>,
}

impl Config {
    /// Parse and validate a YAML configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML does not describe a configuration or if
    /// the configuration is invalid, see [`Config::validate`].
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the values serde cannot.
    ///
    /// # Errors
    ///
    /// Returns an error if an interval, worker count, capacity, shard count
    /// or connection limit is zero, if a SQL table name is not a plain
    /// identifier, or if the counter namespace is empty.
    pub fn validate(&self) -> Result<(), Error> {
        self.settings()?;
        match &self.counter_store {
            CounterStore::Memory(memory) => {
                memory.shard_count()?;
            }
            CounterStore::Sqlite(sqlite) => {
                if sqlite.namespace.is_empty() {
                    return Err(Error::EmptyNamespace);
                }
                sqlite.pool.validate()?;
            }
        }
        match &self.durable_store {
            DurableStore::Memory => {}
            DurableStore::Sqlite(sqlite) => {
                if !is_identifier(&sqlite.table) {
                    return Err(Error::InvalidIdentifier {
                        field: "durable_store.sqlite.table",
                        value: sqlite.table.clone(),
                    });
                }
                sqlite.pool.validate()?;
            }
        }
        Ok(())
    }

    /// Scheduling settings derived from this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Zero`] if the interval, worker count or queue capacity
    /// is zero.
    pub fn settings(&self) -> Result<Settings, Error> {
        if self.flush_interval_seconds == 0 {
            return Err(Error::Zero("flush_interval_seconds"));
        }
        Ok(Settings {
            flush_interval: Duration::from_secs(self.flush_interval_seconds),
            flush_workers: NonZeroUsize::new(self.flush_workers)
                .ok_or(Error::Zero("flush_workers"))?,
            queue_capacity: NonZeroUsize::new(self.queue_capacity)
                .ok_or(Error::Zero("queue_capacity"))?,
            debug: self.debug,
        })
    }
}

/// Counter store selection.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum CounterStore {
    /// Keep pending deltas in this process.
    Memory(MemoryCounterConfig),
    /// Keep pending deltas in a SQLite database that may be shared.
    Sqlite(SqliteCounterConfig),
}

impl Default for CounterStore {
    fn default() -> Self {
        CounterStore::Memory(MemoryCounterConfig::default())
    }
}

/// Configuration for [`crate::counter::memory::Memory`].
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MemoryCounterConfig {
    /// Number of independently locked shards.
    #[serde(default = "default_shards")]
    pub shards: usize,
}

impl Default for MemoryCounterConfig {
    fn default() -> Self {
        Self {
            shards: default_shards(),
        }
    }
}

impl MemoryCounterConfig {
    /// The shard count as a non-zero value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Zero`] if `shards` is zero.
    pub fn shard_count(self) -> Result<NonZeroUsize, Error> {
        NonZeroUsize::new(self.shards).ok_or(Error::Zero("counter_store.memory.shards"))
    }
}

/// Configuration for [`crate::counter::sqlite::Sqlite`].
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SqliteCounterConfig {
    /// Database file.
    pub path: PathBuf,
    /// Prefix of every pending key, `"{namespace}:{entity}"`.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Connection pool settings.
    #[serde(default)]
    pub pool: PoolConfig,
}

/// Durable store selection.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum DurableStore {
    /// Keep totals in this process. Totals do not survive a restart.
    Memory,
    /// Keep totals in a SQLite database.
    Sqlite(SqliteDurableConfig),
}

/// Configuration for [`crate::durable::sqlite::Sqlite`].
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SqliteDurableConfig {
    /// Database file.
    pub path: PathBuf,
    /// Table holding one record per entity.
    #[serde(default = "default_table")]
    pub table: String,
    /// Connection pool settings.
    #[serde(default)]
    pub pool: PoolConfig,
}

/// Connection pool settings shared by the SQLite stores.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Upper bound on concurrently open connections.
    pub max_connections: u32,
    /// How long work waits for a free connection before failing.
    pub wait_timeout_milliseconds: u64,
    /// How long SQLite retries a locked database before failing.
    pub busy_timeout_milliseconds: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            wait_timeout_milliseconds: 3_000,
            busy_timeout_milliseconds: 2_000,
        }
    }
}

impl PoolConfig {
    /// `max_connections` as a non-zero value, at least one.
    #[must_use]
    pub fn connection_limit(&self) -> NonZeroU32 {
        NonZeroU32::new(self.max_connections).unwrap_or(NonZeroU32::MIN)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.max_connections == 0 {
            return Err(Error::Zero("pool.max_connections"));
        }
        if self.wait_timeout_milliseconds == 0 {
            return Err(Error::Zero("pool.wait_timeout_milliseconds"));
        }
        Ok(())
    }
}

/// Defines the manner of tally's own telemetry.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum Telemetry {
    /// In prometheus mode tally will emit its internal telemetry for
    /// scraping at a prometheus poll endpoint.
    Prometheus {
        /// Address and port for prometheus exporter
        addr: SocketAddr,
        /// Additional labels to include in every metric
        #[serde(default)]
        global_labels: FxHashMap<String, String>,
    },
}

/// True for a non-empty ASCII identifier that does not start with a digit.
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}
