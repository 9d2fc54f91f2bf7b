//! Write-behind aggregation of per-entity counters.
//!
//! Producers record small integer increments against an entity, for instance
//! "player alice broke one block". Increments land in a fast counter store and
//! mark the entity dirty. Background flushes move the accumulated deltas into
//! a durable store with an additive upsert, so no write-through happens on the
//! hot path and nothing counted is lost or applied twice.
//!
//! The bits and pieces here support the tally binary found elsewhere in this
//! project. Embedders construct an [`Engine`], hand out [`Handle`] clones to
//! producers and call [`Engine::shutdown`] to drain before exit.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod counter;
pub mod dirty;
pub mod durable;
pub mod engine;
pub mod entity;
pub mod flush;
pub mod metric;
pub mod pool;
pub mod scheduler;

pub use engine::{Engine, Handle};
pub use entity::EntityId;
pub use metric::{Deltas, Metric};
