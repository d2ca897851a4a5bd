//! Wide-column backend
//!
//! Records are rows keyed by `<state prefix><natural key>`, one table per
//! state. The backend is written against [`WideColumnEngine`]; the in-memory
//! engine is always available, the Cassandra/ScyllaDB engine behind the
//! `cassandra` feature.

pub mod columns;
pub mod engine;
pub mod key;
pub mod memory;
#[cfg(feature = "cassandra")]
pub mod scylla;
mod store;

pub use engine::{Batch, ColumnType, ColumnValue, Mutation, Row, TableSchema, WideColumnEngine};
pub use key::{KeyRange, NaturalKey, RowKey};
pub use memory::{BatchFault, MemoryEngine, ReadRecord};
#[cfg(feature = "cassandra")]
pub use scylla::ScyllaEngine;
pub use store::WideColumnStore;
