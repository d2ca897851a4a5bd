//! Wide-column engine abstraction
//!
//! The small set of primitives the wide-column backend needs from a physical
//! engine: point read, bounded range scan, secondary column lookup, atomic
//! batch, and schema creation. Every read names its consistency level;
//! batches are always logged and applied at quorum.

use async_trait::async_trait;
use membersys_core::Result;
use membersys_core::config::Consistency;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::key::KeyRange;

/// Storage type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Boolean,
    BigInt,
    Blob,
}

impl ColumnType {
    pub fn cql(self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Boolean => "boolean",
            ColumnType::BigInt => "bigint",
            ColumnType::Blob => "blob",
        }
    }
}

/// A cell value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
    Text(String),
    Boolean(bool),
    BigInt(i64),
    Blob(Vec<u8>),
}

impl ColumnValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ColumnValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ColumnValue::BigInt(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            ColumnValue::Blob(b) => Some(b),
            _ => None,
        }
    }
}

/// A row as returned by reads: its key and the requested columns present
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub key: Vec<u8>,
    pub columns: BTreeMap<String, ColumnValue>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.columns.get(column)
    }
}

/// One mutation inside a batch
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Write the given columns; other columns of the row are left alone
    Upsert {
        table: &'static str,
        key: Vec<u8>,
        columns: Vec<(&'static str, ColumnValue)>,
        /// Time to live of every written cell
        ttl: Option<Duration>,
    },
    /// Remove the whole row
    Delete { table: &'static str, key: Vec<u8> },
}

/// Mutations applied all-or-nothing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub mutations: Vec<Mutation>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(
        mut self,
        table: &'static str,
        key: Vec<u8>,
        columns: Vec<(&'static str, ColumnValue)>,
        ttl: Option<Duration>,
    ) -> Self {
        self.mutations.push(Mutation::Upsert {
            table,
            key,
            columns,
            ttl,
        });
        self
    }

    pub fn delete(mut self, table: &'static str, key: Vec<u8>) -> Self {
        self.mutations.push(Mutation::Delete { table, key });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

/// Table definition; every table is keyed by a blob row key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSchema {
    pub name: &'static str,
    pub columns: &'static [(&'static str, ColumnType)],
    /// Columns with a secondary index
    pub indexed: &'static [&'static str],
}

/// Physical wide-column engine
#[async_trait]
pub trait WideColumnEngine: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Create missing tables and indexes
    async fn create_tables(&self, tables: &[TableSchema]) -> Result<()>;

    async fn get_row(
        &self,
        table: &'static str,
        key: &[u8],
        columns: &[&'static str],
        consistency: Consistency,
    ) -> Result<Option<Row>>;

    /// Rows inside `range`, key-ascending, at most `limit` of them
    async fn scan(
        &self,
        table: &'static str,
        range: &KeyRange,
        columns: &[&'static str],
        limit: Option<usize>,
        consistency: Consistency,
    ) -> Result<Vec<Row>>;

    /// Rows whose indexed `column` equals `value`, key-ascending
    async fn find_by_column(
        &self,
        table: &'static str,
        column: &'static str,
        value: &ColumnValue,
        columns: &[&'static str],
        consistency: Consistency,
    ) -> Result<Vec<Row>>;

    /// Apply a logged batch at quorum
    async fn apply_batch(&self, batch: &Batch) -> Result<()>;

    /// Drop expired cells; engines with native TTL have nothing to do
    async fn purge_expired(&self) -> Result<u64> {
        Ok(0)
    }
}
