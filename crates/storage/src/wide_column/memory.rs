//! In-memory wide-column engine
//!
//! Process-local tables of ordered rows. Cell TTLs are evaluated against the
//! injected clock, so expiry can be driven from tests. Faults can be
//! injected into batches to exercise failure paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use membersys_core::config::Consistency;
use membersys_core::{Result, SharedClock, StoreError};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Mutex;

use super::engine::{Batch, ColumnValue, Mutation, Row, TableSchema, WideColumnEngine};
use super::key::KeyRange;

#[derive(Debug, Clone)]
struct Cell {
    value: ColumnValue,
    expires_at: Option<DateTime<Utc>>,
}

impl Cell {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

type Table = BTreeMap<Vec<u8>, BTreeMap<String, Cell>>;

/// Fault applied to upcoming batches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchFault {
    /// Reject the batch before applying anything (`Unavailable`)
    Reject,
    /// Apply the batch, then report a timeout (`DeadlineExceeded`)
    TimeoutAfterCommit,
}

/// A read as seen by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRecord {
    pub table: &'static str,
    pub consistency: Consistency,
}

#[derive(Debug, Default)]
struct Faults {
    pending: Vec<BatchFault>,
}

/// In-memory wide-column engine
#[derive(Debug)]
pub struct MemoryEngine {
    tables: Mutex<HashMap<&'static str, Table>>,
    clock: SharedClock,
    faults: Mutex<Faults>,
    reads: Mutex<Vec<ReadRecord>>,
}

impl MemoryEngine {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            clock,
            faults: Mutex::new(Faults::default()),
            reads: Mutex::new(Vec::new()),
        }
    }

    /// Queue a fault for the next batch; faults fire in the order queued
    pub fn inject_batch_fault(&self, fault: BatchFault) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.pending.push(fault);
        }
    }

    /// Reads served so far
    pub fn read_log(&self) -> Vec<ReadRecord> {
        self.reads.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Overwrite one cell of an existing or new row, bypassing the batch path
    pub fn put_raw(&self, table: &'static str, key: Vec<u8>, column: &str, value: ColumnValue) -> Result<()> {
        let mut tables = self.lock_tables()?;
        tables
            .entry(table)
            .or_default()
            .entry(key)
            .or_default()
            .insert(
                column.to_string(),
                Cell {
                    value,
                    expires_at: None,
                },
            );
        Ok(())
    }

    fn lock_tables(&self) -> Result<std::sync::MutexGuard<'_, HashMap<&'static str, Table>>> {
        self.tables
            .lock()
            .map_err(|e| StoreError::Internal(format!("memory engine lock poisoned: {e}")))
    }

    fn record_read(&self, table: &'static str, consistency: Consistency) {
        if let Ok(mut reads) = self.reads.lock() {
            reads.push(ReadRecord { table, consistency });
        }
    }

    fn next_fault(&self) -> Option<BatchFault> {
        let mut faults = self.faults.lock().ok()?;
        if faults.pending.is_empty() {
            None
        } else {
            Some(faults.pending.remove(0))
        }
    }

    fn project(key: &[u8], cells: &BTreeMap<String, Cell>, columns: &[&'static str], now: DateTime<Utc>) -> Option<Row> {
        if !cells.values().any(|cell| cell.is_live(now)) {
            return None;
        }
        let columns = columns
            .iter()
            .filter_map(|name| {
                let cell = cells.get(*name)?;
                cell.is_live(now)
                    .then(|| (name.to_string(), cell.value.clone()))
            })
            .collect();
        Some(Row {
            key: key.to_vec(),
            columns,
        })
    }
}

#[async_trait]
impl WideColumnEngine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create_tables(&self, tables: &[TableSchema]) -> Result<()> {
        let mut existing = self.lock_tables()?;
        for table in tables {
            existing.entry(table.name).or_default();
        }
        Ok(())
    }

    async fn get_row(
        &self,
        table: &'static str,
        key: &[u8],
        columns: &[&'static str],
        consistency: Consistency,
    ) -> Result<Option<Row>> {
        self.record_read(table, consistency);
        let now = self.clock.now();
        let tables = self.lock_tables()?;
        Ok(tables
            .get(table)
            .and_then(|rows| rows.get(key))
            .and_then(|cells| Self::project(key, cells, columns, now)))
    }

    async fn scan(
        &self,
        table: &'static str,
        range: &KeyRange,
        columns: &[&'static str],
        limit: Option<usize>,
        consistency: Consistency,
    ) -> Result<Vec<Row>> {
        self.record_read(table, consistency);
        let now = self.clock.now();
        let tables = self.lock_tables()?;
        let Some(rows) = tables.get(table) else {
            return Ok(Vec::new());
        };

        let bounds = (
            Bound::Excluded(range.start_after.clone()),
            Bound::Excluded(range.end_before.clone()),
        );
        if range.start_after >= range.end_before {
            return Ok(Vec::new());
        }
        Ok(rows
            .range(bounds)
            .filter_map(|(key, cells)| Self::project(key, cells, columns, now))
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn find_by_column(
        &self,
        table: &'static str,
        column: &'static str,
        value: &ColumnValue,
        columns: &[&'static str],
        consistency: Consistency,
    ) -> Result<Vec<Row>> {
        self.record_read(table, consistency);
        let now = self.clock.now();
        let tables = self.lock_tables()?;
        let Some(rows) = tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .filter(|(_, cells)| {
                cells
                    .get(column)
                    .is_some_and(|cell| cell.is_live(now) && &cell.value == value)
            })
            .filter_map(|(key, cells)| Self::project(key, cells, columns, now))
            .collect())
    }

    async fn apply_batch(&self, batch: &Batch) -> Result<()> {
        let fault = self.next_fault();
        if fault == Some(BatchFault::Reject) {
            return Err(StoreError::Unavailable(
                "not enough replicas available for quorum".to_string(),
            ));
        }

        let now = self.clock.now();
        {
            let mut tables = self.lock_tables()?;
            for mutation in &batch.mutations {
                match mutation {
                    Mutation::Upsert {
                        table,
                        key,
                        columns,
                        ttl,
                    } => {
                        let expires_at = (*ttl)
                            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
                            .and_then(|ttl| now.checked_add_signed(ttl));
                        let row = tables.entry(*table).or_default().entry(key.clone()).or_default();
                        for (name, value) in columns {
                            row.insert(
                                name.to_string(),
                                Cell {
                                    value: value.clone(),
                                    expires_at,
                                },
                            );
                        }
                    }
                    Mutation::Delete { table, key } => {
                        if let Some(rows) = tables.get_mut(table) {
                            rows.remove(key);
                        }
                    }
                }
            }
        }

        if fault == Some(BatchFault::TimeoutAfterCommit) {
            return Err(StoreError::DeadlineExceeded(
                "write timed out waiting for replica acknowledgement".to_string(),
            ));
        }
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = self.clock.now();
        let mut tables = self.lock_tables()?;
        let mut removed = 0;
        for rows in tables.values_mut() {
            rows.retain(|_, cells| {
                cells.retain(|_, cell| cell.is_live(now));
                let keep = !cells.is_empty();
                if !keep {
                    removed += 1;
                }
                keep
            });
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use membersys_core::{ErrorKind, ManualClock, MemberState};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::wide_column::key::{NaturalKey, RowKey};

    fn engine() -> (Arc<ManualClock>, MemoryEngine) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let engine = MemoryEngine::new(clock.clone());
        (clock, engine)
    }

    fn key(state: MemberState) -> Vec<u8> {
        RowKey::new(state, NaturalKey::generate()).encode()
    }

    fn name(value: &str) -> Vec<(&'static str, ColumnValue)> {
        vec![("name", ColumnValue::Text(value.to_string()))]
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let (_, engine) = engine();
        let k = key(MemberState::Application);
        engine
            .apply_batch(&Batch::new().upsert("application", k.clone(), name("Ada"), None))
            .await
            .unwrap();

        let row = engine
            .get_row("application", &k, &["name", "missing"], Consistency::Quorum)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.get("name"), Some(&ColumnValue::Text("Ada".to_string())));
        assert_eq!(row.columns.len(), 1);
        assert_eq!(
            engine.read_log(),
            vec![ReadRecord {
                table: "application",
                consistency: Consistency::Quorum,
            }]
        );
    }

    #[tokio::test]
    async fn test_scan_is_ordered_and_bounded() {
        let (_, engine) = engine();
        let mut batch = Batch::new();
        let mut keys = Vec::new();
        for i in 0..5 {
            let k = key(MemberState::Queue);
            keys.push(k.clone());
            batch = batch.upsert("membership_queue", k, name(&format!("n{i}")), None);
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        batch = batch.upsert("membership_queue", key(MemberState::Member), name("stray"), None);
        engine.apply_batch(&batch).await.unwrap();

        let range = KeyRange::within_state(MemberState::Queue, None);
        let rows = engine
            .scan("membership_queue", &range, &["name"], Some(3), Consistency::One)
            .await
            .unwrap();
        let got: Vec<_> = rows.iter().map(|r| r.key.clone()).collect();
        assert_eq!(got, keys[..3].to_vec());

        let all = engine
            .scan("membership_queue", &range, &["name"], None, Consistency::One)
            .await
            .unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn test_ttl_expires_with_clock() {
        let (clock, engine) = engine();
        let k = key(MemberState::Archive);
        engine
            .apply_batch(&Batch::new().upsert(
                "membership_archive",
                k.clone(),
                name("gone"),
                Some(Duration::from_secs(60)),
            ))
            .await
            .unwrap();

        clock.advance(chrono::Duration::seconds(59));
        assert!(engine.get_row("membership_archive", &k, &["name"], Consistency::One).await.unwrap().is_some());

        clock.advance(chrono::Duration::seconds(2));
        assert!(engine.get_row("membership_archive", &k, &["name"], Consistency::One).await.unwrap().is_none());
        assert_eq!(engine.purge_expired().await.unwrap(), 1);
        assert_eq!(engine.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rejected_batch_applies_nothing() {
        let (_, engine) = engine();
        let k = key(MemberState::Application);
        engine.inject_batch_fault(BatchFault::Reject);
        let err = engine
            .apply_batch(&Batch::new().upsert("application", k.clone(), name("Ada"), None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(engine.get_row("application", &k, &["name"], Consistency::One).await.unwrap().is_none());

        engine
            .apply_batch(&Batch::new().upsert("application", k.clone(), name("Ada"), None))
            .await
            .unwrap();
        assert!(engine.get_row("application", &k, &["name"], Consistency::One).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_find_by_column() {
        let (_, engine) = engine();
        let k = key(MemberState::Member);
        engine
            .apply_batch(&Batch::new().upsert(
                "members",
                k.clone(),
                vec![("username", ColumnValue::Text("ada".to_string()))],
                None,
            ))
            .await
            .unwrap();

        let found = engine
            .find_by_column("members", "username", &ColumnValue::Text("ada".to_string()), &["username"], Consistency::Quorum)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, k);

        let none = engine
            .find_by_column("members", "username", &ColumnValue::Text("bob".to_string()), &["username"], Consistency::Quorum)
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
