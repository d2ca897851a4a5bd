//! Record store over a wide-column engine
//!
//! Each state lives in its own table under its own key prefix. A move is a
//! single logged batch deleting the source row and inserting the destination
//! row, with the archive TTL set on the insert.

use async_trait::async_trait;
use membersys_core::config::Consistency;
use membersys_core::{
    BoolField, KeyedAgreement, LongField, MemberState, MembershipAgreement, Result, SharedClock,
    StoreError, TextField,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use super::columns;
use super::engine::{Batch, ColumnValue, Row, WideColumnEngine};
use super::key::{KeyRange, NaturalKey, RowKey};
use crate::call::{StoreOptions, with_deadline, with_retry};
use crate::transition;
use crate::trait_::{EnumerateQuery, RecordStore};

/// Rows fetched per engine call when a name filter thins out pages
const FILTERED_SCAN_CHUNK: usize = 100;

/// Wide-column record store
#[derive(Debug)]
pub struct WideColumnStore<E: WideColumnEngine> {
    engine: Arc<E>,
    clock: SharedClock,
    options: StoreOptions,
    malformed: AtomicU64,
}

impl<E: WideColumnEngine> WideColumnStore<E> {
    pub fn new(engine: Arc<E>, clock: SharedClock, options: StoreOptions) -> Self {
        Self {
            engine,
            clock,
            options,
            malformed: AtomicU64::new(0),
        }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    async fn commit(&self, op: &str, batch: Batch) -> Result<()> {
        with_deadline(
            self.options.timeout,
            op,
            with_retry(&self.options.retry, op, || self.engine.apply_batch(&batch)),
        )
        .await
    }

    async fn read_row(&self, op: &str, key: &RowKey, columns: &[&'static str]) -> Result<Option<Row>> {
        let table = key.state.table();
        let raw = key.encode();
        with_deadline(
            self.options.timeout,
            op,
            with_retry(&self.options.retry, op, || {
                self.engine.get_row(table, &raw, columns, Consistency::Quorum)
            }),
        )
        .await
    }

    /// Quorum read of the full record stored at `key`
    async fn read_record(&self, op: &str, key: &RowKey) -> Result<MembershipAgreement> {
        let row = self
            .read_row(op, key, columns::record_columns(key.state))
            .await?
            .ok_or_else(|| {
                StoreError::NotFound(format!("no {} record with key {}", key.state, key.natural))
            })?;
        columns::decode(&row)
    }

    /// Rewrite the full row of `record` at `key`
    async fn write_record(&self, op: &str, key: &RowKey, record: &MembershipAgreement) -> Result<()> {
        let batch = Batch::new().upsert(
            key.state.table(),
            key.encode(),
            columns::encode(key.state, record)?,
            None,
        );
        self.commit(op, batch).await
    }

    /// Read-modify-write of an active member's record
    async fn update_member<F>(&self, op: &str, key: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut MembershipAgreement) -> Result<()> + Send,
    {
        let row_key = RowKey::new(MemberState::Member, NaturalKey::parse(key)?);
        let mut record = self.read_record(op, &row_key).await?;
        update(&mut record)?;
        self.write_record(op, &row_key, &record).await?;
        debug!(op, key, "updated member");
        Ok(())
    }

    fn skip_malformed(&self, state: MemberState, raw_key: &[u8], err: &StoreError) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
        warn!(
            %state,
            key = %String::from_utf8_lossy(raw_key),
            error = %err,
            "skipping malformed record"
        );
    }

    /// Keyed listing entry, or `None` when the row does not decode
    fn listing_entry(&self, state: MemberState, row: &Row) -> Option<KeyedAgreement> {
        let decoded = RowKey::decode_in(&row.key, state)
            .and_then(|key| columns::decode(row).map(|record| (key, record)));
        match decoded {
            Ok((key, record)) => Some(KeyedAgreement::new(
                key.natural.to_string(),
                record.without_document(),
            )),
            Err(err) => {
                self.skip_malformed(state, &row.key, &err);
                None
            }
        }
    }
}

#[async_trait]
impl<E: WideColumnEngine + 'static> RecordStore for WideColumnStore<E> {
    fn backend_name(&self) -> &'static str {
        "wide_column"
    }

    async fn ensure_schema(&self) -> Result<()> {
        let tables = columns::all_tables();
        with_deadline(
            self.options.timeout,
            "ensure_schema",
            self.engine.create_tables(&tables),
        )
        .await?;
        info!(engine = self.engine.name(), tables = tables.len(), "wide-column schema ready");
        Ok(())
    }

    async fn create(&self, record: &MembershipAgreement) -> Result<String> {
        let mut record = record.clone();
        if record.metadata.request_timestamp.is_none() {
            record.metadata.request_timestamp = Some(self.clock.now());
        }

        let key = RowKey::new(MemberState::Application, NaturalKey::generate());
        self.write_record("create", &key, &record).await?;
        debug!(key = %key.natural, "created application");
        Ok(key.natural.to_string())
    }

    async fn get(&self, key: &str, state: MemberState) -> Result<MembershipAgreement> {
        let key = RowKey::new(state, NaturalKey::parse(key)?);
        self.read_record("get", &key).await
    }

    async fn get_by_username(&self, username: &str) -> Result<MembershipAgreement> {
        let value = ColumnValue::Text(username.to_string());
        let rows = with_deadline(
            self.options.timeout,
            "get_by_username",
            with_retry(&self.options.retry, "get_by_username", || {
                self.engine.find_by_column(
                    MemberState::Member.table(),
                    columns::USERNAME,
                    &value,
                    columns::record_columns(MemberState::Member),
                    Consistency::Quorum,
                )
            }),
        )
        .await?;

        let row = rows
            .into_iter()
            .find(|row| RowKey::decode_in(&row.key, MemberState::Member).is_ok())
            .ok_or_else(|| StoreError::NotFound(format!("no member with username {username:?}")))?;
        columns::decode(&row)
    }

    async fn enumerate(&self, query: &EnumerateQuery) -> Result<Vec<KeyedAgreement>> {
        let state = query.state;
        let after = if query.start_cursor.is_empty() {
            None
        } else {
            Some(NaturalKey::parse(&query.start_cursor)?)
        };
        let mut range = KeyRange::within_state(state, after);
        let limit = query.limit_opt();
        let chunk = match (&query.criterion, limit) {
            (None, limit) => limit,
            (Some(_), Some(n)) => Some(n.max(FILTERED_SCAN_CHUNK)),
            (Some(_), None) => None,
        };
        let consistency = self.options.listing_consistency;
        let wanted = columns::listing_columns(state);

        let mut page = Vec::new();
        loop {
            let rows = with_deadline(
                self.options.timeout,
                "enumerate",
                with_retry(&self.options.retry, "enumerate", || {
                    self.engine.scan(state.table(), &range, wanted, chunk, consistency)
                }),
            )
            .await?;
            let exhausted = chunk.is_none_or(|n| rows.len() < n);

            for row in &rows {
                if let Some(entry) = self.listing_entry(state, row) {
                    if query.matches(entry.name()) {
                        page.push(entry);
                        if limit.is_some_and(|n| page.len() >= n) {
                            return Ok(page);
                        }
                    }
                }
            }

            match rows.last() {
                Some(last) if !exhausted => range.start_after = last.key.clone(),
                _ => return Ok(page),
            }
        }
    }

    async fn move_record_with_reason(
        &self,
        key: &str,
        from: MemberState,
        to: MemberState,
        initiator: &str,
        reason: Option<&str>,
    ) -> Result<()> {
        let plan = transition::plan(from, to)?;
        let natural = NaturalKey::parse(key)?;
        let source = RowKey::new(from, natural);
        let destination = RowKey::new(to, natural);

        let mut record = self.read_record("move", &source).await?;
        let now = self.clock.now();
        plan.apply(&mut record, initiator, reason, now)?;

        let batch = Batch::new()
            .delete(from.table(), source.encode())
            .upsert(
                to.table(),
                destination.encode(),
                columns::encode(to, &record)?,
                plan.retention,
            );
        self.commit("move", batch).await?;

        info!(key = %natural, %from, %to, initiator, "moved record");
        Ok(())
    }

    async fn set_text_value(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let field: TextField = field.parse()?;
        self.update_member("set_text_value", key, |record| {
            field.apply(&mut record.member, value)
        })
        .await
    }

    async fn set_bool_value(&self, key: &str, field: &str, value: bool) -> Result<()> {
        let field: BoolField = field.parse()?;
        self.update_member("set_bool_value", key, |record| {
            field.apply(&mut record.member, value);
            Ok(())
        })
        .await
    }

    async fn set_long_value(&self, key: &str, field: &str, value: u64) -> Result<()> {
        let field: LongField = field.parse()?;
        self.update_member("set_long_value", key, |record| {
            field.apply(&mut record.member, value);
            Ok(())
        })
        .await
    }

    async fn set_fee(&self, key: &str, fee: u64, yearly: bool) -> Result<()> {
        self.update_member("set_fee", key, |record| {
            record.member.fee = fee;
            record.member.fee_yearly = yearly;
            Ok(())
        })
        .await
    }

    async fn attach_document(&self, key: &str, document: &[u8]) -> Result<()> {
        if document.is_empty() {
            return Err(StoreError::InvalidArgument(
                "agreement document is empty".to_string(),
            ));
        }
        let row_key = RowKey::new(MemberState::Application, NaturalKey::parse(key)?);
        let mut record = self.read_record("attach_document", &row_key).await?;
        record.agreement_document = Some(document.to_vec());
        self.write_record("attach_document", &row_key, &record).await?;
        debug!(key, bytes = document.len(), "attached agreement");
        Ok(())
    }

    async fn reclaim_expired(&self) -> Result<u64> {
        let removed = with_deadline(
            self.options.timeout,
            "reclaim_expired",
            self.engine.purge_expired(),
        )
        .await?;
        if removed > 0 {
            info!(removed, "reclaimed expired rows");
        }
        Ok(removed)
    }

    fn malformed_records(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}
