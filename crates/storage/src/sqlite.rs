//! SQLite record store
//!
//! One `members` row per record, its lifecycle state in `membership_status`.
//! Agreement scans live in `membership_agreement_scans`, referenced by
//! `agreement_scan_id`. A move is a single guarded `UPDATE`.
//!
//! Features:
//! - r2d2 connection pool, WAL journal
//! - Blocking calls run on `spawn_blocking`
//! - Archive retention through a `retention_until` column
//! - Name filter through the `name_has_prefix` SQL function
//! - Unsigned integers stored as their two's-complement `INTEGER` bits

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use membersys_core::config::RelationalConfig;
use membersys_core::{
    BoolField, KeyedAgreement, LongField, Member, MemberState, MembershipAgreement,
    MembershipMetadata, Result, SharedClock, StoreError, TextField,
};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior, params, params_from_iter};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::call::{StoreOptions, with_deadline, with_retry};
use crate::transition;
use crate::trait_::{EnumerateQuery, RecordStore, name_has_prefix};

/// Record columns of `members`, in bind order
const RECORD_COLUMNS: [&str; 25] = [
    "member_id",
    "name",
    "street",
    "city",
    "zipcode",
    "country",
    "email",
    "email_verified",
    "phone",
    "fee",
    "fee_yearly",
    "username",
    "pwhash",
    "has_key",
    "payments_caught_up_to",
    "request_timestamp",
    "request_source_ip",
    "user_agent",
    "verification_email",
    "approver_uid",
    "approval_timestamp",
    "comment",
    "goodbye_initiator",
    "goodbye_reason",
    "goodbye_timestamp",
];

/// SQLite-backed record store
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
    clock: SharedClock,
    options: StoreOptions,
    malformed: Arc<AtomicU64>,
}

impl fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn sql_error(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            StoreError::Unavailable(format!("database busy: {err}"))
        }
        rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::IntegralValueOutOfRange(..) => {
            StoreError::DataLoss(format!("stored record does not decode: {err}"))
        }
        _ => StoreError::Internal(format!("database error: {err}")),
    }
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_key(key: &str) -> Result<i64> {
    key.trim()
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| StoreError::InvalidArgument(format!("malformed record key: {key:?}")))
}

/// `u64` as the `INTEGER` with the same two's-complement bits
fn stored(value: u64) -> i64 {
    value as i64
}

/// Inverse of [`stored`]
fn loaded(raw: i64) -> u64 {
    raw as u64
}

fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

fn opt_text(value: &Option<String>) -> Value {
    value.as_deref().map_or(Value::Null, text)
}

fn opt_time(value: Option<DateTime<Utc>>) -> Value {
    value.map_or(Value::Null, |t| Value::Text(timestamp(t)))
}

fn opt_int(value: Option<u64>) -> Value {
    value.map_or(Value::Null, |v| Value::Integer(stored(v)))
}

/// Values of [`RECORD_COLUMNS`] for `record`
fn record_values(record: &MembershipAgreement) -> Vec<Value> {
    let m = &record.member;
    let meta = &record.metadata;
    vec![
        opt_int(m.id),
        text(&m.name),
        text(&m.street),
        text(&m.city),
        text(&m.zipcode),
        text(&m.country),
        text(&m.email),
        Value::Integer(i64::from(m.email_verified)),
        text(&m.phone),
        Value::Integer(stored(m.fee)),
        Value::Integer(i64::from(m.fee_yearly)),
        opt_text(&m.username),
        opt_text(&m.pwhash),
        Value::Integer(i64::from(m.has_key)),
        opt_int(m.payments_caught_up_to),
        opt_time(meta.request_timestamp),
        opt_text(&meta.request_source_ip),
        opt_text(&meta.user_agent),
        opt_text(&meta.verification_email),
        opt_text(&meta.approver_uid),
        opt_time(meta.approval_timestamp),
        opt_text(&meta.comment),
        opt_text(&meta.goodbye_initiator),
        opt_text(&meta.goodbye_reason),
        opt_time(meta.goodbye_timestamp),
    ]
}

fn time_column(row: &rusqlite::Row<'_>, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let Some(raw) = row.get::<_, Option<String>>(column)? else {
        return Ok(None);
    };
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| Some(t.with_timezone(&Utc)))
        .map_err(|e| {
            let index = row.as_ref().column_index(column).unwrap_or_default();
            rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e))
        })
}

fn unsigned_column(row: &rusqlite::Row<'_>, column: &str) -> rusqlite::Result<Option<u64>> {
    Ok(row.get::<_, Option<i64>>(column)?.map(loaded))
}

/// Record stored in `row`; the document only when the `data` column was selected
fn read_agreement(row: &rusqlite::Row<'_>, with_document: bool) -> rusqlite::Result<MembershipAgreement> {
    let member = Member {
        id: unsigned_column(row, "member_id")?,
        name: row.get("name")?,
        street: row.get("street")?,
        city: row.get("city")?,
        zipcode: row.get("zipcode")?,
        country: row.get("country")?,
        email: row.get("email")?,
        email_verified: row.get("email_verified")?,
        phone: row.get("phone")?,
        username: row.get("username")?,
        pwhash: row.get("pwhash")?,
        fee: unsigned_column(row, "fee")?.unwrap_or_default(),
        fee_yearly: row.get("fee_yearly")?,
        has_key: row.get("has_key")?,
        payments_caught_up_to: unsigned_column(row, "payments_caught_up_to")?,
    };
    let metadata = MembershipMetadata {
        request_timestamp: time_column(row, "request_timestamp")?,
        request_source_ip: row.get("request_source_ip")?,
        user_agent: row.get("user_agent")?,
        verification_email: row.get("verification_email")?,
        approver_uid: row.get("approver_uid")?,
        approval_timestamp: time_column(row, "approval_timestamp")?,
        comment: row.get("comment")?,
        goodbye_initiator: row.get("goodbye_initiator")?,
        goodbye_reason: row.get("goodbye_reason")?,
        goodbye_timestamp: time_column(row, "goodbye_timestamp")?,
    };

    let mut record = MembershipAgreement::new(member, metadata);
    if with_document {
        record.agreement_document = row
            .get::<_, Option<Vec<u8>>>("data")?
            .filter(|data| !data.is_empty());
    }
    Ok(record)
}

fn select_columns() -> String {
    let mut columns = vec!["m.id".to_string()];
    columns.extend(RECORD_COLUMNS.iter().map(|c| format!("m.{c}")));
    columns.join(", ")
}

/// Visible unless archived and past retention
const VISIBLE: &str = "(m.retention_until IS NULL OR m.retention_until > ?3)";

/// Register [`name_has_prefix`] as an SQL function
fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "name_has_prefix",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let name = ctx.get::<String>(0)?;
            let prefix = ctx.get::<String>(1)?;
            Ok(name_has_prefix(&name, &prefix))
        },
    )
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    let statuses: Vec<String> = MemberState::layouts()
        .iter()
        .map(|layout| format!("'{}'", layout.status))
        .collect();

    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS membership_agreement_scans (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            data BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS members (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            member_id INTEGER,
            name TEXT NOT NULL,
            street TEXT NOT NULL DEFAULT '',
            city TEXT NOT NULL DEFAULT '',
            zipcode TEXT NOT NULL DEFAULT '',
            country TEXT NOT NULL DEFAULT '',
            email TEXT NOT NULL DEFAULT '',
            email_verified INTEGER NOT NULL DEFAULT 0,
            phone TEXT NOT NULL DEFAULT '',
            fee INTEGER NOT NULL DEFAULT 0,
            fee_yearly INTEGER NOT NULL DEFAULT 0,
            username TEXT,
            pwhash TEXT,
            has_key INTEGER NOT NULL DEFAULT 0,
            payments_caught_up_to INTEGER,
            request_timestamp TEXT,
            request_source_ip TEXT,
            user_agent TEXT,
            verification_email TEXT,
            approver_uid TEXT,
            approval_timestamp TEXT,
            comment TEXT,
            goodbye_initiator TEXT,
            goodbye_reason TEXT,
            goodbye_timestamp TEXT,
            agreement_scan_id INTEGER REFERENCES membership_agreement_scans(id),
            membership_status TEXT NOT NULL DEFAULT 'APPLICATION'
                CHECK (membership_status IN ({statuses})),
            retention_until TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_members_status_id ON members(membership_status, id);
        CREATE INDEX IF NOT EXISTS idx_members_username ON members(username);
        "#,
        statuses = statuses.join(", ")
    ))
}

impl SqliteStore {
    /// Open (creating if needed) the database at `config.path`
    pub async fn open(config: &RelationalConfig, clock: SharedClock) -> Result<Self> {
        let path = config.path.clone();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StoreError::Unavailable(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        let manager = SqliteConnectionManager::file(&path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            register_functions(conn)
        });
        let pool_size = config.pool_size;
        let pool = tokio::task::spawn_blocking(move || {
            Pool::builder().max_size(pool_size).build(manager)
        })
        .await
        .map_err(|e| StoreError::Internal(format!("blocking task failed: {e}")))?
        .map_err(|e| StoreError::Unavailable(format!("cannot open {}: {e}", config.path.display())))?;

        let store = Self {
            pool,
            path,
            clock,
            options: StoreOptions {
                timeout: config.timeout(),
                retry: config.retry_policy(),
                ..StoreOptions::default()
            },
            malformed: Arc::new(AtomicU64::new(0)),
        };
        store.ensure_schema().await?;
        info!(path = %store.path.display(), "SQLite store opened");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` on a pooled connection off the async runtime
    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> Result<T> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        with_deadline(
            self.options.timeout,
            op,
            with_retry(&self.options.retry, op, || {
                let pool = self.pool.clone();
                let f = Arc::clone(&f);
                async move {
                    tokio::task::spawn_blocking(move || {
                        let mut conn = pool.get().map_err(|e| {
                            StoreError::Unavailable(format!("no database connection: {e}"))
                        })?;
                        f(&mut conn)
                    })
                    .await
                    .map_err(|e| StoreError::Internal(format!("blocking task failed: {e}")))?
                }
            }),
        )
        .await
    }

    /// Full record (with document) of `id` in `state`
    async fn read_record(&self, op: &'static str, id: i64, state: MemberState) -> Result<MembershipAgreement> {
        let now = timestamp(self.clock.now());
        let sql = format!(
            "SELECT {}, s.data FROM members m \
             LEFT JOIN membership_agreement_scans s ON s.id = m.agreement_scan_id \
             WHERE m.id = ?1 AND m.membership_status = ?2 AND {VISIBLE}",
            select_columns()
        );
        self.run(op, move |conn| {
            conn.query_row(&sql, params![id, state.status(), now], |row| {
                read_agreement(row, true)
            })
            .optional()
            .map_err(sql_error)?
            .ok_or_else(|| StoreError::NotFound(format!("no {state} record with key {id}")))
        })
        .await
    }

    /// Run `sql` (bound as `?1` = value, `?2` = id) against an active member
    async fn update_member(&self, op: &'static str, key: &str, sql: String, value: Value) -> Result<()> {
        let id = parse_key(key)?;
        let changed = self
            .run(op, move |conn| {
                conn.execute(&sql, params![value, id, MemberState::Member.status()])
                    .map_err(sql_error)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("no active member with key {id}")));
        }
        debug!(op, id, "updated member");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "relational"
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.run("ensure_schema", |conn| init_schema(conn).map_err(sql_error))
            .await?;
        debug!(path = %self.path.display(), "SQLite schema ready");
        Ok(())
    }

    async fn create(&self, record: &MembershipAgreement) -> Result<String> {
        let mut record = record.clone();
        if record.metadata.request_timestamp.is_none() {
            record.metadata.request_timestamp = Some(self.clock.now());
        }
        let values = record_values(&record);
        let document = record.agreement_document.take().filter(|d| !d.is_empty());
        let placeholders: Vec<String> = (1..=RECORD_COLUMNS.len() + 2).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO members ({}, agreement_scan_id, membership_status) VALUES ({})",
            RECORD_COLUMNS.join(", "),
            placeholders.join(", ")
        );

        let id = self
            .run("create", move |conn| {
                let tx = conn.transaction().map_err(sql_error)?;
                let scan_id = match &document {
                    Some(data) => {
                        tx.execute(
                            "INSERT INTO membership_agreement_scans (data) VALUES (?1)",
                            params![data],
                        )
                        .map_err(sql_error)?;
                        Value::Integer(tx.last_insert_rowid())
                    }
                    None => Value::Null,
                };
                let mut bound = values.clone();
                bound.push(scan_id);
                bound.push(text(MemberState::Application.status()));
                tx.execute(&sql, params_from_iter(bound.iter()))
                    .map_err(sql_error)?;
                let id = tx.last_insert_rowid();
                tx.commit().map_err(sql_error)?;
                Ok(id)
            })
            .await?;

        debug!(id, "created application");
        Ok(id.to_string())
    }

    async fn get(&self, key: &str, state: MemberState) -> Result<MembershipAgreement> {
        let id = parse_key(key)?;
        self.read_record("get", id, state).await
    }

    async fn get_by_username(&self, username: &str) -> Result<MembershipAgreement> {
        let username = username.to_string();
        let sql = format!(
            "SELECT {}, s.data FROM members m \
             LEFT JOIN membership_agreement_scans s ON s.id = m.agreement_scan_id \
             WHERE m.username = ?1 AND m.membership_status = ?2 ORDER BY m.id LIMIT 1",
            select_columns()
        );
        self.run("get_by_username", move |conn| {
            conn.query_row(&sql, params![username, MemberState::Member.status()], |row| {
                read_agreement(row, true)
            })
            .optional()
            .map_err(sql_error)?
            .ok_or_else(|| StoreError::NotFound(format!("no member with username {username:?}")))
        })
        .await
    }

    async fn enumerate(&self, query: &EnumerateQuery) -> Result<Vec<KeyedAgreement>> {
        let after = if query.start_cursor.is_empty() {
            0
        } else {
            parse_key(&query.start_cursor)?
        };
        let state = query.state;

        let mut sql = format!(
            "SELECT {} FROM members m WHERE m.id > ?1 AND m.membership_status = ?2 AND {VISIBLE}",
            select_columns()
        );
        let mut values = vec![
            Value::Integer(after),
            text(state.status()),
            Value::Text(timestamp(self.clock.now())),
        ];
        if let Some(criterion) = &query.criterion {
            sql.push_str(" AND name_has_prefix(m.name, ?4)");
            values.push(text(criterion));
        }
        sql.push_str(&format!(" ORDER BY m.id LIMIT ?{}", values.len() + 1));
        let limit = match query.limit_opt() {
            Some(n) => i64::try_from(n).unwrap_or(i64::MAX),
            None => -1,
        };
        values.push(Value::Integer(limit));

        let malformed = Arc::clone(&self.malformed);
        self.run("enumerate", move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(sql_error)?;
            let mut rows = stmt.query(params_from_iter(values.iter())).map_err(sql_error)?;
            let mut page = Vec::new();
            while let Some(row) = rows.next().map_err(sql_error)? {
                let id: i64 = row.get("id").map_err(sql_error)?;
                match read_agreement(row, false) {
                    Ok(record) => page.push(KeyedAgreement::new(id.to_string(), record)),
                    Err(err) => {
                        malformed.fetch_add(1, Ordering::Relaxed);
                        warn!(%state, id, error = %err, "skipping malformed record");
                    }
                }
            }
            Ok(page)
        })
        .await
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
        let id = parse_key(key)?;

        let mut record = self.read_record("move", id, from).await?;
        let now = self.clock.now();
        plan.apply(&mut record, initiator, reason, now)?;

        let meta = record.metadata;
        let values = vec![
            text(to.status()),
            opt_text(&meta.approver_uid),
            opt_time(meta.approval_timestamp),
            opt_text(&meta.goodbye_initiator),
            opt_text(&meta.goodbye_reason),
            opt_time(meta.goodbye_timestamp),
            opt_time(plan.retention_until(now)),
            Value::Integer(id),
            text(from.status()),
        ];
        let changed = self
            .run("move", move |conn| {
                conn.execute(
                    "UPDATE members SET membership_status = ?1, approver_uid = ?2, \
                     approval_timestamp = ?3, goodbye_initiator = ?4, goodbye_reason = ?5, \
                     goodbye_timestamp = ?6, retention_until = ?7 \
                     WHERE id = ?8 AND membership_status = ?9",
                    params_from_iter(values.iter()),
                )
                .map_err(sql_error)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!(
                "record {id} is no longer in state {from}"
            )));
        }

        info!(id, %from, %to, initiator, "moved record");
        Ok(())
    }

    async fn set_text_value(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let field: TextField = field.parse()?;
        let id = parse_key(key)?;
        let value = value.to_string();
        self.run("set_text_value", move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_error)?;
            let username: Option<String> = tx
                .query_row(
                    "SELECT username FROM members WHERE id = ?1 AND membership_status = ?2",
                    params![id, MemberState::Member.status()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_error)?
                .ok_or_else(|| StoreError::NotFound(format!("no active member with key {id}")))?;

            let mut member = Member {
                username,
                ..Default::default()
            };
            field.apply(&mut member, &value)?;

            tx.execute(
                &format!("UPDATE members SET {} = ?1 WHERE id = ?2", field.column()),
                params![value, id],
            )
            .map_err(sql_error)?;
            tx.commit().map_err(sql_error)
        })
        .await?;
        debug!(id, field = field.column(), "updated member");
        Ok(())
    }

    async fn set_bool_value(&self, key: &str, field: &str, value: bool) -> Result<()> {
        let field: BoolField = field.parse()?;
        let sql = format!(
            "UPDATE members SET {} = ?1 WHERE id = ?2 AND membership_status = ?3",
            field.column()
        );
        self.update_member("set_bool_value", key, sql, Value::Integer(i64::from(value)))
            .await
    }

    async fn set_long_value(&self, key: &str, field: &str, value: u64) -> Result<()> {
        let field: LongField = field.parse()?;
        let sql = format!(
            "UPDATE members SET {} = ?1 WHERE id = ?2 AND membership_status = ?3",
            field.column()
        );
        self.update_member("set_long_value", key, sql, Value::Integer(stored(value)))
            .await
    }

    async fn set_fee(&self, key: &str, fee: u64, yearly: bool) -> Result<()> {
        let id = parse_key(key)?;
        let fee = stored(fee);
        let changed = self
            .run("set_fee", move |conn| {
                conn.execute(
                    "UPDATE members SET fee = ?1, fee_yearly = ?2 \
                     WHERE id = ?3 AND membership_status = ?4",
                    params![fee, yearly, id, MemberState::Member.status()],
                )
                .map_err(sql_error)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("no active member with key {id}")));
        }
        Ok(())
    }

    async fn attach_document(&self, key: &str, document: &[u8]) -> Result<()> {
        if document.is_empty() {
            return Err(StoreError::InvalidArgument(
                "agreement document is empty".to_string(),
            ));
        }
        let id = parse_key(key)?;
        let document = document.to_vec();
        let bytes = document.len();
        self.run("attach_document", move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_error)?;
            let previous: Option<i64> = tx
                .query_row(
                    "SELECT agreement_scan_id FROM members WHERE id = ?1 AND membership_status = ?2",
                    params![id, MemberState::Application.status()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_error)?
                .ok_or_else(|| StoreError::NotFound(format!("no application with key {id}")))?;

            tx.execute(
                "INSERT INTO membership_agreement_scans (data) VALUES (?1)",
                params![document],
            )
            .map_err(sql_error)?;
            let scan_id = tx.last_insert_rowid();
            tx.execute(
                "UPDATE members SET agreement_scan_id = ?1 WHERE id = ?2",
                params![scan_id, id],
            )
            .map_err(sql_error)?;
            if let Some(previous) = previous {
                tx.execute(
                    "DELETE FROM membership_agreement_scans WHERE id = ?1",
                    params![previous],
                )
                .map_err(sql_error)?;
            }
            tx.commit().map_err(sql_error)
        })
        .await?;
        debug!(id, bytes, "attached agreement");
        Ok(())
    }

    async fn reclaim_expired(&self) -> Result<u64> {
        let now = timestamp(self.clock.now());
        let removed = self
            .run("reclaim_expired", move |conn| {
                let tx = conn.transaction().map_err(sql_error)?;
                let expired = "membership_status = ?1 AND retention_until IS NOT NULL AND retention_until <= ?2";
                let scans: Vec<i64> = {
                    let mut stmt = tx
                        .prepare(&format!(
                            "SELECT agreement_scan_id FROM members \
                             WHERE {expired} AND agreement_scan_id IS NOT NULL"
                        ))
                        .map_err(sql_error)?;
                    let ids = stmt
                        .query_map(params![MemberState::Archive.status(), now], |row| row.get(0))
                        .map_err(sql_error)?;
                    ids.collect::<rusqlite::Result<_>>().map_err(sql_error)?
                };
                let removed = tx
                    .execute(
                        &format!("DELETE FROM members WHERE {expired}"),
                        params![MemberState::Archive.status(), now],
                    )
                    .map_err(sql_error)?;
                for scan in scans {
                    tx.execute(
                        "DELETE FROM membership_agreement_scans WHERE id = ?1",
                        params![scan],
                    )
                    .map_err(sql_error)?;
                }
                tx.commit().map_err(sql_error)?;
                Ok(removed as u64)
            })
            .await?;
        if removed > 0 {
            info!(removed, "reclaimed expired archive entries");
        }
        Ok(removed)
    }

    fn malformed_records(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use membersys_core::config::RetryConfig;
    use membersys_core::{ErrorKind, ManualClock};

    async fn open(dir: &tempfile::TempDir) -> (Arc<ManualClock>, SqliteStore) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let config = RelationalConfig::new(dir.path().join("db").join("members.db"));
        let store = SqliteStore::open(&config, clock.clone()).await.unwrap();
        (clock, store)
    }

    fn application(name: &str) -> MembershipAgreement {
        MembershipAgreement::new(
            Member {
                name: name.to_string(),
                ..Default::default()
            },
            MembershipMetadata::default(),
        )
    }

    /// Store on a single connection that fails fast on a locked database
    async fn open_busy_sensitive(dir: &tempfile::TempDir, retry: RetryConfig) -> SqliteStore {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let mut config = RelationalConfig::new(dir.path().join("members.db"));
        config.pool_size = 1;
        config.busy_timeout_ms = 0;
        config.retry = Some(retry);
        SqliteStore::open(&config, clock).await.unwrap()
    }

    /// Second connection holding the write lock
    fn hold_write_lock(path: &Path) -> Connection {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        conn
    }

    #[test]
    fn test_busy_and_locked_are_transient() {
        for code in [rusqlite::ffi::SQLITE_BUSY, rusqlite::ffi::SQLITE_LOCKED] {
            let err = sql_error(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(code),
                None,
            ));
            assert_eq!(err.kind(), ErrorKind::Unavailable);
            assert!(err.is_transient());
        }
    }

    #[tokio::test]
    async fn test_locked_database_reports_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_busy_sensitive(&dir, RetryConfig::no_retry()).await;
        let lock = hold_write_lock(store.path());

        let err = store.create(&application("Ada")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);

        lock.execute_batch("COMMIT").unwrap();
        store.create(&application("Ada")).await.unwrap();
    }

    #[tokio::test]
    async fn test_locked_database_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_busy_sensitive(
            &dir,
            RetryConfig {
                max_attempts: 50,
                min_backoff_ms: 10,
                max_backoff_ms: 20,
            },
        )
        .await;
        let lock = hold_write_lock(store.path());
        let release = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            lock.execute_batch("COMMIT").unwrap();
        });

        let key = store.create(&application("Ada")).await.unwrap();
        release.join().unwrap();
        assert_eq!(store.get(&key, MemberState::Application).await.unwrap().member.name, "Ada");
    }

    #[test]
    fn test_timestamps_sort_as_text() {
        let earlier = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let later = earlier + chrono::Duration::nanoseconds(1);
        assert!(timestamp(earlier) < timestamp(later));
        assert_eq!(timestamp(earlier).len(), timestamp(later).len());
    }

    #[test]
    fn test_parse_key() {
        assert_eq!(parse_key("17").unwrap(), 17);
        for bad in ["", "0", "-3", "abc", "0123456789abcdef0123456789abcdef"] {
            assert_eq!(parse_key(bad).unwrap_err().kind(), ErrorKind::InvalidArgument);
        }
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (_, store) = open(&dir).await;
        let key = store.create(&application("Ada")).await.unwrap();
        drop(store);

        let (_, reopened) = open(&dir).await;
        reopened.ensure_schema().await.unwrap();
        assert_eq!(reopened.get(&key, MemberState::Application).await.unwrap().member.name, "Ada");
    }

    #[tokio::test]
    async fn test_replaced_scan_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let (_, store) = open(&dir).await;
        let key = store.create(&application("Ada")).await.unwrap();
        store.attach_document(&key, b"first").await.unwrap();
        store.attach_document(&key, b"second").await.unwrap();

        let scans: i64 = store
            .run("count", |conn| {
                conn.query_row("SELECT COUNT(*) FROM membership_agreement_scans", [], |r| r.get(0))
                    .map_err(sql_error)
            })
            .await
            .unwrap();
        assert_eq!(scans, 1);
        let record = store.get(&key, MemberState::Application).await.unwrap();
        assert_eq!(record.agreement_document.as_deref(), Some(&b"second"[..]));
    }

    #[tokio::test]
    async fn test_malformed_row_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (_, store) = open(&dir).await;
        let good = store.create(&application("Ada")).await.unwrap();
        let bad = store.create(&application("Bob")).await.unwrap();
        let bad_id = parse_key(&bad).unwrap();
        store
            .run("corrupt", move |conn| {
                conn.execute(
                    "UPDATE members SET request_timestamp = 'yesterday' WHERE id = ?1",
                    params![bad_id],
                )
                .map_err(sql_error)
            })
            .await
            .unwrap();

        let page = store
            .enumerate(&EnumerateQuery::new(MemberState::Application))
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].key, good);
        assert_eq!(store.malformed_records(), 1);
        assert_eq!(
            store.get(&bad, MemberState::Application).await.unwrap_err().kind(),
            ErrorKind::DataLoss
        );
    }

    #[tokio::test]
    async fn test_reclaim_removes_expired_archive_rows() {
        let dir = tempfile::tempdir().unwrap();
        let (clock, store) = open(&dir).await;
        let key = store.create(&application("Ada")).await.unwrap();
        store.attach_document(&key, b"%PDF").await.unwrap();
        store
            .move_record(&key, MemberState::Application, MemberState::Archive, "admin")
            .await
            .unwrap();

        assert_eq!(store.reclaim_expired().await.unwrap(), 0);
        clock.advance(chrono::Duration::days(181));
        assert_eq!(store.reclaim_expired().await.unwrap(), 1);
        assert_eq!(
            store.get(&key, MemberState::Archive).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_status_constraint_holds() {
        let dir = tempfile::tempdir().unwrap();
        let (_, store) = open(&dir).await;
        let key = store.create(&application("Ada")).await.unwrap();
        let id = parse_key(&key).unwrap();
        let err = store
            .run("bad status", move |conn| {
                conn.execute(
                    "UPDATE members SET membership_status = 'LIMBO' WHERE id = ?1",
                    params![id],
                )
                .map_err(sql_error)
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
