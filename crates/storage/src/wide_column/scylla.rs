//! Cassandra / ScyllaDB engine
//!
//! Every table keeps its rows in one partition (`bucket = 0`) clustered by
//! the row key, so a state's prefix range is a single ordered slice. The
//! username lookup goes through a secondary index.

use async_trait::async_trait;
use membersys_core::config::{Consistency, WideColumnConfig};
use membersys_core::{Result, StoreError};
use scylla::batch::{Batch as CqlBatch, BatchType};
use scylla::frame::response::result::CqlValue;
use scylla::query::Query;
use scylla::statement::Consistency as CqlConsistency;
use scylla::transport::errors::{DbError, QueryError};
use scylla::{QueryResult, Session, SessionBuilder};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

use super::engine::{Batch, ColumnValue, Mutation, Row, TableSchema, WideColumnEngine};
use super::key::KeyRange;

const BUCKET: i32 = 0;

/// Engine backed by a Cassandra-compatible cluster
pub struct ScyllaEngine {
    session: Session,
    keyspace: String,
    replication_factor: u32,
}

impl fmt::Debug for ScyllaEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScyllaEngine")
            .field("keyspace", &self.keyspace)
            .finish_non_exhaustive()
    }
}

fn cql_consistency(consistency: Consistency) -> CqlConsistency {
    match consistency {
        Consistency::One => CqlConsistency::One,
        Consistency::Quorum => CqlConsistency::Quorum,
    }
}

fn to_cql(value: &ColumnValue) -> CqlValue {
    match value {
        ColumnValue::Text(s) => CqlValue::Text(s.clone()),
        ColumnValue::Boolean(b) => CqlValue::Boolean(*b),
        ColumnValue::BigInt(n) => CqlValue::BigInt(*n),
        ColumnValue::Blob(b) => CqlValue::Blob(b.clone()),
    }
}

fn from_cql(value: CqlValue) -> Option<ColumnValue> {
    match value {
        CqlValue::Text(s) | CqlValue::Ascii(s) => Some(ColumnValue::Text(s)),
        CqlValue::Boolean(b) => Some(ColumnValue::Boolean(b)),
        CqlValue::BigInt(n) => Some(ColumnValue::BigInt(n)),
        CqlValue::Int(n) => Some(ColumnValue::BigInt(i64::from(n))),
        CqlValue::Blob(b) => Some(ColumnValue::Blob(b)),
        _ => None,
    }
}

fn map_query_error(op: &str, err: QueryError) -> StoreError {
    match err {
        QueryError::DbError(
            DbError::Unavailable { .. } | DbError::Overloaded | DbError::IsBootstrapping,
            msg,
        ) => StoreError::Unavailable(format!("{op}: {msg}")),
        QueryError::DbError(DbError::ReadTimeout { .. } | DbError::WriteTimeout { .. }, msg) => {
            StoreError::DeadlineExceeded(format!("{op}: {msg}"))
        }
        QueryError::RequestTimeout(msg) => StoreError::DeadlineExceeded(format!("{op}: {msg}")),
        QueryError::DbError(_, msg) => StoreError::Internal(format!("{op}: {msg}")),
        QueryError::BadQuery(e) => StoreError::Internal(format!("{op}: {e}")),
        other => StoreError::Unavailable(format!("{op}: {other}")),
    }
}

impl ScyllaEngine {
    /// Connect to the cluster named in `config`
    pub async fn connect(config: &WideColumnConfig) -> Result<Self> {
        let session = SessionBuilder::new()
            .known_nodes(&config.hosts)
            .connection_timeout(config.timeout())
            .build()
            .await
            .map_err(|e| StoreError::Unavailable(format!("cannot connect to {:?}: {e}", config.hosts)))?;

        info!(hosts = ?config.hosts, keyspace = %config.keyspace, "connected to wide-column cluster");
        Ok(Self {
            session,
            keyspace: config.keyspace.clone(),
            replication_factor: config.replication_factor,
        })
    }

    fn table(&self, table: &str) -> String {
        format!("{}.{}", self.keyspace, table)
    }

    fn select(&self, table: &str, columns: &[&'static str], filter: &str) -> String {
        let mut projection = vec!["key"];
        projection.extend_from_slice(columns);
        format!(
            "SELECT {} FROM {} WHERE {filter}",
            projection.join(", "),
            self.table(table)
        )
    }

    async fn run(
        &self,
        op: &str,
        text: String,
        values: Vec<CqlValue>,
        consistency: Consistency,
    ) -> Result<QueryResult> {
        let mut query = Query::new(text);
        query.set_consistency(cql_consistency(consistency));
        self.session
            .query_unpaged(query, values)
            .await
            .map_err(|e| map_query_error(op, e))
    }

    fn rows(result: QueryResult, columns: &[&'static str]) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        for row in result.rows.unwrap_or_default() {
            let mut cells = row.columns.into_iter();
            let key = match cells.next().flatten() {
                Some(CqlValue::Blob(key)) => key,
                other => {
                    return Err(StoreError::DataLoss(format!(
                        "row key is {other:?} instead of a blob"
                    )));
                }
            };
            let columns: BTreeMap<String, ColumnValue> = columns
                .iter()
                .zip(cells)
                .filter_map(|(name, cell)| Some((name.to_string(), from_cql(cell?)?)))
                .collect();
            rows.push(Row { key, columns });
        }
        Ok(rows)
    }

    fn insert_statement(
        &self,
        table: &str,
        columns: &[(&'static str, ColumnValue)],
        ttl: Option<std::time::Duration>,
    ) -> String {
        let names: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
        let placeholders = vec!["?"; columns.len() + 1].join(", ");
        let mut text = format!(
            "INSERT INTO {} (bucket, key, {}) VALUES ({BUCKET}, {placeholders})",
            self.table(table),
            names.join(", ")
        );
        if let Some(ttl) = ttl {
            text.push_str(&format!(" USING TTL {}", ttl.as_secs().max(1)));
        }
        text
    }
}

#[async_trait]
impl WideColumnEngine for ScyllaEngine {
    fn name(&self) -> &'static str {
        "cassandra"
    }

    async fn create_tables(&self, tables: &[TableSchema]) -> Result<()> {
        let keyspace = format!(
            "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = \
             {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
            self.keyspace, self.replication_factor
        );
        self.run("create_keyspace", keyspace, Vec::new(), Consistency::Quorum)
            .await?;

        for table in tables {
            let columns: Vec<String> = table
                .columns
                .iter()
                .map(|(name, ty)| format!("{name} {}", ty.cql()))
                .collect();
            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS {} (bucket int, key blob, {}, PRIMARY KEY (bucket, key))",
                self.table(table.name),
                columns.join(", ")
            );
            self.run("create_table", ddl, Vec::new(), Consistency::Quorum)
                .await?;

            for column in table.indexed {
                let ddl = format!(
                    "CREATE INDEX IF NOT EXISTS {}_{column}_idx ON {} ({column})",
                    table.name,
                    self.table(table.name)
                );
                self.run("create_index", ddl, Vec::new(), Consistency::Quorum)
                    .await?;
            }
            debug!(table = table.name, "table ready");
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
        let text = self.select(table, columns, &format!("bucket = {BUCKET} AND key = ?"));
        let result = self
            .run("get_row", text, vec![CqlValue::Blob(key.to_vec())], consistency)
            .await?;
        Ok(Self::rows(result, columns)?.into_iter().next())
    }

    async fn scan(
        &self,
        table: &'static str,
        range: &KeyRange,
        columns: &[&'static str],
        limit: Option<usize>,
        consistency: Consistency,
    ) -> Result<Vec<Row>> {
        let mut text = self.select(
            table,
            columns,
            &format!("bucket = {BUCKET} AND key > ? AND key < ?"),
        );
        if let Some(limit) = limit {
            text.push_str(&format!(" LIMIT {limit}"));
        }
        let values = vec![
            CqlValue::Blob(range.start_after.clone()),
            CqlValue::Blob(range.end_before.clone()),
        ];
        let result = self.run("scan", text, values, consistency).await?;
        Self::rows(result, columns)
    }

    async fn find_by_column(
        &self,
        table: &'static str,
        column: &'static str,
        value: &ColumnValue,
        columns: &[&'static str],
        consistency: Consistency,
    ) -> Result<Vec<Row>> {
        let text = self.select(table, columns, &format!("{column} = ?"));
        let result = self
            .run("find_by_column", text, vec![to_cql(value)], consistency)
            .await?;
        let mut rows = Self::rows(result, columns)?;
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(rows)
    }

    async fn apply_batch(&self, batch: &Batch) -> Result<()> {
        let mut cql = CqlBatch::new(BatchType::Logged);
        cql.set_consistency(CqlConsistency::Quorum);
        let mut values: Vec<Vec<CqlValue>> = Vec::with_capacity(batch.mutations.len());

        for mutation in &batch.mutations {
            match mutation {
                Mutation::Upsert {
                    table,
                    key,
                    columns,
                    ttl,
                } => {
                    let text = self.insert_statement(table, columns, *ttl);
                    let mut row = vec![CqlValue::Blob(key.clone())];
                    row.extend(columns.iter().map(|(_, value)| to_cql(value)));
                    cql.append_statement(Query::new(text));
                    values.push(row);
                }
                Mutation::Delete { table, key } => {
                    let text = format!(
                        "DELETE FROM {} WHERE bucket = {BUCKET} AND key = ?",
                        self.table(table)
                    );
                    cql.append_statement(Query::new(text));
                    values.push(vec![CqlValue::Blob(key.clone())]);
                }
            }
        }

        self.session
            .batch(&cql, values)
            .await
            .map(|_| ())
            .map_err(|e| map_query_error("apply_batch", e))
    }
}
