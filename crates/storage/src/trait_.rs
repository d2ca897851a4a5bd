//! Record store trait definition
//!
//! Abstract interface for the membership lifecycle store. Every backend
//! implements it with identical semantics; callers only ever hold a
//! [`SharedStore`].

use async_trait::async_trait;
use membersys_core::{KeyedAgreement, MemberState, MembershipAgreement, Result};
use std::sync::Arc;

/// Parameters of one enumeration page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumerateQuery {
    pub state: MemberState,
    /// Last key already seen; empty means start of state
    pub start_cursor: String,
    /// Maximum number of records; 0 means no limit
    pub page_size: usize,
    /// Case-insensitive name prefix
    pub criterion: Option<String>,
}

impl EnumerateQuery {
    pub fn new(state: MemberState) -> Self {
        Self {
            state,
            start_cursor: String::new(),
            page_size: 0,
            criterion: None,
        }
    }

    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        self.start_cursor = cursor.into();
        self
    }

    pub fn limit(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn name_prefix(mut self, criterion: impl Into<String>) -> Self {
        let criterion = criterion.into();
        self.criterion = (!criterion.is_empty()).then_some(criterion);
        self
    }

    pub fn limit_opt(&self) -> Option<usize> {
        (self.page_size > 0).then_some(self.page_size)
    }

    /// Whether `name` passes the criterion filter
    pub fn matches(&self, name: &str) -> bool {
        match &self.criterion {
            None => true,
            Some(prefix) => name_has_prefix(name, prefix),
        }
    }
}

/// Case-insensitive (Unicode lowercase) name prefix test shared by all backends
pub fn name_has_prefix(name: &str, prefix: &str) -> bool {
    name.to_lowercase().starts_with(&prefix.to_lowercase())
}

/// Storage trait for membership records
///
/// A page returned by [`RecordStore::enumerate`] is shorter than the
/// requested page size only when the state has no further matching records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Short backend name for logs
    fn backend_name(&self) -> &'static str;

    /// Create the tables/indexes the backend needs; idempotent
    async fn ensure_schema(&self) -> Result<()>;

    /// Store a new application and return its key
    async fn create(&self, record: &MembershipAgreement) -> Result<String>;

    async fn get(&self, key: &str, state: MemberState) -> Result<MembershipAgreement>;

    /// Look up an active member by username
    async fn get_by_username(&self, username: &str) -> Result<MembershipAgreement>;

    /// One page of records, key-ascending, documents omitted
    async fn enumerate(&self, query: &EnumerateQuery) -> Result<Vec<KeyedAgreement>>;

    /// Atomically move a record between lifecycle states
    async fn move_record(
        &self,
        key: &str,
        from: MemberState,
        to: MemberState,
        initiator: &str,
    ) -> Result<()> {
        self.move_record_with_reason(key, from, to, initiator, None)
            .await
    }

    /// As [`RecordStore::move_record`], recording `reason` on goodbye edges
    async fn move_record_with_reason(
        &self,
        key: &str,
        from: MemberState,
        to: MemberState,
        initiator: &str,
        reason: Option<&str>,
    ) -> Result<()>;

    async fn set_text_value(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn set_bool_value(&self, key: &str, field: &str, value: bool) -> Result<()>;

    async fn set_long_value(&self, key: &str, field: &str, value: u64) -> Result<()>;

    /// Update fee amount and yearly flag of an active member together
    async fn set_fee(&self, key: &str, fee: u64, yearly: bool) -> Result<()>;

    /// Attach or replace the signed agreement of an application
    async fn attach_document(&self, key: &str, document: &[u8]) -> Result<()>;

    /// Remove archived records past retention; returns how many were removed
    async fn reclaim_expired(&self) -> Result<u64>;

    /// Stored records skipped by listings because they failed to decode
    fn malformed_records(&self) -> u64;
}

/// Shared store reference
pub type SharedStore = Arc<dyn RecordStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_builder() {
        let query = EnumerateQuery::new(MemberState::Queue)
            .after("42")
            .limit(10)
            .name_prefix("ada");
        assert_eq!(query.start_cursor, "42");
        assert_eq!(query.limit_opt(), Some(10));
        assert_eq!(query.criterion.as_deref(), Some("ada"));
        assert_eq!(EnumerateQuery::new(MemberState::Queue).limit_opt(), None);
    }

    #[test]
    fn test_empty_criterion_means_no_filter() {
        let query = EnumerateQuery::new(MemberState::Application).name_prefix("");
        assert!(query.criterion.is_none());
        assert!(query.matches("anyone"));
    }

    #[test]
    fn test_criterion_is_case_insensitive_prefix() {
        let query = EnumerateQuery::new(MemberState::Application).name_prefix("ADA");
        assert!(query.matches("Ada Lovelace"));
        assert!(query.matches("adalbert"));
        assert!(!query.matches("Lovelace, Ada"));
    }
}
