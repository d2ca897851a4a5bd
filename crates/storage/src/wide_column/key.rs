//! Prefix-encoded row keys
//!
//! A row key is the ASCII state prefix followed by the 16 raw bytes of the
//! record's natural key. Callers only ever see the natural key, as 32
//! lowercase hex digits.

use membersys_core::{MemberState, Result, StoreError};
use std::fmt;
use uuid::Uuid;

/// State-independent record identity; stable across moves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey(Uuid);

impl NaturalKey {
    /// Fresh time-ordered key
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    /// Parse a caller-supplied key (any textual UUID form)
    pub fn parse(text: &str) -> Result<Self> {
        Uuid::try_parse(text.trim())
            .map(Self)
            .map_err(|_| StoreError::InvalidArgument(format!("malformed record key: {text:?}")))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Full row key: state prefix plus natural key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowKey {
    pub state: MemberState,
    pub natural: NaturalKey,
}

impl RowKey {
    pub fn new(state: MemberState, natural: NaturalKey) -> Self {
        Self { state, natural }
    }

    pub fn encode(&self) -> Vec<u8> {
        let prefix = self.state.key_prefix().as_bytes();
        let mut key = Vec::with_capacity(prefix.len() + 16);
        key.extend_from_slice(prefix);
        key.extend_from_slice(self.natural.as_bytes());
        key
    }

    /// Decode a stored key, identifying its prefix from the bytes themselves
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let layout = MemberState::layouts()
            .iter()
            .find(|layout| raw.starts_with(layout.key_prefix.as_bytes()))
            .ok_or_else(|| {
                StoreError::DataLoss(format!(
                    "row key {:?} has no known state prefix",
                    String::from_utf8_lossy(raw)
                ))
            })?;

        let rest = &raw[layout.key_prefix.len()..];
        let bytes: [u8; 16] = rest.try_into().map_err(|_| {
            StoreError::DataLoss(format!(
                "row key under {:?} has a {}-byte natural key",
                layout.key_prefix,
                rest.len()
            ))
        })?;

        Ok(Self {
            state: layout.state,
            natural: NaturalKey(Uuid::from_bytes(bytes)),
        })
    }

    /// Decode a stored key that must belong to `expected`
    pub fn decode_in(raw: &[u8], expected: MemberState) -> Result<Self> {
        let key = Self::decode(raw)?;
        if key.state != expected {
            return Err(StoreError::DataLoss(format!(
                "row key with {} prefix found among {expected} rows",
                key.state
            )));
        }
        Ok(key)
    }
}

/// Exclusive key bounds of a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start_after: Vec<u8>,
    pub end_before: Vec<u8>,
}

impl KeyRange {
    /// All keys of `state` sorting after `after`, or from the start of the prefix
    pub fn within_state(state: MemberState, after: Option<NaturalKey>) -> Self {
        let prefix = state.key_prefix().as_bytes();
        let start_after = match after {
            Some(natural) => RowKey::new(state, natural).encode(),
            None => prefix.to_vec(),
        };
        Self {
            start_after,
            end_before: prefix_end(prefix),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key > self.start_after.as_slice() && key < self.end_before.as_slice()
    }
}

/// First key sorting after every key that starts with `prefix`
fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return end;
        }
    }
    vec![u8::MAX; prefix.len() + 1]
}
