//! Table layouts and record <-> row conversion
//!
//! `pb_data` always carries the full serialized record. Application and
//! member rows additionally carry a few plain columns for listings and for
//! the username index. In application rows the agreement document lives in
//! its own `application_pdf` column instead of inside `pb_data`.

use membersys_core::{Member, MemberState, MembershipAgreement, Result, StoreError};

use super::engine::{ColumnType, ColumnValue, Row, TableSchema};

pub const PB_DATA: &str = "pb_data";
pub const APPLICATION_PDF: &str = "application_pdf";
pub const USERNAME: &str = "username";

use ColumnType::{BigInt, Blob, Boolean, Text};

static APPLICATION_LAYOUT: &[(&str, ColumnType)] = &[
    ("name", Text),
    ("street", Text),
    ("city", Text),
    ("zipcode", Text),
    ("country", Text),
    ("email", Text),
    ("email_verified", Boolean),
    ("phone", Text),
    ("fee", BigInt),
    ("username", Text),
    ("pwhash", Text),
    ("fee_yearly", Boolean),
    ("sourceip", Text),
    ("useragent", Text),
    (PB_DATA, Blob),
    (APPLICATION_PDF, Blob),
];

static MEMBER_LAYOUT: &[(&str, ColumnType)] = &[
    ("name", Text),
    ("street", Text),
    ("city", Text),
    ("country", Text),
    ("email", Text),
    ("phone", Text),
    ("username", Text),
    ("fee", BigInt),
    ("fee_yearly", Boolean),
    ("has_key", Boolean),
    ("payments_caught_up_to", BigInt),
    (PB_DATA, Blob),
];

static RECORD_ONLY_LAYOUT: &[(&str, ColumnType)] = &[(PB_DATA, Blob)];

static APPLICATION_LISTING: &[&str] = &["name", "street", "city", "fee", "fee_yearly", PB_DATA];

static MEMBER_LISTING: &[&str] = &[
    "name",
    "street",
    "city",
    "country",
    "email",
    "phone",
    "username",
    "fee",
    "fee_yearly",
    "has_key",
    "payments_caught_up_to",
    PB_DATA,
];

static RECORD_ONLY_LISTING: &[&str] = &[PB_DATA];

static APPLICATION_RECORD: &[&str] = &[PB_DATA, APPLICATION_PDF];

pub fn schema(state: MemberState) -> TableSchema {
    let (columns, indexed): (_, &'static [&'static str]) = match state {
        MemberState::Application => (APPLICATION_LAYOUT, &[]),
        MemberState::Member => (MEMBER_LAYOUT, &[USERNAME]),
        _ => (RECORD_ONLY_LAYOUT, &[]),
    };
    TableSchema {
        name: state.table(),
        columns,
        indexed,
    }
}

/// Every table the backend uses
pub fn all_tables() -> Vec<TableSchema> {
    MemberState::ALL.into_iter().map(schema).collect()
}

/// Columns fetched by listings
pub fn listing_columns(state: MemberState) -> &'static [&'static str] {
    match state {
        MemberState::Application => APPLICATION_LISTING,
        MemberState::Member => MEMBER_LISTING,
        _ => RECORD_ONLY_LISTING,
    }
}

/// Columns fetched by point reads; includes the document
pub fn record_columns(state: MemberState) -> &'static [&'static str] {
    match state {
        MemberState::Application => APPLICATION_RECORD,
        _ => RECORD_ONLY_LISTING,
    }
}

fn text(value: &str) -> ColumnValue {
    ColumnValue::Text(value.to_string())
}

/// `u64` as the `bigint` with the same two's-complement bits
fn bigint(value: u64) -> ColumnValue {
    ColumnValue::BigInt(value as i64)
}

fn serialize(record: &MembershipAgreement) -> Result<ColumnValue> {
    serde_json::to_vec(record)
        .map(ColumnValue::Blob)
        .map_err(|e| StoreError::Internal(format!("cannot serialize record: {e}")))
}

/// Full column set for `record` stored in `state`
pub fn encode(state: MemberState, record: &MembershipAgreement) -> Result<Vec<(&'static str, ColumnValue)>> {
    let m = &record.member;
    let mut columns = Vec::new();

    match state {
        MemberState::Application => {
            columns.extend([
                ("name", text(&m.name)),
                ("street", text(&m.street)),
                ("city", text(&m.city)),
                ("zipcode", text(&m.zipcode)),
                ("country", text(&m.country)),
                ("email", text(&m.email)),
                ("email_verified", ColumnValue::Boolean(m.email_verified)),
                ("phone", text(&m.phone)),
                ("fee", bigint(m.fee)),
                ("fee_yearly", ColumnValue::Boolean(m.fee_yearly)),
            ]);
            if let Some(username) = &m.username {
                columns.push(("username", text(username)));
            }
            if let Some(pwhash) = &m.pwhash {
                columns.push(("pwhash", text(pwhash)));
            }
            if let Some(ip) = &record.metadata.request_source_ip {
                columns.push(("sourceip", text(ip)));
            }
            if let Some(agent) = &record.metadata.user_agent {
                columns.push(("useragent", text(agent)));
            }

            let mut data = record.clone();
            if let Some(document) = data.agreement_document.take() {
                columns.push((APPLICATION_PDF, ColumnValue::Blob(document)));
            }
            columns.push((PB_DATA, serialize(&data)?));
        }
        MemberState::Member => {
            columns.extend([
                ("name", text(&m.name)),
                ("street", text(&m.street)),
                ("city", text(&m.city)),
                ("country", text(&m.country)),
                ("email", text(&m.email)),
                ("phone", text(&m.phone)),
                ("fee", bigint(m.fee)),
                ("fee_yearly", ColumnValue::Boolean(m.fee_yearly)),
                ("has_key", ColumnValue::Boolean(m.has_key)),
            ]);
            if let Some(username) = &m.username {
                columns.push(("username", text(username)));
            }
            if let Some(paid) = m.payments_caught_up_to {
                columns.push(("payments_caught_up_to", bigint(paid)));
            }
            columns.push((PB_DATA, serialize(record)?));
        }
        _ => columns.push((PB_DATA, serialize(record)?)),
    }

    Ok(columns)
}

/// Rebuild a record from a row
///
/// Rows written without `pb_data` are rebuilt from their plain columns.
pub fn decode(row: &Row) -> Result<MembershipAgreement> {
    let mut record = match row.get(PB_DATA) {
        Some(ColumnValue::Blob(bytes)) if !bytes.is_empty() => serde_json::from_slice(bytes)
            .map_err(|e| StoreError::DataLoss(format!("cannot parse stored record: {e}")))?,
        Some(ColumnValue::Blob(_)) | None => MembershipAgreement::new(
            member_from_columns(row)?,
            Default::default(),
        ),
        Some(other) => {
            return Err(StoreError::DataLoss(format!(
                "{PB_DATA} holds {other:?} instead of a blob"
            )));
        }
    };

    if let Some(document) = row.get(APPLICATION_PDF).and_then(ColumnValue::as_blob) {
        if !document.is_empty() {
            record.agreement_document = Some(document.to_vec());
        }
    }
    Ok(record)
}

fn member_from_columns(row: &Row) -> Result<Member> {
    let text = |column: &str| {
        row.get(column)
            .and_then(ColumnValue::as_text)
            .map(str::to_string)
    };
    let flag = |column: &str| row.get(column).and_then(ColumnValue::as_bool).unwrap_or(false);
    let number = |column: &str| {
        row.get(column)
            .and_then(ColumnValue::as_i64)
            .map(|n| n as u64)
    };

    let name = text("name").ok_or_else(|| {
        StoreError::DataLoss("row carries neither serialized data nor a name".to_string())
    })?;

    Ok(Member {
        name,
        street: text("street").unwrap_or_default(),
        city: text("city").unwrap_or_default(),
        zipcode: text("zipcode").unwrap_or_default(),
        country: text("country").unwrap_or_default(),
        email: text("email").unwrap_or_default(),
        email_verified: flag("email_verified"),
        phone: text("phone").unwrap_or_default(),
        username: text("username"),
        pwhash: text("pwhash"),
        fee: number("fee").unwrap_or_default(),
        fee_yearly: flag("fee_yearly"),
        has_key: flag("has_key"),
        payments_caught_up_to: number("payments_caught_up_to"),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use membersys_core::{ErrorKind, MembershipMetadata};
    use std::collections::BTreeMap;

    fn record() -> MembershipAgreement {
        let mut record = MembershipAgreement::new(
            Member {
                name: "Ada Lovelace".to_string(),
                city: "London".to_string(),
                fee: 2000,
                ..Default::default()
            },
            MembershipMetadata {
                request_source_ip: Some("192.0.2.7".to_string()),
                ..Default::default()
            },
        );
        record.agreement_document = Some(b"%PDF".to_vec());
        record
    }

    fn row(columns: Vec<(&'static str, ColumnValue)>) -> Row {
        Row {
            key: b"applicant:0123456789abcdef".to_vec(),
            columns: columns
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        }
    }

    #[test]
    fn test_every_written_column_is_in_layout() {
        for state in MemberState::ALL {
            let layout = schema(state);
            for (column, _) in encode(state, &record()).unwrap() {
                assert!(
                    layout.columns.iter().any(|(name, _)| *name == column),
                    "{column} missing from {}",
                    layout.name
                );
            }
            for column in listing_columns(state).iter().chain(record_columns(state)) {
                assert!(layout.columns.iter().any(|(name, _)| name == column));
            }
        }
    }

    #[test]
    fn test_application_document_in_own_column() {
        let columns = encode(MemberState::Application, &record()).unwrap();
        let pdf = columns.iter().find(|(name, _)| *name == APPLICATION_PDF);
        assert_eq!(pdf.map(|(_, v)| v), Some(&ColumnValue::Blob(b"%PDF".to_vec())));
        assert!(columns.iter().any(|(name, v)| *name == "sourceip" && v.as_text() == Some("192.0.2.7")));

        assert_eq!(decode(&row(columns)).unwrap(), record());
    }

    #[test]
    fn test_other_states_keep_document_in_record() {
        let columns = encode(MemberState::Queue, &record()).unwrap();
        assert_eq!(columns.len(), 1);
        assert_eq!(decode(&row(columns)).unwrap(), record());
    }

    #[test]
    fn test_plain_column_fallback() {
        let restored = decode(&row(vec![
            ("name", text("Grace Hopper")),
            ("fee", ColumnValue::BigInt(1500)),
            ("fee_yearly", ColumnValue::Boolean(true)),
        ]))
        .unwrap();
        assert_eq!(restored.member.name, "Grace Hopper");
        assert_eq!(restored.member.fee, 1500);
        assert!(restored.member.fee_yearly);
    }

    #[test]
    fn test_full_u64_range_survives_plain_columns() {
        let mut agreement = record();
        agreement.member.fee = u64::MAX;
        agreement.member.payments_caught_up_to = Some(u64::MAX);
        let columns: Vec<_> = encode(MemberState::Member, &agreement)
            .unwrap()
            .into_iter()
            .filter(|(name, _)| *name != PB_DATA)
            .collect();
        let restored = decode(&row(columns)).unwrap();
        assert_eq!(restored.member.fee, u64::MAX);
        assert_eq!(restored.member.payments_caught_up_to, Some(u64::MAX));
    }

    #[test]
    fn test_garbage_is_data_loss() {
        let err = decode(&row(vec![(PB_DATA, ColumnValue::Blob(b"\x00\x01garbage".to_vec()))])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataLoss);

        let empty = Row {
            key: Vec::new(),
            columns: BTreeMap::new(),
        };
        assert_eq!(decode(&empty).unwrap_err().kind(), ErrorKind::DataLoss);
    }
}
