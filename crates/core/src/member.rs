//! Membership record model
//!
//! A [`MembershipAgreement`] is the unit of storage: the member's personal
//! data, the audit metadata collected along the lifecycle, and the optional
//! signed agreement scan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Personal, contact and financial data of a (prospective) member
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Member {
    /// Numeric identifier assigned at account creation
    pub id: Option<u64>,
    pub name: String,
    pub street: String,
    pub city: String,
    pub zipcode: String,
    pub country: String,
    pub email: String,
    pub email_verified: bool,
    pub phone: String,
    pub username: Option<String>,
    pub pwhash: Option<String>,
    /// Fee amount in the smallest currency unit
    pub fee: u64,
    /// Whether the fee is paid yearly rather than monthly
    pub fee_yearly: bool,
    /// Whether the member holds a physical access key
    pub has_key: bool,
    /// Unix seconds up to which payments have been received
    pub payments_caught_up_to: Option<u64>,
}

impl Member {
    /// Whether a non-empty username has been assigned
    pub fn has_username(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty())
    }
}

/// Provenance and audit fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipMetadata {
    pub request_timestamp: Option<DateTime<Utc>>,
    pub request_source_ip: Option<String>,
    pub user_agent: Option<String>,
    pub verification_email: Option<String>,
    pub approver_uid: Option<String>,
    pub approval_timestamp: Option<DateTime<Utc>>,
    pub comment: Option<String>,
    pub goodbye_initiator: Option<String>,
    pub goodbye_reason: Option<String>,
    pub goodbye_timestamp: Option<DateTime<Utc>>,
}

/// Member data, metadata and the signed agreement document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipAgreement {
    pub member: Member,
    pub metadata: MembershipMetadata,
    #[serde(
        with = "document_encoding",
        skip_serializing_if = "Option::is_none"
    )]
    pub agreement_document: Option<Vec<u8>>,
}

impl MembershipAgreement {
    pub fn new(member: Member, metadata: MembershipMetadata) -> Self {
        Self {
            member,
            metadata,
            agreement_document: None,
        }
    }

    /// Whether a non-empty signed agreement is attached
    pub fn has_document(&self) -> bool {
        self.agreement_document
            .as_deref()
            .is_some_and(|d| !d.is_empty())
    }

    /// Copy without the document, as returned by listings
    pub fn without_document(mut self) -> Self {
        self.agreement_document = None;
        self
    }
}

/// A stored agreement together with its opaque store key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyedAgreement {
    pub key: String,
    pub agreement: MembershipAgreement,
}

impl KeyedAgreement {
    pub fn new(key: impl Into<String>, agreement: MembershipAgreement) -> Self {
        Self {
            key: key.into(),
            agreement,
        }
    }

    pub fn name(&self) -> &str {
        &self.agreement.member.name
    }
}

/// Documents travel as base64 text inside serialized records
mod document_encoding {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|text| STANDARD.decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MembershipAgreement {
        MembershipAgreement::new(
            Member {
                name: "Ada Lovelace".to_string(),
                email: "ada@example.org".to_string(),
                fee: 2000,
                ..Default::default()
            },
            MembershipMetadata::default(),
        )
    }

    #[test]
    fn test_has_document_ignores_empty_attachment() {
        let mut agreement = sample();
        assert!(!agreement.has_document());

        agreement.agreement_document = Some(Vec::new());
        assert!(!agreement.has_document());

        agreement.agreement_document = Some(b"%PDF-1.4".to_vec());
        assert!(agreement.has_document());
        assert!(!agreement.without_document().has_document());
    }

    #[test]
    fn test_document_serialized_as_base64() {
        let mut agreement = sample();
        agreement.agreement_document = Some(vec![0, 1, 2, 255]);

        let json = serde_json::to_value(&agreement).unwrap();
        assert_eq!(json["agreement_document"], "AAEC/w==");

        let back: MembershipAgreement = serde_json::from_value(json).unwrap();
        assert_eq!(back, agreement);
    }

    #[test]
    fn test_missing_fields_default() {
        let back: MembershipAgreement =
            serde_json::from_str(r#"{"member":{"name":"Grace"}}"#).unwrap();
        assert_eq!(back.member.name, "Grace");
        assert!(back.agreement_document.is_none());
        assert!(back.metadata.request_timestamp.is_none());
    }

    #[test]
    fn test_has_username() {
        let mut member = Member::default();
        assert!(!member.has_username());
        member.username = Some(String::new());
        assert!(!member.has_username());
        member.username = Some("ada".to_string());
        assert!(member.has_username());
    }
}
