//! Lifecycle states and their storage layout

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::StoreError;

/// Retention of rejected applications and cancelled queue entries
pub const REJECTED_RETENTION: Duration = Duration::from_secs(6 * 30 * 24 * 60 * 60);

/// Retention of records of members who have left
pub const DEPARTED_RETENTION: Duration = Duration::from_secs(2 * 365 * 24 * 60 * 60);

/// Stage of a record in the membership process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberState {
    /// Submitted, waiting for review
    Application,
    /// Approved, waiting for account creation
    Queue,
    /// Active member
    Member,
    /// Leaving, waiting for account removal
    Dequeue,
    /// Rejected, cancelled or departed; kept until retention expires
    Archive,
}

/// Where a state lives in each backend
#[derive(Debug, PartialEq, Eq)]
pub struct StateLayout {
    pub state: MemberState,
    /// Row key prefix in the wide-column keyspace
    pub key_prefix: &'static str,
    /// Wide-column table (column family)
    pub table: &'static str,
    /// Value of `membership_status` in the relational backend
    pub status: &'static str,
}

static STATE_LAYOUTS: [StateLayout; 5] = [
    StateLayout {
        state: MemberState::Application,
        key_prefix: "applicant:",
        table: "application",
        status: "APPLICATION",
    },
    StateLayout {
        state: MemberState::Queue,
        key_prefix: "queue:",
        table: "membership_queue",
        status: "IN_CREATION",
    },
    StateLayout {
        state: MemberState::Member,
        key_prefix: "member:",
        table: "members",
        status: "ACTIVE",
    },
    StateLayout {
        state: MemberState::Dequeue,
        key_prefix: "dequeue:",
        table: "membership_dequeue",
        status: "IN_DELETION",
    },
    StateLayout {
        state: MemberState::Archive,
        key_prefix: "archive:",
        table: "membership_archive",
        status: "ARCHIVED",
    },
];

impl MemberState {
    pub const ALL: [MemberState; 5] = [
        MemberState::Application,
        MemberState::Queue,
        MemberState::Member,
        MemberState::Dequeue,
        MemberState::Archive,
    ];

    /// Layout table covering every state
    pub fn layouts() -> &'static [StateLayout] {
        &STATE_LAYOUTS
    }

    pub fn layout(self) -> &'static StateLayout {
        let layout = &STATE_LAYOUTS[self as usize];
        debug_assert_eq!(layout.state, self);
        layout
    }

    pub fn key_prefix(self) -> &'static str {
        self.layout().key_prefix
    }

    pub fn table(self) -> &'static str {
        self.layout().table
    }

    pub fn status(self) -> &'static str {
        self.layout().status
    }

    /// Parse a relational `membership_status` value
    pub fn from_status(status: &str) -> Option<Self> {
        STATE_LAYOUTS
            .iter()
            .find(|l| l.status == status)
            .map(|l| l.state)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MemberState::Application => "application",
            MemberState::Queue => "queue",
            MemberState::Member => "member",
            MemberState::Dequeue => "dequeue",
            MemberState::Archive => "archive",
        }
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemberState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        MemberState::ALL
            .into_iter()
            .find(|state| state.as_str() == lower)
            .or_else(|| MemberState::from_status(&s.trim().to_ascii_uppercase()))
            .ok_or_else(|| StoreError::InvalidArgument(format!("unknown lifecycle state: {s}")))
    }
}
