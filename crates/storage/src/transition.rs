//! Lifecycle transitions
//!
//! Edge validation, entry preconditions and metadata stamping, shared by
//! every backend. Backends only supply the read and the atomic commit.

use chrono::{DateTime, Utc};
use membersys_core::{
    DEPARTED_RETENTION, MemberState, MembershipAgreement, REJECTED_RETENTION, Result, StoreError,
};
use std::time::Duration;

/// Metadata written by an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stamp {
    Nothing,
    /// Approver and approval time
    Approval,
    /// Goodbye initiator, time and optional reason
    Goodbye,
    /// Goodbye fields, unless a previous edge already wrote them
    GoodbyeIfUnset,
}

/// A validated transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionPlan {
    pub from: MemberState,
    pub to: MemberState,
    stamp: Stamp,
    /// How long the destination entry is retained
    pub retention: Option<Duration>,
}

/// Validate the `from -> to` edge
pub fn plan(from: MemberState, to: MemberState) -> Result<TransitionPlan> {
    use MemberState::*;

    if from == to {
        return Err(StoreError::InvalidArgument(format!(
            "source and destination state are both {from}"
        )));
    }

    let (stamp, retention) = match (from, to) {
        (Application, Queue) => (Stamp::Approval, None),
        (Application, Archive) => (Stamp::Approval, Some(REJECTED_RETENTION)),
        (Queue, Member) => (Stamp::Nothing, None),
        (Queue, Archive) => (Stamp::Goodbye, Some(REJECTED_RETENTION)),
        (Member, Dequeue) => (Stamp::Goodbye, None),
        (Dequeue, Archive) => (Stamp::GoodbyeIfUnset, Some(DEPARTED_RETENTION)),
        _ => {
            return Err(StoreError::FailedPrecondition(format!(
                "cannot move a record from {from} to {to}"
            )));
        }
    };

    Ok(TransitionPlan {
        from,
        to,
        stamp,
        retention,
    })
}

impl TransitionPlan {
    /// Whether the destination may only be entered with a signed agreement
    pub fn requires_document(&self) -> bool {
        matches!(self.to, MemberState::Queue | MemberState::Member)
    }

    /// Check entry preconditions and stamp `record` in place
    ///
    /// Leaves `record` untouched on error.
    pub fn apply(
        &self,
        record: &mut MembershipAgreement,
        initiator: &str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.requires_document() && !record.has_document() {
            return Err(StoreError::FailedPrecondition(format!(
                "a signed membership agreement is required to enter {}",
                self.to
            )));
        }
        if self.stamp != Stamp::Nothing && initiator.trim().is_empty() {
            return Err(StoreError::InvalidArgument(format!(
                "moving from {} to {} requires an initiator",
                self.from, self.to
            )));
        }

        let metadata = &mut record.metadata;
        match self.stamp {
            Stamp::Nothing => {}
            Stamp::Approval => {
                metadata.approver_uid = Some(initiator.to_string());
                metadata.approval_timestamp = Some(now);
            }
            Stamp::Goodbye => {
                metadata.goodbye_initiator = Some(initiator.to_string());
                metadata.goodbye_timestamp = Some(now);
                if let Some(reason) = reason {
                    metadata.goodbye_reason = Some(reason.to_string());
                }
            }
            Stamp::GoodbyeIfUnset => {
                if metadata.goodbye_timestamp.is_none() {
                    metadata.goodbye_initiator = Some(initiator.to_string());
                    metadata.goodbye_timestamp = Some(now);
                }
                if metadata.goodbye_reason.is_none() {
                    metadata.goodbye_reason = reason.map(str::to_string);
                }
            }
        }
        Ok(())
    }

    /// Absolute end of retention for an entry written at `now`
    pub fn retention_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let retention = chrono::Duration::from_std(self.retention?).ok()?;
        now.checked_add_signed(retention)
    }
}
