//! membersys core - shared model for the membership lifecycle store
//!
//! Contains:
//! - Member / MembershipMetadata / MembershipAgreement: the record model
//! - MemberState: lifecycle states and their storage layout
//! - StoreError: the error taxonomy every backend reports in
//! - Clock: server-side time source
//! - MembersysConfig: backend selection and connection parameters

mod clock;
mod error;
mod field;
mod member;
mod state;

pub mod config;

pub use clock::*;
pub use error::*;
pub use field::*;
pub use member::*;
pub use state::*;
