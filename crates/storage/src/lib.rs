// membersys storage layer
//
// One record store contract, two backends: wide-column and relational

pub mod call;
pub mod factory;
pub mod stream;
pub mod trait_;
pub mod transition;
pub mod wide_column;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use call::{StoreOptions, with_deadline};
pub use factory::open_store;
pub use stream::{RecordStream, collect_all, enumerate_stream};
pub use trait_::*;
