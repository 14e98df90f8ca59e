//! The generic clustered event-log engine: file pager, registry, and
//! object store. Domain semantics (the mempool file format) live one
//! layer up, in `chronoq-mff`.

pub mod pager;
pub mod registry;
pub mod store;

pub use pager::Pager;
pub use registry::{Header, Registry};
pub use store::{Db, WireRecord};
