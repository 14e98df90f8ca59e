//! Byte-level primitives, the error taxonomy, and the hash newtype shared
//! by every layer of the chronology engine: the file pager, the registry,
//! the object store, and the chronology command framing all build on top
//! of what's exported here.

pub mod config;
pub mod errors;
pub mod hash;
pub mod wire;

pub use config::Config;
pub use errors::{ChronoqError, Result};
pub use hash::TxHash;
