//! In-memory, fee-ordered mempool mirror that drives the chronology writer.

pub mod mirror;

pub use mirror::{Mirror, MirrorConfig, MirrorError, MirrorStats};
