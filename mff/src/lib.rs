//! The mempool file format: domain semantics layered on top of
//! `chronoq-cq`'s generic clustered event log. This crate owns the command
//! catalogue, the chain-state mirror, the freeze/chill purge queues, and
//! the writer/replayer that translate mempool-mirror events into chronology
//! commands and back.

pub mod block;
pub mod command;
pub mod context;
pub mod delegate;
pub mod object;
pub mod purge;
pub mod replayer;
pub mod writer;

pub use block::{Block, ChainMirror};
pub use command::{Command, Reason, Ref};
pub use context::{Location, SerializationContext};
pub use delegate::{Delegate, NoopDelegate};
pub use object::{Outpoint, OutpointState, TxObject};
pub use replayer::Replayer;
pub use writer::{RemoveReason, Writer};
