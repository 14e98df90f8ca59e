//! The callback surface replay drives. A log may be replayed with no
//! delegate at all — `NoopDelegate` updates internal state without
//! notifying anything external, useful for fast-forwarding to a segment.

use chronoq_core::hash::TxHash;

use crate::block::Block;
use crate::command::Reason;
use crate::object::TxObject;

pub trait Delegate {
    /// A transaction was recorded in full for the first time (or
    /// re-recorded after crossing a cluster boundary).
    fn receive_transaction(&mut self, object: &TxObject);

    /// A previously recorded transaction reappeared in the mempool.
    fn receive_transaction_by_hash(&mut self, hash: &TxHash);

    /// A transaction left the mempool without being invalidated (expiry,
    /// low-fee eviction).
    fn forget_transaction(&mut self, hash: &TxHash, reason: Reason);

    /// A transaction was invalidated, carrying its original raw bytes and
    /// an optional offending transaction.
    fn discard_transaction(&mut self, hash: &TxHash, raw: &[u8], reason: Reason, cause: Option<TxHash>);

    /// A block was mined (or re-mined after a reorg).
    fn block_confirmed(&mut self, block: &Block);

    /// A block was unmined, by height.
    fn block_reorged(&mut self, height: u32);

    /// Progress notification after advancing from one byte offset to
    /// another; fires once per segment during a bulk replay.
    fn iterated(&mut self, from_offset: u64, to_offset: u64);
}

/// A delegate that does nothing; internal state (dictionaries, chain
/// mirror, purge queues) is still updated by the replayer regardless.
pub struct NoopDelegate;

impl Delegate for NoopDelegate {
    fn receive_transaction(&mut self, _object: &TxObject) {}
    fn receive_transaction_by_hash(&mut self, _hash: &TxHash) {}
    fn forget_transaction(&mut self, _hash: &TxHash, _reason: Reason) {}
    fn discard_transaction(&mut self, _hash: &TxHash, _raw: &[u8], _reason: Reason, _cause: Option<TxHash>) {}
    fn block_confirmed(&mut self, _block: &Block) {}
    fn block_reorged(&mut self, _height: u32) {}
    fn iterated(&mut self, _from_offset: u64, _to_offset: u64) {}
}
