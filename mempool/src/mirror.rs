//! The mempool mirror: an in-memory, fee-ordered model of the pending
//! transaction set that decides *when* to call into the chronology
//! writer (§4.6, §4.10). Owns no on-disk state; it is reconstructible from
//! chain-tip plus a feed of live transactions.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use chronoq_core::errors::ChronoqError;
use chronoq_core::hash::TxHash;
use chronoq_mff::writer::{RemoveReason, Writer};
use chronoq_mff::TxObject;
use thiserror::Error;

/// Tunables for the mirror's admission and eviction policy.
#[derive(Debug, Clone, Copy)]
pub struct MirrorConfig {
    pub max_transactions: usize,
    pub min_fee: u64,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            max_transactions: 10_000,
            min_fee: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("transaction already pending")]
    Duplicate,
    #[error("transaction fee below minimum")]
    FeeTooLow,
    #[error("pool is full and no lower-fee entry could be evicted")]
    Full,
    #[error("transaction not pending")]
    NotFound,
    #[error(transparent)]
    Chronology(#[from] ChronoqError),
}

/// One pending transaction plus the bookkeeping needed for fee-ordered
/// eviction: higher fee wins; ties break toward the entry that arrived
/// first (so a flood of equal-fee spam can't starve older transactions).
#[derive(Clone, Debug)]
struct Entry {
    object: TxObject,
    received_at: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.object.hash == other.object.hash
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match self.object.fee.cmp(&other.object.fee) {
            std::cmp::Ordering::Equal => other.received_at.cmp(&self.received_at),
            ordering => ordering,
        }
    }
}

/// Aggregate counters exposed purely for observability — never consulted
/// for an admission or eviction decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct MirrorStats {
    pub count: usize,
    pub total_fee: u64,
    pub min_fee: Option<u64>,
    pub max_fee: Option<u64>,
}

/// Drives a [`Writer`] from pool admission/eviction/confirmation events.
/// Single-threaded, matching the one-writer model in §5.
pub struct Mirror {
    config: MirrorConfig,
    queue: BinaryHeap<Entry>,
    by_hash: HashMap<TxHash, TxObject>,
    writer: Writer,
}

impl Mirror {
    pub fn new(writer: Writer, config: MirrorConfig) -> Self {
        Self {
            config,
            queue: BinaryHeap::new(),
            by_hash: HashMap::new(),
            writer,
        }
    }

    pub fn writer(&self) -> &Writer {
        &self.writer
    }

    pub fn writer_mut(&mut self) -> &mut Writer {
        &mut self.writer
    }

    pub fn contains(&self, hash: &TxHash) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Admits `object` at wall-clock `time`, recorded as arriving at
    /// `received_at` for tie-breaking. Evicts the lowest-fee pending entry
    /// to make room if the pool is full and `object`'s fee beats it.
    pub fn add(&mut self, time: u64, object: TxObject, received_at: u64) -> Result<(), MirrorError> {
        if self.by_hash.contains_key(&object.hash) {
            return Err(MirrorError::Duplicate);
        }
        if object.fee < self.config.min_fee {
            return Err(MirrorError::FeeTooLow);
        }
        if self.queue.len() >= self.config.max_transactions {
            match self.queue.peek() {
                Some(lowest) if object.fee > lowest.object.fee => self.evict_lowest(time)?,
                _ => return Err(MirrorError::Full),
            }
        }

        self.writer.add_entry(time, object.clone())?;
        self.by_hash.insert(object.hash, object.clone());
        self.queue.push(Entry { object, received_at });
        Ok(())
    }

    /// Removes a specific pending transaction for an externally-determined
    /// reason (expiry sweep, observed reorg, observed conflict/replacement).
    pub fn remove(&mut self, time: u64, hash: TxHash, reason: RemoveReason) -> Result<(), MirrorError> {
        if self.by_hash.remove(&hash).is_none() {
            return Err(MirrorError::NotFound);
        }
        self.retain_queue(&hash);
        self.writer.remove_entry(time, hash, reason)?;
        Ok(())
    }

    /// Removes every hash in `hashes`, in order, each with `reason`.
    pub fn remove_batch(
        &mut self,
        time: u64,
        hashes: &[TxHash],
        reason_for: impl Fn(TxHash) -> RemoveReason,
    ) -> Result<(), MirrorError> {
        for hash in hashes {
            if self.by_hash.remove(hash).is_some() {
                self.retain_queue(hash);
                self.writer.remove_entry(time, *hash, reason_for(*hash))?;
            }
        }
        Ok(())
    }

    /// Explicit low-fee eviction, independent of capacity pressure (used by
    /// a background trim policy). Reuses the same `size-limit` reason the
    /// automatic capacity eviction in [`Mirror::add`] uses.
    pub fn evict_lowest(&mut self, time: u64) -> Result<(), MirrorError> {
        let mut min_heap: BinaryHeap<Reverse<Entry>> = self.queue.drain().map(Reverse).collect();
        if let Some(Reverse(lowest)) = min_heap.pop() {
            self.by_hash.remove(&lowest.object.hash);
            self.writer
                .remove_entry(time, lowest.object.hash, RemoveReason::SizeLimit)?;
        }
        self.queue = min_heap.into_iter().map(|Reverse(e)| e).collect();
        Ok(())
    }

    /// A block was mined. Every member hash still pending is first removed
    /// with `RemoveReason::Block` (buffered by the writer, not yet
    /// emitted), then the block-mined event itself is written.
    pub fn push_block(
        &mut self,
        time: u64,
        height: u32,
        hash: TxHash,
        members: &[TxHash],
    ) -> Result<(), MirrorError> {
        for member in members {
            if self.by_hash.remove(member).is_some() {
                self.retain_queue(member);
                self.writer.remove_entry(time, *member, RemoveReason::Block)?;
            }
        }
        self.writer.push_block(time, height, hash, members)?;
        Ok(())
    }

    /// A previously mined block at `height` was reorged out.
    pub fn pop_block(&mut self, time: u64, height: u32) -> Result<(), MirrorError> {
        self.writer.pop_block(time, height)?;
        Ok(())
    }

    fn retain_queue(&mut self, hash: &TxHash) {
        let remaining: Vec<Entry> = self
            .queue
            .drain()
            .filter(|e| &e.object.hash != hash)
            .collect();
        self.queue = BinaryHeap::from(remaining);
    }

    pub fn stats(&self) -> MirrorStats {
        let mut stats = MirrorStats {
            count: self.queue.len(),
            ..Default::default()
        };
        for entry in &self.queue {
            stats.total_fee += entry.object.fee;
            stats.min_fee = Some(stats.min_fee.map_or(entry.object.fee, |m| m.min(entry.object.fee)));
            stats.max_fee = Some(stats.max_fee.map_or(entry.object.fee, |m| m.max(entry.object.fee)));
        }
        stats
    }

    pub fn into_writer(self) -> Writer {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronoq_core::Config;
    use chronoq_cq::store::Db;
    use chronoq_mff::context::SerializationContext;

    fn mirror(dir: &std::path::Path, max: usize) -> Mirror {
        let cfg = Config {
            cluster_size: 2016,
            ..Config::default()
        };
        let mut db = Db::open_or_create(dir, "p", &cfg).unwrap();
        db.begin_segment(0).unwrap();
        let writer = Writer::new(SerializationContext::new(db, cfg));
        Mirror::new(
            writer,
            MirrorConfig {
                max_transactions: max,
                min_fee: 0,
            },
        )
    }

    fn tx(byte: u8, fee: u64) -> TxObject {
        TxObject::new(TxHash([byte; 32]), 400, fee, vec![], vec![1_000])
    }

    #[test]
    fn rejects_duplicate_hash() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = mirror(dir.path(), 10);
        m.add(1, tx(1, 100), 1).unwrap();
        let err = m.add(2, tx(1, 200), 2);
        assert!(matches!(err, Err(MirrorError::Duplicate)));
    }

    #[test]
    fn rejects_fee_below_minimum() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            cluster_size: 2016,
            ..Config::default()
        };
        let mut db = Db::open_or_create(dir.path(), "p", &cfg).unwrap();
        db.begin_segment(0).unwrap();
        let writer = Writer::new(SerializationContext::new(db, cfg));
        let mut m = Mirror::new(
            writer,
            MirrorConfig {
                max_transactions: 10,
                min_fee: 1_000,
            },
        );
        let err = m.add(1, tx(1, 10), 1);
        assert!(matches!(err, Err(MirrorError::FeeTooLow)));
    }

    #[test]
    fn evicts_lowest_fee_entry_to_admit_a_higher_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = mirror(dir.path(), 2);
        m.add(1, tx(1, 100), 1).unwrap();
        m.add(2, tx(2, 200), 2).unwrap();
        assert_eq!(m.len(), 2);

        m.add(3, tx(3, 500), 3).unwrap();
        assert_eq!(m.len(), 2);
        assert!(!m.contains(&TxHash([1u8; 32])));
        assert!(m.contains(&TxHash([2u8; 32])));
        assert!(m.contains(&TxHash([3u8; 32])));
    }

    #[test]
    fn rejects_admission_when_full_and_not_higher_fee() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = mirror(dir.path(), 1);
        m.add(1, tx(1, 500), 1).unwrap();
        let err = m.add(2, tx(2, 100), 2);
        assert!(matches!(err, Err(MirrorError::Full)));
    }

    #[test]
    fn push_block_drains_confirmed_members_from_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = mirror(dir.path(), 10);
        let t = tx(7, 100);
        m.add(1, t.clone(), 1).unwrap();
        m.push_block(2, 500_000, TxHash([0xaa; 32]), &[t.hash]).unwrap();
        assert!(!m.contains(&t.hash));
        assert!(m.is_empty());
    }

    #[test]
    fn stats_reflect_pending_fees() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = mirror(dir.path(), 10);
        m.add(1, tx(1, 100), 1).unwrap();
        m.add(2, tx(2, 300), 2).unwrap();
        let stats = m.stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.total_fee, 400);
        assert_eq!(stats.min_fee, Some(100));
        assert_eq!(stats.max_fee, Some(300));
    }
}
