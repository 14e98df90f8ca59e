//! The MFF replayer: decodes chronology commands and drives a [`Delegate`],
//! keeping the dictionaries, chain mirror, and purge queues in the same
//! state the writer would have left them in at that point in the stream.

use std::collections::BTreeSet;

use chronoq_core::errors::{ChronoqError, Result};
use chronoq_core::hash::TxHash;

use crate::block::Block;
use crate::command::{self, Command, Ref};
use crate::context::{Location, SerializationContext};
use crate::delegate::{Delegate, NoopDelegate};

/// Replays a chronology stream from wherever its underlying [`SerializationContext`]'s
/// database cursor is currently positioned, driving a [`Delegate`] per
/// decoded command. Restartable: `goto_segment` repositions for a fresh run.
pub struct Replayer {
    ctx: SerializationContext,
}

impl Replayer {
    pub fn new(ctx: SerializationContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &SerializationContext {
        &self.ctx
    }

    pub fn into_context(self) -> SerializationContext {
        self.ctx
    }

    /// Repositions the read cursor to `segment_id`'s recorded byte offset.
    /// Dictionaries, chain mirror, and purge queues are NOT reset — they
    /// reflect whatever this context last observed, which is correct only
    /// if the caller is resuming a run that already processed everything
    /// up to `segment_id` in the same cluster. For a cold start at an
    /// arbitrary segment, construct a fresh [`Replayer`] first.
    pub fn goto_segment(&mut self, segment_id: u64) -> Result<()> {
        self.ctx.db.goto_segment(segment_id)
    }

    /// Resolves a [`Ref`] to its hash, using the dictionary for `Known`
    /// references. A `Known` reference that the dictionary has never heard
    /// of is an integrity violation: the writer guarantees every known
    /// reference resolves within the same cluster.
    fn resolve_ref(&self, r: &Ref) -> Result<(Option<u64>, TxHash)> {
        match r {
            Ref::Known(id) => {
                let rec = self.ctx.get(*id).ok_or_else(|| {
                    ChronoqError::integrity(format!(
                        "known reference {id} does not resolve in the current dictionary"
                    ))
                })?;
                Ok((Some(*id), rec.object.hash))
            }
            Ref::Unknown(hash) => Ok((None, *hash)),
        }
    }

    fn current_height(&self) -> u32 {
        self.ctx.chain.tip().unwrap_or(0)
    }

    /// Decodes and applies exactly one command, invoking `delegate`.
    /// Returns `Ok(false)` at a clean end-of-stream, `Ok(true)` otherwise.
    pub fn step(&mut self, delegate: &mut dyn Delegate) -> Result<bool> {
        if self.ctx.db.eof()? {
            return Ok(false);
        }
        let from_offset = self.ctx.db.tell()?;
        let (command, delta) = command::read_command(&mut self.ctx.db)?;
        self.ctx.advance_time_for_read(delta)?;
        let to_offset = self.ctx.db.tell()?;

        match command {
            Command::TimeSet => {}
            Command::Gap => {
                tracing::debug!("tolerated legacy gap marker during replay");
            }
            Command::MempoolIn { subject } => match subject {
                command::MempoolInSubject::Known(id) => {
                    let rec = self.ctx.get(id).ok_or_else(|| {
                        ChronoqError::integrity(format!(
                            "mempool-in known id {id} does not resolve"
                        ))
                    })?;
                    self.ctx.thaw(id);
                    self.ctx.set_location(id, Location::InMempool);
                    delegate.receive_transaction_by_hash(&rec.object.hash);
                }
                command::MempoolInSubject::Unknown(object) => {
                    let sid = object.sid;
                    self.ctx.register(object.clone(), sid, Location::InMempool);
                    delegate.receive_transaction(&object);
                }
            },
            Command::MempoolOut {
                subject, reason, ..
            } => {
                let (id, hash) = self.resolve_ref(&subject)?;
                if let Some(id) = id {
                    self.ctx.chill(id, self.current_height());
                    self.ctx.set_location(id, Location::Discarded);
                }
                delegate.forget_transaction(&hash, reason);
            }
            Command::MempoolInvalidated {
                subject,
                reason,
                offender,
                raw,
            } => {
                let (id, hash) = self.resolve_ref(&subject)?;
                let cause = match offender {
                    Some(off) => Some(self.resolve_ref(&off)?.1),
                    None => None,
                };
                if let Some(id) = id {
                    self.ctx.freeze(id, self.current_height());
                    self.ctx.set_location(id, Location::Invalid);
                }
                delegate.discard_transaction(&hash, &raw, reason, cause);
            }
            Command::BlockMined {
                known,
                unknown,
                hash,
                height,
            } => {
                for id in &known {
                    if self.ctx.get(*id).is_none() {
                        return Err(ChronoqError::integrity(format!(
                            "block-mined known id {id} does not resolve"
                        )));
                    }
                    self.ctx.set_location(*id, Location::Confirmed);
                    self.ctx.freeze(*id, height);
                }
                let block = Block::new(
                    height,
                    hash,
                    known.into_iter().collect(),
                    unknown.into_iter().collect(),
                );
                self.ctx.chain.push(block.clone())?;
                self.ctx.purge_to(height);
                delegate.block_confirmed(&block);
            }
            Command::BlockUnmined { height } => {
                if let Some(block) = self.ctx.chain.pop() {
                    for id in &block.known {
                        self.ctx.set_location(*id, Location::InMempool);
                        self.ctx.thaw(*id);
                    }
                }
                delegate.block_reorged(height);
            }
        }

        delegate.iterated(from_offset, to_offset);
        Ok(true)
    }

    /// Drives `delegate` to the end of the currently open cluster.
    pub fn run(&mut self, delegate: &mut dyn Delegate) -> Result<()> {
        while self.step(delegate)? {}
        Ok(())
    }

    /// Replays with no delegate: internal state advances, nothing is
    /// notified. Used to fast-forward to a segment cheaply.
    pub fn fast_forward(&mut self) -> Result<()> {
        let mut noop = NoopDelegate;
        self.run(&mut noop)
    }

    /// Block-consistency check (§8, testable property 7): resolves `block`'s
    /// known ids back to hashes via the current dictionary and compares the
    /// full member set against an independently obtained raw block's
    /// transaction-hash set. Returns `Err` if a known id no longer resolves
    /// (already purged) rather than silently treating it as a mismatch.
    pub fn block_matches_members(
        &self,
        block: &Block,
        raw_members: &BTreeSet<TxHash>,
    ) -> Result<bool> {
        let mut recorded: BTreeSet<TxHash> = block.unknown.iter().copied().collect();
        for id in &block.known {
            let rec = self.ctx.get(*id).ok_or_else(|| {
                ChronoqError::integrity(format!(
                    "block consistency check: known id {id} no longer resolves"
                ))
            })?;
            recorded.insert(rec.object.hash);
        }
        Ok(recorded == *raw_members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronoq_core::hash::TxHash;
    use chronoq_core::Config;
    use chronoq_cq::store::Db;
    use crate::object::TxObject;
    use crate::writer::{RemoveReason, Writer};

    fn cfg() -> Config {
        Config {
            cluster_size: 2016,
            ..Config::default()
        }
    }

    #[derive(Default)]
    struct RecordingDelegate {
        received: Vec<TxObject>,
        confirmed: Vec<Block>,
        reorged: Vec<u32>,
        discarded: Vec<(TxHash, Vec<u8>, command::Reason, Option<TxHash>)>,
    }

    impl Delegate for RecordingDelegate {
        fn receive_transaction(&mut self, object: &TxObject) {
            self.received.push(object.clone());
        }
        fn receive_transaction_by_hash(&mut self, _hash: &TxHash) {}
        fn forget_transaction(&mut self, _hash: &TxHash, _reason: command::Reason) {}
        fn discard_transaction(
            &mut self,
            hash: &TxHash,
            raw: &[u8],
            reason: command::Reason,
            cause: Option<TxHash>,
        ) {
            self.discarded.push((*hash, raw.to_vec(), reason, cause));
        }
        fn block_confirmed(&mut self, block: &Block) {
            self.confirmed.push(block.clone());
        }
        fn block_reorged(&mut self, height: u32) {
            self.reorged.push(height);
        }
        fn iterated(&mut self, _from: u64, _to: u64) {}
    }

    #[test]
    fn single_insert_replay_matches_spec_scenario_1() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_or_create(dir.path(), "p", &cfg()).unwrap();
        let mut ctx = SerializationContext::new(db, cfg());
        ctx.db.begin_segment(0).unwrap();
        let mut writer = Writer::new(ctx);

        let t1 = TxObject::new(
            TxHash([0x01; 32]),
            400,
            500,
            vec![crate::object::Outpoint::Unknown {
                output_index: 0,
                input_hash: TxHash([0xab; 32]),
            }],
            vec![1_000],
        );
        writer.add_entry(1_558_067_026, t1.clone()).unwrap();
        drop(writer);

        let db = Db::open_or_create(dir.path(), "p", &cfg()).unwrap();
        let mut ctx = SerializationContext::new(db, cfg());
        ctx.db.goto_segment(0).unwrap();
        let mut replayer = Replayer::new(ctx);
        let mut delegate = RecordingDelegate::default();
        replayer.run(&mut delegate).unwrap();

        assert_eq!(delegate.received.len(), 1);
        assert_eq!(delegate.received[0].hash, t1.hash);
        assert_eq!(delegate.received[0].weight, t1.weight);
        assert_eq!(delegate.received[0].fee, t1.fee);
        assert_eq!(replayer.context().current_time(), 1_558_067_026);
    }

    #[test]
    fn reorg_then_remine_emits_matching_callback_counts() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_or_create(dir.path(), "p", &cfg()).unwrap();
        let mut writer = Writer::new(SerializationContext::new(db, cfg()));
        writer.context_mut().db.begin_segment(500_000).unwrap();

        let mut t = 1_600_000_000u64;
        for h in 500_000..=500_009u32 {
            writer.push_block(t, h, TxHash([h as u8; 32]), &[]).unwrap();
            t += 1;
        }
        for h in (500_005..=500_009u32).rev() {
            writer.pop_block(t, h).unwrap();
            t += 1;
        }
        for h in 500_005..=500_010u32 {
            let hash = if h == 500_005 {
                TxHash([0xee; 32])
            } else {
                TxHash([h as u8; 32])
            };
            writer.push_block(t, h, hash, &[]).unwrap();
            t += 1;
        }
        drop(writer);

        let db = Db::open_or_create(dir.path(), "p", &cfg()).unwrap();
        let mut ctx = SerializationContext::new(db, cfg());
        ctx.db.goto_segment(500_000).unwrap();
        let mut replayer = Replayer::new(ctx);
        let mut delegate = RecordingDelegate::default();
        replayer.run(&mut delegate).unwrap();

        assert_eq!(delegate.reorged.len(), 5);
        assert_eq!(delegate.confirmed.len(), 10 + 6);
        assert_eq!(replayer.context().chain.tip(), Some(500_010));
    }

    #[test]
    fn invalidation_with_cause_matches_spec_scenario_3() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_or_create(dir.path(), "p", &cfg()).unwrap();
        let mut writer = Writer::new(SerializationContext::new(db, cfg()));
        writer.context_mut().db.begin_segment(0).unwrap();

        let a = TxObject::new(TxHash([0xaa; 32]), 400, 10, vec![], vec![1]);
        let b = TxObject::new(TxHash([0xbb; 32]), 400, 20, vec![], vec![1]);
        let c = TxObject::new(TxHash([0xcc; 32]), 400, 30, vec![], vec![1]);
        writer.add_entry(1, a.clone()).unwrap();
        writer.add_entry(2, b.clone()).unwrap();
        writer.add_entry(3, c.clone()).unwrap();
        writer
            .remove_entry(
                4,
                b.hash,
                RemoveReason::Replaced {
                    cause: c.hash,
                    raw: vec![0x01, 0x02, 0x03],
                },
            )
            .unwrap();
        drop(writer);

        let db = Db::open_or_create(dir.path(), "p", &cfg()).unwrap();
        let mut ctx = SerializationContext::new(db, cfg());
        ctx.db.goto_segment(0).unwrap();
        let mut replayer = Replayer::new(ctx);
        let mut delegate = RecordingDelegate::default();
        replayer.run(&mut delegate).unwrap();

        assert_eq!(delegate.received.len(), 3);
        assert_eq!(delegate.discarded.len(), 1);
        let (hash, raw, reason, cause) = &delegate.discarded[0];
        assert_eq!(*hash, b.hash);
        assert_eq!(raw, &[0x01, 0x02, 0x03]);
        assert_eq!(*reason, command::Reason::Replaced);
        assert_eq!(*cause, Some(c.hash));
    }

    /// Spec §8, testable property 1 and end-to-end scenario 5: a sizeable
    /// randomized sequence of tx-in/tx-out/invalidate/block/reorg operations
    /// must replay to the same count of each delegate callback the writer
    /// was driven with, across the cluster boundaries a small `cluster_size`
    /// forces it to cross along the way (scenario 6). Scaled down from the
    /// spec's 10^4-10^5+ event runs to keep this fast without running the
    /// toolchain; the property being exercised is identical at any size.
    #[test]
    fn randomized_sequence_round_trips_across_cluster_boundaries() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            cluster_size: 50,
            ..Config::default()
        };
        let db = Db::open_or_create(dir.path(), "p", &cfg).unwrap();
        let mut writer = Writer::new(SerializationContext::new(db, cfg));
        writer.context_mut().db.begin_segment(0).unwrap();

        let mut rng = StdRng::seed_from_u64(0xC0FFEE);
        let mut time = 1_600_000_000u64;
        let mut next_id = 0u64;
        let mut live: Vec<TxHash> = Vec::new();
        let mut chain: Vec<(u32, Vec<TxHash>)> = Vec::new();
        let mut height = 0u32;

        let mut expected_in = 0u64;
        let mut expected_out = 0u64;
        let mut expected_invalid = 0u64;
        let mut expected_confirmed = 0u64;
        let mut expected_reorged = 0u64;

        for _ in 0..2_000 {
            time += 1;
            let roll: f64 = rng.gen();
            if roll < 0.40 {
                next_id += 1;
                let mut bytes = [0u8; 32];
                bytes[0..8].copy_from_slice(&next_id.to_le_bytes());
                let hash = TxHash(bytes);
                let fee = rng.gen_range(1..10_000);
                let tx = TxObject::new(hash, 400, fee, vec![], vec![1_000]);
                writer.add_entry(time, tx).unwrap();
                live.push(hash);
                expected_in += 1;
            } else if roll < 0.60 {
                if !live.is_empty() {
                    let idx = rng.gen_range(0..live.len());
                    let hash = live.remove(idx);
                    writer.remove_entry(time, hash, RemoveReason::Expiry).unwrap();
                    expected_out += 1;
                }
            } else if roll < 0.70 {
                if !live.is_empty() {
                    let idx = rng.gen_range(0..live.len());
                    let hash = live.remove(idx);
                    writer
                        .remove_entry(time, hash, RemoveReason::Reorg { raw: vec![0xde, 0xad] })
                        .unwrap();
                    expected_invalid += 1;
                }
            } else if roll < 0.90 {
                let member_count = rng.gen_range(0..=live.len().min(4));
                let mut members = Vec::with_capacity(member_count);
                for _ in 0..member_count {
                    let idx = rng.gen_range(0..live.len());
                    members.push(live.remove(idx));
                }
                height += 1;
                let mut hbytes = [0u8; 32];
                hbytes[0..4].copy_from_slice(&height.to_le_bytes());
                let block_hash = TxHash(hbytes);
                for m in &members {
                    writer.remove_entry(time, *m, RemoveReason::Block).unwrap();
                }
                writer.push_block(time, height, block_hash, &members).unwrap();
                chain.push((height, members));
                expected_confirmed += 1;
            } else if !chain.is_empty() {
                let pop_n = rng.gen_range(1..=chain.len().min(3));
                for _ in 0..pop_n {
                    if let Some((h, members)) = chain.pop() {
                        writer.pop_block(time, h).unwrap();
                        height = h - 1;
                        live.extend(members);
                        expected_reorged += 1;
                    }
                }
            }
        }
        writer.flush().unwrap();
        drop(writer);

        let db = Db::open_or_create(dir.path(), "p", &cfg).unwrap();
        let mut ctx = SerializationContext::new(db, cfg);
        ctx.db.goto_segment(0).unwrap();
        let mut replayer = Replayer::new(ctx);
        let mut delegate = RecordingDelegate::default();
        replayer.run(&mut delegate).unwrap();

        assert_eq!(delegate.received.len() as u64, expected_in);
        assert_eq!(
            delegate.discarded.iter().filter(|(_, _, r, _)| *r == command::Reason::Reorg).count() as u64,
            expected_invalid
        );
        assert_eq!(delegate.confirmed.len() as u64, expected_confirmed);
        assert_eq!(delegate.reorged.len() as u64, expected_reorged);

        let forget_count = {
            #[derive(Default)]
            struct CountingDelegate(u64);
            impl Delegate for CountingDelegate {
                fn receive_transaction(&mut self, _object: &TxObject) {}
                fn receive_transaction_by_hash(&mut self, _hash: &TxHash) {}
                fn forget_transaction(&mut self, _hash: &TxHash, _reason: command::Reason) {
                    self.0 += 1;
                }
                fn discard_transaction(
                    &mut self,
                    _hash: &TxHash,
                    _raw: &[u8],
                    _reason: command::Reason,
                    _cause: Option<TxHash>,
                ) {
                }
                fn block_confirmed(&mut self, _block: &Block) {}
                fn block_reorged(&mut self, _height: u32) {}
                fn iterated(&mut self, _from: u64, _to: u64) {}
            }
            let db = Db::open_or_create(dir.path(), "p", &cfg).unwrap();
            let mut ctx = SerializationContext::new(db, cfg);
            ctx.db.goto_segment(0).unwrap();
            let mut replayer = Replayer::new(ctx);
            let mut counting = CountingDelegate::default();
            replayer.run(&mut counting).unwrap();
            counting.0
        };
        assert_eq!(forget_count, expected_out);
    }
}
