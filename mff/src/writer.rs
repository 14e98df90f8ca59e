//! The MFF writer: domain mapping from mempool-mirror callbacks (§4.6) onto
//! the chronology command set. Owns the [`SerializationContext`] and is the
//! only thing in this crate family allowed to call [`write_command`].

use chronoq_core::errors::Result;
use chronoq_core::hash::TxHash;

use crate::block::Block;
use crate::command::{self, Command, MempoolInSubject, Ref, Reason};
use crate::context::{Location, SerializationContext};
use crate::object::TxObject;

/// Why a transaction is leaving the mempool, mirroring the reasons a
/// `remove_entry` callback can carry. `raw` is the transaction's original
/// encoding, required by every reason that routes to `mempool-invalidated`
/// (ignored for the two that route to `mempool-out`).
#[derive(Debug, Clone)]
pub enum RemoveReason {
    /// Aged out of the pool. Routes to `mempool-out`.
    Expiry,
    /// Evicted to make room for a higher-fee transaction. Routes to
    /// `mempool-out`.
    SizeLimit,
    /// Invalidated by a reorg. Routes to `mempool-invalidated`.
    Reorg { raw: Vec<u8> },
    /// Confirmed in a block. Buffered, not emitted immediately — see
    /// [`Writer::push_block`].
    Block,
    /// Double-spent by `cause`. Routes to `mempool-invalidated`.
    Conflict { cause: TxHash, raw: Vec<u8> },
    /// Replaced (RBF) by `cause`. Routes to `mempool-invalidated`.
    Replaced { cause: TxHash, raw: Vec<u8> },
    /// Unspecified reason; routes to `mempool-invalidated` if `cause` is
    /// set, otherwise `mempool-out`.
    Unknown { cause: Option<TxHash>, raw: Vec<u8> },
}

/// Drives the chronology command set from the domain-level events a
/// mempool mirror produces. Not `Clone`/`Sync`: there is exactly one
/// writer per open log, matching the single-writer model in §5.
pub struct Writer {
    ctx: SerializationContext,
    pending_confirmed: Vec<u64>,
}

impl Writer {
    pub fn new(ctx: SerializationContext) -> Self {
        Self {
            ctx,
            pending_confirmed: Vec::new(),
        }
    }

    pub fn context(&self) -> &SerializationContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut SerializationContext {
        &mut self.ctx
    }

    pub fn into_context(self) -> SerializationContext {
        self.ctx
    }

    fn time_delta(&mut self, time: u64) -> Result<u64> {
        let prev = self.ctx.current_time();
        self.ctx.advance_time_for_write(time)?;
        Ok(time - prev)
    }

    fn current_height(&self) -> u32 {
        self.ctx.chain.tip().unwrap_or(0)
    }

    /// A reference to `hash` suitable for a command payload: `Known` if the
    /// log has it live in the *current* cluster, `Unknown` (bare hash)
    /// otherwise — a stale-cluster hit is deliberately treated as unknown
    /// rather than erroring, since unknown references are always valid.
    fn subject_ref(&self, hash: &TxHash) -> Ref {
        match self.ctx.lookup_live(hash) {
            Some(id) if self.ctx.is_known_in_current_cluster(id) => Ref::Known(id),
            _ => Ref::Unknown(*hash),
        }
    }

    /// Writes a bare `time-set` command carrying no domain event, useful as
    /// a clock heartbeat during idle stretches so a later event's delta
    /// does not silently span an implausible gap.
    pub fn heartbeat(&mut self, time: u64) -> Result<()> {
        let delta = self.time_delta(time)?;
        command::write_command(&mut self.ctx.db, delta, &Command::TimeSet)?;
        Ok(())
    }

    /// A transaction entered the mempool, at wall-clock `time`.
    pub fn add_entry(&mut self, time: u64, object: TxObject) -> Result<u64> {
        let delta = self.time_delta(time)?;
        if let Some(id) = self.ctx.lookup_live(&object.hash) {
            if self.ctx.is_known_in_current_cluster(id) {
                command::write_command(
                    &mut self.ctx.db,
                    delta,
                    &Command::MempoolIn {
                        subject: MempoolInSubject::Known(id),
                    },
                )?;
                self.ctx.thaw(id);
                self.ctx.set_location(id, Location::InMempool);
                return Ok(id);
            }
            // Live, but first seen in a prior cluster: re-record in full
            // and drop the stale id rather than let it linger forever.
            self.ctx.forget(id);
        }
        let sid = command::write_command(
            &mut self.ctx.db,
            delta,
            &Command::MempoolIn {
                subject: MempoolInSubject::Unknown(object.clone()),
            },
        )?
        .expect("mempool-in with an unknown subject always assigns an sid");
        self.ctx.register(object, sid, Location::InMempool);
        Ok(sid)
    }

    /// A transaction left the mempool, for the given `reason`.
    pub fn remove_entry(&mut self, time: u64, hash: TxHash, reason: RemoveReason) -> Result<()> {
        match reason {
            RemoveReason::Expiry => self.emit_mempool_out(time, hash, Reason::Expired),
            RemoveReason::SizeLimit => self.emit_mempool_out(time, hash, Reason::SizeLimit),
            RemoveReason::Reorg { raw } => {
                self.emit_invalidated(time, hash, Reason::Reorg, None, raw)
            }
            RemoveReason::Block => {
                if let Some(id) = self.ctx.lookup_live(&hash) {
                    self.pending_confirmed.push(id);
                }
                Ok(())
            }
            RemoveReason::Conflict { cause, raw } => {
                self.emit_invalidated(time, hash, Reason::Conflict, Some(cause), raw)
            }
            RemoveReason::Replaced { cause, raw } => {
                self.emit_invalidated(time, hash, Reason::Replaced, Some(cause), raw)
            }
            RemoveReason::Unknown { cause: Some(cause), raw } => {
                self.emit_invalidated(time, hash, Reason::Unknown, Some(cause), raw)
            }
            RemoveReason::Unknown { cause: None, .. } => {
                self.emit_mempool_out(time, hash, Reason::Unknown)
            }
        }
    }

    fn emit_mempool_out(&mut self, time: u64, hash: TxHash, reason: Reason) -> Result<()> {
        let delta = self.time_delta(time)?;
        let subject = self.subject_ref(&hash);
        command::write_command(
            &mut self.ctx.db,
            delta,
            &Command::MempoolOut {
                subject,
                reason,
                offender: None,
            },
        )?;
        if let Some(id) = self.ctx.lookup_live(&hash) {
            self.ctx.chill(id, self.current_height());
            self.ctx.set_location(id, Location::Discarded);
        }
        Ok(())
    }

    fn emit_invalidated(
        &mut self,
        time: u64,
        hash: TxHash,
        reason: Reason,
        cause: Option<TxHash>,
        raw: Vec<u8>,
    ) -> Result<()> {
        let delta = self.time_delta(time)?;
        let subject = self.subject_ref(&hash);
        let offender = cause.map(|c| self.subject_ref(&c));
        command::write_command(
            &mut self.ctx.db,
            delta,
            &Command::MempoolInvalidated {
                subject,
                reason,
                offender,
                raw,
            },
        )?;
        if let Some(id) = self.ctx.lookup_live(&hash) {
            self.ctx.freeze(id, self.current_height());
            self.ctx.set_location(id, Location::Invalid);
        }
        Ok(())
    }

    /// A block was mined at `height` with hash `hash`, containing `members`
    /// (the full set of confirmed transaction hashes — not only the ones
    /// this log had already seen in its mempool).
    pub fn push_block(
        &mut self,
        time: u64,
        height: u32,
        hash: TxHash,
        members: &[TxHash],
    ) -> Result<()> {
        let delta = self.time_delta(time)?;

        while let Some(tip) = self.ctx.chain.tip() {
            if tip < height {
                break;
            }
            self.unmine_tip(tip)?;
        }

        if let Some(tip) = self.ctx.chain.tip() {
            if height > tip + 1 {
                tracing::warn!(
                    from = tip,
                    to = height,
                    "chain gap detected at block boundary; unmining held blocks before advancing"
                );
                while let Some(gap_tip) = self.ctx.chain.tip() {
                    self.unmine_tip(gap_tip)?;
                }
            }
        }

        if self.ctx.db.registry.tip < (height.saturating_sub(1)) as u64 {
            self.ctx.db.begin_segment((height - 1) as u64)?;
        }

        // A pending id may have been assigned in a cluster that is no
        // longer open (begin_segment above can cross a boundary). Such an
        // id can never be referenced as "known" again; drop it and let the
        // hash fall through to the unknown set below, same as subject_ref.
        let mut known: std::collections::BTreeSet<u64> = std::collections::BTreeSet::new();
        for id in self.pending_confirmed.drain(..) {
            if self.ctx.is_known_in_current_cluster(id) {
                known.insert(id);
            } else {
                self.ctx.forget(id);
            }
        }
        let known_hashes: std::collections::HashSet<TxHash> = known
            .iter()
            .filter_map(|id| self.ctx.get(*id).map(|rec| rec.object.hash))
            .collect();
        let unknown: std::collections::BTreeSet<TxHash> = members
            .iter()
            .filter(|h| !known_hashes.contains(h))
            .copied()
            .collect();

        command::write_command(
            &mut self.ctx.db,
            delta,
            &Command::BlockMined {
                known: known.clone(),
                unknown: unknown.clone(),
                hash,
                height,
            },
        )?;

        self.ctx.db.begin_segment(height as u64)?;

        for id in &known {
            self.ctx.set_location(*id, Location::Confirmed);
            self.ctx.freeze(*id, height);
        }
        self.ctx.chain.push(Block::new(
            height,
            hash,
            known.into_iter().collect(),
            unknown.into_iter().collect(),
        ))?;
        self.ctx.purge_to(height);
        Ok(())
    }

    /// A previously mined block at `height` was reorged out.
    pub fn pop_block(&mut self, time: u64, height: u32) -> Result<()> {
        let delta = self.time_delta(time)?;
        command::write_command(&mut self.ctx.db, delta, &Command::BlockUnmined { height })?;
        self.restore_popped(height);
        Ok(())
    }

    fn unmine_tip(&mut self, tip_height: u32) -> Result<()> {
        command::write_command(
            &mut self.ctx.db,
            0,
            &Command::BlockUnmined {
                height: tip_height,
            },
        )?;
        self.restore_popped(tip_height);
        Ok(())
    }

    fn restore_popped(&mut self, expected_height: u32) {
        if let Some(block) = self.ctx.chain.pop() {
            debug_assert_eq!(block.height, expected_height);
            for id in &block.known {
                self.ctx.set_location(*id, Location::InMempool);
                self.ctx.thaw(*id);
            }
        }
    }

    /// Flushes the open cluster file to the operating system.
    pub fn flush(&mut self) -> Result<()> {
        self.ctx.db.flush()
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if let Err(err) = self.ctx.db.flush() {
            tracing::error!(error = %err, "final flush on writer shutdown failed");
        }
    }
}
