//! Chronology: the time-relative six-command wire protocol that sits on
//! top of the object store. Knows nothing of dictionaries or the chain
//! mirror — `Ref::Known` carries a bare object id, resolved one layer up.

use std::collections::BTreeSet;
use std::io::{Read, Write};

use chronoq_core::errors::{ChronoqError, Result};
use chronoq_core::hash::TxHash;
use chronoq_core::wire;
use chronoq_cq::store::Db;

use crate::object::{self, TxObject};

const OPCODE_TIME_SET: u8 = 0;
const OPCODE_MEMPOOL_IN: u8 = 1;
const OPCODE_MEMPOOL_OUT: u8 = 2;
const OPCODE_MEMPOOL_INVALIDATED: u8 = 3;
const OPCODE_BLOCK_MINED: u8 = 4;
const OPCODE_BLOCK_UNMINED: u8 = 5;

/// Legacy low-5-bits pattern from an earlier design iteration: a time-set
/// shaped byte with the offender-present bit spuriously set. Tolerated on
/// read, never emitted.
const GAP_MARKER: u8 = 0x08;

/// The reason a transaction left the mempool, shared by `mempool-out` and
/// `mempool-invalidated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    Unknown = 0,
    Expired = 1,
    SizeLimit = 2,
    Reorg = 3,
    Conflict = 4,
    Replaced = 5,
}

impl Reason {
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            0 => Reason::Unknown,
            1 => Reason::Expired,
            2 => Reason::SizeLimit,
            3 => Reason::Reorg,
            4 => Reason::Conflict,
            5 => Reason::Replaced,
            other => return Err(ChronoqError::format(format!("impossible reason byte {other}"))),
        })
    }
}

/// A subject or offender reference: a previously stored object's id
/// (encoded as a delta against the command's own position) or a bare hash
/// for a transaction this log never recorded in full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ref {
    Known(u64),
    Unknown(TxHash),
}

impl Ref {
    pub fn is_known(&self) -> bool {
        matches!(self, Ref::Known(_))
    }

    fn write(&self, db: &mut Db) -> Result<()> {
        match self {
            Ref::Known(id) => db.refer(*id),
            Ref::Unknown(hash) => hash.write(db),
        }
    }

    fn read(db: &mut Db, known: bool) -> Result<Self> {
        if known {
            Ok(Ref::Known(db.derefer()?))
        } else {
            Ok(Ref::Unknown(TxHash::read(db)?))
        }
    }
}

/// The subject of a `mempool-in` event: either a reappearance of an
/// already-recorded object, or a brand-new one written in full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MempoolInSubject {
    Known(u64),
    Unknown(TxObject),
}

/// One decoded chronology command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    TimeSet,
    MempoolIn {
        subject: MempoolInSubject,
    },
    MempoolOut {
        subject: Ref,
        reason: Reason,
        offender: Option<Ref>,
    },
    MempoolInvalidated {
        subject: Ref,
        reason: Reason,
        offender: Option<Ref>,
        raw: Vec<u8>,
    },
    BlockMined {
        known: BTreeSet<u64>,
        unknown: BTreeSet<TxHash>,
        hash: TxHash,
        height: u32,
    },
    BlockUnmined {
        height: u32,
    },
    /// Tolerated-but-never-emitted legacy no-op.
    Gap,
}

fn time_bits(delta: u64) -> u8 {
    match delta {
        0 => 0b00,
        1 => 0b01,
        2 => 0b10,
        _ => 0b11,
    }
}

fn write_time_tail(db: &mut Db, delta: u64) -> Result<()> {
    if delta > 2 {
        wire::write_varint(db, delta)?;
    }
    Ok(())
}

fn read_time_tail(db: &mut Db, bits: u8) -> Result<u64> {
    Ok(match bits {
        0b00 => 0,
        0b01 => 1,
        0b10 => 2,
        _ => wire::read_varint(db)?,
    })
}

/// Writes one command at the database's current position, given the
/// elapsed whole seconds since the previous command's timestamp. Returns
/// the sid a freshly-recorded object was assigned, if this command wrote
/// one in full (only `mempool-in` with an unknown subject does).
pub fn write_command(db: &mut Db, delta: u64, command: &Command) -> Result<Option<u64>> {
    let tbits = time_bits(delta);
    let mut assigned_sid = None;

    match command {
        Command::TimeSet => {
            let header = (tbits << 6) | OPCODE_TIME_SET;
            Write::write_all(db, &[header])?;
            write_time_tail(db, delta)?;
        }
        Command::MempoolIn { subject } => {
            let known = matches!(subject, MempoolInSubject::Known(_));
            let header = (tbits << 6) | if known { 0x20 } else { 0 } | OPCODE_MEMPOOL_IN;
            Write::write_all(db, &[header])?;
            write_time_tail(db, delta)?;
            match subject {
                MempoolInSubject::Known(id) => {
                    db.refer(*id)?;
                }
                MempoolInSubject::Unknown(obj) => {
                    assigned_sid = Some(object::store(db, obj)?);
                }
            }
        }
        Command::MempoolOut {
            subject,
            reason,
            offender,
        } => {
            let header = mempool_out_header(tbits, OPCODE_MEMPOOL_OUT, subject, offender);
            Write::write_all(db, &[header])?;
            write_time_tail(db, delta)?;
            subject.write(db)?;
            Write::write_all(db, &[reason.to_byte()])?;
            if let Some(off) = offender {
                off.write(db)?;
            }
        }
        Command::MempoolInvalidated {
            subject,
            reason,
            offender,
            raw,
        } => {
            let header = mempool_out_header(tbits, OPCODE_MEMPOOL_INVALIDATED, subject, offender);
            Write::write_all(db, &[header])?;
            write_time_tail(db, delta)?;
            subject.write(db)?;
            Write::write_all(db, &[reason.to_byte()])?;
            if let Some(off) = offender {
                off.write(db)?;
            }
            wire::write_blob(db, raw)?;
        }
        Command::BlockMined {
            known,
            unknown,
            hash,
            height,
        } => {
            let header = (tbits << 6) | OPCODE_BLOCK_MINED;
            Write::write_all(db, &[header])?;
            write_time_tail(db, delta)?;
            let known_vec: Vec<u64> = known.iter().copied().collect();
            let unknown_vec: Vec<TxHash> = unknown.iter().copied().collect();
            db.refer_multi(&known_vec, &unknown_vec)?;
            hash.write(db)?;
            Write::write_all(db, &height.to_le_bytes())?;
        }
        Command::BlockUnmined { height } => {
            let header = (tbits << 6) | OPCODE_BLOCK_UNMINED;
            Write::write_all(db, &[header])?;
            write_time_tail(db, delta)?;
            Write::write_all(db, &height.to_le_bytes())?;
        }
        Command::Gap => {
            let header = (tbits << 6) | GAP_MARKER;
            Write::write_all(db, &[header])?;
            write_time_tail(db, delta)?;
        }
    }
    Ok(assigned_sid)
}

fn mempool_out_header(tbits: u8, opcode: u8, subject: &Ref, offender: &Option<Ref>) -> u8 {
    let known = subject.is_known();
    let off_present = offender.is_some();
    let off_known = offender.as_ref().map(Ref::is_known).unwrap_or(false);
    let mut low5 = opcode;
    if off_present {
        low5 |= 0x08;
    }
    if off_known {
        low5 |= 0x10;
    }
    (tbits << 6) | if known { 0x20 } else { 0 } | low5
}

/// Reads one command from the database's current position, returning it
/// alongside the time delta (whole seconds) it carried.
pub fn read_command(db: &mut Db) -> Result<(Command, u64)> {
    let mut header_byte = [0u8; 1];
    Read::read_exact(db, &mut header_byte)?;
    let header = header_byte[0];
    let tbits = (header >> 6) & 0x03;
    let known = (header & 0x20) != 0;
    let low5 = header & 0x1f;

    if low5 == GAP_MARKER {
        let delta = read_time_tail(db, tbits)?;
        tracing::debug!("tolerated legacy gap marker in chronology stream");
        return Ok((Command::Gap, delta));
    }

    let opcode = low5 & 0x07;
    let off_present = (low5 & 0x08) != 0;
    let off_known = (low5 & 0x10) != 0;

    let delta = read_time_tail(db, tbits)?;

    let command = match opcode {
        OPCODE_TIME_SET => Command::TimeSet,
        OPCODE_MEMPOOL_IN => {
            let subject = if known {
                MempoolInSubject::Known(db.derefer()?)
            } else {
                let (_, obj) = object::load(db)?;
                MempoolInSubject::Unknown(obj)
            };
            Command::MempoolIn { subject }
        }
        OPCODE_MEMPOOL_OUT => {
            let subject = Ref::read(db, known)?;
            let mut reason_byte = [0u8; 1];
            Read::read_exact(db, &mut reason_byte)?;
            let reason = Reason::from_byte(reason_byte[0])?;
            let offender = if off_present {
                Some(Ref::read(db, off_known)?)
            } else {
                None
            };
            Command::MempoolOut {
                subject,
                reason,
                offender,
            }
        }
        OPCODE_MEMPOOL_INVALIDATED => {
            let subject = Ref::read(db, known)?;
            let mut reason_byte = [0u8; 1];
            Read::read_exact(db, &mut reason_byte)?;
            let reason = Reason::from_byte(reason_byte[0])?;
            let offender = if off_present {
                Some(Ref::read(db, off_known)?)
            } else {
                None
            };
            let raw = wire::read_blob(db)?;
            Command::MempoolInvalidated {
                subject,
                reason,
                offender,
                raw,
            }
        }
        OPCODE_BLOCK_MINED => {
            let (known_ids, unknown_hashes) = db.derefer_multi()?;
            let hash = TxHash::read(db)?;
            let mut height_bytes = [0u8; 4];
            Read::read_exact(db, &mut height_bytes)?;
            let height = u32::from_le_bytes(height_bytes);
            Command::BlockMined {
                known: known_ids,
                unknown: unknown_hashes,
                hash,
                height,
            }
        }
        OPCODE_BLOCK_UNMINED => {
            let mut height_bytes = [0u8; 4];
            Read::read_exact(db, &mut height_bytes)?;
            let height = u32::from_le_bytes(height_bytes);
            Command::BlockUnmined { height }
        }
        other => return Err(ChronoqError::format(format!("impossible command opcode {other}"))),
    };
    Ok((command, delta))
}
