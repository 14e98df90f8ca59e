//! The recorded transaction object and its outpoint references — the unit
//! the object store first writes in full and subsequently refers to by id.

use chronoq_core::errors::Result;
use chronoq_core::hash::TxHash;
use chronoq_core::wire;
use chronoq_cq::store::Db;

/// The state an input's prevout is known in, at the moment its owning
/// transaction was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutpointState {
    /// Referenced by hash only; the spending transaction has never been seen.
    Unknown,
    /// Referenced by a previously assigned object id, live in this log.
    Known,
    /// Both the hash and the spending output are already part of the chain.
    Confirmed,
    /// No prior transaction; this input mints new value.
    Coinbase,
}

impl OutpointState {
    fn to_byte(self) -> u8 {
        match self {
            OutpointState::Unknown => 0,
            OutpointState::Known => 1,
            OutpointState::Confirmed => 2,
            OutpointState::Coinbase => 3,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            0 => OutpointState::Unknown,
            1 => OutpointState::Known,
            2 => OutpointState::Confirmed,
            3 => OutpointState::Coinbase,
            other => {
                return Err(chronoq_core::errors::ChronoqError::format(format!(
                    "impossible outpoint state byte {other}"
                )))
            }
        })
    }
}

/// One spent output. `output_index` is the index within the previous
/// transaction's output vector; absent for confirmed/coinbase inputs, which
/// carry no further identifying data once the chain already accounts for
/// them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outpoint {
    Unknown { output_index: u64, input_hash: TxHash },
    Known { output_index: u64, input_sid: u64 },
    Confirmed,
    Coinbase,
}

impl Outpoint {
    pub fn state(&self) -> OutpointState {
        match self {
            Outpoint::Unknown { .. } => OutpointState::Unknown,
            Outpoint::Known { .. } => OutpointState::Known,
            Outpoint::Confirmed => OutpointState::Confirmed,
            Outpoint::Coinbase => OutpointState::Coinbase,
        }
    }
}

/// A fully recorded transaction. `sid` is populated by the object store on
/// `store()`/`load()`/`fetch()`; it is never part of the wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxObject {
    pub hash: TxHash,
    pub weight: u64,
    pub fee: u64,
    pub inputs: Vec<Outpoint>,
    pub outputs: Vec<u64>,
    pub sid: u64,
}

impl TxObject {
    pub fn new(hash: TxHash, weight: u64, fee: u64, inputs: Vec<Outpoint>, outputs: Vec<u64>) -> Self {
        Self {
            hash,
            weight,
            fee,
            inputs,
            outputs,
            sid: 0,
        }
    }

    pub fn vsize(&self) -> u64 {
        (self.weight + 3) / 4
    }
}

/// Writes a transaction in full at the database's current position and
/// returns the `sid` (byte offset) it was stored at — the value later
/// callers pass to [`fetch`] or hand out to other transactions' `Known`
/// inputs. `Known` inputs are not written as raw sids: each goes through
/// `db.refer`, which encodes it as a varint delta from this write's own
/// position, the same machinery top-level command framing uses.
pub fn store(db: &mut Db, tx: &TxObject) -> Result<u64> {
    let sid = db.tell()?;
    tx.hash.write(db)?;
    wire::write_varint(db, tx.weight)?;
    wire::write_varint(db, tx.fee)?;
    wire::write_compact_size(db, tx.inputs.len() as u64)?;
    for input in &tx.inputs {
        std::io::Write::write_all(db, &[input.state().to_byte()])?;
        match input {
            Outpoint::Unknown {
                output_index,
                input_hash,
            } => {
                wire::write_compact_size(db, *output_index)?;
                input_hash.write(db)?;
            }
            Outpoint::Known {
                output_index,
                input_sid,
            } => {
                wire::write_compact_size(db, *output_index)?;
                db.refer(*input_sid)?;
            }
            Outpoint::Confirmed | Outpoint::Coinbase => {}
        }
    }
    wire::write_compact_size(db, tx.outputs.len() as u64)?;
    for amount in &tx.outputs {
        wire::write_varint(db, *amount)?;
    }
    Ok(sid)
}

/// Reads a transaction starting at the database's current position,
/// returning the sid it was read from alongside the object. `Known` inputs
/// are resolved via `db.derefer`, which turns the on-disk delta back into
/// an absolute sid relative to wherever this read's header byte sat.
pub fn load(db: &mut Db) -> Result<(u64, TxObject)> {
    let sid = db.tell()?;
    let hash = TxHash::read(db)?;
    let weight = wire::read_varint(db)?;
    let fee = wire::read_varint(db)?;
    let input_count = wire::read_compact_size(db)? as usize;
    let mut inputs = Vec::with_capacity(input_count);
    for _ in 0..input_count {
        let mut state_byte = [0u8; 1];
        std::io::Read::read_exact(db, &mut state_byte)?;
        let state = OutpointState::from_byte(state_byte[0])?;
        let outpoint = match state {
            OutpointState::Unknown => {
                let output_index = wire::read_compact_size(db)?;
                let input_hash = TxHash::read(db)?;
                Outpoint::Unknown {
                    output_index,
                    input_hash,
                }
            }
            OutpointState::Known => {
                let output_index = wire::read_compact_size(db)?;
                let input_sid = db.derefer()?;
                Outpoint::Known {
                    output_index,
                    input_sid,
                }
            }
            OutpointState::Confirmed => Outpoint::Confirmed,
            OutpointState::Coinbase => Outpoint::Coinbase,
        };
        inputs.push(outpoint);
    }
    let output_count = wire::read_compact_size(db)? as usize;
    let mut outputs = Vec::with_capacity(output_count);
    for _ in 0..output_count {
        outputs.push(wire::read_varint(db)?);
    }
    Ok((
        sid,
        TxObject {
            hash,
            weight,
            fee,
            inputs,
            outputs,
            sid,
        },
    ))
}

/// Reads the transaction stored at `sid`, restoring the database's
/// position afterward — mirrors `Db::fetch`'s save/seek/restore pattern,
/// but for the bespoke (non-`WireRecord`) encoding transactions need.
pub fn fetch(db: &mut Db, sid: u64) -> Result<TxObject> {
    let saved = db.tell()?;
    db.seek_to(sid)?;
    let (_, tx) = load(db)?;
    db.seek_to(saved)?;
    Ok(tx)
}
