//! The opaque 32-byte transaction/block identifier used throughout the log.

use std::fmt;

use crate::errors::Result;
use crate::wire;

/// An opaque 32-byte identifier. Equality is byte-equality; there is no
/// notion of hashing-the-preimage anywhere in this crate family — hashes
/// arrive pre-computed from the mempool mirror's collaborators.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxHash(pub [u8; 32]);

impl TxHash {
    pub const ZERO: TxHash = TxHash([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn write<W: std::io::Write>(&self, w: &mut W) -> Result<()> {
        wire::write_hash(w, &self.0)
    }

    pub fn read<R: std::io::Read>(r: &mut R) -> Result<Self> {
        Ok(TxHash(wire::read_hash(r)?))
    }
}

impl From<[u8; 32]> for TxHash {
    fn from(bytes: [u8; 32]) -> Self {
        TxHash(bytes)
    }
}

impl AsRef<[u8; 32]> for TxHash {
    fn as_ref(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({})", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_lowercase_hex() {
        let h = TxHash([0xabu8; 32]);
        assert_eq!(h.to_string(), "ab".repeat(32));
    }

    #[test]
    fn round_trips_through_wire() {
        let h = TxHash([7u8; 32]);
        let mut buf = Vec::new();
        h.write(&mut buf).unwrap();
        let h2 = TxHash::read(&mut &buf[..]).unwrap();
        assert_eq!(h, h2);
    }
}
