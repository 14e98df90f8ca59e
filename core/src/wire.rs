//! Byte-level wire primitives shared by every on-disk structure: the
//! cluster header, the registry file, and every chronology command.
//!
//! Every primitive here is a pure function over `Read`/`Write`; nothing in
//! this module touches a file directly (that is the file pager's job, in
//! the `chronoq-cq` crate).

use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::errors::{ChronoqError, Result};

/// Maximum number of continuation bytes a varint may carry before it is
/// treated as corrupt input rather than a very large number.
const MAX_VARINT_BYTES: usize = 10;

/// Writes an unsigned varint: 7 bits per byte, most-significant group
/// first, every byte but the last carrying the continuation bit (0x80),
/// each continuation byte biased by +1 on decode.
pub fn write_varint<W: Write>(w: &mut W, mut n: u64) -> Result<()> {
    let mut tmp = [0u8; MAX_VARINT_BYTES];
    let mut len = 0usize;
    loop {
        tmp[len] = (n & 0x7f) as u8 | if len != 0 { 0x80 } else { 0x00 };
        if n <= 0x7f {
            break;
        }
        n = (n >> 7) - 1;
        len += 1;
    }
    for i in (0..=len).rev() {
        w.write_all(&[tmp[i]])?;
    }
    Ok(())
}

/// Reads an unsigned varint written by [`write_varint`].
pub fn read_varint<R: Read>(r: &mut R) -> Result<u64> {
    let mut n: u64 = 0;
    for _ in 0..MAX_VARINT_BYTES {
        let mut byte = [0u8; 1];
        r.read_exact(&mut byte)?;
        let b = byte[0];
        n = (n << 7) | (b & 0x7f) as u64;
        if b & 0x80 != 0 {
            n = n
                .checked_add(1)
                .ok_or_else(|| ChronoqError::format("varint overflow"))?;
        } else {
            return Ok(n);
        }
    }
    Err(ChronoqError::format(
        "varint exceeds maximum encodable length",
    ))
}

/// Zigzag-encodes a signed value and writes it as an unsigned varint.
pub fn write_signed_varint<W: Write>(w: &mut W, n: i64) -> Result<()> {
    let zigzag = ((n << 1) ^ (n >> 63)) as u64;
    write_varint(w, zigzag)
}

/// Reads a value written by [`write_signed_varint`].
pub fn read_signed_varint<R: Read>(r: &mut R) -> Result<i64> {
    let zigzag = read_varint(r)?;
    Ok(((zigzag >> 1) as i64) ^ -((zigzag & 1) as i64))
}

/// `N` bits packed into a header byte shared with other fields; values
/// below `(1<<N)-1` are carried inline, values at or above that cap are
/// written as the cap followed by a plain varint of `value - cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CondVarint<const BITS: u8> {
    pub value: u64,
}

impl<const BITS: u8> CondVarint<BITS> {
    const CAP: u64 = (1u64 << BITS) - 1;

    pub fn new(value: u64) -> Self {
        Self { value }
    }

    /// The bits to pack into the shared header byte.
    pub fn byteval(&self) -> u8 {
        if self.value < Self::CAP {
            self.value as u8
        } else {
            Self::CAP as u8
        }
    }

    /// Writes the varint overflow tail, if any. Must be called after the
    /// header byte carrying `byteval()` has already been written.
    pub fn cond_write<W: Write>(&self, w: &mut W) -> Result<()> {
        if self.value >= Self::CAP {
            write_varint(w, self.value - Self::CAP)?;
        }
        Ok(())
    }

    /// Reconstructs the value given the bits read from the header byte,
    /// reading the varint overflow tail if the header bits equal the cap.
    pub fn cond_read<R: Read>(header_bits: u8, r: &mut R) -> Result<Self> {
        let header_bits = header_bits as u64;
        if header_bits < Self::CAP {
            Ok(Self { value: header_bits })
        } else {
            let overflow = read_varint(r)?;
            Ok(Self {
                value: Self::CAP + overflow,
            })
        }
    }
}

/// Writes a Bitcoin-style compact-size length prefix (1/3/5/9 bytes).
pub fn write_compact_size<W: Write>(w: &mut W, n: u64) -> Result<()> {
    if n < 0xfd {
        w.write_all(&[n as u8])?;
    } else if n <= 0xffff {
        w.write_all(&[0xfd])?;
        w.write_all(&(n as u16).to_le_bytes())?;
    } else if n <= 0xffff_ffff {
        w.write_all(&[0xfe])?;
        w.write_all(&(n as u32).to_le_bytes())?;
    } else {
        w.write_all(&[0xff])?;
        w.write_all(&n.to_le_bytes())?;
    }
    Ok(())
}

/// Reads a compact-size length prefix written by [`write_compact_size`].
pub fn read_compact_size<R: Read>(r: &mut R) -> Result<u64> {
    let mut first = [0u8; 1];
    r.read_exact(&mut first)?;
    Ok(match first[0] {
        0xfd => {
            let mut buf = [0u8; 2];
            r.read_exact(&mut buf)?;
            u16::from_le_bytes(buf) as u64
        }
        0xfe => {
            let mut buf = [0u8; 4];
            r.read_exact(&mut buf)?;
            u32::from_le_bytes(buf) as u64
        }
        0xff => {
            let mut buf = [0u8; 8];
            r.read_exact(&mut buf)?;
            u64::from_le_bytes(buf)
        }
        n => n as u64,
    })
}

/// Writes a length-prefixed byte blob (`compact-size` then raw bytes).
pub fn write_blob<W: Write>(w: &mut W, bytes: &[u8]) -> Result<()> {
    write_compact_size(w, bytes.len() as u64)?;
    w.write_all(bytes)?;
    Ok(())
}

/// Reads a blob written by [`write_blob`].
pub fn read_blob<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = read_compact_size(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Writes a raw 32-byte hash.
pub fn write_hash<W: Write>(w: &mut W, hash: &[u8; 32]) -> Result<()> {
    w.write_all(hash)?;
    Ok(())
}

/// Reads a raw 32-byte hash.
pub fn read_hash<R: Read>(r: &mut R) -> Result<[u8; 32]> {
    let mut buf = [0u8; 32];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// An efficiently encoded ordered map linking two increasing sequences:
/// the segment-id -> file-offset index in a cluster header. Both the key
/// sequence and the value sequence are expected to be increasing, so each
/// successive key/value is stored as a delta from its predecessor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Incmap {
    pub map: BTreeMap<u64, u64>,
}

impl Incmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        write_varint(w, self.map.len() as u64)?;
        let mut prev_key = 0u64;
        for key in self.map.keys() {
            write_varint(w, key - prev_key)?;
            prev_key = *key;
        }
        let mut prev_val = 0u64;
        for val in self.map.values() {
            write_varint(w, val - prev_val)?;
            prev_val = *val;
        }
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        let count = read_varint(r)? as usize;
        let mut keys = Vec::with_capacity(count);
        let mut key = 0u64;
        for _ in 0..count {
            key += read_varint(r)?;
            keys.push(key);
        }
        let mut map = BTreeMap::new();
        let mut val = 0u64;
        for k in keys {
            val += read_varint(r)?;
            map.insert(k, val);
        }
        Ok(Self { map })
    }
}

/// A delta-encoded ordered set of ids, used by the registry's cluster-index
/// set (no associated values, unlike [`Incmap`]).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdSet {
    pub ids: std::collections::BTreeSet<u64>,
}

impl IdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        write_varint(w, self.ids.len() as u64)?;
        let mut prev = 0u64;
        for id in &self.ids {
            write_varint(w, id - prev)?;
            prev = *id;
        }
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        let count = read_varint(r)? as usize;
        let mut ids = std::collections::BTreeSet::new();
        let mut id = 0u64;
        for _ in 0..count {
            id += read_varint(r)?;
            ids.insert(id);
        }
        Ok(Self { ids })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip_varint(n: u64) -> u64 {
        let mut buf = Vec::new();
        write_varint(&mut buf, n).unwrap();
        read_varint(&mut &buf[..]).unwrap()
    }

    #[test]
    fn varint_round_trips_small_and_large() {
        for n in [0u64, 1, 2, 127, 128, 129, 16383, 16384, u32::MAX as u64, u64::MAX / 2] {
            assert_eq!(round_trip_varint(n), n, "failed for {n}");
        }
    }

    #[test]
    fn varint_two_byte_decode_matches_spec_formula() {
        // header byte b0 with continuation bit set, trailer byte b1.
        let mut buf = Vec::new();
        write_varint(&mut buf, 200).unwrap();
        assert_eq!(buf.len(), 2);
        let b0 = buf[0];
        let b1 = buf[1];
        let decoded = ((b0 & 0x7f) as u64 + 1) << 7 | (b1 & 0x7f) as u64;
        assert_eq!(decoded, 200);
    }

    #[test]
    fn signed_varint_round_trips_negative_and_positive() {
        for n in [0i64, 1, -1, 2, -2, i32::MAX as i64, i32::MIN as i64] {
            let mut buf = Vec::new();
            write_signed_varint(&mut buf, n).unwrap();
            let got = read_signed_varint(&mut &buf[..]).unwrap();
            assert_eq!(got, n);
        }
    }

    #[test]
    fn cond_varint_inline_values_need_no_overflow_tail() {
        let cv = CondVarint::<4>::new(5);
        assert_eq!(cv.byteval(), 5);
        let mut buf = Vec::new();
        cv.cond_write(&mut buf).unwrap();
        assert!(buf.is_empty());
        let back = CondVarint::<4>::cond_read(5, &mut &buf[..]).unwrap();
        assert_eq!(back.value, 5);
    }

    #[test]
    fn cond_varint_overflow_values_carry_a_varint_tail() {
        let cv = CondVarint::<4>::new(100);
        assert_eq!(cv.byteval(), 15);
        let mut buf = Vec::new();
        cv.cond_write(&mut buf).unwrap();
        assert!(!buf.is_empty());
        let back = CondVarint::<4>::cond_read(15, &mut &buf[..]).unwrap();
        assert_eq!(back.value, 100);
    }

    #[test]
    fn compact_size_round_trips_each_width_boundary() {
        for n in [0u64, 0xfc, 0xfd, 0xffff, 0x1_0000, 0xffff_ffff, 0x1_0000_0000] {
            let mut buf = Vec::new();
            write_compact_size(&mut buf, n).unwrap();
            let got = read_compact_size(&mut &buf[..]).unwrap();
            assert_eq!(got, n, "failed for {n}");
        }
    }

    #[test]
    fn blob_round_trips() {
        let data = b"hello chronology".to_vec();
        let mut buf = Vec::new();
        write_blob(&mut buf, &data).unwrap();
        let got = read_blob(&mut &buf[..]).unwrap();
        assert_eq!(got, data);
    }

    #[test]
    fn incmap_round_trips_increasing_sequences() {
        let mut im = Incmap::new();
        im.map.insert(5, 100);
        im.map.insert(10, 250);
        im.map.insert(2016, 9000);
        let mut buf = Vec::new();
        im.write(&mut buf).unwrap();
        let got = Incmap::read(&mut &buf[..]).unwrap();
        assert_eq!(got, im);
    }

    #[test]
    fn id_set_round_trips() {
        let mut set = IdSet::new();
        for id in [0u64, 1, 2, 5, 100] {
            set.ids.insert(id);
        }
        let mut buf = Vec::new();
        set.write(&mut buf).unwrap();
        let got = IdSet::read(&mut &buf[..]).unwrap();
        assert_eq!(got, set);
    }

    #[quickcheck_macros::quickcheck]
    fn varint_round_trips_any_u64(n: u64) -> bool {
        round_trip_varint(n) == n
    }

    #[quickcheck_macros::quickcheck]
    fn signed_varint_round_trips_any_i64(n: i64) -> bool {
        let mut buf = Vec::new();
        write_signed_varint(&mut buf, n).unwrap();
        read_signed_varint(&mut &buf[..]).unwrap() == n
    }

    #[quickcheck_macros::quickcheck]
    fn compact_size_round_trips_any_u64(n: u64) -> bool {
        let mut buf = Vec::new();
        write_compact_size(&mut buf, n).unwrap();
        read_compact_size(&mut &buf[..]).unwrap() == n
    }

    proptest::proptest! {
        #[test]
        fn incmap_round_trips_arbitrary_increasing_pairs(
            keys in proptest::collection::vec(0u64..10_000, 0..50),
            vals in proptest::collection::vec(0u64..10_000, 0..50),
        ) {
            let mut sorted_keys: Vec<u64> = keys;
            sorted_keys.sort_unstable();
            sorted_keys.dedup();
            let mut sorted_vals: Vec<u64> = vals;
            sorted_vals.sort_unstable();
            sorted_vals.dedup();

            let mut im = Incmap::new();
            for (k, v) in sorted_keys.iter().zip(sorted_vals.iter()) {
                im.map.insert(*k, *v);
            }

            let mut buf = Vec::new();
            im.write(&mut buf).unwrap();
            let got = Incmap::read(&mut &buf[..]).unwrap();
            prop_assert_eq!(got, im);
        }

        #[test]
        fn id_set_round_trips_arbitrary_sets(ids in proptest::collection::vec(0u64..10_000, 0..50)) {
            let mut set = IdSet::new();
            for id in ids {
                set.ids.insert(id);
            }
            let mut buf = Vec::new();
            set.write(&mut buf).unwrap();
            let got = IdSet::read(&mut &buf[..]).unwrap();
            prop_assert_eq!(got, set);
        }
    }
}
