//! Process-wide metadata: the cluster-size constant, the set of existing
//! cluster indices, and the id of the most recently opened segment.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chronoq_core::errors::Result;
use chronoq_core::wire::{self, IdSet};

pub const REGISTRY_FILE_NAME: &str = "cq.registry";

/// The `<dbpath>/cq.registry` file: cluster-size constant plus the set of
/// existing cluster indices. The registry tip is *derived* from the
/// cluster set on load, not stored directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry {
    pub cluster_size: u32,
    pub clusters: IdSet,
    /// The highest existing cluster index, or 0 if no cluster has been
    /// opened yet. Resuming a write session looks up the segment range
    /// for this cluster via [`Registry::open_cluster_for_segment`].
    pub tip: u64,
}

impl Registry {
    pub fn new(cluster_size: u32) -> Self {
        Self {
            cluster_size,
            clusters: IdSet::new(),
            tip: 0,
        }
    }

    pub fn registry_path(dbpath: impl AsRef<Path>) -> PathBuf {
        dbpath.as_ref().join(REGISTRY_FILE_NAME)
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.cluster_size.to_le_bytes())?;
        self.clusters.write(w)?;
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf)?;
        let cluster_size = u32::from_le_bytes(buf);
        let clusters = IdSet::read(r)?;
        let tip = clusters.ids.iter().next_back().copied().unwrap_or(0);
        Ok(Self {
            cluster_size,
            clusters,
            tip,
        })
    }

    /// Returns `floor(segment_id / cluster_size)`, recording the resulting
    /// cluster index in the cluster set and advancing `tip`.
    pub fn open_cluster_for_segment(&mut self, segment_id: u64) -> u64 {
        let cluster = segment_id / self.cluster_size as u64;
        self.clusters.ids.insert(cluster);
        if segment_id > self.tip {
            self.tip = segment_id;
        }
        cluster
    }

    pub fn cluster_for_segment(&self, segment_id: u64) -> u64 {
        segment_id / self.cluster_size as u64
    }
}

/// Per-cluster metadata: magic, version, start timestamp, and the
/// segment-id -> byte-offset index. Doubles as both the "header" consulted
/// while a cluster is being written and the "footer" read back when the
/// cluster is later reopened — the spec's names for the same structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub cluster: u64,
    pub version: u8,
    pub timestamp_start: u64,
    pub segments: wire::Incmap,
}

const MAGIC: [u8; 2] = [b'C', b'Q'];

impl Header {
    pub fn new(cluster: u64, version: u8, timestamp_start: u64) -> Self {
        Self {
            cluster,
            version,
            timestamp_start,
            segments: wire::Incmap::new(),
        }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&MAGIC)?;
        w.write_all(&[self.version])?;
        w.write_all(&self.timestamp_start.to_le_bytes())?;
        self.segments.write(w)?;
        Ok(())
    }

    pub fn read<R: Read>(cluster: u64, r: &mut R) -> Result<Self> {
        let mut magic = [0u8; 2];
        r.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(chronoq_core::errors::ChronoqError::format(format!(
                "magic invalid (expected \"CQ\", got {:?})",
                magic
            )));
        }
        let mut version = [0u8; 1];
        r.read_exact(&mut version)?;
        let mut ts = [0u8; 8];
        r.read_exact(&mut ts)?;
        let segments = wire::Incmap::read(r)?;
        Ok(Self {
            cluster,
            version: version[0],
            timestamp_start: u64::from_le_bytes(ts),
            segments,
        })
    }

    pub fn mark_segment(&mut self, segment: u64, position: u64) {
        self.segments.map.insert(segment, position);
    }

    pub fn segment_position(&self, segment: u64) -> Option<u64> {
        self.segments.map.get(&segment).copied()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.map.len()
    }

    pub fn first_segment(&self) -> Option<u64> {
        self.segments.map.keys().next().copied()
    }

    pub fn last_segment(&self) -> Option<u64> {
        self.segments.map.keys().next_back().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_round_trips() {
        let mut reg = Registry::new(2016);
        reg.open_cluster_for_segment(0);
        reg.open_cluster_for_segment(4032);
        let mut buf = Vec::new();
        reg.write(&mut buf).unwrap();
        let got = Registry::read(&mut &buf[..]).unwrap();
        assert_eq!(got.cluster_size, 2016);
        assert_eq!(got.clusters.ids, reg.clusters.ids);
        assert_eq!(got.tip, 2);
    }

    #[test]
    fn empty_registry_has_zero_tip() {
        let reg = Registry::new(2016);
        let mut buf = Vec::new();
        reg.write(&mut buf).unwrap();
        let got = Registry::read(&mut &buf[..]).unwrap();
        assert_eq!(got.tip, 0);
    }

    #[test]
    fn header_round_trips_with_segments() {
        let mut h = Header::new(0, 1, 1_558_000_000);
        h.mark_segment(500_000, 128);
        h.mark_segment(500_001, 4096);
        let mut buf = Vec::new();
        h.write(&mut buf).unwrap();
        let got = Header::read(0, &mut &buf[..]).unwrap();
        assert_eq!(got, h);
    }

    #[test]
    fn header_rejects_bad_magic() {
        let buf = [0u8, 0u8, 1u8, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let err = Header::read(0, &mut &buf[..]).unwrap_err();
        assert!(matches!(err, chronoq_core::errors::ChronoqError::Format(_)));
    }

    #[test]
    fn open_cluster_for_segment_divides_by_cluster_size() {
        let mut reg = Registry::new(2016);
        assert_eq!(reg.open_cluster_for_segment(0), 0);
        assert_eq!(reg.open_cluster_for_segment(2015), 0);
        assert_eq!(reg.open_cluster_for_segment(2016), 1);
        assert_eq!(reg.open_cluster_for_segment(4033), 2);
    }
}
