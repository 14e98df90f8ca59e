//! The object store / cluster database: ties the file pager and the
//! registry together, assigning ids by byte offset and writing/reading the
//! per-cluster segment index.
//!
//! A note on where a cluster's segment index physically lives: the index
//! for cluster `C` is only fully known once cluster `C` stops being
//! written to (rewriting a growing index in place at the head of an
//! append-only file would shift every byte offset recorded after it, which
//! would invalidate every `sid` handed out so far). So the index
//! accumulates in memory while `C` is the open cluster, tagged for cluster
//! `C+1`, and is flushed to the *start* of cluster `C+1`'s file at the
//! moment the writer transitions into it — which is also why reading back
//! cluster `C`'s index means opening cluster `C+1`'s file.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chronoq_core::errors::{ChronoqError, Result};
use chronoq_core::hash::TxHash;
use chronoq_core::wire::{self, CondVarint};
use chronoq_core::Config;

use crate::pager::Pager;
use crate::registry::{Header, Registry};

/// Anything the object store can write/read at a byte offset. Identity
/// (hash, live/purged status) is owned by the caller's dictionaries, not
/// by this trait — the store only knows how to place bytes on disk.
pub trait WireRecord: Sized {
    fn write<W: Write>(&self, w: &mut W) -> Result<()>;
    fn read<R: Read>(r: &mut R) -> Result<Self>;
}

pub struct Db {
    dbpath: PathBuf,
    prefix: String,
    cluster: u64,
    pub registry: Registry,
    /// Segment index being built for `cluster`, tagged `cluster + 1`.
    accumulating: Header,
    readonly: bool,
    pager: Option<Pager>,
    flush_interval: Duration,
}

impl Db {
    /// Opens an existing database directory or creates a fresh one.
    pub fn open_or_create(
        dbpath: impl AsRef<Path>,
        prefix: impl Into<String>,
        config: &Config,
    ) -> Result<Self> {
        let dbpath = dbpath.as_ref().to_path_buf();
        let prefix = prefix.into();
        let existed = dbpath.exists();
        std::fs::create_dir_all(&dbpath)?;

        let mut registry = Registry::new(config.cluster_size);
        let mut cluster = 0u64;
        if existed {
            let reg_path = Registry::registry_path(&dbpath);
            if reg_path.exists() {
                let mut f = File::open(&reg_path)?;
                registry = Registry::read(&mut f)?;
                // Registry::read derives `tip` from the cluster-index set
                // (the only thing the registry file persists), so it is
                // already a cluster index here, not a segment id — unlike
                // the value `open_cluster_for_segment` stores in `tip`
                // during a live session. Dividing it by `cluster_size`
                // again would collapse any restart past cluster 0 back to
                // cluster 0.
                cluster = registry.tip;
            }
        }

        Ok(Self {
            accumulating: Header::new(cluster + 1, 1, 0),
            dbpath,
            prefix,
            cluster,
            registry,
            readonly: true,
            pager: None,
            flush_interval: Duration::from_secs(config.flush_interval_secs),
        })
    }

    pub fn cluster_path(&self, cluster: u64) -> PathBuf {
        self.dbpath.join(format!("{}{:05}.cq", self.prefix, cluster))
    }

    fn write_registry(&self) -> Result<()> {
        let mut f = File::create(Registry::registry_path(&self.dbpath))?;
        self.registry.write(&mut f)
    }

    fn pager_mut(&mut self) -> Result<&mut Pager> {
        self.pager
            .as_mut()
            .ok_or_else(|| ChronoqError::invariant("no cluster file is currently open"))
    }

    /// Positions the writer on the registry's current tip cluster, open
    /// for append. Fails if no segment has ever been begun.
    ///
    /// Uses `self.cluster` rather than re-deriving from `self.registry.tip`:
    /// the latter is only a true segment id while a live session has called
    /// `begin_segment` at least once, and is otherwise the cluster index
    /// `Registry::read` derived from the persisted cluster set (dividing
    /// that by `cluster_size` again would collapse any restart past cluster
    /// 0 back to cluster 0). `self.cluster` is set to the right value by
    /// `open_or_create` in both cases and kept current thereafter.
    pub fn resume(&mut self) -> Result<()> {
        if self.registry.clusters.ids.is_empty() {
            return Err(ChronoqError::invariant(
                "initial segment must be begun before writing",
            ));
        }
        self.open_for_write(self.cluster)
    }

    fn open_for_write(&mut self, cluster: u64) -> Result<()> {
        if self.pager.is_some() && self.cluster == cluster && !self.readonly {
            return Ok(());
        }
        self.pager = None;
        let path = self.cluster_path(cluster);
        let mut pager = Pager::open_read_write(&path, self.flush_interval)?;
        if pager.empty()? {
            let placeholder = Header::new(cluster, 1, 0);
            placeholder.write(&mut pager)?;
        }
        self.cluster = cluster;
        self.readonly = false;
        self.pager = Some(pager);
        self.accumulating = Header::new(cluster + 1, 1, 0);
        Ok(())
    }

    fn open_for_read(&mut self, cluster: u64) -> Result<()> {
        if self.pager.is_some() && self.cluster == cluster && self.readonly {
            return Ok(());
        }
        self.pager = None;
        let pager = Pager::open_readonly(self.cluster_path(cluster))?;
        self.cluster = cluster;
        self.readonly = true;
        self.pager = Some(pager);
        Ok(())
    }

    /// Flushes the in-memory segment map accumulated for `self.cluster`
    /// into the start of `new_cluster`'s file, before anything else is
    /// written there.
    fn flush_accumulating_into(&self, new_cluster: u64) -> Result<()> {
        let path = self.cluster_path(new_cluster);
        let mut f = File::create(&path)?;
        self.accumulating.write(&mut f)
    }

    /// The finalized segment-map index for `cluster`: either the live,
    /// in-memory map this instance is still building (if `cluster` is the
    /// one currently open for writing), or the map previously flushed into
    /// `cluster + 1`'s file.
    pub fn segment_header(&mut self, cluster: u64) -> Result<Header> {
        if !self.readonly && self.cluster == cluster {
            return Ok(self.accumulating.clone());
        }
        let next_path = self.cluster_path(cluster + 1);
        if next_path.exists() {
            let mut f = File::open(&next_path)?;
            Header::read(cluster, &mut f)
        } else {
            Ok(Header::new(cluster, 1, 0))
        }
    }

    /// Begins a new segment at `segment_id`, opening/creating clusters and
    /// flushing the prior cluster's index as needed. Returns the byte
    /// offset recorded for this segment.
    pub fn begin_segment(&mut self, segment_id: u64) -> Result<u64> {
        if segment_id < self.registry.tip {
            return Err(ChronoqError::invariant(
                "may not begin a segment < current tip",
            ));
        }
        let new_cluster = self.registry.cluster_for_segment(segment_id);
        if self.pager.is_some() && !self.readonly && new_cluster != self.cluster {
            self.flush_accumulating_into(new_cluster)?;
        }
        if self.pager.is_none() || self.readonly || new_cluster != self.cluster {
            self.open_for_write(new_cluster)?;
        }
        self.registry.open_cluster_for_segment(segment_id);
        self.write_registry()?;
        let pos = self.tell()?;
        self.accumulating.mark_segment(segment_id, pos);
        Ok(pos)
    }

    /// Seeks a read-only cursor to `segment_id`'s recorded byte offset,
    /// opening its containing cluster if needed.
    pub fn goto_segment(&mut self, segment_id: u64) -> Result<()> {
        let cluster = self.registry.cluster_for_segment(segment_id);
        self.open_for_read(cluster)?;
        let header = self.segment_header(cluster)?;
        let pos = header.segment_position(segment_id).ok_or_else(|| {
            ChronoqError::integrity(format!("segment {segment_id} is not indexed"))
        })?;
        self.pager_mut()?.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    pub fn store<T: WireRecord>(&mut self, obj: &T) -> Result<u64> {
        if self.pager.is_none() || self.readonly {
            self.resume()?;
        }
        let pager = self.pager_mut()?;
        let sid = pager.tell()?;
        obj.write(pager)?;
        pager.flush_if_due()?;
        Ok(sid)
    }

    pub fn load<T: WireRecord>(&mut self) -> Result<(u64, T)> {
        let pager = self.pager_mut()?;
        let sid = pager.tell()?;
        let obj = T::read(pager)?;
        Ok((sid, obj))
    }

    pub fn fetch<T: WireRecord>(&mut self, sid: u64) -> Result<T> {
        let pager = self.pager_mut()?;
        let pos = pager.tell()?;
        if pos != sid {
            pager.seek(SeekFrom::Start(sid))?;
        }
        let obj = T::read(pager)?;
        let after = pager.tell()?;
        if after != pos {
            pager.seek(SeekFrom::Start(pos))?;
        }
        Ok(obj)
    }

    pub fn refer(&mut self, sid: u64) -> Result<()> {
        let pager = self.pager_mut()?;
        let pos = pager.tell()?;
        if sid == 0 || sid >= pos {
            return Err(ChronoqError::integrity(
                "refer: object id is unassigned or not prior to the current position",
            ));
        }
        wire::write_varint(pager, pos - sid)
    }

    pub fn derefer(&mut self) -> Result<u64> {
        let pager = self.pager_mut()?;
        let pos = pager.tell()?;
        let delta = wire::read_varint(pager)?;
        Ok(pos - delta)
    }

    /// Packs a set of known (by id) and unknown (by hash) references.
    pub fn refer_multi(&mut self, known_sids: &[u64], unknown_hashes: &[TxHash]) -> Result<()> {
        let known_vi = CondVarint::<4>::new(known_sids.len() as u64);
        let unknown_vi = CondVarint::<4>::new(unknown_hashes.len() as u64);
        let header_byte = known_vi.byteval() | (unknown_vi.byteval() << 4);
        let pager = self.pager_mut()?;
        pager.write_all(&[header_byte])?;
        known_vi.cond_write(pager)?;
        unknown_vi.cond_write(pager)?;

        let refpoint = pager.tell()?;
        for sid in known_sids {
            if *sid == 0 || *sid >= refpoint {
                return Err(ChronoqError::integrity(
                    "refer_multi: known id is not prior to the reference point",
                ));
            }
            wire::write_varint(pager, refpoint - sid)?;
        }
        for hash in unknown_hashes {
            hash.write(pager)?;
        }
        Ok(())
    }

    pub fn derefer_multi(&mut self) -> Result<(BTreeSet<u64>, BTreeSet<TxHash>)> {
        let pager = self.pager_mut()?;
        let mut header_byte = [0u8; 1];
        pager.read_exact(&mut header_byte)?;
        let known_vi = CondVarint::<4>::cond_read(header_byte[0] & 0x0f, pager)?;
        let unknown_vi = CondVarint::<4>::cond_read(header_byte[0] >> 4, pager)?;

        let refpoint = pager.tell()?;
        let mut known = BTreeSet::new();
        for _ in 0..known_vi.value {
            let delta = wire::read_varint(pager)?;
            known.insert(refpoint - delta);
        }
        let mut unknown = BTreeSet::new();
        for _ in 0..unknown_vi.value {
            unknown.insert(TxHash::read(pager)?);
        }
        Ok((known, unknown))
    }

    pub fn tell(&mut self) -> Result<u64> {
        self.pager_mut()?.tell()
    }

    pub fn eof(&mut self) -> Result<bool> {
        self.pager_mut()?.eof()
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(pager) = self.pager.as_mut() {
            pager.flush()?;
        }
        Ok(())
    }

    pub fn current_cluster(&self) -> u64 {
        self.cluster
    }

    /// Seeks the open cluster file to an absolute byte position. Exposed so
    /// that domain layers which need to interleave raw primitives with
    /// `refer`/`derefer` calls (objects with internal back-references, such
    /// as a transaction's known inputs) can restore a saved position
    /// themselves, the same way `fetch` does internally.
    pub fn seek_to(&mut self, pos: u64) -> Result<()> {
        self.pager_mut()?.seek(SeekFrom::Start(pos))?;
        Ok(())
    }
}

/// Lets domain layers compose their own record formats directly against the
/// open cluster file — writing raw fields interleaved with `refer`/`derefer`
/// calls — without going through the single-shot [`WireRecord`] trait, for
/// records (like a transaction with known-input back-references) whose
/// encoding needs the file position mid-structure.
impl Read for Db {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.pager
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "no cluster file open"))?
            .read(buf)
    }
}

impl Write for Db {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.pager
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "no cluster file open"))?
            .write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.pager
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "no cluster file open"))?
            .flush()
    }
}
