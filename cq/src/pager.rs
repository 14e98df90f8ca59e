//! One sequential file per cluster: append, seek, tell, flush, and a
//! reliable `eof()` that distinguishes end-of-data from a genuine error.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chronoq_core::errors::Result;

/// A single cluster's backing file. Opened read-only for replay, or
/// read-write for append (positioned at end-of-file on open).
pub struct Pager {
    path: PathBuf,
    file: File,
    readonly: bool,
    last_flush: Instant,
    flush_interval: Duration,
}

impl Pager {
    /// Opens `path` read-only. The file must already exist.
    pub fn open_readonly(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).open(&path)?;
        Ok(Self {
            path,
            file,
            readonly: true,
            last_flush: Instant::now(),
            flush_interval: Duration::from_secs(10),
        })
    }

    /// Opens `path` read-write, creating it if absent, and seeks to
    /// end-of-file so subsequent writes append.
    pub fn open_read_write(path: impl AsRef<Path>, flush_interval: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let mut pager = Self {
            path,
            file,
            readonly: false,
            last_flush: Instant::now(),
            flush_interval,
        };
        pager.seek(SeekFrom::End(0))?;
        Ok(pager)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn tell(&mut self) -> Result<u64> {
        Ok(self.file.stream_position()?)
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.file.seek(pos)?)
    }

    /// True if the next read would hit end-of-file. Implemented by
    /// attempting to read one byte and seeking back if it succeeds.
    pub fn eof(&mut self) -> Result<bool> {
        let pos = self.tell()?;
        let mut probe = [0u8; 1];
        match self.file.read(&mut probe)? {
            0 => Ok(true),
            _ => {
                self.seek(SeekFrom::Start(pos))?;
                Ok(false)
            }
        }
    }

    /// True if the file is brand new: position zero and already at EOF.
    pub fn empty(&mut self) -> Result<bool> {
        Ok(self.tell()? == 0 && self.eof()?)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Flushes only if the configured wall-clock interval has elapsed
    /// since the last flush; used by the writer so it never flushes
    /// per-event under sustained load.
    pub fn flush_if_due(&mut self) -> Result<()> {
        if self.last_flush.elapsed() >= self.flush_interval {
            self.flush()?;
        }
        Ok(())
    }
}

impl Read for Pager {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for Pager {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}
