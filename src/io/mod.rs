//! Aligned batched reads against the index files.
//!
//! The reader contract is synchronous at batch granularity: `read` returns
//! only once every request in the batch has either filled its buffer or been
//! flagged failed. Offsets and buffer lengths must be sector multiples.
//! A thread registers once to obtain an [`IoContext`] and passes it to every
//! read it issues; contexts are cheap and never shared between threads.

pub mod bin;

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::defaults::SECTOR_LEN;
use crate::error::{AnnError, Result};

/// One entry of a batched read: a sector-aligned byte range of the file and
/// the destination buffer, whose length must equal the range length.
pub struct AlignedRead<'a> {
    pub offset: u64,
    pub buf: &'a mut [u8],
}

impl<'a> AlignedRead<'a> {
    pub fn new(offset: u64, buf: &'a mut [u8]) -> Self {
        Self { offset, buf }
    }
}

/// Per-thread I/O context. Opaque to callers; carries the submission-side
/// state for this thread's reads.
pub struct IoContext {
    reads_issued: u64,
}

impl IoContext {
    /// Sector reads issued through this context so far.
    pub fn reads_issued(&self) -> u64 {
        self.reads_issued
    }
}

/// Positional reader over one index file.
///
/// Reads go through `pread` on a shared descriptor, so a single reader
/// serves any number of threads; each thread still registers its own
/// [`IoContext`]. Two independent readers (disk index + partition graph)
/// never share state.
pub struct AlignedReader {
    file: File,
    path: PathBuf,
    file_len: u64,
    threads_registered: AtomicU64,
}

impl AlignedReader {
    /// Open the file for aligned batched reads.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        debug!(path = %path.display(), file_len, "opened aligned reader");
        Ok(Self {
            file,
            path,
            file_len,
            threads_registered: AtomicU64::new(0),
        })
    }

    /// Register the calling thread and hand back its context.
    pub fn register_thread(&self) -> IoContext {
        self.threads_registered.fetch_add(1, Ordering::Relaxed);
        IoContext { reads_issued: 0 }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Execute a batch of aligned reads.
    ///
    /// Returns one flag per request: `true` if the buffer was fully
    /// populated, `false` if that read failed. A failed entry leaves its
    /// buffer zeroed. Misaligned requests are an error for the whole batch,
    /// since they indicate a caller bug rather than a device fault.
    pub fn read(&self, batch: &mut [AlignedRead<'_>], ctx: &mut IoContext) -> Result<Vec<bool>> {
        for req in batch.iter() {
            if req.offset % SECTOR_LEN as u64 != 0 || req.buf.len() % SECTOR_LEN != 0 {
                return Err(AnnError::InvalidParameter(format!(
                    "misaligned read: offset {} len {}",
                    req.offset,
                    req.buf.len()
                )));
            }
        }

        let mut ok = Vec::with_capacity(batch.len());
        for req in batch.iter_mut() {
            ctx.reads_issued += 1;
            ok.push(self.read_fully(req.offset, req.buf));
        }
        Ok(ok)
    }

    fn read_fully(&self, offset: u64, buf: &mut [u8]) -> bool {
        let mut filled = 0usize;
        while filled < buf.len() {
            match self.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    buf.fill(0);
                    return false;
                }
            }
        }
        if filled < buf.len() {
            buf[filled..].fill(0);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sector_file(nsectors: usize) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for s in 0..nsectors {
            f.write_all(&vec![s as u8; SECTOR_LEN]).unwrap();
        }
        f.flush().unwrap();
        f
    }

    #[test]
    fn batched_read_populates_every_buffer() {
        let f = sector_file(4);
        let reader = AlignedReader::open(f.path()).unwrap();
        let mut ctx = reader.register_thread();

        let mut scratch = vec![0u8; 2 * SECTOR_LEN];
        let (a, b) = scratch.split_at_mut(SECTOR_LEN);
        let mut batch = vec![
            AlignedRead::new(3 * SECTOR_LEN as u64, a),
            AlignedRead::new(SECTOR_LEN as u64, b),
        ];
        let ok = reader.read(&mut batch, &mut ctx).unwrap();
        assert_eq!(ok, vec![true, true]);
        assert!(scratch[..SECTOR_LEN].iter().all(|&b| b == 3));
        assert!(scratch[SECTOR_LEN..].iter().all(|&b| b == 1));
        assert_eq!(ctx.reads_issued(), 2);
    }

    #[test]
    fn read_past_eof_flags_failure() {
        let f = sector_file(1);
        let reader = AlignedReader::open(f.path()).unwrap();
        let mut ctx = reader.register_thread();

        let mut buf = vec![0xAAu8; SECTOR_LEN];
        let mut batch = vec![AlignedRead::new(8 * SECTOR_LEN as u64, &mut buf)];
        let ok = reader.read(&mut batch, &mut ctx).unwrap();
        assert_eq!(ok, vec![false]);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn misaligned_read_is_rejected() {
        let f = sector_file(1);
        let reader = AlignedReader::open(f.path()).unwrap();
        let mut ctx = reader.register_thread();

        let mut buf = vec![0u8; SECTOR_LEN];
        let mut batch = vec![AlignedRead::new(17, &mut buf)];
        assert!(reader.read(&mut batch, &mut ctx).is_err());
    }
}
