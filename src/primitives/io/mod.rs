#![forbid(unsafe_code)]

use std::{
    fs::File,
    io::{self, ErrorKind},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::{BufError, Result};
use crate::types::page::{self, header, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{page_crc32, PageId};

/// Trait for performing positioned file I/O operations.
pub trait FileIo: Send + Sync + 'static {
    /// Reads bytes from the file at the specified offset into the buffer.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes bytes to the file at the specified offset from the buffer.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Synchronizes all file data and metadata to disk.
    fn sync_all(&self) -> Result<()>;
    /// Returns the current length of the file in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file to the specified length.
    fn truncate(&self, len: u64) -> Result<()>;
}

#[cfg(unix)]
mod stdio_unix {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::unix::fs::FileExt,
    };

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.read_at(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read_at reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
mod stdio_win {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::windows::fs::FileExt,
    };

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "seek_read reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

/// File I/O over an `Arc<File>`.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Wraps an open file.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens or creates a file for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file))
    }

    fn file(&self) -> &File {
        &self.inner
    }

    #[cfg(unix)]
    fn read_exact(&self, off: u64, dst: &mut [u8]) -> io::Result<()> {
        stdio_unix::read_exact(self.file(), off, dst)
    }

    #[cfg(windows)]
    fn read_exact(&self, off: u64, dst: &mut [u8]) -> io::Result<()> {
        stdio_win::read_exact(self.file(), off, dst)
    }

    #[cfg(unix)]
    fn write_all(&self, off: u64, src: &[u8]) -> io::Result<()> {
        stdio_unix::write_all(self.file(), off, src)
    }

    #[cfg(windows)]
    fn write_all(&self, off: u64, src: &[u8]) -> io::Result<()> {
        stdio_win::write_all(self.file(), off, src)
    }

    #[cfg(not(any(unix, windows)))]
    fn read_exact(&self, _off: u64, _dst: &mut [u8]) -> io::Result<()> {
        Err(io::Error::new(
            ErrorKind::Unsupported,
            "StdFileIo unsupported on this platform",
        ))
    }

    #[cfg(not(any(unix, windows)))]
    fn write_all(&self, _off: u64, _src: &[u8]) -> io::Result<()> {
        Err(io::Error::new(
            ErrorKind::Unsupported,
            "StdFileIo unsupported on this platform",
        ))
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        trace!(off, len = dst.len(), "io.read_at");
        Ok(self.read_exact(off, dst)?)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        trace!(off, len = src.len(), "io.write_at");
        Ok(self.write_all(off, src)?)
    }

    fn sync_all(&self) -> Result<()> {
        Ok(self.file().sync_all()?)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file().metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        Ok(self.file().set_len(len)?)
    }
}

/// Growable in-memory file. Reads past the end fail like a real file.
#[derive(Default)]
pub struct MemFileIo {
    data: Mutex<Vec<u8>>,
}

impl MemFileIo {
    /// Creates an empty file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl FileIo for MemFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let data = self.data.lock();
        let start = off as usize;
        let end = start
            .checked_add(dst.len())
            .ok_or(BufError::Invalid("read offset overflow"))?;
        if end > data.len() {
            return Err(io::Error::new(ErrorKind::UnexpectedEof, "read past end of file").into());
        }
        dst.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        let start = off as usize;
        let end = start
            .checked_add(src.len())
            .ok_or(BufError::Invalid("write offset overflow"))?;
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(src);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.lock().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.data.lock().resize(len as usize, 0);
        Ok(())
    }
}

/// Page-granular read/write seam used by the pool.
///
/// `read` fills `dst` (exactly one page) and validates it; `write` encodes and
/// persists one page. Implementations must not retain the buffers.
pub trait PageIo: Send + Sync + 'static {
    /// Reads and validates one page.
    fn read(&self, id: PageId, dst: &mut [u8]) -> Result<()>;
    /// Encodes and writes one page.
    fn write(&self, id: PageId, src: &[u8]) -> Result<()>;
}

/// Counters kept by [`FilePageIo`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IoStats {
    /// Pages read from a file, fresh pages included.
    pub reads: u64,
    /// Pages written.
    pub writes: u64,
    /// Reads that found no page on disk yet.
    pub fresh_reads: u64,
}

/// Reference page codec: one file per container, page `n` at `n * page_size`.
///
/// Validation on read checks the header magic, the stored identifier, the key
/// version and the CRC, in that order. Pages beyond the end of the file or
/// entirely zero are valid fresh pages.
pub struct FilePageIo {
    page_size: usize,
    key_version: u32,
    files: RwLock<FxHashMap<u32, Arc<dyn FileIo>>>,
    reads: AtomicU64,
    writes: AtomicU64,
    fresh_reads: AtomicU64,
}

impl FilePageIo {
    /// Codec for pages of `page_size` bytes written under key version 0.
    pub fn new(page_size: usize) -> Self {
        Self::with_key_version(page_size, 0)
    }

    /// Codec whose pages are stamped with, and must carry, `key_version`.
    pub fn with_key_version(page_size: usize, key_version: u32) -> Self {
        Self {
            page_size,
            key_version,
            files: RwLock::new(FxHashMap::default()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            fresh_reads: AtomicU64::new(0),
        }
    }

    /// Registers the file backing container `space`.
    pub fn attach(&self, space: u32, file: Arc<dyn FileIo>) {
        self.files.write().insert(space, file);
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Snapshot of the I/O counters.
    pub fn stats(&self) -> IoStats {
        IoStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            fresh_reads: self.fresh_reads.load(Ordering::Relaxed),
        }
    }

    /// Flushes every attached file.
    pub fn sync_all(&self) -> Result<()> {
        let files: Vec<Arc<dyn FileIo>> = self.files.read().values().cloned().collect();
        for file in files {
            file.sync_all()?;
        }
        Ok(())
    }

    fn file(&self, space: u32) -> Result<Arc<dyn FileIo>> {
        self.files
            .read()
            .get(&space)
            .cloned()
            .ok_or(BufError::UnknownContainer(space))
    }

    fn offset(&self, id: PageId) -> u64 {
        id.page_no as u64 * self.page_size as u64
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len != self.page_size {
            return Err(BufError::Invalid("page buffer size mismatch"));
        }
        Ok(())
    }

    fn validate(&self, id: PageId, buf: &[u8]) -> Result<()> {
        let hdr = PageHeader::decode(id, &buf[..PAGE_HDR_LEN])?;
        if hdr.page_id != id {
            return Err(BufError::Corruption {
                page: id,
                reason: "page id mismatch",
            });
        }
        if hdr.key_version != self.key_version {
            return Err(BufError::Decryption(id));
        }
        let mut scratch = buf.to_vec();
        page::clear_crc32(&mut scratch)?;
        if page_crc32(id, &scratch) != hdr.crc32 {
            return Err(BufError::Corruption {
                page: id,
                reason: "page crc mismatch",
            });
        }
        Ok(())
    }
}

impl PageIo for FilePageIo {
    fn read(&self, id: PageId, dst: &mut [u8]) -> Result<()> {
        self.check_len(dst.len())?;
        let file = self.file(id.space)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        dst.fill(0);
        match file.read_at(self.offset(id), dst) {
            Ok(()) => {}
            Err(BufError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                // Only a page wholly past the end of the file was never written.
                if self.offset(id) < file.len()? {
                    return Err(BufError::Corruption {
                        page: id,
                        reason: "page truncated at end of file",
                    });
                }
                dst.fill(0);
                self.fresh_reads.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(err) => return Err(err),
        }
        if page::is_zeroes(dst) {
            self.fresh_reads.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        self.validate(id, dst)
    }

    fn write(&self, id: PageId, src: &[u8]) -> Result<()> {
        self.check_len(src.len())?;
        let file = self.file(id.space)?;
        let mut scratch = src.to_vec();
        let mut hdr = PageHeader::new(id, page::page_kind(src).unwrap_or(PageKind::Allocated));
        hdr.lsn = page::page_lsn(src);
        hdr.key_version = self.key_version;
        hdr.encode(&mut scratch[..PAGE_HDR_LEN])?;
        let crc = page_crc32(id, &scratch);
        scratch[header::CRC32].copy_from_slice(&crc.to_be_bytes());
        file.write_at(self.offset(id), &scratch)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
