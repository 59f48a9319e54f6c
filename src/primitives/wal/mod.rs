#![forbid(unsafe_code)]

use std::fmt;
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{BufError, Result};
use crate::primitives::io::FileIo;
use crate::types::{crc32_of, Lsn, LOG_START_LSN};

const LOG_MAGIC: [u8; 4] = *b"BPLG";
const LOG_FORMAT_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 32;

/// Log-append collaborator of the mini-transactions and the flush path.
///
/// Positions are byte offsets in an append-only stream: `append` returns the
/// start position of the bytes and the end is start plus length.
pub trait RedoLog: Send + Sync + 'static {
    /// Appends bytes and returns the position they start at.
    fn append(&self, bytes: &[u8]) -> Result<Lsn>;
    /// Makes everything before `lsn` durable.
    fn flush_up_to(&self, lsn: Lsn) -> Result<()>;
    /// Position the next append will start at.
    fn current_lsn(&self) -> Lsn;
    /// Everything below this position is durable.
    fn flushed_lsn(&self) -> Lsn;
    /// Dirty pages older than this position should be written back so the log
    /// can be reclaimed; [`Lsn::ZERO`] when there is no pressure.
    fn checkpoint_floor(&self) -> Lsn;
    /// Records that every modification below `lsn` is on disk.
    fn checkpoint(&self, lsn: Lsn) -> Result<()>;
    /// Snapshot of the log counters.
    fn stats(&self) -> LogStats;
}

/// Counters kept by the redo logs.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LogStats {
    /// Number of append calls.
    pub appends: u64,
    /// Bytes appended.
    pub bytes_appended: u64,
    /// Number of flushes that had work to do.
    pub flushes: u64,
    /// Last checkpoint position.
    pub checkpoint_lsn: Lsn,
}

impl fmt::Display for LogStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "appends={} bytes={} flushes={} checkpoint={}",
            self.appends, self.bytes_appended, self.flushes, self.checkpoint_lsn
        )
    }
}

fn checkpoint_floor_for(current: Lsn, checkpoint: Lsn, capacity: u64) -> Lsn {
    let used = current.0.saturating_sub(checkpoint.0.max(LOG_START_LSN.0));
    if used <= capacity / 4 * 3 {
        return Lsn::ZERO;
    }
    Lsn(current.0.saturating_sub(capacity / 2))
}

struct MemLogState {
    start: Lsn,
    bytes: Vec<u8>,
    flushed: Lsn,
    stats: LogStats,
}

impl MemLogState {
    fn current(&self) -> Lsn {
        self.start.advance(self.bytes.len() as u64)
    }
}

/// Redo log kept in memory.
///
/// Appends can be made to fail on demand so callers can exercise their
/// failure paths.
pub struct MemRedoLog {
    state: Mutex<MemLogState>,
    capacity: u64,
    fail_appends: AtomicBool,
}

impl MemRedoLog {
    /// Empty log starting at [`LOG_START_LSN`] with unbounded capacity.
    pub fn new() -> Self {
        Self::with_capacity(u64::MAX)
    }

    /// Empty log that reports checkpoint pressure once `capacity` bytes are
    /// outstanding since the last checkpoint.
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            state: Mutex::new(MemLogState {
                start: LOG_START_LSN,
                bytes: Vec::new(),
                flushed: LOG_START_LSN,
                stats: LogStats {
                    checkpoint_lsn: LOG_START_LSN,
                    ..LogStats::default()
                },
            }),
            capacity,
            fail_appends: AtomicBool::new(false),
        }
    }

    /// Makes subsequent appends fail with an I/O error.
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Bytes appended at or after `lsn`.
    pub fn read_from(&self, lsn: Lsn) -> Result<Vec<u8>> {
        let state = self.state.lock();
        if lsn < state.start || lsn > state.current() {
            return Err(BufError::Invalid("log position out of range"));
        }
        let from = (lsn.0 - state.start.0) as usize;
        Ok(state.bytes[from..].to_vec())
    }
}

impl Default for MemRedoLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RedoLog for MemRedoLog {
    fn append(&self, bytes: &[u8]) -> Result<Lsn> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(io::Error::new(ErrorKind::Other, "redo log append failed").into());
        }
        let mut state = self.state.lock();
        let start = state.current();
        state.bytes.extend_from_slice(bytes);
        state.stats.appends += 1;
        state.stats.bytes_appended += bytes.len() as u64;
        Ok(start)
    }

    fn flush_up_to(&self, lsn: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        if lsn > state.flushed {
            state.flushed = state.current();
            state.stats.flushes += 1;
        }
        Ok(())
    }

    fn current_lsn(&self) -> Lsn {
        self.state.lock().current()
    }

    fn flushed_lsn(&self) -> Lsn {
        self.state.lock().flushed
    }

    fn checkpoint_floor(&self) -> Lsn {
        let state = self.state.lock();
        checkpoint_floor_for(state.current(), state.stats.checkpoint_lsn, self.capacity)
    }

    fn checkpoint(&self, lsn: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        if lsn > state.current() {
            return Err(BufError::Invalid("checkpoint beyond end of log"));
        }
        if lsn > state.stats.checkpoint_lsn {
            state.stats.checkpoint_lsn = lsn;
        }
        Ok(())
    }

    fn stats(&self) -> LogStats {
        self.state.lock().stats
    }
}

/// Configuration for opening a file-backed redo log.
#[derive(Clone, Debug)]
pub struct LogOptions {
    /// Position of the first byte after the header.
    pub start_lsn: Lsn,
    /// Bytes outstanding since the last checkpoint before pressure is reported.
    pub capacity: u64,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            start_lsn: LOG_START_LSN,
            capacity: 64 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug)]
struct FileHeader {
    start_lsn: Lsn,
    checkpoint_lsn: Lsn,
}

impl FileHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&LOG_MAGIC);
        buf[4..6].copy_from_slice(&LOG_FORMAT_VERSION.to_be_bytes());
        buf[8..16].copy_from_slice(&self.start_lsn.0.to_be_bytes());
        buf[16..24].copy_from_slice(&self.checkpoint_lsn.0.to_be_bytes());
        let crc = crc32_of(&[&buf[..28]]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8; FILE_HEADER_LEN]) -> Result<Self> {
        let corrupt = |reason| BufError::Config(format!("redo log header: {reason}"));
        if src[0..4] != LOG_MAGIC {
            return Err(corrupt("magic mismatch"));
        }
        if u16::from_be_bytes([src[4], src[5]]) != LOG_FORMAT_VERSION {
            return Err(corrupt("format version mismatch"));
        }
        if src[6..8] != [0, 0] || src[24..28] != [0, 0, 0, 0] {
            return Err(corrupt("reserved bytes non-zero"));
        }
        let mut crc_raw = [0u8; 4];
        crc_raw.copy_from_slice(&src[28..32]);
        if crc32_of(&[&src[..28]]) != u32::from_be_bytes(crc_raw) {
            return Err(corrupt("crc mismatch"));
        }
        Ok(Self {
            start_lsn: Lsn(read_u64(src, 8)),
            checkpoint_lsn: Lsn(read_u64(src, 16)),
        })
    }
}

fn read_u64(src: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&src[at..at + 8]);
    u64::from_be_bytes(raw)
}

struct FileLogState {
    header: FileHeader,
    append_offset: u64,
    flushed: Lsn,
    stats: LogStats,
}

impl FileLogState {
    fn lsn_at(&self, offset: u64) -> Lsn {
        self.header
            .start_lsn
            .advance(offset - FILE_HEADER_LEN as u64)
    }
}

/// Redo log persisted in one file: a 32-byte header followed by the raw
/// appended bytes. A position is the header's start position plus the byte
/// offset past the header.
pub struct FileRedoLog {
    io: Arc<dyn FileIo>,
    capacity: u64,
    state: Mutex<FileLogState>,
}

impl FileRedoLog {
    /// Opens an existing log or initialises an empty file.
    pub fn open(io: Arc<dyn FileIo>, options: LogOptions) -> Result<Self> {
        if options.start_lsn < LOG_START_LSN {
            return Err(BufError::Invalid("redo log must start at or after LOG_START_LSN"));
        }
        let len = io.len()?;
        let header = if len < FILE_HEADER_LEN as u64 {
            let header = FileHeader {
                start_lsn: options.start_lsn,
                checkpoint_lsn: options.start_lsn,
            };
            io.write_at(0, &header.encode())?;
            io.truncate(FILE_HEADER_LEN as u64)?;
            io.sync_all()?;
            header
        } else {
            let mut buf = [0u8; FILE_HEADER_LEN];
            io.read_at(0, &mut buf)?;
            FileHeader::decode(&buf)?
        };
        let append_offset = io.len()?.max(FILE_HEADER_LEN as u64);
        let mut state = FileLogState {
            header,
            append_offset,
            flushed: Lsn::ZERO,
            stats: LogStats::default(),
        };
        state.flushed = state.lsn_at(append_offset);
        state.stats.checkpoint_lsn = state.header.checkpoint_lsn;
        debug!(
            start = %state.header.start_lsn,
            end = %state.flushed,
            checkpoint = %state.header.checkpoint_lsn,
            "redo.open"
        );
        Ok(Self {
            io,
            capacity: options.capacity,
            state: Mutex::new(state),
        })
    }

    /// Bytes appended at or after `lsn`, read back from the file.
    pub fn read_from(&self, lsn: Lsn) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let end = state.lsn_at(state.append_offset);
        if lsn < state.header.start_lsn || lsn > end {
            return Err(BufError::Invalid("log position out of range"));
        }
        let offset = FILE_HEADER_LEN as u64 + (lsn.0 - state.header.start_lsn.0);
        let mut buf = vec![0u8; (state.append_offset - offset) as usize];
        self.io.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Last checkpoint recorded in the header.
    pub fn checkpoint_lsn(&self) -> Lsn {
        self.state.lock().header.checkpoint_lsn
    }
}

impl RedoLog for FileRedoLog {
    fn append(&self, bytes: &[u8]) -> Result<Lsn> {
        let mut state = self.state.lock();
        let start = state.lsn_at(state.append_offset);
        self.io.write_at(state.append_offset, bytes)?;
        state.append_offset += bytes.len() as u64;
        state.stats.appends += 1;
        state.stats.bytes_appended += bytes.len() as u64;
        Ok(start)
    }

    fn flush_up_to(&self, lsn: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        if lsn <= state.flushed {
            return Ok(());
        }
        self.io.sync_all()?;
        state.flushed = state.lsn_at(state.append_offset);
        state.stats.flushes += 1;
        Ok(())
    }

    fn current_lsn(&self) -> Lsn {
        let state = self.state.lock();
        state.lsn_at(state.append_offset)
    }

    fn flushed_lsn(&self) -> Lsn {
        self.state.lock().flushed
    }

    fn checkpoint_floor(&self) -> Lsn {
        let state = self.state.lock();
        checkpoint_floor_for(
            state.lsn_at(state.append_offset),
            state.header.checkpoint_lsn,
            self.capacity,
        )
    }

    fn checkpoint(&self, lsn: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        if lsn > state.lsn_at(state.append_offset) {
            return Err(BufError::Invalid("checkpoint beyond end of log"));
        }
        if lsn <= state.header.checkpoint_lsn {
            return Ok(());
        }
        state.header.checkpoint_lsn = lsn;
        self.io.write_at(0, &state.header.encode())?;
        self.io.sync_all()?;
        state.stats.checkpoint_lsn = lsn;
        debug!(checkpoint = %lsn, "redo.checkpoint");
        Ok(())
    }

    fn stats(&self) -> LogStats {
        self.state.lock().stats
    }
}
