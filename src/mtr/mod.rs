//! Mini-transactions: page latches tied to one atomic redo append.
//!
//! A [`Mtr`] collects the pages it touches in a memo together with the
//! latches taken on them, and buffers its redo records privately. Commit
//! appends the records as one frame while holding the flush-list lock, stamps
//! the end position into every modified page, links those pages into the
//! flush list at the start position and only then releases the latches,
//! newest first. Pages are therefore never visible unlatched before their
//! redo is in the log, and the flush list stays ordered without sorting.

pub mod log;
mod memo;

use std::fmt;
use std::sync::Arc;
use std::thread;

use smallvec::SmallVec;
use tracing::debug;

use crate::buffer::{BufPool, BufRef, FetchMode};
use crate::error::{BufError, Result};
use crate::types::page::{self, PAGE_HDR_LEN};
use crate::types::{crc32_of, Lsn, PageId};

use self::log::{encode_frame, RedoRecord};
use self::memo::{Latch, Memo, MemoEntry};

pub use self::memo::LatchMode;

/// Lifecycle of a mini-transaction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MtrState {
    /// Not started, or finished.
    Idle,
    /// Collecting pages and records.
    Active,
    /// Inside `commit`.
    Committing,
}

/// Whether commit writes redo.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum LogMode {
    /// Append the buffered records.
    #[default]
    All,
    /// Temporary pages: dirty them at the current log position, append nothing.
    NoRedo,
}

/// Handle to a memo entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoSlot(usize);

/// Memo length to roll back to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Savepoint(usize);

/// A mini-transaction. Owned by one thread.
pub struct Mtr {
    pool: Arc<BufPool>,
    state: MtrState,
    log_mode: LogMode,
    memo: Memo,
    log: Vec<u8>,
    modified: bool,
    deferred_frees: SmallVec<[usize; 4]>,
}

impl Mtr {
    /// Idle mini-transaction over `pool`.
    pub fn new(pool: Arc<BufPool>) -> Self {
        Self {
            pool,
            state: MtrState::Idle,
            log_mode: LogMode::All,
            memo: Memo::new(),
            log: Vec::new(),
            modified: false,
            deferred_frees: SmallVec::new(),
        }
    }

    /// Starts collecting. Fatal unless idle.
    pub fn start(&mut self) {
        if self.state != MtrState::Idle {
            fatal!("mini-transaction started while {:?}", self.state);
        }
        self.state = MtrState::Active;
        self.log_mode = LogMode::All;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MtrState {
        self.state
    }

    /// True between `start` and the end of `commit` or `rollback`.
    pub fn is_active(&self) -> bool {
        self.state == MtrState::Active
    }

    /// True once any page was marked modified.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Selects how commit treats redo.
    pub fn set_log_mode(&mut self, mode: LogMode) {
        self.log_mode = mode;
    }

    /// Current log mode.
    pub fn log_mode(&self) -> LogMode {
        self.log_mode
    }

    /// Bytes of redo buffered so far.
    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    fn require_active(&self, op: &str) {
        if self.state != MtrState::Active {
            fatal!("{op} on a mini-transaction that is {:?}", self.state);
        }
    }

    fn entry(&self, slot: MemoSlot) -> &MemoEntry {
        match self.memo.get(slot.0) {
            Some(entry) if !entry.is_released() => entry,
            _ => fatal!("memo slot {} is not held", slot.0),
        }
    }

    fn entry_mut(&mut self, slot: MemoSlot) -> &mut MemoEntry {
        match self.memo.get_mut(slot.0) {
            Some(entry) if !entry.is_released() => entry,
            _ => fatal!("memo slot {} is not held", slot.0),
        }
    }

    /// Takes `latch` on an already fixed page and keeps both until commit.
    pub fn record_access(&mut self, page: BufRef, latch: LatchMode) -> MemoSlot {
        self.require_active("record_access");
        let latch = Latch::acquire(&page, latch);
        MemoSlot(self.memo.push(MemoEntry::new(page, latch)))
    }

    /// Fixes and latches page `id`.
    pub fn get_page(&mut self, id: PageId, latch: LatchMode, mode: FetchMode) -> Result<MemoSlot> {
        self.require_active("get_page");
        let page = self.pool.fix(id, mode)?;
        Ok(self.record_access(page, latch))
    }

    /// Creates page `id` zeroed under an exclusive latch and logs its
    /// initialisation.
    pub fn create_page(&mut self, id: PageId) -> Result<MemoSlot> {
        self.require_active("create_page");
        let (page, guard) = self.pool.create(id)?;
        let slot = MemoSlot(self.memo.push(MemoEntry::new(page, Latch::X(guard))));
        RedoRecord::InitPage(id).encode(&mut self.log);
        self.mark_modified(slot);
        Ok(slot)
    }

    /// Fixed page behind `slot`.
    pub fn page_ref(&self, slot: MemoSlot) -> &BufRef {
        match &self.entry(slot).page {
            Some(page) => page,
            None => fatal!("memo slot {} is not held", slot.0),
        }
    }

    /// Frame bytes; needs at least a shared latch.
    pub fn page(&self, slot: MemoSlot) -> &[u8] {
        match self.entry(slot).latch.bytes() {
            Some(bytes) => bytes,
            None => fatal!("reading page in memo slot {} without a latch", slot.0),
        }
    }

    /// Mutable frame bytes; needs the exclusive latch.
    pub fn page_mut(&mut self, slot: MemoSlot) -> &mut [u8] {
        match self.entry_mut(slot).latch.bytes_mut() {
            Some(bytes) => bytes,
            None => fatal!("writing page in memo slot {} without an exclusive latch", slot.0),
        }
    }

    /// Appends raw redo bytes.
    pub fn log(&mut self, bytes: &[u8]) {
        self.require_active("log");
        self.log.extend_from_slice(bytes);
    }

    /// Flags the page as changed by this mini-transaction. Idempotent.
    pub fn mark_modified(&mut self, slot: MemoSlot) {
        self.require_active("mark_modified");
        let entry = self.entry_mut(slot);
        if !entry.latch.is_exclusive() {
            fatal!("page in memo slot {} modified without an exclusive latch", slot.0);
        }
        entry.modified = true;
        self.modified = true;
    }

    fn check_range(&self, slot: MemoSlot, offset: usize, len: usize) -> Result<u16> {
        let page_size = self.page(slot).len();
        if offset < PAGE_HDR_LEN {
            return Err(BufError::Invalid("write into the page header"));
        }
        let end = offset
            .checked_add(len)
            .ok_or(BufError::Invalid("write beyond the end of the page"))?;
        if end > page_size || len > u16::MAX as usize {
            return Err(BufError::Invalid("write beyond the end of the page"));
        }
        u16::try_from(offset).map_err(|_| BufError::Invalid("offset beyond redo range"))
    }

    /// Copies `data` into the page at `offset` and logs it.
    pub fn write(&mut self, slot: MemoSlot, offset: usize, data: &[u8]) -> Result<()> {
        let at = self.check_range(slot, offset, data.len())?;
        self.page_mut(slot)[offset..offset + data.len()].copy_from_slice(data);
        let page = self.page_ref(slot).id();
        RedoRecord::Write {
            page,
            offset: at,
            data,
        }
        .encode(&mut self.log);
        self.mark_modified(slot);
        Ok(())
    }

    /// Fills `len` bytes at `offset` with `value` and logs it.
    pub fn memset(&mut self, slot: MemoSlot, offset: usize, len: usize, value: u8) -> Result<()> {
        let at = self.check_range(slot, offset, len)?;
        self.page_mut(slot)[offset..offset + len].fill(value);
        let page = self.page_ref(slot).id();
        RedoRecord::Memset {
            page,
            offset: at,
            len: len as u16,
            value,
        }
        .encode(&mut self.log);
        self.mark_modified(slot);
        Ok(())
    }

    /// Logs the page's deallocation; the page turns FREED once the commit's
    /// redo is in the log.
    pub fn free_page(&mut self, slot: MemoSlot) {
        let page = self.page_ref(slot).id();
        RedoRecord::FreePage(page).encode(&mut self.log);
        self.mark_modified(slot);
        if !self.deferred_frees.contains(&slot.0) {
            self.deferred_frees.push(slot.0);
        }
    }

    /// Logs a CRC of the page payload so replay can verify its result.
    pub fn annotate_checksum(&mut self, slot: MemoSlot) -> u32 {
        self.require_active("annotate_checksum");
        let crc = crc32_of(&[&self.page(slot)[PAGE_HDR_LEN..]]);
        let page = self.page_ref(slot).id();
        RedoRecord::Checksum { page, crc }.encode(&mut self.log);
        crc
    }

    /// Marks the current memo length.
    pub fn savepoint(&self) -> Savepoint {
        Savepoint(self.memo.len())
    }

    /// Releases everything taken after `savepoint`. Fatal if any of it was
    /// modified.
    pub fn rollback_to(&mut self, savepoint: Savepoint) {
        self.require_active("rollback_to");
        if self.memo.any_modified_from(savepoint.0) {
            fatal!("rolling back over a modified page");
        }
        self.memo.release_to(savepoint.0);
        self.deferred_frees.retain(|slot| *slot < savepoint.0);
    }

    /// Releases one unmodified page before commit.
    pub fn release_page(&mut self, slot: MemoSlot) {
        self.require_active("release_page");
        let entry = self.entry_mut(slot);
        if entry.modified {
            fatal!("releasing modified page in memo slot {}", slot.0);
        }
        entry.release();
    }

    /// Abandons an unmodified mini-transaction.
    pub fn rollback(&mut self) {
        self.require_active("rollback");
        if self.modified {
            fatal!("rolling back a mini-transaction that modified pages");
        }
        self.finish();
    }

    /// Commits. Returns the end position of the appended redo, or `None` when
    /// there was nothing to log.
    pub fn commit(&mut self) -> Option<Lsn> {
        self.require_active("commit");
        self.state = MtrState::Committing;
        if self.log.is_empty() && !self.modified {
            self.finish();
            return None;
        }
        let (start, end, pages) = self.publish();
        for slot in std::mem::take(&mut self.deferred_frees) {
            let Some(page) = self.memo.get(slot).and_then(|entry| entry.page.as_ref()) else {
                continue;
            };
            if let Err(err) = self.pool.free_page(page) {
                fatal!("deferred free of page {} failed: {err}", page.id());
            }
        }
        let bytes = self.log.len();
        self.finish();
        debug!(start = %start, end = %end, pages, bytes, "mtr.commit");
        Some(end)
    }

    /// Appends, stamps and inserts under the flush-list lock.
    fn publish(&mut self) -> (Lsn, Lsn, usize) {
        let pool = Arc::clone(&self.pool);
        let mut flush = pool.flush_list_lock();
        let (start, end) = match self.log_mode {
            LogMode::All => {
                let frame = match encode_frame(&self.log) {
                    Ok(frame) => frame,
                    Err(err) => fatal!("redo frame could not be built: {err}"),
                };
                let start = match pool.log().append(&frame) {
                    Ok(start) => start,
                    Err(err) => fatal!("redo log append failed: {err}"),
                };
                (start, start.advance(frame.len() as u64))
            }
            LogMode::NoRedo => {
                let lsn = pool.log().current_lsn();
                (lsn, lsn)
            }
        };
        let mut pages = 0;
        for entry in self.memo.iter_mut().filter(|entry| entry.modified) {
            let Some(page) = entry.page.as_ref() else {
                continue;
            };
            let Some(bytes) = entry.latch.bytes_mut() else {
                fatal!("modified page {} lost its exclusive latch", page.id());
            };
            page::set_page_lsn(bytes, end);
            flush.insert_dirty(page.desc(), start);
            pages += 1;
        }
        (start, end, pages)
    }

    fn finish(&mut self) {
        self.memo.release_to(0);
        self.log.clear();
        self.deferred_frees.clear();
        self.modified = false;
        self.state = MtrState::Idle;
    }
}

impl Drop for Mtr {
    fn drop(&mut self) {
        if self.state == MtrState::Active && self.modified && !thread::panicking() {
            fatal!("mini-transaction dropped with unlogged modifications");
        }
        self.memo.release_to(0);
    }
}

impl fmt::Debug for Mtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mtr")
            .field("state", &self.state)
            .field("log_mode", &self.log_mode)
            .field("memo", &self.memo.len())
            .field("log_bytes", &self.log.len())
            .field("modified", &self.modified)
            .finish()
    }
}
