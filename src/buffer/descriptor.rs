//! Page descriptors and the handles callers hold on them.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockUpgradableReadGuard, ArcRwLockWriteGuard},
    Mutex, RawRwLock, RwLock,
};

use super::state::{AtomicState, PageState, NOT_USED};
use crate::error::BufError;
use crate::types::{Lsn, PageId};

/// Content lock over a frame.
pub type FrameLock = RwLock<Box<[u8]>>;
/// Shared content latch.
pub type SGuard = ArcRwLockReadGuard<RawRwLock, Box<[u8]>>;
/// Update latch: excludes writers and other update latches, admits readers.
pub type SXGuard = ArcRwLockUpgradableReadGuard<RawRwLock, Box<[u8]>>;
/// Exclusive content latch.
pub type XGuard = ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>;

const NO_PAGE: u64 = u64::MAX;

/// Why the last read into a descriptor failed; waiters rebuild the error.
#[derive(Copy, Clone, Debug)]
pub(crate) enum ReadFailure {
    Corruption(&'static str),
    Decryption,
    Io(std::io::ErrorKind),
    Other(&'static str),
}

impl ReadFailure {
    pub fn from_error(err: &BufError) -> Self {
        match err {
            BufError::Corruption { reason, .. } => ReadFailure::Corruption(*reason),
            BufError::Decryption(_) => ReadFailure::Decryption,
            BufError::Io(io) => ReadFailure::Io(io.kind()),
            _ => ReadFailure::Other("page read failed"),
        }
    }

    pub fn to_error(self, page: PageId) -> BufError {
        match self {
            ReadFailure::Corruption(reason) => BufError::Corruption { page, reason },
            ReadFailure::Decryption => BufError::Decryption(page),
            ReadFailure::Io(kind) => {
                BufError::Io(std::io::Error::new(kind, "concurrent page read failed"))
            }
            ReadFailure::Other(reason) => BufError::Invalid(reason),
        }
    }
}

/// One slot of the pool: a frame plus everything the pool knows about it.
///
/// Descriptors are created when the pool is sized and recycled for the
/// lifetime of the pool. The identity changes only while the pool owns the
/// slot exclusively (free list, eviction), and every change bumps the
/// generation so stale [`PageHint`]s stop matching.
pub struct BufDesc {
    idx: u32,
    page: AtomicU64,
    pub(crate) state: AtomicState,
    oldest_modification: AtomicU64,
    generation: AtomicU32,
    frame: Arc<FrameLock>,
    old: AtomicBool,
    access_time: AtomicU64,
    freed_page_clock: AtomicU64,
    ahi_pointers: AtomicU32,
    read_failure: Mutex<Option<ReadFailure>>,
}

impl BufDesc {
    pub(crate) fn new(idx: u32, page_size: usize) -> Self {
        Self {
            idx,
            page: AtomicU64::new(NO_PAGE),
            state: AtomicState::new(NOT_USED),
            oldest_modification: AtomicU64::new(0),
            generation: AtomicU32::new(0),
            frame: Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice())),
            old: AtomicBool::new(false),
            access_time: AtomicU64::new(0),
            freed_page_clock: AtomicU64::new(0),
            ahi_pointers: AtomicU32::new(0),
            read_failure: Mutex::new(None),
        }
    }

    /// Position in the arena.
    pub fn idx(&self) -> u32 {
        self.idx
    }

    /// Identifier the slot is bound to, if any.
    pub fn page_id(&self) -> Option<PageId> {
        match self.page.load(Ordering::Acquire) {
            NO_PAGE => None,
            packed => Some(PageId::from_u64(packed)),
        }
    }

    /// Current state word.
    pub fn state(&self) -> PageState {
        self.state.load()
    }

    /// Bumped on every rebinding.
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Log position of the first unflushed change; zero when clean.
    pub fn oldest_modification(&self) -> Lsn {
        Lsn(self.oldest_modification.load(Ordering::Acquire))
    }

    pub(crate) fn set_oldest_modification(&self, lsn: Lsn) {
        self.oldest_modification.store(lsn.0, Ordering::Release);
    }

    /// Member of the LRU old sublist.
    pub fn is_old(&self) -> bool {
        self.old.load(Ordering::Relaxed)
    }

    pub(crate) fn set_old(&self, old: bool) {
        self.old.store(old, Ordering::Relaxed);
    }

    /// Pool clock value of the first access since the slot was bound.
    pub(crate) fn access_time(&self) -> u64 {
        self.access_time.load(Ordering::Relaxed)
    }

    pub(crate) fn note_first_access(&self, now: u64) -> u64 {
        match self
            .access_time
            .compare_exchange(0, now, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => 0,
            Err(first) => first,
        }
    }

    pub(crate) fn freed_page_clock(&self) -> u64 {
        self.freed_page_clock.load(Ordering::Relaxed)
    }

    pub(crate) fn set_freed_page_clock(&self, clock: u64) {
        self.freed_page_clock.store(clock, Ordering::Relaxed);
    }

    /// Adaptive hash index entries pointing at this page.
    pub fn ahi_pointers(&self) -> u32 {
        self.ahi_pointers.load(Ordering::Acquire)
    }

    /// Adjusts the adaptive hash index reference count.
    pub fn add_ahi_pointers(&self, delta: i32) {
        if delta >= 0 {
            self.ahi_pointers.fetch_add(delta as u32, Ordering::AcqRel);
        } else {
            let prev = self
                .ahi_pointers
                .fetch_sub(delta.unsigned_abs(), Ordering::AcqRel);
            if prev < delta.unsigned_abs() {
                fatal!("adaptive hash index pointer count underflow on frame {}", self.idx);
            }
        }
    }

    pub(crate) fn clear_ahi_pointers(&self) {
        self.ahi_pointers.store(0, Ordering::Release);
    }

    pub(crate) fn frame(&self) -> &Arc<FrameLock> {
        &self.frame
    }

    pub(crate) fn read_failure(&self) -> Option<ReadFailure> {
        *self.read_failure.lock()
    }

    pub(crate) fn set_read_failure(&self, failure: Option<ReadFailure>) {
        *self.read_failure.lock() = failure;
    }

    /// Binds the slot to `id`. Caller owns the slot exclusively.
    pub(crate) fn bind(&self, id: PageId, state: u32) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.page.store(id.to_u64(), Ordering::Release);
        self.access_time.store(0, Ordering::Relaxed);
        self.freed_page_clock.store(0, Ordering::Relaxed);
        self.set_old(false);
        self.state.store(state);
    }

    /// Returns the slot to NOT_USED. Caller owns the slot exclusively.
    pub(crate) fn unbind(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.page.store(NO_PAGE, Ordering::Release);
        self.oldest_modification.store(0, Ordering::Release);
        self.access_time.store(0, Ordering::Relaxed);
        self.set_old(false);
        self.clear_ahi_pointers();
        self.set_read_failure(None);
        self.state.store(NOT_USED);
    }

    /// Hint naming this slot in its current binding.
    pub fn hint(&self) -> Option<PageHint> {
        self.page_id().map(|id| PageHint {
            frame: self.idx,
            id,
            generation: self.generation(),
        })
    }
}

impl fmt::Debug for BufDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufDesc")
            .field("idx", &self.idx)
            .field("page", &self.page_id())
            .field("state", &self.state())
            .field("oldest_modification", &self.oldest_modification())
            .field("generation", &self.generation())
            .finish()
    }
}

/// Weak reference to a resident page: arena slot, identifier and generation.
///
/// Holding a hint never keeps the page resident. [`crate::buffer::BufPool::upgrade_hint`]
/// turns it back into a fixed page only if the slot still holds the same
/// binding.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PageHint {
    /// Arena slot.
    pub frame: u32,
    /// Identifier the slot was bound to.
    pub id: PageId,
    /// Generation of that binding.
    pub generation: u32,
}

/// A buffer-fixed page. Dropping it releases the fix.
pub struct BufRef {
    desc: Arc<BufDesc>,
    id: PageId,
}

impl BufRef {
    /// Wraps a descriptor whose fix the caller already took.
    pub(crate) fn adopt(desc: Arc<BufDesc>, id: PageId) -> Self {
        Self { desc, id }
    }

    /// Page identifier.
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Underlying descriptor.
    pub fn desc(&self) -> &Arc<BufDesc> {
        &self.desc
    }

    /// Current state word.
    pub fn state(&self) -> PageState {
        self.desc.state()
    }

    /// Hint that can later be upgraded back to a fixed page.
    pub fn hint(&self) -> PageHint {
        PageHint {
            frame: self.desc.idx(),
            id: self.id,
            generation: self.desc.generation(),
        }
    }

    /// Log position of the first unflushed change.
    pub fn oldest_modification(&self) -> Lsn {
        self.desc.oldest_modification()
    }

    /// Blocks for a shared latch.
    pub fn s_lock(&self) -> SGuard {
        self.desc.frame.read_arc()
    }

    /// Blocks for an update latch.
    pub fn sx_lock(&self) -> SXGuard {
        self.desc.frame.upgradable_read_arc()
    }

    /// Blocks for an exclusive latch.
    pub fn x_lock(&self) -> XGuard {
        self.desc.frame.write_arc()
    }

    /// Shared latch if immediately available.
    pub fn try_s_lock(&self) -> Option<SGuard> {
        self.desc.frame.try_read_arc()
    }

    /// Exclusive latch if immediately available.
    pub fn try_x_lock(&self) -> Option<XGuard> {
        self.desc.frame.try_write_arc()
    }
}

impl Clone for BufRef {
    fn clone(&self) -> Self {
        self.desc.state.fix();
        Self {
            desc: self.desc.clone(),
            id: self.id,
        }
    }
}

impl Drop for BufRef {
    fn drop(&mut self) {
        self.desc.state.unfix();
    }
}

impl fmt::Debug for BufRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufRef")
            .field("id", &self.id)
            .field("frame", &self.desc.idx())
            .field("state", &self.desc.state())
            .finish()
    }
}
