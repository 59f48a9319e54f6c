//! Packed lifecycle tag and buffer-fix count.
//!
//! One `u32` carries both. Values below [`UNFIXED`] are the small tags; from
//! [`FREED`] upwards the distance to `FREED` is the fix count. Values from
//! `UNFIXED` upwards keep the tag in the top three bits and the fix count in
//! the low 29 bits. The numeric order of the tags is what the predicates
//! below rely on.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Slot is on the free list (or withdrawn).
pub const NOT_USED: u32 = 0;
/// Slot is lent to a non-file consumer.
pub const MEMORY: u32 = 1;
/// Slot is being unlinked by eviction.
pub const REMOVE_PENDING: u32 = 2;
/// Page was deallocated on disk but is kept resident.
pub const FREED: u32 = 3;
/// Resident page, content read from or written to disk.
pub const UNFIXED: u32 = 1 << 29;
/// Resident page, content initialised in memory.
pub const REINIT: u32 = 2 << 29;
/// A read into the frame is in flight.
pub const READ_PENDING: u32 = 3 << 29;
/// A write from the frame is in flight.
pub const WRITE_PENDING: u32 = 4 << 29;
/// Fix-count bits for tags at or above `UNFIXED`.
pub const FIX_MASK: u32 = UNFIXED - 1;

/// Decoded tag of a [`PageState`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StateTag {
    /// See [`NOT_USED`].
    NotUsed,
    /// See [`MEMORY`].
    Memory,
    /// See [`REMOVE_PENDING`].
    RemovePending,
    /// See [`FREED`].
    Freed,
    /// See [`UNFIXED`].
    Unfixed,
    /// See [`REINIT`].
    Reinit,
    /// See [`READ_PENDING`].
    ReadPending,
    /// See [`WRITE_PENDING`].
    WritePending,
}

/// Snapshot of a descriptor's state word.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct PageState(pub u32);

impl PageState {
    /// Raw word.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Tag without the fix count.
    pub const fn tag(self) -> StateTag {
        match self.0 {
            NOT_USED => StateTag::NotUsed,
            MEMORY => StateTag::Memory,
            REMOVE_PENDING => StateTag::RemovePending,
            s if s < UNFIXED => StateTag::Freed,
            s if s < REINIT => StateTag::Unfixed,
            s if s < READ_PENDING => StateTag::Reinit,
            s if s < WRITE_PENDING => StateTag::ReadPending,
            _ => StateTag::WritePending,
        }
    }

    /// Number of outstanding buffer-fixes.
    pub const fn fix_count(self) -> u32 {
        if self.0 < FREED {
            0
        } else if self.0 < UNFIXED {
            self.0 - FREED
        } else {
            self.0 & FIX_MASK
        }
    }

    /// Bound to a page identifier and findable through the page hash.
    pub const fn is_in_file(self) -> bool {
        self.0 >= FREED
    }

    /// Deallocated but resident.
    pub const fn is_freed(self) -> bool {
        self.0 >= FREED && self.0 < UNFIXED
    }

    /// Content initialised in memory.
    pub const fn is_reinit(self) -> bool {
        self.0 >= REINIT && self.0 < READ_PENDING
    }

    /// A read or a write is in flight.
    pub const fn is_io_fixed(self) -> bool {
        self.0 >= READ_PENDING
    }

    /// A read is in flight.
    pub const fn is_read_fixed(self) -> bool {
        self.0 >= READ_PENDING && self.0 < WRITE_PENDING
    }

    /// A write is in flight.
    pub const fn is_write_fixed(self) -> bool {
        self.0 >= WRITE_PENDING
    }

    /// Same tag with a different fix count.
    pub const fn with_fix_count(tag: u32, count: u32) -> PageState {
        if tag == FREED {
            PageState(FREED + count)
        } else {
            PageState(tag | count)
        }
    }

    fn tag_bits(self) -> u32 {
        match self.tag() {
            StateTag::NotUsed => NOT_USED,
            StateTag::Memory => MEMORY,
            StateTag::RemovePending => REMOVE_PENDING,
            StateTag::Freed => FREED,
            _ => self.0 & !FIX_MASK,
        }
    }
}

impl fmt::Debug for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(fix={})", self.tag(), self.fix_count())
    }
}

/// The atomic word itself.
#[derive(Default)]
pub struct AtomicState(AtomicU32);

impl AtomicState {
    /// Creates a word holding `state`.
    pub const fn new(state: u32) -> Self {
        Self(AtomicU32::new(state))
    }

    /// Current value.
    pub fn load(&self) -> PageState {
        PageState(self.0.load(Ordering::Acquire))
    }

    /// Unconditional store; only valid while the caller owns the slot.
    pub(crate) fn store(&self, state: u32) {
        self.0.store(state, Ordering::Release);
    }

    /// Adds one fix and returns the previous state.
    pub fn fix(&self) -> PageState {
        let prev = PageState(self.0.fetch_add(1, Ordering::Acquire));
        if !prev.is_in_file() {
            fatal!("buffer-fix of a descriptor in state {prev:?}");
        }
        prev
    }

    /// Drops one fix and returns the previous state.
    pub fn unfix(&self) -> PageState {
        let prev = PageState(self.0.fetch_sub(1, Ordering::Release));
        if !prev.is_in_file() || prev.fix_count() == 0 {
            fatal!("unfix of a descriptor in state {prev:?}");
        }
        prev
    }

    /// Single compare-and-swap from an exact expected word.
    pub(crate) fn transition(&self, expected: PageState, next: u32) -> bool {
        self.0
            .compare_exchange(expected.0, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves to `tag` keeping the fix count, provided the current tag passes
    /// `allowed`. Returns the state that was replaced.
    pub(crate) fn retag(
        &self,
        tag: u32,
        allowed: impl Fn(PageState) -> bool,
    ) -> Option<PageState> {
        let mut current = self.load();
        loop {
            if !allowed(current) {
                return None;
            }
            let next = PageState::with_fix_count(tag, current.fix_count());
            match self.0.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current),
                Err(actual) => current = PageState(actual),
            }
        }
    }

    /// UNFIXED/REINIT to WRITE_PENDING.
    pub(crate) fn try_write_start(&self) -> bool {
        self.retag(WRITE_PENDING, |s| {
            matches!(s.tag(), StateTag::Unfixed | StateTag::Reinit)
        })
        .is_some()
    }

    /// WRITE_PENDING back to UNFIXED.
    pub(crate) fn write_complete(&self) {
        if self.retag(UNFIXED, |s| s.is_write_fixed()).is_none() {
            fatal!("write completion without a pending write: {:?}", self.load());
        }
    }

    /// READ_PENDING to UNFIXED once the frame holds valid content.
    pub(crate) fn read_complete(&self) {
        if self.retag(UNFIXED, |s| s.is_read_fixed()).is_none() {
            fatal!("read completion without a pending read: {:?}", self.load());
        }
    }

    /// UNFIXED/REINIT to FREED.
    pub(crate) fn mark_freed(&self) -> bool {
        self.retag(FREED, |s| {
            matches!(s.tag(), StateTag::Unfixed | StateTag::Reinit)
        })
        .is_some()
    }

    /// UNFIXED/REINIT/FREED to REINIT.
    pub(crate) fn reinit(&self) -> bool {
        self.retag(REINIT, |s| {
            matches!(
                s.tag(),
                StateTag::Unfixed | StateTag::Reinit | StateTag::Freed
            )
        })
        .is_some()
    }

    /// Fix count 0 in-file page to REMOVE_PENDING.
    pub(crate) fn try_begin_remove(&self, seen: PageState) -> bool {
        if seen.fix_count() != 0 || seen.is_io_fixed() || !seen.is_in_file() {
            return false;
        }
        debug_assert_eq!(seen.tag_bits(), seen.0);
        self.transition(seen, REMOVE_PENDING)
    }
}
