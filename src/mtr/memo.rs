//! What a mini-transaction holds: fixed pages and the latches on them.

use smallvec::SmallVec;

use crate::buffer::{BufRef, SGuard, SXGuard, XGuard};

/// Access a mini-transaction takes on a page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LatchMode {
    /// Buffer-fix only; the page stays resident but unlatched.
    BufFix,
    /// Shared latch.
    S,
    /// Update latch.
    SX,
    /// Exclusive latch; required to modify.
    X,
}

pub(crate) enum Latch {
    Released,
    BufFix,
    S(SGuard),
    SX(SXGuard),
    X(XGuard),
}

impl Latch {
    pub fn acquire(page: &BufRef, mode: LatchMode) -> Self {
        match mode {
            LatchMode::BufFix => Latch::BufFix,
            LatchMode::S => Latch::S(page.s_lock()),
            LatchMode::SX => Latch::SX(page.sx_lock()),
            LatchMode::X => Latch::X(page.x_lock()),
        }
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Latch::S(guard) => Some(&guard[..]),
            Latch::SX(guard) => Some(&guard[..]),
            Latch::X(guard) => Some(&guard[..]),
            Latch::Released | Latch::BufFix => None,
        }
    }

    pub fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            Latch::X(guard) => Some(&mut guard[..]),
            _ => None,
        }
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self, Latch::X(_))
    }
}

/// One memo slot. The latch field is declared first so it is released before
/// the fix.
pub(crate) struct MemoEntry {
    pub latch: Latch,
    pub page: Option<BufRef>,
    pub modified: bool,
}

impl MemoEntry {
    pub fn new(page: BufRef, latch: Latch) -> Self {
        Self {
            latch,
            page: Some(page),
            modified: false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.page.is_none()
    }

    pub fn release(&mut self) {
        self.latch = Latch::Released;
        self.page = None;
    }
}

pub(crate) struct Memo {
    entries: SmallVec<[MemoEntry; 8]>,
}

impl Memo {
    pub fn new() -> Self {
        Self {
            entries: SmallVec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn push(&mut self, entry: MemoEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    pub fn get(&self, slot: usize) -> Option<&MemoEntry> {
        self.entries.get(slot)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut MemoEntry> {
        self.entries.get_mut(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut MemoEntry> {
        self.entries.iter_mut()
    }

    pub fn any_modified_from(&self, from: usize) -> bool {
        self.entries
            .get(from..)
            .is_some_and(|tail| tail.iter().any(|entry| entry.modified))
    }

    /// Releases entries from the end down to `len`, newest first.
    pub fn release_to(&mut self, len: usize) {
        while self.entries.len() > len {
            if let Some(mut entry) = self.entries.pop() {
                entry.release();
            }
        }
    }
}
