//! LRU list with an old sublist for scan resistance.
//!
//! The list runs from the most recently used page at the head to the
//! eviction end at the tail. Once it holds at least `old_min_len` pages, the
//! tail `old_pct` percent form the old sublist and `boundary` points at its
//! first (youngest) member. Pages read from disk enter at the boundary rather
//! than at the head, so a one-off scan only churns the old part.

use std::sync::Arc;

use super::descriptor::BufDesc;
use super::list::{IndexList, ListIter, NIL};

/// Pages always kept in the young part once an old sublist exists.
pub(crate) const NON_OLD_MIN_LEN: usize = 5;

pub(crate) struct Lru {
    list: IndexList,
    boundary: u32,
    old_len: usize,
    old_pct: usize,
    old_min_len: usize,
}

impl Lru {
    pub fn new(capacity: usize, old_pct: u32, old_min_len: usize) -> Self {
        Self {
            list: IndexList::new(capacity),
            boundary: NIL,
            old_len: 0,
            old_pct: old_pct as usize,
            old_min_len: old_min_len.max(NON_OLD_MIN_LEN + 1),
        }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn old_len(&self) -> usize {
        self.old_len
    }

    pub fn contains(&self, idx: u32) -> bool {
        self.list.contains(idx)
    }

    pub fn tail(&self) -> u32 {
        self.list.tail()
    }

    pub fn prev(&self, idx: u32) -> u32 {
        self.list.prev(idx)
    }

    pub fn iter(&self) -> ListIter<'_> {
        self.list.iter()
    }

    pub fn grow(&mut self, capacity: usize) {
        self.list.grow(capacity);
    }

    pub fn truncate(&mut self, capacity: usize) {
        self.list.truncate(capacity);
    }

    /// Adds a page. `old` pages enter at the old boundary; without an old
    /// sublist every page enters at the head. Returns true for a head entry.
    pub fn add(&mut self, arena: &[Arc<BufDesc>], idx: u32, old: bool) -> bool {
        let at_head = !old || self.boundary == NIL;
        if at_head {
            self.list.push_front(idx);
            arena[idx as usize].set_old(false);
        } else {
            let at = self.list.prev(self.boundary);
            self.list.insert_after(at, idx);
            arena[idx as usize].set_old(true);
            self.boundary = idx;
            self.old_len += 1;
        }
        self.adjust(arena);
        at_head
    }

    pub fn remove(&mut self, arena: &[Arc<BufDesc>], idx: u32) -> bool {
        if !self.list.contains(idx) {
            return false;
        }
        let desc = &arena[idx as usize];
        if self.boundary != NIL && desc.is_old() {
            if self.boundary == idx {
                self.boundary = self.list.next(idx);
            }
            self.old_len -= 1;
        }
        self.list.remove(idx);
        desc.set_old(false);
        if self.list.len() < self.old_min_len {
            self.drop_old(arena);
        } else {
            self.adjust(arena);
        }
        true
    }

    /// Moves a page to the head as young.
    pub fn make_young(&mut self, arena: &[Arc<BufDesc>], idx: u32) {
        if self.remove(arena, idx) {
            self.add(arena, idx, false);
        }
    }

    /// Moves a page to the tail so it is evicted first.
    pub fn move_to_tail(&mut self, arena: &[Arc<BufDesc>], idx: u32) {
        if !self.remove(arena, idx) {
            return;
        }
        self.list.push_back(idx);
        if self.boundary != NIL {
            arena[idx as usize].set_old(true);
            self.old_len += 1;
        }
        self.adjust(arena);
    }

    fn target_old_len(&self) -> usize {
        let len = self.list.len();
        (len * self.old_pct / 100).min(len.saturating_sub(NON_OLD_MIN_LEN))
    }

    fn init_old(&mut self, arena: &[Arc<BufDesc>]) {
        for idx in self.list.iter() {
            arena[idx as usize].set_old(true);
        }
        self.boundary = self.list.head();
        self.old_len = self.list.len();
        self.adjust(arena);
    }

    fn drop_old(&mut self, arena: &[Arc<BufDesc>]) {
        if self.boundary == NIL {
            return;
        }
        for idx in self.list.iter() {
            arena[idx as usize].set_old(false);
        }
        self.boundary = NIL;
        self.old_len = 0;
    }

    fn adjust(&mut self, arena: &[Arc<BufDesc>]) {
        let target = self.target_old_len();
        if self.boundary == NIL {
            if self.list.len() >= self.old_min_len && target > 0 {
                self.init_old(arena);
            }
            return;
        }
        while self.old_len < target {
            let prev = self.list.prev(self.boundary);
            if prev == NIL {
                break;
            }
            arena[prev as usize].set_old(true);
            self.boundary = prev;
            self.old_len += 1;
        }
        while self.old_len > target && self.boundary != NIL {
            arena[self.boundary as usize].set_old(false);
            self.boundary = self.list.next(self.boundary);
            self.old_len -= 1;
        }
        if self.old_len == 0 {
            self.boundary = NIL;
        }
    }

    /// Recounts old flags against the boundary; used by invariant checks.
    pub fn check(&self, arena: &[Arc<BufDesc>]) -> std::result::Result<(), &'static str> {
        let mut seen_boundary = false;
        let mut old = 0usize;
        for idx in self.list.iter() {
            if idx == self.boundary {
                seen_boundary = true;
            }
            let flagged = arena[idx as usize].is_old();
            if flagged != seen_boundary {
                return Err("lru old flag disagrees with boundary");
            }
            if flagged {
                old += 1;
            }
        }
        if old != self.old_len {
            return Err("lru old length mismatch");
        }
        if self.boundary != NIL && !seen_boundary {
            return Err("lru boundary not in list");
        }
        Ok(())
    }
}
