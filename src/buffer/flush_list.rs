//! Dirty pages ordered by the log position that first dirtied them.
//!
//! Newest at the head, oldest at the tail. Inserts scan from the head, which
//! is where commits normally land since log positions grow; the number of
//! entries stepped over is reported so the cost stays observable.

use crate::types::Lsn;

use super::list::{IndexList, NIL};

pub(crate) struct FlushList {
    list: IndexList,
    keys: Vec<Lsn>,
}

impl FlushList {
    pub fn new(capacity: usize) -> Self {
        Self {
            list: IndexList::new(capacity),
            keys: vec![Lsn::ZERO; capacity],
        }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn contains(&self, idx: u32) -> bool {
        self.list.contains(idx)
    }

    pub fn grow(&mut self, capacity: usize) {
        self.list.grow(capacity);
        if capacity > self.keys.len() {
            self.keys.resize(capacity, Lsn::ZERO);
        }
    }

    pub fn truncate(&mut self, capacity: usize) {
        self.list.truncate(capacity);
        self.keys.truncate(capacity);
    }

    /// Links `idx` keeping descending order. Returns the entries scanned past.
    pub fn insert(&mut self, idx: u32, lsn: Lsn) -> u64 {
        if !lsn.is_position() {
            fatal!("flush list insert of frame {idx} at non-position {lsn}");
        }
        let mut after = NIL;
        let mut cur = self.list.head();
        let mut steps = 0u64;
        while cur != NIL && self.keys[cur as usize] > lsn {
            after = cur;
            cur = self.list.next(cur);
            steps += 1;
        }
        self.list.insert_after(after, idx);
        self.keys[idx as usize] = lsn;
        steps
    }

    pub fn remove(&mut self, idx: u32) -> bool {
        if self.list.remove(idx) {
            self.keys[idx as usize] = Lsn::ZERO;
            true
        } else {
            false
        }
    }

    /// Position recorded for a member.
    pub fn key(&self, idx: u32) -> Lsn {
        self.keys[idx as usize]
    }

    /// Globally oldest unflushed position.
    pub fn oldest(&self) -> Option<Lsn> {
        match self.list.tail() {
            NIL => None,
            tail => Some(self.keys[tail as usize]),
        }
    }

    pub fn tail(&self) -> u32 {
        self.list.tail()
    }

    /// Oldest first.
    pub fn iter_oldest(&self) -> impl Iterator<Item = (u32, Lsn)> + '_ {
        self.list
            .iter_rev()
            .map(move |idx| (idx, self.keys[idx as usize]))
    }

    pub fn is_sorted(&self) -> bool {
        let mut prev = Lsn(u64::MAX);
        for idx in self.list.iter() {
            let key = self.keys[idx as usize];
            if key > prev {
                return false;
            }
            prev = key;
        }
        true
    }
}
