//! Doubly linked lists over descriptor indices.
//!
//! Each list owns one link per arena slot, so membership changes never
//! allocate and a descriptor can sit in several lists at once.

pub(crate) const NIL: u32 = u32::MAX;

#[derive(Copy, Clone, Debug)]
struct Link {
    prev: u32,
    next: u32,
    linked: bool,
}

const UNLINKED: Link = Link {
    prev: NIL,
    next: NIL,
    linked: false,
};

#[derive(Debug)]
pub(crate) struct IndexList {
    head: u32,
    tail: u32,
    len: usize,
    links: Vec<Link>,
}

impl IndexList {
    pub fn new(capacity: usize) -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
            links: vec![UNLINKED; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.links.len()
    }

    pub fn grow(&mut self, capacity: usize) {
        if capacity > self.links.len() {
            self.links.resize(capacity, UNLINKED);
        }
    }

    /// Drops link slots at and above `capacity`; none of them may be linked.
    pub fn truncate(&mut self, capacity: usize) {
        if self.links[capacity.min(self.links.len())..]
            .iter()
            .any(|link| link.linked)
        {
            fatal!("truncating a list below a linked slot");
        }
        self.links.truncate(capacity);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn tail(&self) -> u32 {
        self.tail
    }

    pub fn contains(&self, idx: u32) -> bool {
        self.links
            .get(idx as usize)
            .map(|link| link.linked)
            .unwrap_or(false)
    }

    pub fn next(&self, idx: u32) -> u32 {
        self.links[idx as usize].next
    }

    pub fn prev(&self, idx: u32) -> u32 {
        self.links[idx as usize].prev
    }

    fn claim(&mut self, idx: u32) {
        let link = &mut self.links[idx as usize];
        if link.linked {
            fatal!("descriptor {idx} linked twice into one list");
        }
        link.linked = true;
        self.len += 1;
    }

    pub fn push_front(&mut self, idx: u32) {
        self.claim(idx);
        let old_head = self.head;
        self.links[idx as usize].prev = NIL;
        self.links[idx as usize].next = old_head;
        if old_head == NIL {
            self.tail = idx;
        } else {
            self.links[old_head as usize].prev = idx;
        }
        self.head = idx;
    }

    pub fn push_back(&mut self, idx: u32) {
        self.claim(idx);
        let old_tail = self.tail;
        self.links[idx as usize].next = NIL;
        self.links[idx as usize].prev = old_tail;
        if old_tail == NIL {
            self.head = idx;
        } else {
            self.links[old_tail as usize].next = idx;
        }
        self.tail = idx;
    }

    /// Links `idx` right after `at`, or at the head when `at` is `NIL`.
    pub fn insert_after(&mut self, at: u32, idx: u32) {
        if at == NIL {
            self.push_front(idx);
            return;
        }
        if at == self.tail {
            self.push_back(idx);
            return;
        }
        self.claim(idx);
        let next = self.links[at as usize].next;
        self.links[idx as usize].prev = at;
        self.links[idx as usize].next = next;
        self.links[at as usize].next = idx;
        self.links[next as usize].prev = idx;
    }

    pub fn remove(&mut self, idx: u32) -> bool {
        let Some(link) = self.links.get(idx as usize).copied() else {
            return false;
        };
        if !link.linked {
            return false;
        }
        if link.prev == NIL {
            self.head = link.next;
        } else {
            self.links[link.prev as usize].next = link.next;
        }
        if link.next == NIL {
            self.tail = link.prev;
        } else {
            self.links[link.next as usize].prev = link.prev;
        }
        self.links[idx as usize] = UNLINKED;
        self.len -= 1;
        true
    }

    pub fn pop_front(&mut self) -> Option<u32> {
        let head = self.head;
        if head == NIL {
            return None;
        }
        self.remove(head);
        Some(head)
    }

    pub fn clear(&mut self) {
        self.links.fill(UNLINKED);
        self.head = NIL;
        self.tail = NIL;
        self.len = 0;
    }

    /// Head to tail.
    pub fn iter(&self) -> ListIter<'_> {
        ListIter {
            list: self,
            cur: self.head,
            forward: true,
        }
    }

    /// Tail to head.
    pub fn iter_rev(&self) -> ListIter<'_> {
        ListIter {
            list: self,
            cur: self.tail,
            forward: false,
        }
    }
}

pub(crate) struct ListIter<'a> {
    list: &'a IndexList,
    cur: u32,
    forward: bool,
}

impl Iterator for ListIter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.cur == NIL {
            return None;
        }
        let idx = self.cur;
        self.cur = if self.forward {
            self.list.next(idx)
        } else {
            self.list.prev(idx)
        };
        Some(idx)
    }
}
