//! Adaptive hash index: fold values mapped to record locations in cached pages.
//!
//! The index is a best-effort shortcut. Each fold maps to at most one
//! (page, record offset) pair, the last insert winning. Entries remember the
//! page by [`PageHint`], so a hit is only returned after the pool re-fixes
//! the page under its page-hash latch and confirms the binding is unchanged.
//! Nodes live in frames borrowed from the pool in MEMORY state; under memory
//! pressure the whole index is switched off and those frames go back.
//!
//! The index registers itself as a [`PoolListener`]: before a frame that
//! entries point at is evicted or re-created, every entry for it is removed.

mod arena;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};
use xxhash_rust::xxh64::xxh64;

use self::arena::{Node, NodeArena, NIL_NODE};
use crate::buffer::{BufDesc, BufPool, BufRef, PageHint, PoolListener};

/// Folds a byte key the way callers without their own hash should.
pub fn fold_bytes(key: &[u8]) -> u64 {
    xxh64(key, 0)
}

/// Snapshot of index counters.
#[derive(Clone, Debug, Default)]
pub struct AhiStats {
    /// Index accepts inserts and lookups.
    pub enabled: bool,
    /// Hash cells.
    pub cells: usize,
    /// Live entries.
    pub entries: usize,
    /// Pool frames holding nodes.
    pub blocks: usize,
    /// New entries.
    pub inserts: u64,
    /// Inserts that replaced the entry for an existing fold.
    pub overwrites: u64,
    /// Inserts dropped for lack of memory or because the index was off.
    pub skipped: u64,
    /// Lookups that returned a page.
    pub hits: u64,
    /// Lookups with no matching entry.
    pub misses: u64,
    /// Entries found whose page no longer matched.
    pub stale: u64,
    /// Entries removed on behalf of pages.
    pub removed: u64,
}

impl fmt::Display for AhiStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "enabled={} entries={} blocks={} hits={} misses={} stale={}",
            self.enabled, self.entries, self.blocks, self.hits, self.misses, self.stale
        )
    }
}

#[derive(Default)]
struct Counters {
    inserts: AtomicU64,
    overwrites: AtomicU64,
    skipped: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicU64,
    removed: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

struct AhiInner {
    enabled: bool,
    cells: Vec<u32>,
    nodes: NodeArena,
    /// First node of each frame's chain.
    page_heads: FxHashMap<u32, u32>,
}

impl AhiInner {
    fn cell(&self, fold: u64) -> usize {
        (fold % self.cells.len() as u64) as usize
    }

    fn find(&self, fold: u64) -> Option<(u32, Node)> {
        let mut cur = self.cells[self.cell(fold)];
        while cur != NIL_NODE {
            let node = self.nodes.read(cur);
            if node.fold == fold {
                return Some((cur, node));
            }
            cur = node.next;
        }
        None
    }

    fn link_page(&mut self, id: u32, node: &mut Node) {
        node.page_prev = NIL_NODE;
        node.page_next = self.page_heads.get(&node.frame).copied().unwrap_or(NIL_NODE);
        if node.page_next != NIL_NODE {
            let mut head = self.nodes.read(node.page_next);
            head.page_prev = id;
            self.nodes.write(node.page_next, &head);
        }
        self.page_heads.insert(node.frame, id);
    }

    fn unlink_page(&mut self, node: &Node) {
        if node.page_prev == NIL_NODE {
            if node.page_next == NIL_NODE {
                self.page_heads.remove(&node.frame);
            } else {
                self.page_heads.insert(node.frame, node.page_next);
            }
        } else {
            let mut prev = self.nodes.read(node.page_prev);
            prev.page_next = node.page_next;
            self.nodes.write(node.page_prev, &prev);
        }
        if node.page_next != NIL_NODE {
            let mut next = self.nodes.read(node.page_next);
            next.page_prev = node.page_prev;
            self.nodes.write(node.page_next, &next);
        }
    }

    fn unlink_cell(&mut self, id: u32, node: &Node) {
        let cell = self.cell(node.fold);
        if self.cells[cell] == id {
            self.cells[cell] = node.next;
            return;
        }
        let mut cur = self.cells[cell];
        while cur != NIL_NODE {
            let prev = self.nodes.read(cur);
            if prev.next == id {
                self.nodes.set_next(cur, node.next);
                return;
            }
            cur = prev.next;
        }
    }

    fn remove_node(&mut self, id: u32, node: &Node) {
        self.unlink_cell(id, node);
        self.unlink_page(node);
        self.nodes.release(id);
    }
}

/// The adaptive hash index.
pub struct AdaptiveHashIndex {
    pool: Arc<BufPool>,
    inner: RwLock<AhiInner>,
    counters: Counters,
}

impl AdaptiveHashIndex {
    /// Creates the index over `pool` and registers it for eviction and
    /// memory-pressure callbacks. Starts enabled if the pool options say so.
    pub fn new(pool: Arc<BufPool>) -> Arc<Self> {
        let options = pool.options();
        let inner = AhiInner {
            enabled: options.ahi_enabled,
            cells: vec![NIL_NODE; options.ahi_cells],
            nodes: NodeArena::new(pool.page_size()),
            page_heads: FxHashMap::default(),
        };
        let index = Arc::new(Self {
            pool: Arc::clone(&pool),
            inner: RwLock::new(inner),
            counters: Counters::default(),
        });
        let listener: Arc<dyn PoolListener> = index.clone();
        let weak: Weak<dyn PoolListener> = Arc::downgrade(&listener);
        pool.register_listener(weak);
        index
    }

    /// True while inserts and lookups are served.
    pub fn is_enabled(&self) -> bool {
        self.inner.read().enabled
    }

    /// Maps `fold` to record `offset` on `page`, replacing any earlier entry
    /// for the same fold. Returns false when the entry was not stored.
    pub fn insert(&self, fold: u64, page: &BufRef, offset: u32) -> bool {
        // pool frames are taken before the latch; taking one may evict, which
        // calls back into the index
        let spare = {
            let inner = self.inner.read();
            if !inner.enabled {
                bump(&self.counters.skipped, 1);
                return false;
            }
            let needs_block = !inner.nodes.has_free() && inner.find(fold).is_none();
            drop(inner);
            if needs_block {
                self.pool.alloc_memory_block()
            } else {
                None
            }
        };

        let mut inner = self.inner.write();
        if !inner.enabled {
            drop(inner);
            drop(spare);
            bump(&self.counters.skipped, 1);
            return false;
        }
        if let Some(block) = spare {
            inner.nodes.add_block(block);
        }
        let desc = page.desc();
        if let Some((id, mut node)) = inner.find(fold) {
            if node.frame != desc.idx() {
                inner.unlink_page(&node);
                if let Some(previous) = self.pool.descriptor(node.frame) {
                    previous.add_ahi_pointers(-1);
                }
                node.frame = desc.idx();
                inner.link_page(id, &mut node);
                desc.add_ahi_pointers(1);
            }
            node.id = page.id();
            node.generation = desc.generation();
            node.offset = offset;
            inner.nodes.write(id, &node);
            bump(&self.counters.overwrites, 1);
            return true;
        }
        let Some(id) = inner.nodes.alloc() else {
            bump(&self.counters.skipped, 1);
            return false;
        };
        let cell = inner.cell(fold);
        let mut node = Node {
            fold,
            id: page.id(),
            frame: desc.idx(),
            generation: desc.generation(),
            offset,
            next: inner.cells[cell],
            page_next: NIL_NODE,
            page_prev: NIL_NODE,
        };
        inner.link_page(id, &mut node);
        inner.nodes.write(id, &node);
        inner.cells[cell] = id;
        desc.add_ahi_pointers(1);
        bump(&self.counters.inserts, 1);
        true
    }

    /// Looks `fold` up and, if it still points at record `expected` on a page
    /// with the same binding, returns that page fixed. The index latch is held
    /// until the page is fixed, so a concurrent disable cannot free the node.
    pub fn lookup_and_validate(&self, fold: u64, expected: u32) -> Option<BufRef> {
        let inner = self.inner.read();
        if !inner.enabled {
            return None;
        }
        let Some((_, node)) = inner.find(fold) else {
            bump(&self.counters.misses, 1);
            return None;
        };
        if node.offset != expected {
            bump(&self.counters.misses, 1);
            return None;
        }
        let hint = PageHint {
            frame: node.frame,
            id: node.id,
            generation: node.generation,
        };
        match self.pool.upgrade_hint(&hint) {
            Some(page) => {
                bump(&self.counters.hits, 1);
                Some(page)
            }
            None => {
                bump(&self.counters.stale, 1);
                None
            }
        }
    }

    /// Drops every entry pointing at `desc`. Returns the number removed.
    pub fn remove_all_for_page(&self, desc: &BufDesc) -> usize {
        let mut inner = self.inner.write();
        let Some(mut cur) = inner.page_heads.get(&desc.idx()).copied() else {
            return 0;
        };
        let mut removed = 0usize;
        while cur != NIL_NODE {
            let node = inner.nodes.read(cur);
            let next = node.page_next;
            inner.remove_node(cur, &node);
            removed += 1;
            cur = next;
        }
        drop(inner);
        desc.add_ahi_pointers(-(removed as i32));
        bump(&self.counters.removed, removed as u64);
        debug!(frame = desc.idx(), removed, "ahi.remove_page");
        removed
    }

    /// Drops the entries for `folds` that point at `desc`, leaving entries for
    /// other pages alone.
    pub fn remove_folds_for_page(&self, folds: &[u64], desc: &BufDesc) -> usize {
        let mut inner = self.inner.write();
        let mut removed = 0usize;
        for &fold in folds {
            if let Some((id, node)) = inner.find(fold) {
                if node.frame == desc.idx() {
                    inner.remove_node(id, &node);
                    removed += 1;
                }
            }
        }
        drop(inner);
        desc.add_ahi_pointers(-(removed as i32));
        bump(&self.counters.removed, removed as u64);
        removed
    }

    /// Turns the index off, drops every entry and returns its frames to the
    /// pool.
    pub fn disable(&self) {
        let blocks = {
            let mut inner = self.inner.write();
            if !inner.enabled {
                return;
            }
            inner.enabled = false;
            let heads: Vec<(u32, u32)> = inner.page_heads.drain().collect();
            for (frame, head) in heads {
                let mut count = 0i32;
                let mut cur = head;
                while cur != NIL_NODE {
                    count += 1;
                    cur = inner.nodes.read(cur).page_next;
                }
                if let Some(desc) = self.pool.descriptor(frame) {
                    desc.add_ahi_pointers(-count);
                }
            }
            inner.cells.fill(NIL_NODE);
            inner.nodes.take_blocks()
        };
        info!(blocks = blocks.len(), "ahi.disabled");
        drop(blocks);
    }

    /// Turns the index back on, empty.
    pub fn enable(&self) {
        let mut inner = self.inner.write();
        if !inner.enabled {
            inner.enabled = true;
            info!("ahi.enabled");
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> AhiStats {
        let inner = self.inner.read();
        let c = &self.counters;
        AhiStats {
            enabled: inner.enabled,
            cells: inner.cells.len(),
            entries: inner.nodes.used(),
            blocks: inner.nodes.blocks(),
            inserts: c.inserts.load(Ordering::Relaxed),
            overwrites: c.overwrites.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            stale: c.stale.load(Ordering::Relaxed),
            removed: c.removed.load(Ordering::Relaxed),
        }
    }
}

impl PoolListener for AdaptiveHashIndex {
    fn page_invalidated(&self, desc: &BufDesc) {
        self.remove_all_for_page(desc);
    }

    fn memory_pressure(&self) {
        if self.is_enabled() {
            warn!("ahi.memory_pressure");
            self.disable();
        }
    }
}

impl fmt::Debug for AdaptiveHashIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveHashIndex")
            .field("stats", &self.stats())
            .finish()
    }
}
