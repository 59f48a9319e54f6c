use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use super::descriptor::{BufDesc, BufRef, PageHint, ReadFailure, XGuard};
use super::flush_list::FlushList;
use super::list::{IndexList, NIL};
use super::lru::Lru;
use super::page_hash::PageHash;
use super::state::{MEMORY, NOT_USED, READ_PENDING, REINIT};
use crate::error::{BufError, Result};
use crate::options::PoolOptions;
use crate::primitives::io::PageIo;
use crate::primitives::wal::RedoLog;
use crate::types::{page, Lsn, PageId};

/// How `fix` treats pages that are not immediately usable.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FetchMode {
    /// Read missing pages and wait for reads in flight.
    Normal,
    /// Fail with [`BufError::WouldBlock`] instead of waiting for a read.
    NoWait,
    /// Like `Normal`, but also hand out FREED pages.
    PossiblyFreed,
    /// Only return resident pages; never read.
    PeekIfInPool,
}

/// Hook for components that keep references into pool frames.
pub trait PoolListener: Send + Sync + 'static {
    /// The page bound to `desc` is about to lose its frame (eviction) or its
    /// content (re-creation). Runs before the frame is reused.
    fn page_invalidated(&self, desc: &BufDesc);
    /// The pool is out of frames; give back what can be given back.
    fn memory_pressure(&self);
}

/// Snapshot of pool statistics.
#[derive(Clone, Debug, Default)]
pub struct PoolStats {
    /// Frames in the arena.
    pub capacity: usize,
    /// Frames on the free list.
    pub free: usize,
    /// Pages on the LRU list.
    pub lru: usize,
    /// Pages in the LRU old sublist.
    pub old: usize,
    /// Frames parked by an ongoing shrink.
    pub withdrawn: usize,
    /// Pages on the flush list.
    pub dirty: usize,
    /// Oldest unflushed position, zero when nothing is dirty.
    pub oldest_modification: Lsn,
    /// Fixes served from memory.
    pub hits: u64,
    /// Fixes that had to read.
    pub misses: u64,
    /// Successful page reads.
    pub reads: u64,
    /// Reads whose page failed validation or I/O.
    pub read_failures: u64,
    /// Pages written back.
    pub writes: u64,
    /// Pages evicted.
    pub evictions: u64,
    /// Pages moved to the LRU head on access.
    pub made_young: u64,
    /// Old pages left in place because they were accessed too soon.
    pub not_made_young: u64,
    /// Entries stepped over by flush-list inserts.
    pub flush_insert_scan_steps: u64,
    /// Times a free frame could not be found.
    pub exhausted: u64,
    /// Memory pressure signals sent to listeners.
    pub memory_pressure: u64,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "capacity={} free={} lru={} dirty={} hits={} misses={} evictions={} writes={}",
            self.capacity,
            self.free,
            self.lru,
            self.dirty,
            self.hits,
            self.misses,
            self.evictions,
            self.writes
        )
    }
}

#[derive(Default)]
pub(super) struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    reads: AtomicU64,
    read_failures: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
    made_young: AtomicU64,
    not_made_young: AtomicU64,
    flush_insert_scan_steps: AtomicU64,
    exhausted: AtomicU64,
    memory_pressure: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// List membership, guarded by the pool's structural mutex.
pub(super) struct PoolLists {
    pub free: IndexList,
    pub lru: Lru,
    pub withdrawn: IndexList,
    /// Frames at or above this index are being withdrawn.
    pub withdraw_target: usize,
}

impl PoolLists {
    /// Hands an unused descriptor back to the free list, or parks it when it
    /// sits above an ongoing shrink.
    pub fn release(&mut self, idx: u32) {
        if idx as usize >= self.withdraw_target {
            self.withdrawn.push_back(idx);
        } else {
            self.free.push_front(idx);
        }
    }
}

/// Buffer pool: a fixed arena of page frames shared by all threads.
///
/// Lock order is the structural mutex, then a page-hash shard, then the
/// flush-list mutex. The arena lock is a leaf and is only held long enough
/// to clone the current snapshot.
pub struct BufPool {
    pub(super) options: PoolOptions,
    pub(super) page_size: usize,
    pub(super) io: Arc<dyn PageIo>,
    pub(super) log: Arc<dyn RedoLog>,
    pub(super) arena: RwLock<Arc<[Arc<BufDesc>]>>,
    pub(super) hash: PageHash,
    pub(super) lists: Mutex<PoolLists>,
    pub(super) flush: Mutex<FlushList>,
    listeners: Mutex<Vec<Weak<dyn PoolListener>>>,
    pub(super) resizing: Mutex<()>,
    freed_page_clock: AtomicU64,
    lru_len: AtomicUsize,
    pub(super) counters: Counters,
    epoch: Instant,
}

impl BufPool {
    /// Creates a pool sized by `options`, reading and writing pages through
    /// `io` and honouring `log` before every write.
    pub fn new(
        options: PoolOptions,
        io: Arc<dyn PageIo>,
        log: Arc<dyn RedoLog>,
    ) -> Result<Arc<Self>> {
        options.validate()?;
        let frames = options.frames();
        if frames >= NIL as usize {
            return Err(BufError::Config(format!("{frames} frames exceed the arena limit")));
        }
        let page_size = options.page_size as usize;
        let descs: Vec<Arc<BufDesc>> = (0..frames)
            .map(|idx| Arc::new(BufDesc::new(idx as u32, page_size)))
            .collect();
        let mut free = IndexList::new(frames);
        for idx in 0..frames {
            free.push_back(idx as u32);
        }
        let lists = PoolLists {
            free,
            lru: Lru::new(frames, options.lru_old_pct, options.lru_old_min_len),
            withdrawn: IndexList::new(frames),
            withdraw_target: usize::MAX,
        };
        info!(frames, page_size, shards = options.hash_shards, "bufpool.create");
        Ok(Arc::new(Self {
            hash: PageHash::new(options.hash_shards),
            flush: Mutex::new(FlushList::new(frames)),
            options,
            page_size,
            io,
            log,
            arena: RwLock::new(Arc::from(descs)),
            lists: Mutex::new(lists),
            listeners: Mutex::new(Vec::new()),
            resizing: Mutex::new(()),
            freed_page_clock: AtomicU64::new(0),
            lru_len: AtomicUsize::new(0),
            counters: Counters::default(),
            epoch: Instant::now(),
        }))
    }

    /// Options the pool was created with.
    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Frames currently in the arena.
    pub fn capacity(&self) -> usize {
        self.arena.read().len()
    }

    /// Redo log the pool flushes before writing pages.
    pub fn log(&self) -> &Arc<dyn RedoLog> {
        &self.log
    }

    pub(super) fn arena(&self) -> Arc<[Arc<BufDesc>]> {
        self.arena.read().clone()
    }

    /// Descriptor at arena slot `idx`.
    pub fn descriptor(&self, idx: u32) -> Option<Arc<BufDesc>> {
        self.arena.read().get(idx as usize).cloned()
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    /// Registers a listener; it is dropped automatically once its last strong
    /// reference goes away.
    pub fn register_listener(&self, listener: Weak<dyn PoolListener>) {
        self.listeners.lock().push(listener);
    }

    fn live_listeners(&self) -> Vec<Arc<dyn PoolListener>> {
        let mut listeners = self.listeners.lock();
        let mut live = Vec::with_capacity(listeners.len());
        listeners.retain(|weak| {
            if let Some(listener) = weak.upgrade() {
                live.push(listener);
                true
            } else {
                false
            }
        });
        live
    }

    /// Listeners are only told about pages some index still points at.
    pub(super) fn notify_invalidated(&self, desc: &BufDesc) {
        if desc.ahi_pointers() == 0 {
            return;
        }
        for listener in self.live_listeners() {
            listener.page_invalidated(desc);
        }
    }

    /// Asks listeners to return borrowed frames.
    pub fn signal_memory_pressure(&self) {
        bump(&self.counters.memory_pressure, 1);
        let listeners = self.live_listeners();
        warn!(listeners = listeners.len(), "bufpool.memory_pressure");
        for listener in listeners {
            listener.memory_pressure();
        }
    }

    /// Buffer-fixes page `id`, reading it on a miss.
    pub fn fix(&self, id: PageId, mode: FetchMode) -> Result<BufRef> {
        loop {
            if let Some(page) = self.lookup(id) {
                return self.on_hit(page, mode);
            }
            if mode == FetchMode::PeekIfInPool {
                return Err(BufError::NotResident(id));
            }
            let desc = self.get_free_block()?;
            let guard = desc.frame().write_arc();
            match self.publish(id, desc, READ_PENDING | 1, true) {
                Ok(page) => return self.read_into(page, guard),
                Err(desc) => {
                    drop(guard);
                    self.release_block(&desc);
                }
            }
        }
    }

    /// Releases a fix. Equivalent to dropping the handle; never evicts.
    pub fn unfix(&self, page: BufRef) {
        drop(page);
    }

    fn lookup(&self, id: PageId) -> Option<BufRef> {
        let shard = self.hash.shard(id).read();
        let desc = shard.get(&id)?;
        desc.state.fix();
        Some(BufRef::adopt(desc.clone(), id))
    }

    fn on_hit(&self, page: BufRef, mode: FetchMode) -> Result<BufRef> {
        if page.state().is_read_fixed() {
            if matches!(mode, FetchMode::NoWait | FetchMode::PeekIfInPool) {
                return Err(BufError::WouldBlock(page.id()));
            }
            // the reader holds the exclusive latch until the read settles
            drop(page.s_lock());
            if let Some(failure) = page.desc().read_failure() {
                return Err(failure.to_error(page.id()));
            }
        }
        if page.state().is_freed() && mode != FetchMode::PossiblyFreed {
            return Err(BufError::PageFreed(page.id()));
        }
        bump(&self.counters.hits, 1);
        self.make_young_if_needed(page.desc());
        Ok(page)
    }

    /// Binds a descriptor the caller owns to `id` and publishes it, unless
    /// another thread published the same page first. Reads enter the LRU list
    /// as `old`; created pages enter young at the head.
    fn publish(
        &self,
        id: PageId,
        desc: Arc<BufDesc>,
        state: u32,
        old: bool,
    ) -> std::result::Result<BufRef, Arc<BufDesc>> {
        let mut lists = self.lists.lock();
        {
            let mut shard = self.hash.shard(id).write();
            if shard.contains_key(&id) {
                return Err(desc);
            }
            desc.bind(id, state);
            shard.insert(id, desc.clone());
        }
        let arena = self.arena();
        if lists.lru.add(&arena, desc.idx(), old) {
            desc.set_freed_page_clock(self.freed_page_clock.load(Ordering::Relaxed));
        }
        self.lru_len.store(lists.lru.len(), Ordering::Relaxed);
        Ok(BufRef::adopt(desc, id))
    }

    fn read_into(&self, page: BufRef, mut guard: XGuard) -> Result<BufRef> {
        let id = page.id();
        bump(&self.counters.misses, 1);
        match self.io.read(id, &mut guard[..]) {
            Ok(()) => {
                page.desc().state.read_complete();
                page.desc().note_first_access(self.now_ms());
                drop(guard);
                bump(&self.counters.reads, 1);
                debug!(page = %id, frame = page.desc().idx(), "bufpool.read");
                Ok(page)
            }
            Err(err) => {
                self.discard_failed_read(page, guard, &err);
                Err(err)
            }
        }
    }

    fn discard_failed_read(&self, page: BufRef, guard: XGuard, err: &BufError) {
        let id = page.id();
        let desc = page.desc().clone();
        desc.set_read_failure(Some(ReadFailure::from_error(err)));
        {
            let mut lists = self.lists.lock();
            self.hash.shard(id).write().remove(&id);
            let arena = self.arena();
            lists.lru.remove(&arena, desc.idx());
            self.lru_len.store(lists.lru.len(), Ordering::Relaxed);
        }
        drop(guard);
        drop(page);
        // waiters hold fixes until they have seen the failure
        while desc.state().fix_count() > 0 {
            thread::yield_now();
        }
        desc.unbind();
        self.release_block(&desc);
        bump(&self.counters.read_failures, 1);
        warn!(page = %id, error = %err, "bufpool.read_failed");
    }

    fn make_young_if_needed(&self, desc: &BufDesc) {
        let now = self.now_ms();
        let first = desc.note_first_access(now);
        let clock = self.freed_page_clock.load(Ordering::Relaxed);
        if clock == 0 {
            return;
        }
        let promote = if desc.is_old() {
            let ripe = first != 0 && now.saturating_sub(first) >= self.options.old_threshold_ms;
            if !ripe {
                bump(&self.counters.not_made_young, 1);
            }
            ripe
        } else {
            !self.is_recently_young(desc, clock)
        };
        if !promote {
            return;
        }
        let mut lists = self.lists.lock();
        if lists.lru.contains(desc.idx()) {
            let arena = self.arena();
            lists.lru.make_young(&arena, desc.idx());
            desc.set_freed_page_clock(clock);
            bump(&self.counters.made_young, 1);
        }
    }

    /// Young pages still in the first quarter of the young region stay put.
    fn is_recently_young(&self, desc: &BufDesc, clock: u64) -> bool {
        let lru_len = self.lru_len.load(Ordering::Relaxed) as u64;
        let young_quarter = lru_len * (100 - self.options.lru_old_pct as u64) / 400;
        clock < desc.freed_page_clock() + young_quarter
    }

    /// Fresh zeroed page bound to `id`, exclusively latched, without a read.
    ///
    /// A resident copy (FREED included) is re-initialised in place and its
    /// listeners are told before its bytes are cleared.
    pub fn create(&self, id: PageId) -> Result<(BufRef, XGuard)> {
        loop {
            if let Some(page) = self.lookup(id) {
                if page.state().is_read_fixed() {
                    drop(page.s_lock());
                    if page.desc().read_failure().is_some() {
                        drop(page);
                        continue;
                    }
                }
                let mut guard = page.x_lock();
                self.notify_invalidated(page.desc());
                if !page.desc().state.reinit() {
                    fatal!("re-creating page {id} in state {:?}", page.state());
                }
                guard.fill(0);
                debug!(page = %id, frame = page.desc().idx(), "bufpool.create.reinit");
                return Ok((page, guard));
            }
            let desc = self.get_free_block()?;
            let mut guard = desc.frame().write_arc();
            guard.fill(0);
            match self.publish(id, desc, REINIT | 1, false) {
                Ok(page) => {
                    page.desc().note_first_access(self.now_ms());
                    debug!(page = %id, frame = page.desc().idx(), "bufpool.create");
                    return Ok((page, guard));
                }
                Err(desc) => {
                    drop(guard);
                    self.release_block(&desc);
                }
            }
        }
    }

    /// Marks a page whose extent was deallocated. It stays resident but moves
    /// to the LRU tail so it is the next eviction victim.
    pub fn free_page(&self, page: &BufRef) -> Result<()> {
        if !page.desc().state.mark_freed() {
            if page.state().is_freed() {
                return Ok(());
            }
            return Err(BufError::Invalid("page cannot be freed while i/o is pending"));
        }
        let mut lists = self.lists.lock();
        let arena = self.arena();
        lists.lru.move_to_tail(&arena, page.desc().idx());
        debug!(page = %page.id(), "bufpool.free_page");
        Ok(())
    }

    /// Evicts one page from the LRU tail. Never blocks; `None` when no page
    /// within the scan depth can be relocated.
    pub fn evict_one(&self) -> Option<PageId> {
        let (desc, id) = self.evict_victim()?;
        self.release_block(&desc);
        Some(id)
    }

    fn evict_victim(&self) -> Option<(Arc<BufDesc>, PageId)> {
        let (desc, id, guard) = {
            let mut lists = self.lists.lock();
            let arena = self.arena();
            let mut cur = lists.lru.tail();
            let mut scanned = 0;
            let mut found = None;
            while cur != NIL && scanned < self.options.lru_scan_depth {
                let prev = lists.lru.prev(cur);
                let desc = &arena[cur as usize];
                if cur as usize >= lists.withdraw_target {
                    // being withdrawn; resize relocates it
                } else if let Some((id, guard)) = self.detach(&mut lists, &arena, desc) {
                    found = Some((desc.clone(), id, guard));
                    break;
                }
                scanned += 1;
                cur = prev;
            }
            found?
        };
        self.finish_detach(&desc, guard);
        bump(&self.counters.evictions, 1);
        debug!(page = %id, frame = desc.idx(), "bufpool.evict");
        Some((desc, id))
    }

    /// Unlinks a relocatable page: no fixes, no I/O, latch free and clean
    /// (FREED pages are dropped from the flush list instead). Leaves it in
    /// REMOVE_PENDING with its exclusive latch held.
    pub(super) fn detach(
        &self,
        lists: &mut PoolLists,
        arena: &[Arc<BufDesc>],
        desc: &BufDesc,
    ) -> Option<(PageId, XGuard)> {
        let seen = desc.state();
        if seen.fix_count() != 0 || seen.is_io_fixed() || !seen.is_in_file() {
            return None;
        }
        let dirty = desc.oldest_modification() != Lsn::ZERO;
        if dirty && !seen.is_freed() {
            return None;
        }
        let guard = desc.frame().try_write_arc()?;
        let id = desc.page_id()?;
        {
            let mut shard = self.hash.shard(id).write();
            if !desc.state.try_begin_remove(seen) {
                return None;
            }
            shard.remove(&id);
        }
        if dirty {
            let mut flush = self.flush.lock();
            flush.remove(desc.idx());
            desc.set_oldest_modification(Lsn::ZERO);
        }
        lists.lru.remove(arena, desc.idx());
        self.lru_len.store(lists.lru.len(), Ordering::Relaxed);
        Some((id, guard))
    }

    /// Second half of eviction, outside the structural mutex.
    pub(super) fn finish_detach(&self, desc: &BufDesc, guard: XGuard) {
        self.notify_invalidated(desc);
        desc.unbind();
        drop(guard);
        self.freed_page_clock.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn release_block(&self, desc: &BufDesc) {
        if desc.state().raw() != NOT_USED {
            fatal!("releasing frame {} in state {:?}", desc.idx(), desc.state());
        }
        self.lists.lock().release(desc.idx());
    }

    fn pop_free(&self) -> Option<Arc<BufDesc>> {
        let mut lists = self.lists.lock();
        while let Some(idx) = lists.free.pop_front() {
            if idx as usize >= lists.withdraw_target {
                lists.withdrawn.push_back(idx);
                continue;
            }
            return self.descriptor(idx);
        }
        None
    }

    fn dirty_over_limit(&self) -> bool {
        let dirty = self.flush.lock().len();
        dirty * 100 > self.capacity() * self.options.max_dirty_pct as usize
    }

    /// Free list, then eviction, then a flush of the LRU tail, then memory
    /// pressure; exhausted after that.
    fn get_free_block(&self) -> Result<Arc<BufDesc>> {
        let mut flushed = false;
        let mut signalled = false;
        loop {
            if let Some(desc) = self.pop_free() {
                return Ok(desc);
            }
            if !flushed && self.dirty_over_limit() {
                flushed = true;
                self.flush_lru_tail()?;
            }
            if let Some((desc, _)) = self.evict_victim() {
                return Ok(desc);
            }
            if !flushed {
                flushed = true;
                if self.flush_lru_tail()? > 0 {
                    continue;
                }
            }
            if !signalled {
                signalled = true;
                self.signal_memory_pressure();
                continue;
            }
            bump(&self.counters.exhausted, 1);
            warn!(frames = self.capacity(), "bufpool.exhausted");
            return Err(BufError::PoolExhausted);
        }
    }

    /// Lends an unused frame to a non-file consumer. Never signals memory
    /// pressure; `None` when nothing is free or evictable.
    pub fn alloc_memory_block(self: &Arc<Self>) -> Option<MemBlock> {
        let desc = self
            .pop_free()
            .or_else(|| self.evict_victim().map(|(desc, _)| desc))?;
        let guard = desc.frame().write_arc();
        desc.state.store(MEMORY);
        Some(MemBlock {
            pool: Arc::clone(self),
            desc,
            guard: Some(guard),
        })
    }

    /// Writes back dirty pages found near the LRU tail.
    pub fn flush_lru_tail(&self) -> Result<usize> {
        let candidates: Vec<(Arc<BufDesc>, PageId)> = {
            let lists = self.lists.lock();
            let arena = self.arena();
            let mut out = Vec::new();
            let mut cur = lists.lru.tail();
            let mut scanned = 0;
            while cur != NIL && scanned < self.options.lru_scan_depth {
                let desc = &arena[cur as usize];
                if desc.oldest_modification().is_position() && !desc.state().is_io_fixed() {
                    if let Some(id) = desc.page_id() {
                        out.push((desc.clone(), id));
                    }
                }
                scanned += 1;
                cur = lists.lru.prev(cur);
            }
            out
        };
        let mut flushed = 0;
        for (desc, id) in candidates {
            if self.flush_desc(&desc, id)? {
                flushed += 1;
            }
        }
        if flushed > 0 {
            debug!(flushed, "bufpool.flush_lru");
        }
        Ok(flushed)
    }

    /// Writes back up to `max` pages, oldest first, whose oldest modification
    /// is below `up_to`.
    pub fn flush_list_batch(&self, max: usize, up_to: Lsn) -> Result<usize> {
        let candidates: Vec<(Arc<BufDesc>, PageId)> = {
            let flush = self.flush.lock();
            // Resize swaps the arena under this mutex; snapshot it only now.
            let arena = self.arena();
            flush
                .iter_oldest()
                .take_while(|&(_, lsn)| lsn < up_to)
                .take(max)
                .filter_map(|(idx, _)| {
                    let desc = arena.get(idx as usize)?;
                    desc.page_id().map(|id| (desc.clone(), id))
                })
                .collect()
        };
        let mut flushed = 0;
        for (desc, id) in candidates {
            if self.flush_desc(&desc, id)? {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Writes back every dirty page that is not latched by someone else.
    pub fn flush_all(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let flushed = self.flush_list_batch(usize::MAX, Lsn(u64::MAX))?;
            total += flushed;
            if flushed == 0 || self.dirty_pages() == 0 {
                return Ok(total);
            }
        }
    }

    /// Writes back one dirty page if its update latch is free. The redo log is
    /// made durable up to the page's LSN first.
    pub fn flush_page(&self, page: &BufRef) -> Result<bool> {
        self.flush_desc(page.desc(), page.id())
    }

    pub(super) fn flush_desc(&self, desc: &BufDesc, id: PageId) -> Result<bool> {
        let Some(guard) = desc.frame().try_upgradable_read_arc() else {
            return Ok(false);
        };
        if desc.page_id() != Some(id) {
            return Ok(false);
        }
        let oldest = desc.oldest_modification();
        if !oldest.is_position() {
            return Ok(false);
        }
        if desc.state().is_freed() {
            self.flush_list_lock().remove_dirty(desc);
            debug!(page = %id, "bufpool.flush_page.freed");
            return Ok(true);
        }
        if !desc.state.try_write_start() {
            return Ok(false);
        }
        let page_lsn = page::page_lsn(&guard[..]);
        let result = self
            .log
            .flush_up_to(page_lsn)
            .and_then(|()| self.io.write(id, &guard[..]));
        desc.state.write_complete();
        result?;
        desc.set_oldest_modification(Lsn::REMOVING);
        self.flush_list_lock().remove_dirty(desc);
        bump(&self.counters.writes, 1);
        debug!(page = %id, lsn = %page_lsn, oldest = %oldest, "bufpool.flush_page");
        drop(guard);
        Ok(true)
    }

    /// Flushes what the redo log needs reclaimed and records a checkpoint at
    /// the oldest position still dirty.
    pub fn checkpoint(&self) -> Result<Lsn> {
        let floor = self.log.checkpoint_floor();
        if floor.is_position() {
            self.flush_list_batch(usize::MAX, floor)?;
        }
        let lsn = {
            let flush = self.flush.lock();
            let current = self.log.current_lsn();
            flush.oldest().map_or(current, |oldest| oldest.min(current))
        };
        self.log.checkpoint(lsn)?;
        info!(checkpoint = %lsn, floor = %floor, "bufpool.checkpoint");
        Ok(lsn)
    }

    /// Writes back everything and checkpoints the log.
    pub fn close(&self) -> Result<()> {
        self.flush_all()?;
        if self.dirty_pages() != 0 {
            return Err(BufError::Invalid("dirty pages still latched at close"));
        }
        self.log.flush_up_to(self.log.current_lsn())?;
        let lsn = self.checkpoint()?;
        info!(checkpoint = %lsn, "bufpool.close");
        Ok(())
    }

    /// Locks the flush list; held by commits across append, stamp and insert.
    pub fn flush_list_lock(&self) -> FlushListGuard<'_> {
        FlushListGuard {
            pool: self,
            list: self.flush.lock(),
        }
    }

    /// Adds a page to the flush list at `lsn` unless it is already dirty.
    pub fn insert_dirty(&self, page: &BufRef, lsn: Lsn) -> bool {
        self.flush_list_lock().insert_dirty(page.desc(), lsn)
    }

    /// Drops a page from the flush list and marks it clean.
    pub fn remove_dirty(&self, page: &BufRef) -> bool {
        self.flush_list_lock().remove_dirty(page.desc())
    }

    /// Oldest unflushed position, in O(1).
    pub fn oldest_modification(&self) -> Option<Lsn> {
        self.flush.lock().oldest()
    }

    /// Pages on the flush list.
    pub fn dirty_pages(&self) -> usize {
        self.flush.lock().len()
    }

    /// Re-fixes a hinted page if its slot still holds the same binding and
    /// the page is in-file. The check and the fix happen under the page-hash
    /// shard latch.
    pub fn upgrade_hint(&self, hint: &PageHint) -> Option<BufRef> {
        let shard = self.hash.shard(hint.id).read();
        let desc = shard.get(&hint.id)?;
        if desc.idx() != hint.frame || desc.generation() != hint.generation {
            return None;
        }
        let state = desc.state();
        if !state.is_in_file() || state.is_read_fixed() {
            return None;
        }
        desc.state.fix();
        Some(BufRef::adopt(desc.clone(), hint.id))
    }

    /// True if `id` is resident.
    pub fn contains(&self, id: PageId) -> bool {
        self.hash.shard(id).read().contains_key(&id)
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> PoolStats {
        let (free, lru, old, withdrawn) = {
            let lists = self.lists.lock();
            (
                lists.free.len(),
                lists.lru.len(),
                lists.lru.old_len(),
                lists.withdrawn.len(),
            )
        };
        let (dirty, oldest) = {
            let flush = self.flush.lock();
            (flush.len(), flush.oldest())
        };
        let c = &self.counters;
        PoolStats {
            capacity: self.capacity(),
            free,
            lru,
            old,
            withdrawn,
            dirty,
            oldest_modification: oldest.unwrap_or(Lsn::ZERO),
            hits: read(&c.hits),
            misses: read(&c.misses),
            reads: read(&c.reads),
            read_failures: read(&c.read_failures),
            writes: read(&c.writes),
            evictions: read(&c.evictions),
            made_young: read(&c.made_young),
            not_made_young: read(&c.not_made_young),
            flush_insert_scan_steps: read(&c.flush_insert_scan_steps),
            exhausted: read(&c.exhausted),
            memory_pressure: read(&c.memory_pressure),
        }
    }

    /// Verifies list membership, hash consistency and flush-list order.
    /// Meant for quiescent pools; transient states fail the check.
    pub fn check_invariants(&self) -> Result<()> {
        fn invalid(reason: &'static str) -> Result<()> {
            Err(BufError::Invalid(reason))
        }
        let lists = self.lists.lock();
        let arena = self.arena();
        let mut hashed = 0usize;
        for desc in arena.iter() {
            let idx = desc.idx();
            let state = desc.state();
            let memberships = lists.free.contains(idx) as u8
                + lists.lru.contains(idx) as u8
                + lists.withdrawn.contains(idx) as u8;
            if state.is_in_file() {
                if !lists.lru.contains(idx) || memberships != 1 {
                    return invalid("in-file page must be on the LRU list only");
                }
                let Some(id) = desc.page_id() else {
                    return invalid("in-file page without identifier");
                };
                match self.hash.get(id) {
                    Some(found) if Arc::ptr_eq(&found, desc) => hashed += 1,
                    _ => return invalid("in-file page missing from page hash"),
                }
            } else if state.raw() == MEMORY {
                if memberships != 0 {
                    return invalid("memory block linked into a pool list");
                }
            } else if state.raw() == NOT_USED {
                if memberships != 1 || lists.lru.contains(idx) {
                    return invalid("unused frame must be on the free or withdrawn list");
                }
            } else {
                return invalid("frame in a transient state");
            }
        }
        if hashed != self.hash.len() {
            return invalid("page hash holds unlisted descriptors");
        }
        lists.lru.check(&arena).map_err(BufError::Invalid)?;
        let flush = self.flush.lock();
        if !flush.is_sorted() {
            return invalid("flush list out of order");
        }
        let mut dirty = 0usize;
        for desc in arena.iter() {
            let oldest = desc.oldest_modification();
            if !oldest.is_position() {
                continue;
            }
            if !flush.contains(desc.idx()) || flush.key(desc.idx()) != oldest {
                return invalid("dirty page missing from flush list");
            }
            if !lists.lru.contains(desc.idx()) {
                return invalid("dirty page not on the LRU list");
            }
            dirty += 1;
        }
        if dirty != flush.len() {
            return invalid("flush list holds clean pages");
        }
        Ok(())
    }
}

/// Flush list held locked.
pub struct FlushListGuard<'a> {
    pool: &'a BufPool,
    list: MutexGuard<'a, FlushList>,
}

impl FlushListGuard<'_> {
    /// Inserts at `lsn` unless the page is already dirty, in which case its
    /// earlier position stands. Returns whether the page was inserted.
    pub fn insert_dirty(&mut self, desc: &BufDesc, lsn: Lsn) -> bool {
        if !desc.state().is_in_file() {
            fatal!("dirtying frame {} in state {:?}", desc.idx(), desc.state());
        }
        let idx = desc.idx();
        let current = desc.oldest_modification();
        if current.is_position() {
            if !self.list.contains(idx) {
                fatal!("dirty frame {idx} missing from the flush list");
            }
            return false;
        }
        if current == Lsn::REMOVING {
            self.list.remove(idx);
        }
        let steps = self.list.insert(idx, lsn);
        desc.set_oldest_modification(lsn);
        bump(&self.pool.counters.flush_insert_scan_steps, steps);
        true
    }

    /// Removes the page and marks it clean.
    pub fn remove_dirty(&mut self, desc: &BufDesc) -> bool {
        let removed = self.list.remove(desc.idx());
        desc.set_oldest_modification(Lsn::ZERO);
        removed
    }

    /// Pages on the list.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// True when nothing is dirty.
    pub fn is_empty(&self) -> bool {
        self.list.len() == 0
    }

    /// Oldest unflushed position.
    pub fn oldest(&self) -> Option<Lsn> {
        self.list.oldest()
    }
}

/// A frame lent out of the pool in MEMORY state. Returned on drop.
pub struct MemBlock {
    pool: Arc<BufPool>,
    desc: Arc<BufDesc>,
    guard: Option<XGuard>,
}

impl MemBlock {
    /// Arena slot of the borrowed frame.
    pub fn frame(&self) -> u32 {
        self.desc.idx()
    }

    /// Frame bytes.
    pub fn bytes(&self) -> &[u8] {
        match &self.guard {
            Some(guard) => &guard[..],
            None => &[],
        }
    }

    /// Mutable frame bytes.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.guard {
            Some(guard) => &mut guard[..],
            None => &mut [],
        }
    }
}

impl Drop for MemBlock {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.desc.state.store(NOT_USED);
        self.pool.release_block(&self.desc);
    }
}

impl fmt::Debug for MemBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemBlock")
            .field("frame", &self.desc.idx())
            .finish()
    }
}
