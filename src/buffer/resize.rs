//! Online resizing of the frame arena.
//!
//! Growing appends descriptors and hands them to the free list. Shrinking
//! sets a withdraw target first: from then on nothing at or above it is handed
//! out, and frames there drain into the withdrawn list as they become free.
//! Resident pages above the target are written back if dirty and evicted;
//! fixed or latched ones are waited for. Once every frame above the target is
//! withdrawn the arena is cut.

use std::cmp::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::descriptor::BufDesc;
use super::list::NIL;
use super::pool::BufPool;
use crate::error::{BufError, Result};

const WITHDRAW_POLL: Duration = Duration::from_millis(10);
const WITHDRAW_WARN_EVERY: u32 = 100;

#[derive(Debug, Default)]
struct WithdrawPass {
    withdrawn: usize,
    flushed: usize,
    pending: usize,
}

impl BufPool {
    /// Changes the number of frames. Shrinking blocks until every page above
    /// the new size is unfixed and unlatched.
    pub fn resize(&self, frames: usize) -> Result<()> {
        if frames == 0 {
            return Err(BufError::Config("pool needs at least one frame".into()));
        }
        if frames >= NIL as usize {
            return Err(BufError::Config(format!("{frames} frames exceed the arena limit")));
        }
        let _resizing = self.resizing.lock();
        match frames.cmp(&self.capacity()) {
            Ordering::Equal => Ok(()),
            Ordering::Greater => {
                self.grow(frames);
                Ok(())
            }
            Ordering::Less => self.shrink(frames),
        }
    }

    fn grow(&self, frames: usize) {
        let mut lists = self.lists.lock();
        let mut flush = self.flush.lock();
        let old = {
            let mut arena = self.arena.write();
            let old = arena.len();
            let mut descs: Vec<Arc<BufDesc>> = arena.to_vec();
            descs.extend((old..frames).map(|idx| Arc::new(BufDesc::new(idx as u32, self.page_size))));
            *arena = Arc::from(descs);
            old
        };
        lists.free.grow(frames);
        lists.lru.grow(frames);
        lists.withdrawn.grow(frames);
        flush.grow(frames);
        for idx in old..frames {
            lists.free.push_back(idx as u32);
        }
        info!(from = old, to = frames, "bufpool.resize.grow");
    }

    fn shrink(&self, frames: usize) -> Result<()> {
        let from = self.capacity();
        self.lists.lock().withdraw_target = frames;
        info!(from, to = frames, "bufpool.resize.shrink");
        self.signal_memory_pressure();

        let mut attempts = 0u32;
        loop {
            let pass = match self.withdraw_pass(frames) {
                Ok(pass) => pass,
                Err(err) => {
                    self.abandon_shrink();
                    return Err(err);
                }
            };
            if pass.pending == 0 {
                break;
            }
            attempts += 1;
            if attempts % WITHDRAW_WARN_EVERY == 0 {
                warn!(pending = pass.pending, attempts, "bufpool.resize.withdraw_waiting");
            }
            thread::sleep(WITHDRAW_POLL);
        }

        let mut lists = self.lists.lock();
        let mut flush = self.flush.lock();
        lists.withdrawn.clear();
        lists.free.truncate(frames);
        lists.lru.truncate(frames);
        lists.withdrawn.truncate(frames);
        flush.truncate(frames);
        {
            let mut arena = self.arena.write();
            let kept = arena[..frames].to_vec();
            *arena = Arc::from(kept);
        }
        lists.withdraw_target = usize::MAX;
        info!(frames, "bufpool.resize.done");
        Ok(())
    }

    /// Puts withdrawn frames back into service after a failed shrink.
    fn abandon_shrink(&self) {
        let mut lists = self.lists.lock();
        lists.withdraw_target = usize::MAX;
        while let Some(idx) = lists.withdrawn.pop_front() {
            lists.free.push_back(idx);
        }
        warn!("bufpool.resize.abandoned");
    }

    fn withdraw_pass(&self, target: usize) -> Result<WithdrawPass> {
        let arena = self.arena();
        let mut pass = WithdrawPass::default();
        for desc in &arena[target..] {
            if !desc.oldest_modification().is_position() {
                continue;
            }
            if let Some(id) = desc.page_id() {
                if self.flush_desc(desc, id)? {
                    pass.flushed += 1;
                }
            }
        }

        let mut detached = Vec::new();
        {
            let mut lists = self.lists.lock();
            for desc in &arena[target..] {
                let idx = desc.idx();
                if lists.withdrawn.contains(idx) {
                    continue;
                }
                if lists.free.remove(idx) {
                    lists.withdrawn.push_back(idx);
                    pass.withdrawn += 1;
                } else if let Some((_, guard)) = self.detach(&mut lists, &arena, desc) {
                    detached.push((desc.clone(), guard));
                } else {
                    pass.pending += 1;
                }
            }
        }
        for (desc, guard) in detached {
            self.finish_detach(&desc, guard);
            self.release_block(&desc);
            pass.withdrawn += 1;
        }
        debug!(
            target,
            withdrawn = pass.withdrawn,
            flushed = pass.flushed,
            pending = pass.pending,
            "bufpool.resize.withdraw"
        );
        Ok(pass)
    }
}
