//! Identifier to descriptor map, split into independently latched shards.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHasher};

use super::descriptor::BufDesc;
use crate::types::PageId;

pub(crate) type Shard = RwLock<FxHashMap<PageId, Arc<BufDesc>>>;

pub(crate) struct PageHash {
    shards: Box<[Shard]>,
    mask: usize,
}

impl PageHash {
    pub fn new(shards: usize) -> Self {
        let count = shards.max(1).next_power_of_two();
        Self {
            shards: (0..count)
                .map(|_| RwLock::new(FxHashMap::default()))
                .collect(),
            mask: count - 1,
        }
    }

    pub fn shard(&self, id: PageId) -> &Shard {
        let mut hasher = FxHasher::default();
        id.hash(&mut hasher);
        &self.shards[hasher.finish() as usize & self.mask]
    }

    /// One-shot lookup taking only the shard latch.
    pub fn get(&self, id: PageId) -> Option<Arc<BufDesc>> {
        self.shard(id).read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }
}
