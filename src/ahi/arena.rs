//! Fixed-size index nodes stored inside frames borrowed from the pool.
//!
//! Nodes are addressed by a `u32` (block number times nodes per block plus
//! slot) and encoded big-endian into the block bytes. Free nodes are chained
//! through their `next` field.

use crate::buffer::MemBlock;
use crate::types::PageId;

pub(crate) const NIL_NODE: u32 = u32::MAX;

const NODE_LEN: usize = 40;

mod field {
    pub const FOLD: usize = 0;
    pub const SPACE: usize = 8;
    pub const PAGE_NO: usize = 12;
    pub const FRAME: usize = 16;
    pub const GENERATION: usize = 20;
    pub const OFFSET: usize = 24;
    pub const NEXT: usize = 28;
    pub const PAGE_NEXT: usize = 32;
    pub const PAGE_PREV: usize = 36;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Node {
    pub fold: u64,
    pub id: PageId,
    pub frame: u32,
    pub generation: u32,
    pub offset: u32,
    /// Next node in the same hash cell.
    pub next: u32,
    /// Neighbours among the nodes pointing at the same frame.
    pub page_next: u32,
    pub page_prev: u32,
}

impl Node {
    fn encode(&self, dst: &mut [u8]) {
        dst[field::FOLD..field::FOLD + 8].copy_from_slice(&self.fold.to_be_bytes());
        put_u32(dst, field::SPACE, self.id.space);
        put_u32(dst, field::PAGE_NO, self.id.page_no);
        put_u32(dst, field::FRAME, self.frame);
        put_u32(dst, field::GENERATION, self.generation);
        put_u32(dst, field::OFFSET, self.offset);
        put_u32(dst, field::NEXT, self.next);
        put_u32(dst, field::PAGE_NEXT, self.page_next);
        put_u32(dst, field::PAGE_PREV, self.page_prev);
    }

    fn decode(src: &[u8]) -> Self {
        let mut fold = [0u8; 8];
        fold.copy_from_slice(&src[field::FOLD..field::FOLD + 8]);
        Self {
            fold: u64::from_be_bytes(fold),
            id: PageId::new(get_u32(src, field::SPACE), get_u32(src, field::PAGE_NO)),
            frame: get_u32(src, field::FRAME),
            generation: get_u32(src, field::GENERATION),
            offset: get_u32(src, field::OFFSET),
            next: get_u32(src, field::NEXT),
            page_next: get_u32(src, field::PAGE_NEXT),
            page_prev: get_u32(src, field::PAGE_PREV),
        }
    }
}

fn put_u32(dst: &mut [u8], at: usize, value: u32) {
    dst[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

fn get_u32(src: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([src[at], src[at + 1], src[at + 2], src[at + 3]])
}

pub(crate) struct NodeArena {
    blocks: Vec<MemBlock>,
    per_block: usize,
    free: u32,
    used: usize,
}

impl NodeArena {
    pub fn new(page_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            per_block: (page_size / NODE_LEN).max(1),
            free: NIL_NODE,
            used: 0,
        }
    }

    pub fn blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn has_free(&self) -> bool {
        self.free != NIL_NODE
    }

    /// Threads every slot of a new block onto the free chain.
    pub fn add_block(&mut self, block: MemBlock) {
        let base = (self.blocks.len() * self.per_block) as u32;
        self.blocks.push(block);
        for slot in (0..self.per_block as u32).rev() {
            self.set_next(base + slot, self.free);
            self.free = base + slot;
        }
    }

    pub fn alloc(&mut self) -> Option<u32> {
        if self.free == NIL_NODE {
            return None;
        }
        let node = self.free;
        self.free = self.read(node).next;
        self.used += 1;
        Some(node)
    }

    pub fn release(&mut self, node: u32) {
        self.set_next(node, self.free);
        self.free = node;
        self.used -= 1;
    }

    fn locate(&self, node: u32) -> (usize, usize) {
        let node = node as usize;
        (node / self.per_block, (node % self.per_block) * NODE_LEN)
    }

    pub fn read(&self, node: u32) -> Node {
        let (block, at) = self.locate(node);
        Node::decode(&self.blocks[block].bytes()[at..at + NODE_LEN])
    }

    pub fn write(&mut self, node: u32, value: &Node) {
        let (block, at) = self.locate(node);
        value.encode(&mut self.blocks[block].bytes_mut()[at..at + NODE_LEN]);
    }

    pub fn set_next(&mut self, node: u32, next: u32) {
        let (block, at) = self.locate(node);
        put_u32(self.blocks[block].bytes_mut(), at + field::NEXT, next);
    }

    /// Empties the arena and hands its blocks back for release.
    pub fn take_blocks(&mut self) -> Vec<MemBlock> {
        self.free = NIL_NODE;
        self.used = 0;
        std::mem::take(&mut self.blocks)
    }
}
