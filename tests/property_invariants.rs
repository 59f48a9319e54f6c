#![allow(missing_docs)]

use std::sync::Arc;

use bufpool::buffer::state::{
    PageState, StateTag, FREED, MEMORY, NOT_USED, READ_PENDING, REINIT, REMOVE_PENDING, UNFIXED,
    WRITE_PENDING,
};
use bufpool::buffer::{BufPool, BufRef, FetchMode};
use bufpool::mtr::{LatchMode, Mtr};
use bufpool::primitives::io::{FilePageIo, MemFileIo};
use bufpool::primitives::wal::{MemRedoLog, RedoLog};
use bufpool::types::page::PAGE_HDR_LEN;
use bufpool::{BufError, Lsn, PageId, PoolOptions};
use proptest::prelude::*;

const PAGE: u32 = 1024;
const FRAMES: usize = 8;
const PAGES: u32 = 24;
const MAX_HELD: usize = 4;

#[derive(Debug, Clone)]
enum Op {
    Fix(u32),
    Hold(u32),
    Release,
    Modify { page: u32, offset: usize, byte: u8 },
    Create(u32),
    Free(u32),
    Evict,
    FlushBatch(usize),
    Checkpoint,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..PAGES).prop_map(Op::Fix),
        2 => (0..PAGES).prop_map(Op::Hold),
        2 => Just(Op::Release),
        4 => (0..PAGES, PAGE_HDR_LEN..PAGE as usize, any::<u8>())
            .prop_map(|(page, offset, byte)| Op::Modify { page, offset, byte }),
        1 => (0..PAGES).prop_map(Op::Create),
        1 => (0..PAGES).prop_map(Op::Free),
        2 => Just(Op::Evict),
        1 => (1usize..6).prop_map(Op::FlushBatch),
        1 => Just(Op::Checkpoint),
    ]
}

fn setup() -> (Arc<BufPool>, Arc<MemRedoLog>) {
    let io = Arc::new(FilePageIo::new(PAGE as usize));
    io.attach(0, Arc::new(MemFileIo::new()));
    let log = Arc::new(MemRedoLog::new());
    let pool = BufPool::new(PoolOptions::with_frames(PAGE, FRAMES), io, log.clone()).unwrap();
    (pool, log)
}

fn tolerable(err: &BufError) -> bool {
    err.is_retryable() || matches!(err, BufError::PageFreed(_))
}

fn apply(pool: &Arc<BufPool>, held: &mut Vec<BufRef>, op: &Op) -> Result<(), BufError> {
    let id = |n: u32| PageId::new(0, n);
    match *op {
        Op::Fix(n) => {
            pool.fix(id(n), FetchMode::Normal)?;
        }
        Op::Hold(n) => {
            if held.len() < MAX_HELD {
                held.push(pool.fix(id(n), FetchMode::Normal)?);
            }
        }
        Op::Release => {
            held.pop();
        }
        Op::Modify { page, offset, byte } => {
            let mut mtr = Mtr::new(pool.clone());
            mtr.start();
            let slot = mtr.get_page(id(page), LatchMode::X, FetchMode::Normal)?;
            mtr.write(slot, offset, &[byte])?;
            mtr.commit();
        }
        Op::Create(n) => {
            let (page, guard) = pool.create(id(n))?;
            drop(guard);
            drop(page);
        }
        Op::Free(n) => {
            let page = pool.fix(id(n), FetchMode::PossiblyFreed)?;
            pool.free_page(&page)?;
        }
        Op::Evict => {
            pool.evict_one();
        }
        Op::FlushBatch(max) => {
            pool.flush_list_batch(max, Lsn(u64::MAX))?;
        }
        Op::Checkpoint => {
            pool.checkpoint()?;
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_random_ops_keep_pool_consistent(ops in prop::collection::vec(arb_op(), 1..120)) {
        let (pool, log) = setup();
        let mut held = Vec::new();
        for op in &ops {
            if let Err(err) = apply(&pool, &mut held, op) {
                prop_assert!(tolerable(&err), "{:?} failed: {}", op, err);
            }
            prop_assert!(pool.check_invariants().is_ok(), "after {:?}: {:?}", op, pool.check_invariants());
            let stats = pool.stats();
            prop_assert_eq!(stats.lru + stats.free, FRAMES);
            prop_assert!(stats.dirty <= stats.lru);
            if let Some(oldest) = pool.oldest_modification() {
                prop_assert!(oldest < log.current_lsn());
            }
        }
        drop(held);
        pool.flush_all()?;
        prop_assert_eq!(pool.dirty_pages(), 0);
        prop_assert_eq!(pool.oldest_modification(), None);
    }

    #[test]
    fn prop_modified_bytes_survive_eviction(
        writes in prop::collection::vec((0..PAGES, PAGE_HDR_LEN..PAGE as usize, any::<u8>()), 1..60)
    ) {
        let (pool, _) = setup();
        let mut expected = std::collections::BTreeMap::new();
        for (page, offset, byte) in writes {
            let op = Op::Modify { page, offset, byte };
            apply(&pool, &mut Vec::new(), &op)?;
            expected.insert((page, offset), byte);
        }
        for ((page, offset), byte) in expected {
            let page = pool.fix(PageId::new(0, page), FetchMode::Normal)?;
            prop_assert_eq!(page.s_lock()[offset], byte);
        }
        pool.check_invariants()?;
    }

    #[test]
    fn prop_state_word_decodes_its_tag_and_count(
        tag in prop::sample::select(vec![FREED, UNFIXED, REINIT, READ_PENDING, WRITE_PENDING]),
        count in 0u32..(1 << 20),
    ) {
        let state = PageState::with_fix_count(tag, count);
        prop_assert_eq!(state.fix_count(), count);
        prop_assert!(state.is_in_file());
        let expected = match tag {
            FREED => StateTag::Freed,
            UNFIXED => StateTag::Unfixed,
            REINIT => StateTag::Reinit,
            READ_PENDING => StateTag::ReadPending,
            _ => StateTag::WritePending,
        };
        prop_assert_eq!(state.tag(), expected);
        prop_assert_eq!(state.is_freed(), tag == FREED);
        prop_assert_eq!(state.is_reinit(), tag == REINIT);
        prop_assert_eq!(state.is_read_fixed(), tag == READ_PENDING);
        prop_assert_eq!(state.is_write_fixed(), tag == WRITE_PENDING);
        prop_assert_eq!(state.is_io_fixed(), tag >= READ_PENDING);
    }
}

#[test]
fn unbound_states_carry_no_fixes() {
    for (raw, tag) in [
        (NOT_USED, StateTag::NotUsed),
        (MEMORY, StateTag::Memory),
        (REMOVE_PENDING, StateTag::RemovePending),
    ] {
        let state = PageState(raw);
        assert_eq!(state.tag(), tag);
        assert_eq!(state.fix_count(), 0);
        assert!(!state.is_in_file());
        assert!(!state.is_io_fixed());
    }
}
