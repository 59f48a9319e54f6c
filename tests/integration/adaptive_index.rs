#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread;

use bufpool::ahi::{fold_bytes, AdaptiveHashIndex};
use bufpool::buffer::{BufPool, FetchMode};
use bufpool::primitives::io::{FilePageIo, MemFileIo};
use bufpool::primitives::wal::MemRedoLog;
use bufpool::{PageId, PoolOptions, Result};
use tracing_subscriber::EnvFilter;

const PAGE: u32 = 1024;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bufpool=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn setup(frames: usize) -> Result<(Arc<BufPool>, Arc<AdaptiveHashIndex>)> {
    let io = Arc::new(FilePageIo::new(PAGE as usize));
    io.attach(0, Arc::new(MemFileIo::new()));
    let mut options = PoolOptions::with_frames(PAGE, frames);
    options.ahi_cells = 64;
    let pool = BufPool::new(options, io, Arc::new(MemRedoLog::new()))?;
    let index = AdaptiveHashIndex::new(pool.clone());
    Ok((pool, index))
}

#[test]
fn removed_page_is_not_found() -> Result<()> {
    init_tracing();
    let (pool, index) = setup(8)?;
    let page = pool.fix(PageId::new(0, 9), FetchMode::Normal)?;
    assert!(index.insert(42, &page, 120));
    let hit = index.lookup_and_validate(42, 120).expect("entry present");
    assert_eq!(hit.id(), page.id());
    drop(hit);

    assert_eq!(index.remove_all_for_page(page.desc()), 1);
    assert!(index.lookup_and_validate(42, 120).is_none());
    assert_eq!(page.desc().ahi_pointers(), 0);
    Ok(())
}

#[test]
fn re_created_page_loses_its_entries() -> Result<()> {
    init_tracing();
    let (pool, index) = setup(8)?;
    let id = PageId::new(0, 4);
    let (page, guard) = pool.create(id)?;
    drop(guard);
    assert!(index.insert(fold_bytes(b"alpha"), &page, 64));
    assert!(index.insert(fold_bytes(b"beta"), &page, 80));
    pool.free_page(&page)?;
    drop(page);

    let (again, guard) = pool.create(id)?;
    drop(guard);
    assert_eq!(index.stats().entries, 0);
    assert_eq!(again.desc().ahi_pointers(), 0);
    assert!(index.lookup_and_validate(fold_bytes(b"alpha"), 64).is_none());
    Ok(())
}

#[test]
fn hits_survive_eviction_churn_without_stale_pages() -> Result<()> {
    init_tracing();
    let (pool, index) = setup(12)?;
    let stop = Arc::new(AtomicBool::new(false));

    let churn = {
        let pool = pool.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let mut n = 0u32;
            while !stop.load(Ordering::Relaxed) {
                if let Ok(page) = pool.fix(PageId::new(1, n % 64), FetchMode::Normal) {
                    drop(page);
                }
                n += 1;
            }
        })
    };

    for round in 0..500u32 {
        let id = PageId::new(0, round % 8);
        let Ok(page) = pool.fix(id, FetchMode::Normal) else {
            continue;
        };
        let fold = u64::from(round % 8);
        index.insert(fold, &page, round % 8);
        drop(page);
        if let Some(hit) = index.lookup_and_validate(fold, round % 8) {
            assert_eq!(hit.id(), id);
        }
    }
    stop.store(true, Ordering::Relaxed);
    churn.join().unwrap();

    let stats = index.stats();
    assert!(stats.hits > 0);
    pool.check_invariants()?;
    Ok(())
}

#[test]
fn concurrent_inserts_and_lookups_survive_eviction_and_disable() -> Result<()> {
    init_tracing();
    const THREADS: u32 = 3;
    const PAGES_EACH: u32 = 8;
    let (pool, index) = setup(20)?;
    let stop = Arc::new(AtomicBool::new(false));

    let evictor = {
        let pool = pool.clone();
        let index = index.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let mut n = 0u32;
            loop {
                pool.evict_one();
                if n % 32 == 0 {
                    pool.signal_memory_pressure();
                    index.enable();
                }
                n += 1;
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                thread::yield_now();
            }
        })
    };

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let pool = pool.clone();
            let index = index.clone();
            thread::spawn(move || {
                for round in 0..600u32 {
                    let page_no = t * PAGES_EACH + round % PAGES_EACH;
                    if let Ok(page) = pool.fix(PageId::new(0, page_no), FetchMode::Normal) {
                        index.insert(u64::from(page_no), &page, page_no);
                    }
                    // any page, including ones owned by other threads
                    let lookup_no = (round * 7 + t) % (THREADS * PAGES_EACH);
                    if let Some(hit) = index.lookup_and_validate(u64::from(lookup_no), lookup_no) {
                        assert_eq!(hit.id(), PageId::new(0, lookup_no));
                        assert!(!hit.state().is_freed());
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    evictor.join().unwrap();

    let stats = index.stats();
    assert!(stats.inserts > 0);
    assert!(pool.stats().memory_pressure > 0);
    pool.check_invariants()?;

    index.enable();
    let page = pool.fix(PageId::new(0, 3), FetchMode::Normal)?;
    assert!(index.insert(3, &page, 3));
    drop(page);
    let hit = index.lookup_and_validate(3, 3).expect("entry present");
    assert_eq!(hit.id(), PageId::new(0, 3));
    Ok(())
}
