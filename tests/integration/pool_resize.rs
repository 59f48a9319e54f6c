#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

use bufpool::ahi::AdaptiveHashIndex;
use bufpool::buffer::{BufPool, FetchMode};
use bufpool::mtr::Mtr;
use bufpool::primitives::io::{FilePageIo, MemFileIo};
use bufpool::primitives::wal::MemRedoLog;
use bufpool::{Lsn, PageId, PoolOptions, Result};
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

fn setup(frames: usize) -> Result<Arc<BufPool>> {
    let io = Arc::new(FilePageIo::new(PAGE as usize));
    io.attach(0, Arc::new(MemFileIo::new()));
    BufPool::new(
        PoolOptions::with_frames(PAGE, frames),
        io,
        Arc::new(MemRedoLog::new()),
    )
}

#[test]
fn shrink_waits_for_fixed_page_above_boundary() -> Result<()> {
    init_tracing();
    let pool = setup(8)?;
    let mut pinned = None;
    for n in 0..8 {
        let page = pool.fix(PageId::new(0, n), FetchMode::Normal)?;
        if page.desc().idx() == 7 {
            pinned = Some(page);
        }
    }
    let pinned = pinned.expect("every frame was used");

    let done = Arc::new(AtomicBool::new(false));
    let resizer = {
        let pool = pool.clone();
        let done = done.clone();
        thread::spawn(move || {
            let result = pool.resize(4);
            done.store(true, Ordering::SeqCst);
            result
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!done.load(Ordering::SeqCst));
    assert_eq!(pool.capacity(), 8);

    drop(pinned);
    resizer.join().unwrap()?;
    assert_eq!(pool.capacity(), 4);
    let stats = pool.stats();
    assert_eq!(stats.withdrawn, 0);
    assert_eq!(stats.lru + stats.free, 4);
    pool.check_invariants()?;
    Ok(())
}

#[test]
fn shrink_writes_back_dirty_pages_first() -> Result<()> {
    init_tracing();
    let pool = setup(8)?;
    let mut mtr = Mtr::new(pool.clone());
    for n in 0..8u32 {
        mtr.start();
        let slot = mtr.create_page(PageId::new(0, n))?;
        mtr.write(slot, 500, &n.to_be_bytes())?;
        mtr.commit();
    }
    pool.resize(2)?;
    assert_eq!(pool.capacity(), 2);
    pool.check_invariants()?;

    pool.resize(6)?;
    for n in 0..8u32 {
        let page = pool.fix(PageId::new(0, n), FetchMode::Normal)?;
        let guard = page.s_lock();
        assert_eq!(guard[500..504], n.to_be_bytes());
    }
    pool.check_invariants()?;
    Ok(())
}

#[test]
fn shrink_reclaims_index_frames() -> Result<()> {
    init_tracing();
    let pool = setup(6)?;
    let index = AdaptiveHashIndex::new(pool.clone());
    let page = pool.fix(PageId::new(0, 1), FetchMode::Normal)?;
    assert!(index.insert(7, &page, 40));
    drop(page);

    pool.resize(3)?;
    assert!(!index.is_enabled());
    assert_eq!(index.stats().blocks, 0);
    assert_eq!(pool.capacity(), 3);
    pool.check_invariants()?;
    Ok(())
}

#[test]
fn flush_batches_keep_up_with_growing_pool() -> Result<()> {
    init_tracing();
    let pool = setup(4)?;
    let stop = Arc::new(AtomicBool::new(false));
    let flusher = {
        let pool = pool.clone();
        let stop = stop.clone();
        thread::spawn(move || -> Result<usize> {
            let mut total = 0;
            while !stop.load(Ordering::Relaxed) {
                total += pool.flush_list_batch(usize::MAX, Lsn(u64::MAX))?;
            }
            Ok(total)
        })
    };

    let mut mtr = Mtr::new(pool.clone());
    let mut next = 0u32;
    for step in 1..=12usize {
        pool.resize(4 + 4 * step)?;
        for _ in 0..4 {
            mtr.start();
            let slot = mtr.create_page(PageId::new(0, next))?;
            mtr.write(slot, 300, &next.to_be_bytes())?;
            mtr.commit();
            next += 1;
        }
    }
    stop.store(true, Ordering::Relaxed);
    flusher.join().unwrap()?;

    pool.flush_all()?;
    assert_eq!(pool.dirty_pages(), 0);
    for n in 0..next {
        let page = pool.fix(PageId::new(0, n), FetchMode::Normal)?;
        assert_eq!(page.s_lock()[300..304], n.to_be_bytes());
    }
    pool.check_invariants()?;
    Ok(())
}
