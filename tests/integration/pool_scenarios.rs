#![allow(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Condvar, Mutex, Once};
use std::thread;
use std::time::Duration;

use bufpool::buffer::{BufPool, FetchMode};
use bufpool::primitives::io::{FilePageIo, MemFileIo, PageIo};
use bufpool::primitives::wal::MemRedoLog;
use bufpool::{BufError, PageId, PoolOptions, Result};
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

fn options(frames: usize) -> PoolOptions {
    let mut options = PoolOptions::with_frames(PAGE, frames);
    options.hash_shards = 8;
    options
}

/// Page I/O whose reads park until released, counting every read.
#[derive(Default)]
struct GatedIo {
    reads: AtomicUsize,
    open: Mutex<bool>,
    cond: Condvar,
}

impl GatedIo {
    fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.cond.notify_all();
    }
}

impl PageIo for GatedIo {
    fn read(&self, _id: PageId, dst: &mut [u8]) -> Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cond.wait(open).unwrap();
        }
        dst.fill(0);
        Ok(())
    }

    fn write(&self, _id: PageId, _src: &[u8]) -> Result<()> {
        Ok(())
    }
}

#[test]
fn exhausted_pool_reports_retryable_error() -> Result<()> {
    init_tracing();
    let io = Arc::new(FilePageIo::new(PAGE as usize));
    io.attach(0, Arc::new(MemFileIo::new()));
    let pool = BufPool::new(options(10), io, Arc::new(MemRedoLog::new()))?;

    let held: Vec<_> = (0..10)
        .map(|n| pool.fix(PageId::new(0, n), FetchMode::Normal))
        .collect::<Result<_>>()?;
    let err = pool.fix(PageId::new(0, 10), FetchMode::Normal).unwrap_err();
    assert!(matches!(err, BufError::PoolExhausted));
    assert!(err.is_retryable());
    assert_eq!(pool.stats().exhausted, 1);

    drop(held);
    let page = pool.fix(PageId::new(0, 10), FetchMode::Normal)?;
    assert_eq!(page.id(), PageId::new(0, 10));
    drop(page);
    pool.check_invariants()?;
    Ok(())
}

#[test]
fn concurrent_fixers_share_one_read() -> Result<()> {
    init_tracing();
    let io = Arc::new(GatedIo::default());
    let pool = BufPool::new(options(4), io.clone(), Arc::new(MemRedoLog::new()))?;
    let id = PageId::new(3, 77);
    let barrier = Arc::new(Barrier::new(3));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let pool = pool.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let page = pool.fix(id, FetchMode::Normal).unwrap();
                (page.desc().idx(), page.desc().generation())
            })
        })
        .collect();
    barrier.wait();
    while !pool.contains(id) {
        thread::sleep(Duration::from_millis(1));
    }
    // give the second thread time to find the page mid-read
    thread::sleep(Duration::from_millis(50));
    io.release();

    let seen: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(seen[0], seen[1]);
    assert_eq!(io.reads.load(Ordering::SeqCst), 1);
    let stats = pool.stats();
    assert_eq!(stats.reads, 1);
    assert_eq!(stats.misses, 1);
    pool.check_invariants()?;
    Ok(())
}

#[test]
fn no_wait_fix_refuses_page_under_read() -> Result<()> {
    init_tracing();
    let io = Arc::new(GatedIo::default());
    let pool = BufPool::new(options(4), io.clone(), Arc::new(MemRedoLog::new()))?;
    let id = PageId::new(0, 5);

    let reader = {
        let pool = pool.clone();
        thread::spawn(move || pool.fix(id, FetchMode::Normal).map(|page| page.id()))
    };
    while !pool.contains(id) {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(matches!(
        pool.fix(id, FetchMode::NoWait),
        Err(BufError::WouldBlock(_))
    ));
    assert!(matches!(
        pool.fix(id, FetchMode::PeekIfInPool),
        Err(BufError::WouldBlock(_))
    ));
    io.release();
    assert_eq!(reader.join().unwrap()?, id);
    assert!(pool.fix(id, FetchMode::NoWait).is_ok());
    Ok(())
}

#[test]
fn churn_keeps_lists_consistent() -> Result<()> {
    init_tracing();
    let io = Arc::new(FilePageIo::new(PAGE as usize));
    io.attach(0, Arc::new(MemFileIo::new()));
    let mut opts = options(16);
    opts.lru_old_min_len = 8;
    opts.old_threshold_ms = 0;
    let pool = BufPool::new(opts, io, Arc::new(MemRedoLog::new()))?;

    let workers: Vec<_> = (0..4u32)
        .map(|t| {
            let pool = pool.clone();
            thread::spawn(move || {
                for round in 0..200u32 {
                    let id = PageId::new(0, (round * 7 + t * 13) % 48);
                    match pool.fix(id, FetchMode::Normal) {
                        Ok(page) => {
                            let guard = page.s_lock();
                            assert_eq!(guard.len(), PAGE as usize);
                        }
                        Err(err) => assert!(err.is_retryable(), "{err}"),
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    let stats = pool.stats();
    assert_eq!(stats.lru + stats.free, 16);
    assert!(stats.evictions > 0);
    pool.check_invariants()?;
    Ok(())
}
