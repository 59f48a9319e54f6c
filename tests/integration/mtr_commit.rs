#![allow(missing_docs)]

use std::sync::{Arc, Once};
use std::thread;

use bufpool::buffer::{BufPool, FetchMode};
use bufpool::mtr::log::{FrameIter, RecordIter, RedoRecord};
use bufpool::mtr::{LatchMode, Mtr};
use bufpool::primitives::io::{FilePageIo, MemFileIo};
use bufpool::primitives::wal::{MemRedoLog, RedoLog};
use bufpool::types::page::{page_lsn, PAGE_HDR_LEN};
use bufpool::{Lsn, PageId, PoolOptions, Result, LOG_START_LSN};
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

fn setup(frames: usize) -> Result<(Arc<BufPool>, Arc<MemRedoLog>, Arc<FilePageIo>)> {
    let io = Arc::new(FilePageIo::new(PAGE as usize));
    io.attach(0, Arc::new(MemFileIo::new()));
    let log = Arc::new(MemRedoLog::new());
    let pool = BufPool::new(PoolOptions::with_frames(PAGE, frames), io.clone(), log.clone())?;
    Ok((pool, log, io))
}

#[test]
fn committed_page_is_dirty_once_at_append_start() -> Result<()> {
    init_tracing();
    let (pool, log, _) = setup(8)?;
    let id = PageId::new(0, 12);
    {
        let (page, guard) = pool.create(id)?;
        drop(guard);
        drop(page);
    }

    let start = log.current_lsn();
    let mut mtr = Mtr::new(pool.clone());
    mtr.start();
    let slot = mtr.get_page(id, LatchMode::X, FetchMode::Normal)?;
    mtr.write(slot, PAGE_HDR_LEN + 8, b"record")?;
    let page = mtr.page_ref(slot).clone();
    let end = mtr.commit().expect("commit appended redo");

    assert_eq!(page.oldest_modification(), start);
    assert_eq!(page_lsn(&page.s_lock()[..]), end);
    assert_eq!(pool.dirty_pages(), 1);
    assert_eq!(pool.oldest_modification(), Some(start));
    assert_eq!(log.stats().appends, 1);

    let bytes = log.read_from(start)?;
    let frames: Vec<_> = FrameIter::new(&bytes).collect::<Result<_>>()?;
    let records: Vec<_> = RecordIter::new(frames[0]).collect::<Result<_>>()?;
    assert_eq!(
        records,
        vec![RedoRecord::Write {
            page: id,
            offset: (PAGE_HDR_LEN + 8) as u16,
            data: b"record",
        }]
    );
    pool.check_invariants()?;
    Ok(())
}

#[test]
fn flush_waits_for_log_and_cleans_page() -> Result<()> {
    init_tracing();
    let (pool, log, io) = setup(8)?;
    let mut mtr = Mtr::new(pool.clone());
    mtr.start();
    let slot = mtr.create_page(PageId::new(0, 3))?;
    mtr.memset(slot, 100, 20, 0x5A)?;
    let page = mtr.page_ref(slot).clone();
    let end = mtr.commit().expect("commit appended redo");
    assert!(log.flushed_lsn() < end);

    assert!(pool.flush_page(&page)?);
    assert!(log.flushed_lsn() >= end);
    assert_eq!(page.oldest_modification(), Lsn::ZERO);
    assert_eq!(pool.dirty_pages(), 0);
    assert_eq!(io.stats().writes, 1);
    assert!(!pool.flush_page(&page)?);
    Ok(())
}

#[test]
fn concurrent_commits_keep_flush_list_ordered() -> Result<()> {
    init_tracing();
    let (pool, _, _) = setup(64)?;
    let workers: Vec<_> = (0..4u32)
        .map(|t| {
            let pool = pool.clone();
            thread::spawn(move || -> Result<()> {
                let mut mtr = Mtr::new(pool);
                for round in 0..10u32 {
                    mtr.start();
                    let slot = mtr.create_page(PageId::new(0, t * 10 + round))?;
                    mtr.write(slot, 200, &round.to_be_bytes())?;
                    mtr.commit();
                }
                Ok(())
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap()?;
    }
    assert_eq!(pool.dirty_pages(), 40);
    assert_eq!(pool.oldest_modification(), Some(LOG_START_LSN));
    pool.check_invariants()?;

    let flushed = pool.flush_all()?;
    assert_eq!(flushed, 40);
    assert_eq!(pool.oldest_modification(), None);
    Ok(())
}

#[test]
fn checkpoint_follows_oldest_dirty_page() -> Result<()> {
    init_tracing();
    let io = Arc::new(FilePageIo::new(PAGE as usize));
    io.attach(0, Arc::new(MemFileIo::new()));
    let log = Arc::new(MemRedoLog::with_capacity(256));
    let pool = BufPool::new(PoolOptions::with_frames(PAGE, 16), io, log.clone())?;

    let mut mtr = Mtr::new(pool.clone());
    for n in 0..8u32 {
        mtr.start();
        let slot = mtr.create_page(PageId::new(0, n))?;
        mtr.write(slot, 64, &[n as u8; 32])?;
        mtr.commit();
    }
    assert!(log.checkpoint_floor().is_position());
    let checkpoint = pool.checkpoint()?;
    assert_eq!(log.stats().checkpoint_lsn, checkpoint);
    match pool.oldest_modification() {
        Some(oldest) => assert_eq!(checkpoint, oldest),
        None => assert_eq!(checkpoint, log.current_lsn()),
    }
    assert!(!log.checkpoint_floor().is_position());
    pool.close()?;
    assert_eq!(pool.dirty_pages(), 0);
    Ok(())
}
