#![allow(missing_docs)]

use std::path::Path;
use std::sync::{Arc, Once};

use bufpool::buffer::{BufPool, FetchMode};
use bufpool::mtr::log::{FrameIter, RecordIter, RedoRecord};
use bufpool::mtr::Mtr;
use bufpool::primitives::io::{FileIo, FilePageIo, StdFileIo};
use bufpool::primitives::wal::{FileRedoLog, LogOptions, RedoLog};
use bufpool::{BufError, PageId, PoolOptions, Result, LOG_START_LSN};
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

const PAGE: u32 = 4096;

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

struct Files {
    pool: Arc<BufPool>,
    log: Arc<FileRedoLog>,
    data: Arc<StdFileIo>,
}

fn open(dir: &Path) -> Result<Files> {
    let data = Arc::new(StdFileIo::open(dir.join("space0.dat"))?);
    let io = Arc::new(FilePageIo::new(PAGE as usize));
    io.attach(0, data.clone());
    let log_file: Arc<dyn FileIo> = Arc::new(StdFileIo::open(dir.join("redo.log"))?);
    let log = Arc::new(FileRedoLog::open(log_file, LogOptions::default())?);
    let options = PoolOptions::from_toml_str(
        r#"
        page_size = 4096
        pool_bytes = 65536
        hash_shards = 4
        "#,
    )?;
    let pool = BufPool::new(options, io, log.clone())?;
    Ok(Files { pool, log, data })
}

#[test]
fn pages_and_redo_survive_reopen() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let end = {
        let files = open(dir.path())?;
        assert_eq!(files.pool.capacity(), 16);
        let mut mtr = Mtr::new(files.pool.clone());
        let mut end = LOG_START_LSN;
        for n in 0..4u32 {
            mtr.start();
            let slot = mtr.create_page(PageId::new(0, n))?;
            mtr.write(slot, 1000, format!("page-{n}").as_bytes())?;
            mtr.annotate_checksum(slot);
            end = mtr.commit().expect("commit appended redo");
        }
        files.pool.close()?;
        assert_eq!(files.log.flushed_lsn(), end);
        assert_eq!(files.log.checkpoint_lsn(), end);
        end
    };

    let files = open(dir.path())?;
    assert_eq!(files.log.current_lsn(), end);
    assert_eq!(files.log.checkpoint_lsn(), end);
    for n in 0..4u32 {
        let page = files.pool.fix(PageId::new(0, n), FetchMode::Normal)?;
        let guard = page.s_lock();
        let expected = format!("page-{n}");
        assert_eq!(&guard[1000..1000 + expected.len()], expected.as_bytes());
    }

    let bytes = files.log.read_from(LOG_START_LSN)?;
    let mut kinds = Vec::new();
    for frame in FrameIter::new(&bytes) {
        for record in RecordIter::new(frame?) {
            kinds.push(record?.kind());
        }
    }
    assert_eq!(kinds.len(), 12);
    let first = RecordIter::new(FrameIter::new(&bytes).next().unwrap()?)
        .next()
        .unwrap()?;
    assert_eq!(first, RedoRecord::InitPage(PageId::new(0, 0)));
    Ok(())
}

#[test]
fn damaged_page_on_disk_is_reported_and_not_cached() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    {
        let files = open(dir.path())?;
        let mut mtr = Mtr::new(files.pool.clone());
        mtr.start();
        let slot = mtr.create_page(PageId::new(0, 2))?;
        mtr.write(slot, 64, b"payload")?;
        mtr.commit();
        files.pool.close()?;
        files.data.write_at(2 * PAGE as u64 + 64, b"PAYLOAD")?;
        files.data.sync_all()?;
    }

    let files = open(dir.path())?;
    let err = files
        .pool
        .fix(PageId::new(0, 2), FetchMode::Normal)
        .unwrap_err();
    assert!(matches!(err, BufError::Corruption { .. }), "{err}");
    assert!(!files.pool.contains(PageId::new(0, 2)));
    assert_eq!(files.pool.stats().read_failures, 1);
    files.pool.check_invariants()?;
    Ok(())
}
