//! Page cache with write-ahead-log integration.
//!
//! The crate holds a bounded set of fixed-size disk pages in memory, hands
//! them out latched and buffer-fixed, tracks which pages are dirty since which
//! log position and never lets a page reach disk ahead of its redo log. On
//! top of the pool sit mini-transactions, which tie page latches to redo-log
//! appends, and an adaptive hash index over record locations in cached pages.

#![warn(missing_docs)]

#[macro_use]
pub mod error;

pub mod ahi;
pub mod buffer;
pub mod mtr;
pub mod options;
pub mod primitives;
pub mod types;

pub use error::{BufError, Result};
pub use options::PoolOptions;
pub use types::{Lsn, PageId, LOG_START_LSN};
