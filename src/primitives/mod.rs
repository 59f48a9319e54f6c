//! Low-level collaborators of the buffer pool.
//!
//! Includes positioned file I/O with the page codec that validates and
//! stamps pages, and the redo log the mini-transactions append to.

/// I/O abstractions and the page codec.
///
/// Positioned file access plus the `PageIo` seam the pool reads and writes
/// pages through.
pub mod io;

/// Redo log.
///
/// The append/flush interface mini-transactions and the flush path rely on.
pub mod wal;
