use std::io;

use thiserror::Error;

use crate::types::PageId;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, BufError>;

/// Errors surfaced by the buffer pool and its collaborators.
///
/// Protocol violations are not represented here; they go through [`fatal!`].
#[derive(Debug, Error)]
pub enum BufError {
    /// Underlying device failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Page bytes failed validation on read.
    #[error("page {page} corrupted: {reason}")]
    Corruption {
        /// Page that failed validation.
        page: PageId,
        /// What check failed.
        reason: &'static str,
    },
    /// Page could not be decrypted with the available key.
    #[error("page {0} could not be decrypted")]
    Decryption(PageId),
    /// No free or evictable frame was found.
    #[error("buffer pool exhausted")]
    PoolExhausted,
    /// The page is being read by another thread and the caller asked not to wait.
    #[error("page {0} is busy")]
    WouldBlock(PageId),
    /// Peek found no resident copy.
    #[error("page {0} is not resident")]
    NotResident(PageId),
    /// The page was freed and the caller did not accept freed pages.
    #[error("page {0} has been freed")]
    PageFreed(PageId),
    /// No file is registered for the container.
    #[error("unknown container {0}")]
    UnknownContainer(u32),
    /// Argument outside the accepted range.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),
}

impl BufError {
    /// True for conditions a caller may retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BufError::PoolExhausted | BufError::WouldBlock(_))
    }
}

/// Logs an invariant violation and terminates.
///
/// Release builds abort on panic, so this never unwinds in production.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        ::tracing::error!(target: "bufpool.fatal", $($arg)*);
        panic!($($arg)*)
    }};
}
