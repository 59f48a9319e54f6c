//! The buffer pool and its page descriptors.
//!
//! A [`BufPool`] owns a fixed arena of descriptors, each with one page-sized
//! frame. Pages are found through a sharded page hash, kept warm by an LRU
//! list with an old sublist, and tracked in a flush list once dirty. Callers
//! get [`BufRef`] handles that keep the page resident and latch the frame
//! through owned guards.

mod descriptor;
mod flush_list;
mod list;
mod lru;
mod page_hash;
mod pool;
mod resize;
pub mod state;

pub use descriptor::{BufDesc, BufRef, FrameLock, PageHint, SGuard, SXGuard, XGuard};
pub use pool::{BufPool, FetchMode, FlushListGuard, MemBlock, PoolListener, PoolStats};
pub use state::{PageState, StateTag};
