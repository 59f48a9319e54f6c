#![forbid(unsafe_code)]

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BufError, Result};
use crate::types::page::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};

/// Configuration for a buffer pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Size of each page in bytes; a power of two.
    pub page_size: u32,
    /// Memory budget for page frames in bytes.
    pub pool_bytes: u64,
    /// Number of page-hash shards; rounded up to a power of two.
    pub hash_shards: usize,
    /// Target share of the LRU list kept in the old sublist, in percent.
    pub lru_old_pct: u32,
    /// Below this LRU length no old sublist is maintained.
    pub lru_old_min_len: usize,
    /// Minimum age of the first access before an old page may be made young.
    pub old_threshold_ms: u64,
    /// How many pages from the LRU tail eviction looks at.
    pub lru_scan_depth: usize,
    /// Dirty share of the pool above which the free-block path flushes, in percent.
    pub max_dirty_pct: u32,
    /// Whether the adaptive hash index starts enabled.
    pub ahi_enabled: bool,
    /// Number of adaptive hash index cells.
    pub ahi_cells: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            pool_bytes: 128 * 1024 * 1024,
            hash_shards: 64,
            lru_old_pct: 37,
            lru_old_min_len: 512,
            old_threshold_ms: 1000,
            lru_scan_depth: 1024,
            max_dirty_pct: 90,
            ahi_enabled: true,
            ahi_cells: 4096,
        }
    }
}

impl PoolOptions {
    /// Options for a pool of `frames` pages of `page_size` bytes.
    pub fn with_frames(page_size: u32, frames: usize) -> Self {
        Self {
            page_size,
            pool_bytes: page_size as u64 * frames as u64,
            ..Self::default()
        }
    }

    /// Parses options from TOML; missing keys keep their defaults.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let options: PoolOptions =
            toml::from_str(src).map_err(|err| BufError::Config(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Loads and validates options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Serializes the options back to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|err| BufError::Config(err.to_string()))
    }

    /// Checks ranges and relationships between fields.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(BufError::Config(format!(
                "page_size {} must be a power of two in {MIN_PAGE_SIZE}..={MAX_PAGE_SIZE}",
                self.page_size
            )));
        }
        if self.frames() == 0 {
            return Err(BufError::Config(
                "pool_bytes must hold at least one page".into(),
            ));
        }
        if self.hash_shards == 0 {
            return Err(BufError::Config("hash_shards must be non-zero".into()));
        }
        if !(5..=95).contains(&self.lru_old_pct) {
            return Err(BufError::Config(format!(
                "lru_old_pct {} outside 5..=95",
                self.lru_old_pct
            )));
        }
        if self.lru_scan_depth == 0 {
            return Err(BufError::Config("lru_scan_depth must be non-zero".into()));
        }
        if self.max_dirty_pct == 0 || self.max_dirty_pct > 100 {
            return Err(BufError::Config(format!(
                "max_dirty_pct {} outside 1..=100",
                self.max_dirty_pct
            )));
        }
        if self.ahi_cells == 0 {
            return Err(BufError::Config("ahi_cells must be non-zero".into()));
        }
        Ok(())
    }

    /// Number of page frames the budget buys.
    pub fn frames(&self) -> usize {
        if self.page_size == 0 {
            return 0;
        }
        (self.pool_bytes / self.page_size as u64) as usize
    }
}
