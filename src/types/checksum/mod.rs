//! Checksums over page and redo bytes.

#![forbid(unsafe_code)]

use super::PageId;

/// Incremental 32-bit checksum.
pub trait Checksum {
    /// Clears the accumulated state.
    fn reset(&mut self);
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);
    /// Current checksum; does not consume the state.
    fn finalize(&self) -> u32;
}

/// CRC32 (IEEE) backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Page checksum: the identifier is mixed in so a page written to the wrong
/// slot fails validation even when its bytes are intact.
pub fn page_crc32(id: PageId, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&id.space.to_be_bytes());
    hasher.update(&id.page_no.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Checksum over a sequence of slices, as if they were concatenated.
pub fn crc32_of(parts: &[&[u8]]) -> u32 {
    let mut hasher = Crc32Fast::default();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_trait_roundtrip() {
        let mut c = Crc32Fast::default();
        c.update(b"redo");
        let first = c.finalize();
        c.update(b" frame");
        let second = c.finalize();
        assert_ne!(first, second);
        c.reset();
        c.update(b"redo frame");
        assert_eq!(c.finalize(), second);
        assert_eq!(crc32_of(&[b"redo", b" frame"]), second);
    }

    #[test]
    fn page_crc32_depends_on_identity() {
        let payload = vec![0u8; 64];
        let base = page_crc32(PageId::new(1, 2), &payload);
        assert_eq!(base, page_crc32(PageId::new(1, 2), &payload));
        assert_ne!(base, page_crc32(PageId::new(2, 2), &payload));
        assert_ne!(base, page_crc32(PageId::new(1, 3), &payload));

        let mut different = payload.clone();
        different[10] = 7;
        assert_ne!(base, page_crc32(PageId::new(1, 2), &different));
    }
}
