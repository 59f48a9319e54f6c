//! Identifiers, log positions and on-disk page header helpers.

#![forbid(unsafe_code)]

use std::fmt;

pub mod checksum;

pub use checksum::{crc32_of, page_crc32, Checksum, Crc32Fast};

/// Identifies one page of one container (tablespace file).
///
/// Ordering is by container first, then page number.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId {
    /// Container (tablespace) identifier.
    pub space: u32,
    /// Page number inside the container.
    pub page_no: u32,
}

impl PageId {
    /// Creates a page identifier.
    pub const fn new(space: u32, page_no: u32) -> Self {
        Self { space, page_no }
    }

    /// Packs the identifier into one word, container in the high half.
    pub const fn to_u64(self) -> u64 {
        ((self.space as u64) << 32) | self.page_no as u64
    }

    /// Inverse of [`PageId::to_u64`].
    pub const fn from_u64(packed: u64) -> Self {
        Self {
            space: (packed >> 32) as u32,
            page_no: packed as u32,
        }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.space, self.page_no)
    }
}

/// Position in the redo log.
///
/// `0` means "clean", `1` is reserved for pages being removed from the dirty
/// set, real positions are always greater than one.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Clean page marker.
    pub const ZERO: Lsn = Lsn(0);
    /// Marker for a page whose write completed and is leaving the flush list.
    pub const REMOVING: Lsn = Lsn(1);

    /// True for positions that can appear in the flush list.
    pub const fn is_position(self) -> bool {
        self.0 > 1
    }

    /// Position `bytes` further along the log.
    pub const fn advance(self, bytes: u64) -> Lsn {
        Lsn(self.0 + bytes)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// First position handed out by a fresh redo log.
pub const LOG_START_LSN: Lsn = Lsn(8192);

pub mod page {
    //! Fixed 32-byte page header shared by the pool and the page codec.
    //!
    //! The pool itself only touches the LSN field; the rest belongs to the
    //! codec that validates pages on read and stamps them on write.

    use core::convert::TryFrom;

    use super::{Lsn, PageId};
    use crate::error::{BufError, Result};

    pub const PAGE_MAGIC: [u8; 4] = *b"BUFP";
    pub const PAGE_FORMAT_VERSION: u16 = 1;
    pub const DEFAULT_PAGE_SIZE: u32 = 8192;
    pub const MIN_PAGE_SIZE: u32 = 512;
    pub const MAX_PAGE_SIZE: u32 = 65536;
    pub const PAGE_HDR_LEN: usize = 32;

    pub mod header {
        //! Byte offsets for fixed header fields.
        use core::ops::Range;

        pub const MAGIC: Range<usize> = 0..4;
        pub const FORMAT_VERSION: Range<usize> = 4..6;
        pub const PAGE_KIND: usize = 6;
        pub const RESERVED: usize = 7;
        pub const SPACE: Range<usize> = 8..12;
        pub const PAGE_NO: Range<usize> = 12..16;
        pub const LSN: Range<usize> = 16..24;
        pub const KEY_VERSION: Range<usize> = 24..28;
        pub const CRC32: Range<usize> = 28..32;
    }

    /// What a page holds. The pool never interprets it.
    #[repr(u8)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum PageKind {
        Allocated = 0,
        Index = 1,
        Undo = 2,
        Blob = 3,
        System = 4,
    }

    impl PageKind {
        pub const fn as_u8(self) -> u8 {
            self as u8
        }
    }

    impl TryFrom<u8> for PageKind {
        type Error = &'static str;

        fn try_from(value: u8) -> core::result::Result<Self, Self::Error> {
            match value {
                0 => Ok(PageKind::Allocated),
                1 => Ok(PageKind::Index),
                2 => Ok(PageKind::Undo),
                3 => Ok(PageKind::Blob),
                4 => Ok(PageKind::System),
                _ => Err("unknown page kind"),
            }
        }
    }

    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct PageHeader {
        pub format_version: u16,
        pub kind: PageKind,
        pub page_id: PageId,
        pub lsn: Lsn,
        pub key_version: u32,
        pub crc32: u32,
    }

    impl PageHeader {
        pub fn new(page_id: PageId, kind: PageKind) -> Self {
            Self {
                format_version: PAGE_FORMAT_VERSION,
                kind,
                page_id,
                lsn: Lsn::ZERO,
                key_version: 0,
                crc32: 0,
            }
        }

        pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
            if dst.len() < PAGE_HDR_LEN {
                return Err(BufError::Invalid("page header buffer too small"));
            }
            let hdr = &mut dst[..PAGE_HDR_LEN];
            hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
            hdr[header::FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
            hdr[header::PAGE_KIND] = self.kind.as_u8();
            hdr[header::RESERVED] = 0;
            hdr[header::SPACE].copy_from_slice(&self.page_id.space.to_be_bytes());
            hdr[header::PAGE_NO].copy_from_slice(&self.page_id.page_no.to_be_bytes());
            hdr[header::LSN].copy_from_slice(&self.lsn.0.to_be_bytes());
            hdr[header::KEY_VERSION].copy_from_slice(&self.key_version.to_be_bytes());
            hdr[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
            Ok(())
        }

        /// Decodes a header; `page` names the page in corruption errors.
        pub fn decode(page: PageId, src: &[u8]) -> Result<Self> {
            let corrupt = |reason| BufError::Corruption { page, reason };
            if src.len() < PAGE_HDR_LEN {
                return Err(corrupt("page header truncated"));
            }
            if src[header::MAGIC] != PAGE_MAGIC {
                return Err(corrupt("invalid page magic"));
            }
            let format_version = u16::from_be_bytes([src[4], src[5]]);
            if format_version != PAGE_FORMAT_VERSION {
                return Err(corrupt("unsupported page format version"));
            }
            if src[header::RESERVED] != 0 {
                return Err(corrupt("page header reserved byte not zero"));
            }
            let kind = PageKind::try_from(src[header::PAGE_KIND]).map_err(corrupt)?;
            Ok(Self {
                format_version,
                kind,
                page_id: PageId::new(
                    read_u32(src, header::SPACE.start),
                    read_u32(src, header::PAGE_NO.start),
                ),
                lsn: page_lsn(src),
                key_version: read_u32(src, header::KEY_VERSION.start),
                crc32: read_u32(src, header::CRC32.start),
            })
        }
    }

    fn read_u32(src: &[u8], at: usize) -> u32 {
        u32::from_be_bytes([src[at], src[at + 1], src[at + 2], src[at + 3]])
    }

    /// Newest modification stamped into the page, zero for never-logged pages.
    pub fn page_lsn(buf: &[u8]) -> Lsn {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[header::LSN]);
        Lsn(u64::from_be_bytes(raw))
    }

    pub fn set_page_lsn(buf: &mut [u8], lsn: Lsn) {
        buf[header::LSN].copy_from_slice(&lsn.0.to_be_bytes());
    }

    pub fn page_kind(buf: &[u8]) -> Option<PageKind> {
        PageKind::try_from(buf[header::PAGE_KIND]).ok()
    }

    pub fn clear_crc32(buf: &mut [u8]) -> Result<()> {
        if buf.len() < header::CRC32.end {
            return Err(BufError::Invalid("page header buffer too small"));
        }
        buf[header::CRC32].fill(0);
        Ok(())
    }

    /// Pages that were allocated but never written read back as zeroes.
    pub fn is_zeroes(buf: &[u8]) -> bool {
        buf.iter().all(|&b| b == 0)
    }
}
