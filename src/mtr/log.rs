//! Redo records and the frame a commit appends.
//!
//! A frame is `u32 length | records | u32 crc32`, both integers big-endian,
//! the CRC covering the record bytes only. Records start with a one-byte type
//! followed by the page identifier; all integers are big-endian.

use crate::error::{BufError, Result};
use crate::types::{crc32_of, PageId};

const FRAME_LEN_BYTES: usize = 4;
const FRAME_CRC_BYTES: usize = 4;
/// Bytes a frame adds around its records.
pub const FRAME_OVERHEAD: usize = FRAME_LEN_BYTES + FRAME_CRC_BYTES;

const PAGE_REF_LEN: usize = 1 + 4 + 4;

/// Record type tags.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum RecordType {
    /// Page initialised from scratch.
    InitPage = 1,
    /// Page deallocated.
    FreePage = 2,
    /// Bytes copied into a page.
    Write = 3,
    /// Range of a page filled with one byte.
    Memset = 4,
    /// Checksum of a page payload, for verification during replay.
    Checksum = 5,
}

impl RecordType {
    fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => RecordType::InitPage,
            2 => RecordType::FreePage,
            3 => RecordType::Write,
            4 => RecordType::Memset,
            5 => RecordType::Checksum,
            _ => return None,
        })
    }
}

/// One decoded redo record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RedoRecord<'a> {
    /// See [`RecordType::InitPage`].
    InitPage(PageId),
    /// See [`RecordType::FreePage`].
    FreePage(PageId),
    /// See [`RecordType::Write`].
    Write {
        /// Target page.
        page: PageId,
        /// Byte offset in the page.
        offset: u16,
        /// Bytes written.
        data: &'a [u8],
    },
    /// See [`RecordType::Memset`].
    Memset {
        /// Target page.
        page: PageId,
        /// Byte offset in the page.
        offset: u16,
        /// Bytes filled.
        len: u16,
        /// Fill value.
        value: u8,
    },
    /// See [`RecordType::Checksum`].
    Checksum {
        /// Page the checksum was taken of.
        page: PageId,
        /// CRC32 of the page payload.
        crc: u32,
    },
}

impl RedoRecord<'_> {
    /// Record type tag.
    pub fn kind(&self) -> RecordType {
        match self {
            RedoRecord::InitPage(_) => RecordType::InitPage,
            RedoRecord::FreePage(_) => RecordType::FreePage,
            RedoRecord::Write { .. } => RecordType::Write,
            RedoRecord::Memset { .. } => RecordType::Memset,
            RedoRecord::Checksum { .. } => RecordType::Checksum,
        }
    }

    /// Page the record applies to.
    pub fn page(&self) -> PageId {
        match *self {
            RedoRecord::InitPage(page) | RedoRecord::FreePage(page) => page,
            RedoRecord::Write { page, .. }
            | RedoRecord::Memset { page, .. }
            | RedoRecord::Checksum { page, .. } => page,
        }
    }

    /// Appends the encoded record to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.kind() as u8);
        let page = self.page();
        out.extend_from_slice(&page.space.to_be_bytes());
        out.extend_from_slice(&page.page_no.to_be_bytes());
        match self {
            RedoRecord::InitPage(_) | RedoRecord::FreePage(_) => {}
            RedoRecord::Write { offset, data, .. } => {
                out.extend_from_slice(&offset.to_be_bytes());
                out.extend_from_slice(&(data.len() as u16).to_be_bytes());
                out.extend_from_slice(data);
            }
            RedoRecord::Memset {
                offset, len, value, ..
            } => {
                out.extend_from_slice(&offset.to_be_bytes());
                out.extend_from_slice(&len.to_be_bytes());
                out.push(*value);
            }
            RedoRecord::Checksum { crc, .. } => out.extend_from_slice(&crc.to_be_bytes()),
        }
    }
}

fn be_u16(src: &[u8], at: usize) -> Option<u16> {
    let bytes = src.get(at..at + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn be_u32(src: &[u8], at: usize) -> Option<u32> {
    let bytes = src.get(at..at + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Iterates the records of a frame body.
pub struct RecordIter<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> RecordIter<'a> {
    /// Iterator over `records`, as returned by [`parse_frame`].
    pub fn new(records: &'a [u8]) -> Self {
        Self { src: records, pos: 0 }
    }

    fn decode(&self) -> Option<(RedoRecord<'a>, usize)> {
        let src = self.src;
        let at = self.pos;
        let kind = RecordType::from_u8(*src.get(at)?)?;
        let page = PageId::new(be_u32(src, at + 1)?, be_u32(src, at + 5)?);
        let body = at + PAGE_REF_LEN;
        Some(match kind {
            RecordType::InitPage => (RedoRecord::InitPage(page), PAGE_REF_LEN),
            RecordType::FreePage => (RedoRecord::FreePage(page), PAGE_REF_LEN),
            RecordType::Write => {
                let offset = be_u16(src, body)?;
                let len = be_u16(src, body + 2)? as usize;
                let data = src.get(body + 4..body + 4 + len)?;
                (RedoRecord::Write { page, offset, data }, PAGE_REF_LEN + 4 + len)
            }
            RecordType::Memset => {
                let offset = be_u16(src, body)?;
                let len = be_u16(src, body + 2)?;
                let value = *src.get(body + 4)?;
                (
                    RedoRecord::Memset {
                        page,
                        offset,
                        len,
                        value,
                    },
                    PAGE_REF_LEN + 5,
                )
            }
            RecordType::Checksum => {
                let crc = be_u32(src, body)?;
                (RedoRecord::Checksum { page, crc }, PAGE_REF_LEN + 4)
            }
        })
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Result<RedoRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.src.len() {
            return None;
        }
        match self.decode() {
            Some((record, used)) => {
                self.pos += used;
                Some(Ok(record))
            }
            None => {
                self.pos = self.src.len();
                Some(Err(BufError::Invalid("truncated or unknown redo record")))
            }
        }
    }
}

/// Wraps record bytes into a frame.
pub fn encode_frame(records: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(records.len()).map_err(|_| BufError::Invalid("redo frame too large"))?;
    let mut frame = Vec::with_capacity(records.len() + FRAME_OVERHEAD);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(records);
    frame.extend_from_slice(&crc32_of(&[records]).to_be_bytes());
    Ok(frame)
}

/// Parses the frame at the start of `src`; returns its records and the bytes
/// consumed.
pub fn parse_frame(src: &[u8]) -> Result<(&[u8], usize)> {
    let len = be_u32(src, 0).ok_or(BufError::Invalid("truncated redo frame"))? as usize;
    let end = FRAME_LEN_BYTES + len;
    let records = src
        .get(FRAME_LEN_BYTES..end)
        .ok_or(BufError::Invalid("truncated redo frame"))?;
    let stored = be_u32(src, end).ok_or(BufError::Invalid("truncated redo frame"))?;
    if crc32_of(&[records]) != stored {
        return Err(BufError::Invalid("redo frame crc mismatch"));
    }
    Ok((records, end + FRAME_CRC_BYTES))
}

/// Iterates consecutive frames, as read back from a log.
pub struct FrameIter<'a> {
    src: &'a [u8],
}

impl<'a> FrameIter<'a> {
    /// Iterator over the frames in `src`.
    pub fn new(src: &'a [u8]) -> Self {
        Self { src }
    }
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.src.is_empty() {
            return None;
        }
        match parse_frame(self.src) {
            Ok((records, used)) => {
                self.src = &self.src[used..];
                Some(Ok(records))
            }
            Err(err) => {
                self.src = &[];
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_of_mixed_records_parses_back() {
        let page = PageId::new(2, 9);
        let mut records = Vec::new();
        RedoRecord::InitPage(page).encode(&mut records);
        RedoRecord::Write {
            page,
            offset: 40,
            data: b"hello",
        }
        .encode(&mut records);
        RedoRecord::Memset {
            page,
            offset: 64,
            len: 16,
            value: 0xFF,
        }
        .encode(&mut records);
        RedoRecord::Checksum { page, crc: 0xDEAD_BEEF }.encode(&mut records);

        let mut log = encode_frame(&records).unwrap();
        log.extend(encode_frame(&[]).unwrap());
        let frames: Vec<_> = FrameIter::new(&log).collect::<Result<_>>().unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[1].is_empty());
        let decoded: Vec<_> = RecordIter::new(frames[0]).collect::<Result<_>>().unwrap();
        assert_eq!(decoded.len(), 4);
        assert_eq!(
            decoded[1],
            RedoRecord::Write {
                page,
                offset: 40,
                data: b"hello"
            }
        );
        assert_eq!(decoded[3].kind(), RecordType::Checksum);
    }

    #[test]
    fn damaged_frame_is_rejected() {
        let mut records = Vec::new();
        RedoRecord::FreePage(PageId::new(0, 1)).encode(&mut records);
        let mut frame = encode_frame(&records).unwrap();
        frame[6] ^= 1;
        assert!(matches!(parse_frame(&frame), Err(BufError::Invalid(_))));
        assert!(parse_frame(&frame[..3]).is_err());
    }

    #[test]
    fn truncated_record_is_an_error() {
        let mut records = Vec::new();
        RedoRecord::Write {
            page: PageId::new(0, 1),
            offset: 0,
            data: &[1, 2, 3],
        }
        .encode(&mut records);
        records.pop();
        let mut iter = RecordIter::new(&records);
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }
}
