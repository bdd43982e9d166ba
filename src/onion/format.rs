//! On-disk images of the onion file: header, history and revision records.
//!
//! ```text
//! header:   [b"OHDH"][VERSION 1B][flags u32][page_size u32][origin_eof u64]
//!           [history_addr u64][history_size u64][CRC32]
//! history:  [b"OWHS"][VERSION 1B][u32 count][RecordLoc...][CRC32]
//! loc:      [phys_addr u64][record_size u64][crc32(phys_addr ‖ record_size) u32]
//! record:   [b"ORRS"][VERSION 1B][revision u64][parent u64][created str]
//!           [logical_eof u64][ArchivalIndex][comment str][CRC32]
//! ```
//!
//! All three images are sealed: the trailing CRC32 covers every byte
//! before it.

use crate::encoding::{
    CHECKSUM_SIZE, Decode, Encode, EncodingError, crc32, decode_vec, encode_vec, expect_preamble,
};

use super::index::ArchivalIndex;

const HEADER_MAGIC: [u8; 4] = *b"OHDH";
const HISTORY_MAGIC: [u8; 4] = *b"OWHS";
const RECORD_MAGIC: [u8; 4] = *b"ORRS";
const VERSION: u8 = 1;

/// Encoded header length.
pub const HEADER_SIZE: usize = 4 + 1 + 4 + 4 + 8 + 8 + 8 + CHECKSUM_SIZE;

/// A write session holds the file.
pub const FLAG_WRITE_LOCK: u32 = 0x1;

/// Revision records start on page boundaries.
pub const FLAG_PAGE_ALIGNMENT: u32 = 0x2;

// ------------------------------------------------------------------------------------------------
// Header
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub flags: u32,
    pub page_size: u32,
    /// Size of the original file when it was onionized.
    pub origin_eof: u64,
    pub history_addr: u64,
    pub history_size: u64,
}

impl Header {
    pub fn is_locked(&self) -> bool {
        self.flags & FLAG_WRITE_LOCK != 0
    }

    pub fn page_aligned(&self) -> bool {
        self.flags & FLAG_PAGE_ALIGNMENT != 0
    }
}

impl Encode for Header {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        HEADER_MAGIC.encode_to(buf)?;
        VERSION.encode_to(buf)?;
        self.flags.encode_to(buf)?;
        self.page_size.encode_to(buf)?;
        self.origin_eof.encode_to(buf)?;
        self.history_addr.encode_to(buf)?;
        self.history_size.encode_to(buf)?;
        0u32.encode_to(buf)
    }
}

impl Decode for Header {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = expect_preamble(buf, HEADER_MAGIC, VERSION, "OnionHeader")?;
        let (flags, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (page_size, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (origin_eof, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (history_addr, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (history_size, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (_checksum, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                flags,
                page_size,
                origin_eof,
                history_addr,
                history_size,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// History
// ------------------------------------------------------------------------------------------------

/// Where one committed revision record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLoc {
    pub phys_addr: u64,
    pub record_size: u64,
    pub checksum: u32,
}

impl RecordLoc {
    pub fn new(phys_addr: u64, record_size: u64) -> Self {
        Self {
            phys_addr,
            record_size,
            checksum: Self::compute(phys_addr, record_size),
        }
    }

    fn compute(phys_addr: u64, record_size: u64) -> u32 {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&phys_addr.to_le_bytes());
        bytes[8..].copy_from_slice(&record_size.to_le_bytes());
        crc32(&bytes)
    }

    /// Checksum recomputed from the location fields.
    pub fn computed_checksum(&self) -> u32 {
        Self::compute(self.phys_addr, self.record_size)
    }
}

impl Encode for RecordLoc {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.phys_addr.encode_to(buf)?;
        self.record_size.encode_to(buf)?;
        self.checksum.encode_to(buf)
    }
}

impl Decode for RecordLoc {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (phys_addr, a) = u64::decode_from(buf)?;
        let (record_size, b) = u64::decode_from(&buf[a..])?;
        let (checksum, c) = u32::decode_from(&buf[a + b..])?;
        Ok((
            Self {
                phys_addr,
                record_size,
                checksum,
            },
            a + b + c,
        ))
    }
}

/// Committed revisions, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History {
    pub records: Vec<RecordLoc>,
}

impl History {
    pub fn len(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Encode for History {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        HISTORY_MAGIC.encode_to(buf)?;
        VERSION.encode_to(buf)?;
        encode_vec(&self.records, buf)?;
        0u32.encode_to(buf)
    }
}

impl Decode for History {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = expect_preamble(buf, HISTORY_MAGIC, VERSION, "OnionHistory")?;
        let (records, n) = decode_vec::<RecordLoc>(&buf[offset..])?;
        offset += n;
        let (_checksum, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { records }, offset))
    }
}

// ------------------------------------------------------------------------------------------------
// Revision record
// ------------------------------------------------------------------------------------------------

/// State of the file as of one revision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionRecord {
    pub revision_num: u64,
    pub parent_revision_num: u64,
    /// UTC, `%Y%m%dT%H%M%SZ`. Empty until committed.
    pub time_of_creation: String,
    pub logical_eof: u64,
    pub archival_index: ArchivalIndex,
    pub comment: String,
}

impl Encode for RevisionRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        RECORD_MAGIC.encode_to(buf)?;
        VERSION.encode_to(buf)?;
        self.revision_num.encode_to(buf)?;
        self.parent_revision_num.encode_to(buf)?;
        self.time_of_creation.encode_to(buf)?;
        self.logical_eof.encode_to(buf)?;
        self.archival_index.encode_to(buf)?;
        self.comment.encode_to(buf)?;
        0u32.encode_to(buf)
    }
}

impl Decode for RevisionRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = expect_preamble(buf, RECORD_MAGIC, VERSION, "OnionRevisionRecord")?;
        let (revision_num, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (parent_revision_num, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (time_of_creation, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (logical_eof, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (archival_index, n) = ArchivalIndex::decode_from(&buf[offset..])?;
        offset += n;
        let (comment, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (_checksum, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                revision_num,
                parent_revision_num,
                time_of_creation,
                logical_eof,
                archival_index,
                comment,
            },
            offset,
        ))
    }
}
