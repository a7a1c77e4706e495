//! Record codec
//!
//! On-disk layout, all integers little-endian:
//!
//! ```text
//! File header (offset 0, 64 bytes)
//!   0  magic u32 "SBLB"      4  version u32       8  page size u32
//!  12  state u32             16 next record id    20 reserved
//!  24  tail u64              32 allocated u64     40 relocated u64
//!  48  deleted u64           56 reserved
//!
//! Record header (24 bytes, 8-aligned, never crosses a page)
//!   0  status u8             1  reserved u8
//!   2  generation u16        4  record id u32
//!   8  capacity u32
//!  12  actual length u32     16 moved-to offset u64
//!
//! Slot = header + capacity, rounded up to 8 bytes
//! ```
//!
//! The generation grows by one (wrapping) on every relocation. When a crash
//! leaves two ACTUAL copies of a record, the newer generation wins.
//!
//! A lone PADDING status byte means "the rest of this page is filler".
//! A zero status byte marks the end of written data.

use crate::storage::paged::PagedStorage;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a record header in bytes
pub const HEADER_SIZE: usize = 24;

/// Size of the storage file header in bytes
pub const FILE_HEADER_SIZE: usize = 64;

/// Offset of the first record slot
pub const FIRST_RECORD_OFFSET: u64 = FILE_HEADER_SIZE as u64;

/// Alignment of record slots
pub const RECORD_ALIGNMENT: u64 = 8;

/// Largest capacity the header's u32 field can describe
pub const MAX_RECORD_CAPACITY: u32 = u32::MAX;

/// File magic, "SBLB"
pub const STORAGE_MAGIC: u32 = 0x424C_4253;

/// Binary format version
pub const FORMAT_VERSION: u32 = 1;

/// Stable, caller-visible identity of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub u32);

impl RecordId {
    /// First id handed out by a fresh storage
    pub const FIRST: RecordId = RecordId(1);

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u32> for RecordId {
    fn from(value: u32) -> Self {
        RecordId(value)
    }
}

/// Record status byte, part of the on-disk contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordStatus {
    /// Live record holding the current payload
    Actual = 1,
    /// Tombstone forwarding to the record's newer location
    Moved = 2,
    /// Deleted record, slot is reclaimable
    Deleted = 3,
    /// Filler up to the next page boundary
    Padding = 4,
}

impl RecordStatus {
    /// Convert from u8, returns None for invalid values
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RecordStatus::Actual),
            2 => Some(RecordStatus::Moved),
            3 => Some(RecordStatus::Deleted),
            4 => Some(RecordStatus::Padding),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Fixed-size record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub status: RecordStatus,
    pub record_id: RecordId,
    /// Relocation count, wrapping
    pub generation: u16,
    pub capacity: u32,
    pub actual_length: u32,
    pub moved_to: u64,
}

impl RecordHeader {
    pub fn actual(record_id: RecordId, capacity: u32, actual_length: u32) -> Self {
        Self {
            status: RecordStatus::Actual,
            record_id,
            generation: 0,
            capacity,
            actual_length,
            moved_to: 0,
        }
    }

    /// Same record, one generation later
    pub fn next_generation(self) -> Self {
        Self {
            generation: self.generation.wrapping_add(1),
            ..self
        }
    }

    /// Whether `self` was written by a later relocation than `other`
    ///
    /// Serial-number comparison, so it survives the u16 wrapping around.
    pub fn is_newer_than(&self, other: &RecordHeader) -> bool {
        (self.generation.wrapping_sub(other.generation) as i16) > 0
    }

    /// Tombstone left behind when `self` is relocated to `new_offset`
    pub fn moved_to(&self, new_offset: u64) -> Self {
        Self {
            status: RecordStatus::Moved,
            actual_length: 0,
            moved_to: new_offset,
            ..*self
        }
    }

    pub fn deleted(&self) -> Self {
        Self {
            status: RecordStatus::Deleted,
            actual_length: 0,
            moved_to: 0,
            ..*self
        }
    }

    /// Bytes this record occupies in the file
    pub fn slot_size(&self) -> u64 {
        slot_size(self.capacity as u64)
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.status.as_u8();
        buf[2..4].copy_from_slice(&self.generation.to_le_bytes());
        buf[4..8].copy_from_slice(&self.record_id.0.to_le_bytes());
        buf[8..12].copy_from_slice(&self.capacity.to_le_bytes());
        buf[12..16].copy_from_slice(&self.actual_length.to_le_bytes());
        buf[16..24].copy_from_slice(&self.moved_to.to_le_bytes());
        buf
    }

    /// Decode and sanity-check a header
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::CorruptedData(format!(
                "record header needs {} bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }
        let status = RecordStatus::from_u8(bytes[0]).ok_or_else(|| {
            Error::CorruptedData(format!("invalid record status byte 0x{:02x}", bytes[0]))
        })?;
        if status == RecordStatus::Padding {
            return Ok(Self {
                status,
                record_id: RecordId(0),
                generation: 0,
                capacity: 0,
                actual_length: 0,
                moved_to: 0,
            });
        }

        let header = Self {
            status,
            record_id: RecordId(read_u32(bytes, 4)),
            generation: u16::from_le_bytes([bytes[2], bytes[3]]),
            capacity: read_u32(bytes, 8),
            actual_length: read_u32(bytes, 12),
            moved_to: read_u64(bytes, 16),
        };

        if header.record_id.0 == 0 {
            return Err(Error::CorruptedData(format!(
                "{:?} record without an id",
                header.status
            )));
        }
        if header.actual_length > header.capacity {
            return Err(Error::CorruptedData(format!(
                "record {} length {} exceeds capacity {}",
                header.record_id, header.actual_length, header.capacity
            )));
        }
        match header.status {
            RecordStatus::Moved
                if header.moved_to < FIRST_RECORD_OFFSET
                    || header.moved_to % RECORD_ALIGNMENT != 0 =>
            {
                Err(Error::CorruptedData(format!(
                    "record {} moved to invalid offset {}",
                    header.record_id, header.moved_to
                )))
            }
            RecordStatus::Actual | RecordStatus::Deleted if header.moved_to != 0 => {
                Err(Error::CorruptedData(format!(
                    "{:?} record {} carries a forwarding pointer",
                    header.status, header.record_id
                )))
            }
            _ => Ok(header),
        }
    }
}

/// Header plus payload, the unit the codec round-trips
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub header: RecordHeader,
    pub payload: Vec<u8>,
}

impl Record {
    /// Serialize as header followed by the full reserved capacity
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.len() != self.header.actual_length as usize {
            return Err(Error::InvalidArgument(format!(
                "payload of {} bytes does not match header length {}",
                self.payload.len(),
                self.header.actual_length
            )));
        }
        let mut buf = vec![0u8; self.header.slot_size() as usize];
        buf[..HEADER_SIZE].copy_from_slice(&self.header.encode());
        buf[HEADER_SIZE..HEADER_SIZE + self.payload.len()].copy_from_slice(&self.payload);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = RecordHeader::decode(bytes)?;
        let end = HEADER_SIZE + header.actual_length as usize;
        if bytes.len() < end {
            return Err(Error::CorruptedData(format!(
                "record {} truncated: need {} bytes, got {}",
                header.record_id,
                end,
                bytes.len()
            )));
        }
        Ok(Self {
            header,
            payload: bytes[HEADER_SIZE..end].to_vec(),
        })
    }
}

/// Whether the storage was closed cleanly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Closed = 0,
    Open = 1,
}

/// Storage file header: format identity plus persisted counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub page_size: u32,
    pub state: FileState,
    pub next_record_id: u32,
    pub tail: u64,
    pub records_allocated: u64,
    pub records_relocated: u64,
    pub records_deleted: u64,
}

impl FileHeader {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size,
            state: FileState::Open,
            next_record_id: RecordId::FIRST.0,
            tail: FIRST_RECORD_OFFSET,
            records_allocated: 0,
            records_relocated: 0,
            records_deleted: 0,
        }
    }

    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        buf[0..4].copy_from_slice(&STORAGE_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        buf[12..16].copy_from_slice(&(self.state as u32).to_le_bytes());
        buf[16..20].copy_from_slice(&self.next_record_id.to_le_bytes());
        buf[24..32].copy_from_slice(&self.tail.to_le_bytes());
        buf[32..40].copy_from_slice(&self.records_allocated.to_le_bytes());
        buf[40..48].copy_from_slice(&self.records_relocated.to_le_bytes());
        buf[48..56].copy_from_slice(&self.records_deleted.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(Error::CorruptedData("file header truncated".to_string()));
        }
        let magic = read_u32(bytes, 0);
        if magic != STORAGE_MAGIC {
            return Err(Error::CorruptedData(format!(
                "bad storage magic 0x{:08x}",
                magic
            )));
        }
        let version = read_u32(bytes, 4);
        if version != FORMAT_VERSION {
            return Err(Error::CorruptedData(format!(
                "unsupported format version {}",
                version
            )));
        }
        let state = match read_u32(bytes, 12) {
            0 => FileState::Closed,
            1 => FileState::Open,
            other => {
                return Err(Error::CorruptedData(format!(
                    "invalid file state {}",
                    other
                )))
            }
        };
        Ok(Self {
            page_size: read_u32(bytes, 8),
            state,
            next_record_id: read_u32(bytes, 16),
            tail: read_u64(bytes, 24),
            records_allocated: read_u64(bytes, 32),
            records_relocated: read_u64(bytes, 40),
            records_deleted: read_u64(bytes, 48),
        })
    }
}

/// Bytes occupied by a slot with the given payload capacity
pub fn slot_size(capacity: u64) -> u64 {
    align_up(HEADER_SIZE as u64 + capacity)
}

pub fn align_up(offset: u64) -> u64 {
    offset.div_ceil(RECORD_ALIGNMENT) * RECORD_ALIGNMENT
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

// Page-level helpers used by the engine and the scanner.

pub(crate) fn read_status_byte<P: PagedStorage + ?Sized>(paged: &P, offset: u64) -> Result<u8> {
    let mut byte = [0u8; 1];
    paged.read_into(offset, &mut byte)?;
    Ok(byte[0])
}

pub(crate) fn read_header<P: PagedStorage + ?Sized>(paged: &P, offset: u64) -> Result<RecordHeader> {
    let mut buf = [0u8; HEADER_SIZE];
    paged.read_into(offset, &mut buf)?;
    RecordHeader::decode(&buf).map_err(|e| match e {
        Error::CorruptedData(msg) => Error::CorruptedData(format!("at offset {}: {}", offset, msg)),
        other => other,
    })
}

/// Headers are written with a single page-local write
pub(crate) fn write_header<P: PagedStorage + ?Sized>(
    paged: &P,
    offset: u64,
    header: &RecordHeader,
) -> Result<()> {
    paged.write_bytes(offset, &header.encode())
}

pub(crate) fn read_payload<P: PagedStorage + ?Sized>(
    paged: &P,
    offset: u64,
    header: &RecordHeader,
) -> Result<Vec<u8>> {
    paged.read_bytes(offset + HEADER_SIZE as u64, header.actual_length as usize)
}

pub(crate) fn write_payload<P: PagedStorage + ?Sized>(
    paged: &P,
    offset: u64,
    payload: &[u8],
) -> Result<()> {
    if payload.is_empty() {
        return Ok(());
    }
    paged.write_bytes(offset + HEADER_SIZE as u64, payload)
}

pub(crate) fn write_padding<P: PagedStorage + ?Sized>(paged: &P, offset: u64) -> Result<()> {
    paged.write_bytes(offset, &[RecordStatus::Padding.as_u8()])
}

pub(crate) fn read_file_header<P: PagedStorage + ?Sized>(paged: &P) -> Result<FileHeader> {
    FileHeader::decode(&paged.read_bytes(0, FILE_HEADER_SIZE)?)
}

pub(crate) fn write_file_header<P: PagedStorage + ?Sized>(paged: &P, header: &FileHeader) -> Result<()> {
    paged.write_bytes(0, &header.encode())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() -> Result<()> {
        let header = RecordHeader::actual(RecordId(7), 100, 42);
        assert_eq!(RecordHeader::decode(&header.encode())?, header);

        let moved = header.moved_to(4096);
        let decoded = RecordHeader::decode(&moved.encode())?;
        assert_eq!(decoded.status, RecordStatus::Moved);
        assert_eq!(decoded.moved_to, 4096);
        assert_eq!(decoded.record_id, RecordId(7));
        Ok(())
    }

    #[test]
    fn test_generation_survives_encoding() -> Result<()> {
        let first = RecordHeader::actual(RecordId(5), 32, 10);
        let second = first.next_generation();
        let decoded = RecordHeader::decode(&second.encode())?;
        assert_eq!(decoded.generation, 1);
        assert!(decoded.is_newer_than(&first));
        assert!(!first.is_newer_than(&decoded));
        assert!(!first.is_newer_than(&first));

        // Tombstones keep the generation of the copy they replace
        assert_eq!(RecordHeader::decode(&second.moved_to(128).encode())?.generation, 1);
        Ok(())
    }

    #[test]
    fn test_generation_comparison_wraps() {
        let old = RecordHeader {
            generation: u16::MAX,
            ..RecordHeader::actual(RecordId(1), 8, 8)
        };
        let new = old.next_generation();
        assert_eq!(new.generation, 0);
        assert!(new.is_newer_than(&old));
        assert!(!old.is_newer_than(&new));
    }

    #[test]
    fn test_record_roundtrip() -> Result<()> {
        let record = Record {
            header: RecordHeader::actual(RecordId(3), 16, 5),
            payload: b"hello".to_vec(),
        };
        let bytes = record.encode()?;
        assert_eq!(bytes.len(), 40);
        assert_eq!(Record::decode(&bytes)?, record);
        Ok(())
    }

    #[test]
    fn test_status_bytes_are_stable() {
        assert_eq!(RecordStatus::Actual.as_u8(), 1);
        assert_eq!(RecordStatus::Moved.as_u8(), 2);
        assert_eq!(RecordStatus::Deleted.as_u8(), 3);
        assert_eq!(RecordStatus::Padding.as_u8(), 4);
        assert_eq!(RecordStatus::from_u8(0), None);
        assert_eq!(RecordStatus::from_u8(9), None);
    }

    #[test]
    fn test_rejects_bad_status() {
        let mut bytes = RecordHeader::actual(RecordId(1), 8, 8).encode();
        bytes[0] = 0x7f;
        assert!(matches!(
            RecordHeader::decode(&bytes),
            Err(Error::CorruptedData(_))
        ));
    }

    #[test]
    fn test_rejects_length_over_capacity() {
        let mut bytes = RecordHeader::actual(RecordId(1), 8, 8).encode();
        bytes[12..16].copy_from_slice(&9u32.to_le_bytes());
        assert!(matches!(
            RecordHeader::decode(&bytes),
            Err(Error::CorruptedData(_))
        ));
    }

    #[test]
    fn test_rejects_bad_forwarding_pointer() {
        let moved = RecordHeader::actual(RecordId(1), 8, 0).moved_to(13);
        assert!(RecordHeader::decode(&moved.encode()).is_err());

        let mut actual = RecordHeader::actual(RecordId(1), 8, 0).encode();
        actual[16..24].copy_from_slice(&128u64.to_le_bytes());
        assert!(RecordHeader::decode(&actual).is_err());
    }

    #[test]
    fn test_padding_ignores_rest() -> Result<()> {
        let mut bytes = [0xffu8; HEADER_SIZE];
        bytes[0] = RecordStatus::Padding.as_u8();
        assert_eq!(RecordHeader::decode(&bytes)?.status, RecordStatus::Padding);
        Ok(())
    }

    #[test]
    fn test_slot_size_alignment() {
        assert_eq!(slot_size(0), 24);
        assert_eq!(slot_size(1), 32);
        assert_eq!(slot_size(8), 32);
        assert_eq!(slot_size(10), 40);
    }

    #[test]
    fn test_file_header_roundtrip() -> Result<()> {
        let header = FileHeader {
            page_size: 4096,
            state: FileState::Closed,
            next_record_id: 12,
            tail: 8192,
            records_allocated: 11,
            records_relocated: 3,
            records_deleted: 2,
        };
        assert_eq!(FileHeader::decode(&header.encode())?, header);
        Ok(())
    }

    #[test]
    fn test_file_header_bad_magic() {
        let mut bytes = FileHeader::new(4096).encode();
        bytes[0] = 0;
        assert!(matches!(
            FileHeader::decode(&bytes),
            Err(Error::CorruptedData(_))
        ));
    }
}
