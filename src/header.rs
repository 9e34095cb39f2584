//! Table header codec
//!
//! Every table file starts with one 4096-byte header page.
//!
//! ## Header Format (big-endian)
//! ```text
//! ┌───────────┬─────────────┬─────────────┬──────────┬──────────────┬─────────────┬──────────────┐
//! │ Magic (4) │ Created (4) │ HashKey (1) │ Kind (1) │ LogSlots (8) │ Zero padding│ Checksum (8) │
//! └───────────┴─────────────┴─────────────┴──────────┴──────────────┴─────────────┴──────────────┘
//!   0           4             8             9          10             18            4088
//! ```
//!
//! The checksum is xxh3-64 over bytes `[0, 4088)`. The slot array follows
//! at byte 4096.

use std::fmt;
use std::fs::File;
use std::os::unix::fs::FileExt;

use xxhash_rust::xxh3::xxh3_64;

use crate::error::{HashstoreError, Result};
use crate::record::{Key, RECORD_SIZE};

// =============================================================================
// Shared Constants
// =============================================================================

/// Magic bytes identifying a hash table file
pub const MAGIC: &[u8; 4] = b"HTBL";

/// Size of the header page; the slot array starts here
pub const HEADER_SIZE: u64 = 4096;

/// log2 of the slot count of the smallest table
pub const MIN_LOG_SLOTS: u64 = 14;

/// log2 of the slot count of the largest table
pub const MAX_LOG_SLOTS: u64 = 56;

/// Unit of positioned reads while probing
pub const PAGE_SIZE: usize = 4096;

/// Number of slots in one probing page
pub const SLOTS_PER_PAGE: u64 = (PAGE_SIZE / RECORD_SIZE) as u64;

const CHECKSUM_OFFSET: usize = HEADER_SIZE as usize - 8;

// The largest table must fit in a signed 64-bit byte count, and the smallest
// slot array must still span more than one page.
const _: () = assert!(
    (HEADER_SIZE as u128) + ((1u128 << MAX_LOG_SLOTS) * RECORD_SIZE as u128) <= i64::MAX as u128
);
const _: () = assert!((1u64 << MIN_LOG_SLOTS) * RECORD_SIZE as u64 > PAGE_SIZE as u64);
const _: () = assert!(PAGE_SIZE % RECORD_SIZE == 0);

// =============================================================================
// Table Kind
// =============================================================================

/// Which implementation owns a table file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum TableKind {
    /// Open-addressing table read and written with positioned file I/O
    #[default]
    DiskResident = 0,
    /// Same slot layout, held in a memory-mapped region
    MemoryResident = 1,
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableKind::DiskResident => write!(f, "HashTbl"),
            TableKind::MemoryResident => write!(f, "MemTbl"),
        }
    }
}

impl TryFrom<u8> for TableKind {
    type Error = HashstoreError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(TableKind::DiskResident),
            1 => Ok(TableKind::MemoryResident),
            other => Err(HashstoreError::UnknownKind(other)),
        }
    }
}

// =============================================================================
// Header
// =============================================================================

/// Header stored in the first page of a table file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TblHeader {
    /// When the table was created
    pub created: u32,
    /// Whether keys are hashed before computing the home slot
    pub hash_key: bool,
    /// Which implementation opens the file
    pub kind: TableKind,
    /// log2 of the number of slots
    pub log_slots: u64,
}

impl TblHeader {
    /// Number of slots in the table
    pub fn num_slots(&self) -> u64 {
        1 << self.log_slots
    }

    /// Total file size: header page plus the slot array
    pub fn table_size(&self) -> u64 {
        HEADER_SIZE + self.num_slots() * RECORD_SIZE as u64
    }

    /// Slot index a key hashes to before collision resolution
    pub fn home_slot(&self, key: &Key) -> u64 {
        let hash = if self.hash_key {
            xxh3_64(key.as_bytes())
        } else {
            let mut prefix = [0u8; 8];
            prefix.copy_from_slice(&key.as_bytes()[..8]);
            u64::from_be_bytes(prefix)
        };
        hash & (self.num_slots() - 1)
    }

    /// Encode the header page
    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];

        buf[0..4].copy_from_slice(MAGIC);
        buf[4..8].copy_from_slice(&self.created.to_be_bytes());
        buf[8] = u8::from(self.hash_key);
        buf[9] = self.kind as u8;
        buf[10..18].copy_from_slice(&self.log_slots.to_be_bytes());

        let checksum = xxh3_64(&buf[..CHECKSUM_OFFSET]);
        buf[CHECKSUM_OFFSET..].copy_from_slice(&checksum.to_be_bytes());
        buf
    }

    /// Decode and validate a header page
    pub fn decode(buf: &[u8; HEADER_SIZE as usize]) -> Result<Self> {
        if &buf[0..4] != MAGIC {
            return Err(HashstoreError::Format(format!("bad magic {:?}", &buf[0..4])));
        }

        let mut stored = [0u8; 8];
        stored.copy_from_slice(&buf[CHECKSUM_OFFSET..]);
        let stored = u64::from_be_bytes(stored);
        let computed = xxh3_64(&buf[..CHECKSUM_OFFSET]);
        if stored != computed {
            return Err(HashstoreError::Integrity { stored, computed });
        }

        let mut created = [0u8; 4];
        created.copy_from_slice(&buf[4..8]);
        let mut log_slots = [0u8; 8];
        log_slots.copy_from_slice(&buf[10..18]);

        let header = TblHeader {
            created: u32::from_be_bytes(created),
            hash_key: buf[8] != 0,
            kind: TableKind::try_from(buf[9])?,
            log_slots: u64::from_be_bytes(log_slots),
        };

        if validate_log_slots(header.log_slots).is_err() {
            return Err(HashstoreError::Format(format!(
                "log_slots {} outside [{}, {}]",
                header.log_slots, MIN_LOG_SLOTS, MAX_LOG_SLOTS
            )));
        }
        Ok(header)
    }
}

/// Reject slot counts outside `[MIN_LOG_SLOTS, MAX_LOG_SLOTS]`
pub fn validate_log_slots(log_slots: u64) -> Result<()> {
    if (MIN_LOG_SLOTS..=MAX_LOG_SLOTS).contains(&log_slots) {
        Ok(())
    } else {
        Err(HashstoreError::InvalidArgument(format!(
            "log_slots {} outside [{}, {}]",
            log_slots, MIN_LOG_SLOTS, MAX_LOG_SLOTS
        )))
    }
}

/// Write the header page at offset 0 with a single positioned write
pub fn write_header(fh: &File, header: &TblHeader) -> Result<()> {
    fh.write_all_at(&header.encode(), 0)
        .map_err(HashstoreError::io_at("write header", 0))
}

/// Read and validate the header page at offset 0
pub fn read_header(fh: &File) -> Result<TblHeader> {
    let mut buf = [0u8; HEADER_SIZE as usize];
    fh.read_exact_at(&mut buf, 0)
        .map_err(HashstoreError::io_at("read header", 0))?;
    TblHeader::decode(&buf)
}
