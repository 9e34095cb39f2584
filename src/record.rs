//! Record layout
//!
//! Fixed 64-byte encoding of one index entry. Slots hold exactly one
//! encoded record each.
//!
//! ## Slot Format (little-endian)
//! ```text
//! ┌──────────┬────────────┬─────────┬────────────┬─────────────┬─────────────┬──────────────┐
//! │ Key (32) │ Offset (6) │ Log (8) │ Length (4) │ Created (3) │ Expires (3) │ Checksum (8) │
//! └──────────┴────────────┴─────────┴────────────┴─────────────┴─────────────┴──────────────┘
//! ```
//!
//! `Created` and `Expires` are days since the unix epoch in 23 bits; bit 23
//! of `Expires` is the trash flag. The checksum is xxh3-64 over the first
//! 56 bytes. A slot whose checksum does not match holds no record.

use std::fmt;
use std::str::FromStr;

use xxhash_rust::xxh3::xxh3_64;

use crate::error::{HashstoreError, Result};

/// Size in bytes of an encoded record (and of one slot)
pub const RECORD_SIZE: usize = 64;

/// Size in bytes of a content key
pub const KEY_SIZE: usize = 32;

const CHECKSUM_OFFSET: usize = 56;

const MAX_OFFSET: u64 = (1 << 48) - 1;
const MAX_DAYS: u32 = (1 << 23) - 1;
const TRASH_BIT: u32 = 1 << 23;

// =============================================================================
// Key
// =============================================================================

/// Content-address key of a stored piece
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(pub [u8; KEY_SIZE]);

impl Key {
    /// Borrow the raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl From<[u8; KEY_SIZE]> for Key {
    fn from(bytes: [u8; KEY_SIZE]) -> Self {
        Key(bytes)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self)
    }
}

impl FromStr for Key {
    type Err = HashstoreError;

    /// Parse a key from 64 hex characters
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if !s.is_ascii() || s.len() != KEY_SIZE * 2 {
            return Err(HashstoreError::InvalidArgument(format!(
                "key must be {} hex characters, got {}",
                KEY_SIZE * 2,
                s.len()
            )));
        }

        let mut key = [0u8; KEY_SIZE];
        for (i, byte) in key.iter_mut().enumerate() {
            let pair = &s[i * 2..i * 2 + 2];
            *byte = u8::from_str_radix(pair, 16).map_err(|_| {
                HashstoreError::InvalidArgument(format!("invalid hex in key: {:?}", pair))
            })?;
        }
        Ok(Key(key))
    }
}

// =============================================================================
// Expiration
// =============================================================================

/// Expiration day plus trash flag. Zero days means the record never expires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Expiration {
    days: u32,
    trash: bool,
}

impl Expiration {
    /// A record that never expires and is not trash
    pub const NEVER: Expiration = Expiration {
        days: 0,
        trash: false,
    };

    /// Build an expiration from days since the unix epoch and the trash flag.
    /// Days beyond 23 bits are kept as given and rejected when encoded.
    pub fn new(days: u32, trash: bool) -> Self {
        Expiration { days, trash }
    }

    /// Days since the unix epoch, 0 when the record never expires
    pub fn days(&self) -> u32 {
        self.days
    }

    /// Whether the record has been soft-deleted
    pub fn trash(&self) -> bool {
        self.trash
    }

    /// Whether the record is eligible for removal on `today` (days since epoch)
    pub fn is_expired(&self, today: u32) -> bool {
        self.days != 0 && self.days <= today
    }

    fn encode(&self) -> Result<u32> {
        if self.days > MAX_DAYS {
            return Err(HashstoreError::InvalidArgument(format!(
                "expiration day {} exceeds {}",
                self.days, MAX_DAYS
            )));
        }
        Ok(self.days | if self.trash { TRASH_BIT } else { 0 })
    }

    fn decode(raw: u32) -> Self {
        Expiration::new(raw & MAX_DAYS, raw & TRASH_BIT != 0)
    }
}

// =============================================================================
// Record
// =============================================================================

/// Metadata for one stored piece
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Record {
    /// Content key
    pub key: Key,
    /// Byte offset of the piece inside its log file (48 bits)
    pub offset: u64,
    /// Id of the log file holding the piece
    pub log: u64,
    /// Length of the piece in bytes
    pub length: u32,
    /// Days since the unix epoch when the record was created (23 bits)
    pub created: u32,
    /// Expiration and trash flag
    pub expires: Expiration,
}

/// Decoded state of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// All-zero slot that was never written
    Empty,
    /// Slot holding a valid record
    Set(Record),
    /// Non-zero slot whose checksum does not match
    Corrupt,
}

impl Record {
    /// Whether the record is soft-deleted
    pub fn trashed(&self) -> bool {
        self.expires.trash()
    }

    /// Encode the record into its slot representation
    pub fn encode(&self) -> Result<[u8; RECORD_SIZE]> {
        if self.offset > MAX_OFFSET {
            return Err(HashstoreError::InvalidArgument(format!(
                "record offset {} exceeds 48 bits",
                self.offset
            )));
        }
        if self.created > MAX_DAYS {
            return Err(HashstoreError::InvalidArgument(format!(
                "record created day {} exceeds {}",
                self.created, MAX_DAYS
            )));
        }
        let expires = self.expires.encode()?;

        let mut buf = [0u8; RECORD_SIZE];
        buf[0..32].copy_from_slice(&self.key.0);
        buf[32..38].copy_from_slice(&self.offset.to_le_bytes()[..6]);
        buf[38..46].copy_from_slice(&self.log.to_le_bytes());
        buf[46..50].copy_from_slice(&self.length.to_le_bytes());
        buf[50..53].copy_from_slice(&self.created.to_le_bytes()[..3]);
        buf[53..56].copy_from_slice(&expires.to_le_bytes()[..3]);

        let checksum = xxh3_64(&buf[..CHECKSUM_OFFSET]);
        buf[CHECKSUM_OFFSET..].copy_from_slice(&checksum.to_le_bytes());
        Ok(buf)
    }

    /// Decode one slot. `buf` must be exactly `RECORD_SIZE` bytes.
    pub fn decode(buf: &[u8]) -> Slot {
        debug_assert_eq!(buf.len(), RECORD_SIZE);

        let stored = u64::from_le_bytes(le_array::<8>(&buf[CHECKSUM_OFFSET..]));
        if stored != xxh3_64(&buf[..CHECKSUM_OFFSET]) {
            return if buf.iter().all(|&b| b == 0) {
                Slot::Empty
            } else {
                Slot::Corrupt
            };
        }

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&buf[0..32]);

        Slot::Set(Record {
            key: Key(key),
            offset: u64::from_le_bytes(le_array::<8>(&buf[32..38])),
            log: u64::from_le_bytes(le_array::<8>(&buf[38..46])),
            length: u32::from_le_bytes(le_array::<4>(&buf[46..50])),
            created: u32::from_le_bytes(le_array::<4>(&buf[50..53])),
            expires: Expiration::decode(u32::from_le_bytes(le_array::<4>(&buf[53..56]))),
        })
    }
}

/// Zero-extend a little-endian field of up to N bytes
fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out[..bytes.len()].copy_from_slice(bytes);
    out
}
