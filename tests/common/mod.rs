//! Shared helpers for integration tests

#![allow(dead_code)]

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use hashstore::{create_table_with, Context, Expiration, Key, Record, TableKind, Tbl, TblHeader};
use rand::Rng;
use tempfile::TempDir;

pub const LOG_SLOTS: u64 = 14;
pub const NUM_SLOTS: u64 = 1 << LOG_SLOTS;

pub fn setup_temp_table() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("test.tbl");
    (temp_dir, path)
}

pub fn open_rw(path: &Path) -> File {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .unwrap()
}

pub fn header(kind: TableKind, hash_key: bool) -> TblHeader {
    TblHeader {
        created: 1_700_000_000,
        hash_key,
        kind,
        log_slots: LOG_SLOTS,
    }
}

/// Create a table with hashed keys
pub fn create(path: &Path, kind: TableKind) -> Box<dyn Tbl> {
    create_table_with(&Context::background(), open_rw(path), header(kind, true)).unwrap()
}

/// Create a table whose home slot is the first 8 key bytes (big-endian)
pub fn create_unhashed(path: &Path, kind: TableKind) -> Box<dyn Tbl> {
    create_table_with(&Context::background(), open_rw(path), header(kind, false)).unwrap()
}

/// Key that lands on `home` in an unhashed table; `id` keeps keys distinct
pub fn key_at(home: u64, id: u64) -> Key {
    let mut key = [0u8; 32];
    key[0..8].copy_from_slice(&home.to_be_bytes());
    key[8..16].copy_from_slice(&id.to_be_bytes());
    Key(key)
}

/// Deterministic, well-spread key derived from an index
pub fn key_n(n: u64) -> Key {
    let mut key = [0xA5u8; 32];
    key[0..8].copy_from_slice(&mix(n).to_le_bytes());
    key[24..32].copy_from_slice(&n.to_be_bytes());
    Key(key)
}

fn mix(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

pub fn random_key(rng: &mut impl Rng) -> Key {
    let mut key = [0u8; 32];
    rng.fill(&mut key);
    Key(key)
}

pub fn record(key: Key, n: u64) -> Record {
    Record {
        key,
        offset: n * 512,
        log: n % 7 + 1,
        length: (n % 1000) as u32 + 1,
        created: 19_000 + (n % 100) as u32,
        expires: Expiration::NEVER,
    }
}

pub fn trash_record(key: Key, n: u64, expires_day: u32) -> Record {
    Record {
        expires: Expiration::new(expires_day, true),
        ..record(key, n)
    }
}

/// Every record visited by `range`, sorted by key
pub fn collect(tbl: &dyn Tbl) -> Vec<Record> {
    let mut out = Vec::new();
    tbl.range(&Context::background(), &mut |rec| {
        out.push(*rec);
        Ok(true)
    })
    .unwrap();
    out.sort_by_key(|rec| rec.key);
    out
}
