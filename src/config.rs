//! Configuration for hashstore
//!
//! Centralized configuration with sensible defaults. The default table kind
//! is resolved once, at startup, and threaded into table creation.

use std::fs::File;

use crate::context::Context;
use crate::error::{HashstoreError, Result};
use crate::header::{TableKind, TblHeader};
use crate::tbl::{create_table_with, Tbl};

/// Environment variable selecting the kind of newly created tables
pub const DEFAULT_KIND_ENV: &str = "HASHSTORE_TABLE_DEFAULT_KIND";

/// Table creation settings
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Table Creation
    // -------------------------------------------------------------------------
    /// Kind written into the header of new tables
    pub default_kind: TableKind,

    /// Whether new tables hash keys before computing home slots
    pub hash_key: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_kind: TableKind::DiskResident,
            hash_key: true,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Defaults overridden by `HASHSTORE_TABLE_DEFAULT_KIND`.
    ///
    /// An unrecognized value is a configuration error; callers are expected
    /// to abort startup on it.
    pub fn from_env() -> Result<Self> {
        let value = std::env::var(DEFAULT_KIND_ENV).unwrap_or_default();
        Ok(Self {
            default_kind: parse_table_kind(&value)?,
            ..Self::default()
        })
    }

    /// Create a table of the configured kind
    pub fn create_table(
        &self,
        ctx: &Context,
        fh: File,
        log_slots: u64,
        created: u32,
    ) -> Result<Box<dyn Tbl>> {
        create_table_with(
            ctx,
            fh,
            TblHeader {
                created,
                hash_key: self.hash_key,
                kind: self.default_kind,
                log_slots,
            },
        )
    }
}

/// Parse a default-kind setting.
///
/// `""`, `"hashtbl"` and `"hash"` select the disk-resident table; `"memtbl"`
/// and `"mem"` the memory-resident one.
pub fn parse_table_kind(value: &str) -> Result<TableKind> {
    match value {
        "" | "hashtbl" | "hash" => Ok(TableKind::DiskResident),
        "memtbl" | "mem" => Ok(TableKind::MemoryResident),
        other => Err(HashstoreError::Config(format!(
            "unknown table kind: {:?}",
            other
        ))),
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the kind of newly created tables
    pub fn default_kind(mut self, kind: TableKind) -> Self {
        self.config.default_kind = kind;
        self
    }

    /// Set whether new tables hash their keys
    pub fn hash_key(mut self, hash_key: bool) -> Self {
        self.config.hash_key = hash_key;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
