//! # hashstore
//!
//! Durable content-addressed index for a storage node:
//! - One file per table: a checksummed 4096-byte header plus a fixed slot array
//! - Open addressing with linear probing over 64-byte records
//! - Two interchangeable variants behind one `Tbl` interface
//! - Ordered bulk loading for compaction rewrites
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  open_table / create_table                   │
//! │               (dispatch on header kind byte)                 │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ Box<dyn Tbl>
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │   HashTbl   │          │   MemTbl    │
//!   │ (pread/     │          │   (mmap)    │
//!   │  pwrite)    │          │             │
//!   └──────┬──────┘          └──────┬──────┘
//!          └────────────┬────────────┘
//!                       ▼
//!   ┌─────────────────────────────────────────┐
//!   │ Header (4096) │ Slot 0 │ Slot 1 │ ...   │
//!   └─────────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod context;

pub mod record;
pub mod header;
pub mod tbl;
pub mod hashtbl;
pub mod memtbl;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{HashstoreError, Result};
pub use config::Config;
pub use context::Context;
pub use record::{Expiration, Key, Record, RECORD_SIZE};
pub use header::{read_header, write_header, TableKind, TblHeader};
pub use tbl::{create_table, create_table_with, open_table, OrderedLoad, Tbl, TblStats};
pub use hashtbl::HashTbl;
pub use memtbl::MemTbl;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of hashstore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
