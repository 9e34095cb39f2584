//! Error types for hashstore
//!
//! Provides a unified error type for all table operations.

use thiserror::Error;

/// Result type alias using HashstoreError
pub type Result<T> = std::result::Result<T, HashstoreError>;

/// Unified error type for hashstore operations
#[derive(Debug, Error)]
pub enum HashstoreError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error during {op} at offset {offset}: {source}")]
    IoAt {
        op: &'static str,
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    // -------------------------------------------------------------------------
    // Header Errors (unrecoverable for the file)
    // -------------------------------------------------------------------------
    #[error("invalid header: {0}")]
    Format(String),

    #[error("invalid header checksum: {stored:016x} != {computed:016x}")]
    Integrity { stored: u64, computed: u64 },

    #[error("unknown table kind: {0}")]
    UnknownKind(u8),

    // -------------------------------------------------------------------------
    // Caller Logic Errors
    // -------------------------------------------------------------------------
    #[error("hash table full: no free slot among {slots} slots")]
    Capacity { slots: u64 },

    #[error("ordered load out of order: slot {slot} after slot {previous}")]
    OrderingViolation { previous: u64, slot: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("table is closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl HashstoreError {
    /// Wrap an I/O error with the operation and file offset it failed at.
    pub(crate) fn io_at(op: &'static str, offset: u64) -> impl FnOnce(std::io::Error) -> Self {
        move |source| HashstoreError::IoAt { op, offset, source }
    }

    /// Whether the error means the table file itself cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            HashstoreError::Format(_) | HashstoreError::Integrity { .. } | HashstoreError::UnknownKind(_)
        )
    }
}
