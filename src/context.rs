//! Cancellation context
//!
//! Long scans (`range`, `compute_estimates`) poll a `Context` between pages
//! and return `HashstoreError::Cancelled` once it fires. Clones share the
//! same cancellation flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{HashstoreError, Result};

/// Cancellation signal shared between a caller and a running table scan
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that never fires unless cancelled explicitly
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that fires once `timeout` has elapsed
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// Fire the context. Every clone observes it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether the context has been cancelled or its deadline has passed
    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }
        matches!(self.deadline, Some(deadline) if Instant::now() >= deadline)
    }

    /// Returns `Err(Cancelled)` if the context has fired
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(HashstoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}
