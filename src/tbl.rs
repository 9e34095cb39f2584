//! Table abstraction
//!
//! `Tbl` is the capability set both table variants implement. Callers hold a
//! `Box<dyn Tbl>` from [`open_table`] or [`create_table`] and never need to
//! know which variant backs it.
//!
//! ## Concurrency
//! - `lookup`, `range`, `compute_estimates` take `&self` and may run
//!   concurrently with each other and with one writer.
//! - `insert` and ordered sessions serialize on a per-table writer mutex.
//! - Each slot is written with one write of `RECORD_SIZE` bytes, so a reader
//!   sees either the old or the new record, never a mix.

use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::context::Context;
use crate::error::{HashstoreError, Result};
use crate::hashtbl::HashTbl;
use crate::header::{
    read_header, validate_log_slots, TableKind, TblHeader, PAGE_SIZE, SLOTS_PER_PAGE,
};
use crate::memtbl::MemTbl;
use crate::record::{Key, Record, Slot, RECORD_SIZE};

/// Slots read per chunk during full scans (256 KiB)
pub(crate) const SCAN_CHUNK_SLOTS: u64 = 64 * SLOTS_PER_PAGE;

// =============================================================================
// Tbl Interface
// =============================================================================

/// Hash table index for one store
pub trait Tbl: Send + Sync {
    /// Release the backing file. Idempotent.
    fn close(&self);

    /// Backing file handle, `None` once closed
    fn handle(&self) -> Option<Arc<File>>;

    /// Statistics as of the last mutation or `compute_estimates`
    fn stats(&self) -> TblStats;

    /// log2 of the number of slots
    fn log_slots(&self) -> u64;

    /// Header the table was opened or created with
    fn header(&self) -> TblHeader;

    /// Load at which the table should be compacted
    fn compact_load(&self) -> f64;

    /// Load at which the table should stop taking inserts
    fn max_load(&self) -> f64;

    /// Fraction of slots holding a record
    fn load(&self) -> f64;

    /// Rebuild statistics with a full scan of the slot array
    fn compute_estimates(&self, ctx: &Context) -> Result<()>;

    /// Open a bulk-load session for records sorted by home slot
    fn expect_ordered(&self, ctx: &Context) -> Result<Box<dyn OrderedLoad + '_>>;

    /// Visit every occupied slot in physical order until `visit` returns
    /// `Ok(false)` or an error
    fn range(&self, ctx: &Context, visit: &mut dyn FnMut(&Record) -> Result<bool>) -> Result<()>;

    /// Write `record`, returning `true` if its key was not present before
    fn insert(&self, ctx: &Context, record: Record) -> Result<bool>;

    /// Find the record stored for `key`
    fn lookup(&self, ctx: &Context, key: &Key) -> Result<Option<Record>>;

    /// Flush written slots to stable storage
    fn sync(&self) -> Result<()>;
}

/// Bulk-load session returned by [`Tbl::expect_ordered`]
///
/// Records must be committed in non-decreasing home-slot order. The session
/// holds the table's writer lock until it is finished, cancelled or dropped.
pub trait OrderedLoad {
    /// Add one record; returns `true` if its key was new
    fn commit(&mut self, record: Record) -> Result<bool>;

    /// Write out everything buffered and end the session
    fn finish(self: Box<Self>) -> Result<()>;

    /// End the session, discarding buffered writes. Safe to call repeatedly
    /// and after any number of commits.
    fn cancel(&mut self);
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Read the header and open the variant it names
pub fn open_table(ctx: &Context, fh: File) -> Result<Box<dyn Tbl>> {
    let header = read_header(&fh)?;
    match header.kind {
        TableKind::DiskResident => Ok(Box::new(HashTbl::open(ctx, fh)?)),
        TableKind::MemoryResident => Ok(Box::new(MemTbl::open(ctx, fh)?)),
    }
}

/// Create a table of `kind` with hashed keys
pub fn create_table(
    ctx: &Context,
    fh: File,
    log_slots: u64,
    created: u32,
    kind: TableKind,
) -> Result<Box<dyn Tbl>> {
    create_table_with(
        ctx,
        fh,
        TblHeader {
            created,
            hash_key: true,
            kind,
            log_slots,
        },
    )
}

/// Create a table from a fully specified header
pub fn create_table_with(ctx: &Context, fh: File, header: TblHeader) -> Result<Box<dyn Tbl>> {
    validate_log_slots(header.log_slots)?;
    ctx.check()?;
    match header.kind {
        TableKind::DiskResident => Ok(Box::new(HashTbl::create(fh, header)?)),
        TableKind::MemoryResident => Ok(Box::new(MemTbl::create(fh, header)?)),
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics about a hash table
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TblStats {
    /// Number of set records, trash included
    pub num_set: u64,
    /// Sum of lengths in set records
    pub len_set: u64,
    /// Average length of set records
    pub avg_set: f64,

    /// Number of set trash records
    pub num_trash: u64,
    /// Sum of lengths in trash records
    pub len_trash: u64,
    /// Average length of trash records
    pub avg_trash: f64,

    /// Total number of slots
    pub num_slots: u64,
    /// Total bytes in the table file
    pub table_size: u64,
    /// Fraction of slots that are set
    pub load: f64,
    /// Slots whose checksum failed during the last scan
    pub num_corrupt: u64,

    /// When the table was created
    pub created: u32,
    /// Kind of table
    pub kind: TableKind,
}

/// Running totals kept by both variants
#[derive(Debug, Default)]
pub(crate) struct Counters {
    num_set: AtomicU64,
    len_set: AtomicU64,
    num_trash: AtomicU64,
    len_trash: AtomicU64,
    num_corrupt: AtomicU64,
}

/// Totals gathered by one full scan
#[derive(Debug, Default)]
pub(crate) struct ScanTotals {
    num_set: u64,
    len_set: u64,
    num_trash: u64,
    len_trash: u64,
    num_corrupt: u64,
}

impl ScanTotals {
    pub(crate) fn observe(&mut self, slot: &Slot) {
        match slot {
            Slot::Empty => {}
            Slot::Corrupt => self.num_corrupt += 1,
            Slot::Set(rec) => {
                self.num_set += 1;
                self.len_set += u64::from(rec.length);
                if rec.trashed() {
                    self.num_trash += 1;
                    self.len_trash += u64::from(rec.length);
                }
            }
        }
    }
}

impl Counters {
    pub(crate) fn add(&self, rec: &Record) {
        self.num_set.fetch_add(1, Ordering::Relaxed);
        self.len_set.fetch_add(u64::from(rec.length), Ordering::Relaxed);
        if rec.trashed() {
            self.num_trash.fetch_add(1, Ordering::Relaxed);
            self.len_trash.fetch_add(u64::from(rec.length), Ordering::Relaxed);
        }
    }

    /// Counters never go below zero, even if a rescan already dropped `rec`
    pub(crate) fn remove(&self, rec: &Record) {
        saturating_sub(&self.num_set, 1);
        saturating_sub(&self.len_set, u64::from(rec.length));
        if rec.trashed() {
            saturating_sub(&self.num_trash, 1);
            saturating_sub(&self.len_trash, u64::from(rec.length));
        }
    }

    /// A corrupt slot was overwritten with a valid record
    pub(crate) fn reclaim_corrupt(&self) {
        saturating_sub(&self.num_corrupt, 1);
    }

    pub(crate) fn store(&self, totals: &ScanTotals) {
        self.num_set.store(totals.num_set, Ordering::Relaxed);
        self.len_set.store(totals.len_set, Ordering::Relaxed);
        self.num_trash.store(totals.num_trash, Ordering::Relaxed);
        self.len_trash.store(totals.len_trash, Ordering::Relaxed);
        self.num_corrupt.store(totals.num_corrupt, Ordering::Relaxed);
    }

    pub(crate) fn num_set(&self) -> u64 {
        self.num_set.load(Ordering::Relaxed)
    }

    /// Whether no slot has ever been written (as far as the counters know)
    pub(crate) fn is_pristine(&self) -> bool {
        self.num_set() == 0 && self.num_corrupt.load(Ordering::Relaxed) == 0
    }

    pub(crate) fn load(&self, header: &TblHeader) -> f64 {
        self.num_set() as f64 / header.num_slots() as f64
    }

    pub(crate) fn stats(&self, header: &TblHeader) -> TblStats {
        let num_set = self.num_set();
        let len_set = self.len_set.load(Ordering::Relaxed);
        let num_trash = self.num_trash.load(Ordering::Relaxed);
        let len_trash = self.len_trash.load(Ordering::Relaxed);

        TblStats {
            num_set,
            len_set,
            avg_set: average(len_set, num_set),
            num_trash,
            len_trash,
            avg_trash: average(len_trash, num_trash),
            num_slots: header.num_slots(),
            table_size: header.table_size(),
            load: self.load(header),
            num_corrupt: self.num_corrupt.load(Ordering::Relaxed),
            created: header.created,
            kind: header.kind,
        }
    }
}

fn saturating_sub(counter: &AtomicU64, n: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(n))
    });
}

fn average(total: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total as f64 / count as f64
    }
}

// =============================================================================
// Shared Probing and Scanning
// =============================================================================

/// Positioned access to a table's slot array
pub(crate) trait SlotSource {
    /// Fill `buf` with the encoded slots starting at slot index `first`.
    /// `buf.len()` is a multiple of `RECORD_SIZE` and stays inside the table.
    fn read_slots(&self, first: u64, buf: &mut [u8]) -> Result<()>;
}

/// Outcome of probing for a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Probe {
    /// The key is stored at `slot`
    Found { slot: u64, record: Record },
    /// The key is absent; `slot` is where it belongs
    Vacant { slot: u64, corrupt: bool },
    /// Every slot holds some other key
    Full,
}

/// Linear probe from the key's home slot, one page per read.
///
/// Stops at the matching key or the first empty slot. Corrupt slots are
/// skipped but remembered as the insertion point. Examines every slot
/// exactly once before reporting `Full`.
pub(crate) fn probe(src: &dyn SlotSource, header: &TblHeader, key: &Key) -> Result<Probe> {
    let num_slots = header.num_slots();
    let mut page = [0u8; PAGE_SIZE];
    let mut reusable: Option<u64> = None;
    let mut examined = 0u64;
    let mut slot = header.home_slot(key);

    while examined < num_slots {
        let page_start = slot - slot % SLOTS_PER_PAGE;
        src.read_slots(page_start, &mut page)?;

        for idx in (slot - page_start)..SLOTS_PER_PAGE {
            if examined == num_slots {
                break;
            }
            examined += 1;

            let at = idx as usize * RECORD_SIZE;
            match Record::decode(&page[at..at + RECORD_SIZE]) {
                Slot::Empty => {
                    return Ok(match reusable {
                        Some(slot) => Probe::Vacant { slot, corrupt: true },
                        None => Probe::Vacant {
                            slot: page_start + idx,
                            corrupt: false,
                        },
                    });
                }
                Slot::Corrupt => {
                    if reusable.is_none() {
                        warn!(slot = page_start + idx, "slot failed checksum");
                        reusable = Some(page_start + idx);
                    }
                }
                Slot::Set(record) if record.key == *key => {
                    return Ok(Probe::Found {
                        slot: page_start + idx,
                        record,
                    });
                }
                Slot::Set(_) => {}
            }
        }

        slot = (page_start + SLOTS_PER_PAGE) % num_slots;
    }

    Ok(match reusable {
        Some(slot) => Probe::Vacant { slot, corrupt: true },
        None => Probe::Full,
    })
}

/// Decode every slot in physical order, checking `ctx` once per chunk
pub(crate) fn scan_slots(
    src: &dyn SlotSource,
    header: &TblHeader,
    ctx: &Context,
    visit: &mut dyn FnMut(u64, Slot) -> Result<bool>,
) -> Result<()> {
    let num_slots = header.num_slots();
    let chunk_slots = SCAN_CHUNK_SLOTS.min(num_slots);
    let mut chunk = vec![0u8; chunk_slots as usize * RECORD_SIZE];

    let mut first = 0u64;
    while first < num_slots {
        ctx.check()?;
        src.read_slots(first, &mut chunk)?;

        for (i, raw) in chunk.chunks_exact(RECORD_SIZE).enumerate() {
            if !visit(first + i as u64, Record::decode(raw))? {
                return Ok(());
            }
        }
        first += chunk_slots;
    }
    Ok(())
}

/// Gather exact totals with a full scan
pub(crate) fn scan_totals(
    src: &dyn SlotSource,
    header: &TblHeader,
    ctx: &Context,
) -> Result<ScanTotals> {
    let mut totals = ScanTotals::default();
    scan_slots(src, header, ctx, &mut |_, slot| {
        totals.observe(&slot);
        Ok(true)
    })?;
    Ok(totals)
}

// =============================================================================
// Ordered Load Cursor
// =============================================================================

/// Where an ordered session should put the next record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// Key already committed in this session at `slot`
    Duplicate(u64),
    /// First free slot at or after the home slot
    New(u64),
    /// The run reached the end of the table; fall back to probing
    Wrapped,
}

/// Ordering check and sequential slot assignment shared by both sessions.
///
/// Holds the invariant that every slot in `[last_home, next_free)` was
/// written by this session, which is what lets placement skip probing on a
/// table that was empty when the session began.
#[derive(Debug, Default)]
pub(crate) struct OrderedCursor {
    last_home: Option<u64>,
    violation: Option<(u64, u64)>,
    next_free: u64,
    same_home: Vec<(Key, u64)>,
}

impl OrderedCursor {
    /// Reject a home slot smaller than the previous one. Once a violation is
    /// seen the cursor stays poisoned.
    pub(crate) fn check(&mut self, home: u64) -> Result<()> {
        if let Some((previous, slot)) = self.violation {
            return Err(HashstoreError::OrderingViolation { previous, slot });
        }
        match self.last_home {
            Some(previous) if home < previous => {
                warn!(previous, slot = home, "ordered load received out-of-order record");
                self.violation = Some((previous, home));
                Err(HashstoreError::OrderingViolation {
                    previous,
                    slot: home,
                })
            }
            Some(previous) if home == previous => Ok(()),
            _ => {
                self.last_home = Some(home);
                self.same_home.clear();
                Ok(())
            }
        }
    }

    pub(crate) fn violation(&self) -> Option<HashstoreError> {
        self.violation
            .map(|(previous, slot)| HashstoreError::OrderingViolation { previous, slot })
    }

    /// Pick the slot for `key` whose home slot already passed `check`
    pub(crate) fn place(&mut self, home: u64, key: &Key, num_slots: u64) -> Placement {
        if let Some(&(_, slot)) = self.same_home.iter().find(|(k, _)| k == key) {
            return Placement::Duplicate(slot);
        }

        let slot = home.max(self.next_free);
        if slot >= num_slots {
            return Placement::Wrapped;
        }
        self.next_free = slot + 1;
        self.same_home.push((*key, slot));
        Placement::New(slot)
    }
}
