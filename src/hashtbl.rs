//! Disk-resident hash table
//!
//! Open-addressing table stored directly in the file. Slot `i` lives at
//! `HEADER_SIZE + i * RECORD_SIZE`; every read and write is positioned, so
//! there is no shared file cursor between readers and the writer.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{HashstoreError, Result};
use crate::header::{read_header, validate_log_slots, write_header, TblHeader, HEADER_SIZE};
use crate::record::{Key, Record, Slot, RECORD_SIZE};
use crate::tbl::{
    probe, scan_slots, scan_totals, Counters, OrderedCursor, OrderedLoad, Placement, Probe,
    SlotSource, Tbl, TblStats,
};

/// Load at which a HashTbl should be compacted
pub const HASHTBL_COMPACT_LOAD: f64 = 0.5;

/// Load at which a HashTbl should stop taking inserts
pub const HASHTBL_MAX_LOAD: f64 = 0.95;

/// Slots an ordered session buffers before writing them out (64 KiB)
const MAX_RUN_SLOTS: usize = 1024;

fn slot_offset(slot: u64) -> u64 {
    HEADER_SIZE + slot * RECORD_SIZE as u64
}

impl SlotSource for File {
    fn read_slots(&self, first: u64, buf: &mut [u8]) -> Result<()> {
        let offset = slot_offset(first);
        self.read_exact_at(buf, offset)
            .map_err(HashstoreError::io_at("read slots", offset))
    }
}

/// Disk-resident hash table
///
/// ## Concurrency:
/// - `file`: readers clone the `Arc<File>` and release the lock. Slot writes
///   hold the write side together with their counter update, and
///   `compute_estimates` holds the read side for its whole scan, so a rescan
///   never races a write.
/// - `write_lock`: serializes `insert` and ordered sessions
/// - `counters`: atomics describing the slots on disk
pub struct HashTbl {
    /// Backing file, `None` once closed
    file: RwLock<Option<Arc<File>>>,

    /// Header read at open or written at create
    header: TblHeader,

    /// Running statistics
    counters: Counters,

    /// Serializes write operations (insert / ordered load)
    write_lock: Mutex<()>,
}

impl HashTbl {
    /// Create a fresh table in `fh`, truncating anything already there.
    ///
    /// The header's `kind` is written as given; `open_table` uses it to pick
    /// the variant on the next open.
    pub fn create(fh: File, header: TblHeader) -> Result<Self> {
        validate_log_slots(header.log_slots)?;

        // Truncate first so every slot reads back as zero.
        fh.set_len(0)?;
        fh.set_len(header.table_size())?;
        write_header(&fh, &header)?;

        info!(
            kind = %header.kind,
            log_slots = header.log_slots,
            table_size = header.table_size(),
            "created hash table"
        );

        Ok(Self {
            file: RwLock::new(Some(Arc::new(fh))),
            header,
            counters: Counters::default(),
            write_lock: Mutex::new(()),
        })
    }

    /// Open an existing table and rebuild its statistics.
    ///
    /// Memory-resident files share the slot layout and open here as well.
    pub fn open(ctx: &Context, fh: File) -> Result<Self> {
        let header = read_header(&fh)?;

        let file_size = fh.metadata()?.len();
        if file_size < header.table_size() {
            return Err(HashstoreError::Format(format!(
                "table truncated: expected {} bytes, got {}",
                header.table_size(),
                file_size
            )));
        }

        let tbl = Self {
            file: RwLock::new(Some(Arc::new(fh))),
            header,
            counters: Counters::default(),
            write_lock: Mutex::new(()),
        };
        tbl.compute_estimates(ctx)?;

        info!(
            kind = %header.kind,
            log_slots = header.log_slots,
            num_set = tbl.counters.num_set(),
            "opened hash table"
        );
        Ok(tbl)
    }

    /// Clone the file handle, failing if the table is closed
    fn file(&self) -> Result<Arc<File>> {
        self.file.read().clone().ok_or(HashstoreError::Closed)
    }

    fn is_closed(&self) -> bool {
        self.file.read().is_none()
    }

    /// Run a slot write and its counter update with scans excluded
    fn write_with<T>(&self, f: impl FnOnce(&File) -> Result<T>) -> Result<T> {
        let guard = self.file.write();
        let file = guard.as_deref().ok_or(HashstoreError::Closed)?;
        f(file)
    }

    /// Insert while already holding the writer lock
    fn insert_locked(&self, record: Record) -> Result<bool> {
        let encoded = record.encode()?;

        match probe(&*self.file()?, &self.header, &record.key)? {
            Probe::Found { slot, record: old } => self.write_with(|file| {
                write_slot(file, slot, &encoded)?;
                self.counters.remove(&old);
                self.counters.add(&record);
                Ok(false)
            }),
            Probe::Vacant { slot, corrupt } => self.write_with(|file| {
                write_slot(file, slot, &encoded)?;
                if corrupt {
                    self.counters.reclaim_corrupt();
                }
                self.counters.add(&record);
                Ok(true)
            }),
            Probe::Full => {
                warn!(num_slots = self.header.num_slots(), "hash table full");
                Err(HashstoreError::Capacity {
                    slots: self.header.num_slots(),
                })
            }
        }
    }
}

/// Write one encoded slot with a single positioned write
fn write_slot(file: &File, slot: u64, encoded: &[u8; RECORD_SIZE]) -> Result<()> {
    let offset = slot_offset(slot);
    file.write_all_at(encoded, offset)
        .map_err(HashstoreError::io_at("write slot", offset))
}

impl Tbl for HashTbl {
    fn close(&self) {
        if self.file.write().take().is_some() {
            debug!(log_slots = self.header.log_slots, "closed hash table");
        }
    }

    fn handle(&self) -> Option<Arc<File>> {
        self.file.read().clone()
    }

    fn stats(&self) -> TblStats {
        self.counters.stats(&self.header)
    }

    fn log_slots(&self) -> u64 {
        self.header.log_slots
    }

    fn header(&self) -> TblHeader {
        self.header
    }

    fn compact_load(&self) -> f64 {
        HASHTBL_COMPACT_LOAD
    }

    fn max_load(&self) -> f64 {
        HASHTBL_MAX_LOAD
    }

    fn load(&self) -> f64 {
        self.counters.load(&self.header)
    }

    fn compute_estimates(&self, ctx: &Context) -> Result<()> {
        let guard = self.file.read();
        let file = guard.as_deref().ok_or(HashstoreError::Closed)?;
        let totals = scan_totals(file, &self.header, ctx)?;
        self.counters.store(&totals);
        Ok(())
    }

    fn expect_ordered(&self, ctx: &Context) -> Result<Box<dyn OrderedLoad + '_>> {
        ctx.check()?;
        if self.is_closed() {
            return Err(HashstoreError::Closed);
        }
        let guard = self.write_lock.lock();
        let fast = self.counters.is_pristine();
        debug!(fast, "started ordered load");

        Ok(Box::new(HashOrderedLoad {
            tbl: self,
            _guard: guard,
            cursor: OrderedCursor::default(),
            fast,
            run_start: 0,
            run: Vec::with_capacity(MAX_RUN_SLOTS * RECORD_SIZE),
            done: false,
        }))
    }

    fn range(&self, ctx: &Context, visit: &mut dyn FnMut(&Record) -> Result<bool>) -> Result<()> {
        let file = self.file()?;
        scan_slots(&*file, &self.header, ctx, &mut |_, slot| match slot {
            Slot::Set(record) => visit(&record),
            Slot::Empty | Slot::Corrupt => Ok(true),
        })
    }

    fn insert(&self, ctx: &Context, record: Record) -> Result<bool> {
        ctx.check()?;
        if self.is_closed() {
            return Err(HashstoreError::Closed);
        }
        let _write_guard = self.write_lock.lock();
        self.insert_locked(record)
    }

    fn lookup(&self, ctx: &Context, key: &Key) -> Result<Option<Record>> {
        ctx.check()?;
        let file = self.file()?;
        match probe(&*file, &self.header, key)? {
            Probe::Found { record, .. } => Ok(Some(record)),
            Probe::Vacant { .. } | Probe::Full => Ok(None),
        }
    }

    fn sync(&self) -> Result<()> {
        self.file()?.sync_data()?;
        Ok(())
    }
}

// =============================================================================
// Ordered Load Session
// =============================================================================

/// Ordered session for a HashTbl
///
/// Consecutive slots are buffered in `run` and written with one positioned
/// write when the run breaks, fills up, or the session finishes. Buffered
/// records reach the counters only when their run is written.
struct HashOrderedLoad<'a> {
    tbl: &'a HashTbl,
    _guard: MutexGuard<'a, ()>,
    cursor: OrderedCursor,
    /// Sequential placement is only valid on a table that started empty
    fast: bool,
    /// Slot index of the first buffered slot
    run_start: u64,
    /// Encoded slots `[run_start, run_start + run.len() / RECORD_SIZE)`
    run: Vec<u8>,
    done: bool,
}

impl HashOrderedLoad<'_> {
    fn run_slots(&self) -> u64 {
        (self.run.len() / RECORD_SIZE) as u64
    }

    fn in_run(&self, slot: u64) -> bool {
        slot >= self.run_start && slot < self.run_start + self.run_slots()
    }

    fn flush_run(&mut self) -> Result<()> {
        if self.run.is_empty() {
            return Ok(());
        }
        let offset = slot_offset(self.run_start);
        let tbl = self.tbl;
        let run = &self.run;
        tbl.write_with(|file| {
            file.write_all_at(run, offset)
                .map_err(HashstoreError::io_at("write ordered run", offset))?;
            for raw in run.chunks_exact(RECORD_SIZE) {
                if let Slot::Set(record) = Record::decode(raw) {
                    tbl.counters.add(&record);
                }
            }
            Ok(())
        })?;
        self.run.clear();
        Ok(())
    }

    /// Replace a record this session already placed
    fn overwrite(&mut self, slot: u64, record: &Record, encoded: &[u8; RECORD_SIZE]) -> Result<()> {
        if self.in_run(slot) {
            let at = (slot - self.run_start) as usize * RECORD_SIZE;
            self.run[at..at + RECORD_SIZE].copy_from_slice(encoded);
            return Ok(());
        }

        let tbl = self.tbl;
        tbl.write_with(|file| {
            let mut raw = [0u8; RECORD_SIZE];
            file.read_slots(slot, &mut raw)?;
            write_slot(file, slot, encoded)?;
            if let Slot::Set(old) = Record::decode(&raw) {
                tbl.counters.remove(&old);
            }
            tbl.counters.add(record);
            Ok(())
        })
    }

    fn append(&mut self, slot: u64, encoded: &[u8; RECORD_SIZE]) -> Result<()> {
        let contiguous = !self.run.is_empty() && slot == self.run_start + self.run_slots();
        if !contiguous || self.run_slots() as usize >= MAX_RUN_SLOTS {
            self.flush_run()?;
            self.run_start = slot;
        }
        self.run.extend_from_slice(encoded);
        Ok(())
    }
}

impl OrderedLoad for HashOrderedLoad<'_> {
    fn commit(&mut self, record: Record) -> Result<bool> {
        if self.done || self.tbl.is_closed() {
            return Err(HashstoreError::Closed);
        }
        let home = self.tbl.header.home_slot(&record.key);
        self.cursor.check(home)?;

        if !self.fast {
            return self.tbl.insert_locked(record);
        }

        let encoded = record.encode()?;
        match self.cursor.place(home, &record.key, self.tbl.header.num_slots()) {
            Placement::Duplicate(slot) => {
                self.overwrite(slot, &record, &encoded)?;
                Ok(false)
            }
            Placement::New(slot) => {
                self.append(slot, &encoded)?;
                Ok(true)
            }
            Placement::Wrapped => {
                self.flush_run()?;
                self.fast = false;
                self.tbl.insert_locked(record)
            }
        }
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        if self.done {
            return Err(HashstoreError::Closed);
        }
        if let Some(err) = self.cursor.violation() {
            self.cancel();
            return Err(err);
        }
        if self.tbl.is_closed() {
            self.cancel();
            return Err(HashstoreError::Closed);
        }
        self.flush_run()?;
        self.done = true;
        debug!("finished ordered load");
        Ok(())
    }

    fn cancel(&mut self) {
        if self.done {
            return;
        }
        self.done = true;

        let discarded = self.run_slots();
        self.run.clear();
        debug!(discarded, "cancelled ordered load");
    }
}

impl Drop for HashOrderedLoad<'_> {
    fn drop(&mut self) {
        self.cancel();
    }
}
