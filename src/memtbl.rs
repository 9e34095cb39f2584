//! Memory-resident hash table
//!
//! Same header and slot layout as the disk-resident table, with the whole
//! file memory-mapped. Probing and ordered loads touch only memory; the map
//! is flushed back to the file on `sync` and `close`, so the file can later
//! be opened by either variant.

use std::fs::File;
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};
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

/// Load at which a MemTbl should be compacted
pub const MEMTBL_COMPACT_LOAD: f64 = 0.75;

/// Load at which a MemTbl should stop taking inserts
pub const MEMTBL_MAX_LOAD: f64 = 0.95;

/// Open file plus its mapping
struct MemState {
    file: Arc<File>,
    map: MmapMut,
}

/// Slot array view over a mapped table
struct MemSlots<'a>(&'a [u8]);

impl SlotSource for MemSlots<'_> {
    fn read_slots(&self, first: u64, buf: &mut [u8]) -> Result<()> {
        let start = first as usize * RECORD_SIZE;
        let src = self.0.get(start..start + buf.len()).ok_or_else(|| {
            HashstoreError::InvalidArgument(format!("slot {} outside mapped table", first))
        })?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

impl MemState {
    fn slots(&self) -> MemSlots<'_> {
        MemSlots(&self.map[HEADER_SIZE as usize..])
    }

    fn write_slot(&mut self, slot: u64, encoded: &[u8; RECORD_SIZE]) {
        let at = HEADER_SIZE as usize + slot as usize * RECORD_SIZE;
        self.map[at..at + RECORD_SIZE].copy_from_slice(encoded);
    }

    fn read_slot(&self, slot: u64) -> Slot {
        let at = HEADER_SIZE as usize + slot as usize * RECORD_SIZE;
        Record::decode(&self.map[at..at + RECORD_SIZE])
    }
}

/// Memory-mapped hash table
///
/// ## Concurrency:
/// - `state`: RwLock over the mapping; readers share it, each slot write
///   takes it exclusively
/// - `write_lock`: serializes `insert` and ordered sessions
pub struct MemTbl {
    /// Mapping, `None` once closed
    state: RwLock<Option<MemState>>,

    /// Header read at open or written at create
    header: TblHeader,

    /// Running statistics
    counters: Counters,

    /// Serializes write operations (insert / ordered load)
    write_lock: Mutex<()>,
}

/// Map the full table file read-write
fn map_table(fh: &File, header: &TblHeader) -> Result<MmapMut> {
    let len = usize::try_from(header.table_size()).map_err(|_| {
        HashstoreError::InvalidArgument(format!(
            "table of {} bytes cannot be mapped on this platform",
            header.table_size()
        ))
    })?;

    // Safety: the table owns the file exclusively while it is open, and no
    // other process may modify it concurrently.
    let map = unsafe { MmapOptions::new().len(len).map_mut(fh)? };
    Ok(map)
}

impl MemTbl {
    /// Create a fresh table in `fh`, truncating anything already there
    pub fn create(fh: File, header: TblHeader) -> Result<Self> {
        validate_log_slots(header.log_slots)?;

        fh.set_len(0)?;
        fh.set_len(header.table_size())?;
        write_header(&fh, &header)?;
        let map = map_table(&fh, &header)?;

        info!(
            kind = %header.kind,
            log_slots = header.log_slots,
            table_size = header.table_size(),
            "created memory table"
        );

        Ok(Self {
            state: RwLock::new(Some(MemState {
                file: Arc::new(fh),
                map,
            })),
            header,
            counters: Counters::default(),
            write_lock: Mutex::new(()),
        })
    }

    /// Map an existing table file and rebuild its statistics
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
        let map = map_table(&fh, &header)?;

        let tbl = Self {
            state: RwLock::new(Some(MemState {
                file: Arc::new(fh),
                map,
            })),
            header,
            counters: Counters::default(),
            write_lock: Mutex::new(()),
        };
        tbl.compute_estimates(ctx)?;

        info!(
            kind = %header.kind,
            log_slots = header.log_slots,
            num_set = tbl.counters.num_set(),
            "opened memory table"
        );
        Ok(tbl)
    }

    fn is_closed(&self) -> bool {
        self.state.read().is_none()
    }

    /// Insert while already holding the writer lock
    fn insert_locked(&self, record: Record) -> Result<bool> {
        let encoded = record.encode()?;
        let mut guard = self.state.write();
        let state = guard.as_mut().ok_or(HashstoreError::Closed)?;

        match probe(&state.slots(), &self.header, &record.key)? {
            Probe::Found { slot, record: old } => {
                state.write_slot(slot, &encoded);
                self.counters.remove(&old);
                self.counters.add(&record);
                Ok(false)
            }
            Probe::Vacant { slot, corrupt } => {
                state.write_slot(slot, &encoded);
                if corrupt {
                    self.counters.reclaim_corrupt();
                }
                self.counters.add(&record);
                Ok(true)
            }
            Probe::Full => {
                warn!(num_slots = self.header.num_slots(), "memory table full");
                Err(HashstoreError::Capacity {
                    slots: self.header.num_slots(),
                })
            }
        }
    }
}

impl Tbl for MemTbl {
    fn close(&self) {
        if let Some(state) = self.state.write().take() {
            if let Err(err) = state.map.flush() {
                warn!(error = %err, "failed to flush memory table on close");
            }
            debug!(log_slots = self.header.log_slots, "closed memory table");
        }
    }

    fn handle(&self) -> Option<Arc<File>> {
        self.state.read().as_ref().map(|state| Arc::clone(&state.file))
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
        MEMTBL_COMPACT_LOAD
    }

    fn max_load(&self) -> f64 {
        MEMTBL_MAX_LOAD
    }

    fn load(&self) -> f64 {
        self.counters.load(&self.header)
    }

    fn compute_estimates(&self, ctx: &Context) -> Result<()> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or(HashstoreError::Closed)?;
        let totals = scan_totals(&state.slots(), &self.header, ctx)?;
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

        Ok(Box::new(MemOrderedLoad {
            tbl: self,
            _guard: guard,
            cursor: OrderedCursor::default(),
            fast,
            done: false,
        }))
    }

    fn range(&self, ctx: &Context, visit: &mut dyn FnMut(&Record) -> Result<bool>) -> Result<()> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or(HashstoreError::Closed)?;
        scan_slots(&state.slots(), &self.header, ctx, &mut |_, slot| match slot {
            Slot::Set(record) => visit(&record),
            Slot::Empty | Slot::Corrupt => Ok(true),
        })
    }

    fn insert(&self, ctx: &Context, record: Record) -> Result<bool> {
        ctx.check()?;
        let _write_guard = self.write_lock.lock();
        self.insert_locked(record)
    }

    fn lookup(&self, ctx: &Context, key: &Key) -> Result<Option<Record>> {
        ctx.check()?;
        let guard = self.state.read();
        let state = guard.as_ref().ok_or(HashstoreError::Closed)?;
        match probe(&state.slots(), &self.header, key)? {
            Probe::Found { record, .. } => Ok(Some(record)),
            Probe::Vacant { .. } | Probe::Full => Ok(None),
        }
    }

    fn sync(&self) -> Result<()> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or(HashstoreError::Closed)?;
        state.map.flush()?;
        Ok(())
    }
}

// =============================================================================
// Ordered Load Session
// =============================================================================

/// Ordered session for a MemTbl. Slots are written straight into the map,
/// so cancelling keeps whatever was already committed.
struct MemOrderedLoad<'a> {
    tbl: &'a MemTbl,
    _guard: MutexGuard<'a, ()>,
    cursor: OrderedCursor,
    fast: bool,
    done: bool,
}

impl OrderedLoad for MemOrderedLoad<'_> {
    fn commit(&mut self, record: Record) -> Result<bool> {
        if self.done || self.tbl.is_closed() {
            return Err(HashstoreError::Closed);
        }
        let home = self.tbl.header.home_slot(&record.key);
        self.cursor.check(home)?;

        if !self.fast {
            return self.tbl.insert_locked(record);
        }

        let placement = self
            .cursor
            .place(home, &record.key, self.tbl.header.num_slots());
        let slot = match placement {
            Placement::Wrapped => {
                self.fast = false;
                return self.tbl.insert_locked(record);
            }
            Placement::Duplicate(slot) | Placement::New(slot) => slot,
        };

        let encoded = record.encode()?;
        let mut guard = self.tbl.state.write();
        let state = guard.as_mut().ok_or(HashstoreError::Closed)?;

        let inserted = match state.read_slot(slot) {
            Slot::Set(old) => {
                self.tbl.counters.remove(&old);
                false
            }
            Slot::Empty | Slot::Corrupt => true,
        };
        state.write_slot(slot, &encoded);
        self.tbl.counters.add(&record);
        Ok(inserted)
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        if self.done {
            return Err(HashstoreError::Closed);
        }
        self.done = true;
        if let Some(err) = self.cursor.violation() {
            return Err(err);
        }
        if self.tbl.is_closed() {
            return Err(HashstoreError::Closed);
        }
        debug!("finished ordered load");
        Ok(())
    }

    fn cancel(&mut self) {
        if !self.done {
            self.done = true;
            debug!("cancelled ordered load");
        }
    }
}

impl Drop for MemOrderedLoad<'_> {
    fn drop(&mut self) {
        self.cancel();
    }
}
