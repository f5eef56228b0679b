//! The shared memory region: segment registry, live-transaction set, and
//! the single shared/exclusive lock guarding both.

use crate::error::{Result, StmError};
use crate::segment::{Segment, SegmentTable};
use crate::transaction::{AllocResult, Transaction, TxHandle, TxId};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Synthetic address space base. Real OS memory isn't involved; addresses
/// are opaque `usize` handles doled out by a bump allocator so that every
/// segment gets a stable, orderable identity.
const ADDRESS_SPACE_BASE: usize = 0x1_0000;

/// Everything the region's single lock protects.
pub struct RegionInner {
    pub segments: SegmentTable,
    pub live: std::collections::HashMap<TxId, Arc<TxHandle>>,
}

/// Counters exposed for observability; cheap enough to update unconditionally.
#[derive(Default)]
pub struct RegionMetrics {
    pub began: AtomicUsize,
    pub committed: AtomicUsize,
    pub aborted: AtomicUsize,
}

impl RegionMetrics {
    fn record_begin(&self) {
        self.began.fetch_add(1, Ordering::Relaxed);
    }

    fn record_commit(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_abort(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (usize, usize, usize) {
        (
            self.began.load(Ordering::Relaxed),
            self.committed.load(Ordering::Relaxed),
            self.aborted.load(Ordering::Relaxed),
        )
    }
}

/// A shared memory region: one non-freeable first segment plus whatever
/// segments transactions allocate and free over its lifetime.
pub struct Region {
    inner: RwLock<RegionInner>,
    alignment: usize,
    first_segment_base: usize,
    first_segment_size: usize,
    next_addr: AtomicUsize,
    next_tx_id: AtomicU64,
    pub metrics: RegionMetrics,
}

impl Region {
    /// Create a region whose first segment is `size` bytes, aligned to
    /// `align`. `size` must be a positive multiple of `align`.
    pub fn create(size: usize, align: usize) -> Result<Self> {
        if align == 0 || !align.is_power_of_two() || size == 0 || size % align != 0 {
            return Err(StmError::Misaligned { size, align });
        }

        let base = ADDRESS_SPACE_BASE;
        let mut segments = SegmentTable::new();
        segments.insert(Segment::new(base, size));

        info!(size, align, base, "region created");
        Ok(Self {
            inner: RwLock::new(RegionInner {
                segments,
                live: std::collections::HashMap::new(),
            }),
            alignment: align,
            first_segment_base: base,
            first_segment_size: size,
            next_addr: AtomicUsize::new(base + size),
            next_tx_id: AtomicU64::new(1),
            metrics: RegionMetrics::default(),
        })
    }

    pub fn start(&self) -> usize {
        self.first_segment_base
    }

    pub fn size(&self) -> usize {
        self.first_segment_size
    }

    pub fn align(&self) -> usize {
        self.alignment
    }

    pub fn with_read_lock<T>(&self, f: impl FnOnce(&RegionInner) -> T) -> Result<T> {
        let guard = self
            .inner
            .read()
            .map_err(|e| StmError::LockPoisoned(e.to_string()))?;
        Ok(f(&guard))
    }

    pub fn with_write_lock<T>(&self, f: impl FnOnce(&mut RegionInner) -> T) -> Result<T> {
        let mut guard = self
            .inner
            .write()
            .map_err(|e| StmError::LockPoisoned(e.to_string()))?;
        Ok(f(&mut guard))
    }

    /// Begin a new transaction and register it in the live set.
    pub fn begin(&self, is_read_only: bool) -> Result<Transaction> {
        let id = self.next_tx_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(TxHandle::new(id, is_read_only));
        self.with_write_lock(|inner| {
            inner.live.insert(id, handle.clone());
        })?;
        self.metrics.record_begin();
        debug!(txn = id, read_only = is_read_only, "transaction begun");
        Ok(Transaction::new(handle))
    }

    /// Read `size` bytes at `addr` on behalf of `tx`.
    pub fn read(&self, tx: &mut Transaction, addr: usize, size: usize) -> bool {
        match tx.read(self, addr, size) {
            Some(_) => true,
            None => {
                if tx.is_aborted() {
                    self.metrics.record_abort();
                }
                false
            }
        }
    }

    /// Read `size` bytes at `addr` on behalf of `tx`, copying them into `dest`.
    pub fn read_into(&self, tx: &mut Transaction, addr: usize, size: usize, dest: &mut [u8]) -> bool {
        match tx.read(self, addr, size) {
            Some(bytes) => {
                dest[..size].copy_from_slice(&bytes);
                true
            }
            None => {
                if tx.is_aborted() {
                    self.metrics.record_abort();
                }
                false
            }
        }
    }

    /// Write `bytes` at `addr` on behalf of `tx`.
    pub fn write(&self, tx: &mut Transaction, addr: usize, bytes: &[u8]) -> bool {
        let ok = tx.write(addr, bytes);
        if !ok && tx.is_aborted() {
            self.metrics.record_abort();
        }
        ok
    }

    /// Reserve a fresh, aligned address and allocate a segment there for
    /// `tx`. Reserving the address needs only the atomic bump allocator,
    /// not the region lock.
    pub fn alloc(&self, tx: &mut Transaction, size: usize, align: usize) -> AllocResult {
        if align == 0 || !align.is_power_of_two() || size == 0 || size % align != 0 {
            tx.abort();
            self.metrics.record_abort();
            return AllocResult::Abort;
        }
        let addr = self.reserve_address(size, align);
        let outcome = tx.alloc(addr, size);
        if outcome == AllocResult::Abort && tx.is_aborted() {
            self.metrics.record_abort();
        }
        outcome
    }

    fn reserve_address(&self, size: usize, align: usize) -> usize {
        loop {
            let current = self.next_addr.load(Ordering::Relaxed);
            let aligned = (current + align - 1) / align * align;
            let next = aligned + size;
            if self
                .next_addr
                .compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return aligned;
            }
        }
    }

    /// Free the segment at `addr` on behalf of `tx`.
    pub fn free(&self, tx: &mut Transaction, addr: usize) -> bool {
        let ok = tx.free(self, addr);
        if !ok && tx.is_aborted() {
            self.metrics.record_abort();
        }
        ok
    }

    /// Commit `tx`, running the full fan-out/publish protocol under the
    /// region's exclusive lock.
    pub fn commit(&self, tx: &mut Transaction) -> bool {
        let result = self.with_write_lock(|inner| tx.commit(inner));
        match result {
            Ok(true) => {
                self.metrics.record_commit();
                true
            }
            _ => {
                self.metrics.record_abort();
                false
            }
        }
    }

    /// Abort `tx` and remove it from the live set.
    pub fn abort(&self, tx: &mut Transaction) {
        tx.abort();
        self.evict(tx.id());
        self.metrics.record_abort();
    }

    /// Remove a transaction id from the live set without touching the
    /// metrics counters. Used after an operation already recorded its own
    /// abort to finish tearing the transaction down: once an op flips
    /// `is_aborted`, the transaction must stop receiving peer commits.
    pub fn evict(&self, id: TxId) {
        let _ = self.with_write_lock(|inner| {
            inner.live.remove(&id);
        });
    }

    #[cfg(test)]
    pub fn for_testing(segments: Vec<Segment>) -> Self {
        let mut table = SegmentTable::new();
        for seg in segments {
            table.insert(seg);
        }
        Self {
            inner: RwLock::new(RegionInner {
                segments: table,
                live: std::collections::HashMap::new(),
            }),
            alignment: 8,
            first_segment_base: ADDRESS_SPACE_BASE,
            first_segment_size: 0,
            next_addr: AtomicUsize::new(ADDRESS_SPACE_BASE + 0x10_0000),
            next_tx_id: AtomicU64::new(1),
            metrics: RegionMetrics::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_rejects_misaligned_size() {
        assert!(Region::create(10, 8).is_err());
        assert!(Region::create(0, 8).is_err());
        assert!(Region::create(16, 3).is_err());
    }

    #[test]
    fn create_exposes_start_size_align() {
        let region = Region::create(64, 8).unwrap();
        assert_eq!(region.size(), 64);
        assert_eq!(region.align(), 8);
        assert_eq!(region.start() % region.align(), 0);
    }

    #[test]
    fn begin_registers_transaction_in_live_set() {
        let region = Region::create(64, 8).unwrap();
        let tx = region.begin(false).unwrap();
        let live_count = region.with_read_lock(|inner| inner.live.len()).unwrap();
        assert_eq!(live_count, 1);
        assert_eq!(tx.id(), 1);
    }

    #[test]
    fn write_then_commit_then_read_back_in_new_transaction() {
        let region = Region::create(64, 8).unwrap();
        let mut writer = region.begin(false).unwrap();
        assert!(region.write(&mut writer, region.start(), &[7, 7, 7, 7]));
        assert!(region.commit(&mut writer));

        let mut reader = region.begin(false).unwrap();
        let mut buf = [0u8; 4];
        assert!(region.read_into(&mut reader, region.start(), 4, &mut buf));
        assert_eq!(buf, [7, 7, 7, 7]);
    }

    #[test]
    fn alloc_then_free_then_commit_removes_segment() {
        let region = Region::create(64, 8).unwrap();
        let mut tx = region.begin(false).unwrap();
        let addr = match region.alloc(&mut tx, 16, 8) {
            AllocResult::Success(addr) => addr,
            other => panic!("expected success, got {other:?}"),
        };
        assert!(region.free(&mut tx, addr));
        assert!(region.commit(&mut tx));

        let found = region.with_read_lock(|inner| inner.segments.get(addr).is_some()).unwrap();
        assert!(!found);
    }

    #[test]
    fn writer_write_conflicts_with_concurrent_committer() {
        let region = Region::create(64, 8).unwrap();
        let mut a = region.begin(false).unwrap();
        let mut b = region.begin(false).unwrap();

        assert!(region.read(&mut a, region.start(), 4));
        assert!(region.write(&mut b, region.start(), &[1, 2, 3, 4]));
        assert!(region.commit(&mut b));

        assert!(!region.write(&mut a, region.start(), &[9, 9, 9, 9]));
    }
}
