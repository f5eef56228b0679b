//! Per-transaction bookkeeping, commit records, and the conflict-detection
//! protocol that runs when a transaction drains its inbox.

use crate::block::{Block, BlockSet};
use crate::region::{Region, RegionInner};
use crate::segment::{Segment, SegmentTable};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

pub type TxId = u64;

/// Outcome of `Transaction::alloc`.
#[derive(Debug, PartialEq, Eq)]
pub enum AllocResult {
    Success(usize),
    NoMem,
    Abort,
}

/// A peer's committed changes, fanned out to every other live transaction
/// at commit time. Delivered once per recipient via `TxHandle::inbox`.
///
/// `written` carries the committer's *new* bytes and is consulted by
/// read-write recipients purely for its address ranges (conflict checks
/// never look at the byte payload). `ro_snapshot` carries the *pre-commit*
/// bytes of those same ranges plus the full contents of any freed
/// segments, captured before the committer mutated shared memory; it is
/// consulted only by read-only recipients, who use it to keep serving a
/// consistent snapshot after the commit lands.
#[derive(Debug)]
pub struct Commit {
    pub written: BlockSet,
    pub ro_snapshot: BlockSet,
    pub freed: HashMap<usize, Segment>,
}

/// The cross-thread-visible sliver of a transaction: the inbox peers
/// deliver commit records into, plus the read-only/read-write tag peers
/// need to decide how to use them. Everything else about a transaction
/// (caches, aborted flag, allocation bookkeeping) is touched only by the
/// thread that owns it and needs no synchronization.
pub struct TxHandle {
    pub id: TxId,
    pub is_read_only: bool,
    inbox: Mutex<VecDeque<Arc<Commit>>>,
}

impl TxHandle {
    pub fn new(id: TxId, is_read_only: bool) -> Self {
        Self {
            id,
            is_read_only,
            inbox: Mutex::new(VecDeque::new()),
        }
    }

    pub fn deliver(&self, commit: Arc<Commit>) {
        self.inbox.lock().expect("inbox mutex poisoned").push_back(commit);
    }

    fn drain(&self) -> Vec<Arc<Commit>> {
        self.inbox
            .lock()
            .expect("inbox mutex poisoned")
            .drain(..)
            .collect()
    }
}

/// A single transaction's view of the region: its snapshot or write
/// staging area, and the bookkeeping needed to detect conflicts with
/// peers as they commit.
pub struct Transaction {
    pub handle: Arc<TxHandle>,
    pub is_read_only: bool,
    read_cache: BlockSet,
    write_cache: BlockSet,
    allocated: HashMap<usize, Segment>,
    freed: HashMap<usize, Segment>,
    freed_by_others: HashMap<usize, Segment>,
    is_aborted: bool,
}

impl Transaction {
    pub fn new(handle: Arc<TxHandle>) -> Self {
        let is_read_only = handle.is_read_only;
        Self {
            handle,
            is_read_only,
            read_cache: BlockSet::new(),
            write_cache: BlockSet::new(),
            allocated: HashMap::new(),
            freed: HashMap::new(),
            freed_by_others: HashMap::new(),
            is_aborted: false,
        }
    }

    pub fn id(&self) -> TxId {
        self.handle.id
    }

    pub fn is_aborted(&self) -> bool {
        self.is_aborted
    }

    /// Process every commit delivered to this transaction's inbox since it
    /// last looked. Read-only transactions overlay their private snapshot
    /// with pre-commit bytes; read-write transactions check the delivered
    /// ranges against their own caches and abort on conflict. Returns
    /// `false` (and marks the transaction aborted) on the first conflict
    /// found.
    fn drain_inbox(&mut self) -> bool {
        if self.is_aborted {
            return false;
        }
        for commit in self.handle.drain() {
            if self.is_read_only {
                let mut overlay = commit.ro_snapshot.copy();
                for held in self.write_cache.iter() {
                    overlay.add(held.clone(), true);
                }
                self.write_cache = overlay;
                continue;
            }

            if self.read_cache.overlaps_set(&commit.written) {
                warn!(txn = self.id(), "write-read conflict detected, aborting");
                self.abort();
                return false;
            }
            for seg in commit.freed.values() {
                if self.read_cache.overlaps(seg.base, seg.size)
                    || self.write_cache.overlaps(seg.base, seg.size)
                {
                    warn!(txn = self.id(), addr = seg.base, "access to freed segment, aborting");
                    self.abort();
                    return false;
                }
            }
            for addr in commit.freed.keys() {
                if self.freed.contains_key(addr) {
                    warn!(txn = self.id(), addr = *addr, "double free detected, aborting");
                    self.abort();
                    return false;
                }
            }
            for (&addr, seg) in commit.freed.iter() {
                self.freed_by_others.insert(addr, seg.clone());
            }
        }
        true
    }

    /// Fast path for read-only transactions: if the private snapshot cache
    /// already fully covers `[addr, addr+size)`, return the bytes without
    /// touching the region lock or the inbox.
    fn fast_path_read(&self, addr: usize, size: usize) -> Option<Vec<u8>> {
        if !self.is_read_only {
            return None;
        }
        self.write_cache
            .contains(addr, size)
            .map(|block| match &block.data {
                crate::block::BlockData::Owned(bytes) => {
                    let off = addr - block.begin;
                    bytes[off..off + size].to_vec()
                }
                _ => unreachable!("snapshot cache entries always own their bytes"),
            })
    }

    /// Read `size` bytes starting at `addr`. Read-only transactions that
    /// already hold the bytes in their private snapshot never touch the
    /// region lock; everyone else acquires it only for the duration of
    /// this call.
    pub fn read(&mut self, region: &Region, addr: usize, size: usize) -> Option<Vec<u8>> {
        if self.is_aborted {
            return None;
        }
        if let Some(bytes) = self.fast_path_read(addr, size) {
            return Some(bytes);
        }
        match region.with_read_lock(|inner| self.read_locked(&inner.segments, addr, size)) {
            Ok(result) => result,
            Err(_) => {
                self.abort();
                None
            }
        }
    }

    fn read_locked(&mut self, segments: &SegmentTable, addr: usize, size: usize) -> Option<Vec<u8>> {
        if !self.drain_inbox() {
            return None;
        }

        if !self.is_read_only {
            if self.freed_by_others.values().any(|s| s.contains_range(addr, size)) {
                self.abort();
                return None;
            }
            if let Some(seg) = self.allocated.values().find(|s| s.contains_range(addr, size)) {
                return seg.read(addr, size).ok().map(<[u8]>::to_vec);
            }
        } else {
            let seg = segments.find(addr)?;
            if self.write_cache.contains(seg.base, seg.size).is_none() {
                let bytes = segments.read_bytes(seg.base, seg.size).ok()?;
                self.write_cache.add(Block::owned(seg.base, bytes), true);
            }
        }

        let pieces = self.write_cache.intersect(addr, size);
        let mut out = Vec::with_capacity(size);
        for block in pieces.iter() {
            match &block.data {
                crate::block::BlockData::Owned(bytes) => out.extend_from_slice(bytes),
                crate::block::BlockData::PassThrough => {
                    let bytes = segments.read_bytes(block.begin, block.size).ok()?;
                    out.extend_from_slice(&bytes);
                }
                crate::block::BlockData::None => unreachable!(),
            }
        }

        if !self.is_read_only {
            self.read_cache.add(Block::range(addr, size), false);
        }
        trace!(txn = self.id(), addr, size, "read completed");
        Some(out)
    }

    /// Stage `bytes` at `addr`. Never touches shared memory directly
    /// (writes are applied only at commit); needs no region lock.
    pub fn write(&mut self, addr: usize, bytes: &[u8]) -> bool {
        if self.is_aborted {
            return false;
        }
        if self.is_read_only {
            self.abort();
            return false;
        }
        if !self.drain_inbox() {
            return false;
        }
        if self.freed_by_others.values().any(|s| s.contains_range(addr, bytes.len())) {
            self.abort();
            return false;
        }
        if let Some(seg) = self.allocated.values_mut().find(|s| s.contains_range(addr, bytes.len())) {
            return seg.write(addr, bytes).is_ok();
        }
        self.write_cache.add(Block::owned(addr, bytes.to_vec()), true);
        true
    }

    /// Allocate a fresh segment of `size` bytes at the address the caller
    /// reserved (`addr` is handed out by the region's bump allocator before
    /// this call, so allocation needs no region lock).
    pub fn alloc(&mut self, addr: usize, size: usize) -> AllocResult {
        if self.is_aborted {
            return AllocResult::Abort;
        }
        if self.is_read_only {
            self.abort();
            return AllocResult::Abort;
        }
        if !self.drain_inbox() {
            return AllocResult::Abort;
        }
        self.allocated.insert(addr, Segment::new(addr, size));
        AllocResult::Success(addr)
    }

    /// Mark the segment at `addr` for freeing at commit time. Resolving an
    /// address that isn't one of this transaction's own pending
    /// allocations needs a shared (read) lookup in the region's registry.
    pub fn free(&mut self, region: &Region, addr: usize) -> bool {
        if self.is_aborted {
            return false;
        }
        if self.is_read_only {
            self.abort();
            return false;
        }
        if !self.drain_inbox() {
            return false;
        }
        if self.freed_by_others.contains_key(&addr) || self.freed.contains_key(&addr) {
            self.abort();
            return false;
        }
        if let Some(seg) = self.allocated.remove(&addr) {
            self.freed.insert(addr, seg);
            return true;
        }
        match region.with_read_lock(|inner| inner.segments.get(addr).cloned()) {
            Ok(Some(seg)) => {
                self.freed.insert(addr, seg);
                true
            }
            _ => {
                self.abort();
                false
            }
        }
    }

    /// Commit this transaction. `inner` must be held under the region's
    /// exclusive (write) lock for the whole call. Ordering matches the
    /// protocol exactly: remove self from the live set, fan out commit
    /// records to remaining peers, publish new segments, apply staged
    /// writes, then publish frees.
    pub fn commit(&mut self, inner: &mut RegionInner) -> bool {
        // Removal from the live set happens first, before anything that
        // can fail, so a conflicting drain never leaves this transaction
        // registered to receive commits it will never look at again.
        inner.live.remove(&self.id());

        if self.is_aborted {
            return false;
        }
        if !self.drain_inbox() {
            return false;
        }

        if self.is_read_only {
            debug!(txn = self.id(), "read-only transaction committed");
            return true;
        }

        let ro_snapshot = self.build_pre_commit_snapshot(&inner.segments);
        let record = Arc::new(Commit {
            written: self.write_cache.copy(),
            ro_snapshot,
            freed: self.freed.clone(),
        });
        for peer in inner.live.values() {
            peer.deliver(record.clone());
        }

        let writes = self.write_cache.len();
        let frees = self.freed.len();

        for (_, seg) in self.allocated.drain() {
            inner.segments.insert(seg);
        }
        for block in self.write_cache.iter() {
            if let crate::block::BlockData::Owned(bytes) = &block.data {
                let _ = inner.segments.write_bytes(block.begin, bytes);
            }
        }
        for (addr, _) in self.freed.drain() {
            inner.segments.remove(addr);
        }

        debug!(txn = self.id(), writes, frees, "transaction committed");
        true
    }

    /// Snapshot the pre-commit bytes that read-only peers will need: the
    /// ranges this transaction is about to overwrite, and the full
    /// contents of any segment it is about to free.
    fn build_pre_commit_snapshot(&self, segments: &SegmentTable) -> BlockSet {
        let mut snapshot = BlockSet::new();
        for block in self.write_cache.iter() {
            if let Ok(bytes) = segments.read_bytes(block.begin, block.size) {
                snapshot.add(Block::owned(block.begin, bytes), true);
            }
        }
        for seg in self.freed.values() {
            if let Ok(bytes) = segments.read_bytes(seg.base, seg.size) {
                snapshot.add(Block::owned(seg.base, bytes), true);
            }
        }
        snapshot
    }

    /// Abandon this transaction: release every local resource without
    /// notifying peers. Safe to call more than once.
    pub fn abort(&mut self) {
        self.is_aborted = true;
        self.read_cache.free();
        self.write_cache.free();
        self.allocated.clear();
        self.freed.clear();
        self.freed_by_others.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Region;
    use crate::segment::Segment;

    fn rw_tx(id: TxId) -> Transaction {
        Transaction::new(Arc::new(TxHandle::new(id, false)))
    }

    fn ro_tx(id: TxId) -> Transaction {
        Transaction::new(Arc::new(TxHandle::new(id, true)))
    }

    #[test]
    fn write_then_read_own_write() {
        let mut tx = rw_tx(1);
        let region = Region::for_testing(vec![Segment::new(0x1000, 16)]);

        assert!(tx.write(0x1000, &[1, 2, 3, 4]));
        let read = tx.read(&region, 0x1000, 4).unwrap();
        assert_eq!(read, vec![1, 2, 3, 4]);
    }

    #[test]
    fn alloc_then_write_then_read() {
        let mut tx = rw_tx(1);
        let region = Region::for_testing(vec![]);

        assert_eq!(tx.alloc(0x5000, 8), AllocResult::Success(0x5000));
        assert!(tx.write(0x5000, &[9, 9]));
        assert_eq!(tx.read(&region, 0x5000, 2).unwrap(), vec![9, 9]);
    }

    #[test]
    fn peer_write_conflict_aborts_reader() {
        let mut victim = rw_tx(1);
        let region = Region::for_testing(vec![Segment::new(0x1000, 16)]);
        victim.read(&region, 0x1000, 4);

        let mut committer_written = BlockSet::new();
        committer_written.add(Block::owned(0x1000, vec![0xff; 4]), true);
        let commit = Arc::new(Commit {
            written: committer_written,
            ro_snapshot: BlockSet::new(),
            freed: HashMap::new(),
        });
        victim.handle.deliver(commit);

        assert!(!victim.write(0x1000, &[1]));
        assert!(victim.is_aborted());
    }

    #[test]
    fn read_only_snapshot_overlay_preserves_first_observed_bytes() {
        let mut ro = ro_tx(2);
        let region = Region::for_testing(vec![Segment::new(0x1000, 8)]);
        region
            .with_write_lock(|inner| inner.segments.write_bytes(0x1000, &[1; 8]))
            .unwrap()
            .unwrap();

        assert_eq!(ro.read(&region, 0x1000, 8).unwrap(), vec![1; 8]);

        let mut ro_snapshot = BlockSet::new();
        ro_snapshot.add(Block::owned(0x1000, vec![2; 8]), true);
        ro.handle.deliver(Arc::new(Commit {
            written: BlockSet::new(),
            ro_snapshot,
            freed: HashMap::new(),
        }));

        assert_eq!(ro.read(&region, 0x1000, 8).unwrap(), vec![1; 8]);
    }

    #[test]
    fn double_free_aborts() {
        let mut tx = rw_tx(1);
        let region = Region::for_testing(vec![]);
        tx.alloc(0x9000, 4);

        let mut freed = HashMap::new();
        freed.insert(0x9000, Segment::new(0x9000, 4));
        tx.handle.deliver(Arc::new(Commit {
            written: BlockSet::new(),
            ro_snapshot: BlockSet::new(),
            freed,
        }));

        assert!(!tx.free(&region, 0x9000));
        assert!(tx.is_aborted());
    }
}
