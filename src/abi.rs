//! Safe Rust shell mirroring the operation table a C ABI would expose
//! (`region_create`/`region_destroy`/`region_start`/`region_size`/
//! `region_align`, `tx_begin`/`tx_end`/`tx_read`/`tx_write`/`tx_alloc`/
//! `tx_free`). No `extern "C"` or `#[no_mangle]` linkage: callers get an
//! opaque `TxId` instead of a raw transaction pointer, and failures come
//! back as `bool`/`AllocResult` rather than through an FFI error channel.

use crate::region::Region;
use crate::transaction::{AllocResult, Transaction, TxId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Owns a region plus the table of its currently open transactions,
/// keyed by the opaque id handed back from `tx_begin`.
pub struct RegionHandle {
    region: Arc<Region>,
    transactions: Mutex<HashMap<TxId, Transaction>>,
}

impl RegionHandle {
    /// Run `f` against the transaction `id`, then destroy it (remove it
    /// from this table and from the region's live set) if the operation
    /// left it aborted. Every ABI operation that can abort its transaction
    /// uses this so the caller's "false means destroyed" contract holds
    /// without a separate cleanup call.
    fn with_tx_auto_destroy<T>(
        &self,
        id: TxId,
        f: impl FnOnce(&mut Transaction) -> T,
    ) -> Option<T> {
        let mut table = self.transactions.lock().expect("transaction table poisoned");
        let tx = table.get_mut(&id)?;
        let result = f(tx);
        if tx.is_aborted() {
            table.remove(&id);
            self.region.evict(id);
        }
        Some(result)
    }
}

/// `region_create`: allocate a region whose first segment is `size` bytes
/// aligned to `align`. Returns `None` if `size`/`align` are invalid.
pub fn region_create(size: usize, align: usize) -> Option<RegionHandle> {
    Region::create(size, align).ok().map(|region| RegionHandle {
        region: Arc::new(region),
        transactions: Mutex::new(HashMap::new()),
    })
}

/// `region_destroy`: release the region and every transaction still open
/// on it. Dropping `handle` is sufficient; this exists for symmetry with
/// the operation table.
pub fn region_destroy(handle: RegionHandle) {
    drop(handle);
}

/// `region_start`: address of the region's first segment.
pub fn region_start(handle: &RegionHandle) -> usize {
    handle.region.start()
}

/// `region_size`: size in bytes of the region's first segment.
pub fn region_size(handle: &RegionHandle) -> usize {
    handle.region.size()
}

/// `region_align`: the region's alignment.
pub fn region_align(handle: &RegionHandle) -> usize {
    handle.region.align()
}

/// Transaction counters (began, committed, aborted). Not part of the
/// original operation table; exposed for observability.
pub fn region_metrics(handle: &RegionHandle) -> (usize, usize, usize) {
    handle.region.metrics.snapshot()
}

/// `tx_begin`: start a transaction, returning the id to pass to every
/// subsequent operation.
pub fn tx_begin(handle: &RegionHandle, is_read_only: bool) -> Option<TxId> {
    let tx = handle.region.begin(is_read_only).ok()?;
    let id = tx.id();
    handle.transactions.lock().expect("transaction table poisoned").insert(id, tx);
    Some(id)
}

/// `tx_end`: commit (`abort = false`) or abort (`abort = true`) the
/// transaction `id`, removing it from the table either way. Returns
/// whether a commit succeeded; aborting always returns `true`.
pub fn tx_end(handle: &RegionHandle, id: TxId, abort: bool) -> bool {
    let mut tx = match handle.transactions.lock().expect("transaction table poisoned").remove(&id) {
        Some(tx) => tx,
        None => {
            warn!(txn = id, "tx_end on unknown transaction id");
            return false;
        }
    };
    if abort {
        handle.region.abort(&mut tx);
        true
    } else {
        handle.region.commit(&mut tx)
    }
}

/// `tx_read`: copy `size` bytes starting at `source` into `target`.
pub fn tx_read(handle: &RegionHandle, id: TxId, source: usize, size: usize, target: &mut [u8]) -> bool {
    handle
        .with_tx_auto_destroy(id, |tx| handle.region.read_into(tx, source, size, target))
        .unwrap_or(false)
}

/// `tx_write`: stage `source`'s bytes to be written at `target` on commit.
pub fn tx_write(handle: &RegionHandle, id: TxId, source: &[u8], target: usize) -> bool {
    handle
        .with_tx_auto_destroy(id, |tx| handle.region.write(tx, target, source))
        .unwrap_or(false)
}

/// `tx_alloc`: allocate a new segment of `size` bytes aligned to `align`.
pub fn tx_alloc(handle: &RegionHandle, id: TxId, size: usize, align: usize) -> AllocResult {
    handle
        .with_tx_auto_destroy(id, |tx| handle.region.alloc(tx, size, align))
        .unwrap_or(AllocResult::Abort)
}

/// `tx_free`: mark the segment at `target` to be freed on commit.
pub fn tx_free(handle: &RegionHandle, id: TxId, target: usize) -> bool {
    handle
        .with_tx_auto_destroy(id, |tx| handle.region.free(tx, target))
        .unwrap_or(false)
}
