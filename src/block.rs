//! Disjoint, address-ordered spans of shared-memory bytes.
//!
//! `Block` and `BlockSet` are the conflict-detection substrate shared by
//! every other module: read/write caches, peer commit records, and the
//! read-assembly path all reduce to operations on a `BlockSet`.

use crate::segment::SegmentTable;
use std::collections::BTreeMap;

/// Payload carried by a [`Block`].
///
/// `None` is used for range-only bookkeeping (the read cache only needs to
/// remember *that* an address range was read, never the bytes). `Owned`
/// blocks hold a private, heap-allocated copy of the bytes they cover.
/// `PassThrough` never appears in a canonical `BlockSet` — it is produced
/// only by [`BlockSet::intersect`] to mark a gap the caller must read
/// directly from shared memory.
#[derive(Clone, Debug)]
pub enum BlockData {
    None,
    Owned(Vec<u8>),
    PassThrough,
}

impl BlockData {
    fn as_owned(&self) -> Option<&[u8]> {
        match self {
            BlockData::Owned(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// A contiguous byte span, optionally carrying its own data.
#[derive(Clone, Debug)]
pub struct Block {
    pub begin: usize,
    pub size: usize,
    pub data: BlockData,
}

impl Block {
    /// A range-only block: no bytes, just an address span (used for
    /// read-cache entries, where only the range matters for conflicts).
    pub fn range(begin: usize, size: usize) -> Self {
        Self {
            begin,
            size,
            data: BlockData::None,
        }
    }

    /// A block that owns a private copy of `bytes`.
    pub fn owned(begin: usize, bytes: Vec<u8>) -> Self {
        let size = bytes.len();
        Self {
            begin,
            size,
            data: BlockData::Owned(bytes),
        }
    }

    pub fn end(&self) -> usize {
        self.begin + self.size
    }

    pub fn overlaps_range(&self, begin: usize, size: usize) -> bool {
        self.begin < begin + size && begin < self.end()
    }

    /// Whether `[begin, begin+size)` is fully covered by this block alone.
    pub fn fully_covers(&self, begin: usize, size: usize) -> bool {
        self.begin <= begin && begin + size <= self.end()
    }
}

/// A disjoint, address-ordered collection of [`Block`]s.
///
/// Canonical form: entries keyed by `begin`, no two entries overlap. Two
/// entries that merely touch (`prev.end() == next.begin`) may legally
/// remain as separate adjacent entries; `add` happens to fold them into one
/// whenever it touches either side, but nothing relies on that.
#[derive(Clone, Debug, Default)]
pub struct BlockSet {
    blocks: BTreeMap<usize, Block>,
}

impl BlockSet {
    pub fn new() -> Self {
        Self {
            blocks: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Entries in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    /// Union this set with `block`.
    ///
    /// Any existing entry whose closed range touches or overlaps `block`'s
    /// range is folded into the result. When `copy` is true the merged
    /// block owns a freshly allocated buffer holding the old entries'
    /// bytes overlaid by `block`'s bytes. When `copy` is false, `block`'s
    /// own buffer is adopted directly without re-allocating — legal only
    /// when `block` alone, once merged, accounts for every byte of the
    /// combined range (no stitching from other entries is required); see
    /// `DESIGN.md` for the open question this resolves.
    pub fn add(&mut self, block: Block, copy: bool) {
        let mut lo = block.begin;
        let mut hi = block.end();

        // Collect every entry whose closed range touches [lo, hi].
        let mut removed = Vec::new();
        let touching_keys: Vec<usize> = self
            .blocks
            .iter()
            .filter(|(_, b)| b.begin <= hi && lo <= b.end())
            .map(|(&k, _)| k)
            .collect();
        for key in touching_keys {
            let b = self.blocks.remove(&key).unwrap();
            lo = lo.min(b.begin);
            hi = hi.max(b.end());
            removed.push(b);
        }

        let has_data = matches!(block.data, BlockData::Owned(_))
            || removed.iter().any(|b| matches!(b.data, BlockData::Owned(_)));

        let merged_data = if !has_data {
            BlockData::None
        } else if !copy && removed.is_empty() && block.begin == lo && block.end() == hi {
            // Pure move: block alone covers the merged range.
            block.data.clone()
        } else {
            let mut buf = vec![0u8; hi - lo];
            for old in &removed {
                if let Some(bytes) = old.data.as_owned() {
                    let off = old.begin - lo;
                    buf[off..off + old.size].copy_from_slice(bytes);
                }
            }
            if let Some(bytes) = block.data.as_owned() {
                let off = block.begin - lo;
                buf[off..off + block.size].copy_from_slice(bytes);
            }
            BlockData::Owned(buf)
        };

        self.blocks.insert(
            lo,
            Block {
                begin: lo,
                size: hi - lo,
                data: merged_data,
            },
        );
    }

    /// A `BlockSet` whose union is exactly `[begin, begin+size)`: entries
    /// of this set clipped to the request range, with any uncovered gap
    /// filled by `PassThrough` markers.
    pub fn intersect(&self, begin: usize, size: usize) -> BlockSet {
        let end = begin + size;
        let mut result = BlockSet::new();
        let mut cursor = begin;

        for b in self.blocks.values() {
            if !b.overlaps_range(begin, size) {
                continue;
            }
            let clip_begin = b.begin.max(begin);
            let clip_end = b.end().min(end);
            if clip_begin > cursor {
                result.blocks.insert(
                    cursor,
                    Block {
                        begin: cursor,
                        size: clip_begin - cursor,
                        data: BlockData::PassThrough,
                    },
                );
            }
            let clipped_data = match &b.data {
                BlockData::Owned(bytes) => {
                    let off = clip_begin - b.begin;
                    BlockData::Owned(bytes[off..off + (clip_end - clip_begin)].to_vec())
                }
                BlockData::PassThrough => BlockData::PassThrough,
                BlockData::None => BlockData::None,
            };
            result.blocks.insert(
                clip_begin,
                Block {
                    begin: clip_begin,
                    size: clip_end - clip_begin,
                    data: clipped_data,
                },
            );
            cursor = clip_end;
        }

        if cursor < end {
            result.blocks.insert(
                cursor,
                Block {
                    begin: cursor,
                    size: end - cursor,
                    data: BlockData::PassThrough,
                },
            );
        }

        result
    }

    /// Any byte in common with `[begin, begin+size)`.
    pub fn overlaps(&self, begin: usize, size: usize) -> bool {
        self.blocks.values().any(|b| b.overlaps_range(begin, size))
    }

    /// Any byte in common with any entry of `other`.
    pub fn overlaps_set(&self, other: &BlockSet) -> bool {
        other
            .blocks
            .values()
            .any(|b| self.overlaps(b.begin, b.size))
    }

    /// True iff some entry's `begin` falls inside a segment's `[base,
    /// base+size)` in `segments`. Mirrors the original implementation's
    /// `containedInAny`, which checks only the entry's start address.
    pub fn overlaps_any_segment(&self, segments: &SegmentTable) -> bool {
        self.blocks
            .values()
            .any(|b| segments.find(b.begin).is_some())
    }

    /// The unique existing entry that fully encloses `[begin, begin+size)`,
    /// if any.
    pub fn contains(&self, begin: usize, size: usize) -> Option<&Block> {
        self.blocks
            .range(..=begin)
            .next_back()
            .map(|(_, b)| b)
            .filter(|b| b.fully_covers(begin, size))
    }

    /// Deep copy: every owned buffer is cloned.
    pub fn copy(&self) -> BlockSet {
        self.clone()
    }

    /// Release every owned buffer. Dropping the set already does this in
    /// Rust; the method exists for parity with the spec's block lifecycle
    /// vocabulary and to make release points explicit at call sites.
    pub fn free(&mut self) {
        self.blocks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_merges_overlapping_entries() {
        let mut set = BlockSet::new();
        set.add(Block::owned(0, vec![1, 2, 3, 4]), true);
        set.add(Block::owned(2, vec![9, 9]), true);

        assert_eq!(set.len(), 1);
        let merged = set.iter().next().unwrap();
        assert_eq!(merged.begin, 0);
        assert_eq!(merged.size, 4);
        assert_eq!(merged.data.as_owned().unwrap(), &[1, 2, 9, 9]);
    }

    #[test]
    fn add_merges_touching_entries() {
        let mut set = BlockSet::new();
        set.add(Block::owned(0, vec![1, 2]), true);
        set.add(Block::owned(2, vec![3, 4]), true);

        assert_eq!(set.len(), 1);
        let merged = set.iter().next().unwrap();
        assert_eq!(merged.begin, 0);
        assert_eq!(merged.size, 4);
        assert_eq!(merged.data.as_owned().unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn add_is_idempotent() {
        let mut set = BlockSet::new();
        set.add(Block::owned(10, vec![5, 6, 7]), true);
        let before = set.clone();
        set.add(Block::owned(10, vec![5, 6, 7]), true);

        assert_eq!(set.len(), before.len());
        assert_eq!(
            set.iter().next().unwrap().data.as_owned(),
            before.iter().next().unwrap().data.as_owned()
        );
    }

    #[test]
    fn intersect_covers_full_request_with_pass_through_gaps() {
        let mut set = BlockSet::new();
        set.add(Block::owned(4, vec![1, 2]), true);

        let result = set.intersect(0, 10);
        let union_size: usize = result.iter().map(|b| b.size).sum();
        assert_eq!(union_size, 10);

        let mut cursor = 0;
        for b in result.iter() {
            assert_eq!(b.begin, cursor);
            cursor += b.size;
        }
        assert_eq!(cursor, 10);
    }

    #[test]
    fn intersect_on_empty_set_is_all_pass_through() {
        let set = BlockSet::new();
        let result = set.intersect(100, 8);
        assert_eq!(result.len(), 1);
        let b = result.iter().next().unwrap();
        assert!(matches!(b.data, BlockData::PassThrough));
        assert_eq!(b.begin, 100);
        assert_eq!(b.size, 8);
    }

    #[test]
    fn empty_set_has_no_overlaps_or_containment() {
        let set = BlockSet::new();
        assert!(!set.overlaps(0, 8));
        assert!(set.contains(0, 8).is_none());
    }

    #[test]
    fn contains_finds_enclosing_block() {
        let mut set = BlockSet::new();
        set.add(Block::owned(0, vec![0; 16]), true);

        assert!(set.contains(4, 8).is_some());
        assert!(set.contains(12, 8).is_none());
    }

    #[test]
    fn range_only_blocks_carry_no_data() {
        let mut set = BlockSet::new();
        set.add(Block::range(0, 8), false);
        set.add(Block::range(8, 8), false);

        assert_eq!(set.len(), 1);
        assert!(matches!(set.iter().next().unwrap().data, BlockData::None));
    }

    proptest::proptest! {
        #[test]
        fn add_always_leaves_a_disjoint_set(
            writes in proptest::collection::vec((0usize..64, 1usize..8), 1..20)
        ) {
            let mut set = BlockSet::new();
            for (begin, size) in writes {
                set.add(Block::owned(begin, vec![1u8; size]), true);
            }

            let mut prev_end = None;
            for b in set.iter() {
                if let Some(end) = prev_end {
                    proptest::prop_assert!(b.begin > end, "entries must not overlap or touch");
                }
                prev_end = Some(b.end());
            }
        }

        #[test]
        fn intersect_result_always_unions_to_the_request_range(
            writes in proptest::collection::vec((0usize..64, 1usize..8), 0..20),
            query in (0usize..64, 1usize..8),
        ) {
            let mut set = BlockSet::new();
            for (begin, size) in writes {
                set.add(Block::owned(begin, vec![1u8; size]), true);
            }
            let (qbegin, qsize) = query;
            let result = set.intersect(qbegin, qsize);

            let mut cursor = qbegin;
            for b in result.iter() {
                proptest::prop_assert_eq!(b.begin, cursor);
                cursor += b.size;
            }
            proptest::prop_assert_eq!(cursor, qbegin + qsize);
        }
    }
}
