//! Typed node views over a buffer's bytes.
//!
//! Every node page starts with a one-byte level (0 = leaf, 1..0xFE =
//! branch height, 0xFF = free-list entry), three reserved bytes, and a
//! four-byte element count. Records follow from byte 8.
//!
//! Leaf records are `key ++ mapped` at a fixed stride. Branch records
//! are `child_id ++ key` at stride `4 + key_size`, with one trailing
//! child id (the end pseudo-element) at the record position past the
//! last key, so a branch with n keys carries n + 1 child pointers:
//!
//! ```text
//! P0 K0 P1 K1 ... Pn-1 Kn-1 Pn
//! ```
//!
//! Keys in the sub-tree under `Pi` are bounded above by `Ki` (strictly
//! for unique containers). Node ids and the count are stored in the
//! file's endianness; keys and mapped values are raw host bytes.

use std::marker::PhantomData;

use crate::buffer::BufferHandle;
use crate::types::{Endianness, PageId, Storable};

/// Bytes before the first record of a node page
pub(crate) const NODE_HEADER_SIZE: usize = 8;

/// Level byte marking a free-list entry
pub(crate) const FREE_NODE_LEVEL: u8 = 0xFF;

const LEVEL_OFFSET: usize = 0;
const SIZE_OFFSET: usize = 4;

/// A buffer handle interpreted as a tree node
pub(crate) struct NodeView<K, V> {
    handle: BufferHandle,
    endian: Endianness,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for NodeView<K, V> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            endian: self.endian,
            _marker: PhantomData,
        }
    }
}

impl<K: Storable + Ord, V: Storable> NodeView<K, V> {
    /// Bytes per leaf record
    pub(crate) const VALUE_SIZE: usize = K::DISK_SIZE + V::DISK_SIZE;
    /// Bytes per branch record (child id plus key)
    pub(crate) const BRANCH_RECORD_SIZE: usize = 4 + K::DISK_SIZE;

    pub(crate) fn new(handle: BufferHandle, endian: Endianness) -> Self {
        Self {
            handle,
            endian,
            _marker: PhantomData,
        }
    }

    pub(crate) fn handle(&self) -> &BufferHandle {
        &self.handle
    }

    pub(crate) fn id(&self) -> PageId {
        self.handle.page_id()
    }

    pub(crate) fn mark_dirty(&self) {
        self.handle.mark_dirty();
    }

    pub(crate) fn level(&self) -> u8 {
        self.handle.bytes()[LEVEL_OFFSET]
    }

    pub(crate) fn set_level(&self, level: u8) {
        self.handle.bytes_mut()[LEVEL_OFFSET] = level;
        self.handle.mark_dirty();
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.level() == 0
    }

    pub(crate) fn is_branch(&self) -> bool {
        let lv = self.level();
        lv > 0 && lv != FREE_NODE_LEVEL
    }

    /// Element count: records on a leaf, keys on a branch (the end
    /// pseudo-element is not counted)
    pub(crate) fn size(&self) -> usize {
        self.endian.read_u32(&self.handle.bytes()[SIZE_OFFSET..]) as usize
    }

    pub(crate) fn set_size(&self, size: usize) {
        self.endian
            .write_u32(&mut self.handle.bytes_mut()[SIZE_OFFSET..], size as u32);
        self.handle.mark_dirty();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.size() == 0
    }

    //  leaf accessors  ------------------------------------------------//

    fn leaf_offset(slot: usize) -> usize {
        NODE_HEADER_SIZE + slot * Self::VALUE_SIZE
    }

    pub(crate) fn leaf_key(&self, slot: usize) -> K {
        debug_assert!(slot < self.size());
        let bytes = self.handle.bytes();
        let off = Self::leaf_offset(slot);
        K::load(&bytes[off..off + K::DISK_SIZE])
    }

    pub(crate) fn leaf_mapped(&self, slot: usize) -> V {
        debug_assert!(slot < self.size());
        let bytes = self.handle.bytes();
        let off = Self::leaf_offset(slot) + K::DISK_SIZE;
        V::load(&bytes[off..off + V::DISK_SIZE])
    }

    pub(crate) fn leaf_record(&self, slot: usize) -> (K, V) {
        (self.leaf_key(slot), self.leaf_mapped(slot))
    }

    /// Overwrite the mapped portion of an existing record
    pub(crate) fn leaf_set_mapped(&self, slot: usize, mapped: &V) {
        debug_assert!(slot < self.size());
        let mut bytes = self.handle.bytes_mut();
        let off = Self::leaf_offset(slot) + K::DISK_SIZE;
        mapped.store(&mut bytes[off..off + V::DISK_SIZE]);
        self.handle.mark_dirty();
    }

    /// Slot of the first record whose key is not less than `k`
    pub(crate) fn leaf_lower_bound<Q>(&self, k: &Q) -> usize
    where
        K: std::borrow::Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.leaf_partition(|key| key.borrow() < k)
    }

    /// Slot of the first record whose key is greater than `k`
    pub(crate) fn leaf_upper_bound<Q>(&self, k: &Q) -> usize
    where
        K: std::borrow::Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.leaf_partition(|key| key.borrow() <= k)
    }

    fn leaf_partition(&self, pred: impl Fn(&K) -> bool) -> usize {
        let mut lo = 0;
        let mut hi = self.size();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if pred(&self.leaf_key(mid)) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Shift the tail right and write a record at `slot`
    pub(crate) fn leaf_insert(&self, slot: usize, key: &K, mapped: &V) {
        let n = self.size();
        debug_assert!(slot <= n);
        {
            let mut bytes = self.handle.bytes_mut();
            let src = Self::leaf_offset(slot);
            let end = Self::leaf_offset(n);
            bytes.copy_within(src..end, src + Self::VALUE_SIZE);
            key.store(&mut bytes[src..src + K::DISK_SIZE]);
            mapped.store(&mut bytes[src + K::DISK_SIZE..src + Self::VALUE_SIZE]);
        }
        self.set_size(n + 1);
    }

    /// Shift the tail left over `slot` and zero the vacated record
    pub(crate) fn leaf_remove(&self, slot: usize) {
        let n = self.size();
        debug_assert!(slot < n);
        {
            let mut bytes = self.handle.bytes_mut();
            let dst = Self::leaf_offset(slot);
            let end = Self::leaf_offset(n);
            bytes.copy_within(dst + Self::VALUE_SIZE..end, dst);
            bytes[end - Self::VALUE_SIZE..end].fill(0);
        }
        self.set_size(n - 1);
    }

    /// Move the trailing `count` records of this leaf onto the front of
    /// (empty) `other`, zeroing the vacated region
    pub(crate) fn leaf_split_into(&self, other: &NodeView<K, V>, count: usize) {
        let n = self.size();
        debug_assert!(count > 0 && count < n);
        debug_assert_eq!(other.size(), 0);
        let split = n - count;
        {
            let src_bytes = self.handle.bytes();
            let mut dst_bytes = other.handle.bytes_mut();
            let from = Self::leaf_offset(split);
            let to = Self::leaf_offset(n);
            dst_bytes[NODE_HEADER_SIZE..NODE_HEADER_SIZE + (to - from)]
                .copy_from_slice(&src_bytes[from..to]);
        }
        {
            let mut bytes = self.handle.bytes_mut();
            let from = Self::leaf_offset(split);
            let to = Self::leaf_offset(n);
            bytes[from..to].fill(0);
        }
        other.set_size(count);
        self.set_size(split);
    }

    //  branch accessors  ----------------------------------------------//

    fn branch_offset(slot: usize) -> usize {
        NODE_HEADER_SIZE + slot * Self::BRANCH_RECORD_SIZE
    }

    /// Child id at `slot`; `slot == size()` addresses the end
    /// pseudo-element
    pub(crate) fn branch_child(&self, slot: usize) -> PageId {
        debug_assert!(slot <= self.size());
        let bytes = self.handle.bytes();
        PageId::new(self.endian.read_u32(&bytes[Self::branch_offset(slot)..]))
    }

    pub(crate) fn set_branch_child(&self, slot: usize, id: PageId) {
        let mut bytes = self.handle.bytes_mut();
        self.endian
            .write_u32(&mut bytes[Self::branch_offset(slot)..], id.value());
        self.handle.mark_dirty();
    }

    pub(crate) fn branch_key(&self, slot: usize) -> K {
        debug_assert!(slot < self.size());
        let bytes = self.handle.bytes();
        let off = Self::branch_offset(slot) + 4;
        K::load(&bytes[off..off + K::DISK_SIZE])
    }

    /// Slot of the first separator key not less than `k`
    pub(crate) fn branch_lower_bound<Q>(&self, k: &Q) -> usize
    where
        K: std::borrow::Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.branch_partition(|key| key.borrow() < k)
    }

    /// Slot of the first separator key greater than `k`
    pub(crate) fn branch_upper_bound<Q>(&self, k: &Q) -> usize
    where
        K: std::borrow::Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.branch_partition(|key| key.borrow() <= k)
    }

    fn branch_partition(&self, pred: impl Fn(&K) -> bool) -> usize {
        let mut lo = 0;
        let mut hi = self.size();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if pred(&self.branch_key(mid)) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Insert separator `key` with `child` to its right, at `slot`.
    ///
    /// The child previously at `slot` keeps its position to the left of
    /// the new key; everything from the key at `slot` through the end
    /// pseudo-element shifts one record right.
    pub(crate) fn branch_insert(&self, slot: usize, key: &K, child: PageId) {
        let n = self.size();
        debug_assert!(slot <= n);
        {
            let mut bytes = self.handle.bytes_mut();
            let key_off = Self::branch_offset(slot) + 4;
            let len = (n - slot) * Self::BRANCH_RECORD_SIZE;
            bytes.copy_within(key_off..key_off + len, key_off + Self::BRANCH_RECORD_SIZE);
            key.store(&mut bytes[key_off..key_off + K::DISK_SIZE]);
            let child_off = Self::branch_offset(slot + 1);
            self.endian
                .write_u32(&mut bytes[child_off..], child.value());
        }
        self.set_size(n + 1);
    }

    /// Remove the child at `slot` together with its nearest separator:
    /// the key to its left, or for slot 0 the key to its right. The end
    /// pseudo-element may be named (`slot == size()`), in which case the
    /// previous child becomes the new pseudo-element.
    pub(crate) fn branch_remove_child(&self, slot: usize) {
        let n = self.size();
        debug_assert!(n > 0);
        debug_assert!(slot <= n);
        {
            let mut bytes = self.handle.bytes_mut();
            if slot > 0 {
                let dst = Self::branch_offset(slot - 1) + 4;
                let len = (n - slot) * Self::BRANCH_RECORD_SIZE;
                bytes.copy_within(dst + Self::BRANCH_RECORD_SIZE..dst + Self::BRANCH_RECORD_SIZE + len, dst);
            } else {
                let dst = Self::branch_offset(0);
                let len = (n - 1) * Self::BRANCH_RECORD_SIZE + 4;
                bytes.copy_within(dst + Self::BRANCH_RECORD_SIZE..dst + Self::BRANCH_RECORD_SIZE + len, dst);
            }
            let tail = Self::branch_offset(n - 1) + 4;
            bytes[tail..tail + Self::BRANCH_RECORD_SIZE].fill(0);
        }
        self.set_size(n - 1);
    }

    /// Split a full branch: keep the leading `keep - 1` keys (the key at
    /// `keep - 1` becomes the promoted median, left behind as this
    /// node's end pseudo-element), move the trailing records and the old
    /// pseudo-element onto empty `other`. Returns the median key.
    pub(crate) fn branch_split_into(&self, other: &NodeView<K, V>, keep: usize) -> K {
        let n = self.size();
        debug_assert!(keep >= 1 && keep < n);
        debug_assert_eq!(other.size(), 0);
        let median = self.branch_key(keep - 1);
        {
            let src_bytes = self.handle.bytes();
            let mut dst_bytes = other.handle.bytes_mut();
            let from = Self::branch_offset(keep);
            let to = Self::branch_offset(n) + 4; // include the pseudo-element id
            dst_bytes[NODE_HEADER_SIZE..NODE_HEADER_SIZE + (to - from)]
                .copy_from_slice(&src_bytes[from..to]);
        }
        {
            let mut bytes = self.handle.bytes_mut();
            let from = Self::branch_offset(keep - 1) + 4; // the median key slot
            let to = Self::branch_offset(n) + 4;
            bytes[from..to].fill(0);
        }
        other.set_size(n - keep);
        self.set_size(keep - 1);
        median
    }

    //  free-list entries  ---------------------------------------------//

    /// Turn this node into a free-list entry chaining to `next`
    pub(crate) fn set_free(&self, next: PageId) {
        self.set_level(FREE_NODE_LEVEL);
        self.set_size(0);
        self.set_branch_child(0, next);
        self.handle.set_never_free(false);
    }

    /// Next free page of a free-list entry
    pub(crate) fn next_free(&self) -> PageId {
        debug_assert_eq!(self.level(), FREE_NODE_LEVEL);
        self.branch_child(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferManager;
    use crate::error::Result;
    use crate::storage::oflag;
    use tempfile::tempdir;

    type IntNode = NodeView<i32, i64>;

    fn fresh_node(mgr: &BufferManager) -> Result<IntNode> {
        Ok(NodeView::new(mgr.new_buffer()?, Endianness::native()))
    }

    fn mgr() -> (tempfile::TempDir, BufferManager) {
        let dir = tempdir().unwrap();
        let (m, _) = BufferManager::open(
            &dir.path().join("n.bt"),
            oflag::IN | oflag::OUT,
            16,
            256,
        )
        .unwrap();
        (dir, m)
    }

    #[test]
    fn test_leaf_insert_ordered() -> Result<()> {
        let (_d, m) = mgr();
        let leaf = fresh_node(&m)?;
        leaf.set_level(0);
        leaf.set_size(0);

        for (i, k) in [10, 30, 50].iter().enumerate() {
            leaf.leaf_insert(i, k, &(*k as i64 * 10));
        }
        leaf.leaf_insert(1, &20, &200); // middle insert shifts the tail

        assert_eq!(leaf.size(), 4);
        let keys: Vec<i32> = (0..4).map(|i| leaf.leaf_key(i)).collect();
        assert_eq!(keys, vec![10, 20, 30, 50]);
        assert_eq!(leaf.leaf_mapped(1), 200);
        assert_eq!(leaf.leaf_mapped(3), 500);
        Ok(())
    }

    #[test]
    fn test_leaf_remove_and_bounds() -> Result<()> {
        let (_d, m) = mgr();
        let leaf = fresh_node(&m)?;
        leaf.set_level(0);

        for (i, k) in [1, 3, 3, 7].iter().enumerate() {
            leaf.leaf_insert(i, k, &0);
        }
        assert_eq!(leaf.leaf_lower_bound(&3), 1);
        assert_eq!(leaf.leaf_upper_bound(&3), 3);
        assert_eq!(leaf.leaf_lower_bound(&8), 4);

        leaf.leaf_remove(1);
        let keys: Vec<i32> = (0..leaf.size()).map(|i| leaf.leaf_key(i)).collect();
        assert_eq!(keys, vec![1, 3, 7]);
        Ok(())
    }

    #[test]
    fn test_leaf_split() -> Result<()> {
        let (_d, m) = mgr();
        let a = fresh_node(&m)?;
        let b = fresh_node(&m)?;
        a.set_level(0);
        b.set_level(0);

        for i in 0..5 {
            a.leaf_insert(i as usize, &(i * 2), &(i as i64));
        }
        a.leaf_split_into(&b, 2);

        assert_eq!(a.size(), 3);
        assert_eq!(b.size(), 2);
        assert_eq!(a.leaf_key(2), 4);
        assert_eq!(b.leaf_key(0), 6);
        assert_eq!(b.leaf_mapped(1), 4);
        Ok(())
    }

    #[test]
    fn test_branch_insert_keeps_children_adjacent() -> Result<()> {
        let (_d, m) = mgr();
        let b = fresh_node(&m)?;
        b.set_level(1);
        b.set_size(0);

        // single child (the end pseudo-element), then grow
        b.set_branch_child(0, PageId::new(101));
        b.branch_insert(0, &50, PageId::new(102)); // P101 K50 P102
        b.branch_insert(1, &70, PageId::new(103)); // P101 K50 P102 K70 P103
        b.branch_insert(0, &30, PageId::new(104)); // P101 K30 P104 K50 P102 K70 P103

        assert_eq!(b.size(), 3);
        let keys: Vec<i32> = (0..3).map(|i| b.branch_key(i)).collect();
        assert_eq!(keys, vec![30, 50, 70]);
        let children: Vec<u32> = (0..=3).map(|i| b.branch_child(i).value()).collect();
        assert_eq!(children, vec![101, 104, 102, 103]);
        Ok(())
    }

    #[test]
    fn test_branch_remove_child() -> Result<()> {
        let (_d, m) = mgr();
        let b = fresh_node(&m)?;
        b.set_level(1);
        b.set_branch_child(0, PageId::new(1));
        b.branch_insert(0, &10, PageId::new(2));
        b.branch_insert(1, &20, PageId::new(3));
        b.branch_insert(2, &30, PageId::new(4));
        // P1 K10 P2 K20 P3 K30 P4

        b.branch_remove_child(2); // drops P3 and K20
        let keys: Vec<i32> = (0..b.size()).map(|i| b.branch_key(i)).collect();
        assert_eq!(keys, vec![10, 30]);
        let children: Vec<u32> = (0..=2).map(|i| b.branch_child(i).value()).collect();
        assert_eq!(children, vec![1, 2, 4]);

        b.branch_remove_child(0); // drops P1 and K10
        assert_eq!(b.size(), 1);
        let children: Vec<u32> = (0..=1).map(|i| b.branch_child(i).value()).collect();
        assert_eq!(children, vec![2, 4]);

        b.branch_remove_child(1); // drops the pseudo-element P4 and K30
        assert_eq!(b.size(), 0);
        assert_eq!(b.branch_child(0).value(), 2);
        Ok(())
    }

    #[test]
    fn test_branch_split_promotes_median() -> Result<()> {
        let (_d, m) = mgr();
        let b = fresh_node(&m)?;
        let b2 = fresh_node(&m)?;
        b.set_level(2);
        b2.set_level(2);
        b2.set_size(0);

        b.set_branch_child(0, PageId::new(10));
        for (i, k) in [100, 200, 300, 400].iter().enumerate() {
            b.branch_insert(i, k, PageId::new(11 + i as u32));
        }
        // P10 K100 P11 K200 P12 K300 P13 K400 P14

        let keep = b.size() - b.size() / 2; // 2
        let median = b.branch_split_into(&b2, keep);
        assert_eq!(median, 200);

        assert_eq!(b.size(), 1);
        assert_eq!(b.branch_key(0), 100);
        assert_eq!(b.branch_child(1).value(), 11); // P11 is the new pseudo-element

        assert_eq!(b2.size(), 2);
        let keys: Vec<i32> = (0..2).map(|i| b2.branch_key(i)).collect();
        assert_eq!(keys, vec![300, 400]);
        let children: Vec<u32> = (0..=2).map(|i| b2.branch_child(i).value()).collect();
        assert_eq!(children, vec![12, 13, 14]);
        Ok(())
    }

    #[test]
    fn test_free_list_entry() -> Result<()> {
        let (_d, m) = mgr();
        let n = fresh_node(&m)?;
        n.set_level(0);
        n.set_free(PageId::new(77));
        assert_eq!(n.level(), FREE_NODE_LEVEL);
        assert!(!n.is_leaf());
        assert!(!n.is_branch());
        assert_eq!(n.next_free(), PageId::new(77));
        Ok(())
    }
}
