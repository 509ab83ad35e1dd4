//! Cursors: operation-scoped root-to-leaf paths.
//!
//! A cursor is a stack of `(node, slot)` frames, leaf first. Frame 0
//! holds the leaf and an element index; every higher frame holds a
//! branch and the child slot the path descends through. The frames own
//! node handles, so the whole chain from leaf to root stays pinned in
//! the buffer cache for as long as the cursor lives — this is what lets
//! searches hand a valid rebalancing chain to inserts and erases, and
//! what keeps an iterator's leaf resident.
//!
//! Sibling traversal never walks from the root: advancing past the end
//! of a leaf climbs to the nearest frame with a slot to its right, steps
//! it, and descends leftmost children back to a leaf (retreat is the
//! mirror image, descending rightmost through end pseudo-elements).

use crate::btree::node::NodeView;
use crate::btree::tree::Tree;
use crate::error::{Error, Result};
use crate::types::{PageId, Storable};

/// One step of a cursor's path
pub(crate) struct PathFrame<K, V> {
    pub node: NodeView<K, V>,
    pub slot: usize,
}

impl<K, V> Clone for PathFrame<K, V> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            slot: self.slot,
        }
    }
}

/// A position within the tree, carrying its own leaf-to-root chain.
///
/// `frames[0]` is the leaf; `frames.last()` is the root.
pub(crate) struct Cursor<K, V> {
    pub frames: Vec<PathFrame<K, V>>,
}

impl<K, V> Clone for Cursor<K, V> {
    fn clone(&self) -> Self {
        Self {
            frames: self.frames.clone(),
        }
    }
}

impl<K: Storable + Ord, V: Storable> Cursor<K, V> {
    pub(crate) fn leaf(&self) -> &NodeView<K, V> {
        &self.frames[0].node
    }

    pub(crate) fn leaf_slot(&self) -> usize {
        self.frames[0].slot
    }

    /// Identity of the element this cursor rests on
    pub(crate) fn position(&self) -> (PageId, usize) {
        (self.frames[0].node.id(), self.frames[0].slot)
    }

    pub(crate) fn key(&self) -> K {
        self.leaf().leaf_key(self.leaf_slot())
    }

    pub(crate) fn record(&self) -> (K, V) {
        self.leaf().leaf_record(self.leaf_slot())
    }
}

/// Double-ended iterator over a key range, yielding owned records.
///
/// `front` rests on the next record to yield from the front, `back` on
/// the last record still to yield. The iterator is exhausted once both
/// meet.
pub struct RawRange<'a, K: Storable + Ord, V: Storable> {
    tree: &'a Tree<K, V>,
    front: Option<Cursor<K, V>>,
    back: Option<Cursor<K, V>>,
    exhausted: bool,
    pending_err: Option<Error>,
}

impl<'a, K: Storable + Ord, V: Storable> RawRange<'a, K, V> {
    pub(crate) fn new(
        tree: &'a Tree<K, V>,
        front: Option<Cursor<K, V>>,
        back: Option<Cursor<K, V>>,
    ) -> Self {
        let exhausted = match (&front, &back) {
            (Some(f), Some(b)) => f.key() > b.key(),
            _ => true,
        };
        Self {
            tree,
            front,
            back,
            exhausted,
            pending_err: None,
        }
    }

    fn empty(tree: &'a Tree<K, V>) -> Self {
        Self {
            tree,
            front: None,
            back: None,
            exhausted: true,
            pending_err: None,
        }
    }

    pub(crate) fn failed(tree: &'a Tree<K, V>, err: Error) -> Self {
        let mut r = Self::empty(tree);
        r.exhausted = false;
        r.pending_err = Some(err);
        r
    }
}

impl<'a, K: Storable + Ord, V: Storable> Iterator for RawRange<'a, K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending_err.take() {
            self.exhausted = true;
            return Some(Err(err));
        }
        if self.exhausted {
            return None;
        }
        let front = self.front.as_mut()?;
        let record = front.record();

        if front.position() == self.back.as_ref()?.position() {
            self.exhausted = true;
        } else {
            match self.tree.advance(front) {
                Ok(true) => {}
                Ok(false) => self.exhausted = true,
                Err(e) => self.pending_err = Some(e),
            }
        }
        Some(Ok(record))
    }
}

impl<'a, K: Storable + Ord, V: Storable> DoubleEndedIterator for RawRange<'a, K, V> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending_err.take() {
            self.exhausted = true;
            return Some(Err(err));
        }
        if self.exhausted {
            return None;
        }
        let back = self.back.as_mut()?;
        let record = back.record();

        if back.position() == self.front.as_ref()?.position() {
            self.exhausted = true;
        } else {
            match self.tree.retreat(back) {
                Ok(true) => {}
                Ok(false) => self.exhausted = true,
                Err(e) => self.pending_err = Some(e),
            }
        }
        Some(Ok(record))
    }
}
