//! LRU-ordered list of available (unreferenced, evictable) buffers.

use std::collections::HashMap;

/// Doubly-linked list of page ids in least-recently-used order.
///
/// Front = least recently used (next eviction victim), back = most
/// recently released. Membership invariant is owned by the buffer
/// manager: a page is on this list iff its use count is zero and it is
/// not pinned.
pub struct LruList {
    /// Maps page id to its slot in `nodes`
    positions: HashMap<u32, usize>,
    /// Slab of list nodes, linked by index
    nodes: Vec<LruNode>,
    /// Front of the list (least recently used)
    front: Option<usize>,
    /// Back of the list (most recently used)
    back: Option<usize>,
    /// Recyclable slots in `nodes`
    free_slots: Vec<usize>,
}

#[derive(Clone, Copy)]
struct LruNode {
    page_id: u32,
    prev: Option<usize>,
    next: Option<usize>,
}

impl LruList {
    pub fn new() -> Self {
        Self {
            positions: HashMap::new(),
            nodes: Vec::new(),
            front: None,
            back: None,
            free_slots: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn contains(&self, page_id: u32) -> bool {
        self.positions.contains_key(&page_id)
    }

    /// Append a page at the most-recently-used end.
    ///
    /// The page must not already be on the list.
    pub fn push_mru(&mut self, page_id: u32) {
        debug_assert!(!self.contains(page_id));

        let node = LruNode {
            page_id,
            prev: self.back,
            next: None,
        };
        let slot = if let Some(slot) = self.free_slots.pop() {
            self.nodes[slot] = node;
            slot
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        };

        if let Some(old_back) = self.back {
            self.nodes[old_back].next = Some(slot);
        }
        self.back = Some(slot);
        if self.front.is_none() {
            self.front = Some(slot);
        }
        self.positions.insert(page_id, slot);
    }

    /// Detach and return the least-recently-used page id
    pub fn pop_lru(&mut self) -> Option<u32> {
        let slot = self.front?;
        let page_id = self.nodes[slot].page_id;
        self.remove(page_id);
        Some(page_id)
    }

    /// Detach a specific page; true if it was on the list
    pub fn remove(&mut self, page_id: u32) -> bool {
        let Some(slot) = self.positions.remove(&page_id) else {
            return false;
        };
        let node = self.nodes[slot];

        match node.prev {
            Some(prev) => self.nodes[prev].next = node.next,
            None => self.front = node.next,
        }
        match node.next {
            Some(next) => self.nodes[next].prev = node.prev,
            None => self.back = node.prev,
        }
        self.free_slots.push(slot);
        true
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.positions.clear();
        self.nodes.clear();
        self.free_slots.clear();
        self.front = None;
        self.back = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_order() {
        let mut list = LruList::new();
        list.push_mru(1);
        list.push_mru(2);
        list.push_mru(3);

        assert_eq!(list.len(), 3);
        assert_eq!(list.pop_lru(), Some(1));
        assert_eq!(list.pop_lru(), Some(2));
        assert_eq!(list.pop_lru(), Some(3));
        assert_eq!(list.pop_lru(), None);
    }

    #[test]
    fn test_remove_middle_and_reinsert() {
        let mut list = LruList::new();
        list.push_mru(1);
        list.push_mru(2);
        list.push_mru(3);

        assert!(list.remove(2));
        assert!(!list.remove(2));
        assert_eq!(list.len(), 2);

        // released again: now most recently used
        list.push_mru(2);
        assert_eq!(list.pop_lru(), Some(1));
        assert_eq!(list.pop_lru(), Some(3));
        assert_eq!(list.pop_lru(), Some(2));
    }

    #[test]
    fn test_remove_ends() {
        let mut list = LruList::new();
        list.push_mru(10);
        list.push_mru(20);
        list.push_mru(30);

        assert!(list.remove(30));
        assert!(list.remove(10));
        assert_eq!(list.pop_lru(), Some(20));
        assert!(list.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut list = LruList::new();
        list.push_mru(1);
        list.push_mru(2);
        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.pop_lru(), None);
    }
}
