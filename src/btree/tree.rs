//! The B+tree engine.
//!
//! One generic core serves all four public containers; uniqueness and
//! key-only-ness are runtime properties recorded in the header flags.
//! There is always at least one leaf in an open tree, possibly empty,
//! and thus always a root; a single-leaf tree's root is that leaf.
//!
//! Splits walk back up the cursor's frame stack instead of a persisted
//! parent link. Erase never rebalances by borrowing or merging: nodes
//! shrink until a single-element leaf is removed outright, and only the
//! root collapses levels. The split pathway alone maintains balance.

use std::borrow::Borrow;
use std::fmt;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::btree::cursor::{Cursor, PathFrame, RawRange};
use crate::btree::node::NodeView;
use crate::buffer::{BufferManager, BufferStats};
use crate::error::{Error, Result};
use crate::storage::{oflag, HeaderPage, ReadStatus, HEADER_SIZE};
use crate::types::{
    Endianness, Flags, PageId, Storable, MAJOR_VERSION, MIN_NODE_ELEMENTS, MIN_NODE_SIZE,
};
use crate::OpenOptions;

/// Tree structure export for diagnostics: one entry per live node
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeShape {
    /// Page id of this node
    pub page_id: u32,
    /// Level: 0 for leaves, height above the leaves for branches
    pub level: u8,
    pub is_leaf: bool,
    /// Records on a leaf, separator keys on a branch
    pub entries: usize,
    /// Child nodes, empty for leaves
    pub children: Vec<TreeShape>,
}

impl TreeShape {
    /// Leaf and branch node totals of this sub-tree
    pub fn node_counts(&self) -> (u64, u64) {
        let mut leaves = 0;
        let mut branches = 0;
        let mut stack = vec![self];
        while let Some(n) = stack.pop() {
            if n.is_leaf {
                leaves += 1;
            } else {
                branches += 1;
            }
            stack.extend(n.children.iter());
        }
        (leaves, branches)
    }
}

/// The generic on-disk B+tree underlying every container facade
pub struct Tree<K: Storable + Ord, V: Storable> {
    mgr: BufferManager,
    hdr: HeaderPage,
    root: Option<NodeView<K, V>>,
    endian: Endianness,
    open_flags: Flags,
    unique: bool,
    read_only: bool,
    cache_branches: bool,
    ok_to_pack: bool,
    max_leaf_elements: usize,
    max_branch_elements: usize,
    path: PathBuf,
}

impl<K: Storable + Ord, V: Storable> fmt::Debug for Tree<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree").field("path", &self.path).finish()
    }
}

impl<K: Storable + Ord, V: Storable> Tree<K, V> {
    //  open / close  --------------------------------------------------//

    pub fn open(opts: &OpenOptions, unique: bool, key_only: bool) -> Result<Self> {
        let path = opts.path.clone();
        let requested_node_size = opts.node_size;
        if requested_node_size < MIN_NODE_SIZE {
            return Err(Error::invalid_argument(format!(
                "node size {requested_node_size} below minimum {MIN_NODE_SIZE}"
            )));
        }

        let mut kind_flags = Flags::default();
        if unique {
            kind_flags = kind_flags | Flags::UNIQUE;
        }
        if key_only {
            kind_flags = kind_flags | Flags::KEY_ONLY;
        }
        if opts.key_varies {
            kind_flags = kind_flags | Flags::KEY_VARIES;
        }
        if opts.mapped_varies {
            kind_flags = kind_flags | Flags::MAPPED_VARIES;
        }

        let read_write = opts.read_write || opts.truncate;
        let mut file_flags = oflag::IN;
        if read_write {
            file_flags |= oflag::OUT;
        }
        if opts.truncate {
            file_flags |= oflag::TRUNCATE;
        }
        if opts.preload {
            file_flags |= oflag::PRELOAD;
        }

        let (mgr, existed) = BufferManager::open(
            &path,
            file_flags,
            opts.max_cache_size,
            requested_node_size,
        )?;

        let mut tree = Self {
            mgr,
            hdr: HeaderPage::new(
                opts.endianness.unwrap_or(Endianness::native()),
                requested_node_size as u32,
                opts.signature,
                kind_flags,
            ),
            root: None,
            endian: Endianness::native(),
            open_flags: kind_flags,
            unique,
            read_only: !read_write,
            cache_branches: opts.cache_branches,
            ok_to_pack: true,
            max_leaf_elements: 0,
            max_branch_elements: 0,
            path,
        };

        if existed {
            tree.open_existing(opts, unique, key_only)?;
        } else {
            tree.create_new(opts)?;
        }

        let mut mode = if read_write {
            Flags::READ_WRITE
        } else {
            Flags::READ_ONLY
        };
        if opts.truncate {
            mode = mode | Flags::TRUNCATE;
        }
        if opts.preload {
            mode = mode | Flags::PRELOAD;
        }
        if opts.cache_branches {
            mode = mode | Flags::CACHE_BRANCHES;
        }
        tree.open_flags = tree.open_flags.union(mode);

        let needed = tree.hdr.levels() + 1;
        if tree.mgr.max_cache_size() < needed {
            tree.mgr.set_max_cache_size(needed);
        }
        Ok(tree)
    }

    fn open_existing(&mut self, opts: &OpenOptions, unique: bool, key_only: bool) -> Result<()> {
        let mut buf = vec![0u8; HEADER_SIZE];
        match self.mgr.read_header_page(&mut buf)? {
            ReadStatus::Full => {}
            _ => {
                return Err(Error::NotABtree {
                    path: self.path.clone(),
                })
            }
        }
        let hdr = HeaderPage::read(&buf, &self.path)?;

        if opts.signature != crate::types::ANY_SIGNATURE && hdr.signature != opts.signature {
            return Err(Error::SignatureMismatch {
                path: self.path.clone(),
                found: hdr.signature,
                expected: opts.signature,
            });
        }
        if let Some(requested) = opts.endianness {
            if requested != hdr.endianness {
                return Err(Error::EndiannessMismatch {
                    path: self.path.clone(),
                });
            }
        }
        if hdr.major_version != MAJOR_VERSION {
            return Err(Error::VersionMismatch {
                path: self.path.clone(),
                found_major: hdr.major_version,
                found_minor: hdr.minor_version,
                expected_major: MAJOR_VERSION,
            });
        }
        if hdr.flags.contains(Flags::KEY_ONLY) != key_only {
            return Err(Error::KindMismatch {
                path: self.path.clone(),
                detail: "set/map differs",
            });
        }
        if hdr.flags.contains(Flags::UNIQUE) != unique {
            return Err(Error::KindMismatch {
                path: self.path.clone(),
                detail: "unique/multi differs",
            });
        }
        if !hdr.flags.contains(Flags::KEY_VARIES) && hdr.key_size != K::DISK_SIZE as u32 {
            return Err(Error::SizeMismatch {
                path: self.path.clone(),
                what: "key",
                found: hdr.key_size,
                expected: K::DISK_SIZE as u32,
            });
        }
        if !hdr.flags.contains(Flags::MAPPED_VARIES) && hdr.mapped_size != V::DISK_SIZE as u32 {
            return Err(Error::SizeMismatch {
                path: self.path.clone(),
                what: "mapped",
                found: hdr.mapped_size,
                expected: V::DISK_SIZE as u32,
            });
        }

        let node_size = hdr.node_size as usize;
        self.install_capacities(node_size)?;
        self.mgr.set_data_size(node_size)?;

        self.endian = hdr.endianness;
        self.open_flags = hdr.flags.permanent();
        self.hdr = hdr;
        self.root = Some(self.read_node(self.hdr.root_id)?);
        Ok(())
    }

    fn create_new(&mut self, opts: &OpenOptions) -> Result<()> {
        if self.read_only {
            // a read-only open of a missing file fails at the file layer,
            // so only a zero-length existing file reaches this point
            return Err(Error::NotABtree {
                path: self.path.clone(),
            });
        }
        let node_size = opts.node_size;
        self.install_capacities(node_size)?;

        self.endian = self.hdr.endianness;
        self.hdr.key_size = K::DISK_SIZE as u32;
        self.hdr.mapped_size = V::DISK_SIZE as u32;
        self.hdr.label = opts.label.clone();

        // write the header at its full page size by allocating page 0,
        // zero-filled, then dropping it from the cache
        {
            let header_page = self.mgr.new_buffer()?;
            debug_assert_eq!(header_page.page_id(), PageId::HEADER);
            self.hdr.write(&mut header_page.bytes_mut()[..]);
            self.mgr.flush()?;
            drop(header_page);
            self.mgr.clear_cache();
        }

        // an empty leaf is the initial root
        let root = self.new_node(0)?;
        debug_assert_eq!(root.id(), PageId::new(1));
        self.hdr.root_id = root.id();
        self.hdr.first_leaf_id = root.id();
        self.hdr.last_leaf_id = root.id();
        self.root = Some(root);
        self.write_header()?;
        self.mgr.flush()?;
        Ok(())
    }

    fn install_capacities(&mut self, node_size: usize) -> Result<()> {
        let value_size = Self::value_size();
        let branch_record = NodeView::<K, V>::BRANCH_RECORD_SIZE;
        let header = crate::btree::node::NODE_HEADER_SIZE;
        if node_size < MIN_NODE_SIZE {
            return Err(Error::invalid_argument(format!(
                "node size {node_size} below minimum {MIN_NODE_SIZE}"
            )));
        }
        let max_leaf = (node_size - header) / value_size;
        let max_branch = (node_size - header - 4) / branch_record;
        if max_leaf < MIN_NODE_ELEMENTS || max_branch < MIN_NODE_ELEMENTS {
            return Err(Error::invalid_argument(format!(
                "node size {node_size} cannot hold {MIN_NODE_ELEMENTS} elements"
            )));
        }
        self.max_leaf_elements = max_leaf;
        self.max_branch_elements = max_branch;
        Ok(())
    }

    const fn value_size() -> usize {
        K::DISK_SIZE + V::DISK_SIZE
    }

    pub fn is_open(&self) -> bool {
        self.mgr.is_open()
    }

    fn mgr(&self) -> Result<&BufferManager> {
        if self.mgr.is_open() {
            Ok(&self.mgr)
        } else {
            Err(Error::Closed)
        }
    }

    pub fn close(&mut self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.flush()?;
        self.root = None;
        self.mgr.close()
    }

    pub fn flush(&mut self) -> Result<()> {
        let mgr = self.mgr()?;
        if mgr.flush()? {
            self.write_header()?;
        }
        Ok(())
    }

    fn write_header(&self) -> Result<()> {
        let mut buf = vec![0u8; HEADER_SIZE];
        self.hdr.write(&mut buf);
        self.mgr()?.write_header_page(&buf)
    }

    //  observers  -----------------------------------------------------//

    pub fn len(&self) -> u64 {
        self.hdr.element_count
    }

    pub fn is_empty(&self) -> bool {
        self.hdr.element_count == 0
    }

    pub fn node_size(&self) -> usize {
        self.hdr.node_size as usize
    }

    pub fn levels(&self) -> usize {
        self.hdr.levels()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn label(&self) -> &str {
        &self.hdr.label
    }

    pub fn flags(&self) -> Flags {
        self.open_flags
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn ok_to_pack(&self) -> bool {
        self.ok_to_pack
    }

    /// Upper bound on element count, limited by the page-id space
    pub fn max_size(&self) -> u64 {
        (u32::MAX as u64 - 1).saturating_mul(self.max_leaf_elements as u64)
    }

    pub fn max_cache_size(&self) -> Result<usize> {
        Ok(self.mgr()?.max_cache_size())
    }

    /// Set the cache ceiling, clamped up to the levels-plus-one floor the
    /// rebalancing chain requires
    pub fn set_max_cache_size(&self, m: usize) -> Result<()> {
        let floor = self.hdr.levels() + 1;
        self.mgr()?.set_max_cache_size(m.max(floor));
        Ok(())
    }

    pub fn set_max_cache_megabytes(&self, mb: usize) -> Result<()> {
        self.set_max_cache_size(mb * 1_048_576 / self.node_size())
    }

    pub fn statistics(&self) -> Result<BufferStats> {
        Ok(self.mgr()?.statistics())
    }

    pub fn clear_statistics(&self) -> Result<()> {
        self.mgr()?.clear_statistics();
        Ok(())
    }

    //  node plumbing  -------------------------------------------------//

    fn read_node(&self, id: PageId) -> Result<NodeView<K, V>> {
        let view = NodeView::new(self.mgr()?.read(id)?, self.endian);
        if self.cache_branches && view.is_branch() {
            view.handle().set_never_free(true);
        }
        Ok(view)
    }

    fn new_node(&mut self, level: u8) -> Result<NodeView<K, V>> {
        let view = if !self.hdr.free_list_head.is_null() {
            let v = self.read_node(self.hdr.free_list_head)?;
            debug_assert_eq!(v.level(), crate::btree::node::FREE_NODE_LEVEL);
            self.hdr.free_list_head = v.next_free();
            v
        } else {
            let handle = self.mgr()?.new_buffer()?;
            self.hdr.page_count += 1;
            debug_assert_eq!(self.hdr.page_count, self.mgr()?.buffer_count());
            NodeView::new(handle, self.endian)
        };
        view.handle()
            .set_never_free(level > 0 && self.cache_branches);
        view.set_level(level);
        view.set_size(0);
        view.mark_dirty();
        Ok(view)
    }

    fn free_node(&mut self, node: &NodeView<K, V>) {
        node.set_free(self.hdr.free_list_head);
        self.hdr.free_list_head = node.id();
    }

    fn root_node(&self) -> Result<NodeView<K, V>> {
        self.root.clone().ok_or(Error::Closed)
    }

    //  cursor navigation  ---------------------------------------------//

    /// Cursor at the first element; None when empty
    pub(crate) fn begin_cursor(&self) -> Result<Option<Cursor<K, V>>> {
        if self.is_empty() {
            return Ok(None);
        }
        let mut frames = Vec::with_capacity(self.hdr.levels());
        let mut np = self.root_node()?;
        while np.is_branch() {
            let child = self.read_node(np.branch_child(0))?;
            frames.push(PathFrame { node: np, slot: 0 });
            np = child;
        }
        frames.push(PathFrame { node: np, slot: 0 });
        frames.reverse();
        Ok(Some(Cursor { frames }))
    }

    /// Cursor at the last element; None when empty
    pub(crate) fn last_cursor(&self) -> Result<Option<Cursor<K, V>>> {
        if self.is_empty() {
            return Ok(None);
        }
        let mut frames = Vec::with_capacity(self.hdr.levels());
        let mut np = self.root_node()?;
        while np.is_branch() {
            let slot = np.size(); // the end pseudo-element
            let child = self.read_node(np.branch_child(slot))?;
            frames.push(PathFrame { node: np, slot });
            np = child;
        }
        let slot = np.size() - 1;
        frames.push(PathFrame { node: np, slot });
        frames.reverse();
        Ok(Some(Cursor { frames }))
    }

    /// Step the cursor to the following element; false at the end
    pub(crate) fn advance(&self, c: &mut Cursor<K, V>) -> Result<bool> {
        c.frames[0].slot += 1;
        if c.frames[0].slot < c.frames[0].node.size() {
            return Ok(true);
        }
        self.next_leaf(c)
    }

    /// Move to the first element of the leaf following the cursor's,
    /// regardless of the current element slot; false when there is none
    pub(crate) fn next_leaf(&self, c: &mut Cursor<K, V>) -> Result<bool> {
        let mut d = 1;
        loop {
            if d >= c.frames.len() {
                return Ok(false);
            }
            if c.frames[d].slot < c.frames[d].node.size() {
                c.frames[d].slot += 1;
                break;
            }
            d += 1;
        }
        while d > 0 {
            let frame = &c.frames[d];
            let child = self.read_node(frame.node.branch_child(frame.slot))?;
            d -= 1;
            c.frames[d] = PathFrame {
                node: child,
                slot: 0,
            };
        }
        Ok(true)
    }

    /// Step the cursor to the preceding element; false at the beginning
    pub(crate) fn retreat(&self, c: &mut Cursor<K, V>) -> Result<bool> {
        if c.frames[0].slot > 0 {
            c.frames[0].slot -= 1;
            return Ok(true);
        }
        let mut d = 1;
        loop {
            if d >= c.frames.len() {
                return Ok(false);
            }
            if c.frames[d].slot > 0 {
                c.frames[d].slot -= 1;
                break;
            }
            d += 1;
        }
        while d > 0 {
            let frame = &c.frames[d];
            let child = self.read_node(frame.node.branch_child(frame.slot))?;
            let slot = if d > 1 { child.size() } else { child.size() - 1 };
            d -= 1;
            c.frames[d] = PathFrame { node: child, slot };
        }
        Ok(true)
    }

    //  search  --------------------------------------------------------//

    /// Walk root to leaf by lower bound, building the rebalancing chain.
    ///
    /// The returned leaf slot is the insertion point and may be one past
    /// the leaf's last element. At unique branches a separator equal to
    /// the search key steps one slot right, because equal keys live in
    /// the sub-tree to the key's right.
    fn special_lower_bound<Q>(&self, k: &Q) -> Result<Cursor<K, V>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut frames = Vec::with_capacity(self.hdr.levels());
        let mut np = self.root_node()?;
        while np.is_branch() {
            let mut slot = np.branch_lower_bound(k);
            if self.unique && slot < np.size() && np.branch_key(slot).borrow() == k {
                slot += 1;
            }
            let child = self.read_node(np.branch_child(slot))?;
            frames.push(PathFrame { node: np, slot });
            np = child;
        }
        let slot = np.leaf_lower_bound(k);
        frames.push(PathFrame { node: np, slot });
        frames.reverse();
        Ok(Cursor { frames })
    }

    /// Like `special_lower_bound` but by upper bound, so non-unique
    /// inserts land after existing equal keys
    fn special_upper_bound<Q>(&self, k: &Q) -> Result<Cursor<K, V>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut frames = Vec::with_capacity(self.hdr.levels());
        let mut np = self.root_node()?;
        while np.is_branch() {
            let slot = np.branch_upper_bound(k);
            let child = self.read_node(np.branch_child(slot))?;
            frames.push(PathFrame { node: np, slot });
            np = child;
        }
        let slot = np.leaf_upper_bound(k);
        frames.push(PathFrame { node: np, slot });
        frames.reverse();
        Ok(Cursor { frames })
    }

    /// Cursor at the first element not less than `k`; None when past the
    /// end
    pub(crate) fn lower_bound_cursor<Q>(&self, k: &Q) -> Result<Option<Cursor<K, V>>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut c = self.special_lower_bound(k)?;
        if c.leaf_slot() < c.leaf().size() {
            return Ok(Some(c));
        }
        if c.leaf().is_empty() {
            debug_assert!(self.is_empty());
            return Ok(None);
        }
        Ok(if self.next_leaf(&mut c)? { Some(c) } else { None })
    }

    /// Cursor at the first element greater than `k`; None when past the
    /// end
    pub(crate) fn upper_bound_cursor<Q>(&self, k: &Q) -> Result<Option<Cursor<K, V>>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut c = self.special_upper_bound(k)?;
        if c.leaf_slot() < c.leaf().size() {
            return Ok(Some(c));
        }
        if c.leaf().is_empty() {
            return Ok(None);
        }
        Ok(if self.next_leaf(&mut c)? { Some(c) } else { None })
    }

    pub(crate) fn find_cursor<Q>(&self, k: &Q) -> Result<Option<Cursor<K, V>>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        match self.lower_bound_cursor(k)? {
            Some(c) if c.key().borrow() == k => Ok(Some(c)),
            _ => Ok(None),
        }
    }

    pub fn count<Q>(&self, k: &Q) -> Result<u64>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut n = 0;
        let mut cur = self.lower_bound_cursor(k)?;
        while let Some(c) = cur.as_mut() {
            if c.key().borrow() != k {
                break;
            }
            n += 1;
            if !self.advance(c)? {
                break;
            }
        }
        Ok(n)
    }

    //  ranges  --------------------------------------------------------//

    pub fn range<Q>(&self, start: Bound<&Q>, end: Bound<&Q>) -> RawRange<'_, K, V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        match self.try_range(start, end) {
            Ok(r) => r,
            Err(e) => RawRange::failed(self, e),
        }
    }

    fn try_range<Q>(&self, start: Bound<&Q>, end: Bound<&Q>) -> Result<RawRange<'_, K, V>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let front = match start {
            Bound::Unbounded => self.begin_cursor()?,
            Bound::Included(q) => self.lower_bound_cursor(q)?,
            Bound::Excluded(q) => self.upper_bound_cursor(q)?,
        };
        let back = match end {
            Bound::Unbounded => self.last_cursor()?,
            Bound::Included(q) => self.predecessor_of(self.upper_bound_cursor(q)?)?,
            Bound::Excluded(q) => self.predecessor_of(self.lower_bound_cursor(q)?)?,
        };
        Ok(RawRange::new(self, front, back))
    }

    /// Element just before the given position; the end position (None)
    /// maps to the last element
    fn predecessor_of(&self, c: Option<Cursor<K, V>>) -> Result<Option<Cursor<K, V>>> {
        match c {
            None => self.last_cursor(),
            Some(mut c) => Ok(if self.retreat(&mut c)? { Some(c) } else { None }),
        }
    }

    //  insert  --------------------------------------------------------//

    fn check_writable(&self) -> Result<()> {
        self.mgr()?;
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Insert for the unique containers: false (and no change) when an
    /// equal key is already present
    pub fn insert_unique(&mut self, key: K, mapped: V) -> Result<bool> {
        self.check_writable()?;
        let c = self.special_lower_bound(&key)?;
        let exists = c.leaf_slot() < c.leaf().size() && c.leaf().leaf_key(c.leaf_slot()) == key;
        if exists {
            return Ok(false);
        }
        self.leaf_insert(c, &key, &mapped)?;
        Ok(true)
    }

    /// Insert for the multi containers: equal keys land after existing
    /// duplicates
    pub fn insert_non_unique(&mut self, key: K, mapped: V) -> Result<()> {
        self.check_writable()?;
        let c = self.special_upper_bound(&key)?;
        self.leaf_insert(c, &key, &mapped)?;
        Ok(())
    }

    /// Overwrite the mapped value of an existing key; false when absent
    pub fn update_mapped<Q>(&mut self, k: &Q, mapped: V) -> Result<bool>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.check_writable()?;
        match self.find_cursor(k)? {
            Some(c) => {
                c.leaf().leaf_set_mapped(c.leaf_slot(), &mapped);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn leaf_insert(&mut self, mut c: Cursor<K, V>, key: &K, mapped: &V) -> Result<Cursor<K, V>> {
        let leaf = c.frames[0].node.clone();
        debug_assert!(leaf.is_leaf());
        debug_assert!(leaf.size() <= self.max_leaf_elements);

        self.hdr.element_count += 1;
        leaf.mark_dirty();

        if leaf.size() == self.max_leaf_elements {
            if c.frames.len() == 1 {
                self.new_root(&mut c)?;
            }
            let n2 = self.new_node(0)?;

            // check pack conditions now: last_leaf_id changes below
            if self.ok_to_pack
                && (c.frames[0].slot != leaf.size() || leaf.id() != self.hdr.last_leaf_id)
            {
                self.ok_to_pack = false;
            }
            if leaf.id() == self.hdr.last_leaf_id {
                self.hdr.last_leaf_id = n2.id();
            }

            if self.ok_to_pack {
                // streaming-sequential fast path: the new key goes alone
                // onto the fresh leaf, leaving the full one packed
                n2.leaf_insert(0, key, mapped);
                let sep = n2.leaf_key(0);
                let pos = self.branch_insert_at(&mut c, 1, sep, &n2)?;
                c.frames[1] = PathFrame {
                    node: pos.0,
                    slot: pos.1,
                };
                c.frames[0] = PathFrame { node: n2, slot: 0 };
                return Ok(c);
            }

            // standard split: move the trailing half to the new leaf
            let split_sz = leaf.size() / 2;
            let keep = leaf.size() - split_sz;
            leaf.leaf_split_into(&n2, split_sz);

            let on_new = c.frames[0].slot > keep;
            if on_new {
                c.frames[0] = PathFrame {
                    node: n2.clone(),
                    slot: c.frames[0].slot - keep,
                };
            }
            c.frames[0].node.leaf_insert(c.frames[0].slot, key, mapped);

            let sep = n2.leaf_key(0);
            let pos = self.branch_insert_at(&mut c, 1, sep, &n2)?;
            c.frames[1] = if on_new {
                PathFrame {
                    node: pos.0,
                    slot: pos.1,
                }
            } else {
                PathFrame {
                    node: pos.0,
                    slot: pos.1 - 1,
                }
            };
            return Ok(c);
        }

        leaf.leaf_insert(c.frames[0].slot, key, mapped);
        Ok(c)
    }

    /// Insert separator `key` and `child` into the branch at path depth
    /// `depth`, at the slot recorded in the cursor frame. On return,
    /// `frames[depth]` addresses the pre-existing path child; the
    /// returned pair is the node and slot where `child` was placed.
    fn branch_insert_at(
        &mut self,
        c: &mut Cursor<K, V>,
        depth: usize,
        key: K,
        child: &NodeView<K, V>,
    ) -> Result<(NodeView<K, V>, usize)> {
        let mut node = c.frames[depth].node.clone();
        let mut element = c.frames[depth].slot;
        debug_assert!(node.is_branch());
        debug_assert!(node.size() <= self.max_branch_elements);
        node.mark_dirty();

        if node.size() == self.max_branch_elements {
            if depth == c.frames.len() - 1 {
                self.new_root(c)?;
            }
            let n2 = self.new_node(node.level())?;

            if self.ok_to_pack {
                // still the streaming path: the child alone becomes the
                // new branch's pseudo-element
                n2.set_branch_child(0, child.id());
                let pos = self.branch_insert_at(c, depth + 1, key, &n2)?;
                c.frames[depth + 1] = PathFrame {
                    node: pos.0,
                    slot: pos.1,
                };
                return Ok((n2, 0));
            }

            let np2_sz = node.size() / 2;
            let keep = node.size() - np2_sz;
            let median = node.branch_split_into(&n2, keep);
            let pos = self.branch_insert_at(c, depth + 1, median, &n2)?;
            if element > keep - 1 {
                element -= keep;
                c.frames[depth + 1] = PathFrame {
                    node: pos.0,
                    slot: pos.1,
                };
                node = n2;
            }
        }

        node.branch_insert(element, &key, child.id());
        c.frames[depth] = PathFrame {
            node: node.clone(),
            slot: element,
        };
        Ok((node, element + 1))
    }

    /// Grow the tree by one level: a new root whose only entry is the
    /// old root as its pseudo-element child
    fn new_root(&mut self, c: &mut Cursor<K, V>) -> Result<()> {
        let old_root = self.root_node()?;
        self.hdr.root_level += 1;

        let needed = self.hdr.levels() + 1;
        if self.mgr()?.max_cache_size() < needed {
            self.mgr()?.set_max_cache_size(needed);
        }

        let new_root = self.new_node(self.hdr.root_level)?;
        new_root.set_branch_child(0, old_root.id());
        self.hdr.root_id = new_root.id();
        self.root = Some(new_root.clone());
        c.frames.push(PathFrame {
            node: new_root,
            slot: 0,
        });
        Ok(())
    }

    //  erase  ---------------------------------------------------------//

    /// Remove the element under the cursor. Returns the cursor at the
    /// element that followed it, or None at the end.
    pub(crate) fn erase_at(&mut self, c: Cursor<K, V>) -> Result<Option<Cursor<K, V>>> {
        self.check_writable()?;
        debug_assert!(c.leaf_slot() < c.leaf().size());

        self.ok_to_pack = false;
        let leaf = c.frames[0].node.clone();
        leaf.mark_dirty();
        self.hdr.element_count -= 1;

        let is_root_leaf = c.frames.len() == 1;
        if !is_root_leaf && leaf.size() == 1 {
            // the leaf empties: unhook it from its parent and free it.
            // the prior leaf survives branch surgery (it sits left of
            // every slot that shifts), so it anchors the return cursor
            let erased_id = leaf.id();
            let mut prior = c.clone();
            let has_prior = self.retreat(&mut prior)?;

            if erased_id == self.hdr.last_leaf_id {
                debug_assert!(has_prior);
                self.hdr.last_leaf_id = prior.leaf().id();
            }

            let mut chain = c;
            self.erase_branch_value(&mut chain, 1)?;
            self.free_node(&leaf);

            if has_prior {
                let mut next = prior;
                return Ok(if self.advance(&mut next)? {
                    Some(next)
                } else {
                    None
                });
            }
            // the first leaf was erased: rebuild from the root
            let begin = self.begin_cursor()?;
            if erased_id == self.hdr.first_leaf_id {
                if let Some(b) = &begin {
                    self.hdr.first_leaf_id = b.leaf().id();
                }
            }
            return Ok(begin);
        }

        // multi-element leaf, or the root leaf (which is never freed)
        let slot = c.frames[0].slot;
        leaf.leaf_remove(slot);
        if slot < leaf.size() {
            return Ok(Some(c));
        }
        let mut next = c;
        Ok(if self.next_leaf(&mut next)? {
            Some(next)
        } else {
            None
        })
    }

    /// Remove the branch record that points at the child on the path at
    /// `depth - 1`, recursing upward when the branch itself empties, and
    /// demoting the root while only its pseudo-element remains.
    fn erase_branch_value(&mut self, c: &mut Cursor<K, V>, depth: usize) -> Result<()> {
        let node = c.frames[depth].node.clone();
        debug_assert!(node.is_branch());

        if node.is_empty() {
            // the pseudo-element is the sole entry and it is the one
            // being removed: this whole sub-tree is now empty
            debug_assert!(depth + 1 < c.frames.len());
            self.erase_branch_value(c, depth + 1)?;
            self.free_node(&node);
            return Ok(());
        }

        node.branch_remove_child(c.frames[depth].slot);

        let mut np = node;
        while np.is_branch() && np.is_empty() && np.id() == self.hdr.root_id {
            let promoted = np.branch_child(0);
            self.hdr.root_id = promoted;
            self.hdr.root_level -= 1;
            let new_root = self.read_node(promoted)?;
            self.root = Some(new_root.clone());
            self.free_node(&np);
            np = new_root;
        }
        Ok(())
    }

    /// Erase every element with key equal to `k`; returns the count
    pub fn erase_key<Q>(&mut self, k: &Q) -> Result<u64>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.check_writable()?;
        let mut n = 0;
        let mut cur = self.lower_bound_cursor(k)?;
        while let Some(c) = cur {
            if c.key().borrow() != k {
                break;
            }
            cur = self.erase_at(c)?;
            n += 1;
        }
        Ok(n)
    }

    /// Erase every element within the bounds; returns the count
    pub fn erase_range<Q>(&mut self, start: Bound<&Q>, end: Bound<&Q>) -> Result<u64>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.check_writable()?;
        let mut cur = match start {
            Bound::Unbounded => self.begin_cursor()?,
            Bound::Included(q) => self.lower_bound_cursor(q)?,
            Bound::Excluded(q) => self.upper_bound_cursor(q)?,
        };
        let mut n = 0;
        while let Some(c) = cur {
            let past_end = match end {
                Bound::Unbounded => false,
                Bound::Included(q) => c.key().borrow() > q,
                Bound::Excluded(q) => c.key().borrow() >= q,
            };
            if past_end {
                break;
            }
            cur = self.erase_at(c)?;
            n += 1;
        }
        Ok(n)
    }

    /// Discard every element, keeping the container open: the file is
    /// truncated back to a header plus one empty root leaf
    pub fn clear(&mut self) -> Result<()> {
        self.check_writable()?;
        self.root = None;
        {
            let mgr = self.mgr()?;
            mgr.clear_write_needed();
            mgr.clear_cache();
            mgr.truncate_pages(1)?;
        }
        self.hdr.element_count = 0;
        self.hdr.root_level = 0;
        self.hdr.free_list_head = PageId::NULL;
        self.hdr.page_count = 1;
        self.ok_to_pack = true;

        let root = self.new_node(0)?;
        self.hdr.root_id = root.id();
        self.hdr.first_leaf_id = root.id();
        self.hdr.last_leaf_id = root.id();
        self.root = Some(root);
        self.write_header()?;
        self.mgr()?.flush()?;
        Ok(())
    }

    //  diagnostics  ---------------------------------------------------//

    /// Export the tree structure, excluding free-list nodes
    pub fn shape(&self) -> Result<TreeShape> {
        self.shape_of(self.hdr.root_id)
    }

    fn shape_of(&self, id: PageId) -> Result<TreeShape> {
        let node = self.read_node(id)?;
        let mut children = Vec::new();
        if node.is_branch() {
            for slot in 0..=node.size() {
                children.push(self.shape_of(node.branch_child(slot))?);
            }
        }
        Ok(TreeShape {
            page_id: id.value(),
            level: node.level(),
            is_leaf: node.is_leaf(),
            entries: node.size(),
            children,
        })
    }

    /// Header-derived summary used by the facades' Display impls
    pub(crate) fn fmt_summary(&self, f: &mut fmt::Formatter<'_>, kind: &str) -> fmt::Result {
        writeln!(f, "{kind} \"{}\"", self.path.display())?;
        writeln!(f, "  element count ------------: {}", self.hdr.element_count)?;
        writeln!(f, "  node size ----------------: {}", self.hdr.node_size)?;
        writeln!(f, "  levels in tree -----------: {}", self.hdr.levels())?;
        writeln!(f, "  node count, inc free list : {}", self.hdr.page_count.saturating_sub(1))?;
        writeln!(f, "  root node id -------------: {}", self.hdr.root_id)?;
        writeln!(f, "  first leaf node id -------: {}", self.hdr.first_leaf_id)?;
        writeln!(f, "  last leaf node id --------: {}", self.hdr.last_leaf_id)?;
        writeln!(f, "  free node list head id ---: {}", self.hdr.free_list_head)?;
        writeln!(f, "  user label ---------------: \"{}\"", self.hdr.label)?;
        writeln!(f, "  ok to pack ---------------: {}", self.ok_to_pack)
    }
}

impl<K: Storable + Ord, V: Storable> Drop for Tree<K, V> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
