//! # btree-file
//!
//! An embedded, on-disk ordered container library: B+tree `set`,
//! `multiset`, `map`, and `multimap` semantics over a single file. The
//! public surface mirrors an in-memory ordered container — lookup,
//! range queries, iteration, insertion, erasure — but all elements live
//! on disk and are paged in on demand through a fixed-size buffer
//! cache.
//!
//! ## Architecture
//!
//! - **Storage layer** (`storage`): positioned binary I/O and the
//!   fixed-layout header page
//! - **Buffer manager** (`buffer`): reference-counted page cache with
//!   LRU write-back
//! - **B+tree engine** (`btree`): node layout, search, split, erase,
//!   and cursor iteration
//! - **Containers**: `BtreeSet`, `BtreeMultiset`, `BtreeMap`,
//!   `BtreeMultimap`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use btree_file::{BtreeMap, OpenOptions};
//!
//! let mut map = BtreeMap::<i32, u64>::open(
//!     OpenOptions::new("inventory.bt").read_write(),
//! )?;
//!
//! map.insert(42, 900)?;
//! assert_eq!(map.get(&42)?, Some(900));
//!
//! for entry in map.iter() {
//!     let (key, value) = entry?;
//!     println!("{key} -> {value}");
//! }
//! ```
//!
//! Keys and mapped values are fixed-size [`Storable`] types written in
//! host representation; a file is portable only between hosts that
//! agree on that representation. Durability is explicit: [`flush`]
//! writes dirty pages, and nothing is journaled — a crash between
//! flushes can tear the file.
//!
//! [`flush`]: BtreeMap::flush

pub mod btree;
pub mod buffer;
pub mod error;
pub mod map;
pub mod set;
pub mod storage;
pub mod types;

pub use btree::{RawRange, TreeShape};
pub use buffer::BufferStats;
pub use error::{Error, Result};
pub use map::{BtreeMap, BtreeMultimap};
pub use set::{BtreeMultiset, BtreeSet};
pub use types::{Endianness, Flags, PageId, Storable, ANY_SIGNATURE};

use std::path::PathBuf;

use types::{DEFAULT_MAX_CACHE_NODES, DEFAULT_NODE_SIZE};

/// How to open or create a container file.
///
/// The default opens read-only with 4096-byte nodes and a 32-node
/// cache:
///
/// ```rust,ignore
/// let opts = OpenOptions::new("data.bt")
///     .read_write()
///     .node_size(512)
///     .max_cache_size(64)
///     .label("part numbers");
/// ```
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub(crate) path: PathBuf,
    pub(crate) read_write: bool,
    pub(crate) truncate: bool,
    pub(crate) preload: bool,
    pub(crate) cache_branches: bool,
    pub(crate) key_varies: bool,
    pub(crate) mapped_varies: bool,
    pub(crate) node_size: usize,
    pub(crate) max_cache_size: usize,
    pub(crate) signature: u64,
    pub(crate) endianness: Option<Endianness>,
    pub(crate) label: String,
}

impl OpenOptions {
    /// Options for `path` with default settings (read-only)
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            read_write: false,
            truncate: false,
            preload: false,
            cache_branches: false,
            key_varies: false,
            mapped_varies: false,
            node_size: DEFAULT_NODE_SIZE,
            max_cache_size: DEFAULT_MAX_CACHE_NODES,
            signature: ANY_SIGNATURE,
            endianness: None,
            label: String::new(),
        }
    }

    /// Allow mutation; the file is created if absent.
    ///
    /// In the default read-only mode every page read still participates
    /// in cache eviction, but read-only buffers are never dirty, so
    /// eviction never writes.
    pub fn read_write(mut self) -> Self {
        self.read_write = true;
        self
    }

    /// Discard an existing file; implies `read_write`
    pub fn truncate(mut self) -> Self {
        self.truncate = true;
        self
    }

    /// Sequentially read the whole file on open to warm the OS cache
    pub fn preload(mut self) -> Self {
        self.preload = true;
        self
    }

    /// Pin branch nodes in the cache once loaded
    pub fn cache_branches(mut self) -> Self {
        self.cache_branches = true;
        self
    }

    /// Suppress the key-size check on reopen
    pub fn key_varies(mut self) -> Self {
        self.key_varies = true;
        self
    }

    /// Suppress the mapped-size check on reopen
    pub fn mapped_varies(mut self) -> Self {
        self.mapped_varies = true;
        self
    }

    /// Node (page) size for a new file; fixed thereafter
    pub fn node_size(mut self, bytes: usize) -> Self {
        self.node_size = bytes;
        self
    }

    /// Target number of cached nodes; `usize::MAX` means never evict
    pub fn max_cache_size(mut self, nodes: usize) -> Self {
        self.max_cache_size = nodes;
        self
    }

    /// User signature stored in a new file's header and verified on
    /// reopen. The default [`ANY_SIGNATURE`] skips the check.
    pub fn signature(mut self, sig: u64) -> Self {
        self.signature = sig;
        self
    }

    /// Byte order for a new file's integer fields. On reopen an
    /// explicitly requested order must match the file's; left unset,
    /// the file's stored order is adopted.
    pub fn endianness(mut self, e: Endianness) -> Self {
        self.endianness = Some(e);
        self
    }

    /// User label stored in a new file's header (at most 31 bytes)
    pub fn label<S: Into<String>>(mut self, label: S) -> Self {
        self.label = label.into();
        self
    }
}
