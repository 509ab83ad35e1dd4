//! Ordered key-only containers: `BtreeSet` and `BtreeMultiset`.

use std::borrow::Borrow;
use std::fmt;
use std::ops::RangeBounds;
use std::path::Path;

use crate::btree::{RawRange, Tree, TreeShape};
use crate::buffer::BufferStats;
use crate::error::Result;
use crate::types::{Flags, Storable};
use crate::OpenOptions;

/// On-disk ordered set of unique keys
pub struct BtreeSet<K: Storable + Ord> {
    tree: Tree<K, ()>,
}

/// On-disk ordered set allowing duplicate keys
pub struct BtreeMultiset<K: Storable + Ord> {
    tree: Tree<K, ()>,
}

impl<K: Storable + Ord> fmt::Debug for BtreeMultiset<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtreeMultiset").field("tree", &self.tree).finish()
    }
}

/// Iterator over set elements in comparator order
pub struct SetIter<'a, K: Storable + Ord> {
    inner: RawRange<'a, K, ()>,
}

impl<'a, K: Storable + Ord> Iterator for SetIter<'a, K> {
    type Item = Result<K>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|r| r.map(|(k, ())| k))
    }
}

impl<'a, K: Storable + Ord> DoubleEndedIterator for SetIter<'a, K> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(|r| r.map(|(k, ())| k))
    }
}

macro_rules! common_set_api {
    ($name:ident) => {
        impl<K: Storable + Ord> $name<K> {
            /// Flush dirty pages and the header to disk
            pub fn flush(&mut self) -> Result<()> {
                self.tree.flush()
            }

            /// Flush and release the file. Further operations fail with
            /// `Error::Closed`; dropping the container closes implicitly.
            pub fn close(&mut self) -> Result<()> {
                self.tree.close()
            }

            pub fn is_open(&self) -> bool {
                self.tree.is_open()
            }

            pub fn path(&self) -> &Path {
                self.tree.path()
            }

            pub fn flags(&self) -> Flags {
                self.tree.flags()
            }

            pub fn read_only(&self) -> bool {
                self.tree.read_only()
            }

            /// User label recorded in the file header
            pub fn label(&self) -> &str {
                self.tree.label()
            }

            /// Number of elements
            pub fn len(&self) -> u64 {
                self.tree.len()
            }

            pub fn is_empty(&self) -> bool {
                self.tree.is_empty()
            }

            /// Theoretical element capacity of the file format
            pub fn max_size(&self) -> u64 {
                self.tree.max_size()
            }

            /// On-disk node size in bytes
            pub fn node_size(&self) -> usize {
                self.tree.node_size()
            }

            /// Levels in the tree; one for a lone root leaf
            pub fn levels(&self) -> usize {
                self.tree.levels()
            }

            pub fn max_cache_size(&self) -> Result<usize> {
                self.tree.max_cache_size()
            }

            pub fn set_max_cache_size(&self, nodes: usize) -> Result<()> {
                self.tree.set_max_cache_size(nodes)
            }

            pub fn set_max_cache_megabytes(&self, mb: usize) -> Result<()> {
                self.tree.set_max_cache_megabytes(mb)
            }

            /// Whether the streaming-insert pack optimization is still
            /// in effect
            pub fn ok_to_pack(&self) -> bool {
                self.tree.ok_to_pack()
            }

            /// Buffer-manager activity counters
            pub fn stats(&self) -> Result<BufferStats> {
                self.tree.statistics()
            }

            pub fn clear_stats(&self) -> Result<()> {
                self.tree.clear_statistics()
            }

            /// Structure of the tree for diagnostics
            pub fn shape(&self) -> Result<TreeShape> {
                self.tree.shape()
            }

            /// Smallest element
            pub fn first(&self) -> Result<Option<K>> {
                Ok(self.tree.begin_cursor()?.map(|c| c.key()))
            }

            /// Largest element
            pub fn last(&self) -> Result<Option<K>> {
                Ok(self.tree.last_cursor()?.map(|c| c.key()))
            }

            /// Stored key equal to `key`, if present
            pub fn get<Q>(&self, key: &Q) -> Result<Option<K>>
            where
                K: Borrow<Q>,
                Q: Ord + ?Sized,
            {
                Ok(self.tree.find_cursor(key)?.map(|c| c.key()))
            }

            pub fn contains<Q>(&self, key: &Q) -> Result<bool>
            where
                K: Borrow<Q>,
                Q: Ord + ?Sized,
            {
                Ok(self.tree.find_cursor(key)?.is_some())
            }

            /// Number of elements equal to `key`
            pub fn count<Q>(&self, key: &Q) -> Result<u64>
            where
                K: Borrow<Q>,
                Q: Ord + ?Sized,
            {
                self.tree.count(key)
            }

            /// First element not less than `key`
            pub fn lower_bound<Q>(&self, key: &Q) -> Result<Option<K>>
            where
                K: Borrow<Q>,
                Q: Ord + ?Sized,
            {
                Ok(self.tree.lower_bound_cursor(key)?.map(|c| c.key()))
            }

            /// First element greater than `key`
            pub fn upper_bound<Q>(&self, key: &Q) -> Result<Option<K>>
            where
                K: Borrow<Q>,
                Q: Ord + ?Sized,
            {
                Ok(self.tree.upper_bound_cursor(key)?.map(|c| c.key()))
            }

            /// Iterate all elements in order
            pub fn iter(&self) -> SetIter<'_, K> {
                SetIter {
                    inner: self
                        .tree
                        .range::<K>(std::ops::Bound::Unbounded, std::ops::Bound::Unbounded),
                }
            }

            /// Iterate the elements within `range`
            pub fn range<Q, R>(&self, range: R) -> SetIter<'_, K>
            where
                K: Borrow<Q>,
                Q: Ord + ?Sized,
                R: RangeBounds<Q>,
            {
                SetIter {
                    inner: self.tree.range(range.start_bound(), range.end_bound()),
                }
            }

            /// Iterate the elements equal to `key`
            pub fn equal_range<Q>(&self, key: &Q) -> SetIter<'_, K>
            where
                K: Borrow<Q>,
                Q: Ord + ?Sized,
            {
                SetIter {
                    inner: self.tree.range(
                        std::ops::Bound::Included(key),
                        std::ops::Bound::Included(key),
                    ),
                }
            }

            /// Erase the elements within `range`; returns the count
            pub fn remove_range<Q, R>(&mut self, range: R) -> Result<u64>
            where
                K: Borrow<Q>,
                Q: Ord + ?Sized,
                R: RangeBounds<Q>,
            {
                self.tree
                    .erase_range(range.start_bound(), range.end_bound())
            }

            /// Discard every element, keeping the container open
            pub fn clear(&mut self) -> Result<()> {
                self.tree.clear()
            }
        }

        impl<K: Storable + Ord> fmt::Display for $name<K> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.tree.fmt_summary(f, stringify!($name))
            }
        }
    };
}

common_set_api!(BtreeSet);
common_set_api!(BtreeMultiset);

impl<K: Storable + Ord> BtreeSet<K> {
    /// Open or create a unique-key set per `options`
    pub fn open(options: OpenOptions) -> Result<Self> {
        Ok(Self {
            tree: Tree::open(&options, true, true)?,
        })
    }

    /// Insert `key`; false (and no change) when already present
    pub fn insert(&mut self, key: K) -> Result<bool> {
        self.tree.insert_unique(key, ())
    }

    /// Insert every key from `keys`
    pub fn extend<I: IntoIterator<Item = K>>(&mut self, keys: I) -> Result<()> {
        for key in keys {
            self.insert(key)?;
        }
        Ok(())
    }

    /// Insert every element of `other`. Iterating `other` in order
    /// keeps the pack optimization live on a freshly created target.
    pub fn append_from(&mut self, other: &BtreeSet<K>) -> Result<()> {
        for key in other.iter() {
            self.insert(key?)?;
        }
        Ok(())
    }

    /// Erase `key`; true if it was present
    pub fn remove<Q>(&mut self, key: &Q) -> Result<bool>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        Ok(self.tree.erase_key(key)? != 0)
    }
}

impl<K: Storable + Ord> BtreeMultiset<K> {
    /// Open or create a duplicate-friendly set per `options`
    pub fn open(options: OpenOptions) -> Result<Self> {
        Ok(Self {
            tree: Tree::open(&options, false, true)?,
        })
    }

    /// Insert `key` after any existing equal keys
    pub fn insert(&mut self, key: K) -> Result<()> {
        self.tree.insert_non_unique(key, ())
    }

    /// Insert every key from `keys`
    pub fn extend<I: IntoIterator<Item = K>>(&mut self, keys: I) -> Result<()> {
        for key in keys {
            self.insert(key)?;
        }
        Ok(())
    }

    /// Insert every element of `other`
    pub fn append_from(&mut self, other: &BtreeMultiset<K>) -> Result<()> {
        for key in other.iter() {
            self.insert(key?)?;
        }
        Ok(())
    }

    /// Erase every element equal to `key`; returns the count
    pub fn remove<Q>(&mut self, key: &Q) -> Result<u64>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.tree.erase_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_set(dir: &tempfile::TempDir, name: &str) -> Result<BtreeSet<i32>> {
        BtreeSet::open(
            OpenOptions::new(dir.path().join(name))
                .read_write()
                .node_size(128),
        )
    }

    #[test]
    fn test_set_basic_operations() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut set = open_set(&dir, "s.bt")?;

        assert!(set.insert(5)?);
        assert!(set.insert(3)?);
        assert!(!set.insert(5)?);
        assert_eq!(set.len(), 2);
        assert!(set.contains(&3)?);
        assert!(!set.contains(&4)?);

        assert!(set.remove(&3)?);
        assert!(!set.remove(&3)?);
        assert_eq!(set.len(), 1);
        Ok(())
    }

    #[test]
    fn test_set_iteration_sorted() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut set = open_set(&dir, "s.bt")?;

        for k in [9, 1, 7, 3, 5] {
            set.insert(k)?;
        }
        let forward: Vec<i32> = set.iter().collect::<Result<_>>()?;
        assert_eq!(forward, vec![1, 3, 5, 7, 9]);

        let backward: Vec<i32> = set.iter().rev().collect::<Result<_>>()?;
        assert_eq!(backward, vec![9, 7, 5, 3, 1]);

        let mid: Vec<i32> = set.range(3..8).collect::<Result<_>>()?;
        assert_eq!(mid, vec![3, 5, 7]);
        Ok(())
    }

    #[test]
    fn test_set_bounds() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut set = open_set(&dir, "s.bt")?;
        set.extend([10, 20, 30])?;

        assert_eq!(set.lower_bound(&15)?, Some(20));
        assert_eq!(set.lower_bound(&20)?, Some(20));
        assert_eq!(set.upper_bound(&20)?, Some(30));
        assert_eq!(set.upper_bound(&30)?, None);
        assert_eq!(set.first()?, Some(10));
        assert_eq!(set.last()?, Some(30));
        Ok(())
    }

    #[test]
    fn test_multiset_duplicates() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut set = BtreeMultiset::open(
            OpenOptions::new(dir.path().join("m.bt"))
                .read_write()
                .node_size(128),
        )?;

        for k in [4, 4, 2, 4, 8] {
            set.insert(k)?;
        }
        assert_eq!(set.len(), 5);
        assert_eq!(set.count(&4)?, 3);

        let all: Vec<i32> = set.iter().collect::<Result<_>>()?;
        assert_eq!(all, vec![2, 4, 4, 4, 8]);

        assert_eq!(set.remove(&4)?, 3);
        assert_eq!(set.len(), 2);
        assert_eq!(set.count(&4)?, 0);
        Ok(())
    }

    #[test]
    fn test_set_reopen_round_trip() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.bt");
        {
            let mut set = BtreeSet::open(
                OpenOptions::new(&path)
                    .read_write()
                    .node_size(128)
                    .label("roundtrip"),
            )?;
            set.extend([2, 4, 6, 8])?;
        }
        let set = BtreeSet::<i32>::open(OpenOptions::new(&path))?;
        assert!(set.read_only());
        assert_eq!(set.len(), 4);
        assert_eq!(set.label(), "roundtrip");
        let all: Vec<i32> = set.iter().collect::<Result<_>>()?;
        assert_eq!(all, vec![2, 4, 6, 8]);
        Ok(())
    }

    #[test]
    fn test_set_kind_mismatch_on_reopen() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.bt");
        {
            let mut set = open_set(&dir, "s.bt")?;
            set.insert(1)?;
        }
        let err = BtreeMultiset::<i32>::open(OpenOptions::new(&path)).unwrap_err();
        assert!(matches!(err, crate::Error::KindMismatch { .. }));
        Ok(())
    }

    #[test]
    fn test_set_clear_keeps_open() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut set = open_set(&dir, "s.bt")?;
        set.extend(1..200)?;
        assert!(set.levels() > 1);

        set.clear()?;
        assert!(set.is_open());
        assert_eq!(set.len(), 0);
        assert_eq!(set.levels(), 1);
        assert!(set.insert(7)?);
        assert_eq!(set.first()?, Some(7));
        Ok(())
    }

    #[test]
    fn test_append_from_preserves_content() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut a = open_set(&dir, "a.bt")?;
        a.extend([3, 1, 2])?;

        let mut b = open_set(&dir, "b.bt")?;
        b.append_from(&a)?;
        let all: Vec<i32> = b.iter().collect::<Result<_>>()?;
        assert_eq!(all, vec![1, 2, 3]);
        assert!(b.ok_to_pack());
        Ok(())
    }
}
