//! Ordered key/value containers: `BtreeMap` and `BtreeMultimap`.

use std::borrow::Borrow;
use std::fmt;
use std::ops::RangeBounds;
use std::path::Path;

use crate::btree::{RawRange, Tree, TreeShape};
use crate::buffer::BufferStats;
use crate::error::Result;
use crate::types::{Flags, Storable};
use crate::OpenOptions;

/// On-disk ordered map with unique keys
pub struct BtreeMap<K: Storable + Ord, V: Storable> {
    tree: Tree<K, V>,
}

impl<K: Storable + Ord, V: Storable> fmt::Debug for BtreeMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtreeMap").field("tree", &self.tree).finish()
    }
}

/// On-disk ordered map allowing duplicate keys
pub struct BtreeMultimap<K: Storable + Ord, V: Storable> {
    tree: Tree<K, V>,
}

/// Iterator over map entries in key order
pub struct MapIter<'a, K: Storable + Ord, V: Storable> {
    inner: RawRange<'a, K, V>,
}

impl<'a, K: Storable + Ord, V: Storable> Iterator for MapIter<'a, K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl<'a, K: Storable + Ord, V: Storable> DoubleEndedIterator for MapIter<'a, K, V> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back()
    }
}

macro_rules! common_map_api {
    ($name:ident) => {
        impl<K: Storable + Ord, V: Storable> $name<K, V> {
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

            /// Number of entries
            pub fn len(&self) -> u64 {
                self.tree.len()
            }

            pub fn is_empty(&self) -> bool {
                self.tree.is_empty()
            }

            /// Theoretical entry capacity of the file format
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

            /// Entry with the smallest key
            pub fn first(&self) -> Result<Option<(K, V)>> {
                Ok(self.tree.begin_cursor()?.map(|c| c.record()))
            }

            /// Entry with the largest key
            pub fn last(&self) -> Result<Option<(K, V)>> {
                Ok(self.tree.last_cursor()?.map(|c| c.record()))
            }

            /// Mapped value for `key`; the first match on a multimap
            pub fn get<Q>(&self, key: &Q) -> Result<Option<V>>
            where
                K: Borrow<Q>,
                Q: Ord + ?Sized,
            {
                Ok(self
                    .tree
                    .find_cursor(key)?
                    .map(|c| c.leaf().leaf_mapped(c.leaf_slot())))
            }

            pub fn contains<Q>(&self, key: &Q) -> Result<bool>
            where
                K: Borrow<Q>,
                Q: Ord + ?Sized,
            {
                Ok(self.tree.find_cursor(key)?.is_some())
            }

            /// Number of entries with key equal to `key`
            pub fn count<Q>(&self, key: &Q) -> Result<u64>
            where
                K: Borrow<Q>,
                Q: Ord + ?Sized,
            {
                self.tree.count(key)
            }

            /// First entry whose key is not less than `key`
            pub fn lower_bound<Q>(&self, key: &Q) -> Result<Option<(K, V)>>
            where
                K: Borrow<Q>,
                Q: Ord + ?Sized,
            {
                Ok(self.tree.lower_bound_cursor(key)?.map(|c| c.record()))
            }

            /// First entry whose key is greater than `key`
            pub fn upper_bound<Q>(&self, key: &Q) -> Result<Option<(K, V)>>
            where
                K: Borrow<Q>,
                Q: Ord + ?Sized,
            {
                Ok(self.tree.upper_bound_cursor(key)?.map(|c| c.record()))
            }

            /// Iterate all entries in key order
            pub fn iter(&self) -> MapIter<'_, K, V> {
                MapIter {
                    inner: self
                        .tree
                        .range::<K>(std::ops::Bound::Unbounded, std::ops::Bound::Unbounded),
                }
            }

            /// Iterate the entries whose keys fall within `range`
            pub fn range<Q, R>(&self, range: R) -> MapIter<'_, K, V>
            where
                K: Borrow<Q>,
                Q: Ord + ?Sized,
                R: RangeBounds<Q>,
            {
                MapIter {
                    inner: self.tree.range(range.start_bound(), range.end_bound()),
                }
            }

            /// Iterate the entries with key equal to `key`, in insertion
            /// order for a multimap
            pub fn equal_range<Q>(&self, key: &Q) -> MapIter<'_, K, V>
            where
                K: Borrow<Q>,
                Q: Ord + ?Sized,
            {
                MapIter {
                    inner: self.tree.range(
                        std::ops::Bound::Included(key),
                        std::ops::Bound::Included(key),
                    ),
                }
            }

            /// Overwrite the mapped value of an existing entry in place,
            /// marking its leaf dirty; false when the key is absent
            pub fn update<Q>(&mut self, key: &Q, value: V) -> Result<bool>
            where
                K: Borrow<Q>,
                Q: Ord + ?Sized,
            {
                self.tree.update_mapped(key, value)
            }

            /// Erase the entries whose keys fall within `range`; returns
            /// the count
            pub fn remove_range<Q, R>(&mut self, range: R) -> Result<u64>
            where
                K: Borrow<Q>,
                Q: Ord + ?Sized,
                R: RangeBounds<Q>,
            {
                self.tree
                    .erase_range(range.start_bound(), range.end_bound())
            }

            /// Discard every entry, keeping the container open
            pub fn clear(&mut self) -> Result<()> {
                self.tree.clear()
            }
        }

        impl<K: Storable + Ord, V: Storable> fmt::Display for $name<K, V> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.tree.fmt_summary(f, stringify!($name))
            }
        }
    };
}

common_map_api!(BtreeMap);
common_map_api!(BtreeMultimap);

impl<K: Storable + Ord, V: Storable> BtreeMap<K, V> {
    /// Open or create a unique-key map per `options`
    pub fn open(options: OpenOptions) -> Result<Self> {
        Ok(Self {
            tree: Tree::open(&options, true, false)?,
        })
    }

    /// Insert an entry; false (and no change, not even to the mapped
    /// value) when the key is already present
    pub fn insert(&mut self, key: K, value: V) -> Result<bool> {
        self.tree.insert_unique(key, value)
    }

    /// Insert every entry from `entries`
    pub fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, entries: I) -> Result<()> {
        for (key, value) in entries {
            self.insert(key, value)?;
        }
        Ok(())
    }

    /// Insert every entry of `other`
    pub fn append_from(&mut self, other: &BtreeMap<K, V>) -> Result<()> {
        for entry in other.iter() {
            let (key, value) = entry?;
            self.insert(key, value)?;
        }
        Ok(())
    }

    /// Erase the entry for `key`; true if it was present
    pub fn remove<Q>(&mut self, key: &Q) -> Result<bool>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        Ok(self.tree.erase_key(key)? != 0)
    }
}

impl<K: Storable + Ord, V: Storable> BtreeMultimap<K, V> {
    /// Open or create a duplicate-friendly map per `options`
    pub fn open(options: OpenOptions) -> Result<Self> {
        Ok(Self {
            tree: Tree::open(&options, false, false)?,
        })
    }

    /// Insert an entry after any existing entries with an equal key
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        self.tree.insert_non_unique(key, value)
    }

    /// Insert every entry from `entries`
    pub fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, entries: I) -> Result<()> {
        for (key, value) in entries {
            self.insert(key, value)?;
        }
        Ok(())
    }

    /// Insert every entry of `other`
    pub fn append_from(&mut self, other: &BtreeMultimap<K, V>) -> Result<()> {
        for entry in other.iter() {
            let (key, value) = entry?;
            self.insert(key, value)?;
        }
        Ok(())
    }

    /// Erase every entry with key equal to `key`; returns the count
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

    fn open_map(dir: &tempfile::TempDir, name: &str) -> Result<BtreeMap<i32, u64>> {
        BtreeMap::open(
            OpenOptions::new(dir.path().join(name))
                .read_write()
                .node_size(128),
        )
    }

    #[test]
    fn test_map_basic_operations() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut map = open_map(&dir, "m.bt")?;

        assert!(map.insert(1, 100)?);
        assert!(map.insert(2, 200)?);
        assert!(!map.insert(1, 999)?);
        assert_eq!(map.get(&1)?, Some(100)); // unique insert never overwrites
        assert_eq!(map.get(&3)?, None);

        assert!(map.update(&1, 111)?);
        assert_eq!(map.get(&1)?, Some(111));
        assert!(!map.update(&9, 9)?);

        assert!(map.remove(&1)?);
        assert_eq!(map.get(&1)?, None);
        Ok(())
    }

    #[test]
    fn test_map_iteration_and_range() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut map = open_map(&dir, "m.bt")?;
        for k in [5, 1, 4, 2, 3] {
            map.insert(k, k as u64 * 10)?;
        }

        let all: Vec<(i32, u64)> = map.iter().collect::<Result<_>>()?;
        assert_eq!(all, vec![(1, 10), (2, 20), (3, 30), (4, 40), (5, 50)]);

        let mid: Vec<(i32, u64)> = map.range(2..=4).collect::<Result<_>>()?;
        assert_eq!(mid, vec![(2, 20), (3, 30), (4, 40)]);

        let back: Vec<(i32, u64)> = map.iter().rev().take(2).collect::<Result<_>>()?;
        assert_eq!(back, vec![(5, 50), (4, 40)]);
        Ok(())
    }

    #[test]
    fn test_multimap_insertion_order_of_duplicates() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut map = BtreeMultimap::open(
            OpenOptions::new(dir.path().join("mm.bt"))
                .read_write()
                .node_size(128),
        )?;

        for i in 1..=4u64 {
            map.insert(7, i)?;
        }
        map.insert(5, 0)?;

        // equal keys come back in insertion order
        let sevens: Vec<(i32, u64)> = map.equal_range(&7).collect::<Result<_>>()?;
        assert_eq!(sevens, vec![(7, 1), (7, 2), (7, 3), (7, 4)]);
        assert_eq!(map.count(&7)?, 4);
        assert_eq!(map.get(&7)?, Some(1));

        assert_eq!(map.remove(&7)?, 4);
        assert_eq!(map.len(), 1);
        Ok(())
    }

    #[test]
    fn test_map_reopen_and_size_mismatch() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.bt");
        {
            let mut map = open_map(&dir, "m.bt")?;
            map.insert(1, 10)?;
        }
        // same kinds, different mapped width
        let err = BtreeMap::<i32, u32>::open(OpenOptions::new(&path)).unwrap_err();
        assert!(matches!(err, crate::Error::SizeMismatch { .. }));

        let map = BtreeMap::<i32, u64>::open(OpenOptions::new(&path))?;
        assert_eq!(map.get(&1)?, Some(10));
        Ok(())
    }

    #[test]
    fn test_map_read_only_rejects_mutation() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.bt");
        {
            let mut map = open_map(&dir, "m.bt")?;
            map.insert(1, 10)?;
        }
        let mut map = BtreeMap::<i32, u64>::open(OpenOptions::new(&path))?;
        assert!(matches!(
            map.insert(2, 20),
            Err(crate::Error::ReadOnly)
        ));
        assert!(matches!(map.remove(&1), Err(crate::Error::ReadOnly)));
        assert_eq!(map.get(&1)?, Some(10));
        Ok(())
    }

    #[test]
    fn test_map_closed_rejects_everything() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut map = open_map(&dir, "m.bt")?;
        map.insert(1, 10)?;
        map.close()?;

        assert!(!map.is_open());
        assert!(matches!(map.get(&1), Err(crate::Error::Closed)));
        assert!(matches!(map.insert(2, 20), Err(crate::Error::Closed)));
        Ok(())
    }

    #[test]
    fn test_map_remove_range() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut map = open_map(&dir, "m.bt")?;
        map.extend((1..=10).map(|k| (k, k as u64)))?;

        assert_eq!(map.remove_range(3..7)?, 4);
        let keys: Vec<i32> = map.iter().map(|r| r.map(|(k, _)| k)).collect::<Result<_>>()?;
        assert_eq!(keys, vec![1, 2, 7, 8, 9, 10]);
        Ok(())
    }
}
