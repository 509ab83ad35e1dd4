//! Property tests: arbitrary operation sequences checked key-by-key
//! against the in-memory ordered containers from std.

use std::collections::{BTreeMap, BTreeSet};

use btree_file::{BtreeMap as FileMap, BtreeMultiset, BtreeSet as FileSet, OpenOptions};
use proptest::prelude::*;

fn stress_options(path: std::path::PathBuf) -> OpenOptions {
    OpenOptions::new(path)
        .truncate()
        .node_size(128)
        .max_cache_size(0)
}

#[derive(Debug, Clone)]
enum Op {
    Insert(i16, u32),
    Remove(i16),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (any::<i16>(), any::<u32>()).prop_map(|(k, v)| Op::Insert(k, v)),
        1 => any::<i16>().prop_map(Op::Remove),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    // ordering, size consistency, and bulk equivalence for unique maps
    #[test]
    fn prop_map_matches_reference(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let dir = tempfile::tempdir().unwrap();
        let mut file_map: FileMap<i16, u32> =
            FileMap::open(stress_options(dir.path().join("p.bt"))).unwrap();
        let mut reference: BTreeMap<i16, u32> = BTreeMap::new();

        for op in &ops {
            match *op {
                Op::Insert(k, v) => {
                    let inserted = file_map.insert(k, v).unwrap();
                    let expected = !reference.contains_key(&k);
                    prop_assert_eq!(inserted, expected);
                    reference.entry(k).or_insert(v);
                }
                Op::Remove(k) => {
                    let removed = file_map.remove(&k).unwrap();
                    prop_assert_eq!(removed, reference.remove(&k).is_some());
                }
            }
        }

        prop_assert_eq!(file_map.len(), reference.len() as u64);
        let got: Vec<(i16, u32)> = file_map.iter().map(|r| r.unwrap()).collect();
        let want: Vec<(i16, u32)> = reference.iter().map(|(&k, &v)| (k, v)).collect();
        prop_assert_eq!(got, want);
    }

    // insert-find and erase-find for unique sets
    #[test]
    fn prop_set_insert_find_erase(keys in prop::collection::vec(any::<i16>(), 1..150)) {
        let dir = tempfile::tempdir().unwrap();
        let mut set: FileSet<i16> =
            FileSet::open(stress_options(dir.path().join("p.bt"))).unwrap();
        let mut reference: BTreeSet<i16> = BTreeSet::new();

        for &k in &keys {
            prop_assert_eq!(set.insert(k).unwrap(), reference.insert(k));
            prop_assert!(set.contains(&k).unwrap());
        }
        prop_assert_eq!(set.len(), reference.len() as u64);

        for &k in &keys {
            let had = reference.remove(&k);
            prop_assert_eq!(set.remove(&k).unwrap(), had);
            prop_assert!(!set.contains(&k).unwrap());
        }
        prop_assert!(set.is_empty());
    }

    // multiset counts: erase(k) removes exactly count(k) elements
    #[test]
    fn prop_multiset_counts(keys in prop::collection::vec(-20i16..20, 1..150)) {
        let dir = tempfile::tempdir().unwrap();
        let mut set: BtreeMultiset<i16> =
            BtreeMultiset::open(stress_options(dir.path().join("p.bt"))).unwrap();
        let mut reference: BTreeMap<i16, u64> = BTreeMap::new();

        for &k in &keys {
            set.insert(k).unwrap();
            *reference.entry(k).or_insert(0) += 1;
        }

        for k in -20i16..20 {
            let expected = reference.get(&k).copied().unwrap_or(0);
            prop_assert_eq!(set.count(&k).unwrap(), expected);
        }

        let mut remaining = keys.len() as u64;
        for k in -20i16..20 {
            let expected = reference.remove(&k).unwrap_or(0);
            prop_assert_eq!(set.remove(&k).unwrap(), expected);
            remaining -= expected;
            prop_assert_eq!(set.len(), remaining);
        }
    }

    // round-trip persistence: close and reopen yields an equal sequence
    #[test]
    fn prop_reopen_round_trip(keys in prop::collection::vec(any::<i16>(), 1..120)) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.bt");
        let mut want: Vec<i16>;
        {
            let mut set: FileSet<i16> =
                FileSet::open(stress_options(path.clone())).unwrap();
            for &k in &keys {
                set.insert(k).unwrap();
            }
            want = keys.clone();
            want.sort_unstable();
            want.dedup();
        }
        let set: FileSet<i16> = FileSet::open(OpenOptions::new(&path)).unwrap();
        prop_assert_eq!(set.len(), want.len() as u64);
        let got: Vec<i16> = set.iter().map(|r| r.unwrap()).collect();
        prop_assert_eq!(got, want);
    }

    // pack optimization: ordered and shuffled inserts build equal sets
    #[test]
    fn prop_pack_equivalence(keys in prop::collection::btree_set(any::<i16>(), 1..120)) {
        let dir = tempfile::tempdir().unwrap();
        let ordered_keys: Vec<i16> = keys.iter().copied().collect();
        let mut shuffled_keys = ordered_keys.clone();
        shuffled_keys.reverse();

        let mut a: FileSet<i16> =
            FileSet::open(stress_options(dir.path().join("a.bt"))).unwrap();
        for &k in &ordered_keys {
            a.insert(k).unwrap();
        }
        let mut b: FileSet<i16> =
            FileSet::open(stress_options(dir.path().join("b.bt"))).unwrap();
        for &k in &shuffled_keys {
            b.insert(k).unwrap();
        }

        let got_a: Vec<i16> = a.iter().map(|r| r.unwrap()).collect();
        let got_b: Vec<i16> = b.iter().map(|r| r.unwrap()).collect();
        prop_assert_eq!(got_a, got_b);
    }
}
