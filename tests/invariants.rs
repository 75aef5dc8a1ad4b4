//! Property-based checks for a handful of the quantified invariants,
//! driven entirely through the public `BPlusTree` API.

use std::collections::BTreeSet;

use bptreedb::{BPlusTree, TreeConfig};
use proptest::prelude::*;

fn open_tree(dir: &tempfile::TempDir, name: &str) -> BPlusTree<i32, i32> {
    let cfg = TreeConfig {
        filename: dir.path().join(name).to_str().unwrap().to_owned(),
        b_size: 5,
        auto_tune: false,
        use_redo: false,
        ..TreeConfig::default()
    };
    let tree = BPlusTree::new(cfg);
    tree.open().unwrap();
    tree
}

proptest! {
    /// Invariant 4: iterating from the low leaf yields exactly `len()`
    /// entries in strictly ascending order.
    #[test]
    fn iteration_is_ascending_and_complete(keys in prop::collection::hash_set(-500i32..500, 0..60)) {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir, "prop_iter");
        for &k in &keys {
            tree.put(k, k).unwrap();
        }

        let collected: Vec<i32> = tree.iter().map(|(k, _)| k).collect();
        let expected: Vec<i32> = keys.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        prop_assert_eq!(collected.len(), tree.len().unwrap());
        prop_assert_eq!(&collected, &expected);
        prop_assert!(collected.windows(2).all(|w| w[0] < w[1]));

        tree.close().unwrap();
    }

    /// Invariant 7: re-putting an existing key updates the value in place
    /// without changing the element count.
    #[test]
    fn repeated_put_updates_without_growing_len(key in -1000i32..1000, v1 in -1000i32..1000, v2 in -1000i32..1000) {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir, "prop_update");
        tree.put(key, v1).unwrap();
        let len_before = tree.len().unwrap();
        tree.put(key, v2).unwrap();
        prop_assert_eq!(tree.get(&key).unwrap(), Some(v2));
        prop_assert_eq!(tree.len().unwrap(), len_before);
        tree.close().unwrap();
    }

    /// Invariant 8: inserting then removing a key returns the tree to
    /// empty.
    #[test]
    fn put_then_remove_returns_to_empty(key in -1000i32..1000, value in -1000i32..1000) {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir, "prop_put_remove");
        tree.put(key, value).unwrap();
        prop_assert!(tree.remove(&key).unwrap());
        prop_assert_eq!(tree.get(&key).unwrap(), None);
        prop_assert_eq!(tree.len().unwrap(), 0);
        tree.close().unwrap();
    }
}
