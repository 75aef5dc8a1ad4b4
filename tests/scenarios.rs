//! End-to-end scenarios exercising `BPlusTree` through its public API only.

use bptreedb::{BPlusTree, TreeConfig};

fn small_order_cfg(dir: &tempfile::TempDir, name: &str) -> TreeConfig {
    TreeConfig {
        filename: dir.path().join(name).to_str().unwrap().to_owned(),
        b_size: 5,
        auto_tune: false,
        use_redo: true,
        ..TreeConfig::default()
    }
}

#[test]
fn ordered_insertion_and_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let tree: BPlusTree<i32, i32> = BPlusTree::new(small_order_cfg(&dir, "scenario1"));
    tree.open().unwrap();

    let keys = [5, 7, -11, 111, 0];
    let values = [0, 1, 2, 3, 4];
    for (k, v) in keys.into_iter().zip(values) {
        tree.put(k, v).unwrap();
    }
    tree.sync().unwrap();

    assert_eq!(tree.get(&7).unwrap(), Some(1));
    assert!(tree.remove(&7).unwrap());

    let remaining: Vec<(i32, i32)> = tree.iter().collect();
    assert_eq!(remaining, vec![(-11, 2), (0, 4), (5, 0), (111, 3)]);

    assert_eq!(tree.first_key().unwrap(), Some(-11));
    assert_eq!(tree.last_key().unwrap(), Some(111));

    tree.close().unwrap();
}

#[test]
fn split_cascade_with_order_five() {
    let dir = tempfile::tempdir().unwrap();
    let tree: BPlusTree<i32, i32> = BPlusTree::new(small_order_cfg(&dir, "scenario2"));
    tree.open().unwrap();

    for k in 1..20 {
        tree.put(k, k).unwrap();
    }

    assert!(tree.height().unwrap() >= 2);
    let collected: Vec<i32> = tree.iter().map(|(k, _)| k).collect();
    assert_eq!(collected, (1..20).collect::<Vec<_>>());

    tree.close().unwrap();
}

#[test]
fn merge_cascade_after_split() {
    let dir = tempfile::tempdir().unwrap();
    let tree: BPlusTree<i32, i32> = BPlusTree::new(small_order_cfg(&dir, "scenario3"));
    tree.open().unwrap();

    for k in 1..20 {
        tree.put(k, k).unwrap();
    }
    for k in 1..15 {
        tree.remove(&k).unwrap();
    }

    assert_eq!(tree.height().unwrap(), 1);
    assert_eq!(tree.len().unwrap(), 5);
    let first = tree.first_key().unwrap().unwrap();
    let last = tree.last_key().unwrap().unwrap();
    // `low_id == high_id`: a single remaining leaf holds every entry.
    assert_eq!(tree.ceiling_key(&first).unwrap(), Some(first));
    assert_eq!(tree.floor_key(&last).unwrap(), Some(last));

    tree.close().unwrap();
}

#[test]
fn crash_recovery_replays_redo_after_an_unclean_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = TreeConfig {
        filename: dir.path().join("scenario4").to_str().unwrap().to_owned(),
        use_redo: true,
        ..TreeConfig::default()
    };

    {
        let tree: BPlusTree<i32, i32> = BPlusTree::new(cfg.clone());
        tree.open().unwrap();
        for k in 0..1000 {
            tree.put(k, k).unwrap();
        }
        tree.sync().unwrap();
        for k in 1000..1100 {
            tree.put(k, k).unwrap();
        }
        // Simulate a crash: drop without calling `close`, so the metadata
        // block is left with the unclean flag set and the redo log still
        // holds the 100 records appended after the last sync.
        drop(tree);
    }

    let reopened: BPlusTree<i32, i32> = BPlusTree::new(cfg.clone());
    let open_err = reopened.open().unwrap_err();
    assert!(matches!(open_err, bptreedb::TreeError::InvalidData(_)));

    reopened.recovery().unwrap();
    reopened.open().unwrap();
    for k in 0..1100 {
        assert_eq!(reopened.get(&k).unwrap(), Some(k));
    }
    assert_eq!(reopened.len().unwrap(), 1100);
    reopened.close().unwrap();
}

#[test]
fn free_block_reuse_caps_file_growth() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = small_order_cfg(&dir, "scenario5");
    let tree: BPlusTree<i32, i32> = BPlusTree::new(cfg.clone());
    tree.open().unwrap();

    for k in 0..10_000 {
        tree.put(k, k).unwrap();
    }
    tree.sync().unwrap();
    let high_water = std::fs::metadata(format!("{}.data", cfg.filename))
        .unwrap()
        .len();

    for k in 0..5_000 {
        tree.remove(&k).unwrap();
    }
    tree.sync().unwrap();

    // Re-inserting roughly as many fresh keys as were just freed should be
    // satisfied out of the free-block bitmap rather than growing the file
    // past the high-water mark it already reached.
    for k in 20_000..24_000 {
        tree.put(k, k).unwrap();
    }
    tree.sync().unwrap();
    let after_reuse = std::fs::metadata(format!("{}.data", cfg.filename))
        .unwrap()
        .len();
    assert!(after_reuse <= high_water);

    tree.close().unwrap();
}

#[test]
fn endpoint_probes() {
    let dir = tempfile::tempdir().unwrap();
    let tree: BPlusTree<i32, i32> = BPlusTree::new(small_order_cfg(&dir, "scenario6"));
    tree.open().unwrap();

    for k in [5, 7, -11, 111, 0] {
        tree.put(k, k).unwrap();
    }
    tree.remove(&7).unwrap();

    assert_eq!(tree.ceiling_key(&4).unwrap(), Some(5));
    assert_eq!(tree.floor_key(&4).unwrap(), Some(0));
    assert_eq!(tree.higher_key(&5).unwrap(), Some(111));
    assert_eq!(tree.lower_key(&5).unwrap(), Some(0));
    assert_eq!(tree.ceiling_key(&1000).unwrap(), None);
    assert_eq!(tree.floor_key(&-1000).unwrap(), None);

    tree.close().unwrap();
}
