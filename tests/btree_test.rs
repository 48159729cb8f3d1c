//! End-to-end scenarios driving `BTree` through a real file on disk,
//! exercising the split/merge/borrow paths that in-file unit tests cover
//! only piecemeal.
use beeftree::btree::{BTree, SearchResult};
use tempfile::NamedTempFile;

fn temp_path() -> std::path::PathBuf {
    NamedTempFile::new().unwrap().path().to_path_buf()
}

fn assert_present(tree: &mut BTree, key: i64) {
    assert!(
        matches!(tree.search(key).unwrap(), SearchResult::Found { .. }),
        "expected {key} to be present"
    );
}

fn assert_absent(tree: &mut BTree, key: i64) {
    assert_eq!(tree.search(key).unwrap(), SearchResult::NotFound);
}

#[test]
fn basic_split_at_small_capacity() {
    let mut tree = BTree::open(temp_path(), 3).unwrap();
    for key in [10, 20, 30, 40, 50, 60, 70] {
        tree.insert(key).unwrap();
    }
    for key in [10, 20, 30, 40, 50, 60, 70] {
        assert_present(&mut tree, key);
    }
    assert_absent(&mut tree, 15);
}

#[test]
fn root_grows_through_several_levels() {
    let mut tree = BTree::open(temp_path(), 5).unwrap();
    let keys: Vec<i64> = (1..=200).collect();
    for &key in &keys {
        tree.insert(key).unwrap();
    }
    for &key in &keys {
        assert_present(&mut tree, key);
    }
}

#[test]
fn delete_from_leaf_without_rebalance() {
    let mut tree = BTree::open(temp_path(), 5).unwrap();
    for key in 1..=5 {
        tree.insert(key).unwrap();
    }
    tree.delete(5).unwrap();
    assert_absent(&mut tree, 5);
    for key in 1..=4 {
        assert_present(&mut tree, key);
    }
}

#[test]
fn delete_internal_key_triggers_borrow() {
    let mut tree = BTree::open(temp_path(), 3).unwrap();
    for key in [10, 20, 30, 5, 15, 25, 35, 1] {
        tree.insert(key).unwrap();
    }
    // Deleting a key that sits in an internal node forces a successor
    // replacement and, depending on sibling occupancy, a borrow.
    tree.delete(20).unwrap();
    assert_absent(&mut tree, 20);
    for key in [10, 30, 5, 15, 25, 35, 1] {
        assert_present(&mut tree, key);
    }
}

#[test]
fn repeated_deletes_cascade_to_root_shrink() {
    let mut tree = BTree::open(temp_path(), 3).unwrap();
    let keys: Vec<i64> = (1..=20).collect();
    for &key in &keys {
        tree.insert(key).unwrap();
    }
    for &key in &keys {
        tree.delete(key).unwrap();
    }
    assert_absent(&mut tree, 1);
    assert_absent(&mut tree, 20);
}

#[test]
fn persists_across_process_boundary_with_random_keys() {
    let path = temp_path();
    let keys: Vec<i64> = (0..100).map(|i| (i * 977) % 10_007).collect();

    {
        let mut tree = BTree::open_with(&path, 4, 16, beeftree::storage::DEFAULT_PAGE_SIZE).unwrap();
        for &key in &keys {
            tree.insert(key).unwrap();
        }
        tree.close().unwrap();
    }
    {
        let mut tree = BTree::open_with(&path, 4, 16, beeftree::storage::DEFAULT_PAGE_SIZE).unwrap();
        for &key in &keys {
            assert_present(&mut tree, key);
        }
        for &key in &keys {
            tree.delete(key).unwrap();
        }
        for &key in &keys {
            assert_absent(&mut tree, key);
        }
    }
}
