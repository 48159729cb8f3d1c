//! Search, insert, and delete over pages managed by [`crate::storage`].
//!
//! Both mutating operations are proactive: `insert` splits every full node
//! it passes through on the way down, and `delete` tops up every
//! minimum-capacity node it passes through, so neither ever has to back up
//! and re-fix an ancestor.
use serde_json::json;
use tracing::{debug, info};

use crate::errors::{err, Error};
use crate::node::{Key, Node, PageId};
use crate::storage::{self, StorageManager, DEFAULT_MAX_CACHED_PAGES, DEFAULT_PAGE_SIZE};

/// One step of a search descent: the page visited and the index at which
/// the sought key would sit (or does sit) among that node's keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathStep {
    pub page_id: PageId,
    pub key_index: usize,
}

/// The outcome of a [`BTree::search`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchResult {
    Found { path: Vec<PathStep> },
    NotFound,
}

pub struct BTree {
    storage: StorageManager,
    max_keys_per_node: u32,
    root_page_id: Option<PageId>,
}

impl BTree {
    /// Opens (or creates) a database file, recovering `max_keys_per_node`
    /// and `root_page_id` from page 0's header when the file already holds
    /// one. `max_keys_per_node` is only consulted for a brand-new file.
    pub fn open<P: AsRef<std::path::Path>>(
        database_file_path: P,
        max_keys_per_node: u32,
    ) -> Result<Self, Error> {
        Self::open_with(
            database_file_path,
            max_keys_per_node,
            DEFAULT_MAX_CACHED_PAGES,
            DEFAULT_PAGE_SIZE,
        )
    }

    pub fn open_with<P: AsRef<std::path::Path>>(
        database_file_path: P,
        max_keys_per_node: u32,
        max_cached_pages: usize,
        page_size: usize,
    ) -> Result<Self, Error> {
        let path = database_file_path.as_ref();
        let header = storage::read_header_content(path, page_size)?;

        let (max_keys_per_node, root_page_id, next_page_id, fresh) =
            if storage::is_empty_content(&header) {
                (max_keys_per_node, None, 1u64, true)
            } else {
                let max_keys_per_node = header["max_keys_per_node"]
                    .as_u64()
                    .ok_or_else(|| err!(Storage, "header missing max_keys_per_node"))?
                    as u32;
                let root_page_id = header["root_page_id"].as_u64();
                let next_page_id = header["next_page_id"].as_u64().unwrap_or(1);
                (max_keys_per_node, root_page_id, next_page_id, false)
            };

        if max_keys_per_node < 3 {
            return Err(err!(
                Validation,
                "max_keys_per_node must be >= 3, got {}",
                max_keys_per_node
            ));
        }

        let storage = StorageManager::new(path, max_cached_pages, page_size, next_page_id.max(1))?;

        let mut tree = BTree {
            storage,
            max_keys_per_node,
            root_page_id,
        };
        if fresh {
            tree.write_header()?;
            info!(path = %path.display(), max_keys_per_node, "opened fresh database");
        } else {
            info!(path = %path.display(), max_keys_per_node, root_page_id = ?tree.root_page_id, "recovered database");
        }
        Ok(tree)
    }

    fn write_header(&mut self) -> Result<(), Error> {
        let header = json!({
            "max_keys_per_node": self.max_keys_per_node,
            "root_page_id": self.root_page_id,
            "next_page_id": self.storage.next_page_id(),
        });
        self.storage.store_page_content(0, header)
    }

    fn new_node(&self, is_leaf: bool) -> Result<Node, Error> {
        Node::new(self.max_keys_per_node, is_leaf)
    }

    fn load_required(&mut self, page_id: PageId) -> Result<Node, Error> {
        self.storage
            .load_node(page_id)?
            .ok_or_else(|| err!(Storage, "expected node at page {}, found none", page_id))
    }

    /// Finds `key`, returning the descent path from root to the node that
    /// holds it. `NotFound` otherwise — including on an empty tree.
    pub fn search(&mut self, key: Key) -> Result<SearchResult, Error> {
        let mut path = Vec::new();
        let mut current = match self.root_page_id {
            Some(id) => id,
            None => return Ok(SearchResult::NotFound),
        };

        loop {
            let node = self.load_required(current)?;
            let index = node.keys().partition_point(|&k| k < key);
            if index < node.keys().len() && node.keys()[index] == key {
                path.push(PathStep {
                    page_id: current,
                    key_index: index,
                });
                return Ok(SearchResult::Found { path });
            }
            path.push(PathStep {
                page_id: current,
                key_index: index,
            });
            if node.is_leaf() {
                return Ok(SearchResult::NotFound);
            }
            current = node.children()[index];
        }
    }

    /// Inserts `key`. Duplicates are preserved — this is a multiset, not a
    /// set — and land as additional entries rather than being collapsed.
    pub fn insert(&mut self, key: Key) -> Result<(), Error> {
        let root_id = match self.root_page_id {
            None => {
                let mut root = self.new_node(true)?;
                root.add_key(key);
                let page_id = self.storage.store_node(&mut root)?;
                self.root_page_id = Some(page_id);
                self.write_header()?;
                debug!(key, page_id, "created root leaf");
                return Ok(());
            }
            Some(id) => id,
        };

        let root = self.load_required(root_id)?;
        if root.is_full() {
            let mut new_root = self.new_node(false)?;
            new_root.add_child(root_id, 0);
            let new_root_id = self.storage.store_node(&mut new_root)?;
            self.root_page_id = Some(new_root_id);
            self.write_header()?;
            debug!(new_root_id, old_root = root_id, "grew tree height");
            self.split_full_child_of_parent(new_root_id, 0)?;
            self.insert_into_node_with_space(new_root_id, key)?;
        } else {
            self.insert_into_node_with_space(root_id, key)?;
        }
        Ok(())
    }

    /// Splits the full child at `child_index` of `parent_page_id`. The
    /// right sibling is stored first so it gets a stable page id before the
    /// parent's `children` array is updated to reference it.
    fn split_full_child_of_parent(
        &mut self,
        parent_page_id: PageId,
        child_index: usize,
    ) -> Result<(), Error> {
        let mut parent = self.load_required(parent_page_id)?;
        let child_page_id = parent.children()[child_index];
        let mut child = self.load_required(child_page_id)?;

        let (promoted_key, mut right_sibling) = child.split_into_two_nodes();

        let right_sibling_id = self.storage.store_node(&mut right_sibling)?;
        parent.keys_mut().insert(child_index, promoted_key);
        parent.add_child(right_sibling_id, child_index + 1);

        self.storage.store_node(&mut parent)?;
        self.storage.store_node(&mut child)?;
        // Re-store the right sibling: mirrors the reference implementation,
        // which re-saves it once more after the parent is updated.
        self.storage.store_node(&mut right_sibling)?;

        debug!(
            parent_page_id,
            child_page_id, right_sibling_id, promoted_key, "split full child"
        );
        Ok(())
    }

    /// Descends from `page_id` (known not full) inserting `key`, splitting
    /// any full child it is about to enter before descending into it.
    /// Duplicates are not special-cased: they descend alongside an equal
    /// existing key (bisect-left style) and are added as a second entry.
    fn insert_into_node_with_space(&mut self, page_id: PageId, key: Key) -> Result<(), Error> {
        let node = self.load_required(page_id)?;
        if node.is_leaf() {
            let mut node = node;
            node.add_key(key);
            self.storage.store_node(&mut node)?;
            return Ok(());
        }

        let child_index = node.keys().partition_point(|&k| k < key);
        let child_page_id = node.children()[child_index];
        let child = self.load_required(child_page_id)?;
        if child.is_full() {
            self.split_full_child_of_parent(page_id, child_index)?;
            // The split promoted a key into this node, shifting indices:
            // reload before deciding which (possibly new) child to descend
            // into, rather than reusing the now-stale `node`/`child_index`.
            let node = self.load_required(page_id)?;
            let child_index = node.keys().partition_point(|&k| k < key);
            let child_page_id = node.children()[child_index];
            self.insert_into_node_with_space(child_page_id, key)
        } else {
            self.insert_into_node_with_space(child_page_id, key)
        }
    }

    /// Deletes `key` if present. A missing key is a no-op.
    pub fn delete(&mut self, key: Key) -> Result<(), Error> {
        let root_id = match self.root_page_id {
            Some(id) => id,
            None => return Ok(()),
        };
        self.delete_recursively(root_id, key)?;

        let root = self.load_required(root_id)?;
        if !root.is_leaf() && root.keys().is_empty() {
            let new_root_id = root.children()[0];
            self.root_page_id = Some(new_root_id);
            self.write_header()?;
            debug!(new_root_id, old_root = root_id, "shrank tree height");
        }
        Ok(())
    }

    fn delete_recursively(&mut self, page_id: PageId, key: Key) -> Result<(), Error> {
        let mut node = self.load_required(page_id)?;
        let index = node.keys().partition_point(|&k| k < key);
        let found_here = index < node.keys().len() && node.keys()[index] == key;

        if node.is_leaf() {
            if found_here {
                node.keys_mut().remove(index);
                self.storage.store_node(&mut node)?;
                debug!(page_id, key, "deleted key from leaf");
            }
            return Ok(());
        }

        if found_here {
            // Replace with the in-order successor, then delete the
            // successor from the subtree it actually lives in.
            let successor_child = node.children()[index + 1];
            let successor = self.find_smallest_key_in_subtree(successor_child)?;
            node.keys_mut()[index] = successor;
            self.storage.store_node(&mut node)?;
            self.ensure_child_has_minimum_then_descend(page_id, index + 1, successor)?;
        } else {
            self.ensure_child_has_minimum_then_descend(page_id, index, key)?;
        }
        Ok(())
    }

    /// Tops up the child at `child_index` to more than the minimum key
    /// count (via borrow or merge) before descending into it, so deletion
    /// never needs to re-balance on the way back up.
    fn ensure_child_has_minimum_then_descend(
        &mut self,
        parent_page_id: PageId,
        child_index: usize,
        key: Key,
    ) -> Result<(), Error> {
        let mut parent = self.load_required(parent_page_id)?;
        let child = self.load_required(parent.children()[child_index])?;

        let next_index = if child.is_at_minimum_capacity() {
            let next_index = self.resolve_minimal_child(&mut parent, child_index)?;
            self.storage.store_node(&mut parent)?;
            next_index
        } else {
            child_index
        };

        let parent = self.load_required(parent_page_id)?;
        let next_page_id = parent.children()[next_index];
        self.delete_recursively(next_page_id, key)
    }

    /// Gives the minimum-capacity child at `child_index` an extra key,
    /// either by borrowing from a sibling or by merging with one. Mutates
    /// `parent` in place; the caller persists it. Returns the index the
    /// caller should now descend into — merging with the left sibling
    /// folds the child one slot to the left.
    fn resolve_minimal_child(
        &mut self,
        parent: &mut Node,
        child_index: usize,
    ) -> Result<usize, Error> {
        let has_left = child_index > 0;
        let has_right = child_index + 1 < parent.children().len();

        let left_has_spare = has_left && {
            let left = self.load_required(parent.children()[child_index - 1])?;
            left.has_more_than_minimum_keys()
        };
        let right_has_spare = has_right && {
            let right = self.load_required(parent.children()[child_index + 1])?;
            right.has_more_than_minimum_keys()
        };

        if left_has_spare {
            self.borrow_from_left_sibling(parent, child_index)?;
            Ok(child_index)
        } else if right_has_spare {
            self.borrow_from_right_sibling(parent, child_index)?;
            Ok(child_index)
        } else if has_left {
            self.merge_with_left_sibling(parent, child_index)?;
            Ok(child_index - 1)
        } else {
            self.merge_with_right_sibling(parent, child_index)?;
            Ok(child_index)
        }
    }

    fn borrow_from_left_sibling(&mut self, parent: &mut Node, child_index: usize) -> Result<(), Error> {
        let mut left = self.load_required(parent.children()[child_index - 1])?;
        let mut child = self.load_required(parent.children()[child_index])?;

        let separator = parent.keys()[child_index - 1];
        child.keys_mut().insert(0, separator);
        let borrowed_key = left.keys_mut().pop().unwrap();
        parent.keys_mut()[child_index - 1] = borrowed_key;

        if !left.is_leaf() {
            let moved_child = left.children_mut().pop().unwrap();
            child.children_mut().insert(0, moved_child);
        }

        self.storage.store_node(&mut left)?;
        self.storage.store_node(&mut child)?;
        debug!(child_page_id = child.page_id(), "borrowed from left sibling");
        Ok(())
    }

    fn borrow_from_right_sibling(&mut self, parent: &mut Node, child_index: usize) -> Result<(), Error> {
        let mut right = self.load_required(parent.children()[child_index + 1])?;
        let mut child = self.load_required(parent.children()[child_index])?;

        let separator = parent.keys()[child_index];
        child.keys_mut().push(separator);
        let borrowed_key = remove_first(right.keys_mut());
        parent.keys_mut()[child_index] = borrowed_key;

        if !right.is_leaf() {
            let moved_child = remove_first(right.children_mut());
            child.children_mut().push(moved_child);
        }

        self.storage.store_node(&mut right)?;
        self.storage.store_node(&mut child)?;
        debug!(child_page_id = child.page_id(), "borrowed from right sibling");
        Ok(())
    }

    fn merge_with_left_sibling(&mut self, parent: &mut Node, child_index: usize) -> Result<(), Error> {
        let left_page_id = parent.children()[child_index - 1];
        let mut left = self.load_required(left_page_id)?;
        let child = self.load_required(parent.children()[child_index])?;

        let separator = parent.keys_mut().remove(child_index - 1);
        parent.children_mut().remove(child_index);

        left.keys_mut().push(separator);
        left.keys_mut().extend(child.keys());
        if !left.is_leaf() {
            left.children_mut().extend(child.children());
        }

        self.storage.store_node(&mut left)?;
        debug!(left_page_id, "merged with left sibling");
        Ok(())
    }

    fn merge_with_right_sibling(&mut self, parent: &mut Node, child_index: usize) -> Result<(), Error> {
        let mut child = self.load_required(parent.children()[child_index])?;
        let right_page_id = parent.children()[child_index + 1];
        let right = self.load_required(right_page_id)?;

        let separator = parent.keys_mut().remove(child_index);
        parent.children_mut().remove(child_index + 1);

        child.keys_mut().push(separator);
        child.keys_mut().extend(right.keys());
        if !child.is_leaf() {
            child.children_mut().extend(right.children());
        }

        self.storage.store_node(&mut child)?;
        debug!(child_page_id = child.page_id(), "merged with right sibling");
        Ok(())
    }

    fn find_smallest_key_in_subtree(&mut self, page_id: PageId) -> Result<Key, Error> {
        let mut current = page_id;
        loop {
            let node = self.load_required(current)?;
            if node.is_leaf() {
                return node
                    .keys()
                    .first()
                    .copied()
                    .ok_or_else(|| err!(Storage, "leaf {} has no keys", current));
            }
            current = node.children()[0];
        }
    }

    /// Flushes all dirty pages and writes the final header. Safe to call
    /// more than once.
    pub fn close(&mut self) -> Result<(), Error> {
        self.write_header()?;
        self.storage.flush_all()?;
        info!(root_page_id = ?self.root_page_id, "closed database");
        Ok(())
    }
}

fn remove_first<T>(v: &mut Vec<T>) -> T {
    v.remove(0)
}

impl Drop for BTree {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn temp_path() -> std::path::PathBuf {
        NamedTempFile::new().unwrap().path().to_path_buf()
    }

    fn found_leaf_key(tree: &mut BTree, key: Key) -> bool {
        matches!(tree.search(key).unwrap(), SearchResult::Found { .. })
    }

    #[test]
    fn search_on_empty_tree_is_not_found() {
        let mut tree = BTree::open(temp_path(), 3).unwrap();
        assert_eq!(tree.search(1).unwrap(), SearchResult::NotFound);
    }

    #[test]
    fn insert_then_search_round_trips() {
        let mut tree = BTree::open(temp_path(), 3).unwrap();
        for k in [10, 20, 5, 40, 30] {
            tree.insert(k).unwrap();
        }
        for k in [10, 20, 5, 40, 30] {
            assert!(found_leaf_key(&mut tree, k), "missing {}", k);
        }
        assert!(!found_leaf_key(&mut tree, 999));
    }

    #[test]
    fn insert_splits_root_at_capacity_three() {
        let mut tree = BTree::open(temp_path(), 3).unwrap();
        for k in [10, 20, 30] {
            tree.insert(k).unwrap();
        }
        // Root is full after 3 keys at M=3; the 4th insert grows the tree.
        tree.insert(40).unwrap();
        assert_ne!(tree.root_page_id, Some(1));
        for k in [10, 20, 30, 40] {
            assert!(found_leaf_key(&mut tree, k));
        }
    }

    #[test]
    fn duplicate_insert_is_preserved_as_a_second_entry() {
        // Multiset semantics: inserting the same key repeatedly still
        // grows the node, eventually forcing a split purely on duplicates.
        let mut tree = BTree::open(temp_path(), 3).unwrap();
        for _ in 0..3 {
            tree.insert(7).unwrap();
        }
        assert!(found_leaf_key(&mut tree, 7));
        // A 4th insert of the same key must still trigger root growth,
        // the same as 4 distinct keys would at this capacity.
        tree.insert(7).unwrap();
        assert_ne!(tree.root_page_id, Some(1));
        assert!(found_leaf_key(&mut tree, 7));
    }

    #[test]
    fn insert_many_keeps_all_keys_searchable() {
        let mut tree = BTree::open(temp_path(), 4).unwrap();
        let keys: Vec<Key> = (0..200).map(|i| (i * 37) % 997).collect();
        for &k in &keys {
            tree.insert(k).unwrap();
        }
        for &k in &keys {
            assert!(found_leaf_key(&mut tree, k), "missing {}", k);
        }
    }

    #[test]
    fn delete_leaf_key() {
        let mut tree = BTree::open(temp_path(), 5).unwrap();
        for k in [1, 2, 3, 4, 5] {
            tree.insert(k).unwrap();
        }
        tree.delete(3).unwrap();
        assert!(!found_leaf_key(&mut tree, 3));
        for k in [1, 2, 4, 5] {
            assert!(found_leaf_key(&mut tree, k));
        }
    }

    #[test]
    fn delete_causing_borrow_and_merge_keeps_tree_consistent() {
        let mut tree = BTree::open(temp_path(), 3).unwrap();
        let keys: Vec<Key> = (1..=30).collect();
        for &k in &keys {
            tree.insert(k).unwrap();
        }
        for &k in &keys {
            tree.delete(k).unwrap();
            assert!(!found_leaf_key(&mut tree, k), "{} should be gone", k);
            for &remaining in keys.iter().filter(|&&x| x != k && x > k) {
                assert!(
                    found_leaf_key(&mut tree, remaining),
                    "{} should survive deleting {}",
                    remaining,
                    k
                );
            }
        }
        assert_eq!(tree.root_page_id, None);
    }

    #[test]
    fn delete_missing_key_is_a_no_op() {
        let mut tree = BTree::open(temp_path(), 4).unwrap();
        tree.insert(1).unwrap();
        tree.delete(999).unwrap();
        assert!(found_leaf_key(&mut tree, 1));
    }

    #[test]
    fn reopen_recovers_tree_and_header() {
        let path = temp_path();
        let keys: Vec<Key> = (0..100).map(|i| (i * 13) % 401).collect();
        {
            let mut tree = BTree::open_with(&path, 4, 8, DEFAULT_PAGE_SIZE).unwrap();
            for &k in &keys {
                tree.insert(k).unwrap();
            }
            tree.close().unwrap();
        }
        {
            let mut tree = BTree::open_with(&path, 4, 8, DEFAULT_PAGE_SIZE).unwrap();
            for &k in &keys {
                assert!(found_leaf_key(&mut tree, k), "missing {} after reopen", k);
            }
        }
    }

    #[test]
    fn rejects_small_capacity_on_fresh_open() {
        let err = BTree::open(temp_path(), 2).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
