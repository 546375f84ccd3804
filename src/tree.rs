//! Search, insert, and delete over the page store.
//!
//! No page is ever cached across calls: every level of recursion reads the
//! node it needs from the [`Pager`] and writes back whatever it changed.
//! Splits build the full, temporarily-overfull sequence of entries before
//! cutting it in half, and deletes track an explicit root-to-leaf path
//! rather than re-deriving it from keys, since coalescing can empty an
//! ancestor's key list before the recursion reaches it.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::Error;
use crate::node::{Key, Node, Value};
use crate::page::{
    cut, internal_min_occupancy, leaf_min_occupancy, PageOffset, INTERNAL_KEY_CAPACITY,
    INTERNAL_ORDER, LEAF_CAPACITY, LEAF_ORDER,
};
use crate::pager::Pager;

/// Which neighbor donates an entry during redistribution.
#[derive(Clone, Copy)]
enum Side {
    Left,
    Right,
}

/// A B+ tree index mapping 8-byte integer keys to 120-byte value payloads,
/// backed by a single file.
pub struct BPlusTree {
    pager: Pager,
}

impl BPlusTree {
    /// Open (creating and formatting if necessary) the index file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let pager = Pager::open(path)?;
        info!(root = pager.header()?.root.raw(), "opened index");
        Ok(BPlusTree { pager })
    }

    /// Look up `key`, returning its value if present.
    pub fn find(&self, key: Key) -> Result<Option<Value>, Error> {
        let header = self.pager.header()?;
        if header.root.is_none() {
            return Ok(None);
        }
        let leaf_off = self.find_leaf(header.root, key)?;
        let leaf = self.pager.read_node(leaf_off)?;
        Ok(leaf.find_key_index(key).ok().map(|i| leaf.leaf_value(i)))
    }

    /// Insert `key` with `value`. Fails with [`Error::DuplicateKey`] if the
    /// key is already present.
    pub fn insert(&mut self, key: Key, value: Value) -> Result<(), Error> {
        let header = self.pager.header()?;
        if header.root.is_none() {
            let mut leaf = Node::new_leaf();
            leaf.leaf_insert_at(0, key, &value);
            let page = self.pager.allocate_page()?;
            self.pager.write_node(page, &leaf)?;
            self.pager.set_root(page)?;
            info!(key, "inserted first key, created root leaf");
            return Ok(());
        }

        let leaf_off = self.find_leaf(header.root, key)?;
        let mut leaf = self.pager.read_node(leaf_off)?;
        let idx = match leaf.find_key_index(key) {
            Ok(_) => return Err(Error::DuplicateKey { key }),
            Err(idx) => idx,
        };

        if !leaf.is_leaf_full() {
            leaf.leaf_insert_at(idx, key, &value);
            self.pager.write_node(leaf_off, &leaf)?;
            debug!(key, leaf = leaf_off.raw(), "inserted into leaf");
            return Ok(());
        }

        self.split_full_leaf(leaf_off, leaf, idx, key, value)
    }

    /// Remove `key`. Fails with [`Error::NotFound`] if it is not present.
    pub fn delete(&mut self, key: Key) -> Result<(), Error> {
        let header = self.pager.header()?;
        if header.root.is_none() {
            return Err(Error::NotFound { key });
        }
        let path = self.find_path(header.root, key)?;
        let leaf_off = *path.last().unwrap();
        let mut leaf = self.pager.read_node(leaf_off)?;
        let idx = leaf.find_key_index(key).map_err(|_| Error::NotFound { key })?;
        leaf.leaf_remove_at(idx);
        self.pager.write_node(leaf_off, &leaf)?;
        debug!(key, leaf = leaf_off.raw(), "removed from leaf");
        self.delete_entry(path)
    }

    /// Flush the backing file to stable storage.
    pub fn sync(&self) -> Result<(), Error> {
        self.pager.sync()
    }

    // ---- search --------------------------------------------------------

    fn find_leaf(&self, root: PageOffset, key: Key) -> Result<PageOffset, Error> {
        let mut cur = root;
        loop {
            let node = self.pager.read_node(cur)?;
            if node.is_leaf() {
                return Ok(cur);
            }
            cur = node.internal_child(node.find_child_index(key));
        }
    }

    /// Like [`Self::find_leaf`] but records every page visited, root first.
    fn find_path(&self, root: PageOffset, key: Key) -> Result<Vec<PageOffset>, Error> {
        let mut path = vec![root];
        loop {
            let cur = *path.last().unwrap();
            let node = self.pager.read_node(cur)?;
            if node.is_leaf() {
                return Ok(path);
            }
            path.push(node.internal_child(node.find_child_index(key)));
        }
    }

    fn set_node_parent(&mut self, child: PageOffset, parent: PageOffset) -> Result<(), Error> {
        let mut node = self.pager.read_node(child)?;
        node.set_parent(parent);
        self.pager.write_node(child, &node)
    }

    fn child_index_in_parent(&self, parent: &Node, child: PageOffset) -> Result<usize, Error> {
        for i in 0..=parent.num_keys() {
            if parent.internal_child(i).raw() == child.raw() {
                return Ok(i);
            }
        }
        let message = "child not found among its recorded parent's children";
        warn!(offset = child.raw(), message, "corruption detected");
        Err(Error::Corruption {
            offset: child.raw(),
            message: message.to_string(),
        })
    }

    // ---- insert ----------------------------------------------------------

    /// `leaf` at `leaf_off` is full; form the full 32-entry sorted sequence
    /// including the newcomer, then split it evenly.
    fn split_full_leaf(
        &mut self,
        leaf_off: PageOffset,
        leaf: Node,
        idx: usize,
        key: Key,
        value: Value,
    ) -> Result<(), Error> {
        let mut entries: Vec<(Key, Value)> = (0..LEAF_CAPACITY).map(|i| leaf.leaf_entry(i)).collect();
        entries.insert(idx, (key, value));
        debug_assert_eq!(entries.len(), LEAF_ORDER);

        let split_at = cut(LEAF_ORDER);
        let old_sibling = leaf.sibling();
        let parent = leaf.parent();

        let new_page = self.pager.allocate_page()?;

        let mut left = Node::new_leaf();
        left.set_parent(parent);
        for (i, (k, v)) in entries[..split_at].iter().enumerate() {
            left.leaf_insert_at(i, *k, v);
        }
        left.set_sibling(new_page);

        let mut right = Node::new_leaf();
        right.set_parent(parent);
        for (i, (k, v)) in entries[split_at..].iter().enumerate() {
            right.leaf_insert_at(i, *k, v);
        }
        right.set_sibling(old_sibling);

        let separator = right.leaf_key(0);
        self.pager.write_node(leaf_off, &left)?;
        self.pager.write_node(new_page, &right)?;
        debug!(leaf = leaf_off.raw(), new_leaf = new_page.raw(), separator, "split leaf");

        self.insert_into_parent(parent, leaf_off, separator, new_page)
    }

    /// Insert `(separator, right_off)` into `parent_off`'s entries so that
    /// `right_off` becomes `left_off`'s right-hand sibling. `parent_off` may
    /// be [`PageOffset::NONE`] when `left_off` was the root.
    fn insert_into_parent(
        &mut self,
        parent_off: PageOffset,
        left_off: PageOffset,
        separator: Key,
        right_off: PageOffset,
    ) -> Result<(), Error> {
        if parent_off.is_none() {
            let mut root = Node::new_internal();
            root.set_leftmost_child(left_off);
            root.internal_insert_at(0, separator, right_off);
            let page = self.pager.allocate_page()?;
            self.pager.write_node(page, &root)?;
            self.pager.set_root(page)?;
            self.set_node_parent(left_off, page)?;
            self.set_node_parent(right_off, page)?;
            info!(new_root = page.raw(), "created new root");
            return Ok(());
        }

        let mut parent = self.pager.read_node(parent_off)?;
        let idx = parent.find_child_index(separator);

        if !parent.is_internal_full() {
            parent.internal_insert_at(idx, separator, right_off);
            self.pager.write_node(parent_off, &parent)?;
            self.set_node_parent(right_off, parent_off)?;
            return Ok(());
        }

        self.split_full_internal(parent_off, parent, idx, separator, right_off)
    }

    /// `parent` at `parent_off` is full; form the full 249-key/250-child
    /// hypothetical sequence including the newcomer, then split it at
    /// `cut(INTERNAL_ORDER)`, promoting the middle key to the grandparent.
    fn split_full_internal(
        &mut self,
        parent_off: PageOffset,
        parent: Node,
        idx: usize,
        key: Key,
        right_child: PageOffset,
    ) -> Result<(), Error> {
        let mut children: Vec<PageOffset> =
            (0..=parent.num_keys()).map(|i| parent.internal_child(i)).collect();
        let mut keys: Vec<Key> = (0..parent.num_keys()).map(|i| parent.internal_key(i)).collect();
        keys.insert(idx, key);
        children.insert(idx + 1, right_child);
        debug_assert_eq!(keys.len(), INTERNAL_ORDER);
        debug_assert_eq!(children.len(), INTERNAL_ORDER + 1);

        let split_at = cut(INTERNAL_ORDER);
        let promoted = keys[split_at - 1];
        let grandparent = parent.parent();

        let new_page = self.pager.allocate_page()?;

        let mut left = Node::new_internal();
        left.set_parent(grandparent);
        left.set_leftmost_child(children[0]);
        for (i, k) in keys[..split_at - 1].iter().enumerate() {
            left.internal_insert_at(i, *k, children[i + 1]);
        }

        let mut right = Node::new_internal();
        right.set_parent(grandparent);
        right.set_leftmost_child(children[split_at]);
        for (i, k) in keys[split_at..].iter().enumerate() {
            right.internal_insert_at(i, *k, children[split_at + i + 1]);
        }

        self.pager.write_node(parent_off, &left)?;
        self.pager.write_node(new_page, &right)?;
        debug!(
            parent = parent_off.raw(),
            new_internal = new_page.raw(),
            promoted,
            "split internal node"
        );

        for &child in &children[..split_at] {
            self.set_node_parent(child, parent_off)?;
        }
        for &child in &children[split_at..] {
            self.set_node_parent(child, new_page)?;
        }

        self.insert_into_parent(grandparent, parent_off, promoted, new_page)
    }

    // ---- delete ------------------------------------------------------

    /// `path` ends at the node that was just shrunk by one entry (a leaf on
    /// the first call, an ancestor on recursive calls after a coalesce).
    fn delete_entry(&mut self, mut path: Vec<PageOffset>) -> Result<(), Error> {
        let node_off = *path.last().unwrap();
        let header = self.pager.header()?;

        if header.root.raw() == node_off.raw() {
            return self.adjust_root(node_off);
        }

        let node = self.pager.read_node(node_off)?;
        let min_occupancy = if node.is_leaf() {
            leaf_min_occupancy()
        } else {
            internal_min_occupancy()
        };
        if node.num_keys() >= min_occupancy {
            return Ok(());
        }

        let parent_off = path[path.len() - 2];
        let parent = self.pager.read_node(parent_off)?;
        let my_idx = self.child_index_in_parent(&parent, node_off)?;

        let (left_off, right_off, sep_idx, donor) = if my_idx > 0 {
            (parent.internal_child(my_idx - 1), node_off, my_idx - 1, Side::Left)
        } else {
            (node_off, parent.internal_child(1), 0, Side::Right)
        };
        let left = self.pager.read_node(left_off)?;
        let right = self.pager.read_node(right_off)?;

        let capacity = if node.is_leaf() { LEAF_CAPACITY } else { INTERNAL_KEY_CAPACITY };
        let combined = if node.is_leaf() {
            left.num_keys() + right.num_keys()
        } else {
            left.num_keys() + 1 + right.num_keys()
        };

        if combined <= capacity {
            self.coalesce(left_off, left, right_off, right, parent_off, parent, sep_idx, node.is_leaf())?;
            path.pop();
            self.delete_entry(path)
        } else {
            self.redistribute(
                left_off, left, right_off, right, parent_off, parent, sep_idx, donor, node.is_leaf(),
            )
        }
    }

    fn coalesce(
        &mut self,
        left_off: PageOffset,
        mut left: Node,
        right_off: PageOffset,
        right: Node,
        parent_off: PageOffset,
        mut parent: Node,
        sep_idx: usize,
        is_leaf: bool,
    ) -> Result<(), Error> {
        if is_leaf {
            for i in 0..right.num_keys() {
                let (k, v) = right.leaf_entry(i);
                left.leaf_insert_at(left.num_keys(), k, &v);
            }
            left.set_sibling(right.sibling());
        } else {
            let separator = parent.internal_key(sep_idx);
            let right_leftmost = right.leftmost_child();
            left.internal_insert_at(left.num_keys(), separator, right_leftmost);
            self.set_node_parent(right_leftmost, left_off)?;
            for i in 0..right.num_keys() {
                let child = right.internal_child(i + 1);
                left.internal_insert_at(left.num_keys(), right.internal_key(i), child);
                self.set_node_parent(child, left_off)?;
            }
        }

        self.pager.write_node(left_off, &left)?;
        self.pager.release_page(right_off)?;
        parent.internal_remove_at(sep_idx);
        self.pager.write_node(parent_off, &parent)?;
        debug!(left = left_off.raw(), right = right_off.raw(), "coalesced sibling pages");
        Ok(())
    }

    fn redistribute(
        &mut self,
        left_off: PageOffset,
        mut left: Node,
        right_off: PageOffset,
        mut right: Node,
        parent_off: PageOffset,
        mut parent: Node,
        sep_idx: usize,
        donor: Side,
        is_leaf: bool,
    ) -> Result<(), Error> {
        if is_leaf {
            match donor {
                Side::Left => {
                    let last = left.num_keys() - 1;
                    let (k, v) = left.leaf_remove_at(last);
                    right.leaf_insert_at(0, k, &v);
                }
                Side::Right => {
                    let (k, v) = right.leaf_remove_at(0);
                    left.leaf_insert_at(left.num_keys(), k, &v);
                }
            }
            parent.set_internal_key(sep_idx, right.leaf_key(0));
        } else {
            match donor {
                Side::Left => {
                    let (promoted, moved_child) = left.internal_steal_high();
                    let old_separator = parent.internal_key(sep_idx);
                    let old_leftmost = right.leftmost_child();
                    right.internal_insert_at(0, old_separator, old_leftmost);
                    right.set_leftmost_child(moved_child);
                    parent.set_internal_key(sep_idx, promoted);
                    self.set_node_parent(moved_child, right_off)?;
                }
                Side::Right => {
                    let (promoted, moved_child) = right.internal_steal_low();
                    let old_separator = parent.internal_key(sep_idx);
                    left.internal_insert_at(left.num_keys(), old_separator, moved_child);
                    parent.set_internal_key(sep_idx, promoted);
                    self.set_node_parent(moved_child, left_off)?;
                }
            }
        }

        self.pager.write_node(left_off, &left)?;
        self.pager.write_node(right_off, &right)?;
        self.pager.write_node(parent_off, &parent)?;
        debug!(left = left_off.raw(), right = right_off.raw(), "redistributed between siblings");
        Ok(())
    }

    fn adjust_root(&mut self, root_off: PageOffset) -> Result<(), Error> {
        let root = self.pager.read_node(root_off)?;
        if root.is_leaf() {
            if root.num_keys() == 0 {
                self.pager.release_page(root_off)?;
                self.pager.set_root(PageOffset::NONE)?;
                info!("tree emptied");
            }
            return Ok(());
        }
        if root.num_keys() == 0 {
            let only_child = root.leftmost_child();
            self.pager.set_root(only_child)?;
            self.set_node_parent(only_child, PageOffset::NONE)?;
            self.pager.release_page(root_off)?;
            info!(new_root = only_child.raw(), "root collapsed to its only child");
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn validate(&self) -> Result<(), String> {
        let header = self.pager.header().map_err(|e| e.to_string())?;
        if header.root.is_none() {
            return Ok(());
        }
        let mut leaf_key_runs = Vec::new();
        let mut reachable = Vec::new();
        self.validate_node(
            header.root,
            PageOffset::NONE,
            i64::MIN,
            i64::MAX,
            true,
            &mut leaf_key_runs,
            &mut reachable,
        )?;

        let flat: Vec<Key> = leaf_key_runs.into_iter().flatten().collect();
        for w in flat.windows(2) {
            if w[0] >= w[1] {
                return Err(format!("leaf chain out of order: {} >= {}", w[0], w[1]));
            }
        }

        let free_pages = self.pager.free_list_pages().map_err(|e| e.to_string())?;
        for free_page in &free_pages {
            if reachable.contains(free_page) {
                return Err(format!(
                    "page {} is both reachable from the root and on the free list",
                    free_page.raw()
                ));
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn validate_node(
        &self,
        off: PageOffset,
        expected_parent: PageOffset,
        lo: i64,
        hi: i64,
        is_root: bool,
        leaf_runs: &mut Vec<Vec<Key>>,
        reachable: &mut Vec<PageOffset>,
    ) -> Result<(), String> {
        let node = self.pager.read_node(off).map_err(|e| e.to_string())?;
        reachable.push(off);
        if !expected_parent.is_none() && node.parent().raw() != expected_parent.raw() {
            return Err(format!(
                "node {} has parent {:?}, expected {:?}",
                off.raw(),
                node.parent(),
                expected_parent
            ));
        }
        if !is_root {
            let min_occupancy = if node.is_leaf() {
                leaf_min_occupancy()
            } else {
                internal_min_occupancy()
            };
            if node.num_keys() < min_occupancy {
                return Err(format!(
                    "node {} has {} keys, below the minimum occupancy of {}",
                    off.raw(),
                    node.num_keys(),
                    min_occupancy
                ));
            }
        }
        if node.is_leaf() {
            let keys: Vec<Key> = (0..node.num_keys()).map(|i| node.leaf_key(i)).collect();
            for &k in &keys {
                if k < lo || k >= hi {
                    return Err(format!("leaf key {} out of range [{}, {})", k, lo, hi));
                }
            }
            for w in keys.windows(2) {
                if w[0] >= w[1] {
                    return Err(format!("leaf keys out of order at {}: {} >= {}", off.raw(), w[0], w[1]));
                }
            }
            leaf_runs.push(keys);
        } else {
            let n = node.num_keys();
            for i in 0..n {
                let key = node.internal_key(i);
                let child_lo = if i == 0 { lo } else { node.internal_key(i - 1) };
                self.validate_node(node.internal_child(i), off, child_lo, key, false, leaf_runs, reachable)?;
            }
            let last_lo = if n == 0 { lo } else { node.internal_key(n - 1) };
            self.validate_node(node.internal_child(n), off, last_lo, hi, false, leaf_runs, reachable)?;
        }
        Ok(())
    }
}
