use std::sync::Arc;

use log::debug;

use crate::error::{DbError, DbResult};
use crate::index::node::{
    internal_capacity, internal_min_occupancy, leaf_capacity, min_occupancy, BTreeNode, IndexEntry,
    InternalNode, LeafNode, MAX_KEY_LEN,
};
use crate::storage::{PageType, StorageEngine};
use crate::types::{PageId, INVALID_PAGE_ID};

/// Disk-resident B+ tree keyed by raw bytes (unsigned lexicographic),
/// payload a record locator. Keys are unique: inserting an existing key
/// replaces its payload.
///
/// The tree keeps no state in memory beyond its metadata page id; the
/// root page id lives in the metadata page so it survives reopen. The
/// caller serializes structural mutations (the index manager hands out
/// the tree behind a `Pod`).
pub struct BPlusTree {
    engine: Arc<StorageEngine>,
    meta_page_id: PageId,
    leaf_cap: usize,
    internal_cap: usize,
}

impl BPlusTree {
    pub fn new(engine: Arc<StorageEngine>, meta_page_id: PageId) -> Self {
        let page_size = engine.page_size();
        Self {
            engine,
            meta_page_id,
            leaf_cap: leaf_capacity(page_size),
            internal_cap: internal_capacity(page_size),
        }
    }

    pub fn meta_page_id(&self) -> PageId {
        self.meta_page_id
    }

    // ------------------------------------------------------------------
    // metadata page
    // ------------------------------------------------------------------

    /// Allocate a fresh metadata page with no root. Returns its id.
    pub fn allocate_meta(engine: &StorageEngine) -> DbResult<PageId> {
        let mut guard = engine.new_guard()?;
        {
            let mut page = guard.write();
            let data = page.data_mut();
            data[0] = PageType::System as u8;
            data[1..5].copy_from_slice(&INVALID_PAGE_ID.to_le_bytes());
        }
        guard.mark_dirty();
        Ok(guard.page_id())
    }

    pub fn root_page_id(&self) -> DbResult<PageId> {
        let guard = self.engine.fetch_guard(self.meta_page_id)?;
        let page = guard.read();
        let data = page.data();
        Ok(i32::from_le_bytes([data[1], data[2], data[3], data[4]]))
    }

    fn set_root_page_id(&self, root: PageId) -> DbResult<()> {
        let mut guard = self.engine.fetch_guard(self.meta_page_id)?;
        {
            let mut page = guard.write();
            let data = page.data_mut();
            data[0] = PageType::System as u8;
            data[1..5].copy_from_slice(&root.to_le_bytes());
        }
        guard.mark_dirty();
        Ok(())
    }

    // ------------------------------------------------------------------
    // node I/O
    // ------------------------------------------------------------------

    fn read_node(&self, page_id: PageId) -> DbResult<BTreeNode> {
        let guard = self.engine.fetch_guard(page_id)?;
        let page = guard.read();
        BTreeNode::deserialize(page_id, page.data())
    }

    fn read_leaf(&self, page_id: PageId) -> DbResult<LeafNode> {
        match self.read_node(page_id)? {
            BTreeNode::Leaf(leaf) => Ok(leaf),
            BTreeNode::Internal(_) => Err(DbError::corrupt(page_id, "expected a leaf node")),
        }
    }

    fn write_node(&self, node: &BTreeNode) -> DbResult<()> {
        let bytes = node.serialize(self.engine.page_size());
        let mut guard = self.engine.fetch_guard(node.page_id())?;
        guard.write().data_mut().copy_from_slice(&bytes);
        guard.mark_dirty();
        Ok(())
    }

    /// Allocate a page and persist the node built for its id.
    fn alloc_node(&self, build: impl FnOnce(PageId) -> BTreeNode) -> DbResult<BTreeNode> {
        let mut guard = self.engine.new_guard()?;
        let node = build(guard.page_id());
        let bytes = node.serialize(self.engine.page_size());
        guard.write().data_mut().copy_from_slice(&bytes);
        guard.mark_dirty();
        Ok(node)
    }

    fn update_parent_pointer(&self, child: PageId, parent: PageId) -> DbResult<()> {
        let mut node = self.read_node(child)?;
        node.set_parent_page_id(parent);
        self.write_node(&node)
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    /// True when the tree has a root.
    pub fn exists(&self) -> DbResult<bool> {
        Ok(self.root_page_id()? != INVALID_PAGE_ID)
    }

    /// Allocate an empty root leaf unless the tree already exists.
    pub fn create(&self) -> DbResult<()> {
        if self.exists()? {
            return Ok(());
        }
        let root = self.alloc_node(|pid| BTreeNode::Leaf(LeafNode::new(pid)))?;
        self.set_root_page_id(root.page_id())?;
        debug!("btree created with root leaf {}", root.page_id());
        Ok(())
    }

    /// Free every page reachable from the root and reset the root to
    /// invalid. The metadata page itself stays with its owner.
    pub fn drop_tree(&self) -> DbResult<()> {
        let root = self.root_page_id()?;
        if root == INVALID_PAGE_ID {
            return Ok(());
        }

        let mut pending = vec![root];
        while let Some(page_id) = pending.pop() {
            if let BTreeNode::Internal(node) = self.read_node(page_id)? {
                pending.extend(node.children.iter().copied());
            }
            self.engine.delete_page(page_id)?;
        }
        self.set_root_page_id(INVALID_PAGE_ID)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // lookup
    // ------------------------------------------------------------------

    /// Descend to the leaf that owns `key`, collecting the internal
    /// nodes on the way down.
    fn find_leaf(&self, key: &[u8]) -> DbResult<(LeafNode, Vec<InternalNode>)> {
        let root = self.root_page_id()?;
        if root == INVALID_PAGE_ID {
            return Err(DbError::corrupt(self.meta_page_id, "lookup on a dropped tree"));
        }

        let mut path = Vec::new();
        let mut current = root;
        loop {
            match self.read_node(current)? {
                BTreeNode::Leaf(leaf) => return Ok((leaf, path)),
                BTreeNode::Internal(node) => {
                    current = node.children[node.child_index_for(key)];
                    path.push(node);
                }
            }
        }
    }

    /// Point lookup: zero or one entry.
    pub fn search(&self, key: &[u8]) -> DbResult<Vec<IndexEntry>> {
        if self.root_page_id()? == INVALID_PAGE_ID {
            return Ok(Vec::new());
        }
        let (leaf, _) = self.find_leaf(key)?;
        match leaf.entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
            Ok(pos) => Ok(vec![leaf.entries[pos].clone()]),
            Err(_) => Ok(Vec::new()),
        }
    }

    /// All entries with `lo <= key <= hi`, in key order, walking the
    /// linked leaf level.
    pub fn search_range(&self, lo: &[u8], hi: &[u8]) -> DbResult<Vec<IndexEntry>> {
        if lo > hi || self.root_page_id()? == INVALID_PAGE_ID {
            return Ok(Vec::new());
        }

        let (mut leaf, _) = self.find_leaf(lo)?;
        let mut results = Vec::new();
        loop {
            for entry in &leaf.entries {
                if entry.key.as_slice() < lo {
                    continue;
                }
                if entry.key.as_slice() > hi {
                    return Ok(results);
                }
                results.push(entry.clone());
            }
            if leaf.next_leaf_page_id == INVALID_PAGE_ID {
                return Ok(results);
            }
            leaf = self.read_leaf(leaf.next_leaf_page_id)?;
        }
    }

    // ------------------------------------------------------------------
    // insert
    // ------------------------------------------------------------------

    pub fn insert(&self, entry: IndexEntry) -> DbResult<()> {
        if entry.key.len() > MAX_KEY_LEN {
            return Err(DbError::invalid(format!(
                "index key of {} bytes exceeds the {} byte bound",
                entry.key.len(),
                MAX_KEY_LEN
            )));
        }
        self.create()?;

        let (mut leaf, path) = self.find_leaf(&entry.key)?;
        match leaf
            .entries
            .binary_search_by(|e| e.key.as_slice().cmp(entry.key.as_slice()))
        {
            // equal key: upsert the payload
            Ok(pos) => {
                leaf.entries[pos] = entry;
                return self.write_node(&BTreeNode::Leaf(leaf));
            }
            Err(pos) => leaf.entries.insert(pos, entry),
        }

        if leaf.entries.len() <= self.leaf_cap {
            return self.write_node(&BTreeNode::Leaf(leaf));
        }
        self.split_leaf(leaf, path)
    }

    /// Split an overfull leaf: the upper half moves to a fresh sibling,
    /// the first right key is copied up as the separator.
    fn split_leaf(&self, mut leaf: LeafNode, path: Vec<InternalNode>) -> DbResult<()> {
        let mid = (leaf.entries.len() + 1) / 2;
        let right_entries = leaf.entries.split_off(mid);
        let separator = right_entries[0].key.clone();

        let right = self.alloc_node(|pid| {
            BTreeNode::Leaf(LeafNode {
                page_id: pid,
                parent_page_id: leaf.parent_page_id,
                next_leaf_page_id: leaf.next_leaf_page_id,
                entries: right_entries,
            })
        })?;

        leaf.next_leaf_page_id = right.page_id();
        let left_pid = leaf.page_id;
        self.write_node(&BTreeNode::Leaf(leaf))?;
        debug!(
            "leaf {} split, separator promoted to parent",
            left_pid
        );
        self.insert_into_parent(path, left_pid, separator, right.page_id())
    }

    /// Insert a separator and right child into the parent, splitting
    /// upward as needed. An empty path means the split node was the
    /// root and the tree grows by one level.
    fn insert_into_parent(
        &self,
        mut path: Vec<InternalNode>,
        left: PageId,
        separator: Vec<u8>,
        right: PageId,
    ) -> DbResult<()> {
        let mut parent = match path.pop() {
            Some(parent) => parent,
            None => {
                let root = self.alloc_node(|pid| {
                    BTreeNode::Internal(InternalNode {
                        page_id: pid,
                        parent_page_id: INVALID_PAGE_ID,
                        keys: vec![separator],
                        children: vec![left, right],
                    })
                })?;
                self.update_parent_pointer(left, root.page_id())?;
                self.update_parent_pointer(right, root.page_id())?;
                self.set_root_page_id(root.page_id())?;
                debug!("root split, new root {}", root.page_id());
                return Ok(());
            }
        };

        let idx = parent.position_of_child(left).ok_or_else(|| {
            DbError::corrupt(parent.page_id, "split child missing from its parent")
        })?;
        parent.keys.insert(idx, separator);
        parent.children.insert(idx + 1, right);
        self.update_parent_pointer(right, parent.page_id)?;

        if parent.keys.len() <= self.internal_cap {
            return self.write_node(&BTreeNode::Internal(parent));
        }

        // split the internal node; the median key moves up
        let mid = parent.keys.len() / 2;
        let promoted = parent.keys[mid].clone();
        let right_keys = parent.keys.split_off(mid + 1);
        parent.keys.pop(); // the promoted median leaves the node
        let right_children = parent.children.split_off(mid + 1);

        let right_node = self.alloc_node(|pid| {
            BTreeNode::Internal(InternalNode {
                page_id: pid,
                parent_page_id: parent.parent_page_id,
                keys: right_keys,
                children: right_children,
            })
        })?;
        if let BTreeNode::Internal(ref right_internal) = right_node {
            for &child in &right_internal.children {
                self.update_parent_pointer(child, right_internal.page_id)?;
            }
        }

        let left_pid = parent.page_id;
        self.write_node(&BTreeNode::Internal(parent))?;
        self.insert_into_parent(path, left_pid, promoted, right_node.page_id())
    }

    // ------------------------------------------------------------------
    // delete
    // ------------------------------------------------------------------

    /// Remove `key`. Deleting a missing key is a no-op success.
    pub fn delete(&self, key: &[u8]) -> DbResult<()> {
        if self.root_page_id()? == INVALID_PAGE_ID {
            return Ok(());
        }

        let (mut leaf, path) = self.find_leaf(key)?;
        match leaf.entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
            Ok(pos) => {
                leaf.entries.remove(pos);
            }
            Err(_) => return Ok(()),
        }

        if path.is_empty() || leaf.entries.len() >= min_occupancy(self.leaf_cap) {
            return self.write_node(&BTreeNode::Leaf(leaf));
        }
        self.rebalance_leaf(leaf, path)
    }

    /// Bring an underfull leaf back to occupancy: borrow from the left
    /// sibling, then the right, then merge.
    fn rebalance_leaf(&self, mut leaf: LeafNode, mut path: Vec<InternalNode>) -> DbResult<()> {
        let mut parent = path.pop().expect("rebalanced leaf must have a parent");
        let idx = parent.position_of_child(leaf.page_id).ok_or_else(|| {
            DbError::corrupt(parent.page_id, "underfull leaf missing from its parent")
        })?;
        let min = min_occupancy(self.leaf_cap);

        // borrow from the left sibling
        if idx > 0 {
            let mut left = self.read_leaf(parent.children[idx - 1])?;
            if left.entries.len() > min {
                let moved = left.entries.pop().unwrap();
                leaf.entries.insert(0, moved);
                parent.keys[idx - 1] = leaf.entries[0].key.clone();
                self.write_node(&BTreeNode::Leaf(left))?;
                self.write_node(&BTreeNode::Leaf(leaf))?;
                return self.write_node(&BTreeNode::Internal(parent));
            }
        }

        // borrow from the right sibling
        if idx + 1 < parent.children.len() {
            let mut right = self.read_leaf(parent.children[idx + 1])?;
            if right.entries.len() > min {
                let moved = right.entries.remove(0);
                leaf.entries.push(moved);
                parent.keys[idx] = right.entries[0].key.clone();
                self.write_node(&BTreeNode::Leaf(right))?;
                self.write_node(&BTreeNode::Leaf(leaf))?;
                return self.write_node(&BTreeNode::Internal(parent));
            }
        }

        // merge with a sibling; the separator leaves the parent
        if idx > 0 {
            let mut left = self.read_leaf(parent.children[idx - 1])?;
            left.entries.append(&mut leaf.entries);
            left.next_leaf_page_id = leaf.next_leaf_page_id;
            self.write_node(&BTreeNode::Leaf(left))?;
            self.engine.delete_page(leaf.page_id)?;
            parent.keys.remove(idx - 1);
            parent.children.remove(idx);
            debug!("leaf {} merged into its left sibling", leaf.page_id);
        } else {
            let mut right = self.read_leaf(parent.children[idx + 1])?;
            let right_pid = right.page_id;
            leaf.entries.append(&mut right.entries);
            leaf.next_leaf_page_id = right.next_leaf_page_id;
            self.write_node(&BTreeNode::Leaf(leaf))?;
            self.engine.delete_page(right_pid)?;
            parent.keys.remove(idx);
            parent.children.remove(idx + 1);
            debug!("leaf {} merged into its right sibling", right_pid);
        }

        self.resolve_internal_underflow(parent, path)
    }

    /// After a merge removed a separator, the parent may itself be
    /// underfull; cascade up to the root.
    fn resolve_internal_underflow(
        &self,
        mut node: InternalNode,
        mut path: Vec<InternalNode>,
    ) -> DbResult<()> {
        // the root shrinks once it has a single child
        if path.is_empty() {
            if node.keys.is_empty() {
                let only_child = node.children[0];
                self.update_parent_pointer(only_child, INVALID_PAGE_ID)?;
                self.engine.delete_page(node.page_id)?;
                self.set_root_page_id(only_child)?;
                debug!("root collapsed, new root {}", only_child);
                return Ok(());
            }
            return self.write_node(&BTreeNode::Internal(node));
        }

        if node.keys.len() >= internal_min_occupancy(self.internal_cap) {
            return self.write_node(&BTreeNode::Internal(node));
        }

        let mut parent = path.pop().unwrap();
        let idx = parent.position_of_child(node.page_id).ok_or_else(|| {
            DbError::corrupt(parent.page_id, "underfull node missing from its parent")
        })?;
        let min = internal_min_occupancy(self.internal_cap);

        // borrow through the parent from the left sibling
        if idx > 0 {
            let mut left = self.read_internal(parent.children[idx - 1])?;
            if left.keys.len() > min {
                node.keys.insert(0, parent.keys[idx - 1].clone());
                let moved_child = left.children.pop().unwrap();
                node.children.insert(0, moved_child);
                parent.keys[idx - 1] = left.keys.pop().unwrap();
                self.update_parent_pointer(moved_child, node.page_id)?;
                self.write_node(&BTreeNode::Internal(left))?;
                self.write_node(&BTreeNode::Internal(node))?;
                return self.write_node(&BTreeNode::Internal(parent));
            }
        }

        // borrow through the parent from the right sibling
        if idx + 1 < parent.children.len() {
            let mut right = self.read_internal(parent.children[idx + 1])?;
            if right.keys.len() > min {
                node.keys.push(parent.keys[idx].clone());
                let moved_child = right.children.remove(0);
                node.children.push(moved_child);
                parent.keys[idx] = right.keys.remove(0);
                self.update_parent_pointer(moved_child, node.page_id)?;
                self.write_node(&BTreeNode::Internal(right))?;
                self.write_node(&BTreeNode::Internal(node))?;
                return self.write_node(&BTreeNode::Internal(parent));
            }
        }

        // merge; the separator comes down from the parent
        if idx > 0 {
            let mut left = self.read_internal(parent.children[idx - 1])?;
            left.keys.push(parent.keys[idx - 1].clone());
            left.keys.append(&mut node.keys);
            for &child in &node.children {
                self.update_parent_pointer(child, left.page_id)?;
            }
            left.children.append(&mut node.children);
            self.write_node(&BTreeNode::Internal(left))?;
            self.engine.delete_page(node.page_id)?;
            parent.keys.remove(idx - 1);
            parent.children.remove(idx);
        } else {
            let mut right = self.read_internal(parent.children[idx + 1])?;
            let right_pid = right.page_id;
            node.keys.push(parent.keys[idx].clone());
            node.keys.append(&mut right.keys);
            for &child in &right.children {
                self.update_parent_pointer(child, node.page_id)?;
            }
            node.children.append(&mut right.children);
            self.write_node(&BTreeNode::Internal(node))?;
            self.engine.delete_page(right_pid)?;
            parent.keys.remove(idx);
            parent.children.remove(idx + 1);
        }

        self.resolve_internal_underflow(parent, path)
    }

    fn read_internal(&self, page_id: PageId) -> DbResult<InternalNode> {
        match self.read_node(page_id)? {
            BTreeNode::Internal(node) => Ok(node),
            BTreeNode::Leaf(_) => Err(DbError::corrupt(page_id, "expected an internal node")),
        }
    }

    // ------------------------------------------------------------------
    // diagnostics
    // ------------------------------------------------------------------

    /// Levels from root to leaf; 1 for a lone root leaf, 0 for a
    /// dropped tree.
    pub fn height(&self) -> DbResult<usize> {
        let mut current = self.root_page_id()?;
        if current == INVALID_PAGE_ID {
            return Ok(0);
        }
        let mut height = 1;
        loop {
            match self.read_node(current)? {
                BTreeNode::Leaf(_) => return Ok(height),
                BTreeNode::Internal(node) => {
                    current = node.children[0];
                    height += 1;
                }
            }
        }
    }

    /// Verify the structural invariants: uniform depth, ordering within
    /// and across nodes, minimum occupancy, parent pointers, and the
    /// leaf chain.
    pub fn check_integrity(&self) -> DbResult<()> {
        let root = self.root_page_id()?;
        if root == INVALID_PAGE_ID {
            return Ok(());
        }

        let mut leaf_depth = None;
        self.check_subtree(root, INVALID_PAGE_ID, None, None, 1, &mut leaf_depth)?;

        // leftmost-to-rightmost leaf walk must be strictly increasing
        let mut current = root;
        loop {
            match self.read_node(current)? {
                BTreeNode::Internal(node) => current = node.children[0],
                BTreeNode::Leaf(_) => break,
            }
        }
        let mut previous: Option<Vec<u8>> = None;
        loop {
            let leaf = self.read_leaf(current)?;
            for entry in &leaf.entries {
                if let Some(prev) = &previous {
                    if prev.as_slice() >= entry.key.as_slice() {
                        return Err(DbError::corrupt(current, "leaf chain keys out of order"));
                    }
                }
                previous = Some(entry.key.clone());
            }
            if leaf.next_leaf_page_id == INVALID_PAGE_ID {
                break;
            }
            current = leaf.next_leaf_page_id;
        }
        Ok(())
    }

    fn check_subtree(
        &self,
        page_id: PageId,
        expected_parent: PageId,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        depth: usize,
        leaf_depth: &mut Option<usize>,
    ) -> DbResult<()> {
        let node = self.read_node(page_id)?;
        if node.parent_page_id() != expected_parent {
            return Err(DbError::corrupt(page_id, "wrong parent pointer"));
        }

        let root = self.root_page_id()?;
        let keys: Vec<&[u8]> = match &node {
            BTreeNode::Leaf(leaf) => leaf.entries.iter().map(|e| e.key.as_slice()).collect(),
            BTreeNode::Internal(internal) => {
                internal.keys.iter().map(|k| k.as_slice()).collect()
            }
        };

        for pair in keys.windows(2) {
            if pair[0] >= pair[1] {
                return Err(DbError::corrupt(page_id, "keys not strictly increasing"));
            }
        }
        for key in &keys {
            if let Some(lo) = lower {
                if *key < lo {
                    return Err(DbError::corrupt(page_id, "key below subtree bound"));
                }
            }
            if let Some(hi) = upper {
                if *key >= hi {
                    return Err(DbError::corrupt(page_id, "key above subtree bound"));
                }
            }
        }

        match node {
            BTreeNode::Leaf(leaf) => {
                if page_id != root && leaf.entries.len() < min_occupancy(self.leaf_cap) {
                    return Err(DbError::corrupt(page_id, "leaf below minimum occupancy"));
                }
                match leaf_depth {
                    Some(expected) if *expected != depth => {
                        Err(DbError::corrupt(page_id, "leaves at unequal depth"))
                    }
                    Some(_) => Ok(()),
                    None => {
                        *leaf_depth = Some(depth);
                        Ok(())
                    }
                }
            }
            BTreeNode::Internal(internal) => {
                if internal.children.len() != internal.keys.len() + 1 {
                    return Err(DbError::corrupt(page_id, "child count != key count + 1"));
                }
                if page_id == root {
                    if internal.keys.is_empty() {
                        return Err(DbError::corrupt(page_id, "internal root with no keys"));
                    }
                } else if internal.keys.len() < internal_min_occupancy(self.internal_cap) {
                    return Err(DbError::corrupt(page_id, "internal node below minimum occupancy"));
                }

                for (i, &child) in internal.children.iter().enumerate() {
                    let child_lower = if i == 0 {
                        lower
                    } else {
                        Some(internal.keys[i - 1].as_slice())
                    };
                    let child_upper = if i == internal.keys.len() {
                        upper
                    } else {
                        Some(internal.keys[i].as_slice())
                    };
                    self.check_subtree(
                        child,
                        page_id,
                        child_lower,
                        child_upper,
                        depth + 1,
                        leaf_depth,
                    )?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use tempfile::tempdir;

    fn small_tree() -> (BPlusTree, Arc<StorageEngine>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = DatabaseConfig {
            page_size: 512,
            pool_size: 64,
            shard_count: 1,
            ..DatabaseConfig::default()
        };
        let engine = Arc::new(StorageEngine::open(dir.path().join("index.db"), &config).unwrap());
        let meta = BPlusTree::allocate_meta(&engine).unwrap();
        let tree = BPlusTree::new(Arc::clone(&engine), meta);
        tree.create().unwrap();
        (tree, engine, dir)
    }

    fn key_of(i: u32) -> Vec<u8> {
        i.to_be_bytes().to_vec()
    }

    #[test]
    fn test_create_is_idempotent() {
        let (tree, _engine, _dir) = small_tree();
        let root = tree.root_page_id().unwrap();
        tree.create().unwrap();
        assert_eq!(tree.root_page_id().unwrap(), root);
        assert!(tree.exists().unwrap());
    }

    #[test]
    fn test_insert_and_search() {
        let (tree, _engine, _dir) = small_tree();
        for i in 0..50u32 {
            tree.insert(IndexEntry::new(key_of(i), i as i32 + 100, i as u16))
                .unwrap();
        }
        tree.check_integrity().unwrap();

        let hits = tree.search(&key_of(31)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].page_id, 131);
        assert_eq!(hits[0].offset, 31);

        assert!(tree.search(&key_of(99)).unwrap().is_empty());
    }

    #[test]
    fn test_upsert_replaces_payload() {
        let (tree, _engine, _dir) = small_tree();
        tree.insert(IndexEntry::new(key_of(7), 1, 10)).unwrap();
        tree.insert(IndexEntry::new(key_of(7), 2, 20)).unwrap();

        let hits = tree.search(&key_of(7)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!((hits[0].page_id, hits[0].offset), (2, 20));
    }

    #[test]
    fn test_splits_grow_height() {
        let (tree, _engine, _dir) = small_tree();
        assert_eq!(tree.height().unwrap(), 1);
        for i in 0..200u32 {
            tree.insert(IndexEntry::new(key_of(i), i as i32, 0)).unwrap();
        }
        assert!(tree.height().unwrap() >= 3);
        tree.check_integrity().unwrap();

        for i in 0..200u32 {
            assert_eq!(tree.search(&key_of(i)).unwrap().len(), 1, "key {}", i);
        }
    }

    #[test]
    fn test_range_scan() {
        let (tree, _engine, _dir) = small_tree();
        for i in 0..100u32 {
            tree.insert(IndexEntry::new(key_of(i), i as i32, 0)).unwrap();
        }

        let hits = tree.search_range(&key_of(10), &key_of(19)).unwrap();
        assert_eq!(hits.len(), 10);
        assert_eq!(hits[0].key, key_of(10));
        assert_eq!(hits[9].key, key_of(19));

        // bounds are inclusive and an inverted range is empty
        assert_eq!(tree.search_range(&key_of(5), &key_of(5)).unwrap().len(), 1);
        assert!(tree.search_range(&key_of(9), &key_of(3)).unwrap().is_empty());
    }

    #[test]
    fn test_delete_missing_key_is_noop() {
        let (tree, _engine, _dir) = small_tree();
        tree.insert(IndexEntry::new(key_of(1), 1, 0)).unwrap();
        tree.delete(&key_of(42)).unwrap();
        assert_eq!(tree.search(&key_of(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_shrinks_to_empty_root_leaf() {
        let (tree, _engine, _dir) = small_tree();
        let mut keys: Vec<u32> = (0..150).collect();
        for &i in &keys {
            tree.insert(IndexEntry::new(key_of(i), i as i32, 0)).unwrap();
        }
        tree.check_integrity().unwrap();

        // delete in a different order than insertion
        keys.reverse();
        for (n, &i) in keys.iter().enumerate() {
            tree.delete(&key_of(i)).unwrap();
            if n % 37 == 0 {
                tree.check_integrity().unwrap();
            }
        }

        tree.check_integrity().unwrap();
        assert_eq!(tree.height().unwrap(), 1);
        for i in 0..150u32 {
            assert!(tree.search(&key_of(i)).unwrap().is_empty());
        }
    }

    #[test]
    fn test_interleaved_insert_delete_integrity() {
        let (tree, _engine, _dir) = small_tree();
        for i in 0..120u32 {
            tree.insert(IndexEntry::new(key_of(i), i as i32, 0)).unwrap();
        }
        for i in (0..120u32).step_by(2) {
            tree.delete(&key_of(i)).unwrap();
        }
        tree.check_integrity().unwrap();

        for i in 0..120u32 {
            let hits = tree.search(&key_of(i)).unwrap();
            if i % 2 == 0 {
                assert!(hits.is_empty(), "key {} should be gone", i);
            } else {
                assert_eq!(hits.len(), 1, "key {} should remain", i);
            }
        }
    }

    #[test]
    fn test_drop_tree_frees_and_resets() {
        let (tree, _engine, _dir) = small_tree();
        for i in 0..80u32 {
            tree.insert(IndexEntry::new(key_of(i), i as i32, 0)).unwrap();
        }
        tree.drop_tree().unwrap();
        assert!(!tree.exists().unwrap());
        assert!(tree.search(&key_of(1)).unwrap().is_empty());

        // create() after drop starts a fresh empty tree
        tree.create().unwrap();
        assert_eq!(tree.height().unwrap(), 1);
    }

    #[test]
    fn test_oversized_key_rejected() {
        let (tree, _engine, _dir) = small_tree();
        let long_key = vec![0xAA; MAX_KEY_LEN + 1];
        assert!(matches!(
            tree.insert(IndexEntry::new(long_key, 1, 0)),
            Err(DbError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_root_survives_reopen_via_meta() {
        let dir = tempdir().unwrap();
        let config = DatabaseConfig {
            page_size: 512,
            pool_size: 16,
            shard_count: 1,
            ..DatabaseConfig::default()
        };
        let path = dir.path().join("index.db");
        let meta;
        {
            let engine = Arc::new(StorageEngine::open(&path, &config).unwrap());
            meta = BPlusTree::allocate_meta(&engine).unwrap();
            let tree = BPlusTree::new(Arc::clone(&engine), meta);
            tree.create().unwrap();
            for i in 0..60u32 {
                tree.insert(IndexEntry::new(key_of(i), i as i32, 0)).unwrap();
            }
            engine.flush_all_pages().unwrap();
        }

        let engine = Arc::new(StorageEngine::open(&path, &config).unwrap());
        let tree = BPlusTree::new(engine, meta);
        tree.check_integrity().unwrap();
        assert_eq!(tree.search(&key_of(42)).unwrap().len(), 1);
    }
}
