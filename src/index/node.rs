use crate::error::{DbError, DbResult};
use crate::io::{ByteReader, ByteWriter};
use crate::types::{PageId, INVALID_PAGE_ID};

/// Fixed on-page node header:
///
/// ```text
/// offset 0  : u8  is_leaf (1 leaf, 0 internal)
/// offset 1  : i32 key_count
/// offset 5  : i32 parent_page_id
/// offset 9  : i32 next_leaf_page_id (leaf only)
/// offset 13 : 7 bytes padding
/// ```
pub const NODE_HEADER_SIZE: usize = 20;

/// Upper bound on key bytes; the node order is derived from it.
pub const MAX_KEY_LEN: usize = 128;

/// Serialized footprint of one leaf entry slot: i32 key length, the key
/// bound, page id and in-page offset.
const LEAF_SLOT_SIZE: usize = 4 + MAX_KEY_LEN + 4 + 2;

/// Internal slot: i32 key length, key bound, child page id.
const INTERNAL_SLOT_SIZE: usize = 4 + MAX_KEY_LEN + 4;

/// A key with the record locator it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Vec<u8>,
    pub page_id: PageId,
    pub offset: u16,
}

impl IndexEntry {
    pub fn new(key: Vec<u8>, page_id: PageId, offset: u16) -> Self {
        Self {
            key,
            page_id,
            offset,
        }
    }
}

impl std::fmt::Display for IndexEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> ({}, {})",
            hex::encode(&self.key),
            self.page_id,
            self.offset
        )
    }
}

/// Maximum keys per leaf for the given page size.
pub fn leaf_capacity(page_size: usize) -> usize {
    (page_size - NODE_HEADER_SIZE) / LEAF_SLOT_SIZE
}

/// Maximum keys per internal node for the given page size. One slot of
/// child-pointer space is reserved for the trailing child.
pub fn internal_capacity(page_size: usize) -> usize {
    (page_size - NODE_HEADER_SIZE - 4) / INTERNAL_SLOT_SIZE
}

/// Minimum entries in a non-root leaf of the given capacity.
pub fn min_occupancy(capacity: usize) -> usize {
    (capacity + 1) / 2
}

/// Minimum keys in a non-root internal node. One lower than the leaf
/// floor: a merge pulls the separator down with it, so two minimal
/// siblings plus the separator must still fit in one node.
pub fn internal_min_occupancy(capacity: usize) -> usize {
    capacity / 2
}

/// Leaf level: ordered entries plus the singly linked next-leaf chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafNode {
    pub page_id: PageId,
    pub parent_page_id: PageId,
    pub next_leaf_page_id: PageId,
    pub entries: Vec<IndexEntry>,
}

impl LeafNode {
    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            parent_page_id: INVALID_PAGE_ID,
            next_leaf_page_id: INVALID_PAGE_ID,
            entries: Vec::new(),
        }
    }
}

/// Internal level: `keys.len() + 1` children. The subtree at
/// `children[i]` holds keys in `[keys[i-1], keys[i])`, with the first
/// and last ranges open-ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalNode {
    pub page_id: PageId,
    pub parent_page_id: PageId,
    pub keys: Vec<Vec<u8>>,
    pub children: Vec<PageId>,
}

impl InternalNode {
    /// Index of the child to descend into for `key`.
    pub fn child_index_for(&self, key: &[u8]) -> usize {
        self.keys.partition_point(|k| k.as_slice() <= key)
    }

    /// Position of `child` in the children list.
    pub fn position_of_child(&self, child: PageId) -> Option<usize> {
        self.children.iter().position(|&c| c == child)
    }
}

/// One B+ tree node, recoverable from the page header byte on every
/// load. A tagged enum rather than polymorphism: the node must live in
/// page bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BTreeNode {
    Leaf(LeafNode),
    Internal(InternalNode),
}

impl BTreeNode {
    pub fn page_id(&self) -> PageId {
        match self {
            BTreeNode::Leaf(leaf) => leaf.page_id,
            BTreeNode::Internal(node) => node.page_id,
        }
    }

    pub fn parent_page_id(&self) -> PageId {
        match self {
            BTreeNode::Leaf(leaf) => leaf.parent_page_id,
            BTreeNode::Internal(node) => node.parent_page_id,
        }
    }

    pub fn set_parent_page_id(&mut self, parent: PageId) {
        match self {
            BTreeNode::Leaf(leaf) => leaf.parent_page_id = parent,
            BTreeNode::Internal(node) => node.parent_page_id = parent,
        }
    }

    pub fn key_count(&self) -> usize {
        match self {
            BTreeNode::Leaf(leaf) => leaf.entries.len(),
            BTreeNode::Internal(node) => node.keys.len(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, BTreeNode::Leaf(_))
    }

    /// Serialize into a page-sized buffer.
    pub fn serialize(&self, page_size: usize) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(page_size);
        match self {
            BTreeNode::Leaf(leaf) => {
                writer.write_u8(1);
                writer.write_i32(leaf.entries.len() as i32);
                writer.write_i32(leaf.parent_page_id);
                writer.write_i32(leaf.next_leaf_page_id);
                writer.write_bytes(&[0u8; 7]);
                for entry in &leaf.entries {
                    writer.write_i32(entry.key.len() as i32);
                    writer.write_bytes(&entry.key);
                    writer.write_i32(entry.page_id);
                    writer.write_u16(entry.offset);
                }
            }
            BTreeNode::Internal(node) => {
                writer.write_u8(0);
                writer.write_i32(node.keys.len() as i32);
                writer.write_i32(node.parent_page_id);
                writer.write_i32(INVALID_PAGE_ID);
                writer.write_bytes(&[0u8; 7]);
                for (key, &child) in node.keys.iter().zip(node.children.iter()) {
                    writer.write_i32(key.len() as i32);
                    writer.write_bytes(key);
                    writer.write_i32(child);
                }
                // trailing child pointer
                writer.write_i32(*node.children.last().unwrap_or(&INVALID_PAGE_ID));
            }
        }
        writer.to_padded_bytes(page_size)
    }

    /// Rebuild a node from page bytes. `page_id` comes from the frame,
    /// not the payload.
    pub fn deserialize(page_id: PageId, data: &[u8]) -> DbResult<Self> {
        let corrupt = |reason: &str| DbError::corrupt(page_id, reason);

        let mut reader = ByteReader::new(data);
        let is_leaf = reader.read_u8().map_err(|_| corrupt("truncated header"))?;
        let key_count = reader.read_i32().map_err(|_| corrupt("truncated header"))?;
        let parent_page_id = reader.read_i32().map_err(|_| corrupt("truncated header"))?;
        let next_leaf_page_id = reader.read_i32().map_err(|_| corrupt("truncated header"))?;
        reader
            .seek(NODE_HEADER_SIZE)
            .map_err(|_| corrupt("truncated header"))?;

        if key_count < 0 {
            return Err(corrupt("negative key count"));
        }
        let key_count = key_count as usize;

        let read_key = |reader: &mut ByteReader<'_>| -> DbResult<Vec<u8>> {
            let len = reader.read_i32().map_err(|_| corrupt("truncated key"))?;
            if len < 0 || len as usize > MAX_KEY_LEN {
                return Err(corrupt("key length out of bounds"));
            }
            reader
                .read_bytes(len as usize)
                .map_err(|_| corrupt("truncated key"))
        };

        match is_leaf {
            1 => {
                let mut entries = Vec::with_capacity(key_count);
                for _ in 0..key_count {
                    let key = read_key(&mut reader)?;
                    let entry_page_id =
                        reader.read_i32().map_err(|_| corrupt("truncated entry"))?;
                    let offset = reader.read_u16().map_err(|_| corrupt("truncated entry"))?;
                    entries.push(IndexEntry::new(key, entry_page_id, offset));
                }
                Ok(BTreeNode::Leaf(LeafNode {
                    page_id,
                    parent_page_id,
                    next_leaf_page_id,
                    entries,
                }))
            }
            0 => {
                let mut keys = Vec::with_capacity(key_count);
                let mut children = Vec::with_capacity(key_count + 1);
                for _ in 0..key_count {
                    keys.push(read_key(&mut reader)?);
                    children.push(reader.read_i32().map_err(|_| corrupt("truncated child"))?);
                }
                children.push(reader.read_i32().map_err(|_| corrupt("truncated child"))?);
                Ok(BTreeNode::Internal(InternalNode {
                    page_id,
                    parent_page_id,
                    keys,
                    children,
                }))
            }
            other => Err(corrupt(&format!("unknown node tag {}", other))),
        }
    }
}
