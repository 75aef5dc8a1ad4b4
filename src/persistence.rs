//! Metadata block layout (block 0), the cache warm-up scan, and the raw
//! block-scanning helper `recovery()` uses to rebuild a tree from a broken
//! data file.

use crate::bitmap::FreeBitmap;
use crate::block_store::BlockStore;
use crate::cache::PageCache;
use crate::codec::Codec;
use crate::errors::{TreeError, TreeResult};
use crate::node::{Node, NodeId};

pub const MAGIC1: u32 = 0x42D6_AECB;
pub const MAGIC2: u32 = 0x6B70_8B42;
pub const CLEAN_FLAG: u8 = 0xEA;
pub const UNCLEAN_FLAG: u8 = 0x00;

/// The metadata record persisted at block 0: everything needed to resume
/// a tree without re-deriving it from the node blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub block_size: u32,
    pub b_order_leaf: u32,
    pub b_order_internal: u32,
    pub storage_block: u32,
    pub root_id: NodeId,
    pub low_id: NodeId,
    pub high_id: NodeId,
    pub elements: u32,
    pub height: u32,
    pub max_internal_nodes: u32,
    pub max_leaf_nodes: u32,
    pub clean: bool,
}

impl Metadata {
    #[must_use]
    pub fn empty(block_size: u32, b_order_leaf: u32, b_order_internal: u32) -> Self {
        Self {
            block_size,
            b_order_leaf,
            b_order_internal,
            storage_block: 1,
            root_id: NodeId::NULL,
            low_id: NodeId::NULL,
            high_id: NodeId::NULL,
            elements: 0,
            height: 0,
            max_internal_nodes: 0,
            max_leaf_nodes: 0,
            clean: false,
        }
    }

    /// Serialized length is fixed regardless of occupancy; the metadata
    /// block is always block 0 and is never shared with node data.
    #[must_use]
    pub fn serialize(&self, block_size: u32) -> Vec<u8> {
        let mut buf = vec![0u8; block_size as usize];
        let mut pos = 0usize;
        macro_rules! put_u32 {
            ($v:expr) => {{
                buf[pos..pos + 4].copy_from_slice(&($v).to_be_bytes());
                pos += 4;
            }};
        }
        macro_rules! put_i32 {
            ($v:expr) => {{
                buf[pos..pos + 4].copy_from_slice(&($v).to_be_bytes());
                pos += 4;
            }};
        }
        put_u32!(MAGIC1);
        put_u32!(self.block_size);
        put_u32!(self.b_order_leaf);
        put_u32!(self.b_order_internal);
        put_u32!(self.storage_block);
        put_i32!(self.root_id.raw());
        put_i32!(self.low_id.raw());
        put_i32!(self.high_id.raw());
        put_u32!(self.elements);
        put_u32!(self.height);
        put_u32!(self.max_internal_nodes);
        put_u32!(self.max_leaf_nodes);
        buf[pos] = if self.clean { CLEAN_FLAG } else { UNCLEAN_FLAG };
        pos += 1;
        put_u32!(MAGIC2);
        buf
    }

    /// # Errors
    /// Returns [`TreeError::InvalidData`] when either magic constant
    /// doesn't match, or the clean-flag byte is neither known value.
    pub fn deserialize(buf: &[u8]) -> TreeResult<Self> {
        if buf.len() < 53 {
            return Err(TreeError::InvalidData(
                "metadata block shorter than the fixed record".into(),
            ));
        }
        let mut pos = 0usize;
        macro_rules! get_u32 {
            () => {{
                let v = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap());
                pos += 4;
                v
            }};
        }
        macro_rules! get_i32 {
            () => {{
                let v = i32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap());
                pos += 4;
                v
            }};
        }
        let magic1 = get_u32!();
        if magic1 != MAGIC1 {
            return Err(TreeError::InvalidData(format!(
                "metadata magic1 mismatch: expected {MAGIC1:#x}, found {magic1:#x}"
            )));
        }
        let block_size = get_u32!();
        let b_order_leaf = get_u32!();
        let b_order_internal = get_u32!();
        let storage_block = get_u32!();
        let root_id = NodeId::from_raw(get_i32!());
        let low_id = NodeId::from_raw(get_i32!());
        let high_id = NodeId::from_raw(get_i32!());
        let elements = get_u32!();
        let height = get_u32!();
        let max_internal_nodes = get_u32!();
        let max_leaf_nodes = get_u32!();
        let clean = match buf[pos] {
            CLEAN_FLAG => true,
            UNCLEAN_FLAG => false,
            other => {
                return Err(TreeError::InvalidData(format!(
                    "metadata clean flag byte {other:#x} is neither clean nor unclean"
                )))
            }
        };
        pos += 1;
        let magic2 = get_u32!();
        if magic2 != MAGIC2 {
            return Err(TreeError::InvalidData(format!(
                "metadata magic2 mismatch: expected {MAGIC2:#x}, found {magic2:#x}"
            )));
        }
        Ok(Self {
            block_size,
            b_order_leaf,
            b_order_internal,
            storage_block,
            root_id,
            low_id,
            high_id,
            elements,
            height,
            max_internal_nodes,
            max_leaf_nodes,
            clean,
        })
    }
}

/// Iterates block indices `1..storage_block`, skipping any already marked
/// free, and warms the read pools with whatever deserializes cleanly. A
/// block that fails to deserialize is marked free rather than treated as a
/// hard error, matching the spec's "recoverable locally" classification
/// for `InvalidNode`.
///
/// # Errors
/// Propagates I/O failures from the Block Store; a bad node does not
/// error, it is logged and skipped.
pub fn populate_cache<K, V>(
    cache: &mut PageCache<K, V>,
    bitmap: &mut FreeBitmap,
    storage_block: u32,
    max_cache_nodes: usize,
) -> TreeResult<()>
where
    K: Codec,
    V: Codec,
{
    for block in 1..storage_block {
        if bitmap.get(block) {
            continue;
        }
        if cache.resident_count() >= max_cache_nodes {
            break;
        }
        let buf = cache.block_store_mut().get(block)?;
        match Node::<K, V>::deserialize(block as i32, &buf) {
            Ok(node) => cache.populate(node),
            Err(TreeError::InvalidNode { block, reason }) => {
                log::warn!("block {block} failed to deserialize during cache warm-up: {reason}");
                bitmap.set(block as u32);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Scans every occupied block, returning every live leaf `(key, value)`
/// pair found. Used by `recovery()` to seed a fresh tree from a broken
/// data file: a key cannot appear in more than one live leaf, so no
/// deduplication is required.
///
/// # Errors
/// Propagates I/O failures from the Block Store; a block that fails to
/// deserialize is logged and skipped rather than treated as fatal, since
/// the whole point of this scan is tolerating a damaged store.
pub fn scan_live_leaf_records<K, V>(
    store: &mut BlockStore,
    storage_block: u32,
) -> TreeResult<Vec<(K, V)>>
where
    K: Codec,
    V: Codec,
{
    let mut records = Vec::new();
    for block in 1..storage_block {
        let buf = store.get(block)?;
        match Node::<K, V>::deserialize(block as i32, &buf) {
            Ok(Node::Leaf(leaf)) => {
                records.extend(leaf.keys.into_iter().zip(leaf.values));
            }
            Ok(Node::Internal(_)) => {}
            Err(TreeError::InvalidNode { block, reason }) => {
                log::warn!("skipping block {block} during recovery scan: {reason}");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_roundtrips() {
        let meta = Metadata {
            block_size: 4096,
            b_order_leaf: 63,
            b_order_internal: 127,
            storage_block: 42,
            root_id: NodeId::internal(3),
            low_id: NodeId::leaf(4),
            high_id: NodeId::leaf(9),
            elements: 1000,
            height: 3,
            max_internal_nodes: 10,
            max_leaf_nodes: 20,
            clean: true,
        };
        let buf = meta.serialize(4096);
        let decoded = Metadata::deserialize(&buf).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn deserialize_rejects_bad_magic() {
        let buf = vec![0u8; 64];
        assert!(Metadata::deserialize(&buf).is_err());
    }

    #[test]
    fn deserialize_rejects_truncated_buffer() {
        let buf = vec![0u8; 10];
        assert!(Metadata::deserialize(&buf).is_err());
    }
}
