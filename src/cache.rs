//! Dual-layer page cache: per-kind LRU read pools plus insertion-order
//! dirty maps, sitting directly in front of the Block Store.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::block_store::BlockStore;
use crate::config::ResolvedConfig;
use crate::node::{Node, NodeId};

/// Lookup order is dirty pool -> read pool -> Block Store; a miss from disk
/// is inserted into the matching read pool. The cache owns the only live
/// copy of a node's on-disk representation — callers get clones out,
/// mutate them, and hand them back via [`PageCache::set_dirty`], mirroring
/// the "ids are handles, not owning references" contract the sibling list
/// depends on.
pub struct PageCache<K, V> {
    store: BlockStore,
    block_size: u32,
    read_leaf: LruCache<NodeId, Node<K, V>>,
    read_internal: LruCache<NodeId, Node<K, V>>,
    dirty_leaf: HashMap<NodeId, Node<K, V>>,
    dirty_leaf_order: Vec<NodeId>,
    dirty_internal: HashMap<NodeId, Node<K, V>>,
    dirty_internal_order: Vec<NodeId>,
    max_cache_nodes: usize,
    read_cache_leaf_cap: usize,
    read_cache_internal_cap: usize,
}

impl<K, V> PageCache<K, V>
where
    K: crate::codec::Codec,
    V: crate::codec::Codec,
{
    #[must_use]
    pub fn new(store: BlockStore, cfg: &ResolvedConfig) -> Self {
        Self {
            store,
            block_size: cfg.block_size,
            read_leaf: LruCache::new(NonZeroUsize::new(cfg.read_cache_leaf).unwrap()),
            read_internal: LruCache::new(NonZeroUsize::new(cfg.read_cache_internal).unwrap()),
            dirty_leaf: HashMap::new(),
            dirty_leaf_order: Vec::new(),
            dirty_internal: HashMap::new(),
            dirty_internal_order: Vec::new(),
            max_cache_nodes: cfg.max_cache_nodes,
            read_cache_leaf_cap: cfg.read_cache_leaf,
            read_cache_internal_cap: cfg.read_cache_internal,
        }
    }

    pub fn block_store_mut(&mut self) -> &mut BlockStore {
        &mut self.store
    }

    /// Fetches a node by id, checking the dirty pool, then the read pool,
    /// then falling back to disk. A disk hit is inserted into the read
    /// pool of the matching kind before being returned.
    ///
    /// # Errors
    /// Propagates [`crate::errors::TreeError`] from the Block Store or node
    /// deserialization.
    pub fn get(&mut self, id: NodeId) -> crate::errors::TreeResult<Node<K, V>> {
        if id.is_leaf() {
            if let Some(node) = self.dirty_leaf.get(&id) {
                return Ok(node.clone());
            }
            if let Some(node) = self.read_leaf.get(&id) {
                return Ok(node.clone());
            }
        } else {
            if let Some(node) = self.dirty_internal.get(&id) {
                return Ok(node.clone());
            }
            if let Some(node) = self.read_internal.get(&id) {
                return Ok(node.clone());
            }
        }
        log::trace!("page cache miss for block {}, reading from store", id.block());
        let buf = self.store.get(id.block() as u32)?;
        let node = Node::<K, V>::deserialize(id.block(), &buf)?;
        self.insert_read(node.clone());
        Ok(node)
    }

    fn insert_read(&mut self, node: Node<K, V>) {
        let id = node.id();
        if id.is_leaf() {
            self.read_leaf.put(id, node);
        } else {
            self.read_internal.put(id, node);
        }
    }

    /// Removes `id` from the read pool (if present) and records `node` as
    /// dirty, to be written back on the next flush.
    pub fn set_dirty(&mut self, node: Node<K, V>) {
        let id = node.id();
        if id.is_leaf() {
            self.read_leaf.pop(&id);
            if !self.dirty_leaf.contains_key(&id) {
                self.dirty_leaf_order.push(id);
            }
            self.dirty_leaf.insert(id, node);
        } else {
            self.read_internal.pop(&id);
            if !self.dirty_internal.contains_key(&id) {
                self.dirty_internal_order.push(id);
            }
            self.dirty_internal.insert(id, node);
        }
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.dirty_leaf.len() + self.dirty_internal.len()
    }

    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.dirty_count() + self.read_leaf.len() + self.read_internal.len()
    }

    /// Flushes every dirty node to the Block Store, leaves first then
    /// internals, each in ascending block index. Tombstoned nodes
    /// (`is_freeable`) are written back as a zero-filled block; their ids
    /// are returned so the caller can mark the corresponding bits free in
    /// the bitmap.
    ///
    /// # Errors
    /// Propagates [`crate::errors::TreeError`] from the Block Store.
    pub fn flush_dirty(&mut self) -> crate::errors::TreeResult<Vec<NodeId>> {
        let mut freed = Vec::new();
        self.dirty_leaf_order.sort_by_key(NodeId::block);
        for id in std::mem::take(&mut self.dirty_leaf_order) {
            if let Some(node) = self.dirty_leaf.remove(&id) {
                self.write_node(id, node, &mut freed)?;
            }
        }
        self.dirty_internal_order.sort_by_key(NodeId::block);
        for id in std::mem::take(&mut self.dirty_internal_order) {
            if let Some(node) = self.dirty_internal.remove(&id) {
                self.write_node(id, node, &mut freed)?;
            }
        }
        Ok(freed)
    }

    fn write_node(
        &mut self,
        id: NodeId,
        node: Node<K, V>,
        freed: &mut Vec<NodeId>,
    ) -> crate::errors::TreeResult<()> {
        let mut buf = vec![0u8; self.block_size as usize];
        if node.is_freeable() {
            freed.push(id);
        } else {
            node.serialize(&mut buf)?;
        }
        match self.store.set(id.block() as u32, buf) {
            Ok(_) => Ok(()),
            Err(e) => {
                log::warn!("failed to flush dirty block {}: {e}", id.block());
                Err(e)
            }
        }
    }

    /// Called after every top-level tree operation. Flushes dirty pools
    /// when they grow past 10% of the cache budget and the resident set
    /// as a whole is at capacity, then evicts least-recently-used read
    /// entries back down to their caps. The returned `bool` tells the
    /// caller whether a flush actually ran (so it can decide whether an
    /// autosync fsync is due), independent of whether any node was freed
    /// by it.
    ///
    /// # Errors
    /// Propagates [`crate::errors::TreeError`] from a forced flush.
    pub fn release_nodes(&mut self) -> crate::errors::TreeResult<(bool, Vec<NodeId>)> {
        let mut flushed = false;
        let mut freed = Vec::new();
        if self.resident_count() >= self.max_cache_nodes
            && self.dirty_count() * 10 >= self.max_cache_nodes
        {
            freed = self.flush_dirty()?;
            flushed = true;
        }
        while self.read_leaf.len() > self.read_cache_leaf_cap {
            self.read_leaf.pop_lru();
        }
        while self.read_internal.len() > self.read_cache_internal_cap {
            self.read_internal.pop_lru();
        }
        Ok((flushed, freed))
    }

    /// Inserts a freshly deserialized node straight into the matching read
    /// pool, used by the Persistence Controller's cache warm-up scan.
    pub fn populate(&mut self, node: Node<K, V>) {
        self.insert_read(node);
    }

    /// Drops every resident node (dirty and read pools alike) without
    /// touching the Block Store, used by `BPlusTree::clear` after the
    /// backing file has already been truncated.
    pub fn reset(&mut self) {
        self.read_leaf.clear();
        self.read_internal.clear();
        self.dirty_leaf.clear();
        self.dirty_leaf_order.clear();
        self.dirty_internal.clear();
        self.dirty_internal_order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TreeConfig;
    use crate::node::LeafNode;

    fn test_cache() -> (tempfile::TempDir, PageCache<u32, u32>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t");
        let cfg = TreeConfig {
            filename: path.to_str().unwrap().to_owned(),
            auto_tune: false,
            b_size: 5,
            cache_size: 1024 * 1024,
            ..TreeConfig::default()
        };
        let resolved = cfg.resolve::<u32, u32>().unwrap();
        let store = BlockStore::open(&resolved.data_path(), resolved.block_size).unwrap();
        (dir, PageCache::new(store, &resolved))
    }

    #[test]
    fn dirty_then_flush_persists_to_store() {
        let (_dir, mut cache) = test_cache();
        let mut leaf = LeafNode::<u32, u32>::new(NodeId::leaf(1));
        leaf.insert_at(0, 10, 20);
        cache.set_dirty(Node::Leaf(leaf));
        assert_eq!(cache.dirty_count(), 1);
        let freed = cache.flush_dirty().unwrap();
        assert!(freed.is_empty());
        assert_eq!(cache.dirty_count(), 0);

        let fetched = cache.get(NodeId::leaf(1)).unwrap();
        let fetched_leaf = fetched.as_leaf().unwrap();
        assert_eq!(fetched_leaf.keys, vec![10]);
    }

    #[test]
    fn freeable_node_is_reported_on_flush() {
        let (_dir, mut cache) = test_cache();
        let mut leaf = LeafNode::<u32, u32>::new(NodeId::leaf(2));
        leaf.allocated = crate::node::DELETED_MARKER;
        cache.set_dirty(Node::Leaf(leaf));
        let freed = cache.flush_dirty().unwrap();
        assert_eq!(freed, vec![NodeId::leaf(2)]);
    }
}
