//! The Tree Engine: the public `BPlusTree<K, V>` facade tying together the
//! Node Layer, Page Cache, Block Store, Redo Log, Free-Block Bitmap and
//! Persistence Controller.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::bitmap::FreeBitmap;
use crate::block_store::BlockStore;
use crate::cache::PageCache;
use crate::codec::Codec;
use crate::config::{ResolvedConfig, TreeConfig};
use crate::errors::{TreeError, TreeResult};
use crate::node::{InternalNode, LeafNode, Node, NodeId, DELETED_MARKER};
use crate::persistence::{self, Metadata};
use crate::redo::{self, RedoLog, RedoOptions};

enum NearestMode {
    Ceiling,
    Floor,
    Higher,
    Lower,
}

/// `Created -> Opened -> Closed`. `open()` can only be called from
/// `Created`; every other operation requires `Opened`; once `Closed`,
/// every operation raises [`TreeError::InvalidState`].
enum Handle<K, V> {
    Created(TreeConfig),
    Opened(Inner<K, V>),
    Closed,
}

struct Inner<K, V> {
    cfg: ResolvedConfig,
    cache: PageCache<K, V>,
    bitmap: FreeBitmap,
    redo: Option<RedoLog>,
    meta: Metadata,
    sync_callback: Option<Box<dyn FnMut(u64) + Send>>,
}

/// An embedded, ordered key-value store backed by a persistent B+Tree.
///
/// Every public operation is serialized under one exclusive lock — there
/// is no fine-grained internal concurrency, matching the single-writer
/// contract this engine is built around.
pub struct BPlusTree<K, V> {
    state: Mutex<Handle<K, V>>,
}

impl<K, V> BPlusTree<K, V>
where
    K: Codec,
    V: Codec,
{
    #[must_use]
    pub fn new(cfg: TreeConfig) -> Self {
        Self {
            state: Mutex::new(Handle::Created(cfg)),
        }
    }

    /// Opens the tree: reads or creates the metadata block, optionally
    /// warms the read cache, and opens the redo log.
    ///
    /// # Errors
    /// [`TreeError::InvalidState`] if already open or closed.
    /// [`TreeError::InvalidData`] if the metadata magic doesn't match or
    /// the last shutdown was unclean — callers should invoke
    /// [`BPlusTree::recovery`] instead of `open` in the latter case.
    pub fn open(&self) -> TreeResult<()> {
        let mut guard = self.state.lock();
        let cfg = match &*guard {
            Handle::Created(cfg) => cfg.clone(),
            Handle::Opened(_) => {
                return Err(TreeError::InvalidState("tree is already open".into()))
            }
            Handle::Closed => return Err(TreeError::InvalidState("tree is closed".into())),
        };

        let resolved = cfg.resolve::<K, V>()?;
        let mut store = BlockStore::open(&resolved.data_path(), resolved.block_size)?;
        let existing_blocks = store.size_in_blocks()?;

        let (mut meta, fresh) = if existing_blocks == 0 {
            (
                Metadata::empty(
                    resolved.block_size,
                    resolved.b_order_leaf,
                    resolved.b_order_internal,
                ),
                true,
            )
        } else {
            let buf = store.get(0)?;
            (Metadata::deserialize(&buf)?, false)
        };

        if !fresh && !meta.clean {
            return Err(TreeError::InvalidData(
                "last shutdown was unclean; call recovery() instead of open()".into(),
            ));
        }

        let mut bitmap = if fresh {
            FreeBitmap::new()
        } else {
            std::fs::read(resolved.free_bitmap_path())
                .ok()
                .map(|bytes| FreeBitmap::deserialize(&bytes))
                .transpose()?
                .unwrap_or_default()
        };
        let _ = std::fs::remove_file(resolved.free_bitmap_path());

        let mut cache = PageCache::new(store, &resolved);

        if fresh {
            let root_block = meta.storage_block;
            meta.storage_block += 1;
            let root_id = NodeId::leaf(root_block as i32);
            cache.set_dirty(Node::Leaf(LeafNode::new(root_id)));
            meta.root_id = root_id;
            meta.low_id = root_id;
            meta.high_id = root_id;
            meta.height = 1;
        } else if !resolved.disable_populate_cache {
            persistence::populate_cache(
                &mut cache,
                &mut bitmap,
                meta.storage_block,
                resolved.max_cache_nodes,
            )?;
        }

        meta.clean = false;
        let buf = meta.serialize(resolved.block_size);
        cache.block_store_mut().set(0, buf)?;

        let redo = if resolved.use_redo {
            let mut log = RedoLog::open(&resolved.redo_path(), RedoOptions::default())?;
            if resolved.use_redo_thread {
                log.start_writer_thread();
            }
            Some(log)
        } else {
            None
        };

        log::debug!(
            "opened tree at {} (fresh={fresh}, elements={})",
            resolved.filename,
            meta.elements
        );

        *guard = Handle::Opened(Inner {
            cfg: resolved,
            cache,
            bitmap,
            redo,
            meta,
            sync_callback: None,
        });
        Ok(())
    }

    /// Drains the redo thread (if any), flushes dirty pages, writes
    /// metadata with the clean flag set, persists the free bitmap
    /// sidecar, and closes the stores. Idempotent: calling `close` on an
    /// already-closed tree is a no-op.
    ///
    /// # Errors
    /// Propagates I/O failures encountered while flushing or syncing.
    pub fn close(&self) -> TreeResult<()> {
        let mut guard = self.state.lock();
        let Handle::Opened(mut inner) = std::mem::replace(&mut *guard, Handle::Closed) else {
            *guard = Handle::Closed;
            return Ok(());
        };

        if let Some(redo) = &mut inner.redo {
            redo.stop_writer_thread()?;
        }
        inner.sync_internal()?;
        inner.meta.clean = true;
        let buf = inner.meta.serialize(inner.cfg.block_size);
        inner.cache.block_store_mut().set(0, buf)?;
        inner.cache.block_store_mut().sync()?;

        let bitmap_bytes = inner.bitmap.serialize();
        std::fs::write(inner.cfg.free_bitmap_path(), bitmap_bytes)?;

        log::debug!("closed tree at {}", inner.cfg.filename);
        *guard = Handle::Closed;
        Ok(())
    }

    /// Truncates the data and redo files, resets metadata, and creates a
    /// fresh empty root leaf. Requires the tree to already be open.
    ///
    /// # Errors
    /// [`TreeError::InvalidState`] if not open.
    pub fn clear(&self) -> TreeResult<()> {
        let mut guard = self.state.lock();
        let inner = Self::opened_mut(&mut guard)?;
        inner.cache.block_store_mut().clear()?;
        if let Some(redo) = &mut inner.redo {
            redo.truncate()?;
        }
        inner.cache.reset();
        inner.bitmap = FreeBitmap::new();

        let mut meta = Metadata::empty(
            inner.cfg.block_size,
            inner.cfg.b_order_leaf,
            inner.cfg.b_order_internal,
        );
        let root_id = NodeId::leaf(meta.storage_block as i32);
        meta.storage_block += 1;
        meta.root_id = root_id;
        meta.low_id = root_id;
        meta.high_id = root_id;
        meta.height = 1;
        inner.meta = meta;
        inner.cache.set_dirty(Node::Leaf(LeafNode::new(root_id)));

        let buf = inner.meta.serialize(inner.cfg.block_size);
        inner.cache.block_store_mut().set(0, buf)?;
        Ok(())
    }

    /// Rebuilds a fresh tree from a broken (unclean) data file: scans
    /// every live leaf record, re-inserts it into a temporary tree opened
    /// with `use_redo = false`, then replays the redo log against that
    /// temporary tree in order. The broken data and redo files are renamed
    /// to `.broken.<timestamp>` archives and the temporary data file is
    /// promoted in their place.
    ///
    /// # Errors
    /// [`TreeError::InvalidState`] if called while already open.
    /// [`TreeError::Io`] on a rename failure.
    pub fn recovery(&self) -> TreeResult<()> {
        let mut guard = self.state.lock();
        let cfg = match &*guard {
            Handle::Created(cfg) => cfg.clone(),
            Handle::Opened(_) => {
                return Err(TreeError::InvalidState(
                    "close the tree before recovering it".into(),
                ))
            }
            Handle::Closed => return Err(TreeError::InvalidState("tree is closed".into())),
        };
        let resolved = cfg.resolve::<K, V>()?;

        let mut broken_store = BlockStore::open(&resolved.data_path(), resolved.block_size)?;
        let storage_block = broken_store.size_in_blocks()?;
        let records =
            persistence::scan_live_leaf_records::<K, V>(&mut broken_store, storage_block)?;
        broken_store.sync()?;
        drop(broken_store);

        let temp_filename = format!("{}.recovering", resolved.filename);
        let temp_cfg = TreeConfig {
            filename: temp_filename.clone(),
            use_redo: false,
            ..cfg.clone()
        };
        let temp_tree: BPlusTree<K, V> = BPlusTree::new(temp_cfg);
        temp_tree.open()?;
        for (k, v) in records {
            temp_tree.put(k, v)?;
        }

        if resolved.use_redo {
            let mut redo = RedoLog::open(&resolved.redo_path(), RedoOptions::default())?;
            let mut offset = 0u64;
            let mut payload = Vec::new();
            while let Some(next) = redo.read(offset, &mut payload)? {
                match redo::decode_payload::<K, V>(&payload) {
                    Ok(redo::RedoOp::Put(k, v)) => {
                        temp_tree.put(k, v)?;
                    }
                    Ok(redo::RedoOp::Remove(k)) => {
                        temp_tree.remove(&k)?;
                    }
                    Err(e) => {
                        log::warn!("stopping redo replay on malformed record: {e}");
                        break;
                    }
                }
                offset = next;
            }
        }
        temp_tree.close()?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if std::path::Path::new(&resolved.data_path()).exists() {
            std::fs::rename(
                resolved.data_path(),
                format!("{}.broken.{timestamp}", resolved.data_path()),
            )?;
        }
        if std::path::Path::new(&resolved.redo_path()).exists() {
            std::fs::rename(
                resolved.redo_path(),
                format!("{}.broken.{timestamp}", resolved.redo_path()),
            )?;
        }
        std::fs::rename(
            format!("{temp_filename}.data"),
            resolved.data_path(),
        )?;
        let _ = std::fs::remove_file(format!("{temp_filename}.redo"));
        let _ = std::fs::remove_file(format!("{temp_filename}.free"));

        log::debug!("recovery for {} completed", resolved.filename);
        *guard = Handle::Created(cfg);
        Ok(())
    }

    fn opened_mut<'a>(guard: &'a mut Handle<K, V>) -> TreeResult<&'a mut Inner<K, V>> {
        match guard {
            Handle::Opened(inner) => Ok(inner),
            Handle::Created(_) => Err(TreeError::InvalidState("tree has not been opened".into())),
            Handle::Closed => Err(TreeError::InvalidState("tree is closed".into())),
        }
    }

    /// Inserts or updates `key` with `value`. Returns `false` when an
    /// existing entry was replaced rather than a new one created.
    ///
    /// # Errors
    /// [`TreeError::InvalidState`] if not open; propagates I/O failures.
    pub fn put(&self, key: K, value: V) -> TreeResult<bool> {
        let mut guard = self.state.lock();
        let inner = Self::opened_mut(&mut guard)?;
        let is_new = inner.put_inner(&key, &value)?;
        if inner.cfg.use_redo {
            let payload = redo::encode_put(&key, &value);
            if let Some(redo) = &mut inner.redo {
                redo.write(&payload)?;
            }
        }
        inner.after_op()?;
        Ok(is_new)
    }

    /// # Errors
    /// [`TreeError::InvalidState`] if not open; propagates I/O failures.
    pub fn get(&self, key: &K) -> TreeResult<Option<V>> {
        let mut guard = self.state.lock();
        let inner = Self::opened_mut(&mut guard)?;
        let (leaf_id, _path) = inner.find_leaf_path(key)?;
        let leaf_node = inner.cache.get(leaf_id)?;
        let leaf = leaf_node.as_leaf().expect("descent always ends at a leaf");
        let result = match leaf.find_slot(key) {
            Ok(idx) => Some(leaf.values[idx].clone()),
            Err(_) => None,
        };
        inner.after_op()?;
        Ok(result)
    }

    /// Deletes `key` if present. Returns whether a record was removed.
    ///
    /// # Errors
    /// [`TreeError::InvalidState`] if not open; propagates I/O failures.
    pub fn remove(&self, key: &K) -> TreeResult<bool> {
        let mut guard = self.state.lock();
        let inner = Self::opened_mut(&mut guard)?;
        let removed = inner.remove_inner(key)?;
        if removed && inner.cfg.use_redo {
            let payload = redo::encode_remove(key);
            if let Some(redo) = &mut inner.redo {
                redo.write(&payload)?;
            }
        }
        inner.after_op()?;
        Ok(removed)
    }

    /// # Errors
    /// [`TreeError::InvalidState`] if not open.
    pub fn first_key(&self) -> TreeResult<Option<K>> {
        Ok(self.first_entry()?.map(|(k, _)| k))
    }

    /// # Errors
    /// [`TreeError::InvalidState`] if not open.
    pub fn last_key(&self) -> TreeResult<Option<K>> {
        Ok(self.last_entry()?.map(|(k, _)| k))
    }

    /// # Errors
    /// [`TreeError::InvalidState`] if not open.
    pub fn first_entry(&self) -> TreeResult<Option<(K, V)>> {
        let mut guard = self.state.lock();
        let inner = Self::opened_mut(&mut guard)?;
        let entry = inner.first_entry_locked()?;
        inner.after_op()?;
        Ok(entry)
    }

    /// # Errors
    /// [`TreeError::InvalidState`] if not open.
    pub fn last_entry(&self) -> TreeResult<Option<(K, V)>> {
        let mut guard = self.state.lock();
        let inner = Self::opened_mut(&mut guard)?;
        let entry = inner.last_entry_locked()?;
        inner.after_op()?;
        Ok(entry)
    }

    /// Smallest entry with a key >= `key`.
    ///
    /// # Errors
    /// [`TreeError::InvalidState`] if not open.
    pub fn ceiling_entry(&self, key: &K) -> TreeResult<Option<(K, V)>> {
        self.nearest(key, NearestMode::Ceiling)
    }

    /// Largest entry with a key <= `key`.
    ///
    /// # Errors
    /// [`TreeError::InvalidState`] if not open.
    pub fn floor_entry(&self, key: &K) -> TreeResult<Option<(K, V)>> {
        self.nearest(key, NearestMode::Floor)
    }

    /// Smallest entry with a key strictly > `key`.
    ///
    /// # Errors
    /// [`TreeError::InvalidState`] if not open.
    pub fn higher_entry(&self, key: &K) -> TreeResult<Option<(K, V)>> {
        self.nearest(key, NearestMode::Higher)
    }

    /// Largest entry with a key strictly < `key`.
    ///
    /// # Errors
    /// [`TreeError::InvalidState`] if not open.
    pub fn lower_entry(&self, key: &K) -> TreeResult<Option<(K, V)>> {
        self.nearest(key, NearestMode::Lower)
    }

    /// # Errors
    /// [`TreeError::InvalidState`] if not open.
    pub fn ceiling_key(&self, key: &K) -> TreeResult<Option<K>> {
        Ok(self.ceiling_entry(key)?.map(|(k, _)| k))
    }

    /// # Errors
    /// [`TreeError::InvalidState`] if not open.
    pub fn floor_key(&self, key: &K) -> TreeResult<Option<K>> {
        Ok(self.floor_entry(key)?.map(|(k, _)| k))
    }

    /// # Errors
    /// [`TreeError::InvalidState`] if not open.
    pub fn higher_key(&self, key: &K) -> TreeResult<Option<K>> {
        Ok(self.higher_entry(key)?.map(|(k, _)| k))
    }

    /// # Errors
    /// [`TreeError::InvalidState`] if not open.
    pub fn lower_key(&self, key: &K) -> TreeResult<Option<K>> {
        Ok(self.lower_entry(key)?.map(|(k, _)| k))
    }

    fn nearest(&self, key: &K, mode: NearestMode) -> TreeResult<Option<(K, V)>> {
        let mut guard = self.state.lock();
        let inner = Self::opened_mut(&mut guard)?;
        let result = inner.nearest_entry(key, mode)?;
        inner.after_op()?;
        Ok(result)
    }

    /// Atomically reads and removes the lowest-keyed entry.
    ///
    /// # Errors
    /// [`TreeError::InvalidState`] if not open; propagates I/O failures.
    pub fn poll_first_entry(&self) -> TreeResult<Option<(K, V)>> {
        let mut guard = self.state.lock();
        let inner = Self::opened_mut(&mut guard)?;
        let entry = inner.first_entry_locked()?;
        if let Some((k, _)) = &entry {
            inner.remove_inner(k)?;
            if inner.cfg.use_redo {
                let payload = redo::encode_remove(k);
                if let Some(redo) = &mut inner.redo {
                    redo.write(&payload)?;
                }
            }
        }
        inner.after_op()?;
        Ok(entry)
    }

    /// Atomically reads and removes the highest-keyed entry.
    ///
    /// # Errors
    /// [`TreeError::InvalidState`] if not open; propagates I/O failures.
    pub fn poll_last_entry(&self) -> TreeResult<Option<(K, V)>> {
        let mut guard = self.state.lock();
        let inner = Self::opened_mut(&mut guard)?;
        let entry = inner.last_entry_locked()?;
        if let Some((k, _)) = &entry {
            inner.remove_inner(k)?;
            if inner.cfg.use_redo {
                let payload = redo::encode_remove(k);
                if let Some(redo) = &mut inner.redo {
                    redo.write(&payload)?;
                }
            }
        }
        inner.after_op()?;
        Ok(entry)
    }

    /// Forces a write-back of every dirty page, the metadata block (with
    /// the unclean flag — only `close()` writes clean), and the Block
    /// Store, then truncates the redo log when redo is enabled.
    ///
    /// # Errors
    /// [`TreeError::InvalidState`] if not open; propagates I/O failures.
    pub fn sync(&self) -> TreeResult<()> {
        let mut guard = self.state.lock();
        let inner = Self::opened_mut(&mut guard)?;
        inner.sync_internal()
    }

    /// Registers a callback invoked with the current storage-block count
    /// after every successful [`BPlusTree::sync`] (and the implicit sync
    /// inside `close`).
    ///
    /// # Errors
    /// [`TreeError::InvalidState`] if not open.
    pub fn set_sync_callback(&self, callback: impl FnMut(u64) + Send + 'static) -> TreeResult<()> {
        let mut guard = self.state.lock();
        let inner = Self::opened_mut(&mut guard)?;
        inner.sync_callback = Some(Box::new(callback));
        Ok(())
    }

    /// # Errors
    /// [`TreeError::InvalidState`] if not open.
    pub fn len(&self) -> TreeResult<usize> {
        let mut guard = self.state.lock();
        let inner = Self::opened_mut(&mut guard)?;
        Ok(inner.meta.elements as usize)
    }

    /// # Errors
    /// [`TreeError::InvalidState`] if not open.
    pub fn is_empty(&self) -> TreeResult<bool> {
        Ok(self.len()? == 0)
    }

    /// # Errors
    /// [`TreeError::InvalidState`] if not open.
    pub fn height(&self) -> TreeResult<u32> {
        let mut guard = self.state.lock();
        let inner = Self::opened_mut(&mut guard)?;
        Ok(inner.meta.height)
    }

    /// Ordered forward snapshot over every `(K, V)` pair at the moment of
    /// the call. Re-descends via `higher_entry` on each `next()`, so it
    /// does not hold the tree lock between calls and may miss or repeat
    /// an entry under concurrent mutation — this is a deliberate trade,
    /// not an oversight; callers needing strict snapshot isolation must
    /// suspend mutations externally.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            tree: self,
            last_key: None,
            started: false,
        }
    }
}

/// See [`BPlusTree::iter`].
pub struct Iter<'a, K, V> {
    tree: &'a BPlusTree<K, V>,
    last_key: Option<K>,
    started: bool,
}

impl<K, V> Iterator for Iter<'_, K, V>
where
    K: Codec,
    V: Codec,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        let entry = if !self.started {
            self.started = true;
            self.tree.first_entry().ok().flatten()
        } else {
            let last = self.last_key.as_ref()?;
            self.tree.higher_entry(last).ok().flatten()
        };
        if let Some((k, _)) = &entry {
            self.last_key = Some(k.clone());
        }
        entry
    }
}

impl<K, V> Inner<K, V>
where
    K: Codec,
    V: Codec,
{
    fn allocate_block(&mut self) -> u32 {
        if let Some(b) = self.bitmap.next_set_bit(1) {
            self.bitmap.clear(b);
            b
        } else {
            let b = self.meta.storage_block;
            self.meta.storage_block += 1;
            b
        }
    }

    fn find_leaf_path(&mut self, key: &K) -> TreeResult<(NodeId, Vec<(NodeId, usize)>)> {
        let mut path = Vec::new();
        let mut current = self.meta.root_id;
        loop {
            let node = self.cache.get(current)?;
            match node {
                Node::Leaf(_) => return Ok((current, path)),
                Node::Internal(internal) => {
                    let slot = internal.child_slot_for(key);
                    path.push((current, slot));
                    current = internal.children[slot];
                }
            }
        }
    }

    fn put_inner(&mut self, key: &K, value: &V) -> TreeResult<bool> {
        let (leaf_id, path) = self.find_leaf_path(key)?;
        let mut leaf_node = self.cache.get(leaf_id)?;
        let slot_result = leaf_node
            .as_leaf()
            .expect("descent always ends at a leaf")
            .find_slot(key);

        match slot_result {
            Ok(idx) => {
                leaf_node.as_leaf_mut().unwrap().values[idx] = value.clone();
                self.cache.set_dirty(leaf_node);
                return Ok(false);
            }
            Err(idx) => {
                leaf_node
                    .as_leaf_mut()
                    .unwrap()
                    .insert_at(idx, key.clone(), value.clone());
            }
        }
        self.meta.elements += 1;

        let overflow = leaf_node
            .as_leaf()
            .unwrap()
            .is_full(self.cfg.b_order_leaf);
        if !overflow {
            self.cache.set_dirty(leaf_node);
            return Ok(true);
        }

        let new_leaf_id = NodeId::leaf(self.allocate_block() as i32);
        let mut new_high = leaf_node.as_leaf_mut().unwrap().split(new_leaf_id);
        let old_right = new_high.right_id;
        if old_right.is_null() {
            self.meta.high_id = new_high.id;
        } else {
            let mut right_node = self.cache.get(old_right)?;
            if let Some(rl) = right_node.as_leaf_mut() {
                rl.left_id = new_high.id;
            }
            self.cache.set_dirty(right_node);
        }
        let mut pending_key = new_high.split_shift_keys_left();
        let mut pending_child = new_high.id;
        self.cache.set_dirty(leaf_node);
        self.cache.set_dirty(Node::Leaf(new_high));

        for (parent_id, slot) in path.into_iter().rev() {
            let mut parent_node = self.cache.get(parent_id)?;
            parent_node
                .as_internal_mut()
                .unwrap()
                .insert_at(slot, pending_key.clone(), pending_child);

            let overflow = parent_node
                .as_internal()
                .unwrap()
                .is_full(self.cfg.b_order_internal);
            if !overflow {
                self.cache.set_dirty(parent_node);
                return Ok(true);
            }

            let new_internal_id = NodeId::internal(self.allocate_block() as i32);
            let mut new_high_internal = parent_node
                .as_internal_mut()
                .unwrap()
                .split(new_internal_id);
            let promoted = new_high_internal.split_shift_keys_left();
            self.cache.set_dirty(parent_node);
            self.cache.set_dirty(Node::Internal(new_high_internal));
            pending_key = promoted;
            pending_child = new_internal_id;
        }

        let new_root_id = NodeId::internal(self.allocate_block() as i32);
        let mut new_root = InternalNode::new(new_root_id);
        new_root.children.push(self.meta.root_id);
        new_root.insert_at(0, pending_key, pending_child);
        self.cache.set_dirty(Node::Internal(new_root));
        self.meta.root_id = new_root_id;
        self.meta.height += 1;
        Ok(true)
    }

    fn remove_inner(&mut self, key: &K) -> TreeResult<bool> {
        let (leaf_id, path) = self.find_leaf_path(key)?;
        let mut leaf_node = self.cache.get(leaf_id)?;
        let idx = match leaf_node.as_leaf().unwrap().find_slot(key) {
            Ok(idx) => idx,
            Err(_) => return Ok(false),
        };
        leaf_node.as_leaf_mut().unwrap().remove_at(idx);
        self.meta.elements -= 1;

        if path.is_empty() {
            self.cache.set_dirty(leaf_node);
            return Ok(true);
        }

        let under_full = leaf_node.as_leaf().unwrap().is_under_full(self.cfg.b_order_leaf);
        self.cache.set_dirty(leaf_node);

        if !under_full {
            return Ok(true);
        }
        self.repair_underflow(path)?;
        Ok(true)
    }

    fn repair_underflow(&mut self, mut path: Vec<(NodeId, usize)>) -> TreeResult<()> {
        while let Some((parent_id, slot)) = path.pop() {
            let parent_node = self.cache.get(parent_id)?;
            let parent = parent_node.as_internal().unwrap();
            let child_id = parent.children[slot];
            let sibling_slot = if slot == 0 { slot + 1 } else { slot - 1 };
            let sibling_id = parent.children[sibling_slot];
            let parent_sep_slot = slot.min(sibling_slot);
            let (left_id, right_id) = if sibling_slot > slot {
                (child_id, sibling_id)
            } else {
                (sibling_id, child_id)
            };
            drop(parent_node);

            let continue_up = if child_id.is_leaf() {
                self.repair_leaf_pair(parent_id, parent_sep_slot, left_id, right_id, path.is_empty())?
            } else {
                self.repair_internal_pair(parent_id, parent_sep_slot, left_id, right_id, path.is_empty())?
            };
            if !continue_up {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Returns whether the caller should keep walking upward (the merge
    /// emptied a separator and the parent is itself now under-full).
    fn repair_leaf_pair(
        &mut self,
        parent_id: NodeId,
        parent_sep_slot: usize,
        left_id: NodeId,
        right_id: NodeId,
        parent_is_root: bool,
    ) -> TreeResult<bool> {
        let mut left_node = self.cache.get(left_id)?;
        let mut right_node = self.cache.get(right_id)?;
        let can_merge = LeafNode::can_merge(
            left_node.as_leaf().unwrap(),
            right_node.as_leaf().unwrap(),
            self.cfg.b_order_leaf,
        );

        if can_merge {
            let right_owned = right_node.as_leaf().unwrap().clone();
            let far_right = right_owned.right_id;
            left_node.as_leaf_mut().unwrap().merge_from(right_owned);
            if far_right.is_null() {
                self.meta.high_id = left_id;
            } else {
                let mut far_right_node = self.cache.get(far_right)?;
                if let Some(fr) = far_right_node.as_leaf_mut() {
                    fr.left_id = left_id;
                }
                self.cache.set_dirty(far_right_node);
            }
            self.cache.set_dirty(left_node);

            if let Some(r) = right_node.as_leaf_mut() {
                r.allocated = DELETED_MARKER;
            }
            self.cache.set_dirty(right_node);

            let mut parent_node = self.cache.get(parent_id)?;
            parent_node.as_internal_mut().unwrap().remove_at(parent_sep_slot);
            self.cache.set_dirty(parent_node);

            if parent_is_root {
                self.maybe_collapse_root(parent_id)?;
                return Ok(false);
            }
            let parent_allocated = self.cache.get(parent_id)?.as_internal().unwrap().allocated;
            Ok(u32::from(parent_allocated) < self.cfg.b_order_internal / 2)
        } else {
            {
                let (left_leaf, right_leaf) = (
                    left_node.as_leaf_mut().unwrap(),
                    right_node.as_leaf_mut().unwrap(),
                );
                LeafNode::redistribute(left_leaf, right_leaf);
            }
            let new_separator = right_node.as_leaf().unwrap().keys[0].clone();
            self.cache.set_dirty(left_node);
            self.cache.set_dirty(right_node);
            let mut parent_node = self.cache.get(parent_id)?;
            parent_node.as_internal_mut().unwrap().keys[parent_sep_slot] = new_separator;
            self.cache.set_dirty(parent_node);
            Ok(false)
        }
    }

    fn repair_internal_pair(
        &mut self,
        parent_id: NodeId,
        parent_sep_slot: usize,
        left_id: NodeId,
        right_id: NodeId,
        parent_is_root: bool,
    ) -> TreeResult<bool> {
        let mut left_node = self.cache.get(left_id)?;
        let mut right_node = self.cache.get(right_id)?;
        let parent_node_for_sep = self.cache.get(parent_id)?;
        let separator_key = parent_node_for_sep.as_internal().unwrap().keys[parent_sep_slot].clone();
        drop(parent_node_for_sep);

        let can_merge = InternalNode::can_merge(
            left_node.as_internal().unwrap(),
            right_node.as_internal().unwrap(),
            self.cfg.b_order_internal,
        );

        if can_merge {
            let right_owned = right_node.as_internal().unwrap().clone();
            left_node
                .as_internal_mut()
                .unwrap()
                .merge_from(separator_key, right_owned);
            self.cache.set_dirty(left_node);

            if let Some(r) = right_node.as_internal_mut() {
                r.allocated = DELETED_MARKER;
            }
            self.cache.set_dirty(right_node);

            let mut parent_node = self.cache.get(parent_id)?;
            parent_node.as_internal_mut().unwrap().remove_at(parent_sep_slot);
            self.cache.set_dirty(parent_node);

            if parent_is_root {
                self.maybe_collapse_root(parent_id)?;
                return Ok(false);
            }
            let parent_allocated = self.cache.get(parent_id)?.as_internal().unwrap().allocated;
            Ok(u32::from(parent_allocated) < self.cfg.b_order_internal / 2)
        } else {
            let new_separator = {
                let (left_internal, right_internal) = (
                    left_node.as_internal_mut().unwrap(),
                    right_node.as_internal_mut().unwrap(),
                );
                InternalNode::redistribute(left_internal, separator_key, right_internal)
            };
            self.cache.set_dirty(left_node);
            self.cache.set_dirty(right_node);
            let mut parent_node = self.cache.get(parent_id)?;
            parent_node.as_internal_mut().unwrap().keys[parent_sep_slot] = new_separator;
            self.cache.set_dirty(parent_node);
            Ok(false)
        }
    }

    fn maybe_collapse_root(&mut self, root_id: NodeId) -> TreeResult<()> {
        let mut root_node = self.cache.get(root_id)?;
        let only_child = {
            let root = root_node.as_internal().unwrap();
            (root.allocated == 0).then(|| root.children[0])
        };
        if let Some(child) = only_child {
            self.meta.root_id = child;
            self.meta.height -= 1;
            if let Some(r) = root_node.as_internal_mut() {
                r.allocated = DELETED_MARKER;
            }
            self.cache.set_dirty(root_node);
        }
        Ok(())
    }

    fn first_entry_locked(&mut self) -> TreeResult<Option<(K, V)>> {
        if self.meta.elements == 0 {
            return Ok(None);
        }
        let node = self.cache.get(self.meta.low_id)?;
        let leaf = node.as_leaf().unwrap();
        Ok(Some((leaf.keys[0].clone(), leaf.values[0].clone())))
    }

    fn last_entry_locked(&mut self) -> TreeResult<Option<(K, V)>> {
        if self.meta.elements == 0 {
            return Ok(None);
        }
        let node = self.cache.get(self.meta.high_id)?;
        let leaf = node.as_leaf().unwrap();
        let idx = leaf.allocated as usize - 1;
        Ok(Some((leaf.keys[idx].clone(), leaf.values[idx].clone())))
    }

    fn nearest_entry(&mut self, key: &K, mode: NearestMode) -> TreeResult<Option<(K, V)>> {
        let (leaf_id, _) = self.find_leaf_path(key)?;
        let mut current_id = leaf_id;
        let ascending = matches!(mode, NearestMode::Ceiling | NearestMode::Higher);
        loop {
            let node = self.cache.get(current_id)?;
            let leaf = node.as_leaf().unwrap();
            let found = leaf.find_slot(key);
            let slot = match (&mode, found) {
                (NearestMode::Ceiling, Ok(idx)) | (NearestMode::Floor, Ok(idx)) => Some(idx),
                (NearestMode::Ceiling, Err(idx)) => (idx < leaf.keys.len()).then_some(idx),
                (NearestMode::Floor, Err(idx)) => (idx > 0).then_some(idx - 1),
                (NearestMode::Higher, Ok(idx)) => (idx + 1 < leaf.keys.len()).then_some(idx + 1),
                (NearestMode::Higher, Err(idx)) => (idx < leaf.keys.len()).then_some(idx),
                (NearestMode::Lower, Ok(idx) | Err(idx)) => (idx > 0).then_some(idx - 1),
            };
            if let Some(idx) = slot {
                return Ok(Some((leaf.keys[idx].clone(), leaf.values[idx].clone())));
            }
            let next_id = if ascending { leaf.right_id } else { leaf.left_id };
            if next_id.is_null() {
                return Ok(None);
            }
            current_id = next_id;
        }
    }

    fn sync_internal(&mut self) -> TreeResult<()> {
        let freed = self.cache.flush_dirty()?;
        for id in &freed {
            self.bitmap.set(id.block() as u32);
        }
        let buf = self.meta.serialize(self.cfg.block_size);
        self.cache.block_store_mut().set(0, buf)?;
        self.cache.block_store_mut().sync()?;
        if self.cfg.use_redo {
            if let Some(redo) = &mut self.redo {
                redo.truncate()?;
            }
        }
        if let Some(cb) = &mut self.sync_callback {
            cb(u64::from(self.meta.storage_block));
        }
        Ok(())
    }

    fn after_op(&mut self) -> TreeResult<()> {
        let (flushed, freed) = self.cache.release_nodes()?;
        for id in &freed {
            self.bitmap.set(id.block() as u32);
        }
        if flushed && !self.cfg.disable_autosync_store {
            self.cache.block_store_mut().sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `b_size = 5` with `auto_tune` off pins both b-orders to exactly 5,
    /// so a handful of inserts is enough to exercise a split or merge.
    fn small_order_cfg(dir: &tempfile::TempDir, name: &str) -> TreeConfig {
        TreeConfig {
            filename: dir.path().join(name).to_str().unwrap().to_owned(),
            b_size: 5,
            auto_tune: false,
            use_redo: false,
            ..TreeConfig::default()
        }
    }

    #[test]
    fn put_reports_insert_vs_update() {
        let dir = tempfile::tempdir().unwrap();
        let tree: BPlusTree<i32, i32> = BPlusTree::new(small_order_cfg(&dir, "t"));
        tree.open().unwrap();
        assert!(tree.put(1, 10).unwrap());
        assert!(!tree.put(1, 20).unwrap());
        assert_eq!(tree.get(&1).unwrap(), Some(20));
        assert_eq!(tree.len().unwrap(), 1);
        tree.close().unwrap();
    }

    #[test]
    fn remove_then_get_is_none_and_len_zero() {
        let dir = tempfile::tempdir().unwrap();
        let tree: BPlusTree<i32, i32> = BPlusTree::new(small_order_cfg(&dir, "t"));
        tree.open().unwrap();
        tree.put(7, 70).unwrap();
        assert!(tree.remove(&7).unwrap());
        assert_eq!(tree.get(&7).unwrap(), None);
        assert_eq!(tree.len().unwrap(), 0);
        assert!(tree.is_empty().unwrap());
        tree.close().unwrap();
    }

    #[test]
    fn split_cascade_grows_height_and_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let tree: BPlusTree<i32, i32> = BPlusTree::new(small_order_cfg(&dir, "t"));
        tree.open().unwrap();
        for k in 1..20 {
            tree.put(k, k * 10).unwrap();
        }
        assert!(tree.height().unwrap() >= 2);
        let collected: Vec<i32> = tree.iter().map(|(k, _)| k).collect();
        let expected: Vec<i32> = (1..20).collect();
        assert_eq!(collected, expected);
        tree.close().unwrap();
    }

    #[test]
    fn merge_cascade_shrinks_height_back_down() {
        let dir = tempfile::tempdir().unwrap();
        let tree: BPlusTree<i32, i32> = BPlusTree::new(small_order_cfg(&dir, "t"));
        tree.open().unwrap();
        for k in 1..20 {
            tree.put(k, k * 10).unwrap();
        }
        for k in 1..15 {
            assert!(tree.remove(&k).unwrap());
        }
        assert_eq!(tree.height().unwrap(), 1);
        assert_eq!(tree.len().unwrap(), 5);
        assert_eq!(tree.first_key().unwrap(), Some(15));
        assert_eq!(tree.last_key().unwrap(), Some(19));
        tree.close().unwrap();
    }

    #[test]
    fn close_then_open_preserves_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = small_order_cfg(&dir, "t");
        {
            let tree: BPlusTree<i32, i32> = BPlusTree::new(cfg.clone());
            tree.open().unwrap();
            for k in 0..50 {
                tree.put(k, k * 2).unwrap();
            }
            tree.close().unwrap();
        }
        let reopened: BPlusTree<i32, i32> = BPlusTree::new(cfg);
        reopened.open().unwrap();
        for k in 0..50 {
            assert_eq!(reopened.get(&k).unwrap(), Some(k * 2));
        }
        assert_eq!(reopened.len().unwrap(), 50);
        reopened.close().unwrap();
    }

    #[test]
    fn endpoint_probes_match_nearest_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let tree: BPlusTree<i32, i32> = BPlusTree::new(small_order_cfg(&dir, "t"));
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

    #[test]
    fn clear_resets_to_an_empty_tree() {
        let dir = tempfile::tempdir().unwrap();
        let tree: BPlusTree<i32, i32> = BPlusTree::new(small_order_cfg(&dir, "t"));
        tree.open().unwrap();
        for k in 0..20 {
            tree.put(k, k).unwrap();
        }
        tree.clear().unwrap();
        assert_eq!(tree.len().unwrap(), 0);
        assert_eq!(tree.height().unwrap(), 1);
        assert_eq!(tree.first_key().unwrap(), None);
        tree.put(42, 42).unwrap();
        assert_eq!(tree.get(&42).unwrap(), Some(42));
        tree.close().unwrap();
    }

    #[test]
    fn poll_first_and_last_drain_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let tree: BPlusTree<i32, i32> = BPlusTree::new(small_order_cfg(&dir, "t"));
        tree.open().unwrap();
        for k in 0..10 {
            tree.put(k, k).unwrap();
        }
        assert_eq!(tree.poll_first_entry().unwrap(), Some((0, 0)));
        assert_eq!(tree.poll_last_entry().unwrap(), Some((9, 9)));
        assert_eq!(tree.len().unwrap(), 8);
        tree.close().unwrap();
    }

    #[test]
    fn operations_on_unopened_tree_report_invalid_state() {
        let tree: BPlusTree<i32, i32> = BPlusTree::new(TreeConfig::default());
        assert!(matches!(tree.put(1, 1), Err(TreeError::InvalidState(_))));
        assert!(matches!(tree.get(&1), Err(TreeError::InvalidState(_))));
    }
}
