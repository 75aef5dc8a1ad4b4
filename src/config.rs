//! Tree configuration: the user-facing [`TreeConfig`] and the validated,
//! derived [`ResolvedConfig`] computed once at `open()`.

use serde::{Deserialize, Serialize};

use crate::errors::{TreeError, TreeResult};

/// Smallest admissible B-tree order. Orders below this make split/merge
/// degenerate (an under-full node of order 5 can have as few as two keys).
pub const MIN_B_ORDER: u32 = 5;

const DEFAULT_MIN_CACHE_BYTES: u64 = 1024;
const MIN_READ_POOL: usize = 37;

/// User-facing configuration for [`crate::tree::BPlusTree::open`].
///
/// Every field here is applied before `open`; mutating a `TreeConfig` after
/// the tree is open has no effect, mirroring the corpus's "options are
/// captured once, at construction" convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Base path; the tree derives `<filename>.data`, `<filename>.redo` and
    /// `<filename>.free` from it.
    pub filename: String,

    /// When `auto_tune` is set, the block size in bytes used to derive
    /// `b_order_leaf`/`b_order_internal`. When `auto_tune` is unset, this is
    /// interpreted directly as the b-order for both leaf and internal
    /// nodes.
    pub b_size: u32,

    /// Compute b-orders to maximize node occupancy within `b_size` bytes,
    /// rather than treating `b_size` as a literal order.
    pub auto_tune: bool,

    /// Soft cap, in bytes, on the total size of cached nodes. Clamped to at
    /// least 1024 bytes.
    pub cache_size: u64,

    /// Enable redo logging. Disabling this drops the crash-recovery
    /// guarantee (invariant 6 in the testable-properties list) in exchange
    /// for avoiding the append-log write path entirely.
    pub use_redo: bool,

    /// Use a dedicated writer thread to drain redo records instead of
    /// writing them inline on the calling thread.
    pub use_redo_thread: bool,

    /// Skip the read-cache warm-up scan on `open()`.
    pub disable_populate_cache: bool,

    /// Suppress the implicit fsync that `release_nodes` otherwise performs
    /// when the dirty pools are flushed.
    pub disable_autosync_store: bool,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            filename: "bptree".to_owned(),
            b_size: 4096,
            auto_tune: true,
            cache_size: 16 * 1024 * 1024,
            use_redo: true,
            use_redo_thread: false,
            disable_populate_cache: false,
            disable_autosync_store: false,
        }
    }
}

impl TreeConfig {
    /// Validate and derive the quantities the hot path needs on every call,
    /// so they are computed exactly once rather than recomputed per
    /// operation.
    ///
    /// # Errors
    /// Returns [`TreeError::InvalidData`] when `b_size` cannot produce a
    /// usable order (either too small to satisfy [`MIN_B_ORDER`], or — when
    /// `auto_tune` is false — even rather than odd).
    pub fn resolve<K, V>(&self) -> TreeResult<ResolvedConfig>
    where
        K: crate::codec::Codec,
        V: crate::codec::Codec,
    {
        let key_len = K::byte_length() as u64;
        let value_len = V::byte_length() as u64;
        if key_len == 0 {
            return Err(TreeError::InvalidData(
                "codec reports zero byte_length for key type".into(),
            ));
        }

        let (b_order_leaf, b_order_internal, block_size) = if self.auto_tune {
            let block_size = self.b_size.max(256) as u64;
            let leaf = largest_odd_order(block_size, |b| {
                estimate_leaf_size(b, key_len, value_len)
            });
            let internal = largest_odd_order(block_size, |b| estimate_internal_size(b, key_len));
            (leaf, internal, block_size as u32)
        } else {
            let order = self.b_size;
            if order < MIN_B_ORDER || order % 2 == 0 {
                return Err(TreeError::InvalidData(format!(
                    "b_size {order} must be an odd number >= {MIN_B_ORDER} when auto_tune is disabled"
                )));
            }
            let block_size =
                estimate_leaf_size(0, key_len, value_len).max(estimate_internal_size(0, key_len));
            let per_key_leaf = key_len + value_len;
            let per_key_internal = key_len + 4;
            let size = u64::from(order) * per_key_leaf.max(per_key_internal) + block_size + 64;
            (order, order, size as u32)
        };

        if b_order_leaf < MIN_B_ORDER || b_order_internal < MIN_B_ORDER {
            return Err(TreeError::InvalidData(format!(
                "block_size {} too small to fit the minimum order {MIN_B_ORDER} for this codec pair",
                self.b_size
            )));
        }

        let cache_bytes = self.cache_size.max(DEFAULT_MIN_CACHE_BYTES);
        let max_cache_nodes = (cache_bytes / u64::from(block_size)).max(1) as usize;
        let read_cache_internal = ((max_cache_nodes * 5) / 100).max(MIN_READ_POOL);
        let read_cache_leaf = ((max_cache_nodes * 95) / 100).max(MIN_READ_POOL);

        Ok(ResolvedConfig {
            filename: self.filename.clone(),
            block_size,
            b_order_leaf,
            b_order_internal,
            max_cache_nodes,
            read_cache_internal,
            read_cache_leaf,
            use_redo: self.use_redo,
            use_redo_thread: self.use_redo_thread,
            disable_populate_cache: self.disable_populate_cache,
            disable_autosync_store: self.disable_autosync_store,
        })
    }
}

/// Derived configuration computed once at `open()`, carrying every quantity
/// the hot path consults so it never has to recompute them.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub filename: String,
    pub block_size: u32,
    pub b_order_leaf: u32,
    pub b_order_internal: u32,
    pub max_cache_nodes: usize,
    pub read_cache_internal: usize,
    pub read_cache_leaf: usize,
    pub use_redo: bool,
    pub use_redo_thread: bool,
    pub disable_populate_cache: bool,
    pub disable_autosync_store: bool,
}

impl ResolvedConfig {
    #[must_use]
    pub fn data_path(&self) -> String {
        format!("{}.data", self.filename)
    }

    #[must_use]
    pub fn redo_path(&self) -> String {
        format!("{}.redo", self.filename)
    }

    #[must_use]
    pub fn free_bitmap_path(&self) -> String {
        format!("{}.free", self.filename)
    }
}

/// `id(4) + allocated(2) + keys(order*key_len) + values(order*value_len) +
/// left_id(4) + right_id(4)`, the leaf serialization layout from
/// `node.rs`.
fn estimate_leaf_size(order: u64, key_len: u64, value_len: u64) -> u64 {
    4 + 2 + order * (key_len + value_len) + 4 + 4
}

/// `id(4) + allocated(2) + keys(order*key_len) + children((order+1)*4)`, the
/// internal serialization layout from `node.rs`.
fn estimate_internal_size(order: u64, key_len: u64) -> u64 {
    4 + 2 + order * key_len + (order + 1) * 4
}

/// Largest odd order whose estimated serialized size still fits within
/// `block_size`, starting from [`MIN_B_ORDER`].
fn largest_odd_order(block_size: u64, estimate: impl Fn(u64) -> u64) -> u32 {
    let mut order = u64::from(MIN_B_ORDER);
    while estimate(order + 2) <= block_size {
        order += 2;
    }
    order as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FixedBytes;

    #[test]
    fn default_config_resolves() {
        let cfg = TreeConfig::default();
        let resolved = cfg.resolve::<u64, u64>().unwrap();
        assert!(resolved.b_order_leaf >= MIN_B_ORDER);
        assert!(resolved.b_order_internal >= MIN_B_ORDER);
        assert_eq!(resolved.b_order_leaf % 2, 1);
        assert_eq!(resolved.b_order_internal % 2, 1);
    }

    #[test]
    fn explicit_order_must_be_odd_and_above_minimum() {
        let mut cfg = TreeConfig {
            auto_tune: false,
            b_size: 4,
            ..TreeConfig::default()
        };
        assert!(cfg.resolve::<u32, u32>().is_err());

        cfg.b_size = 6;
        assert!(cfg.resolve::<u32, u32>().is_err());

        cfg.b_size = 7;
        let resolved = cfg.resolve::<u32, u32>().unwrap();
        assert_eq!(resolved.b_order_leaf, 7);
        assert_eq!(resolved.b_order_internal, 7);
    }

    #[test]
    fn cache_size_is_clamped_to_minimum() {
        let cfg = TreeConfig {
            cache_size: 0,
            ..TreeConfig::default()
        };
        let resolved = cfg.resolve::<u64, FixedBytes<16>>().unwrap();
        assert!(resolved.max_cache_nodes >= 1);
        assert!(resolved.read_cache_leaf >= MIN_READ_POOL);
        assert!(resolved.read_cache_internal >= MIN_READ_POOL);
    }

    #[test]
    fn paths_are_derived_from_filename() {
        let cfg = TreeConfig {
            filename: "/tmp/mytree".to_owned(),
            ..TreeConfig::default()
        };
        let resolved = cfg.resolve::<u64, u64>().unwrap();
        assert_eq!(resolved.data_path(), "/tmp/mytree.data");
        assert_eq!(resolved.redo_path(), "/tmp/mytree.redo");
        assert_eq!(resolved.free_bitmap_path(), "/tmp/mytree.free");
    }
}
