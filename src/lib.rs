//! An embedded, single-process, ordered key-value store backed by a
//! persistent B+Tree with a block-oriented on-disk node format.
//!
//! The public surface is [`tree::BPlusTree`]: open a store with a
//! [`config::TreeConfig`], and operate on it with fixed-width
//! [`codec::Codec`] key/value types. Everything below the tree
//! (node layout, page cache, block store, redo log, free bitmap,
//! persistence controller) is exposed as its own module for testing and
//! advanced composition, but ordinary callers only need `tree` and
//! `config`.

// `deny`, not `forbid`: the `mmap` feature's block store isolates its one
// unsafe block behind a local `#![allow(unsafe_code)]` in
// `block_store::mmap`, and `forbid` cannot be downgraded by a child module.
#![deny(unsafe_code)]

pub mod bitmap;
pub mod block_store;
pub mod buffer_pool;
pub mod cache;
pub mod codec;
pub mod config;
pub mod errors;
pub mod node;
pub mod persistence;
pub mod redo;
pub mod tree;

pub use codec::{Codec, FixedBytes};
pub use config::TreeConfig;
pub use errors::{TreeError, TreeResult};
pub use tree::{BPlusTree, Iter};
