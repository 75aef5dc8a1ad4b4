//! Crate-wide error taxonomy.
//!
//! `TreeError` carries the classification from the persistence design: most
//! variants are surfaced to callers, but [`TreeError::DuplicateKey`] is an
//! internal signal used by the insert path to distinguish "this is an update"
//! from "this is a fresh key" and must never escape a public function.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TreeError {
    /// Operation issued against a closed or never-opened engine.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Metadata magic or parameter mismatch on open; the caller is expected
    /// to invoke [`crate::BPlusTree::recovery`].
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A block failed to deserialize into a node; recoverable locally by
    /// marking the block free and continuing the scan.
    #[error("invalid node at block {block}: {reason}")]
    InvalidNode { block: i32, reason: String },

    /// Underlying file I/O failure. Moves the tree to a quiescent state.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal signal raised by the insert path when a key already exists;
    /// always caught and translated before reaching a public caller.
    #[error("duplicate key")]
    DuplicateKey,
}

pub type TreeResult<T> = Result<T, TreeError>;
