//! Error type shared across the crate.
//!
//! Key-present / key-absent outcomes are ordinary boolean results of the tree
//! operations, never errors. Errors are reserved for the persistent pool:
//! opening, validating, and replaying it.

use thiserror::Error;

/// Errors surfaced by pool construction, open, and recovery.
#[derive(Debug, Error)]
pub enum FpTreeError {
    /// Underlying file or mapping operation failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// The pool contents failed a structural validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// The caller supplied an unusable configuration.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, FpTreeError>;
