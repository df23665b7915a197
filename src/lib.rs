//! # fptree: a concurrent, persistence-aware fingerprinting B+ tree
//!
//! An ordered index over 64-bit keys and values. All records live in
//! fixed-capacity persistent leaves chained into an ascending linked list;
//! volatile inner nodes route descent and are rebuilt from that list on every
//! open. Point lookups probe leaves through one-byte key fingerprints with a
//! vectorized compare, writers coordinate through per-leaf versioned locks
//! under a speculative reader/writer lock, and structural changes are made
//! crash-atomic with per-operation undo logs and explicit persist ordering.
//!
//! ## Quick start
//!
//! ```no_run
//! use fptree::{FpTree64, KV};
//!
//! let tree = FpTree64::new()?;
//! tree.insert(KV::new(7, 700));
//! assert_eq!(tree.find(7), Some(700));
//! tree.update(KV::new(7, 701));
//! tree.delete(7);
//! # Ok::<(), fptree::FpTreeError>(())
//! ```
//!
//! Reopening the same pool file replays any in-flight structural logs and
//! reconstructs the index, so committed state survives crashes.

pub mod bitset;
pub mod error;
pub mod stats;

mod pmem;
mod sync;
mod tree;

pub use error::{FpTreeError, Result};
pub use stats::{TreeStats, TreeStatsSnapshot};
pub use tree::{FpTree, FpTree64, TreeOptions, KV, KV_RECORD_BYTES};
