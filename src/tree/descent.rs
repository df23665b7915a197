//! Descent through the volatile index.
//!
//! Operations that may restructure the tree descend once while recording the
//! path: every ancestor with the chosen child index, plus the ancestor (if
//! any) whose key array contains the search key itself. Delete rewrites that
//! ancestor's separator without re-searching, and split replays the path
//! bottom-up when publishing a new leaf.

use smallvec::SmallVec;

use super::inner::{Child, NodeId};
use super::TreeIndex;
use crate::pmem::LeafId;
use crate::stats::TreeStats;

/// Ancestor stacks are bounded; fan-out keeps real trees far shallower.
pub(crate) const MAX_DEPTH: usize = 32;

/// One ancestor on the descent path.
#[derive(Copy, Clone, Debug)]
pub(crate) struct PathEntry {
    pub(crate) node: NodeId,
    pub(crate) child_idx: usize,
}

/// The ancestor whose key array contains the search key, by path level and
/// key position.
#[derive(Copy, Clone, Debug)]
pub(crate) struct IndexNodeRef {
    pub(crate) level: usize,
    pub(crate) key_idx: usize,
}

/// Everything a structural operation needs to know about its descent.
pub(crate) struct DescentPath {
    pub(crate) entries: SmallVec<[PathEntry; MAX_DEPTH]>,
    pub(crate) index_node: Option<IndexNodeRef>,
    pub(crate) leaf: LeafId,
}

impl DescentPath {
    /// The level at which the search key appears as a separator, if any.
    pub(crate) fn index_entry(&self) -> Option<(PathEntry, usize)> {
        self.index_node
            .map(|ix| (self.entries[ix.level], ix.key_idx))
    }
}

/// Walks from the root to the leaf whose range covers `key`. Returns `None`
/// on an empty tree.
pub(crate) fn find_leaf<const I: usize>(
    index: &TreeIndex<I>,
    key: u64,
    stats: &TreeStats,
) -> Option<LeafId> {
    let mut cursor = index.root?;
    loop {
        match cursor {
            Child::Leaf(id) => {
                stats.inc_leaf_searches();
                return Some(id);
            }
            Child::Inner(node_id) => {
                stats.inc_inner_searches();
                let node = index.arena.get(node_id);
                let (child_idx, _) = node.find_child_index(key);
                cursor = node.child(child_idx);
            }
        }
    }
}

/// As [`find_leaf`], additionally recording the ancestor path and the
/// index-node position for `key`.
pub(crate) fn find_leaf_with_path<const I: usize>(
    index: &TreeIndex<I>,
    key: u64,
    stats: &TreeStats,
) -> Option<DescentPath> {
    let mut cursor = index.root?;
    let mut entries: SmallVec<[PathEntry; MAX_DEPTH]> = SmallVec::new();
    let mut index_node = None;
    loop {
        match cursor {
            Child::Leaf(id) => {
                stats.inc_leaf_searches();
                return Some(DescentPath {
                    entries,
                    index_node,
                    leaf: id,
                });
            }
            Child::Inner(node_id) => {
                stats.inc_inner_searches();
                let node = index.arena.get(node_id);
                let (child_idx, found) = node.find_child_index(key);
                if found {
                    index_node = Some(IndexNodeRef {
                        level: entries.len(),
                        key_idx: child_idx - 1,
                    });
                }
                entries.push(PathEntry {
                    node: node_id,
                    child_idx,
                });
                cursor = node.child(child_idx);
            }
        }
    }
}
