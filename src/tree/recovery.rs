//! Pool recovery: undo-log replay and volatile index reconstruction.
//!
//! Opening an existing pool replays the preallocated log array (split logs
//! first, then delete logs), resets every leaf lock word, rebuilds the leaf
//! allocator from list reachability, and bulk-loads a fresh inner-node index
//! over the ascending leaf list. Replay is idempotent: running it against an
//! already-consistent pool, or crashing inside replay and running it again,
//! converges to the same state.

use tracing::debug;

use super::inner::{Child, Inner};
use super::{find_split_key, TreeIndex};
use crate::bitset::Bitset;
use crate::error::{FpTreeError, Result};
use crate::pmem::{LeafId, PmemPool, LOG_ARRAY_LEN, SPLIT_LOG_LEN};
use crate::stats::TreeStats;

/// Replays all logs and rebuilds the volatile index for an opened pool.
pub(crate) fn recover<const L: usize, const I: usize>(
    pool: &PmemPool<L>,
    stats: &TreeStats,
) -> Result<TreeIndex<I>> {
    for idx in 0..SPLIT_LOG_LEN {
        if replay_split(pool, idx) {
            stats.inc_recovered_splits();
        }
    }
    for idx in SPLIT_LOG_LEN..LOG_ARRAY_LEN {
        if replay_delete(pool, idx) {
            stats.inc_recovered_deletes();
        }
    }
    let leaves = collect_list(pool)?;
    pool.rebuild_allocator(&leaves);
    let index = build_index(pool, &leaves)?;
    debug!(
        target: "fptree::recovery",
        leaves = leaves.len(),
        replayed_splits = stats.recovered_splits(),
        replayed_deletes = stats.recovered_deletes(),
        "pool recovered"
    );
    Ok(index)
}

/// Replays split log `idx`. Returns whether the record held an in-flight
/// operation.
pub(crate) fn replay_split<const L: usize>(pool: &PmemPool<L>, idx: usize) -> bool {
    let log = pool.log_record(idx);
    let Some(old_id) = log.current() else {
        return false;
    };
    let Some(new_id) = log.other() else {
        // the successor never became durable; any slot it claimed is
        // reclaimed by the allocator rebuild
        log.clear();
        return true;
    };
    let old = pool.leaf(old_id);
    let new = pool.leaf(new_id);
    if old.next() == Some(new_id) {
        // fully published; only the log reset was lost
        log.clear();
        return true;
    }
    // The payload array still holds every pre-split pair, so the separator
    // re-derives deterministically and the partition can be rewritten from
    // scratch no matter which bitmap stores reached the media.
    let split_key = find_split_key(old);
    let mut keep = Bitset::<L>::new();
    for slot in 0..L {
        if new.kv(slot).key >= split_key {
            keep.set(slot);
        }
    }
    new.set_bitmap(keep);
    pool.persist_bitmap(new);
    let old_bitmap = if L != 1 { keep.flipped() } else { keep };
    old.set_bitmap(old_bitmap);
    pool.persist_bitmap(old);
    new.set_next(old.next());
    pool.persist_next(new);
    old.set_next(Some(new_id));
    pool.persist_next(old);
    log.clear();
    true
}

/// Replays delete log `idx`. Returns whether the record held an in-flight
/// operation.
pub(crate) fn replay_delete<const L: usize>(pool: &PmemPool<L>, idx: usize) -> bool {
    let log = pool.log_record(idx);
    let Some(dead_id) = log.current() else {
        return false;
    };
    let dead = pool.leaf(dead_id);
    let head = pool.list_head();
    if let Some(sibling_id) = log.other() {
        // a recorded sibling makes the unlink replayable as-is
        let sibling = pool.leaf(sibling_id);
        sibling.set_next(dead.next());
        pool.persist_next(sibling);
    } else if head == Some(dead_id) {
        pool.set_list_head(dead.next());
    } else if dead.next() == head {
        // the head already advanced past the dying leaf
    } else {
        // the unlink never reached the media; the leaf stays live
    }
    log.clear();
    true
}

/// Walks the persistent leaf list, resetting the volatile lock words and
/// returning the reachable leaves in list order.
pub(crate) fn collect_list<const L: usize>(pool: &PmemPool<L>) -> Result<Vec<LeafId>> {
    let mut leaves = Vec::new();
    let mut cursor = pool.list_head();
    while let Some(id) = cursor {
        if leaves.len() as u64 > pool.slot_count() {
            return Err(FpTreeError::Corruption("cycle in persistent leaf list"));
        }
        let leaf = pool.leaf(id);
        leaf.reset_lock();
        leaves.push(id);
        cursor = leaf.next();
    }
    Ok(leaves)
}

/// Rebuilds the inner-node index over `leaves`, filling each node to
/// capacity before opening the next.
pub(crate) fn build_index<const L: usize, const I: usize>(
    pool: &PmemPool<L>,
    leaves: &[LeafId],
) -> Result<TreeIndex<I>> {
    let mut index = TreeIndex::new();
    if leaves.is_empty() {
        return Ok(index);
    }
    let mut items: Vec<(u64, Child)> = Vec::with_capacity(leaves.len());
    for &id in leaves {
        let min = pool
            .leaf(id)
            .min_key()
            .ok_or(FpTreeError::Corruption("empty leaf in persistent list"))?;
        items.push((min, Child::Leaf(id)));
    }
    for pair in items.windows(2) {
        if pair[0].0 >= pair[1].0 {
            return Err(FpTreeError::Corruption("persistent leaf list out of order"));
        }
    }
    while items.len() > 1 {
        let mut next_level = Vec::with_capacity(items.len() / (I + 1) + 1);
        let mut start = 0;
        while start < items.len() {
            let remaining = items.len() - start;
            let take = if remaining > I + 1 {
                // never strand a single child for the next group
                if remaining - (I + 1) == 1 {
                    I
                } else {
                    I + 1
                }
            } else {
                remaining
            };
            let group = &items[start..start + take];
            let mut node = Inner::<I>::init(group[1].0, group[0].1, group[1].1);
            for (pos, item) in group.iter().enumerate().skip(2) {
                node.add_key(pos - 1, item.0, item.1, true);
            }
            let id = index.arena.alloc(node);
            next_level.push((group[0].0, Child::Inner(id)));
            start += take;
        }
        items = next_level;
    }
    index.root = Some(items[0].1);
    Ok(index)
}
