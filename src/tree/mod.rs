//! The concurrent fingerprinting tree engine.
//!
//! Leaves are persistent, fixed-capacity, and chained into an ascending
//! singly-linked list; inner nodes are volatile routing state rebuilt from
//! that list on open. Point operations run optimistically under the
//! speculative lock's reader mode with per-leaf version validation, and
//! escalate to writer mode after bounded retries. Structural modifications
//! (split publication, leaf unlink, merge cascades) always run under writer
//! mode, while payload placement happens outside the speculative lock with
//! only the target leaf's lock held.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::bitset::Bitset;
use crate::error::Result;
use crate::pmem::{LeafId, PmemPool};
use crate::stats::TreeStats;
use crate::sync::{optimistic, SpeculativeLock, Transaction, MAX_OPTIMISTIC_RETRIES};

pub(crate) mod descent;
pub(crate) mod inner;
pub(crate) mod leaf;
pub(crate) mod recovery;

pub use leaf::KV;

use descent::DescentPath;
use inner::{Child, Inner, NodeArena, NodeId};
use leaf::{one_byte_hash, Leaf};

/// Bytes one scan record occupies in the caller's buffer: key then value,
/// little-endian.
pub const KV_RECORD_BYTES: usize = std::mem::size_of::<KV>();

/// Back-off while a scan waits for the next leaf's lock.
const SCAN_LOCK_BACKOFF: Duration = Duration::from_micros(50);

const DEFAULT_POOL_SIZE: u64 = 256 << 20;

/// Configuration for opening or creating a tree.
#[derive(Clone, Debug)]
pub struct TreeOptions {
    /// Path of the pool file. An existing file is opened and recovered, a
    /// missing one is created.
    pub pool_path: PathBuf,
    /// Pool size in bytes, fixed at creation.
    pub pool_size: u64,
}

impl Default for TreeOptions {
    fn default() -> Self {
        TreeOptions {
            pool_path: PathBuf::from("./test_pool"),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

/// The volatile index: root pointer plus the arena owning all inner nodes.
pub(crate) struct TreeIndex<const I: usize> {
    pub(crate) root: Option<Child>,
    pub(crate) arena: NodeArena<I>,
}

impl<const I: usize> TreeIndex<I> {
    const FANOUT_OK: () = assert!(I >= 2, "inner capacity must be at least 2");

    pub(crate) fn new() -> Self {
        let () = Self::FANOUT_OK;
        TreeIndex {
            root: None,
            arena: NodeArena::new(),
        }
    }
}

/// Concurrent, persistence-aware ordered index over `u64` keys and values.
///
/// `L` is the leaf slot capacity (at most 64), `I` the inner-node separator
/// capacity (at least 2). [`FpTree64`] fixes the production tuning.
pub struct FpTree<const L: usize, const I: usize> {
    index: SpeculativeLock<TreeIndex<I>>,
    pool: PmemPool<L>,
    stats: Arc<TreeStats>,
}

/// The production instantiation: 64-slot leaves, 128-way inner nodes.
pub type FpTree64 = FpTree<64, 128>;

enum Classified {
    /// Leaf locked, key absent; the bool is whether the leaf is full.
    Ready(DescentPath, bool),
    Duplicate,
    Bootstrapped,
}

impl<const L: usize, const I: usize> FpTree<L, I> {
    /// Opens the pool at the default path, creating it if missing.
    pub fn new() -> Result<Self> {
        Self::with_options(TreeOptions::default())
    }

    /// Opens or creates a tree according to `options`. Opening an existing
    /// pool replays any in-flight structural logs and rebuilds the volatile
    /// index from the persistent leaf list.
    pub fn with_options(options: TreeOptions) -> Result<Self> {
        let stats = Arc::new(TreeStats::default());
        let (pool, index) = if options.pool_path.exists() {
            let pool = PmemPool::open(&options.pool_path)?;
            let index = recovery::recover(&pool, &stats)?;
            (pool, index)
        } else {
            let pool = PmemPool::create(&options.pool_path, options.pool_size)?;
            (pool, TreeIndex::new())
        };
        Ok(FpTree {
            index: SpeculativeLock::new(index),
            pool,
            stats,
        })
    }

    /// Access the live statistics counters for this tree.
    pub fn stats(&self) -> Arc<TreeStats> {
        Arc::clone(&self.stats)
    }

    /// Returns the value stored under `key`, if any. Linearizable with
    /// respect to committed inserts, updates, and deletes.
    pub fn find(&self, key: u64) -> Option<u64> {
        let tag = one_byte_hash(key);
        let mut attempt = |index: &TreeIndex<I>| {
            let Some(leaf_id) = descent::find_leaf(index, key, &self.stats) else {
                return Transaction::Commit(None);
            };
            let leaf = self.pool.leaf(leaf_id);
            let Some(version) = leaf.version_stable() else {
                self.stats.inc_optimistic_aborts();
                return Transaction::Abort;
            };
            let value = leaf.find_kv_index(key, tag).map(|slot| leaf.kv(slot).value);
            if leaf.version() == version {
                Transaction::Commit(value)
            } else {
                self.stats.inc_optimistic_aborts();
                Transaction::Abort
            }
        };
        if let Some(value) = optimistic(&self.index, &mut attempt) {
            return value;
        }
        // reader-mode fallback: unbounded validated re-reads; leaf critical
        // sections are short and their holders never wait on a reader
        self.stats.inc_fallback_acquires();
        loop {
            {
                let guard = self.index.shared();
                if let Transaction::Commit(value) = attempt(&guard) {
                    return value;
                }
            }
            std::thread::yield_now();
        }
    }

    /// Inserts `kv`. Returns `false` and leaves the tree unchanged if the
    /// key already exists.
    pub fn insert(&self, kv: KV) -> bool {
        let tag = one_byte_hash(kv.key);
        let mut attempts = 0usize;
        let (path, needs_split) = loop {
            enum Attempt {
                Classified(DescentPath, bool),
                Duplicate,
                EmptyTree,
                Conflict,
            }
            let outcome = {
                let guard = self.index.shared();
                match descent::find_leaf_with_path(&guard, kv.key, &self.stats) {
                    None => Attempt::EmptyTree,
                    Some(path) => {
                        let leaf = self.pool.leaf(path.leaf);
                        if !leaf.try_lock() {
                            Attempt::Conflict
                        } else if leaf.find_kv_index(kv.key, tag).is_some() {
                            leaf.unlock();
                            Attempt::Duplicate
                        } else {
                            let full = leaf.is_full();
                            Attempt::Classified(path, full)
                        }
                    }
                }
            };
            match outcome {
                Attempt::Classified(path, full) => break (path, full),
                Attempt::Duplicate => return false,
                Attempt::EmptyTree => {
                    if self.bootstrap_first_leaf(kv, tag) {
                        return true;
                    }
                    // raced with another bootstrap; descend again
                }
                Attempt::Conflict => {
                    self.stats.inc_optimistic_aborts();
                    attempts += 1;
                    if attempts >= MAX_OPTIMISTIC_RETRIES {
                        match self.classify_exclusive(kv, tag) {
                            Classified::Ready(path, full) => break (path, full),
                            Classified::Duplicate => return false,
                            Classified::Bootstrapped => return true,
                        }
                    }
                    std::hint::spin_loop();
                }
            }
        };
        self.place_and_publish(&path, kv, tag, None, needs_split);
        true
    }

    /// Replaces the value stored under `kv.key`. Returns `false` if the key
    /// is absent. The replacement is crash-atomic: one persisted bitmap store
    /// clears the old slot and publishes the new one.
    pub fn update(&self, kv: KV) -> bool {
        let tag = one_byte_hash(kv.key);
        let mut attempts = 0usize;
        let (path, prev_slot, needs_split) = loop {
            enum Attempt {
                Ready(DescentPath, usize, bool),
                Absent,
                Conflict,
            }
            let outcome = {
                let guard = self.index.shared();
                match descent::find_leaf_with_path(&guard, kv.key, &self.stats) {
                    None => Attempt::Absent,
                    Some(path) => {
                        let leaf = self.pool.leaf(path.leaf);
                        if !leaf.try_lock() {
                            Attempt::Conflict
                        } else {
                            match leaf.find_kv_index(kv.key, tag) {
                                None => {
                                    leaf.unlock();
                                    Attempt::Absent
                                }
                                Some(prev) => Attempt::Ready(path, prev, leaf.is_full()),
                            }
                        }
                    }
                }
            };
            match outcome {
                Attempt::Ready(path, prev, full) => break (path, prev, full),
                Attempt::Absent => return false,
                Attempt::Conflict => {
                    self.stats.inc_optimistic_aborts();
                    attempts += 1;
                    if attempts >= MAX_OPTIMISTIC_RETRIES {
                        match self.update_exclusive(kv.key, tag) {
                            Some(ready) => break ready,
                            None => return false,
                        }
                    }
                    std::hint::spin_loop();
                }
            }
        };
        self.place_and_publish(&path, kv, tag, Some(prev_slot), needs_split);
        true
    }

    /// Deletes `key`. Returns `false` if the key is absent.
    pub fn delete(&self, key: u64) -> bool {
        let mut attempts = 0usize;
        // Fast path: removals that leave the leaf non-empty and rewrite no
        // separator. Everything else escalates to the writer-mode lock.
        while attempts < MAX_OPTIMISTIC_RETRIES {
            enum Attempt {
                Done(bool),
                Escalate,
                Conflict,
            }
            let outcome = {
                let guard = self.index.shared();
                match descent::find_leaf_with_path(&guard, key, &self.stats) {
                    None => Attempt::Done(false),
                    Some(path) => {
                        if path.index_node.is_some() {
                            Attempt::Escalate
                        } else {
                            let leaf = self.pool.leaf(path.leaf);
                            if !leaf.try_lock() {
                                Attempt::Conflict
                            } else {
                                let stat = leaf.get_stat(key);
                                match stat.kv_idx {
                                    None => {
                                        leaf.unlock();
                                        Attempt::Done(false)
                                    }
                                    Some(slot) if stat.count > 1 => {
                                        leaf.remove_kv_by_idx(slot);
                                        self.pool.persist_bitmap(leaf);
                                        leaf.unlock();
                                        Attempt::Done(true)
                                    }
                                    Some(_) => {
                                        leaf.unlock();
                                        Attempt::Escalate
                                    }
                                }
                            }
                        }
                    }
                }
            };
            match outcome {
                Attempt::Done(hit) => return hit,
                Attempt::Escalate => break,
                Attempt::Conflict => {
                    self.stats.inc_optimistic_aborts();
                    attempts += 1;
                    std::hint::spin_loop();
                }
            }
        }
        self.delete_exclusive(key)
    }

    /// Collects up to `max_records` pairs with `key >= start_key` in
    /// ascending key order, packing them into `out` as 16-byte records (key
    /// then value, little-endian). Returns the number of records copied,
    /// additionally bounded by the space in `out`.
    pub fn range_scan(&self, start_key: u64, max_records: usize, out: &mut [u8]) -> usize {
        if max_records == 0 {
            return 0;
        }
        let first = loop {
            let locked = {
                let guard = self.index.shared();
                match descent::find_leaf(&guard, start_key, &self.stats) {
                    None => return 0,
                    Some(id) => self.pool.leaf(id).try_lock().then_some(id),
                }
            };
            match locked {
                Some(id) => break id,
                None => {
                    self.stats.inc_optimistic_aborts();
                    std::thread::sleep(SCAN_LOCK_BACKOFF);
                }
            }
        };
        let mut acc: Vec<KV> = Vec::new();
        let mut cursor = first;
        acc.extend(
            self.pool
                .leaf(cursor)
                .iter_live()
                .filter(|kv| kv.key >= start_key),
        );
        while acc.len() < max_records {
            let Some(next) = self.pool.leaf(cursor).next() else {
                break;
            };
            let next_leaf = self.pool.leaf(next);
            // hand-over-hand along the list; a brief sleep on contention
            // keeps scans from live-locking against leaf writers
            while !next_leaf.try_lock() {
                std::thread::sleep(SCAN_LOCK_BACKOFF);
            }
            self.pool.leaf(cursor).unlock();
            cursor = next;
            acc.extend(next_leaf.iter_live());
        }
        self.pool.leaf(cursor).unlock();

        acc.sort_unstable_by_key(|kv| kv.key);
        let records = acc
            .len()
            .min(max_records)
            .min(out.len() / KV_RECORD_BYTES);
        for (idx, kv) in acc[..records].iter().enumerate() {
            let base = idx * KV_RECORD_BYTES;
            out[base..base + 8].copy_from_slice(&kv.key.to_le_bytes());
            out[base + 8..base + 16].copy_from_slice(&kv.value.to_le_bytes());
        }
        records
    }

    /// Installs the very first leaf. Returns `false` if another thread got
    /// there first.
    fn bootstrap_first_leaf(&self, kv: KV, tag: u8) -> bool {
        let mut guard = self.index.exclusive();
        if guard.root.is_some() {
            return false;
        }
        Self::bootstrap_locked(&self.pool, &mut guard, kv, tag);
        true
    }

    fn bootstrap_locked(pool: &PmemPool<L>, index: &mut TreeIndex<I>, kv: KV, tag: u8) {
        let id = pool.alloc_leaf();
        let leaf = pool.leaf(id);
        leaf.init_first(kv, tag);
        pool.persist_leaf(id);
        pool.set_list_head(Some(id));
        index.root = Some(Child::Leaf(id));
        trace!(target: "fptree::tree", leaf = id.offset(), "bootstrapped first leaf");
    }

    /// Writer-mode classification for insert: descend, lock the leaf, probe
    /// for a duplicate. Bootstraps the first leaf when the tree emptied in
    /// the meantime. A held leaf lock may belong to a split waiting for this
    /// very lock, so contention releases and redescends instead of spinning.
    fn classify_exclusive(&self, kv: KV, tag: u8) -> Classified {
        self.stats.inc_fallback_acquires();
        loop {
            let mut guard = self.index.exclusive();
            match descent::find_leaf_with_path(&guard, kv.key, &self.stats) {
                None => {
                    Self::bootstrap_locked(&self.pool, &mut guard, kv, tag);
                    return Classified::Bootstrapped;
                }
                Some(path) => {
                    let leaf = self.pool.leaf(path.leaf);
                    if !leaf.try_lock() {
                        drop(guard);
                        std::thread::yield_now();
                        continue;
                    }
                    if leaf.find_kv_index(kv.key, tag).is_some() {
                        leaf.unlock();
                        return Classified::Duplicate;
                    }
                    let full = leaf.is_full();
                    return Classified::Ready(path, full);
                }
            }
        }
    }

    /// Writer-mode locate for update. `None` means the key is absent.
    fn update_exclusive(&self, key: u64, tag: u8) -> Option<(DescentPath, usize, bool)> {
        self.stats.inc_fallback_acquires();
        loop {
            let guard = self.index.exclusive();
            let path = descent::find_leaf_with_path(&guard, key, &self.stats)?;
            let leaf = self.pool.leaf(path.leaf);
            if !leaf.try_lock() {
                drop(guard);
                std::thread::yield_now();
                continue;
            }
            match leaf.find_kv_index(key, tag) {
                None => {
                    leaf.unlock();
                    return None;
                }
                Some(prev) => {
                    let full = leaf.is_full();
                    return Some((path, prev, full));
                }
            }
        }
    }

    /// Phases C and D shared by insert and update: split if needed, place the
    /// payload, publish the new leaf to the parents, release the leaf locks.
    fn place_and_publish(
        &self,
        path: &DescentPath,
        kv: KV,
        tag: u8,
        replace_slot: Option<usize>,
        needs_split: bool,
    ) {
        if needs_split {
            let (mut split_key, new_leaf) = self.split_leaf(path.leaf);
            let target = if kv.key >= split_key {
                new_leaf
            } else {
                path.leaf
            };
            if L == 1 {
                // capacity-one leaves skip the bitmap flip: the incoming pair
                // claims the chosen half and the separator follows the larger
                // key
                self.pool.leaf(target).set_bitmap(Bitset::new());
                split_key = split_key.max(kv.key);
            }
            self.place(target, kv, tag, replace_slot);
            self.publish_split(path.leaf, new_leaf, split_key);
        } else {
            self.place(path.leaf, kv, tag, replace_slot);
        }
        self.pool.leaf(path.leaf).unlock();
    }

    /// Writes `kv` into the first free slot of `target` and publishes it with
    /// a single bitmap store, clearing `replace_slot` in the same store when
    /// present. Payload and fingerprint persist before the bitmap.
    fn place(&self, target: LeafId, kv: KV, tag: u8, replace_slot: Option<usize>) {
        let leaf = self.pool.leaf(target);
        let mut bitmap = leaf.bitmap();
        let slot = bitmap.first_zero();
        debug_assert!(slot < L, "payload placement on a full leaf");
        leaf.set_fingerprint(slot, tag);
        leaf.set_kv(slot, kv);
        self.pool.persist_slot(leaf, slot);
        bitmap.set(slot);
        if let Some(prev) = replace_slot {
            if prev != slot {
                bitmap.reset(prev);
            }
        }
        leaf.set_bitmap(bitmap);
        self.pool.persist_bitmap(leaf);
    }

    /// Splits a full leaf under a split log: the successor is a byte copy of
    /// the original, the partition is two persisted bitmap stores, and
    /// publication links the new leaf into the list. Returns the separator
    /// and the new leaf, which stays locked until its parent is published.
    fn split_leaf(&self, old_id: LeafId) -> (u64, LeafId) {
        let log = self.pool.acquire_split_log();
        log.set_current(Some(old_id));

        let new_id = self.pool.alloc_leaf();
        let old = self.pool.leaf(old_id);
        let new = self.pool.leaf(new_id);
        new.init_copy_of(old);
        self.pool.persist_leaf(new_id);
        log.set_other(Some(new_id));

        let split_key = find_split_key(old);
        let mut keep = new.bitmap();
        for slot in new.bitmap().iter() {
            if new.kv(slot).key < split_key {
                keep.reset(slot);
            }
        }
        new.set_bitmap(keep);
        self.pool.persist_bitmap(new);
        if L != 1 {
            old.set_bitmap(keep.flipped());
        } else {
            old.set_bitmap(keep);
        }
        self.pool.persist_bitmap(old);

        new.set_next(old.next());
        self.pool.persist_next(new);
        old.set_next(Some(new_id));
        self.pool.persist_next(old);

        log.clear();
        self.stats.inc_leaf_splits();
        trace!(
            target: "fptree::tree",
            old = old_id.offset(),
            new = new_id.offset(),
            split_key,
            "leaf split"
        );
        (split_key, new_id)
    }

    /// Second critical section of a split: install the separator and the new
    /// leaf into the parents, growing the root when propagation reaches it,
    /// then release the new leaf.
    fn publish_split(&self, old: LeafId, new: LeafId, split_key: u64) {
        let mut guard = self.index.exclusive();
        match guard.root {
            Some(Child::Leaf(root_leaf)) => {
                debug_assert_eq!(root_leaf, old);
                let root = Inner::init(split_key, Child::Leaf(old), Child::Leaf(new));
                let id = guard.arena.alloc(root);
                guard.root = Some(Child::Inner(id));
                trace!(target: "fptree::tree", split_key, "root grew from leaf");
            }
            Some(Child::Inner(_)) => {
                // the tree may have changed since classification; this
                // re-descent is authoritative
                let path = descent::find_leaf_with_path(&guard, split_key, &self.stats)
                    .expect("split source still reachable");
                debug_assert_eq!(path.leaf, old);
                self.update_parents(&mut guard, &path, split_key, Child::Leaf(new));
            }
            None => unreachable!("split of a leaf in an empty tree"),
        }
        self.pool.leaf(new).unlock();
    }

    /// Inserts `(split_key, new_child)` bottom-up along `path`, splitting
    /// full inner nodes around the median and growing the root if the
    /// propagation exhausts the path.
    fn update_parents(
        &self,
        index: &mut TreeIndex<I>,
        path: &DescentPath,
        mut split_key: u64,
        mut new_child: Child,
    ) {
        for level in (0..path.entries.len()).rev() {
            let node_id = path.entries[level].node;
            let (promoted, sibling) = {
                let parent = index.arena.get_mut(node_id);
                if !parent.is_full() {
                    let (pos, _) = parent.find_child_index(split_key);
                    parent.add_key(pos, split_key, new_child, true);
                    return;
                }
                parent.split_insert(split_key, new_child)
            };
            let sibling_id = index.arena.alloc(sibling);
            self.stats.inc_inner_splits();
            trace!(target: "fptree::tree", promoted, "inner node split");
            split_key = promoted;
            new_child = Child::Inner(sibling_id);
        }
        let old_root = index.root.take().expect("non-empty tree during split");
        let root = Inner::init(split_key, old_root, new_child);
        index.root = Some(Child::Inner(index.arena.alloc(root)));
        trace!(target: "fptree::tree", split_key, "root height grew");
    }

    /// Writer-mode delete: handles index-node rewrites and the structural
    /// unlink of a leaf losing its last pair.
    fn delete_exclusive(&self, key: u64) -> bool {
        self.stats.inc_fallback_acquires();
        loop {
            let mut guard = self.index.exclusive();
            let Some(path) = descent::find_leaf_with_path(&guard, key, &self.stats) else {
                return false;
            };
            let leaf_id = path.leaf;
            let leaf = self.pool.leaf(leaf_id);
            if !leaf.try_lock() {
                // a holder may be a split waiting for this lock; back off
                drop(guard);
                std::thread::yield_now();
                continue;
            }
            let stat = leaf.get_stat(key);
            let Some(slot) = stat.kv_idx else {
                leaf.unlock();
                return false;
            };
            if stat.count > 1 {
                // the leaf survives; a separator equal to the key is renamed
                // to the leaf's new minimum
                if let Some((entry, key_idx)) = path.index_entry() {
                    guard.arena.get_mut(entry.node).set_key(key_idx, stat.min_key);
                }
                leaf.remove_kv_by_idx(slot);
                self.pool.persist_bitmap(leaf);
                leaf.unlock();
                return true;
            }

            // last pair: the leaf disappears from index, list, and pool
            let sibling = self.left_sibling_leaf(&guard, &path);
            if let Some(sib) = sibling {
                if !self.pool.leaf(sib).try_lock() {
                    // lock order along the list is left-to-right; give up and
                    // redo the descent rather than waiting
                    leaf.unlock();
                    drop(guard);
                    std::thread::yield_now();
                    continue;
                }
            }
            if path.entries.is_empty() {
                guard.root = None;
            } else {
                self.remove_leaf_and_merge(&mut guard, &path);
            }
            drop(guard);
            self.unlink_leaf(leaf_id, sibling, !path.entries.is_empty());
            self.stats.inc_leaf_unlinks();
            return true;
        }
    }

    /// The rightmost leaf strictly left of `path.leaf`, found by walking the
    /// recorded ancestors toward the nearest left subtree.
    fn left_sibling_leaf(&self, index: &TreeIndex<I>, path: &DescentPath) -> Option<LeafId> {
        for entry in path.entries.iter().rev() {
            if entry.child_idx > 0 {
                let node = index.arena.get(entry.node);
                let mut cursor = node.child(entry.child_idx - 1);
                loop {
                    match cursor {
                        Child::Leaf(id) => return Some(id),
                        Child::Inner(node_id) => {
                            cursor = index.arena.get(node_id).last_child();
                        }
                    }
                }
            }
        }
        None
    }

    /// Persistent half of a delete: log, unlink from the list (or advance the
    /// head), clear the log, then return the storage to the allocator.
    fn unlink_leaf(&self, leaf_id: LeafId, sibling: Option<LeafId>, had_parent: bool) {
        let leaf = self.pool.leaf(leaf_id);
        let log = self.pool.acquire_delete_log();
        log.set_current(Some(leaf_id));
        match sibling {
            Some(sib) => {
                log.set_other(Some(sib));
                let sibling_leaf = self.pool.leaf(sib);
                sibling_leaf.set_next(leaf.next());
                self.pool.persist_next(sibling_leaf);
                sibling_leaf.unlock();
            }
            None if had_parent => {
                // left-most leaf: the list head advances past it
                self.pool.set_list_head(leaf.next());
            }
            None => {
                // the tree held only this leaf
                self.pool.set_list_head(None);
            }
        }
        log.clear();
        drop(log);
        self.pool.free_leaf(leaf_id);
        trace!(target: "fptree::tree", leaf = leaf_id.offset(), "leaf unlinked");
    }

    /// Detaches the dying leaf from its parent and repairs the ancestors:
    /// index-node rename, borrow or merge for emptied inner nodes, root
    /// collapse when the cascade reaches the top.
    fn remove_leaf_and_merge(&self, index: &mut TreeIndex<I>, path: &DescentPath) {
        let entries = &path.entries;
        let deepest = entries.len() - 1;
        let parent_id = entries[deepest].node;
        let child_idx = entries[deepest].child_idx;

        // A left-most removal consumes the key naming the surviving subtree;
        // that key replaces the separator in the index node above.
        let saved_key = {
            let parent = index.arena.get_mut(parent_id);
            if child_idx == 0 {
                let saved = parent.key(0);
                parent.remove_key(0, false);
                Some(saved)
            } else {
                parent.remove_key(child_idx - 1, true);
                None
            }
        };
        if let (Some((entry, key_idx)), Some(saved)) = (path.index_entry(), saved_key) {
            if entry.node != parent_id {
                index.arena.get_mut(entry.node).set_key(key_idx, saved);
            }
        }

        let mut level = deepest;
        loop {
            let node_id = entries[level].node;
            if index.arena.get(node_id).nkey() > 0 {
                break;
            }
            if level == 0 {
                let promoted = index.arena.get(node_id).child(0);
                index.arena.free(node_id);
                index.root = Some(promoted);
                trace!(target: "fptree::tree", "root collapsed");
                break;
            }
            let parent_entry = entries[level - 1];
            let pos = parent_entry.child_idx;
            let parent_nkey = index.arena.get(parent_entry.node).nkey();
            if pos > 0 && self.try_borrow_key(index, parent_entry.node, pos, pos - 1) {
                break;
            }
            if pos < parent_nkey && self.try_borrow_key(index, parent_entry.node, pos, pos + 1) {
                break;
            }
            let left = if pos > 0 { pos - 1 } else { pos };
            self.merge_inner(index, parent_entry.node, left, left + 1);
            level -= 1;
        }
    }

    /// Rotates one separator through the parent so the emptied receiver
    /// regains a key. Fails when the sender cannot spare one.
    fn try_borrow_key(
        &self,
        index: &mut TreeIndex<I>,
        parent_id: NodeId,
        receiver_idx: usize,
        sender_idx: usize,
    ) -> bool {
        let receiver_id = inner_child(index, parent_id, receiver_idx);
        let sender_id = inner_child(index, parent_id, sender_idx);
        if index.arena.get(sender_id).nkey() <= 1 {
            return false;
        }
        if receiver_idx < sender_idx {
            // receiver adopts the sender's first child
            let sep = index.arena.get(parent_id).key(receiver_idx);
            let (moved, new_sep) = {
                let sender = index.arena.get_mut(sender_id);
                let moved = sender.child(0);
                let new_sep = sender.key(0);
                sender.remove_key(0, false);
                (moved, new_sep)
            };
            index.arena.get_mut(receiver_id).add_key(0, sep, moved, true);
            index.arena.get_mut(parent_id).set_key(receiver_idx, new_sep);
            if receiver_idx > 0 {
                // the delete may have taken the receiver subtree's minimum
                let min = self.min_key_of(index, Child::Inner(receiver_id));
                index
                    .arena
                    .get_mut(parent_id)
                    .set_key(receiver_idx - 1, min);
            }
        } else {
            // receiver adopts the sender's last child
            let sep = index.arena.get(parent_id).key(sender_idx);
            let (moved, new_sep) = {
                let sender = index.arena.get_mut(sender_id);
                let moved = sender.last_child();
                let new_sep = sender.key(sender.nkey() - 1);
                sender.remove_key(sender.nkey() - 1, true);
                (moved, new_sep)
            };
            index
                .arena
                .get_mut(receiver_id)
                .add_key(0, sep, moved, false);
            index.arena.get_mut(parent_id).set_key(sender_idx, new_sep);
        }
        self.stats.inc_inner_borrows();
        true
    }

    /// Fuses the emptied node with a sibling, consuming one parent separator.
    fn merge_inner(
        &self,
        index: &mut TreeIndex<I>,
        parent_id: NodeId,
        left_idx: usize,
        right_idx: usize,
    ) {
        let left_id = inner_child(index, parent_id, left_idx);
        let right_id = inner_child(index, parent_id, right_idx);
        let sep = index.arena.get(parent_id).key(left_idx);
        if index.arena.get(left_id).nkey() == 0 {
            // fold the orphaned left node into its right sibling
            let only = index.arena.get(left_id).child(0);
            index.arena.get_mut(right_id).add_key(0, sep, only, false);
            index.arena.free(left_id);
            index.arena.get_mut(parent_id).remove_key(left_idx, false);
            if left_idx > 0 {
                let merged = index.arena.get(parent_id).child(left_idx);
                let min = self.min_key_of(index, merged);
                index.arena.get_mut(parent_id).set_key(left_idx - 1, min);
            }
        } else {
            // fold the orphaned right node into its left sibling
            let only = index.arena.get(right_id).child(0);
            let left = index.arena.get_mut(left_id);
            let pos = left.nkey();
            left.add_key(pos, sep, only, true);
            index.arena.free(right_id);
            index.arena.get_mut(parent_id).remove_key(left_idx, true);
        }
        self.stats.inc_inner_merges();
        trace!(target: "fptree::tree", "inner nodes merged");
    }

    /// Minimum live key under `child`.
    fn min_key_of(&self, index: &TreeIndex<I>, child: Child) -> u64 {
        let mut cursor = child;
        loop {
            match cursor {
                Child::Inner(node_id) => cursor = index.arena.get(node_id).child(0),
                Child::Leaf(id) => {
                    return self
                        .pool
                        .leaf(id)
                        .min_key()
                        .expect("empty leaf in live tree");
                }
            }
        }
    }
}

fn inner_child<const I: usize>(index: &TreeIndex<I>, parent: NodeId, idx: usize) -> NodeId {
    match index.arena.get(parent).child(idx) {
        Child::Inner(id) => id,
        Child::Leaf(_) => unreachable!("sibling repair below the leaf level"),
    }
}

/// Separator for splitting a full leaf: the median of a sorted scratch copy
/// of every slot's key. Valid whether or not the partition bitmaps were
/// already written, because the payload array still holds all pre-split
/// pairs.
pub(crate) fn find_split_key<const L: usize>(leaf: &Leaf<L>) -> u64 {
    let mut keys = [0u64; L];
    for slot in 0..L {
        keys[slot] = leaf.kv(slot).key;
    }
    keys.sort_unstable();
    keys[L / 2]
}
