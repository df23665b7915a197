#![allow(unsafe_code)]

//! Persistent leaf nodes.
//!
//! A leaf lives inside the mapped pool and holds up to `L` key/value pairs in
//! unordered slots. A one-byte fingerprint per slot filters probe candidates,
//! an occupancy bitmap names the live slots, and a forward pointer chains the
//! leaf into the ascending leaf list. Payload bytes are plain memory behind
//! `UnsafeCell`; every mutation happens with the leaf's versioned lock held,
//! and optimistic readers validate the version around their reads, so the
//! cells are never written and read without one side detecting the conflict.
//!
//! Slot payload of a *live* slot is immutable: inserts fill a free slot and
//! publish it with a single bitmap store, deletes only clear bitmap bits.
//! Readers that load the bitmap with acquire ordering therefore never observe
//! a half-written pair as live.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use crate::bitset::Bitset;
use crate::pmem::LeafId;

/// Seed for the stable fingerprint hash. Fixed so fingerprints written by one
/// process validate in every later one.
const FINGERPRINT_SEED: u64 = 1;

/// A key/value pair. Keys and values are 64-bit words.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KV {
    /// The key.
    pub key: u64,
    /// The value stored under `key`.
    pub value: u64,
}

impl KV {
    /// Convenience constructor.
    pub const fn new(key: u64, value: u64) -> Self {
        KV { key, value }
    }
}

/// One-byte fingerprint of a key: the low byte of a stable 64-bit hash.
pub(crate) fn one_byte_hash(key: u64) -> u8 {
    (xxhash_rust::xxh64::xxh64(&key.to_le_bytes(), FINGERPRINT_SEED) & 0xff) as u8
}

/// Result of the fused single-pass leaf scan used by delete.
#[derive(Debug, Clone, Copy)]
pub struct LeafStat {
    /// Slot holding `key`, if present.
    pub kv_idx: Option<usize>,
    /// Number of live pairs in the leaf.
    pub count: usize,
    /// Smallest live key excluding `key`; `u64::MAX` when no other key exists.
    pub min_key: u64,
}

/// Persistent leaf node. `L` is the slot capacity, at most 64.
///
/// Field order keeps the fingerprint array at offset zero so it inherits the
/// struct's 64-byte alignment, which the vectorized probe relies on.
#[repr(C, align(64))]
pub struct Leaf<const L: usize> {
    fingerprints: [UnsafeCell<u8>; L],
    bitmap: AtomicU64,
    next: AtomicU64,
    lock: AtomicU64,
    kv_pairs: [UnsafeCell<KV>; L],
}

// Concurrent access to the cells is governed by the versioned lock protocol
// described in the module docs.
unsafe impl<const L: usize> Send for Leaf<L> {}
unsafe impl<const L: usize> Sync for Leaf<L> {}

impl<const L: usize> Leaf<L> {
    /// Fingerprint stored in `slot`.
    pub(crate) fn fingerprint(&self, slot: usize) -> u8 {
        unsafe { *self.fingerprints[slot].get() }
    }

    /// Writes the fingerprint for `slot`. Caller holds the leaf lock.
    pub(crate) fn set_fingerprint(&self, slot: usize, tag: u8) {
        unsafe { *self.fingerprints[slot].get() = tag };
    }

    /// Pair stored in `slot`.
    pub(crate) fn kv(&self, slot: usize) -> KV {
        unsafe { *self.kv_pairs[slot].get() }
    }

    /// Writes the pair for `slot`. Caller holds the leaf lock.
    pub(crate) fn set_kv(&self, slot: usize, kv: KV) {
        unsafe { *self.kv_pairs[slot].get() = kv };
    }

    /// Current occupancy bitmap.
    pub(crate) fn bitmap(&self) -> Bitset<L> {
        Bitset::from_raw(self.bitmap.load(AtomicOrdering::Acquire))
    }

    /// Publishes a new occupancy bitmap in a single store. Caller holds the
    /// leaf lock.
    pub(crate) fn set_bitmap(&self, bitmap: Bitset<L>) {
        self.bitmap.store(bitmap.raw(), AtomicOrdering::Release);
    }

    /// Whether every slot is occupied.
    pub(crate) fn is_full(&self) -> bool {
        self.bitmap().is_full()
    }

    /// Forward pointer in the leaf list.
    pub(crate) fn next(&self) -> Option<LeafId> {
        LeafId::from_raw(self.next.load(AtomicOrdering::Acquire))
    }

    /// Updates the forward pointer. Caller holds the leaf lock (or exclusive
    /// access during split construction and recovery).
    pub(crate) fn set_next(&self, next: Option<LeafId>) {
        self.next.store(LeafId::to_raw(next), AtomicOrdering::Release);
    }

    /// Attempts to take exclusive ownership of the leaf. Returns `false`
    /// instead of spinning so optimistic callers can abort their attempt.
    pub(crate) fn try_lock(&self) -> bool {
        let version = self.lock.load(AtomicOrdering::Relaxed);
        if version & 1 != 0 {
            return false;
        }
        self.lock
            .compare_exchange(
                version,
                version.wrapping_add(1),
                AtomicOrdering::Acquire,
                AtomicOrdering::Relaxed,
            )
            .is_ok()
    }

    /// Releases exclusive ownership, advancing the version so readers that
    /// overlapped the critical section fail validation.
    pub(crate) fn unlock(&self) {
        let version = self.lock.load(AtomicOrdering::Relaxed);
        debug_assert!(version & 1 != 0, "unlock of an unheld leaf lock");
        self.lock
            .store(version.wrapping_add(1), AtomicOrdering::Release);
    }

    /// Current version word; odd means locked.
    pub(crate) fn version(&self) -> u64 {
        self.lock.load(AtomicOrdering::Acquire)
    }

    /// Version word if the leaf is currently unlocked, `None` otherwise.
    /// The start of an optimistic read.
    pub(crate) fn version_stable(&self) -> Option<u64> {
        let version = self.lock.load(AtomicOrdering::Acquire);
        (version & 1 == 0).then_some(version)
    }

    /// Marks a freshly allocated slot as locked without rewinding the version
    /// a stale reader may already have sampled.
    pub(crate) fn seed_lock_locked(&self) {
        self.lock.fetch_or(1, AtomicOrdering::AcqRel);
    }

    /// Advances a freshly allocated slot to an unlocked version.
    pub(crate) fn seed_lock_unlocked(&self) {
        let version = self.lock.load(AtomicOrdering::Relaxed);
        self.lock
            .store((version | 1).wrapping_add(1), AtomicOrdering::Release);
    }

    /// Clears the lock word. Only valid on pool open, before any thread can
    /// observe the leaf.
    pub(crate) fn reset_lock(&self) {
        self.lock.store(0, AtomicOrdering::Relaxed);
    }

    /// Initializes a recycled slot as a single-pair leaf. Caller persists.
    pub(crate) fn init_first(&self, kv: KV, tag: u8) {
        self.seed_lock_unlocked();
        self.set_next(None);
        self.set_bitmap(Bitset::new());
        self.add_kv(kv, tag);
    }

    /// Initializes a recycled slot as a byte-for-byte copy of `src`, born
    /// locked so it stays private until its parent pointer is published.
    /// Caller persists.
    pub(crate) fn init_copy_of(&self, src: &Leaf<L>) {
        self.seed_lock_locked();
        for slot in 0..L {
            self.set_fingerprint(slot, src.fingerprint(slot));
            self.set_kv(slot, src.kv(slot));
        }
        self.set_next(src.next());
        self.set_bitmap(src.bitmap());
    }

    /// Writes a pair into the first free slot. Requires a free slot; callers
    /// serialize through the leaf lock and persist payload before bitmap.
    pub(crate) fn add_kv(&self, kv: KV, tag: u8) -> usize {
        let mut bitmap = self.bitmap();
        let slot = bitmap.first_zero();
        debug_assert!(slot < L, "add_kv on a full leaf");
        self.set_fingerprint(slot, tag);
        self.set_kv(slot, kv);
        bitmap.set(slot);
        self.set_bitmap(bitmap);
        slot
    }

    /// Clears the occupancy bit for `slot`; the payload bytes stay behind.
    pub(crate) fn remove_kv_by_idx(&self, slot: usize) {
        let mut bitmap = self.bitmap();
        debug_assert!(bitmap.test(slot), "remove of a vacant slot");
        bitmap.reset(slot);
        self.set_bitmap(bitmap);
    }

    /// Probes for `key`: one vector compare over the fingerprint array yields
    /// candidate slots, intersected with the bitmap, and only candidates are
    /// key-compared.
    pub(crate) fn find_kv_index(&self, key: u64, tag: u8) -> Option<usize> {
        let mut candidates =
            Bitset::<L>::from_raw(self.probe_mask(tag) & self.bitmap.load(AtomicOrdering::Acquire));
        loop {
            let slot = candidates.first_set();
            if slot == L {
                return None;
            }
            if self.kv(slot).key == key {
                return Some(slot);
            }
            candidates.reset(slot);
        }
    }

    /// Smallest live key, if any.
    pub(crate) fn min_key(&self) -> Option<u64> {
        self.iter_live().map(|kv| kv.key).min()
    }

    /// Fused single-pass scan: live count, slot of `key`, and the minimum key
    /// excluding `key`. The hot path of delete.
    pub(crate) fn get_stat(&self, key: u64) -> LeafStat {
        let mut stat = LeafStat {
            kv_idx: None,
            count: 0,
            min_key: u64::MAX,
        };
        for slot in self.bitmap().iter() {
            let kv = self.kv(slot);
            stat.count += 1;
            if kv.key == key {
                stat.kv_idx = Some(slot);
            } else if kv.key < stat.min_key {
                stat.min_key = kv.key;
            }
        }
        stat
    }

    /// Iterates the live pairs in slot order.
    pub(crate) fn iter_live(&self) -> impl Iterator<Item = KV> + '_ {
        self.bitmap().iter().map(move |slot| self.kv(slot))
    }

    /// Bitmask of slots whose fingerprint equals `tag`, including vacant ones.
    fn probe_mask(&self, tag: u8) -> u64 {
        #[cfg(target_arch = "x86_64")]
        if L % 16 == 0 {
            return unsafe { self.probe_mask_sse2(tag) };
        }
        // Capacities that are not a whole number of vector lanes fall back to
        // the scalar probe, as do non-x86 targets.
        let mut mask = 0u64;
        for slot in 0..L {
            if self.fingerprint(slot) == tag {
                mask |= 1 << slot;
            }
        }
        mask
    }

    /// Compares 16 fingerprints per step against a broadcast of `tag`.
    /// The array is 64-byte aligned, so every 16-byte chunk load is aligned.
    #[cfg(target_arch = "x86_64")]
    unsafe fn probe_mask_sse2(&self, tag: u8) -> u64 {
        use std::arch::x86_64::{_mm_cmpeq_epi8, _mm_load_si128, _mm_movemask_epi8, _mm_set1_epi8};

        let needle = _mm_set1_epi8(tag as i8);
        let base = self.fingerprints.as_ptr() as *const u8;
        let mut mask = 0u64;
        let mut offset = 0;
        while offset < L {
            let chunk = _mm_load_si128(base.add(offset).cast());
            let eq = _mm_cmpeq_epi8(chunk, needle);
            mask |= (_mm_movemask_epi8(eq) as u32 as u64) << offset;
            offset += 16;
        }
        mask
    }

    /// Address of the fingerprint byte for `slot`, for persist-range math.
    pub(crate) fn fingerprint_addr(&self, slot: usize) -> *const u8 {
        self.fingerprints[slot].get() as *const u8
    }

    /// Address of the pair for `slot`, for persist-range math.
    pub(crate) fn kv_addr(&self, slot: usize) -> *const u8 {
        self.kv_pairs[slot].get() as *const u8
    }

    /// Address of the bitmap word, for persist-range math.
    pub(crate) fn bitmap_addr(&self) -> *const u8 {
        &self.bitmap as *const AtomicU64 as *const u8
    }

    /// Address of the forward pointer, for persist-range math.
    pub(crate) fn next_addr(&self) -> *const u8 {
        &self.next as *const AtomicU64 as *const u8
    }
}
