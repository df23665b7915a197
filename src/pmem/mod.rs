#![allow(unsafe_code)]

//! The persistent pool backing the leaf list.
//!
//! A pool is one fixed-size file mapped into the address space. The header
//! carries the format identity, the persistent head of the leaf list, and a
//! preallocated array of undo-log records; the rest of the file is a slab of
//! leaf slots. `persist` flushes a byte range to the backing media and is the
//! ordering primitive every crash-consistency protocol in the tree builds on.
//!
//! Allocator metadata is deliberately volatile: a leaf only becomes durable
//! state once it is reachable from the list head, a predecessor's forward
//! pointer, or a log record, so the free list and bump cursor are rebuilt
//! from list reachability on every open. A crash can leak at most the slots
//! an in-flight operation had allocated but never linked, and the rebuild
//! reclaims those.

use std::fs::{File, OpenOptions};
use std::mem;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use crossbeam_channel::{bounded, Receiver, Sender};
use memmap2::MmapRaw;
use parking_lot::Mutex;

use crate::error::{FpTreeError, Result};
use crate::tree::leaf::{Leaf, KV};

const POOL_MAGIC: [u8; 8] = *b"FPTPOOL1";
const POOL_VERSION: u32 = 1;

/// Total preallocated log records; the lower half serves splits, the upper
/// half deletes.
pub const LOG_ARRAY_LEN: usize = 128;
/// Log records reserved for splits.
pub const SPLIT_LOG_LEN: usize = LOG_ARRAY_LEN / 2;

/// Byte offset of the first leaf slot. Page-aligned, which also keeps every
/// 64-byte-aligned leaf stride aligned within the mapping.
const LEAF_REGION_OFFSET: u64 = 4096;

/// Identity of a leaf inside the pool: its byte offset. Offset zero is the
/// header and doubles as the null sentinel in persistent fields.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct LeafId(u64);

impl LeafId {
    pub(crate) fn from_raw(raw: u64) -> Option<LeafId> {
        (raw != 0).then_some(LeafId(raw))
    }

    pub(crate) fn to_raw(id: Option<LeafId>) -> u64 {
        id.map_or(0, |id| id.0)
    }

    pub(crate) fn offset(self) -> usize {
        self.0 as usize
    }
}

/// One undo-log record. `current` names the leaf a structural operation is
/// working on, `other` the second leaf involved; zero is the null sentinel.
#[repr(C)]
struct LogRecord {
    current: AtomicU64,
    other: AtomicU64,
}

#[repr(C)]
struct PoolHeader {
    magic: [u8; 8],
    version: u32,
    leaf_capacity: u32,
    pool_size: u64,
    crc32: u32,
    _reserved: u32,
    list_head: AtomicU64,
    logs: [LogRecord; LOG_ARRAY_LEN],
}

/// Byte length of the header prefix covered by the checksum.
const HEADER_CRC_LEN: usize = 24;

const _: () = assert!(mem::size_of::<PoolHeader>() <= LEAF_REGION_OFFSET as usize);

struct LeafAllocator {
    cursor: u64,
    free: Vec<LeafId>,
}

struct LogQueue {
    tx: Sender<usize>,
    rx: Receiver<usize>,
}

impl LogQueue {
    fn full(range: std::ops::Range<usize>) -> LogQueue {
        let (tx, rx) = bounded(range.len());
        for idx in range {
            tx.send(idx).expect("log queue sized to its index range");
        }
        LogQueue { tx, rx }
    }
}

/// A mapped pool file holding the leaf slab, the list head, and the log array.
pub struct PmemPool<const L: usize> {
    raw: MmapRaw,
    _file: File,
    path: PathBuf,
    slot_count: u64,
    alloc: Mutex<LeafAllocator>,
    split_logs: LogQueue,
    delete_logs: LogQueue,
}

impl<const L: usize> PmemPool<L> {
    const STRIDE: u64 = mem::size_of::<Leaf<L>>() as u64;

    /// Creates a fresh pool file of `size` bytes. The file starts zeroed, so
    /// the list head and every log record begin as null sentinels.
    pub fn create(path: &Path, size: u64) -> Result<Self> {
        if size < LEAF_REGION_OFFSET + Self::STRIDE {
            return Err(FpTreeError::Invalid("pool size smaller than one leaf"));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        let raw = MmapRaw::map_raw(&file)?;
        let pool = PmemPool {
            raw,
            _file: file,
            path: path.to_path_buf(),
            slot_count: (size - LEAF_REGION_OFFSET) / Self::STRIDE,
            alloc: Mutex::new(LeafAllocator {
                cursor: 0,
                free: Vec::new(),
            }),
            split_logs: LogQueue::full(0..SPLIT_LOG_LEN),
            delete_logs: LogQueue::full(SPLIT_LOG_LEN..LOG_ARRAY_LEN),
        };
        pool.write_header_identity(size);
        tracing::debug!(
            target: "fptree::pmem",
            path = %pool.path.display(),
            size,
            slots = pool.slot_count,
            "created pool"
        );
        Ok(pool)
    }

    /// Maps an existing pool file and validates its identity. Log replay and
    /// allocator rebuild are the tree's responsibility after open.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        if size < LEAF_REGION_OFFSET + Self::STRIDE {
            return Err(FpTreeError::Corruption("pool file truncated"));
        }
        let raw = MmapRaw::map_raw(&file)?;
        let pool = PmemPool {
            raw,
            _file: file,
            path: path.to_path_buf(),
            slot_count: (size - LEAF_REGION_OFFSET) / Self::STRIDE,
            alloc: Mutex::new(LeafAllocator {
                cursor: 0,
                free: Vec::new(),
            }),
            split_logs: LogQueue::full(0..SPLIT_LOG_LEN),
            delete_logs: LogQueue::full(SPLIT_LOG_LEN..LOG_ARRAY_LEN),
        };
        let header = pool.header();
        if header.magic != POOL_MAGIC {
            return Err(FpTreeError::Corruption("bad pool magic"));
        }
        if header.version != POOL_VERSION {
            return Err(FpTreeError::Corruption("unsupported pool version"));
        }
        if header.leaf_capacity != L as u32 {
            return Err(FpTreeError::Corruption("pool built for another leaf capacity"));
        }
        if header.pool_size != size {
            return Err(FpTreeError::Corruption("pool size does not match file"));
        }
        if header.crc32 != pool.header_crc() {
            return Err(FpTreeError::Corruption("pool header checksum mismatch"));
        }
        tracing::debug!(
            target: "fptree::pmem",
            path = %pool.path.display(),
            size,
            "opened pool"
        );
        Ok(pool)
    }

    fn write_header_identity(&self, size: u64) {
        // Exclusive access: the pool is not shared until create returns.
        {
            let header = unsafe { &mut *(self.raw.as_mut_ptr() as *mut PoolHeader) };
            header.magic = POOL_MAGIC;
            header.version = POOL_VERSION;
            header.leaf_capacity = L as u32;
            header.pool_size = size;
            header._reserved = 0;
        }
        let crc = self.header_crc();
        {
            let header = unsafe { &mut *(self.raw.as_mut_ptr() as *mut PoolHeader) };
            header.crc32 = crc;
        }
        self.persist_range(0, mem::size_of::<PoolHeader>());
    }

    fn header_crc(&self) -> u32 {
        let bytes = unsafe { std::slice::from_raw_parts(self.raw.as_mut_ptr(), HEADER_CRC_LEN) };
        crc32fast::hash(bytes)
    }

    fn header(&self) -> &PoolHeader {
        unsafe { &*(self.raw.as_mut_ptr() as *const PoolHeader) }
    }

    /// Number of leaf slots in the pool.
    pub fn slot_count(&self) -> u64 {
        self.slot_count
    }

    fn slot_offset(index: u64) -> u64 {
        LEAF_REGION_OFFSET + index * Self::STRIDE
    }

    /// Resolves a leaf id to its in-pool node.
    pub fn leaf(&self, id: LeafId) -> &Leaf<L> {
        debug_assert!(
            id.0 >= LEAF_REGION_OFFSET
                && id.0 < Self::slot_offset(self.slot_count)
                && (id.0 - LEAF_REGION_OFFSET) % Self::STRIDE == 0,
            "leaf id outside the slot region"
        );
        unsafe { &*(self.raw.as_mut_ptr().add(id.offset()) as *const Leaf<L>) }
    }

    /// Takes a leaf slot from the allocator. Slot contents are whatever the
    /// previous occupant left; initializers overwrite every field.
    /// Exhaustion is fatal: the engine does not recover from a full pool.
    pub fn alloc_leaf(&self) -> LeafId {
        let mut alloc = self.alloc.lock();
        if let Some(id) = alloc.free.pop() {
            return id;
        }
        assert!(alloc.cursor < self.slot_count, "persistent pool exhausted");
        let id = LeafId(Self::slot_offset(alloc.cursor));
        alloc.cursor += 1;
        id
    }

    /// Returns a slot to the allocator. The caller must have cleared any log
    /// record naming it first.
    pub fn free_leaf(&self, id: LeafId) {
        self.alloc.lock().free.push(id);
    }

    /// Reconstructs the allocator from the set of list-reachable leaves.
    pub fn rebuild_allocator(&self, reachable: &[LeafId]) {
        let mut used: Vec<u64> = reachable
            .iter()
            .map(|id| (id.0 - LEAF_REGION_OFFSET) / Self::STRIDE)
            .collect();
        used.sort_unstable();
        let cursor = used.last().map_or(0, |last| last + 1);
        let mut free = Vec::new();
        let mut next_used = used.into_iter().peekable();
        for index in 0..cursor {
            if next_used.peek() == Some(&index) {
                next_used.next();
            } else {
                free.push(LeafId(Self::slot_offset(index)));
            }
        }
        *self.alloc.lock() = LeafAllocator { cursor, free };
    }

    /// Persistent head of the leaf list.
    pub fn list_head(&self) -> Option<LeafId> {
        LeafId::from_raw(self.header().list_head.load(AtomicOrdering::Acquire))
    }

    /// Updates and persists the list head.
    pub fn set_list_head(&self, head: Option<LeafId>) {
        let slot = &self.header().list_head;
        slot.store(LeafId::to_raw(head), AtomicOrdering::Release);
        self.persist(slot as *const AtomicU64, mem::size_of::<u64>());
    }

    /// Flushes the bytes at `addr..addr+len` to the backing media. This is
    /// the persist primitive; media failure is fatal.
    pub fn persist<T>(&self, addr: *const T, len: usize) {
        let base = self.raw.as_mut_ptr() as usize;
        let offset = addr as usize - base;
        self.persist_range(offset, len);
    }

    fn persist_range(&self, offset: usize, len: usize) {
        self.raw
            .flush_range(offset, len)
            .expect("persist: flush to pool media failed");
    }

    /// Persists an entire leaf slot.
    pub fn persist_leaf(&self, id: LeafId) {
        self.persist_range(id.offset(), mem::size_of::<Leaf<L>>());
    }

    /// Persists the payload and fingerprint of one slot, the step that must
    /// reach media before the bitmap publishing it.
    pub fn persist_slot(&self, leaf: &Leaf<L>, slot: usize) {
        self.persist(leaf.kv_addr(slot), mem::size_of::<KV>());
        self.persist(leaf.fingerprint_addr(slot), 1);
    }

    /// Persists a leaf's occupancy bitmap.
    pub fn persist_bitmap(&self, leaf: &Leaf<L>) {
        self.persist(leaf.bitmap_addr(), mem::size_of::<u64>());
    }

    /// Persists a leaf's forward pointer.
    pub fn persist_next(&self, leaf: &Leaf<L>) {
        self.persist(leaf.next_addr(), mem::size_of::<u64>());
    }

    /// Borrows a split log record from the pool. Exhaustion means more
    /// concurrent structural operations than the log array was sized for,
    /// which is a precondition violation.
    pub fn acquire_split_log(&self) -> LogSlot<'_, L> {
        let idx = self
            .split_logs
            .rx
            .try_recv()
            .expect("split log pool exhausted");
        LogSlot {
            log: LogRef { pool: self, idx },
            home: &self.split_logs,
        }
    }

    /// Borrows a delete log record from the pool.
    pub fn acquire_delete_log(&self) -> LogSlot<'_, L> {
        let idx = self
            .delete_logs
            .rx
            .try_recv()
            .expect("delete log pool exhausted");
        LogSlot {
            log: LogRef { pool: self, idx },
            home: &self.delete_logs,
        }
    }

    /// Direct view of log record `idx`, used by recovery's replay sweep.
    pub fn log_record(&self, idx: usize) -> LogRef<'_, L> {
        debug_assert!(idx < LOG_ARRAY_LEN);
        LogRef { pool: self, idx }
    }

    /// Flushes the entire mapping.
    pub fn flush_all(&self) {
        let _ = self.raw.flush();
    }
}

impl<const L: usize> Drop for PmemPool<L> {
    fn drop(&mut self) {
        self.flush_all();
    }
}

/// View of one persistent log record.
pub struct LogRef<'a, const L: usize> {
    pool: &'a PmemPool<L>,
    idx: usize,
}

impl<'a, const L: usize> LogRef<'a, L> {
    fn record(&self) -> &LogRecord {
        &self.pool.header().logs[self.idx]
    }

    /// The leaf the logged operation is working on.
    pub fn current(&self) -> Option<LeafId> {
        LeafId::from_raw(self.record().current.load(AtomicOrdering::Acquire))
    }

    /// The second leaf involved in the logged operation.
    pub fn other(&self) -> Option<LeafId> {
        LeafId::from_raw(self.record().other.load(AtomicOrdering::Acquire))
    }

    /// Records and persists the operation's primary leaf.
    pub fn set_current(&self, id: Option<LeafId>) {
        let slot = &self.record().current;
        slot.store(LeafId::to_raw(id), AtomicOrdering::Release);
        self.pool.persist(slot as *const AtomicU64, mem::size_of::<u64>());
    }

    /// Records and persists the operation's secondary leaf.
    pub fn set_other(&self, id: Option<LeafId>) {
        let slot = &self.record().other;
        slot.store(LeafId::to_raw(id), AtomicOrdering::Release);
        self.pool.persist(slot as *const AtomicU64, mem::size_of::<u64>());
    }

    /// Resets both slots to the null sentinel in one persisted step.
    pub fn clear(&self) {
        let record = self.record();
        record.other.store(0, AtomicOrdering::Release);
        record.current.store(0, AtomicOrdering::Release);
        self.pool
            .persist(record as *const LogRecord, mem::size_of::<LogRecord>());
    }
}

/// A log record borrowed from one of the two log pools; returns itself on
/// drop. Completion paths clear the record before dropping the slot.
pub struct LogSlot<'a, const L: usize> {
    log: LogRef<'a, L>,
    home: &'a LogQueue,
}

impl<'a, const L: usize> Deref for LogSlot<'a, L> {
    type Target = LogRef<'a, L>;

    fn deref(&self) -> &LogRef<'a, L> {
        &self.log
    }
}

impl<const L: usize> Drop for LogSlot<'_, L> {
    fn drop(&mut self) {
        // Bounded by the number of records, so the send cannot block.
        let _ = self.home.tx.send(self.log.idx);
    }
}

#[cfg(test)]
mod tests {
    use super::{LeafId, PmemPool, LOG_ARRAY_LEN, SPLIT_LOG_LEN};
    use crate::tree::leaf::KV;
    use tempfile::tempdir;

    fn small_pool(dir: &tempfile::TempDir) -> PmemPool<4> {
        let path = dir.path().join("pool");
        PmemPool::create(&path, 1 << 20).unwrap()
    }

    #[test]
    fn create_then_open_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool");
        {
            let pool = PmemPool::<4>::create(&path, 1 << 20).unwrap();
            assert!(pool.list_head().is_none());
            assert!(pool.slot_count() > 0);
        }
        let pool = PmemPool::<4>::open(&path).unwrap();
        assert!(pool.list_head().is_none());
    }

    #[test]
    fn open_rejects_other_leaf_capacity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool");
        drop(PmemPool::<4>::create(&path, 1 << 20).unwrap());
        assert!(PmemPool::<8>::open(&path).is_err());
    }

    #[test]
    fn alloc_reuses_freed_slots() {
        let dir = tempdir().unwrap();
        let pool = small_pool(&dir);
        let a = pool.alloc_leaf();
        let b = pool.alloc_leaf();
        assert_ne!(a, b);
        pool.free_leaf(a);
        assert_eq!(pool.alloc_leaf(), a);
    }

    #[test]
    fn leaf_contents_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool");
        let id;
        {
            let pool = PmemPool::<4>::create(&path, 1 << 20).unwrap();
            id = pool.alloc_leaf();
            let leaf = pool.leaf(id);
            leaf.init_first(KV::new(42, 99), 7);
            pool.persist_leaf(id);
            pool.set_list_head(Some(id));
        }
        let pool = PmemPool::<4>::open(&path).unwrap();
        assert_eq!(pool.list_head(), Some(id));
        let leaf = pool.leaf(id);
        assert_eq!(leaf.kv(0), KV::new(42, 99));
        assert_eq!(leaf.fingerprint(0), 7);
        assert!(leaf.bitmap().test(0));
    }

    #[test]
    fn log_slots_cycle_through_the_pool() {
        let dir = tempdir().unwrap();
        let pool = small_pool(&dir);
        let id = LeafId(4096);
        {
            let log = pool.acquire_split_log();
            log.set_current(Some(id));
            log.set_other(None);
            assert_eq!(log.current(), Some(id));
            log.clear();
        }
        // Every record is available again after the borrow returns.
        let mut held = Vec::new();
        for _ in 0..SPLIT_LOG_LEN {
            held.push(pool.acquire_split_log());
        }
        drop(held);
        let _ = pool.acquire_split_log();
    }

    #[test]
    fn log_array_halves_do_not_overlap() {
        let dir = tempdir().unwrap();
        let pool = small_pool(&dir);
        let split = pool.acquire_split_log();
        let delete = pool.acquire_delete_log();
        split.set_current(Some(LeafId(4096)));
        assert!(delete.current().is_none());
        split.clear();
        assert!((SPLIT_LOG_LEN..LOG_ARRAY_LEN).all(|i| pool.log_record(i).current().is_none()));
    }
}
