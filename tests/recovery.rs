//! Reopen-and-verify coverage: committed state must survive a drop and a
//! fresh recovery from the pool file.

use fptree::{FpTree, FpTree64, TreeOptions, KV, KV_RECORD_BYTES};
use tempfile::tempdir;

type SmallTree = FpTree<4, 3>;

fn options(path: std::path::PathBuf, size: u64) -> TreeOptions {
    TreeOptions {
        pool_path: path,
        pool_size: size,
    }
}

fn scan_keys<const L: usize, const I: usize>(tree: &FpTree<L, I>, start: u64, n: usize) -> Vec<u64> {
    let mut buf = vec![0u8; n * KV_RECORD_BYTES];
    let count = tree.range_scan(start, n, &mut buf);
    (0..count)
        .map(|idx| {
            let base = idx * KV_RECORD_BYTES;
            u64::from_le_bytes(buf[base..base + 8].try_into().unwrap())
        })
        .collect()
}

#[test]
fn committed_state_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pool");
    {
        let tree: SmallTree = FpTree::with_options(options(path.clone(), 4 << 20)).unwrap();
        for key in 1..=200u64 {
            assert!(tree.insert(KV::new(key, key * 3)));
        }
    }
    let tree: SmallTree = FpTree::with_options(options(path, 4 << 20)).unwrap();
    for key in 1..=200u64 {
        assert_eq!(tree.find(key), Some(key * 3), "key {key} lost across reopen");
    }
    let keys = scan_keys(&tree, 0, 300);
    assert_eq!(keys, (1..=200u64).collect::<Vec<_>>());
    // the recovered tree keeps working
    assert!(tree.insert(KV::new(201, 603)));
    assert!(tree.delete(1));
    assert_eq!(tree.find(1), None);
    assert_eq!(tree.find(201), Some(603));
}

#[test]
fn deletes_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pool");
    {
        let tree: SmallTree = FpTree::with_options(options(path.clone(), 4 << 20)).unwrap();
        for key in 1..=100u64 {
            assert!(tree.insert(KV::new(key, key)));
        }
        for key in (2..=100u64).step_by(2) {
            assert!(tree.delete(key));
        }
    }
    let tree: SmallTree = FpTree::with_options(options(path, 4 << 20)).unwrap();
    for key in 1..=100u64 {
        let expected = (key % 2 == 1).then_some(key);
        assert_eq!(tree.find(key), expected);
    }
    assert_eq!(scan_keys(&tree, 0, 200), (1..=100u64).step_by(2).collect::<Vec<_>>());
}

#[test]
fn updates_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pool");
    {
        let tree: SmallTree = FpTree::with_options(options(path.clone(), 4 << 20)).unwrap();
        for key in 1..=50u64 {
            assert!(tree.insert(KV::new(key, key)));
        }
        for key in 1..=50u64 {
            assert!(tree.update(KV::new(key, key + 500)));
        }
    }
    let tree: SmallTree = FpTree::with_options(options(path, 4 << 20)).unwrap();
    for key in 1..=50u64 {
        assert_eq!(tree.find(key), Some(key + 500));
    }
}

#[test]
fn empty_pool_reopens_empty() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pool");
    drop(FpTree::<4, 3>::with_options(options(path.clone(), 1 << 20)).unwrap());
    let tree: SmallTree = FpTree::with_options(options(path, 1 << 20)).unwrap();
    assert_eq!(tree.find(1), None);
    assert!(tree.insert(KV::new(1, 1)));
    assert_eq!(tree.find(1), Some(1));
}

#[test]
fn production_tuning_smoke() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pool");
    {
        let tree = FpTree64::with_options(options(path.clone(), 64 << 20)).unwrap();
        for key in 0..5000u64 {
            assert!(tree.insert(KV::new(key, key.wrapping_mul(0x9E37))));
        }
        assert!(!tree.insert(KV::new(4999, 0)));
        assert_eq!(scan_keys(&tree, 0, 100), (0..100u64).collect::<Vec<_>>());
    }
    let tree = FpTree64::with_options(options(path, 64 << 20)).unwrap();
    for key in (0..5000u64).step_by(97) {
        assert_eq!(tree.find(key), Some(key.wrapping_mul(0x9E37)));
    }
    assert_eq!(scan_keys(&tree, 4990, 100), (4990..5000u64).collect::<Vec<_>>());
}
