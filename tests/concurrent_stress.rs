//! Multi-threaded smoke coverage: concurrent operations must agree with some
//! serial order and leave the tree fully intact.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use fptree::{FpTree, TreeOptions, KV, KV_RECORD_BYTES};
use tempfile::tempdir;

type SmallTree = FpTree<4, 3>;

fn tree_at(dir: &tempfile::TempDir) -> SmallTree {
    FpTree::with_options(TreeOptions {
        pool_path: dir.path().join("pool"),
        pool_size: 16 << 20,
    })
    .unwrap()
}

fn scan_count(tree: &SmallTree, start: u64, n: usize) -> usize {
    let mut buf = vec![0u8; n * KV_RECORD_BYTES];
    tree.range_scan(start, n, &mut buf)
}

#[test]
fn disjoint_writers_preserve_all_keys() {
    let dir = tempdir().unwrap();
    let tree = tree_at(&dir);
    const WRITERS: u64 = 4;
    const PER_WRITER: u64 = 250;

    thread::scope(|scope| {
        for writer in 0..WRITERS {
            let tree = &tree;
            scope.spawn(move || {
                let base = writer * 10_000;
                for offset in 0..PER_WRITER {
                    let key = base + offset;
                    assert!(tree.insert(KV::new(key, key + 1)));
                }
            });
        }
    });

    for writer in 0..WRITERS {
        for offset in 0..PER_WRITER {
            let key = writer * 10_000 + offset;
            assert_eq!(tree.find(key), Some(key + 1), "key {key} missing");
        }
    }
    assert_eq!(
        scan_count(&tree, 0, (WRITERS * PER_WRITER) as usize + 10),
        (WRITERS * PER_WRITER) as usize
    );
}

#[test]
fn readers_run_against_writers() {
    let dir = tempdir().unwrap();
    let tree = tree_at(&dir);
    for key in 0..500u64 {
        assert!(tree.insert(KV::new(key, key)));
    }
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        let writer_tree = &tree;
        let done_flag = &done;
        scope.spawn(move || {
            for key in 500..1500u64 {
                assert!(writer_tree.insert(KV::new(key, key)));
            }
            for key in (0..500u64).step_by(2) {
                assert!(writer_tree.delete(key));
            }
            done_flag.store(true, Ordering::Release);
        });

        for _ in 0..3 {
            let reader_tree = &tree;
            let done_flag = &done;
            scope.spawn(move || {
                let mut rounds = 0u64;
                while !done_flag.load(Ordering::Acquire) || rounds < 50 {
                    // odd keys are never deleted and must stay visible
                    for key in (1..500u64).step_by(2) {
                        assert_eq!(reader_tree.find(key), Some(key));
                    }
                    let _ = scan_count(reader_tree, 0, 64);
                    rounds += 1;
                    if rounds > 10_000 {
                        break;
                    }
                }
            });
        }
    });

    for key in 0..1500u64 {
        let expected = if key < 500 && key % 2 == 0 { None } else { Some(key) };
        assert_eq!(tree.find(key), expected);
    }
}

#[test]
fn concurrent_updates_converge_to_a_written_value() {
    let dir = tempdir().unwrap();
    let tree = tree_at(&dir);
    const KEYS: u64 = 50;
    for key in 0..KEYS {
        assert!(tree.insert(KV::new(key, u64::MAX)));
    }

    thread::scope(|scope| {
        for worker in 1..=4u64 {
            let tree = &tree;
            scope.spawn(move || {
                for key in 0..KEYS {
                    assert!(tree.update(KV::new(key, worker * 1000 + key)));
                }
            });
        }
    });

    for key in 0..KEYS {
        let value = tree.find(key).expect("updated key vanished");
        let worker = value / 1000;
        assert!((1..=4).contains(&worker), "value {value} never written");
        assert_eq!(value % 1000, key);
    }
}

#[test]
fn concurrent_deletes_partition_cleanly() {
    let dir = tempdir().unwrap();
    let tree = tree_at(&dir);
    for key in 0..800u64 {
        assert!(tree.insert(KV::new(key, key)));
    }

    thread::scope(|scope| {
        for worker in 0..4u64 {
            let tree = &tree;
            scope.spawn(move || {
                // each worker owns keys congruent to it mod 4
                for key in (worker..800).step_by(4) {
                    assert!(tree.delete(key), "delete of {key} failed");
                }
            });
        }
    });

    assert_eq!(scan_count(&tree, 0, 1000), 0);
    assert_eq!(tree.find(400), None);
    // the emptied tree accepts new state
    assert!(tree.insert(KV::new(42, 4242)));
    assert_eq!(tree.find(42), Some(4242));
}
