//! Tests for concurrent access
//!
//! These tests verify:
//! - Disjoint writers never lose each other's keys
//! - Writers racing on the same keys leave one valid value per key
//! - Readers running against splitting writers never see torn state
//! - Scanners stay ordered while the map changes underneath them
//! - A snapshot's view of a key never moves while writers race on it

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use sortedkv::{BigSortedMap, Config};

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_small_block_map() -> BigSortedMap {
    let config = Config::builder()
        .max_data_block_size(512)
        .max_index_block_size(1024)
        .lock_stripes(16)
        .build();
    BigSortedMap::open(config).unwrap()
}

fn key(thread: usize, i: usize) -> Vec<u8> {
    format!("t{:02}:{:06}", thread, i).into_bytes()
}

// =============================================================================
// Writer Tests
// =============================================================================

#[test]
fn test_concurrent_disjoint_writers() {
    let map = setup_small_block_map();
    let threads = 4;
    let per_thread = 1500;

    thread::scope(|s| {
        for t in 0..threads {
            let map = &map;
            s.spawn(move || {
                for i in 0..per_thread {
                    assert!(map.put(&key(t, i), format!("{}", i).as_bytes(), 0).unwrap());
                }
            });
        }
    });

    assert!(map.stats().index_blocks > 1);
    for t in 0..threads {
        for i in 0..per_thread {
            assert_eq!(map.get(&key(t, i)).unwrap(), Some(format!("{}", i).into_bytes()));
        }
    }
}

#[test]
fn test_concurrent_interleaved_writers() {
    let map = setup_small_block_map();
    let threads = 4;
    let per_thread = 1000;

    // thread t writes keys t, t + threads, t + 2 * threads, ...
    thread::scope(|s| {
        for t in 0..threads {
            let map = &map;
            s.spawn(move || {
                for n in 0..per_thread {
                    let i = n * threads + t;
                    map.put(&key(0, i), &i.to_be_bytes(), 0).unwrap();
                }
            });
        }
    });

    let mut scanner = map.scanner(None, None).unwrap();
    let mut expected = 0usize;
    while scanner.has_next() {
        assert_eq!(scanner.key(), key(0, expected).as_slice());
        assert_eq!(scanner.value(), &expected.to_be_bytes());
        expected += 1;
        scanner.advance().unwrap();
    }
    assert_eq!(expected, threads * per_thread);
}

#[test]
fn test_concurrent_writers_same_keys() {
    let map = setup_small_block_map();
    let threads = 4;

    thread::scope(|s| {
        for t in 0..threads {
            let map = &map;
            s.spawn(move || {
                for round in 0..5 {
                    for i in 0..300 {
                        let v = format!("w{}-r{}", t, round);
                        map.put(&key(0, i), v.as_bytes(), 0).unwrap();
                    }
                }
            });
        }
    });

    for i in 0..300 {
        let v = map.get(&key(0, i)).unwrap().unwrap();
        assert!(v.starts_with(b"w") && v.ends_with(b"-r4"), "unexpected value {:?}", v);
    }
    assert_eq!(map.stats().records, 300);
}

#[test]
fn test_concurrent_puts_and_deletes() {
    let map = setup_small_block_map();
    for i in 0..2000 {
        map.put(&key(9, i), b"seed", 0).unwrap();
    }

    thread::scope(|s| {
        for t in 0..4 {
            let map = &map;
            s.spawn(move || {
                // each thread deletes its own quarter and inserts fresh keys
                for i in (t * 500)..(t * 500 + 500) {
                    assert!(map.delete(&key(9, i)).unwrap());
                    map.put(&key(t, i), b"fresh", 0).unwrap();
                }
            });
        }
    });

    for i in 0..2000 {
        assert_eq!(map.get(&key(9, i)).unwrap(), None);
        assert_eq!(map.get(&key(i / 500, i)).unwrap(), Some(b"fresh".to_vec()));
    }
    assert_eq!(map.stats().records, 2000);
}

// =============================================================================
// Reader Tests
// =============================================================================

#[test]
fn test_readers_during_splits() {
    let map = setup_small_block_map();
    for i in 0..500 {
        map.put(&key(0, i), b"stable", 0).unwrap();
    }
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        let map = &map;
        let done = &done;
        for _ in 0..3 {
            s.spawn(move || {
                while !done.load(Ordering::Acquire) {
                    for i in (0..500).step_by(7) {
                        assert_eq!(map.get(&key(0, i)).unwrap(), Some(b"stable".to_vec()));
                    }
                }
            });
        }
        s.spawn(move || {
            for i in 0..3000 {
                map.put(&key(1, i), b"growing", 0).unwrap();
            }
            done.store(true, Ordering::Release);
        });
    });

    assert_eq!(map.stats().records, 3500);
}

#[test]
fn test_scanners_stay_ordered_during_writes() {
    let map = setup_small_block_map();
    for i in 0..1000 {
        map.put(&key(0, i * 2), b"even", 0).unwrap();
    }
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        let map = &map;
        let done = &done;
        for reverse in [false, true] {
            s.spawn(move || {
                while !done.load(Ordering::Acquire) {
                    let mut scanner = if reverse {
                        map.reverse_scanner(None, None).unwrap()
                    } else {
                        map.scanner(None, None).unwrap()
                    };
                    let mut previous: Option<Vec<u8>> = None;
                    let mut evens = 0;
                    while scanner.has_next() {
                        let current = scanner.key().to_vec();
                        if let Some(prev) = &previous {
                            if reverse {
                                assert!(prev > &current);
                            } else {
                                assert!(prev < &current);
                            }
                        }
                        if scanner.value() == b"even" {
                            evens += 1;
                        }
                        previous = Some(current);
                        scanner.advance().unwrap();
                    }
                    // the scanner's snapshot predates none of the even keys
                    assert_eq!(evens, 1000);
                }
            });
        }
        s.spawn(move || {
            for i in 0..1000 {
                map.put(&key(0, i * 2 + 1), b"odd", 0).unwrap();
            }
            done.store(true, Ordering::Release);
        });
    });

    assert_eq!(map.stats().records, 2000);
}

#[test]
fn test_snapshot_reads_while_overwriting() {
    let map = setup_small_block_map();
    for i in 0..300 {
        map.put(&key(0, i), b"original", 0).unwrap();
    }
    let snap = map.create_snapshot();

    thread::scope(|s| {
        let map = &map;
        s.spawn(move || {
            for round in 0..3 {
                for i in 0..300 {
                    map.put(&key(0, i), format!("round-{}", round).as_bytes(), 0).unwrap();
                }
            }
        });
        for _ in 0..2 {
            s.spawn(move || {
                for _ in 0..5 {
                    for i in 0..300 {
                        assert_eq!(map.get_at(&key(0, i), snap).unwrap(), Some(b"original".to_vec()));
                    }
                }
            });
        }
    });

    map.release_snapshot(snap);
    assert_eq!(map.get(&key(0, 0)).unwrap(), Some(b"round-2".to_vec()));
}

#[test]
fn test_snapshot_view_stable_under_racing_writers() {
    let map = setup_small_block_map();
    map.put(b"contended", b"seed", 0).unwrap();
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        let map = &map;
        let done = &done;
        for t in 0..4 {
            s.spawn(move || {
                let mut round = 0u64;
                while !done.load(Ordering::Acquire) {
                    let v = format!("w{}-{}", t, round);
                    map.put(b"contended", v.as_bytes(), 0).unwrap();
                    round += 1;
                }
            });
        }
        s.spawn(move || {
            for _ in 0..200 {
                let snap = map.create_snapshot();
                let seen = map.get_at(b"contended", snap).unwrap();
                assert!(seen.is_some());
                for _ in 0..20 {
                    assert_eq!(map.get_at(b"contended", snap).unwrap(), seen);
                }
                map.release_snapshot(snap);
            }
            done.store(true, Ordering::Release);
        });
    });

    assert_eq!(map.stats().active_snapshots, 0);
}
