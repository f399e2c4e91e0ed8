//! Benchmarks for sortedkv map operations

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use sortedkv::{BigSortedMap, Config};

const KEYS: u64 = 20_000;

fn key(i: u64) -> Vec<u8> {
    format!("bench:{:010}", i).into_bytes()
}

fn loaded_map() -> BigSortedMap {
    let map = BigSortedMap::open(Config::default()).unwrap();
    for i in 0..KEYS {
        map.put(&key(i), b"value-value-value-value", 0).unwrap();
    }
    map
}

fn map_benchmarks(c: &mut Criterion) {
    c.bench_function("sequential_put_20k", |b| {
        b.iter_batched(
            || BigSortedMap::open(Config::default()).unwrap(),
            |map| {
                for i in 0..KEYS {
                    map.put(&key(i), b"value", 0).unwrap();
                }
                map
            },
            BatchSize::LargeInput,
        )
    });

    let map = loaded_map();
    let mut i = 0u64;
    c.bench_function("point_get", |b| {
        b.iter(|| {
            i = (i + 7919) % KEYS;
            black_box(map.get(&key(i)).unwrap())
        })
    });

    c.bench_function("overwrite_same_size", |b| {
        b.iter(|| {
            i = (i + 104_729) % KEYS;
            black_box(map.put(&key(i), b"VALUE-VALUE-VALUE-VALUE", 0).unwrap())
        })
    });

    c.bench_function("scan_1000_buffered", |b| {
        b.iter(|| {
            let mut scanner = map.scanner(Some(&key(5_000)), None).unwrap();
            let mut n = 0;
            while scanner.has_next() && n < 1000 {
                black_box(scanner.value());
                scanner.advance().unwrap();
                n += 1;
            }
        })
    });

    c.bench_function("scan_1000_raw", |b| {
        b.iter(|| {
            let mut scanner = map.raw_scanner(Some(&key(5_000)), None).unwrap();
            let mut n = 0;
            while scanner.has_next() && n < 1000 {
                black_box(scanner.value());
                scanner.advance().unwrap();
                n += 1;
            }
        })
    });
}

criterion_group!(benches, map_benchmarks);
criterion_main!(benches);
