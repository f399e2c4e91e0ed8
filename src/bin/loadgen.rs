//! sortedkv Load Generator
//!
//! Drives a mixed put/get/delete/scan workload against an in-process map
//! from several threads and reports throughput and structure stats.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sortedkv::{BigSortedMap, Config};
use tracing_subscriber::{fmt, EnvFilter};

/// sortedkv load generator
#[derive(Parser, Debug)]
#[command(name = "sortedkv-load")]
#[command(about = "Concurrent workload generator for the sortedkv engine")]
#[command(version)]
struct Args {
    /// Worker threads
    #[arg(short, long, default_value = "4")]
    threads: usize,

    /// Operations per thread
    #[arg(short, long, default_value = "100000")]
    ops: u64,

    /// Distinct keys in the key space
    #[arg(short, long, default_value = "50000")]
    keys: u64,

    /// Value size in bytes
    #[arg(short, long, default_value = "64")]
    value_size: usize,

    /// Percentage of operations that are reads
    #[arg(short, long, default_value = "70")]
    read_pct: u32,

    /// Memory budget in MB
    #[arg(short = 'm', long, default_value = "1024")]
    max_memory_mb: u64,

    /// Maximum data block size in bytes
    #[arg(long, default_value = "4096")]
    data_block_size: usize,

    /// RNG seed
    #[arg(long, default_value = "42")]
    seed: u64,
}

#[derive(Default)]
struct Counters {
    puts: AtomicU64,
    rejected: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    deletes: AtomicU64,
    scanned: AtomicU64,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sortedkv=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("sortedkv load generator v{}", sortedkv::VERSION);
    tracing::info!(
        "{} threads x {} ops over {} keys, {}% reads",
        args.threads,
        args.ops,
        args.keys,
        args.read_pct
    );

    let config = Config::builder()
        .max_memory(args.max_memory_mb * 1024 * 1024)
        .max_data_block_size(args.data_block_size)
        .build();

    let map = match BigSortedMap::open(config) {
        Ok(map) => map,
        Err(e) => {
            tracing::error!("Failed to open map: {}", e);
            std::process::exit(1);
        }
    };

    let counters = Counters::default();
    let started = Instant::now();
    let failed = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..args.threads)
            .map(|id| {
                let map = &map;
                let counters = &counters;
                let args = &args;
                scope.spawn(move || run_worker(map, counters, args, args.seed + id as u64))
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join())
            .filter(|result| !matches!(result, Ok(Ok(()))))
            .count()
    });
    let elapsed = started.elapsed();

    if failed > 0 {
        tracing::error!("{} worker(s) failed", failed);
        std::process::exit(1);
    }

    let total = args.ops * args.threads as u64;
    tracing::info!(
        "{} ops in {:.2?} ({:.0} ops/s)",
        total,
        elapsed,
        total as f64 / elapsed.as_secs_f64()
    );
    tracing::info!(
        "puts={} rejected={} hits={} misses={} deletes={} scanned={}",
        counters.puts.load(Ordering::Relaxed),
        counters.rejected.load(Ordering::Relaxed),
        counters.hits.load(Ordering::Relaxed),
        counters.misses.load(Ordering::Relaxed),
        counters.deletes.load(Ordering::Relaxed),
        counters.scanned.load(Ordering::Relaxed)
    );
    tracing::info!("{:?}", map.stats());
}

fn run_worker(map: &BigSortedMap, counters: &Counters, args: &Args, seed: u64) -> sortedkv::Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut value = vec![0u8; args.value_size];
    let read_pct = args.read_pct.min(100);
    for _ in 0..args.ops {
        let key = format!("key:{:012}", rng.gen_range(0..args.keys.max(1)));
        let roll = rng.gen_range(0..100u32);
        if roll < read_pct {
            match map.get(key.as_bytes())? {
                Some(_) => counters.hits.fetch_add(1, Ordering::Relaxed),
                None => counters.misses.fetch_add(1, Ordering::Relaxed),
            };
        } else if roll < read_pct + (100 - read_pct) * 8 / 10 {
            rng.fill(&mut value[..]);
            if map.put(key.as_bytes(), &value, 0)? {
                counters.puts.fetch_add(1, Ordering::Relaxed);
            } else {
                counters.rejected.fetch_add(1, Ordering::Relaxed);
            }
        } else if roll % 2 == 0 {
            if map.delete(key.as_bytes())? {
                counters.deletes.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            let mut scanner = map.scanner(Some(key.as_bytes()), None)?;
            let mut seen = 0;
            while scanner.has_next() && seen < 16 {
                seen += 1;
                scanner.advance()?;
            }
            counters.scanned.fetch_add(seen, Ordering::Relaxed);
        }
    }
    Ok(())
}
