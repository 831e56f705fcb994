//! # Cache Benchmark Harness
//!
//! Purpose: a repeatable driver measuring facade throughput for mixed
//! memory-hit and disk-read-through workloads.
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: fixed PRNG seed for stable comparisons.
//! 2. **Allocation Control**: pre-build keys/values before timing starts.
//! 3. **Cold vs Warm**: measure disk-read-through separately from the
//!    memory-hit path so promotion doesn't mask either number.

use std::env;
use std::hint::black_box;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use kvcache::Cache;

const DEFAULT_KEY_COUNT: usize = 1 << 12;
const DEFAULT_OP_COUNT: usize = 200_000;
const DEFAULT_VALUE_SIZE: usize = 256;

struct BenchConfig {
    key_count: usize,
    key_mask: usize,
    op_count: usize,
    value_size: usize,
}

impl BenchConfig {
    fn from_args() -> Self {
        let mut args = env::args().skip(1);
        let key_count = normalize_power_of_two(parse_usize(args.next(), DEFAULT_KEY_COUNT));
        let op_count = parse_usize(args.next(), DEFAULT_OP_COUNT);
        let value_size = parse_usize(args.next(), DEFAULT_VALUE_SIZE);

        BenchConfig {
            key_count,
            key_mask: key_count - 1,
            op_count,
            value_size,
        }
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

fn normalize_power_of_two(value: usize) -> usize {
    let value = value.max(1);
    if value.is_power_of_two() {
        value
    } else {
        value.next_power_of_two()
    }
}

/// Tiny deterministic PRNG so the workload is reproducible without an
/// external dependency.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        XorShift64 { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    fn next_index(&mut self, mask: usize) -> usize {
        (self.next_u64() as usize) & mask
    }
}

fn build_keys(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("bench-key-{i:08x}")).collect()
}

fn build_value(size: usize, seed: u64) -> Vec<u8> {
    let mut buffer = vec![0u8; size];
    buffer[..8.min(size)].copy_from_slice(&seed.to_le_bytes()[..8.min(size)]);
    buffer
}

fn report(label: &str, ops: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let nanos_per_op = (secs * 1e9) / (ops as f64);
    println!("{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {nanos_per_op:.1} ns/op)");
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = BenchConfig::from_args();
    let scratch = tempfile::tempdir().context("creating scratch cache directory")?;
    let cache = Cache::open_path(&scratch.path().join("bench")).context("opening cache")?;

    let keys = build_keys(config.key_count);
    for (idx, key) in keys.iter().enumerate() {
        let value = build_value(config.value_size, idx as u64);
        cache.set(key, value);
    }

    println!(
        "keys={} ops={} value_size={}",
        config.key_count, config.op_count, config.value_size
    );

    let mut rng = XorShift64::new(0x1234_5678_9ABC_DEF0);
    let start = Instant::now();
    for _ in 0..config.op_count {
        let idx = rng.next_index(config.key_mask);
        let value = cache.get(&keys[idx]);
        black_box(value);
    }
    report("GET (warm memory)", config.op_count, start.elapsed());

    cache.memory().remove_all();
    let read_through_ops = (config.op_count / 10).max(1);
    let mut rng = XorShift64::new(0x0FED_CBA9_8765_4321);
    let start = Instant::now();
    for _ in 0..read_through_ops {
        let idx = rng.next_index(config.key_mask);
        cache.memory().remove(&keys[idx].clone());
        let value = cache.get(&keys[idx]);
        black_box(value);
    }
    report("GET (disk read-through)", read_through_ops, start.elapsed());

    Ok(())
}
