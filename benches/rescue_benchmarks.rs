//! Rescue-path benchmarks using Criterion
//!
//! Run with: cargo bench
//! Run specific: cargo bench -- checksum

use btrfs_rescue::core::checksum::ChecksumKind;
use btrfs_rescue::rebuild::{build_kmp_table, index_all};
use criterion::{
    black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput,
};

// ============================================================================
// Checksum Benchmarks
// ============================================================================

/// Benchmark per-sector checksumming, the scanner's hot path
fn checksum_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("checksum");

    for size in [4096usize, 16384, 65536].iter() {
        let data = vec![0x42u8; *size];

        group.throughput(Throughput::Bytes(*size as u64));

        group.bench_with_input(BenchmarkId::new("crc32c", size), &data, |b, data| {
            b.iter(|| ChecksumKind::Crc32c.sum(black_box(data)).unwrap())
        });

        group.bench_with_input(BenchmarkId::new("sha256", size), &data, |b, data| {
            b.iter(|| ChecksumKind::Sha256.sum(black_box(data)).unwrap())
        });
    }

    group.finish();
}

// ============================================================================
// Matcher Benchmarks
// ============================================================================

/// Benchmark the wildcard KMP matcher over checksum-sized haystacks
fn kmp_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("kmp");

    // A synthetic haystack the size of a 1 GiB device's checksum count.
    let haystack: Vec<u32> = (0..262_144u32).map(|i| i % 1021).collect();
    let pattern: Vec<Option<u32>> =
        haystack[100_000..100_064].iter().map(|&v| Some(v)).collect();

    group.throughput(Throughput::Elements(haystack.len() as u64));

    group.bench_function("table_64", |b| {
        b.iter(|| build_kmp_table(black_box(pattern.as_slice())))
    });

    group.bench_function("index_all_concrete_64", |b| {
        b.iter(|| index_all(black_box(haystack.as_slice()), black_box(pattern.as_slice())))
    });

    // The same pattern with a quarter of its positions wildcarded.
    let sparse: Vec<Option<u32>> = pattern
        .iter()
        .enumerate()
        .map(|(i, &v)| if i % 4 == 0 { None } else { v })
        .collect();
    group.bench_function("index_all_wildcards_64", |b| {
        b.iter(|| index_all(black_box(haystack.as_slice()), black_box(sparse.as_slice())))
    });

    group.finish();
}

criterion_group!(benches, checksum_benchmarks, kmp_benchmarks);
criterion_main!(benches);
