//! Micro benchmarks for the in-memory B+Tree index.
#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use crushdb_core::btree::{BPTree, SortOrder};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const INSERT_COUNT: u64 = 32_768;
const LOOKUP_SAMPLES: usize = 4_096;
const RANGE_WIDTH: u64 = 512;

fn fresh_tree() -> BPTree<i64, u64> {
    BPTree::new(64, SortOrder::Asc, true, |a: &i64, b: &i64| a.cmp(b))
}

fn micro_btree(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/btree");
    group.sample_size(30);

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("sequential_insert", |b| {
        b.iter_batched(
            fresh_tree,
            |mut tree| {
                for key in 0..INSERT_COUNT as i64 {
                    tree.insert(key, key as u64).unwrap();
                }
                black_box(tree.len());
            },
            criterion::BatchSize::SmallInput,
        );
    });

    let mut random_keys: Vec<i64> = (0..INSERT_COUNT as i64).collect();
    random_keys.shuffle(&mut StdRng::seed_from_u64(0xBEEF_F00D));
    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("random_insert", |b| {
        b.iter_batched(
            fresh_tree,
            |mut tree| {
                for &key in &random_keys {
                    tree.insert(key, key as u64).unwrap();
                }
                black_box(tree.len());
            },
            criterion::BatchSize::SmallInput,
        );
    });

    let mut loaded = fresh_tree();
    for key in 0..INSERT_COUNT as i64 {
        loaded.insert(key, key as u64).unwrap();
    }
    let mut rng = StdRng::seed_from_u64(0xFEED_FACE);

    group.throughput(Throughput::Elements(LOOKUP_SAMPLES as u64));
    group.bench_function(BenchmarkId::new("point_lookup", LOOKUP_SAMPLES), |b| {
        b.iter(|| {
            for _ in 0..LOOKUP_SAMPLES {
                let key = rng.gen_range(0..INSERT_COUNT as i64);
                black_box(loaded.search(&key));
            }
        });
    });

    group.throughput(Throughput::Elements(RANGE_WIDTH));
    group.bench_function(BenchmarkId::new("range_scan", RANGE_WIDTH), |b| {
        b.iter(|| {
            let start = rng.gen_range(0..(INSERT_COUNT as i64 - RANGE_WIDTH as i64));
            black_box(loaded.range_search(Some(&start), Some(&(start + RANGE_WIDTH as i64))));
        });
    });

    group.finish();
}

criterion_group!(benches, micro_btree);
criterion_main!(benches);
