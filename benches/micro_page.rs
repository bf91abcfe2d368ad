//! Micro benchmarks for the fixed-size document page.
#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use crushdb_core::document::Document;
use crushdb_core::page::Page;
use crushdb_core::value::TypedValue;

fn sample_doc(id: u64) -> Document {
    let mut doc = Document::new(id);
    doc.set("make", TypedValue::Str("Subaru".into()));
    doc.set("model", TypedValue::Str("Forester".into()));
    doc.set("year", TypedValue::I32(2017));
    doc.set("price", TypedValue::F64(28_500.99));
    doc
}

fn fill_page(compress: bool) -> (Page, u64) {
    let mut page = Page::new(1, compress);
    let mut count = 0u64;
    loop {
        match page.insert(sample_doc(count)) {
            Ok(_) => count += 1,
            Err(_) => break,
        }
    }
    (page, count)
}

fn micro_page(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/page");

    group.throughput(Throughput::Elements(1));
    group.bench_function("insert_until_full", |b| {
        b.iter_batched(
            || Page::new(1, false),
            |mut page| {
                let mut count = 0u64;
                while page.insert(sample_doc(count)).is_ok() {
                    count += 1;
                }
                black_box(count);
            },
            BatchSize::SmallInput,
        );
    });

    let (loaded, count) = fill_page(false);
    group.throughput(Throughput::Elements(count));
    group.bench_function("retrieve_all", |b| {
        b.iter(|| {
            for id in 0..count {
                black_box(loaded.retrieve(id).unwrap());
            }
        });
    });

    group.bench_function("compact_half_tombstoned", |b| {
        b.iter_batched(
            || {
                let (mut page, count) = fill_page(false);
                for id in (0..count).step_by(2) {
                    page.delete(id).unwrap();
                }
                page
            },
            |mut page| black_box(page.compact().unwrap()),
            BatchSize::SmallInput,
        );
    });

    group.bench_function("split", |b| {
        b.iter_batched(
            || fill_page(false).0,
            |mut page| black_box(page.split(2).unwrap()),
            BatchSize::SmallInput,
        );
    });

    group.bench_function("insert_until_full_compressed", |b| {
        b.iter_batched(
            || Page::new(1, true),
            |mut page| {
                let mut count = 0u64;
                while page.insert(sample_doc(count)).is_ok() {
                    count += 1;
                }
                black_box(count);
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, micro_page);
criterion_main!(benches);
