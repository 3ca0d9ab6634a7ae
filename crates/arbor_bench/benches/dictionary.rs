//! Dictionary benchmarks.

use arbor_bench::random_strings;
use arbor_core::{Dictionary, Mixed};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

/// Benchmark inserting distinct string keys.
fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("dictionary_insert");

    for count in [16, 256, 1_024].iter() {
        let keys = random_strings(*count);
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &keys, |b, keys| {
            b.iter(|| {
                let mut dict = Dictionary::new();
                for (i, key) in keys.iter().enumerate() {
                    dict.insert(key.as_str(), i as i64).unwrap();
                }
                black_box(dict.size().unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark key lookups; lookup cost grows with size.
fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("dictionary_lookup");

    for count in [16, 256, 1_024].iter() {
        let keys = random_strings(*count);
        let mut dict = Dictionary::new();
        for (i, key) in keys.iter().enumerate() {
            dict.insert(key.as_str(), i as i64).unwrap();
        }
        let lookups: Vec<Mixed> = keys.iter().map(|k| Mixed::from(k.as_str())).collect();

        group.bench_with_input(BenchmarkId::from_parameter(count), &lookups, |b, lookups| {
            let mut i = 0;
            b.iter(|| {
                let wanted = &lookups[i % lookups.len()];
                i += 1;
                black_box(dict.try_get(black_box(wanted)).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_insert, bench_lookup);

criterion_main!(benches);
