use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array, StringArray};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use term_export::crypto::{MultiRecipientEncryptor, RecipientSecret};
use term_export::fingerprint::FingerprintEngine;

fn benchmark_fingerprint_columns(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint_columns");

    for n in [1_000, 10_000, 100_000].iter() {
        let names = vec!["id".to_string(), "email".to_string(), "note".to_string()];
        let columns: Vec<ArrayRef> = vec![
            Arc::new(Int64Array::from_iter_values(0..*n as i64)),
            Arc::new(StringArray::from_iter_values(
                (0..*n).map(|i| format!("user{i}@example.com")),
            )),
            Arc::new(StringArray::from_iter(
                (0..*n).map(|i| (i % 3 == 0).then(|| "flagged")),
            )),
        ];
        group.throughput(Throughput::Elements(*n as u64));

        group.bench_with_input(BenchmarkId::from_parameter(n), &columns, |b, columns| {
            b.iter(|| {
                FingerprintEngine::fingerprint_columns(std::hint::black_box(&names), columns)
                    .unwrap()
            });
        });
    }

    group.finish();
}

fn benchmark_encrypt(c: &mut Criterion) {
    let mut group = c.benchmark_group("encrypt");

    let recipients: Vec<_> = (0..3)
        .map(|i| {
            RecipientSecret::generate(vec![format!("r{i}@example.com")])
                .recipient()
                .unwrap()
        })
        .collect();
    let encryptor = MultiRecipientEncryptor::new();

    for size in [64 * 1024, 1024 * 1024, 8 * 1024 * 1024].iter() {
        let payload = vec![b'x'; *size];
        group.throughput(Throughput::Bytes(*size as u64));

        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}KiB", size / 1024)),
            &payload,
            |b, payload| {
                b.iter(|| {
                    let mut out = Vec::with_capacity(payload.len() + 1024);
                    encryptor
                        .encrypt(payload.as_slice(), &mut out, &recipients)
                        .unwrap();
                    out
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, benchmark_fingerprint_columns, benchmark_encrypt);
criterion_main!(benches);
