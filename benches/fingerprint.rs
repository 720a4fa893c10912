//! Benchmarks for input fingerprinting
//!
//! This benchmark measures:
//! - Canonical JSON serialization of nested inputs
//! - SHA-256 fingerprinting at different input sizes
//! - Salted vs unsalted fingerprinters

use ai_gencache::cache::{canonical_json, fingerprint, Fingerprinter};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};

fn sample_input(courses: usize) -> Value {
    let grades: Vec<Value> = (0..courses)
        .map(|i| {
            json!({
                "course": format!("course-{i}"),
                "grade": (i * 7) % 100,
                "comments": ["punctual", "asks good questions"],
            })
        })
        .collect();
    json!({
        "studentId": "S1",
        "term": {"year": 2026, "season": "fall"},
        "grades": grades,
    })
}

fn bench_canonical_json(c: &mut Criterion) {
    let input = sample_input(20);
    let mut group = c.benchmark_group("canonical_json");
    group.throughput(Throughput::Bytes(input.to_string().len() as u64));
    group.bench_function("nested_20", |b| b.iter(|| canonical_json(black_box(&input))));
    group.finish();
}

fn bench_fingerprint_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");
    for courses in [1usize, 10, 100] {
        let input = sample_input(courses);
        group.bench_with_input(BenchmarkId::from_parameter(courses), &input, |b, input| {
            b.iter(|| fingerprint(black_box(input)))
        });
    }
    group.finish();
}

fn bench_salted(c: &mut Criterion) {
    let input = sample_input(10);
    let salted = Fingerprinter::new().with_salt("prompt-v7");
    c.bench_function("fingerprint_salted", |b| {
        b.iter(|| salted.fingerprint(black_box(&input)))
    });
}

criterion_group!(benches, bench_canonical_json, bench_fingerprint_sizes, bench_salted);
criterion_main!(benches);
