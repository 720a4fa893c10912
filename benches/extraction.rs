//! Benchmarks for response extraction
//!
//! This benchmark measures each pipeline stage on typical model output:
//! - Clean JSON (direct parse)
//! - Markdown-fenced JSON
//! - JSON embedded in prose
//! - Truncated output needing repair

use ai_gencache::extract::{ExpectedShape, ResponseExtractor};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn notes_body(sections: usize) -> String {
    let items: Vec<String> = (0..sections)
        .map(|i| format!("{{\"heading\": \"Section {i}\", \"points\": [\"a\", \"b\", \"c\"]}}"))
        .collect();
    format!("{{\"title\": \"Chapter 3\", \"sections\": [{}]}}", items.join(", "))
}

fn bench_stages(c: &mut Criterion) {
    let extractor = ResponseExtractor::new();
    let shape = ExpectedShape::object("notes");
    let body = notes_body(25);

    let cases = [
        ("direct", body.clone()),
        ("fenced", format!("```json\n{}\n```", body)),
        ("embedded", format!("Here are your notes:\n{}\nGood luck!", body)),
        ("truncated", body[..body.len() - 40].to_string()),
    ];

    let mut group = c.benchmark_group("extraction");
    group.throughput(Throughput::Bytes(body.len() as u64));
    for (name, raw) in &cases {
        group.bench_function(*name, |b| {
            b.iter(|| extractor.extract(black_box(raw), &shape))
        });
    }
    group.finish();
}

fn bench_failure_path(c: &mut Criterion) {
    let extractor = ResponseExtractor::new();
    let shape = ExpectedShape::object("notes");
    let raw = "I'm sorry, but I can't help with that request. ".repeat(20);
    c.bench_function("extraction_no_json", |b| {
        b.iter(|| extractor.extract(black_box(&raw), &shape))
    });
}

criterion_group!(benches, bench_stages, bench_failure_path);
criterion_main!(benches);
