//! Benchmark suite for mend's failure classification.
//!
//! Classification and normalization run on every failed verification, often
//! over thousands of lines of test output.
//!
//! # Running Benchmarks
//!
//! ```bash
//! cargo bench
//! cargo bench -- --save-baseline main
//! cargo bench -- --baseline main
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mend::repair::{classify_failure, compute_signature, normalize_output, FailureClassifier};
use mend::testing::fixtures;

/// Build noisy output of roughly `lines` lines ending in an assertion failure.
fn noisy_output(lines: usize) -> String {
    let mut out = String::new();
    for i in 0..lines {
        out.push_str(&format!(
            "2024-05-01T12:00:{:02}Z [worker 0x7ffd{:04x}] /home/ci/build/src/mod{}.ts ok ({} ms)\n",
            i % 60,
            i,
            i,
            i % 250
        ));
    }
    out.push_str(fixtures::ASSERTION_FAILURE);
    out
}

fn bench_normalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize");
    for lines in [10, 100, 1_000] {
        let output = noisy_output(lines);
        group.throughput(Throughput::Bytes(output.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), &output, |b, output| {
            b.iter(|| normalize_output(black_box(output)));
        });
    }
    group.finish();
}

fn bench_classify(c: &mut Criterion) {
    let classifier = FailureClassifier::new();
    let mut group = c.benchmark_group("classify");

    let samples = [
        ("assertion", fixtures::ASSERTION_FAILURE),
        ("typecheck", fixtures::TYPE_ERROR),
        ("lint", fixtures::LINT_ERROR),
        ("compile", fixtures::COMPILE_ERROR),
        ("tooling", fixtures::MISSING_MODULE),
        ("unknown", fixtures::UNRECOGNIZED),
    ];
    for (name, output) in samples {
        group.bench_with_input(BenchmarkId::new("fixture", name), output, |b, output| {
            b.iter(|| classifier.classify(black_box(output)));
        });
    }

    let large = noisy_output(1_000);
    group.throughput(Throughput::Bytes(large.len() as u64));
    group.bench_function("noisy_1000_lines", |b| {
        b.iter(|| classify_failure(black_box(&large)));
    });
    group.finish();
}

fn bench_signature(c: &mut Criterion) {
    let normalized = normalize_output(&noisy_output(100));
    c.bench_function("signature", |b| {
        b.iter(|| compute_signature(black_box(&normalized)));
    });
}

criterion_group!(benches, bench_normalize, bench_classify, bench_signature);
criterion_main!(benches);
