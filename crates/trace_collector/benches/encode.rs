//! Batch encoding and sampling benchmarks
//!
//! Run with: cargo bench -p trace_collector --bench encode

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use trace_collector::{Annotations, Batch, BatchEncoder, BatchProcessor, JsonProtocol, SpanTree, Trace};

const ENDPOINTS: &[&str] = &["Users#index", "Users#show", "Posts#index", "Posts#create"];

fn trace(i: usize) -> Trace {
    let mut tree = SpanTree::new(ENDPOINTS[i % ENDPOINTS.len()]);
    let base = i as u64 * 10_000_000;
    tree.start(base, "app.request", None, None, Annotations::new());
    for q in 0..5u64 {
        let sql = format!("SELECT * FROM t{} WHERE id = ?", (i as u64 + q) % 8);
        tree.start(base + q * 1_000_000, "db.sql.query", None, Some(sql), Annotations::new());
        tree.stop(base + q * 1_000_000 + 500_000).unwrap();
    }
    tree.stop(base + 6_000_000).unwrap();
    tree.build().unwrap()
}

fn batch(traces: usize) -> Batch {
    let mut processor = BatchProcessor::new(traces);
    for i in 0..traces {
        processor.add(trace(i));
    }
    processor.take_batch(1_700_000_000).unwrap()
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for traces in [10, 100, 1000] {
        let batch = batch(traces);
        group.throughput(Throughput::Elements(traces as u64));

        // Fresh encoder per batch: tables built and shipped every time
        group.bench_with_input(BenchmarkId::new("binary_cold", traces), &batch, |b, batch| {
            b.iter(|| black_box(BatchEncoder::new().encode(batch).unwrap()));
        });

        // Tables acknowledged: steady state
        let mut encoder = BatchEncoder::new();
        let first = encoder.encode(&batch).unwrap();
        encoder.acknowledge(&first.pending);
        group.bench_with_input(BenchmarkId::new("binary_warm", traces), &batch, |b, batch| {
            b.iter(|| black_box(encoder.encode(batch).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("json", traces), &batch, |b, batch| {
            b.iter(|| black_box(JsonProtocol::new().encode(batch).unwrap()));
        });
    }
    group.finish();
}

fn bench_sampling(c: &mut Criterion) {
    let mut group = c.benchmark_group("sampling");
    let traces: Vec<Trace> = (0..10_000).map(trace).collect();
    group.throughput(Throughput::Elements(traces.len() as u64));

    for capacity in [100, 1000] {
        group.bench_with_input(BenchmarkId::new("add", capacity), &capacity, |b, &capacity| {
            b.iter(|| {
                let mut processor = BatchProcessor::new(capacity);
                for t in &traces {
                    processor.add(t.clone());
                }
                black_box(processor.take_batch(0))
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_sampling);
criterion_main!(benches);
