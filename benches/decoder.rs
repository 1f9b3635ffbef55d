//! decoder/classifier/extractor throughput on a typical reply.

use bevy_chat_stream::session::FramePipeline;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

fn reply(deltas: usize) -> Vec<u8> {
    let mut body = String::new();
    for i in 0..deltas {
        body.push_str(&format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":\"tok{i} é \"}}}}]}}\n"
        ));
        if i % 16 == 0 {
            body.push_str(": keepalive\n\n");
        }
    }
    body.push_str("data: [DONE]\n");
    body.into_bytes()
}

fn bench_pipeline(c: &mut Criterion) {
    let body = reply(512);
    let mut group = c.benchmark_group("pipeline");
    group.throughput(Throughput::Bytes(body.len() as u64));

    for chunk in [64usize, 1024, 16 * 1024] {
        group.bench_with_input(BenchmarkId::new("chunk", chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut pipeline = FramePipeline::new();
                let mut total = 0usize;
                for part in body.chunks(chunk) {
                    total += pipeline.feed(black_box(part)).len();
                }
                black_box(total)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pipeline);
criterion_main!(benches);
