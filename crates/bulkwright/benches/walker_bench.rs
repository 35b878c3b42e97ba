//! 🏎️ Walker and router benchmarks: how fast can we read a 10k-op bulk body, and how fast
//! can we hash ids to shards.

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};

use bulkwright::routing::shard_id;
use bulkwright::walker::{bulk_operations, walk_bulk_requests};

fn bulk_body(operations: usize) -> Vec<u8> {
    let mut body = Vec::with_capacity(operations * 96);
    for i in 0..operations {
        if i % 10 == 9 {
            body.extend_from_slice(format!("{{\"delete\":{{\"_index\":\"logs\",\"_id\":\"{i}\"}}}}\n").as_bytes());
        } else {
            body.extend_from_slice(
                format!("{{\"index\":{{\"_index\":\"logs\",\"_id\":\"{i}\"}}}}\n{{\"message\":\"hello {i}\",\"level\":\"info\"}}\n")
                    .as_bytes(),
            );
        }
    }
    body
}

fn bench_walker(c: &mut Criterion) {
    let body = bulk_body(10_000);
    let mut group = c.benchmark_group("walker");
    group.throughput(Throughput::Bytes(body.len() as u64));

    group.bench_function("bulk_operations_10k", |b| {
        b.iter(|| bulk_operations("/_bulk", black_box(&body)).filter(Result::is_ok).count());
    });

    group.bench_function("walk_bulk_requests_10k", |b| {
        b.iter(|| {
            let mut payload_bytes = 0usize;
            walk_bulk_requests(
                "/logs/_bulk",
                black_box(&body),
                None,
                |_, _, _| Ok(()),
                |payload, _| payload_bytes += payload.len(),
            )
            .map(|ops| ops + payload_bytes)
        });
    });
    group.finish();
}

fn bench_router(c: &mut Criterion) {
    let ids: Vec<String> = (0..1_000).map(|i| format!("doc-{i:08}")).collect();
    c.bench_function("shard_id_1k_ids", |b| {
        b.iter(|| {
            ids.iter()
                .filter_map(|id| shard_id(black_box(id.as_bytes()), 5, -1, 1, 7).ok())
                .sum::<i32>()
        });
    });
}

criterion_group!(benches, bench_walker, bench_router);
criterion_main!(benches);
