use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use std::time::Duration;

use coffeeshop_infra::tasks::{
    EnqueueOptions, InMemoryQueueBackend, QueueBackend, QueueClass, TaskDistributor, TaskPayload,
    TaskRecord, UploadImage,
};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

fn upload_payload(size: usize) -> TaskPayload {
    TaskPayload::UploadImage(UploadImage {
        image: vec![0xAB; size],
        object_key: "images/products/thumbnails/bench.png".to_string(),
        extension: "png".to_string(),
    })
}

fn bench_payload_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("payload_encoding");

    for size in [1_024usize, 64 * 1_024, 1_024 * 1_024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("upload_image", size), &size, |b, &size| {
            let payload = upload_payload(size);
            b.iter(|| black_box(TaskRecord::new(&payload, EnqueueOptions::default()).unwrap()));
        });
    }

    group.finish();
}

fn bench_enqueue_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("enqueue_throughput");
    group.throughput(Throughput::Elements(1));

    group.bench_function("in_memory_enqueue", |b| {
        let distributor = TaskDistributor::new(InMemoryQueueBackend::arc());
        let payload = TaskPayload::DeleteObjects(vec!["images/products/a.png".to_string()]);
        b.iter(|| {
            rt.block_on(distributor.enqueue(black_box(&payload), EnqueueOptions::default()))
                .unwrap()
        });
    });

    group.finish();
}

fn bench_claim_and_finish(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_and_finish");

    for depth in [10usize, 100, 1_000] {
        group.bench_with_input(BenchmarkId::new("queue_depth", depth), &depth, |b, &depth| {
            let backend = InMemoryQueueBackend::arc();
            let payload = TaskPayload::DeleteObjects(vec!["images/products/a.png".to_string()]);
            rt.block_on(async {
                for _ in 0..depth {
                    let task = TaskRecord::new(&payload, EnqueueOptions::default()).unwrap();
                    backend.enqueue(task).await.unwrap();
                }
            });

            b.iter(|| {
                rt.block_on(claim_cycle(&backend, &payload));
            });
        });
    }

    group.finish();
}

/// Enqueue one task and complete the oldest, keeping the depth constant.
async fn claim_cycle(backend: &Arc<InMemoryQueueBackend>, payload: &TaskPayload) {
    let task = TaskRecord::new(payload, EnqueueOptions::default()).unwrap();
    backend.enqueue(task).await.unwrap();

    let mut claimed = backend
        .claim(QueueClass::Default, "bench", Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    claimed.mark_completed(chrono::Utc::now());
    backend.finish(&claimed, "bench").await.unwrap();
}

criterion_group!(
    benches,
    bench_payload_encoding,
    bench_enqueue_throughput,
    bench_claim_and_finish
);
criterion_main!(benches);
