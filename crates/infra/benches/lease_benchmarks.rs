use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::Utc;
use taskforge_core::{DedupKey, NewJob, QueueName};
use taskforge_infra::config::QueueOptions;
use taskforge_infra::jobs::{HandlerOutcome, HandlerRegistry, InMemoryJobStore, JobQueue, QueueWorker};
use tokio::runtime::Runtime;

fn queue(parallelism: usize) -> JobQueue<InMemoryJobStore> {
    let options = QueueOptions::new(QueueName::new("bench_jobs").unwrap()).with_parallelism(parallelism);
    JobQueue::new(options, InMemoryJobStore::arc())
}

fn target(i: usize) -> NewJob {
    NewJob::new("sync_calendar", DedupKey::none().with("calendar_id", i.to_string()))
}

/// Enqueue cost as the live-dedup scan grows with the backlog.
fn bench_enqueue(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("enqueue");
    group.throughput(Throughput::Elements(1));

    for backlog in [0usize, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(backlog), backlog, |b, &backlog| {
            let q = queue(1);
            rt.block_on(async {
                for i in 0..backlog {
                    q.enqueue(target(i), Utc::now()).await.unwrap();
                }
            });

            let mut i = backlog;
            b.iter(|| {
                i += 1;
                let job = rt.block_on(q.enqueue(target(i), Utc::now())).unwrap();
                black_box(job);
            });
        });
    }

    group.finish();
}

/// Lease throughput for different batch sizes.
fn bench_lease(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("lease");

    for parallelism in [1usize, 10, 100].iter() {
        group.throughput(Throughput::Elements(*parallelism as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(parallelism),
            parallelism,
            |b, &parallelism| {
                b.iter_batched(
                    || {
                        let q = queue(parallelism);
                        rt.block_on(async {
                            for i in 0..parallelism {
                                q.enqueue(target(i), Utc::now()).await.unwrap();
                            }
                        });
                        q
                    },
                    |q| black_box(rt.block_on(q.lease(Utc::now())).unwrap()),
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

/// Full worker pass: lease, run a no-op handler, record completion.
fn bench_worker_tick(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("worker_tick");
    group.sample_size(50);

    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("*", |_ctx, _p: serde_json::Value| async { Ok(HandlerOutcome::done()) });
    let handlers = std::sync::Arc::new(handlers);

    for batch in [1usize, 16].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(batch), batch, |b, &batch| {
            b.iter_batched(
                || {
                    let q = queue(batch);
                    rt.block_on(async {
                        for i in 0..batch {
                            q.enqueue(target(i), Utc::now()).await.unwrap();
                        }
                    });
                    QueueWorker::new(q, handlers.clone())
                },
                |worker| black_box(rt.block_on(worker.tick()).unwrap()),
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_enqueue, bench_lease, bench_worker_tick);
criterion_main!(benches);
