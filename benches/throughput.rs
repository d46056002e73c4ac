use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use lazy_batch::engine::{Statistics, TaskQueue};
use lazy_batch::{
    BatchError, ConversionOptions, Converted, Converter, PoolConfig, PoolController, Task,
    TaskResult,
};
use std::hint::black_box;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TASKS: usize = 2_000;

fn tasks(n: usize) -> Vec<Task> {
    (0..n)
        .map(|i| {
            Task::new(
                format!("in/{i}.heic"),
                format!("out/{i}.jpg"),
                ConversionOptions::default(),
            )
        })
        .collect()
}

fn bench_queue_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_handoff");
    for capacity in [1usize, 16, 1000] {
        group.bench_function(format!("capacity_{capacity}"), |b| {
            b.iter_batched(
                || (Arc::new(TaskQueue::new(capacity)), tasks(TASKS)),
                |(queue, batch)| {
                    let producer = {
                        let queue = Arc::clone(&queue);
                        thread::spawn(move || {
                            for task in batch {
                                if queue.push(task).is_err() {
                                    break;
                                }
                            }
                            queue.close();
                        })
                    };
                    let mut received = 0usize;
                    while let Some(task) = queue.pop() {
                        black_box(task.id());
                        received += 1;
                    }
                    let _ = producer.join();
                    assert_eq!(received, TASKS);
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_pool_drain(c: &mut Criterion) {
    let converter: Arc<dyn Converter> = Arc::new(|task: &Task| -> Result<Converted, BatchError> {
        Ok(Converted {
            bytes_in: black_box(task.source().as_os_str().len() as u64),
            bytes_out: 1,
        })
    });

    let mut group = c.benchmark_group("pool_drain");
    group.measurement_time(Duration::from_secs(10));
    for workers in [1usize, 4, 8] {
        let config = PoolConfig::default()
            .with_workers(workers)
            .with_queue_capacity(64);
        let pool = match PoolController::new(config, Arc::clone(&converter)) {
            Ok(pool) => pool,
            Err(err) => panic!("pool setup failed: {err}"),
        };
        group.bench_function(format!("workers_{workers}"), |b| {
            b.iter_batched(
                || tasks(TASKS),
                |batch| {
                    if pool.start(batch.into_iter().map(Ok)).is_ok() {
                        black_box(pool.wait());
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_stats_contention(c: &mut Criterion) {
    let results: Vec<TaskResult> = tasks(256)
        .iter()
        .map(|task| TaskResult::success(task, Duration::from_millis(1), 100, 60))
        .collect();
    let results = Arc::new(results);

    c.bench_function("stats_record_4_threads", |b| {
        b.iter_batched(
            || Arc::new(Statistics::new()),
            |stats| {
                let handles: Vec<_> = (0..4)
                    .map(|_| {
                        let stats = Arc::clone(&stats);
                        let results = Arc::clone(&results);
                        thread::spawn(move || {
                            for result in results.iter() {
                                stats.task_submitted();
                                stats.task_started();
                                stats.record(result);
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    let _ = handle.join();
                }
                black_box(stats.snapshot());
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_queue_handoff,
    bench_pool_drain,
    bench_stats_contention
);
criterion_main!(benches);
