use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use agentq_core::{JobId, JobStatus};
use agentq_infra::backend::{InMemoryBackend, Keyspace, SharedBackend, now_unix};
use agentq_infra::jobs::{JobQueue, JobStore, NewJob, Stamp};

fn setup() -> (JobStore, JobQueue) {
    let backend: SharedBackend = Arc::new(InMemoryBackend::new());
    let keys = Keyspace::default();
    let store = JobStore::new(backend.clone(), keys.clone());
    let queue = JobQueue::new(backend, &keys, "bench");
    (store, queue)
}

fn bench_enqueue_dequeue(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue_dequeue");

    for batch in [1usize, 100, 1000] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            let (_store, queue) = setup();
            let ids: Vec<JobId> = (0..batch).map(|_| JobId::new()).collect();
            b.iter(|| {
                for id in &ids {
                    queue.enqueue(id).unwrap();
                }
                for _ in 0..batch {
                    black_box(queue.dequeue(Duration::ZERO).unwrap());
                }
            });
        });
    }

    group.finish();
}

fn bench_pump_delayed(c: &mut Criterion) {
    let mut group = c.benchmark_group("pump_delayed");

    for due in [10usize, 100] {
        group.throughput(Throughput::Elements(due as u64));
        group.bench_with_input(BenchmarkId::new("due", due), &due, |b, &due| {
            let (_store, queue) = setup();
            let ids: Vec<JobId> = (0..due).map(|_| JobId::new()).collect();
            b.iter(|| {
                for id in &ids {
                    queue.schedule_delayed(id, Duration::ZERO).unwrap();
                }
                // One not-yet-due entry exercises the put-back path.
                queue.schedule_delayed(&ids[0], Duration::from_secs(3600)).unwrap();
                black_box(queue.pump_delayed_at(now_unix(), 1000).unwrap());
                while queue.dequeue(Duration::ZERO).unwrap().is_some() {}
                queue.pump_delayed_at(now_unix() + 7200.0, 1000).unwrap();
                while queue.dequeue(Duration::ZERO).unwrap().is_some() {}
            });
        });
    }

    group.finish();
}

fn bench_job_lifecycle(c: &mut Criterion) {
    c.bench_function("job_create_run_succeed", |b| {
        let (store, queue) = setup();
        b.iter(|| {
            let created = store
                .create(&NewJob::new("echo", json!({ "shots": 1024 })))
                .unwrap();
            queue.enqueue(&created.job_id).unwrap();
            let id = queue.dequeue(Duration::ZERO).unwrap().unwrap();
            store.update_status(&id, JobStatus::Running, Stamp::Started).unwrap();
            store.increment_attempts(&id).unwrap();
            store.set_result(&id, &json!({ "ok": true })).unwrap();
            store
                .update_status(&id, JobStatus::Succeeded, Stamp::Finished)
                .unwrap();
            black_box(store.get(&id).unwrap());
        });
    });

    c.bench_function("idempotent_resubmit", |b| {
        let (store, _queue) = setup();
        let new = NewJob::new("echo", json!({})).with_idempotency_key("bench-key");
        store.create(&new).unwrap();
        b.iter(|| black_box(store.create(&new).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_enqueue_dequeue,
    bench_pump_delayed,
    bench_job_lifecycle
);
criterion_main!(benches);
