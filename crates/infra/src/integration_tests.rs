//! Integration tests for the full submit → claim → execute → record pipeline.
//!
//! Verifies:
//! - Idempotent submission enqueues exactly once
//! - Transient failures retry up to `max_attempts` with the documented backoff
//! - Timeouts are terminal and never retried
//! - Competing workers never execute the same job twice

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{Value as JsonValue, json};

use agentq_agents::AgentRegistry;
use agentq_core::{JobId, JobStatus, WorkerId};

use crate::backend::{InMemoryBackend, Keyspace, SharedBackend, now_unix};
use crate::jobs::{
    HandlerFailure, Heartbeat, JobQueue, JobRunner, JobStore, Processed, RunOutcome, Worker,
    WorkerConfig, error_codes,
};
use crate::submission::{DEFAULT_QUEUE, JobService, SubmitRequest};

/// Runner backed by a plain function.
struct FnRunner<F>(F);

impl<F> JobRunner for FnRunner<F>
where
    F: Fn(&str, &JsonValue) -> RunOutcome + Send + Sync,
{
    fn run(&self, agent: &str, payload: &JsonValue, _timeout: Duration) -> RunOutcome {
        (self.0)(agent, payload)
    }
}

struct Harness {
    backend: SharedBackend,
    keys: Keyspace,
    service: JobService,
}

impl Harness {
    fn new() -> Self {
        let backend: SharedBackend = Arc::new(InMemoryBackend::new());
        let keys = Keyspace::default();
        let store = JobStore::new(backend.clone(), keys.clone());
        let service = JobService::new(backend.clone(), keys.clone(), store)
            .with_registry(AgentRegistry::with_builtin())
            .with_poll_interval(Duration::from_millis(10));
        Self {
            backend,
            keys,
            service,
        }
    }

    fn queue(&self) -> JobQueue {
        self.service.queue(DEFAULT_QUEUE)
    }

    fn worker<R: JobRunner + 'static>(&self, id: &str, runner: R, config: WorkerConfig) -> Worker<R> {
        let heartbeat = Heartbeat::new(
            self.backend.clone(),
            self.keys.clone(),
            WorkerId::new(id).unwrap(),
            vec!["echo".into()],
        );
        Worker::new(
            self.service.store().clone(),
            self.queue(),
            heartbeat,
            runner,
            config,
        )
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig::default()
            .with_dequeue_block(Duration::ZERO)
            .with_backoff_cap(Duration::ZERO)
            .with_idle_sleep(Duration::from_millis(2))
    }

    fn status(&self, job_id: &JobId) -> JobStatus {
        self.service.store().status(job_id).unwrap()
    }
}

fn rank(status: JobStatus) -> u8 {
    match status {
        JobStatus::Queued => 0,
        JobStatus::Running => 1,
        _ => 2,
    }
}

/// Non-decreasing, except `queued` may follow `running` (retry) and nothing
/// follows a terminal state.
fn assert_monotonic(observed: &[JobStatus]) {
    for pair in observed.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        assert!(!prev.is_terminal() || prev == next, "left terminal state: {observed:?}");
        let retry = prev == JobStatus::Running && next == JobStatus::Queued;
        assert!(rank(next) >= rank(prev) || retry, "regressed: {observed:?}");
    }
}

#[test]
fn immediate_success_scenario() {
    let h = Harness::new();
    let worker = h.worker(
        "w-1",
        FnRunner(|_: &str, _: &JsonValue| RunOutcome::Succeeded(json!({ "ok": true }))),
        Harness::fast_config(),
    );

    let resp = h
        .service
        .submit(SubmitRequest::new("echo", json!({ "shots": 4 })))
        .unwrap();
    assert_eq!(resp.status, JobStatus::Queued);

    assert_eq!(worker.process_one().unwrap(), Processed::Succeeded(resp.job_id));

    let view = h.service.status(&resp.job_id, true).unwrap();
    assert_eq!(view.status, JobStatus::Succeeded);
    assert_eq!(view.result, Some(json!({ "ok": true })));
    assert_eq!(view.attempts, 1);
    assert!(view.error.is_none());
}

#[test]
fn transient_failure_exhausts_three_attempts() {
    let h = Harness::new();
    let worker = h.worker(
        "w-1",
        FnRunner(|_: &str, _: &JsonValue| {
            RunOutcome::Failed(HandlerFailure::new("ConnectionError", "connection reset by peer"))
        }),
        Harness::fast_config(),
    );

    let job_id = h
        .service
        .submit(SubmitRequest::new("echo", json!({})).with_max_attempts(3))
        .unwrap()
        .job_id;

    let mut observed = vec![h.status(&job_id)];
    let mut retry_observations = 0;
    for _ in 0..3 {
        worker.process_one().unwrap();
        let view = h.service.status(&job_id, false).unwrap();
        observed.push(view.status);
        if view.status == JobStatus::Queued {
            assert_eq!(view.error.unwrap().code, error_codes::RETRY_SCHEDULED);
            retry_observations += 1;
        }
    }

    let view = h.service.status(&job_id, false).unwrap();
    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.attempts, 3);
    let error = view.error.unwrap();
    assert_eq!(error.code, error_codes::AGENT_FAILED);
    assert!(error.message.contains("connection reset"));
    assert_eq!(retry_observations, 2);
    assert_monotonic(&observed);

    // Nothing left to run.
    assert_eq!(worker.process_one().unwrap(), Processed::Idle);
}

#[test]
fn retry_delays_follow_capped_exponential_backoff() {
    let h = Harness::new();
    let worker = h.worker(
        "w-1",
        FnRunner(|_: &str, _: &JsonValue| {
            RunOutcome::Failed(HandlerFailure::new("TransientError", "busy"))
        }),
        Harness::fast_config().with_backoff_cap(Duration::from_secs(3)),
    );
    let job_id = h
        .service
        .submit(SubmitRequest::new("echo", json!({})).with_max_attempts(4))
        .unwrap()
        .job_id;

    let mut delays = Vec::new();
    for _ in 0..3 {
        match worker.process_one().unwrap() {
            Processed::RetryScheduled { delay, .. } => delays.push(delay),
            other => panic!("expected a retry, got {other:?}"),
        }
        let error = h.service.status(&job_id, false).unwrap().error.unwrap();
        assert_eq!(error.details["delay_seconds"], delays.last().unwrap().as_secs_f64());

        // Not due yet: the worker's own pump must leave it alone.
        assert_eq!(worker.process_one().unwrap(), Processed::Idle);
        assert_eq!(h.queue().pump_delayed_at(now_unix() + 3600.0, 100).unwrap(), 1);
    }
    assert_eq!(
        delays,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(3)
        ]
    );

    assert!(matches!(worker.process_one().unwrap(), Processed::Failed { .. }));
    assert_eq!(h.service.status(&job_id, false).unwrap().attempts, 4);
}

#[test]
fn idempotent_resubmission_runs_once() {
    let h = Harness::new();
    let calls = Arc::new(Mutex::new(0u32));
    let counter = calls.clone();
    let worker = h.worker(
        "w-1",
        FnRunner(move |_: &str, _: &JsonValue| {
            *counter.lock().unwrap() += 1;
            RunOutcome::Succeeded(json!("done"))
        }),
        Harness::fast_config(),
    );

    let req = SubmitRequest::new("echo", json!({ "x": 1 })).with_idempotency_key("k1");
    let first = h.service.submit(req.clone()).unwrap();
    let second = h.service.submit(req.clone()).unwrap();

    assert!(!first.reused);
    assert!(second.reused);
    assert_eq!(first.job_id, second.job_id);
    assert_eq!(h.queue().queue_depth().unwrap(), 1);
    assert_eq!(h.queue().delayed_depth().unwrap(), 0);

    assert_eq!(worker.process_one().unwrap(), Processed::Succeeded(first.job_id));
    assert_eq!(worker.process_one().unwrap(), Processed::Idle);

    let third = h.service.submit(req).unwrap();
    assert!(third.reused);
    assert_eq!(third.status, JobStatus::Succeeded);
    assert_eq!(*calls.lock().unwrap(), 1);
}

#[test]
fn delayed_entry_is_promoted_exactly_once() {
    let h = Harness::new();
    let queue = h.queue();
    let job_id = JobId::new();
    let now = now_unix();
    queue.schedule_delayed(&job_id, Duration::from_secs(60)).unwrap();

    for _ in 0..5 {
        assert_eq!(queue.pump_delayed_at(now, 100).unwrap(), 0);
    }
    assert_eq!(queue.queue_depth().unwrap(), 0);

    assert_eq!(queue.pump_delayed_at(now + 61.0, 100).unwrap(), 1);
    assert_eq!(queue.pump_delayed_at(now + 61.0, 100).unwrap(), 0);
    assert_eq!(queue.queue_depth().unwrap(), 1);
    assert_eq!(queue.dequeue(Duration::ZERO).unwrap(), Some(job_id));
}

#[test]
fn cancellation_is_observed_at_claim() {
    let h = Harness::new();
    let worker = h.worker(
        "w-1",
        FnRunner(|_: &str, _: &JsonValue| -> RunOutcome { panic!("cancelled job executed") }),
        Harness::fast_config(),
    );
    let job_id = h
        .service
        .submit(SubmitRequest::new("echo", json!({})))
        .unwrap()
        .job_id;
    h.service.cancel(&job_id).unwrap();

    assert_eq!(worker.process_one().unwrap(), Processed::Cancelled(job_id));
    let view = h.service.status(&job_id, true).unwrap();
    assert_eq!(view.status, JobStatus::Cancelled);
    assert!(view.finished_at.is_some());
}

#[test]
fn competing_workers_execute_each_job_once() {
    let h = Harness::new();
    let runs: Arc<Mutex<HashMap<u64, u32>>> = Arc::default();

    let ids: Vec<JobId> = (0..40u64)
        .map(|n| {
            h.service
                .submit(SubmitRequest::new("echo", json!({ "n": n })))
                .unwrap()
                .job_id
        })
        .collect();

    let stop = Arc::new(AtomicBool::new(false));
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let runs = runs.clone();
            let worker = h.worker(
                &format!("w-{i}"),
                FnRunner(move |_: &str, payload: &JsonValue| {
                    let n = payload["n"].as_u64().unwrap();
                    *runs.lock().unwrap().entry(n).or_default() += 1;
                    RunOutcome::Succeeded(json!(n))
                }),
                Harness::fast_config(),
            );
            let stop = stop.clone();
            thread::spawn(move || worker.run_until(&stop))
        })
        .collect();

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while runs.lock().unwrap().len() < ids.len() && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    stop.store(true, Ordering::SeqCst);
    for handle in handles {
        handle.join().unwrap();
    }

    let runs = runs.lock().unwrap();
    assert_eq!(runs.len(), ids.len());
    assert!(runs.values().all(|&count| count == 1));
    for id in &ids {
        assert_eq!(h.status(id), JobStatus::Succeeded);
    }
}

#[test]
fn heartbeat_tracks_current_job() {
    let h = Harness::new();
    let seen = Arc::new(Mutex::new(None));
    let backend = h.backend.clone();
    let keys = h.keys.clone();
    let slot = seen.clone();
    let worker = h.worker(
        "w-hb",
        FnRunner(move |_: &str, _: &JsonValue| {
            let record =
                Heartbeat::read(&backend, &keys, &WorkerId::new("w-hb").unwrap()).unwrap();
            *slot.lock().unwrap() = record.and_then(|r| r.current_job);
            RunOutcome::Succeeded(JsonValue::Null)
        }),
        Harness::fast_config(),
    );
    let job_id = h
        .service
        .submit(SubmitRequest::new("echo", json!({})))
        .unwrap()
        .job_id;

    worker.process_one().unwrap();
    assert_eq!(*seen.lock().unwrap(), Some(job_id));

    worker.process_one().unwrap();
    let record = Heartbeat::read(&h.backend, &h.keys, &WorkerId::new("w-hb").unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(record.current_job, None);
}

#[cfg(unix)]
mod subprocess {
    use super::*;
    use crate::jobs::SubprocessRunner;

    fn sh(script: &str) -> SubprocessRunner {
        SubprocessRunner::new("/bin/sh", ["-c", script]).with_term_grace(Duration::from_millis(200))
    }

    #[test]
    fn child_process_result_is_recorded() {
        let h = Harness::new();
        let worker = h.worker(
            "w-sh",
            sh(r#"cat >/dev/null; echo '{"ok":true,"result":{"ok":true}}'"#),
            Harness::fast_config(),
        );
        let job_id = h
            .service
            .submit(SubmitRequest::new("echo", json!({})))
            .unwrap()
            .job_id;

        assert_eq!(worker.process_one().unwrap(), Processed::Succeeded(job_id));
        assert_eq!(
            h.service.status(&job_id, true).unwrap().result,
            Some(json!({ "ok": true }))
        );
    }

    #[test]
    fn hung_child_fails_with_timeout() {
        let h = Harness::new();
        let worker = h.worker(
            "w-sh",
            sh("sleep 30"),
            Harness::fast_config().with_job_timeout(Duration::from_millis(300)),
        );
        let job_id = h
            .service
            .submit(SubmitRequest::new("echo", json!({})).with_max_attempts(5))
            .unwrap()
            .job_id;

        let started = std::time::Instant::now();
        let processed = worker.process_one().unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(
            processed,
            Processed::Failed {
                job_id,
                code: error_codes::TIMEOUT
            }
        );

        let view = h.service.status(&job_id, false).unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.attempts, 1);
        assert_eq!(view.error.unwrap().code, error_codes::TIMEOUT);
        assert_eq!(h.queue().delayed_depth().unwrap(), 0);
    }

    #[test]
    fn crashed_child_is_worker_error() {
        let h = Harness::new();
        let worker = h.worker("w-sh", sh("cat >/dev/null; kill -SEGV $$"), Harness::fast_config());
        let job_id = h
            .service
            .submit(SubmitRequest::new("echo", json!({})))
            .unwrap()
            .job_id;

        worker.process_one().unwrap();
        let view = h.service.status(&job_id, false).unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.error.unwrap().code, error_codes::WORKER_ERROR);
    }
}

#[test]
fn heartbeat_stays_alive_through_a_long_attempt() {
    let h = Harness::new();
    let worker_id = WorkerId::new("w-long").unwrap();
    let heartbeat = Heartbeat::new(
        h.backend.clone(),
        h.keys.clone(),
        worker_id.clone(),
        vec!["echo".into()],
    )
    .with_ttl(Duration::from_millis(150));

    let seen = Arc::new(Mutex::new(None));
    let backend = h.backend.clone();
    let keys = h.keys.clone();
    let slot = seen.clone();
    let runner = FnRunner(move |_: &str, _: &JsonValue| {
        thread::sleep(Duration::from_millis(450));
        let record = Heartbeat::read(&backend, &keys, &WorkerId::new("w-long").unwrap()).unwrap();
        *slot.lock().unwrap() = Some(record.and_then(|r| r.current_job));
        RunOutcome::Succeeded(JsonValue::Null)
    });
    let worker = Worker::new(
        h.service.store().clone(),
        h.queue(),
        heartbeat,
        runner,
        Harness::fast_config(),
    );
    let job_id = h
        .service
        .submit(SubmitRequest::new("echo", json!({})))
        .unwrap()
        .job_id;

    assert_eq!(worker.process_one().unwrap(), Processed::Succeeded(job_id));
    assert_eq!(*seen.lock().unwrap(), Some(Some(job_id)));
}
