//! Ready list plus delayed sorted set for one named queue.
//!
//! Producers `LPUSH`, consumers `BRPOP`, so the ready list is FIFO. Retries go
//! into the delayed set scored by their due time and are moved back by
//! [`JobQueue::pump_delayed`], which any worker may call.

use std::time::Duration;

use tracing::{debug, warn};

use agentq_core::JobId;

use crate::backend::{BackendError, Keyspace, SharedBackend, now_unix};

/// Queue operations fail only on backend errors.
pub type QueueError = BackendError;

pub type QueueResult<T> = Result<T, QueueError>;

/// Default number of due items moved per pump call.
pub const DEFAULT_PUMP_LIMIT: usize = 100;

/// Default `BRPOP` block time.
pub const DEFAULT_DEQUEUE_BLOCK: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct JobQueue {
    backend: SharedBackend,
    ready_key: String,
    delayed_key: String,
    name: String,
}

impl core::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobQueue")
            .field("name", &self.name)
            .field("ready_key", &self.ready_key)
            .field("delayed_key", &self.delayed_key)
            .finish()
    }
}

impl JobQueue {
    pub fn new(backend: SharedBackend, keys: &Keyspace, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            backend,
            ready_key: keys.ready(&name),
            delayed_key: keys.delayed(&name),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enqueue(&self, job_id: &JobId) -> QueueResult<()> {
        let depth = self.backend.lpush(&self.ready_key, &job_id.to_string())?;
        debug!(queue = %self.name, job_id = %job_id, depth, "job enqueued");
        Ok(())
    }

    /// Claim the oldest ready job, blocking up to `block`.
    ///
    /// Each id is delivered to exactly one caller. Entries that are not job ids
    /// are logged and dropped; the call then reports an empty queue.
    pub fn dequeue(&self, block: Duration) -> QueueResult<Option<JobId>> {
        let Some(raw) = self.backend.brpop(&self.ready_key, block)? else {
            return Ok(None);
        };
        match raw.parse::<JobId>() {
            Ok(job_id) => Ok(Some(job_id)),
            Err(e) => {
                warn!(queue = %self.name, raw = %raw, error = %e, "dropping malformed queue entry");
                Ok(None)
            }
        }
    }

    /// Park a job in the delayed set until `delay` has elapsed.
    pub fn schedule_delayed(&self, job_id: &JobId, delay: Duration) -> QueueResult<()> {
        let due = now_unix() + delay.as_secs_f64();
        self.backend
            .zadd(&self.delayed_key, &job_id.to_string(), due)?;
        debug!(queue = %self.name, job_id = %job_id, delay_secs = delay.as_secs_f64(), "job scheduled");
        Ok(())
    }

    /// Move up to `limit` due jobs into the ready list; returns how many moved.
    pub fn pump_delayed(&self, limit: usize) -> QueueResult<usize> {
        self.pump_delayed_at(now_unix(), limit)
    }

    /// [`pump_delayed`](Self::pump_delayed) against an explicit clock.
    ///
    /// Pops the earliest entry with `ZPOPMIN`, so concurrent pumpers never move
    /// the same id twice. A popped entry that is not yet due is put back and the
    /// pump stops.
    pub fn pump_delayed_at(&self, now: f64, limit: usize) -> QueueResult<usize> {
        let mut moved = 0;
        while moved < limit {
            let Some((member, due)) = self.backend.zpopmin(&self.delayed_key)? else {
                break;
            };
            if due > now {
                self.backend.zadd(&self.delayed_key, &member, due)?;
                break;
            }
            self.backend.lpush(&self.ready_key, &member)?;
            moved += 1;
        }
        if moved > 0 {
            debug!(queue = %self.name, moved, "delayed jobs released");
        }
        Ok(moved)
    }

    pub fn queue_depth(&self) -> QueueResult<u64> {
        self.backend.llen(&self.ready_key)
    }

    pub fn delayed_depth(&self) -> QueueResult<u64> {
        self.backend.zcard(&self.delayed_key)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::{Backend, InMemoryBackend};

    fn queue() -> (Arc<InMemoryBackend>, JobQueue) {
        let backend = Arc::new(InMemoryBackend::new());
        let queue = JobQueue::new(backend.clone(), &Keyspace::default(), "default");
        (backend, queue)
    }

    #[test]
    fn fifo_order() {
        let (_backend, queue) = queue();
        let ids: Vec<JobId> = (0..3).map(|_| JobId::new()).collect();
        for id in &ids {
            queue.enqueue(id).unwrap();
        }
        assert_eq!(queue.queue_depth().unwrap(), 3);

        for id in &ids {
            assert_eq!(queue.dequeue(Duration::ZERO).unwrap(), Some(*id));
        }
        assert_eq!(queue.dequeue(Duration::ZERO).unwrap(), None);
    }

    #[test]
    fn dequeue_blocks_then_returns_none() {
        let (_backend, queue) = queue();
        let start = std::time::Instant::now();
        assert_eq!(queue.dequeue(Duration::from_millis(50)).unwrap(), None);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn malformed_entries_are_dropped() {
        let (backend, queue) = queue();
        backend.lpush("agentq:q:default", "not-a-uuid").unwrap();
        assert_eq!(queue.dequeue(Duration::ZERO).unwrap(), None);
        assert_eq!(queue.queue_depth().unwrap(), 0);
    }

    #[test]
    fn pump_moves_only_due_entries() {
        let (_backend, queue) = queue();
        let due = JobId::new();
        let later = JobId::new();
        queue.schedule_delayed(&due, Duration::ZERO).unwrap();
        queue.schedule_delayed(&later, Duration::from_secs(3600)).unwrap();
        assert_eq!(queue.delayed_depth().unwrap(), 2);

        assert_eq!(queue.pump_delayed(DEFAULT_PUMP_LIMIT).unwrap(), 1);
        assert_eq!(queue.delayed_depth().unwrap(), 1);
        assert_eq!(queue.dequeue(Duration::ZERO).unwrap(), Some(due));
    }

    #[test]
    fn pump_with_empty_delayed_set_is_noop() {
        let (_backend, queue) = queue();
        assert_eq!(queue.pump_delayed(DEFAULT_PUMP_LIMIT).unwrap(), 0);
        assert_eq!(queue.queue_depth().unwrap(), 0);
    }

    #[test]
    fn pump_respects_limit_and_due_order() {
        let (backend, queue) = queue();
        let ids: Vec<JobId> = (0..5).map(|_| JobId::new()).collect();
        for (i, id) in ids.iter().enumerate() {
            backend
                .zadd("agentq:q:default:delayed", &id.to_string(), 100.0 + i as f64)
                .unwrap();
        }

        assert_eq!(queue.pump_delayed_at(1_000.0, 2).unwrap(), 2);
        assert_eq!(queue.delayed_depth().unwrap(), 3);
        assert_eq!(queue.dequeue(Duration::ZERO).unwrap(), Some(ids[0]));
        assert_eq!(queue.dequeue(Duration::ZERO).unwrap(), Some(ids[1]));

        assert_eq!(queue.pump_delayed_at(1_000.0, 100).unwrap(), 3);
        assert_eq!(queue.delayed_depth().unwrap(), 0);
    }

    #[test]
    fn not_yet_due_entry_is_put_back_with_score() {
        let (backend, queue) = queue();
        let id = JobId::new();
        backend
            .zadd("agentq:q:default:delayed", &id.to_string(), 500.0)
            .unwrap();

        assert_eq!(queue.pump_delayed_at(499.0, 10).unwrap(), 0);
        assert_eq!(
            backend.zset_snapshot("agentq:q:default:delayed"),
            vec![(id.to_string(), 500.0)]
        );
        assert_eq!(queue.pump_delayed_at(500.0, 10).unwrap(), 1);
    }

    #[test]
    fn queues_are_isolated_by_name() {
        let backend = Arc::new(InMemoryBackend::new());
        let keys = Keyspace::default();
        let a = JobQueue::new(backend.clone(), &keys, "a");
        let b = JobQueue::new(backend, &keys, "b");

        a.enqueue(&JobId::new()).unwrap();
        assert_eq!(a.queue_depth().unwrap(), 1);
        assert_eq!(b.queue_depth().unwrap(), 0);
        assert_eq!(b.dequeue(Duration::ZERO).unwrap(), None);
    }
}
