//! Bounded priority queue of pending submissions
//!
//! Higher priority dispatches first; insertion order is the stable
//! tiebreaker. Push is idempotent per submission id, and pending entries can
//! be removed atomically for cancellation.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
#[error("queue is full ({capacity} pending submissions)")]
pub struct QueueFullError {
    pub capacity: usize,
}

/// One pending submission
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct QueuedJob {
    pub submission_id: Uuid,
    pub priority: i32,
    pub seq: u64,
    pub enqueue_time: DateTime<Utc>,
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then earlier insertion
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<QueuedJob>,
    queued: HashSet<Uuid>,
    /// Tombstones for removed entries still sitting in the heap
    removed: HashSet<Uuid>,
    seq: u64,
}

/// Bounded priority FIFO with idempotent submit and atomic removal
pub struct JobQueue {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
        }
    }

    /// Enqueue a submission. Idempotent: a known pending id is a no-op
    /// returning `Ok(false)`.
    pub async fn push(&self, submission_id: Uuid, priority: i32) -> Result<bool, QueueFullError> {
        let mut inner = self.inner.lock().await;
        if inner.queued.contains(&submission_id) {
            return Ok(false);
        }
        if inner.queued.len() >= self.capacity {
            return Err(QueueFullError {
                capacity: self.capacity,
            });
        }
        inner.seq += 1;
        let seq = inner.seq;
        inner.queued.insert(submission_id);
        inner.heap.push(QueuedJob {
            submission_id,
            priority,
            seq,
            enqueue_time: Utc::now(),
        });
        Ok(true)
    }

    /// Pop the next job to dispatch, skipping tombstoned entries
    pub async fn pop(&self) -> Option<QueuedJob> {
        let mut inner = self.inner.lock().await;
        while let Some(job) = inner.heap.pop() {
            if inner.removed.remove(&job.submission_id) {
                continue;
            }
            if inner.queued.remove(&job.submission_id) {
                return Some(job);
            }
        }
        None
    }

    /// Atomically remove a pending job. Returns true if it was pending.
    pub async fn remove(&self, submission_id: Uuid) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.queued.remove(&submission_id) {
            inner.removed.insert(submission_id);
            true
        } else {
            false
        }
    }

    /// Number of pending jobs
    pub async fn len(&self) -> usize {
        self.inner.lock().await.queued.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
