//! Work queue ordering and pause control.
//!
//! Pending requests of a pool are ordered as follows:
//!
//! 1. Requests that have waited longer than the starvation threshold come
//!    first, oldest first, regardless of their queue's priority.
//! 2. Everything else drains by queue priority (lower number first), then
//!    FIFO by scheduled time and enqueue sequence.
//!
//! Only due requests (scheduled time <= now) from unpaused queues are
//! eligible, and no queue contributes more than its own remaining capacity.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use flowplane_state::{RunRequest, StateStore, WorkPool, WorkQueue};

use crate::error::{QueueError, QueueResult};

/// Ordered, filterable view over the pending requests of each pool.
#[derive(Clone)]
pub struct WorkQueues {
    store: StateStore,
    starvation_threshold: Duration,
}

impl WorkQueues {
    pub fn new(store: StateStore, starvation_threshold: Duration) -> Self {
        Self {
            store,
            starvation_threshold,
        }
    }

    /// Up to `available_capacity` eligible requests of `pool`, in dispatch
    /// order. A paused pool yields nothing.
    pub fn peek_eligible(
        &self,
        pool: &str,
        available_capacity: usize,
        now: DateTime<Utc>,
    ) -> QueueResult<Vec<RunRequest>> {
        let work_pool = self
            .store
            .get_pool(pool)?
            .ok_or_else(|| QueueError::PoolNotFound(pool.to_string()))?;
        if work_pool.paused || available_capacity == 0 {
            return Ok(Vec::new());
        }

        let queues = self.store.list_queues(pool)?;
        let snapshot = self.store.capacity_snapshot(pool)?;
        let mut room: HashMap<String, usize> = HashMap::new();
        let mut priority: HashMap<String, u32> = HashMap::new();
        for queue in queues.iter().filter(|q| !q.paused) {
            let active = snapshot.queue_active.get(&queue.name).copied().unwrap_or(0);
            room.insert(queue.name.clone(), queue_room(queue, active));
            priority.insert(queue.name.clone(), queue.priority);
        }

        let mut due: Vec<RunRequest> = self
            .store
            .list_pending(Some(pool))?
            .into_iter()
            .filter(|r| r.scheduled_time <= now && room.contains_key(&r.queue_name))
            .collect();
        let threshold = chrono::Duration::from_std(self.starvation_threshold)
            .unwrap_or(chrono::Duration::MAX);
        due.sort_by(|a, b| dispatch_order(a, b, &priority, threshold, now));

        let mut eligible = Vec::new();
        for request in due {
            if eligible.len() >= available_capacity {
                break;
            }
            if let Some(left) = room.get_mut(&request.queue_name)
                && *left > 0
            {
                *left -= 1;
                eligible.push(request);
            }
        }
        debug!(pool, eligible = eligible.len(), "eligible requests computed");
        Ok(eligible)
    }

    pub fn pause_queue(&self, pool: &str, queue: &str) -> QueueResult<WorkQueue> {
        self.set_queue_paused(pool, queue, true)
    }

    pub fn resume_queue(&self, pool: &str, queue: &str) -> QueueResult<WorkQueue> {
        self.set_queue_paused(pool, queue, false)
    }

    pub fn pause_pool(&self, pool: &str) -> QueueResult<WorkPool> {
        self.set_pool_paused(pool, true)
    }

    pub fn resume_pool(&self, pool: &str) -> QueueResult<WorkPool> {
        self.set_pool_paused(pool, false)
    }

    fn set_queue_paused(&self, pool: &str, queue: &str, paused: bool) -> QueueResult<WorkQueue> {
        let updated = self
            .store
            .set_queue_paused(pool, queue, paused)?
            .ok_or_else(|| QueueError::QueueNotFound(format!("{pool}/{queue}")))?;
        info!(pool, queue, paused, "work queue pause state changed");
        Ok(updated)
    }

    fn set_pool_paused(&self, pool: &str, paused: bool) -> QueueResult<WorkPool> {
        let updated = self
            .store
            .set_pool_paused(pool, paused)?
            .ok_or_else(|| QueueError::PoolNotFound(pool.to_string()))?;
        info!(pool, paused, "work pool pause state changed");
        Ok(updated)
    }
}

fn queue_room(queue: &WorkQueue, active: u64) -> usize {
    match queue.concurrency_limit {
        Some(limit) => u64::from(limit).saturating_sub(active) as usize,
        None => usize::MAX,
    }
}

/// Total order used to drain a pool's backlog.
pub fn dispatch_order(
    a: &RunRequest,
    b: &RunRequest,
    priority: &HashMap<String, u32>,
    starvation_threshold: chrono::Duration,
    now: DateTime<Utc>,
) -> Ordering {
    let starved = |r: &RunRequest| now - r.scheduled_time >= starvation_threshold;
    let prio = |r: &RunRequest| priority.get(&r.queue_name).copied().unwrap_or(u32::MAX);

    match (starved(a), starved(b)) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (true, true) => fifo(a, b),
        (false, false) => prio(a).cmp(&prio(b)).then_with(|| fifo(a, b)),
    }
}

fn fifo(a: &RunRequest, b: &RunRequest) -> Ordering {
    a.scheduled_time
        .cmp(&b.scheduled_time)
        .then(a.seq.cmp(&b.seq))
}
