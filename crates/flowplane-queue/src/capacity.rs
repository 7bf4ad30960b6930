//! Capacity manager — admission against pool, queue and global ceilings.
//!
//! Admission is a single store transaction that checks every ceiling and
//! takes the capacity together with the claim on the run, so concurrent
//! dispatchers can never both admit into the last slot. Capacity comes back
//! only through a terminal run transition (or an explicit retry release).

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use flowplane_state::{AdmitOutcome, CapacitySnapshot, FlowRun, StateStore};

use crate::error::{QueueError, QueueResult};

#[derive(Clone)]
pub struct CapacityManager {
    store: StateStore,
    global_limit: Option<u32>,
}

impl CapacityManager {
    /// `global_limit` is the account-wide ceiling; `None` is unlimited.
    pub fn new(store: StateStore, global_limit: Option<u32>) -> Self {
        Self { store, global_limit }
    }

    /// Atomically admit `run_ids` from one queue, or nothing at all.
    pub fn try_admit(
        &self,
        pool: &str,
        queue: &str,
        run_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> QueueResult<AdmitOutcome> {
        let outcome = self
            .store
            .admit_runs(pool, queue, run_ids, self.global_limit, now)
            .map_err(|e| match e {
                flowplane_state::StateError::NotFound(what) if what.starts_with("work pool") => {
                    QueueError::PoolNotFound(pool.to_string())
                }
                flowplane_state::StateError::NotFound(what) if what.starts_with("work queue") => {
                    QueueError::QueueNotFound(format!("{pool}/{queue}"))
                }
                other => QueueError::State(other),
            })?;
        if !matches!(outcome, AdmitOutcome::Admitted(_)) {
            debug!(pool, queue, runs = run_ids.len(), ?outcome, "admission refused");
        }
        Ok(outcome)
    }

    /// Admit a single run. Returns the claimed run, or `None` when it must
    /// stay queued (no capacity, paused, or already claimed elsewhere).
    pub fn admit_run(
        &self,
        pool: &str,
        queue: &str,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<FlowRun>> {
        match self.try_admit(pool, queue, &[run_id], now)? {
            AdmitOutcome::Admitted(mut runs) => Ok(runs.pop()),
            _ => Ok(None),
        }
    }

    /// Runs currently counted against `pool`.
    pub fn active_count(&self, pool: &str) -> QueueResult<u64> {
        Ok(self.store.active_count(pool)?)
    }

    /// How many more runs `pool` could admit right now, taking the global
    /// ceiling into account. `usize::MAX` when unbounded.
    pub fn available(&self, pool: &str) -> QueueResult<usize> {
        let snapshot = self.snapshot(pool)?;
        let pool_room = snapshot
            .pool_limit
            .map(|limit| u64::from(limit).saturating_sub(snapshot.pool_active));
        let global_room = self
            .global_limit
            .map(|limit| u64::from(limit).saturating_sub(snapshot.global_active));
        let room = match (pool_room, global_room) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Ok(room.map_or(usize::MAX, |r| r as usize))
    }

    pub fn snapshot(&self, pool: &str) -> QueueResult<CapacitySnapshot> {
        Ok(self.store.capacity_snapshot(pool)?)
    }

    pub fn global_limit(&self) -> Option<u32> {
        self.global_limit
    }
}
