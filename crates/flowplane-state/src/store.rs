//! StateStore — redb-backed state persistence for flowplane.
//!
//! Provides typed operations over deployments, schedules, pools, queues,
//! pending requests and flow runs. All values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).
//!
//! Callers pass `now` explicitly so that time-dependent behavior is
//! deterministic under test.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, Table};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable<'txn> = Table<'txn, &'static str, &'static [u8]>;
type CounterTable<'txn> = Table<'txn, &'static str, u64>;

const GLOBAL_COUNTER: &str = "global";
const PENDING_SEQ: &str = "pending_seq";

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENT_NAMES).map_err(map_err!(Table))?;
        txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
        txn.open_table(POOLS).map_err(map_err!(Table))?;
        txn.open_table(QUEUES).map_err(map_err!(Table))?;
        txn.open_table(PENDING).map_err(map_err!(Table))?;
        txn.open_table(RUNS).map_err(map_err!(Table))?;
        txn.open_table(CAPACITY).map_err(map_err!(Table))?;
        txn.open_table(IDEMPOTENCY).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Work pools & queues ────────────────────────────────────────

    /// Insert or update a work pool. A new pool gets its `default` queue in
    /// the same transaction.
    pub fn put_pool(&self, pool: &WorkPool) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut pools = txn.open_table(POOLS).map_err(map_err!(Table))?;
            let mut queues = txn.open_table(QUEUES).map_err(map_err!(Table))?;
            write_json(&mut pools, &pool.name, pool)?;

            let default_key = queue_key(&pool.name, DEFAULT_QUEUE);
            if read_json::<WorkQueue, _>(&queues, &default_key)?.is_none() {
                let queue = WorkQueue {
                    pool_name: pool.name.clone(),
                    name: DEFAULT_QUEUE.to_string(),
                    priority: 1,
                    concurrency_limit: None,
                    paused: false,
                    created_at: pool.created_at,
                };
                write_json(&mut queues, &default_key, &queue)?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(pool = %pool.name, "work pool stored");
        Ok(())
    }

    pub fn get_pool(&self, name: &str) -> StateResult<Option<WorkPool>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(POOLS).map_err(map_err!(Table))?;
        read_json(&table, name)
    }

    pub fn list_pools(&self) -> StateResult<Vec<WorkPool>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(POOLS).map_err(map_err!(Table))?;
        scan_json(&table, "")
    }

    /// Pause or resume a pool. Returns the updated pool, or `None` if unknown.
    pub fn set_pool_paused(&self, name: &str, paused: bool) -> StateResult<Option<WorkPool>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut table = txn.open_table(POOLS).map_err(map_err!(Table))?;
            match read_json::<WorkPool, _>(&table, name)? {
                Some(mut pool) => {
                    pool.paused = paused;
                    write_json(&mut table, name, &pool)?;
                    Some(pool)
                }
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(pool = %name, paused, "work pool pause flag set");
        Ok(updated)
    }

    /// Insert or update a queue. The owning pool must exist.
    pub fn put_queue(&self, queue: &WorkQueue) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let pools = txn.open_table(POOLS).map_err(map_err!(Table))?;
            if read_json::<WorkPool, _>(&pools, &queue.pool_name)?.is_none() {
                return Err(StateError::NotFound(format!("work pool {}", queue.pool_name)));
            }
            let mut queues = txn.open_table(QUEUES).map_err(map_err!(Table))?;
            write_json(&mut queues, &queue.table_key(), queue)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(queue = %queue.table_key(), priority = queue.priority, "work queue stored");
        Ok(())
    }

    pub fn get_queue(&self, pool: &str, name: &str) -> StateResult<Option<WorkQueue>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(QUEUES).map_err(map_err!(Table))?;
        read_json(&table, &queue_key(pool, name))
    }

    /// All queues of one pool, in key order.
    pub fn list_queues(&self, pool: &str) -> StateResult<Vec<WorkQueue>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(QUEUES).map_err(map_err!(Table))?;
        scan_json(&table, &format!("{pool}/"))
    }

    pub fn set_queue_paused(
        &self,
        pool: &str,
        name: &str,
        paused: bool,
    ) -> StateResult<Option<WorkQueue>> {
        let key = queue_key(pool, name);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut table = txn.open_table(QUEUES).map_err(map_err!(Table))?;
            match read_json::<WorkQueue, _>(&table, &key)? {
                Some(mut queue) => {
                    queue.paused = paused;
                    write_json(&mut table, &key, &queue)?;
                    Some(queue)
                }
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(queue = %key, paused, "work queue pause flag set");
        Ok(updated)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Create a deployment, or update the one already registered under the
    /// same `{flow}/{name}`. Updating keeps the id and creation time.
    /// Returns the stored deployment and whether it was newly created.
    pub fn upsert_deployment(
        &self,
        draft: DeploymentDraft,
        now: DateTime<Utc>,
    ) -> StateResult<(Deployment, bool)> {
        let name_key = draft.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let (deployment, created) = {
            let mut names = txn.open_table(DEPLOYMENT_NAMES).map_err(map_err!(Table))?;
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;

            let existing_id = names
                .get(name_key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_string());
            let existing = match existing_id {
                Some(id) => read_json::<Deployment, _>(&table, &id)?,
                None => None,
            };

            let (deployment, created) = match existing {
                Some(previous) => {
                    let mut updated = Deployment::from_draft(draft, previous.id, previous.created_at);
                    updated.updated_at = now;
                    if previous.paused && !updated.paused {
                        let mut schedules = txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
                        fast_forward_schedules(&mut schedules, previous.id, now)?;
                    }
                    (updated, false)
                }
                None => (Deployment::from_draft(draft, Uuid::new_v4(), now), true),
            };

            let id = deployment.id.to_string();
            write_json(&mut table, &id, &deployment)?;
            names
                .insert(name_key.as_str(), id.as_str())
                .map_err(map_err!(Write))?;
            (deployment, created)
        };
        txn.commit().map_err(map_err!(Transaction))?;
        info!(deployment = %name_key, id = %deployment.id, created, "deployment stored");
        Ok((deployment, created))
    }

    pub fn get_deployment(&self, id: Uuid) -> StateResult<Option<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        read_json(&table, &id.to_string())
    }

    /// Look a deployment up by its `{flow}/{name}` address.
    pub fn get_deployment_by_name(&self, flow: &str, name: &str) -> StateResult<Option<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let names = txn.open_table(DEPLOYMENT_NAMES).map_err(map_err!(Table))?;
        let id = names
            .get(deployment_key(flow, name).as_str())
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_string());
        match id {
            Some(id) => {
                let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
                read_json(&table, &id)
            }
            None => Ok(None),
        }
    }

    /// Deployments ordered by id, paged with `offset`/`limit`.
    pub fn list_deployments(&self, offset: usize, limit: usize) -> StateResult<Vec<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.skip(offset).take(limit) {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    /// Pause or resume a deployment. Resuming moves the cursor of each of its
    /// schedules up to `now`, so occurrences inside the paused window are
    /// never turned into runs.
    pub fn set_deployment_paused(
        &self,
        id: Uuid,
        paused: bool,
        now: DateTime<Utc>,
    ) -> StateResult<Option<Deployment>> {
        let key = id.to_string();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            match read_json::<Deployment, _>(&table, &key)? {
                Some(mut deployment) => {
                    if deployment.paused && !paused {
                        let mut schedules = txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
                        fast_forward_schedules(&mut schedules, id, now)?;
                    }
                    deployment.paused = paused;
                    deployment.updated_at = now;
                    write_json(&mut table, &key, &deployment)?;
                    Some(deployment)
                }
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    /// Delete a deployment together with its schedules and every run that has
    /// not been admitted yet. Admitted runs are left to finish. Returns `None`
    /// if the deployment did not exist.
    pub fn delete_deployment(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> StateResult<Option<DeletionReport>> {
        let key = id.to_string();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let report = {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let Some(deployment) = read_json::<Deployment, _>(&table, &key)? else {
                return Ok(None);
            };
            table.remove(key.as_str()).map_err(map_err!(Write))?;

            let mut names = txn.open_table(DEPLOYMENT_NAMES).map_err(map_err!(Table))?;
            names
                .remove(deployment.table_key().as_str())
                .map_err(map_err!(Write))?;

            let mut schedules = txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
            let doomed: Vec<String> = scan_json::<ScheduleRecord, _>(&schedules, "")?
                .into_iter()
                .filter(|s| s.deployment_id == id)
                .map(|s| s.id.to_string())
                .collect();
            for schedule_key in &doomed {
                schedules
                    .remove(schedule_key.as_str())
                    .map_err(map_err!(Write))?;
            }

            let mut runs = txn.open_table(RUNS).map_err(map_err!(Table))?;
            let mut pending = txn.open_table(PENDING).map_err(map_err!(Table))?;
            let mut capacity = txn.open_table(CAPACITY).map_err(map_err!(Table))?;
            let waiting: Vec<RunRequest> = scan_json::<RunRequest, _>(&pending, "")?
                .into_iter()
                .filter(|r| r.deployment_id == id)
                .collect();

            let mut cancelled = Vec::new();
            for request in waiting {
                let run_key = request.flow_run_id.to_string();
                let Some(mut run) = read_json::<FlowRun, _>(&runs, &run_key)? else {
                    pending
                        .remove(request.table_key().as_str())
                        .map_err(map_err!(Write))?;
                    continue;
                };
                if !run.state.can_transition_to(RunState::Cancelled) {
                    continue;
                }
                record_state(
                    &mut run,
                    RunState::Cancelled,
                    TransitionDetail::message("deployment deleted"),
                    now,
                );
                settle_terminal(&mut run, &mut runs, &mut pending, &mut capacity, now)?;
                write_json(&mut runs, &run_key, &run)?;
                cancelled.push(run);
            }

            DeletionReport {
                schedules_removed: doomed.len() as u32,
                runs_cancelled: cancelled,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        info!(
            deployment = %id,
            schedules_removed = report.schedules_removed,
            runs_cancelled = report.runs_cancelled.len(),
            "deployment deleted"
        );
        Ok(Some(report))
    }

    // ── Schedules ──────────────────────────────────────────────────

    /// Insert or update a schedule. The deployment must exist.
    pub fn put_schedule(&self, schedule: &ScheduleRecord) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            if read_json::<Deployment, _>(&deployments, &schedule.deployment_id.to_string())?
                .is_none()
            {
                return Err(StateError::NotFound(format!(
                    "deployment {}",
                    schedule.deployment_id
                )));
            }
            let mut table = txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
            write_json(&mut table, &schedule.id.to_string(), schedule)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(schedule = %schedule.id, deployment = %schedule.deployment_id, "schedule stored");
        Ok(())
    }

    pub fn get_schedule(&self, id: Uuid) -> StateResult<Option<ScheduleRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
        read_json(&table, &id.to_string())
    }

    pub fn list_schedules(&self) -> StateResult<Vec<ScheduleRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
        scan_json(&table, "")
    }

    pub fn list_schedules_for_deployment(&self, deployment_id: Uuid) -> StateResult<Vec<ScheduleRecord>> {
        Ok(self
            .list_schedules()?
            .into_iter()
            .filter(|s| s.deployment_id == deployment_id)
            .collect())
    }

    pub fn delete_schedule(&self, id: Uuid) -> StateResult<bool> {
        let key = id.to_string();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(schedule = %key, existed, "schedule deleted");
        Ok(existed)
    }

    /// Pause (`active = false`) or resume a schedule. Pausing keeps the
    /// cursor; resuming a paused schedule moves it up to `now` so the paused
    /// window is skipped.
    pub fn set_schedule_active(
        &self,
        id: Uuid,
        active: bool,
        now: DateTime<Utc>,
    ) -> StateResult<Option<ScheduleRecord>> {
        self.update_schedule(id, |s| {
            if active && !s.active {
                fast_forward(s, now);
            }
            s.active = active;
        })
    }

    /// Move a schedule's cursor forward. Never moves it backwards.
    pub fn advance_schedule(&self, id: Uuid, fired: DateTime<Utc>) -> StateResult<Option<ScheduleRecord>> {
        self.update_schedule(id, |s| {
            if s.last_fired.is_none_or(|prev| fired > prev) {
                s.last_fired = Some(fired);
            }
        })
    }

    fn update_schedule(
        &self,
        id: Uuid,
        apply: impl FnOnce(&mut ScheduleRecord),
    ) -> StateResult<Option<ScheduleRecord>> {
        let key = id.to_string();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut table = txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
            match read_json::<ScheduleRecord, _>(&table, &key)? {
                Some(mut schedule) => {
                    apply(&mut schedule);
                    write_json(&mut table, &key, &schedule)?;
                    Some(schedule)
                }
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    // ── Run intake ─────────────────────────────────────────────────

    /// Durably record a run request and its `Scheduled` flow run.
    ///
    /// The request, the run, the sequence counter and the idempotency key
    /// are written in one transaction. If the request carries a key that was
    /// already used, nothing is written and the existing run id is returned.
    pub fn enqueue_run(
        &self,
        mut request: RunRequest,
        deployment_key: &str,
        parent_run_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> StateResult<EnqueueOutcome> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let run = {
            let mut idempotency = txn.open_table(IDEMPOTENCY).map_err(map_err!(Table))?;
            if let Some(key) = request.idempotency_key.as_deref()
                && let Some(existing) = read_json::<IdempotencyRecord, _>(&idempotency, key)?
            {
                debug!(idempotency_key = %key, run = %existing.flow_run_id, "duplicate run request");
                return Ok(EnqueueOutcome::Duplicate(existing.flow_run_id));
            }

            let queues = txn.open_table(QUEUES).map_err(map_err!(Table))?;
            let qkey = queue_key(&request.pool_name, &request.queue_name);
            if read_json::<WorkQueue, _>(&queues, &qkey)?.is_none() {
                return Err(StateError::NotFound(format!("work queue {qkey}")));
            }

            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            let seq = counter(&meta, PENDING_SEQ)? + 1;
            meta.insert(PENDING_SEQ, seq).map_err(map_err!(Write))?;
            request.seq = seq;

            let pending_key = request.table_key();
            let mut pending = txn.open_table(PENDING).map_err(map_err!(Table))?;
            write_json(&mut pending, &pending_key, &request)?;

            let mut run = FlowRun::scheduled(&request, deployment_key, parent_run_id, now);
            run.pending_key = Some(pending_key);
            let mut runs = txn.open_table(RUNS).map_err(map_err!(Table))?;
            write_json(&mut runs, &run.id.to_string(), &run)?;

            if let Some(key) = request.idempotency_key.as_deref() {
                let record = IdempotencyRecord {
                    flow_run_id: run.id,
                    recorded_at: now,
                };
                write_json(&mut idempotency, key, &record)?;
            }
            run
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            run = %run.id,
            deployment = %run.deployment_key,
            queue = %queue_key(&run.pool_name, &run.queue_name),
            scheduled_time = %run.scheduled_time,
            "run request enqueued"
        );
        Ok(EnqueueOutcome::Enqueued(run))
    }

    /// Pending requests of one pool (or all pools), in key order.
    pub fn list_pending(&self, pool: Option<&str>) -> StateResult<Vec<RunRequest>> {
        let prefix = pool.map(|p| format!("{p}/")).unwrap_or_default();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PENDING).map_err(map_err!(Table))?;
        scan_json(&table, &prefix)
    }

    /// Drop idempotency keys recorded before `before`. Returns how many went.
    pub fn prune_idempotency_keys(&self, before: DateTime<Utc>) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed = {
            let mut table = txn.open_table(IDEMPOTENCY).map_err(map_err!(Table))?;
            let mut stale = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let record: IdempotencyRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if record.recorded_at < before {
                    stale.push(key.value().to_string());
                }
            }
            for key in &stale {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            stale.len() as u32
        };
        txn.commit().map_err(map_err!(Transaction))?;
        if removed > 0 {
            debug!(removed, "idempotency keys pruned");
        }
        Ok(removed)
    }

    // ── Admission & capacity ───────────────────────────────────────

    /// Claim runs from one queue and take their capacity, all or nothing.
    ///
    /// Every run must be `Scheduled`/`Late` (or `Pending` without capacity,
    /// which is a run being readmitted after a failed submission). The pool,
    /// queue and global counters must all have room for the whole batch.
    /// On success the runs are `Pending`, hold capacity, and their requests
    /// have left the queue. On any other outcome nothing is written.
    pub fn admit_runs(
        &self,
        pool: &str,
        queue: &str,
        run_ids: &[Uuid],
        global_limit: Option<u32>,
        now: DateTime<Utc>,
    ) -> StateResult<AdmitOutcome> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let admitted = {
            let pools = txn.open_table(POOLS).map_err(map_err!(Table))?;
            let queues = txn.open_table(QUEUES).map_err(map_err!(Table))?;
            let work_pool = read_json::<WorkPool, _>(&pools, pool)?
                .ok_or_else(|| StateError::NotFound(format!("work pool {pool}")))?;
            let qkey = queue_key(pool, queue);
            let work_queue = read_json::<WorkQueue, _>(&queues, &qkey)?
                .ok_or_else(|| StateError::NotFound(format!("work queue {qkey}")))?;
            if work_pool.paused || work_queue.paused {
                return Ok(AdmitOutcome::Paused);
            }

            let mut capacity = txn.open_table(CAPACITY).map_err(map_err!(Table))?;
            let batch = run_ids.len() as u64;
            let pool_key = pool_counter(pool);
            let queue_counter_key = queue_counter(pool, queue);
            let fits = |active: u64, limit: Option<u32>| limit.is_none_or(|l| active + batch <= u64::from(l));
            if !fits(counter(&capacity, &pool_key)?, work_pool.concurrency_limit)
                || !fits(counter(&capacity, &queue_counter_key)?, work_queue.concurrency_limit)
                || !fits(counter(&capacity, GLOBAL_COUNTER)?, global_limit)
            {
                return Ok(AdmitOutcome::CapacityExhausted);
            }

            let mut runs = txn.open_table(RUNS).map_err(map_err!(Table))?;
            let mut pending = txn.open_table(PENDING).map_err(map_err!(Table))?;
            let mut claimed = Vec::with_capacity(run_ids.len());
            for id in run_ids {
                let run = read_json::<FlowRun, _>(&runs, &id.to_string())?
                    .ok_or_else(|| StateError::NotFound(format!("flow run {id}")))?;
                let readmission = run.state == RunState::Pending && !run.holds_capacity;
                let claimable = run.state.is_waiting() || readmission;
                if !claimable || run.pool_name != pool || run.queue_name != queue {
                    return Ok(AdmitOutcome::NotClaimable {
                        run_id: run.id,
                        state: run.state,
                    });
                }
                claimed.push(run);
            }

            for run in &mut claimed {
                if let Some(key) = run.pending_key.take() {
                    pending.remove(key.as_str()).map_err(map_err!(Write))?;
                }
                if run.state.is_waiting() {
                    record_state(run, RunState::Pending, TransitionDetail::default(), now);
                }
                run.holds_capacity = true;
                write_json(&mut runs, &run.id.to_string(), &*run)?;
            }
            add_counter(&mut capacity, &pool_key, batch)?;
            add_counter(&mut capacity, &queue_counter_key, batch)?;
            add_counter(&mut capacity, GLOBAL_COUNTER, batch)?;
            claimed
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(queue = %queue_key(pool, queue), admitted = admitted.len(), "runs admitted");
        Ok(AdmitOutcome::Admitted(admitted))
    }

    /// Give back the capacity of a `Pending` run whose submission failed so
    /// it can be readmitted later. Returns false if it held none.
    pub fn release_for_retry(&self, run_id: Uuid) -> StateResult<bool> {
        let key = run_id.to_string();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released = {
            let mut runs = txn.open_table(RUNS).map_err(map_err!(Table))?;
            let mut run = read_json::<FlowRun, _>(&runs, &key)?
                .ok_or_else(|| StateError::NotFound(format!("flow run {run_id}")))?;
            if run.state == RunState::Pending && run.holds_capacity {
                let mut capacity = txn.open_table(CAPACITY).map_err(map_err!(Table))?;
                release_capacity(&mut capacity, &run)?;
                run.holds_capacity = false;
                write_json(&mut runs, &key, &run)?;
                true
            } else {
                false
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(released)
    }

    /// Active-run counters for one pool.
    pub fn capacity_snapshot(&self, pool: &str) -> StateResult<CapacitySnapshot> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let capacity = txn.open_table(CAPACITY).map_err(map_err!(Table))?;
        let pools = txn.open_table(POOLS).map_err(map_err!(Table))?;
        let queues = txn.open_table(QUEUES).map_err(map_err!(Table))?;

        let mut snapshot = CapacitySnapshot {
            pool_active: counter(&capacity, &pool_counter(pool))?,
            pool_limit: read_json::<WorkPool, _>(&pools, pool)?.and_then(|p| p.concurrency_limit),
            global_active: counter(&capacity, GLOBAL_COUNTER)?,
            ..CapacitySnapshot::default()
        };
        for queue in scan_json::<WorkQueue, _>(&queues, &format!("{pool}/"))? {
            let active = counter(&capacity, &queue_counter(pool, &queue.name))?;
            snapshot.queue_active.insert(queue.name, active);
        }
        Ok(snapshot)
    }

    /// Runs currently counted against a pool.
    pub fn active_count(&self, pool: &str) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let capacity = txn.open_table(CAPACITY).map_err(map_err!(Table))?;
        counter(&capacity, &pool_counter(pool))
    }

    // ── Flow runs ──────────────────────────────────────────────────

    pub fn get_run(&self, id: Uuid) -> StateResult<Option<FlowRun>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RUNS).map_err(map_err!(Table))?;
        read_json(&table, &id.to_string())
    }

    /// Runs in any of `states` (every run when empty), in id order.
    pub fn list_runs(&self, states: &[RunState]) -> StateResult<Vec<FlowRun>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RUNS).map_err(map_err!(Table))?;
        Ok(scan_json::<FlowRun, _>(&table, "")?
            .into_iter()
            .filter(|r| states.is_empty() || states.contains(&r.state))
            .collect())
    }

    pub fn list_runs_for_deployment(&self, deployment_id: Uuid) -> StateResult<Vec<FlowRun>> {
        Ok(self
            .list_runs(&[])?
            .into_iter()
            .filter(|r| r.deployment_id == deployment_id)
            .collect())
    }

    /// Move a run along the state machine, atomically.
    ///
    /// Asking for the state the run is already in is a no-op reported with
    /// `changed = false`. A terminal transition removes any still-queued
    /// request, releases held capacity exactly once, and records the outcome
    /// on the parent run if there is one.
    pub fn transition_run(
        &self,
        run_id: Uuid,
        to: RunState,
        detail: TransitionDetail,
        now: DateTime<Utc>,
    ) -> StateResult<TransitionOutcome> {
        let key = run_id.to_string();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut runs = txn.open_table(RUNS).map_err(map_err!(Table))?;
            let mut run = read_json::<FlowRun, _>(&runs, &key)?
                .ok_or_else(|| StateError::NotFound(format!("flow run {run_id}")))?;
            let previous = run.state;
            if previous == to {
                return Ok(TransitionOutcome {
                    run,
                    previous,
                    changed: false,
                    released_capacity: false,
                });
            }
            if !previous.can_transition_to(to) {
                return Err(StateError::InvalidTransition { from: previous, to });
            }

            record_state(&mut run, to, detail, now);
            let mut released_capacity = false;
            if to.is_terminal() {
                let mut pending = txn.open_table(PENDING).map_err(map_err!(Table))?;
                let mut capacity = txn.open_table(CAPACITY).map_err(map_err!(Table))?;
                released_capacity = settle_terminal(&mut run, &mut runs, &mut pending, &mut capacity, now)?;
            }
            write_json(&mut runs, &key, &run)?;
            TransitionOutcome {
                run,
                previous,
                changed: true,
                released_capacity,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            run = %run_id,
            from = ?outcome.previous,
            to = ?to,
            released_capacity = outcome.released_capacity,
            "run transitioned"
        );
        Ok(outcome)
    }

    /// Record a liveness signal. Only `Running` and `Cancelling` runs accept
    /// heartbeats; returns the run's state and whether it was recorded.
    pub fn record_heartbeat(&self, run_id: Uuid, now: DateTime<Utc>) -> StateResult<(RunState, bool)> {
        let key = run_id.to_string();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = {
            let mut runs = txn.open_table(RUNS).map_err(map_err!(Table))?;
            let mut run = read_json::<FlowRun, _>(&runs, &key)?
                .ok_or_else(|| StateError::NotFound(format!("flow run {run_id}")))?;
            let accepted = matches!(run.state, RunState::Running | RunState::Cancelling);
            if accepted {
                run.last_heartbeat = Some(now);
                write_json(&mut runs, &key, &run)?;
            }
            (run.state, accepted)
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(result)
    }

    /// Remember the backend handle of a run without changing its state.
    pub fn set_backend_handle(&self, run_id: Uuid, handle: &str) -> StateResult<FlowRun> {
        let key = run_id.to_string();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let run = {
            let mut runs = txn.open_table(RUNS).map_err(map_err!(Table))?;
            let mut run = read_json::<FlowRun, _>(&runs, &key)?
                .ok_or_else(|| StateError::NotFound(format!("flow run {run_id}")))?;
            run.backend_handle = Some(handle.to_string());
            write_json(&mut runs, &key, &run)?;
            run
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(run)
    }

    /// Count a submission attempt, remembering the backend handle if one was
    /// returned.
    pub fn note_submission(&self, run_id: Uuid, handle: Option<&str>) -> StateResult<FlowRun> {
        let key = run_id.to_string();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let run = {
            let mut runs = txn.open_table(RUNS).map_err(map_err!(Table))?;
            let mut run = read_json::<FlowRun, _>(&runs, &key)?
                .ok_or_else(|| StateError::NotFound(format!("flow run {run_id}")))?;
            run.submission_attempts += 1;
            if let Some(handle) = handle {
                run.backend_handle = Some(handle.to_string());
            }
            write_json(&mut runs, &key, &run)?;
            run
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(run)
    }
}

// ── Transaction helpers ────────────────────────────────────────────

/// Move a schedule's cursor up to `now`. Never moves it backwards.
fn fast_forward(schedule: &mut ScheduleRecord, now: DateTime<Utc>) {
    let cursor = schedule.last_fired.unwrap_or(schedule.created_at);
    if cursor < now {
        schedule.last_fired = Some(now);
    }
}

fn fast_forward_schedules(
    schedules: &mut JsonTable<'_>,
    deployment_id: Uuid,
    now: DateTime<Utc>,
) -> StateResult<()> {
    let owned: Vec<ScheduleRecord> = scan_json::<ScheduleRecord, _>(&*schedules, "")?
        .into_iter()
        .filter(|s| s.deployment_id == deployment_id)
        .collect();
    for mut schedule in owned {
        fast_forward(&mut schedule, now);
        write_json(schedules, &schedule.id.to_string(), &schedule)?;
    }
    Ok(())
}

fn pool_counter(pool: &str) -> String {
    format!("pool:{pool}")
}

fn queue_counter(pool: &str, queue: &str) -> String {
    format!("queue:{}", queue_key(pool, queue))
}

/// Apply a state change to the in-memory record.
fn record_state(run: &mut FlowRun, to: RunState, detail: TransitionDetail, now: DateTime<Utc>) {
    run.state = to;
    run.state_entered_at = now;
    run.history.push(StateRecord {
        state: to,
        at: now,
        message: detail.message,
    });
    if let Some(handle) = detail.backend_handle {
        run.backend_handle = Some(handle);
    }
    if let Some(failure) = detail.failure {
        run.failure = Some(failure);
    }
    if to == RunState::Running {
        run.start_time.get_or_insert(now);
        run.last_heartbeat = Some(now);
    }
    if to.is_terminal() {
        run.end_time = Some(now);
    }
}

/// Side effects of a run reaching a terminal state, inside the caller's
/// transaction. Returns whether capacity was released.
fn settle_terminal(
    run: &mut FlowRun,
    runs: &mut JsonTable<'_>,
    pending: &mut JsonTable<'_>,
    capacity: &mut CounterTable<'_>,
    now: DateTime<Utc>,
) -> StateResult<bool> {
    if let Some(key) = run.pending_key.take() {
        pending.remove(key.as_str()).map_err(map_err!(Write))?;
    }

    let released = run.holds_capacity;
    if released {
        release_capacity(capacity, run)?;
        run.holds_capacity = false;
    }

    if let Some(parent_id) = run.parent_run_id {
        let parent_key = parent_id.to_string();
        if let Some(mut parent) = read_json::<FlowRun, _>(&*runs, &parent_key)? {
            parent.subflow_states.push(SubflowOutcome {
                run_id: run.id,
                state: run.state,
                at: now,
            });
            write_json(runs, &parent_key, &parent)?;
        }
    }
    Ok(released)
}

fn release_capacity(capacity: &mut CounterTable<'_>, run: &FlowRun) -> StateResult<()> {
    sub_counter(capacity, &pool_counter(&run.pool_name), 1)?;
    sub_counter(capacity, &queue_counter(&run.pool_name, &run.queue_name), 1)?;
    sub_counter(capacity, GLOBAL_COUNTER, 1)
}

fn counter<R>(table: &R, key: &str) -> StateResult<u64>
where
    R: ReadableTable<&'static str, u64>,
{
    Ok(table
        .get(key)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0))
}

fn add_counter(table: &mut CounterTable<'_>, key: &str, n: u64) -> StateResult<()> {
    let value = counter(&*table, key)? + n;
    table.insert(key, value).map_err(map_err!(Write))?;
    Ok(())
}

fn sub_counter(table: &mut CounterTable<'_>, key: &str, n: u64) -> StateResult<()> {
    let value = counter(&*table, key)?.saturating_sub(n);
    table.insert(key, value).map_err(map_err!(Write))?;
    Ok(())
}

fn read_json<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => serde_json::from_slice(guard.value())
            .map(Some)
            .map_err(map_err!(Deserialize)),
        None => Ok(None),
    }
}

fn write_json<T: Serialize>(table: &mut JsonTable<'_>, key: &str, value: &T) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Every value whose key starts with `prefix`, in key order.
fn scan_json<T, R>(table: &R, prefix: &str) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(prefix) {
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::Map;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn test_pool(name: &str, limit: Option<u32>) -> WorkPool {
        WorkPool {
            name: name.to_string(),
            backend_kind: "process".to_string(),
            concurrency_limit: limit,
            paused: false,
            job_template: JobTemplate::default(),
            description: None,
            created_at: t0(),
        }
    }

    fn test_draft(flow: &str, name: &str, pool: &str) -> DeploymentDraft {
        DeploymentDraft {
            flow_name: flow.to_string(),
            name: name.to_string(),
            entrypoint: "flows/etl.py:run".to_string(),
            working_dir: None,
            parameters: Map::new(),
            parameter_schema: None,
            enforce_parameter_schema: false,
            version: None,
            description: None,
            tags: vec![],
            work_pool_name: pool.to_string(),
            work_queue_name: DEFAULT_QUEUE.to_string(),
            job_variables: Map::new(),
            pull_steps: vec![],
            triggers: vec![],
            paused: false,
        }
    }

    fn test_request(deployment: &Deployment, key: Option<&str>) -> RunRequest {
        RunRequest {
            id: Uuid::new_v4(),
            flow_run_id: Uuid::new_v4(),
            deployment_id: deployment.id,
            pool_name: deployment.work_pool_name.clone(),
            queue_name: deployment.work_queue_name.clone(),
            parameters: Map::new(),
            job_variables: Map::new(),
            scheduled_time: t0(),
            created_at: t0(),
            seq: 0,
            origin: RunOrigin::Manual,
            idempotency_key: key.map(str::to_string),
        }
    }

    fn setup(limit: Option<u32>) -> (StateStore, Deployment) {
        let store = StateStore::open_in_memory().unwrap();
        store.put_pool(&test_pool("pool-a", limit)).unwrap();
        let (deployment, _) = store
            .upsert_deployment(test_draft("etl", "nightly", "pool-a"), t0())
            .unwrap();
        (store, deployment)
    }

    fn enqueue(store: &StateStore, deployment: &Deployment) -> FlowRun {
        match store
            .enqueue_run(test_request(deployment, None), &deployment.table_key(), None, t0())
            .unwrap()
        {
            EnqueueOutcome::Enqueued(run) => run,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn admit(store: &StateStore, run: &FlowRun) -> AdmitOutcome {
        store
            .admit_runs(&run.pool_name, &run.queue_name, &[run.id], None, t0())
            .unwrap()
    }

    // ── Pools & queues ─────────────────────────────────────────────

    #[test]
    fn new_pool_gets_default_queue() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_pool(&test_pool("pool-a", None)).unwrap();

        let queues = store.list_queues("pool-a").unwrap();
        assert_eq!(queues.len(), 1);
        assert_eq!(queues[0].name, DEFAULT_QUEUE);
        assert!(store.list_queues("pool-b").unwrap().is_empty());
    }

    #[test]
    fn queue_requires_existing_pool() {
        let store = StateStore::open_in_memory().unwrap();
        let queue = WorkQueue {
            pool_name: "ghost".to_string(),
            name: "high".to_string(),
            priority: 1,
            concurrency_limit: None,
            paused: false,
            created_at: t0(),
        };
        assert!(matches!(store.put_queue(&queue), Err(StateError::NotFound(_))));
    }

    #[test]
    fn pause_flags_round_trip() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_pool(&test_pool("pool-a", None)).unwrap();

        assert!(store.set_pool_paused("pool-a", true).unwrap().unwrap().paused);
        assert!(store.get_pool("pool-a").unwrap().unwrap().paused);
        assert!(store.set_queue_paused("pool-a", "default", true).unwrap().unwrap().paused);
        assert!(store.set_pool_paused("nope", true).unwrap().is_none());
    }

    // ── Deployments ────────────────────────────────────────────────

    #[test]
    fn upsert_is_idempotent_by_flow_and_name() {
        let store = StateStore::open_in_memory().unwrap();
        let (first, created) = store
            .upsert_deployment(test_draft("etl", "nightly", "pool-a"), t0())
            .unwrap();
        assert!(created);

        let mut draft = test_draft("etl", "nightly", "pool-a");
        draft.description = Some("updated".to_string());
        let later = t0() + Duration::minutes(5);
        let (second, created) = store.upsert_deployment(draft, later).unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, t0());
        assert_eq!(second.updated_at, later);
        assert_eq!(second.description.as_deref(), Some("updated"));

        // Same name under another flow is a different deployment.
        let (other, created) = store
            .upsert_deployment(test_draft("reports", "nightly", "pool-a"), t0())
            .unwrap();
        assert!(created);
        assert_ne!(other.id, first.id);

        let found = store.get_deployment_by_name("etl", "nightly").unwrap().unwrap();
        assert_eq!(found.id, first.id);
    }

    #[test]
    fn unnamed_triggers_keep_their_id_across_redeploys() {
        let store = StateStore::open_in_memory().unwrap();
        let trigger = |expect: &str| TriggerSpec {
            id: Uuid::nil(),
            expect: expect.to_string(),
            match_resource: BTreeMap::new(),
            parameters: Map::new(),
            enabled: true,
        };
        let named = Uuid::new_v4();
        let mut draft = test_draft("etl", "on-upload", "pool-a");
        draft.triggers = vec![
            trigger("s3.object.created"),
            TriggerSpec {
                id: named,
                ..trigger("s3.object.deleted")
            },
        ];

        let (first, _) = store.upsert_deployment(draft.clone(), t0()).unwrap();
        assert!(!first.triggers[0].id.is_nil());
        assert_eq!(first.triggers[1].id, named);

        draft.description = Some("redeployed".to_string());
        let (second, _) = store.upsert_deployment(draft.clone(), t0()).unwrap();
        assert_eq!(second.triggers[0].id, first.triggers[0].id);

        // A changed rule is a different trigger.
        draft.triggers[0].expect = "s3.object.*".to_string();
        let (third, _) = store.upsert_deployment(draft, t0()).unwrap();
        assert_ne!(third.triggers[0].id, first.triggers[0].id);
    }

    #[test]
    fn list_deployments_pages_in_id_order() {
        let store = StateStore::open_in_memory().unwrap();
        for i in 0..5 {
            store
                .upsert_deployment(test_draft("etl", &format!("d{i}"), "pool-a"), t0())
                .unwrap();
        }
        let all = store.list_deployments(0, 100).unwrap();
        assert_eq!(all.len(), 5);
        let mut ids: Vec<String> = all.iter().map(|d| d.id.to_string()).collect();
        let sorted = {
            let mut s = ids.clone();
            s.sort();
            s
        };
        assert_eq!(ids, sorted);

        let page = store.list_deployments(1, 2).unwrap();
        assert_eq!(page.len(), 2);
        ids.drain(..1);
        assert_eq!(page[0].id.to_string(), ids[0]);
        assert!(store.list_deployments(5, 10).unwrap().is_empty());
    }

    #[test]
    fn delete_deployment_cascades_to_schedules_and_waiting_runs() {
        let (store, deployment) = setup(None);
        let schedule = ScheduleRecord {
            id: Uuid::new_v4(),
            deployment_id: deployment.id,
            spec: ScheduleSpec::Interval {
                every_secs: 60,
                anchor: t0(),
            },
            active: true,
            last_fired: None,
            created_at: t0(),
        };
        store.put_schedule(&schedule).unwrap();

        let waiting = enqueue(&store, &deployment);
        let active = enqueue(&store, &deployment);
        assert!(matches!(admit(&store, &active), AdmitOutcome::Admitted(_)));

        let report = store.delete_deployment(deployment.id, t0()).unwrap().unwrap();
        assert_eq!(report.schedules_removed, 1);
        assert_eq!(report.runs_cancelled.len(), 1);
        assert_eq!(report.runs_cancelled[0].id, waiting.id);

        assert!(store.get_deployment(deployment.id).unwrap().is_none());
        assert!(store.get_deployment_by_name("etl", "nightly").unwrap().is_none());
        assert!(store.list_schedules().unwrap().is_empty());
        assert!(store.list_pending(None).unwrap().is_empty());
        assert_eq!(store.get_run(waiting.id).unwrap().unwrap().state, RunState::Cancelled);
        // Admitted runs keep going.
        assert_eq!(store.get_run(active.id).unwrap().unwrap().state, RunState::Pending);

        assert!(store.delete_deployment(deployment.id, t0()).unwrap().is_none());
    }

    // ── Schedules ──────────────────────────────────────────────────

    #[test]
    fn schedule_cursor_only_moves_forward() {
        let (store, deployment) = setup(None);
        let schedule = ScheduleRecord {
            id: Uuid::new_v4(),
            deployment_id: deployment.id,
            spec: ScheduleSpec::Cron {
                expression: "0 * * * *".to_string(),
                timezone: "UTC".to_string(),
            },
            active: true,
            last_fired: None,
            created_at: t0(),
        };
        store.put_schedule(&schedule).unwrap();

        let later = t0() + Duration::hours(2);
        store.advance_schedule(schedule.id, later).unwrap();
        store.advance_schedule(schedule.id, t0()).unwrap();
        assert_eq!(store.get_schedule(schedule.id).unwrap().unwrap().last_fired, Some(later));

        let paused = store
            .set_schedule_active(schedule.id, false, later + Duration::hours(1))
            .unwrap()
            .unwrap();
        assert!(!paused.active);
        assert_eq!(paused.last_fired, Some(later));
    }

    #[test]
    fn resuming_skips_the_paused_window() {
        let (store, deployment) = setup(None);
        let schedule = ScheduleRecord {
            id: Uuid::new_v4(),
            deployment_id: deployment.id,
            spec: ScheduleSpec::Interval {
                every_secs: 60,
                anchor: t0(),
            },
            active: true,
            last_fired: Some(t0()),
            created_at: t0(),
        };
        store.put_schedule(&schedule).unwrap();

        store.set_schedule_active(schedule.id, false, t0()).unwrap();
        let resumed_at = t0() + Duration::days(1);
        let resumed = store
            .set_schedule_active(schedule.id, true, resumed_at)
            .unwrap()
            .unwrap();
        assert!(resumed.active);
        assert_eq!(resumed.last_fired, Some(resumed_at));

        // Resuming an active schedule leaves the cursor alone.
        let again = store
            .set_schedule_active(schedule.id, true, resumed_at + Duration::hours(1))
            .unwrap()
            .unwrap();
        assert_eq!(again.last_fired, Some(resumed_at));

        store.set_deployment_paused(deployment.id, true, resumed_at).unwrap();
        store
            .set_deployment_paused(deployment.id, false, resumed_at + Duration::days(2))
            .unwrap();
        assert_eq!(
            store.get_schedule(schedule.id).unwrap().unwrap().last_fired,
            Some(resumed_at + Duration::days(2))
        );
    }

    #[test]
    fn schedule_requires_deployment() {
        let store = StateStore::open_in_memory().unwrap();
        let schedule = ScheduleRecord {
            id: Uuid::new_v4(),
            deployment_id: Uuid::new_v4(),
            spec: ScheduleSpec::Interval {
                every_secs: 60,
                anchor: t0(),
            },
            active: true,
            last_fired: None,
            created_at: t0(),
        };
        assert!(matches!(store.put_schedule(&schedule), Err(StateError::NotFound(_))));
    }

    // ── Intake ─────────────────────────────────────────────────────

    #[test]
    fn enqueue_assigns_increasing_sequence() {
        let (store, deployment) = setup(None);
        enqueue(&store, &deployment);
        enqueue(&store, &deployment);

        let pending = store.list_pending(Some("pool-a")).unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].seq < pending[1].seq);
        assert!(store.list_pending(Some("pool-b")).unwrap().is_empty());
    }

    #[test]
    fn duplicate_idempotency_key_returns_existing_run() {
        let (store, deployment) = setup(None);
        let first = store
            .enqueue_run(test_request(&deployment, Some("sched:1")), "etl/nightly", None, t0())
            .unwrap();
        let EnqueueOutcome::Enqueued(run) = first else {
            panic!("expected enqueue");
        };
        let second = store
            .enqueue_run(test_request(&deployment, Some("sched:1")), "etl/nightly", None, t0())
            .unwrap();
        assert_eq!(second, EnqueueOutcome::Duplicate(run.id));
        assert_eq!(store.list_pending(None).unwrap().len(), 1);
    }

    #[test]
    fn enqueue_into_unknown_queue_fails() {
        let (store, deployment) = setup(None);
        let mut request = test_request(&deployment, None);
        request.queue_name = "missing".to_string();
        let err = store
            .enqueue_run(request, "etl/nightly", None, t0())
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn pruned_idempotency_keys_can_be_reused() {
        let (store, deployment) = setup(None);
        store
            .enqueue_run(test_request(&deployment, Some("k")), "etl/nightly", None, t0())
            .unwrap();
        assert_eq!(store.prune_idempotency_keys(t0()).unwrap(), 0);
        assert_eq!(store.prune_idempotency_keys(t0() + Duration::seconds(1)).unwrap(), 1);

        let again = store
            .enqueue_run(test_request(&deployment, Some("k")), "etl/nightly", None, t0())
            .unwrap();
        assert!(matches!(again, EnqueueOutcome::Enqueued(_)));
    }

    // ── Admission & capacity ───────────────────────────────────────

    #[test]
    fn admission_respects_pool_limit() {
        let (store, deployment) = setup(Some(1));
        let a = enqueue(&store, &deployment);
        let b = enqueue(&store, &deployment);

        let AdmitOutcome::Admitted(runs) = admit(&store, &a) else {
            panic!("first admission should succeed");
        };
        assert_eq!(runs[0].state, RunState::Pending);
        assert!(runs[0].holds_capacity);
        assert!(runs[0].pending_key.is_none());

        assert_eq!(admit(&store, &b), AdmitOutcome::CapacityExhausted);
        assert_eq!(store.active_count("pool-a").unwrap(), 1);
        // b is still queued.
        assert_eq!(store.list_pending(None).unwrap().len(), 1);
    }

    #[test]
    fn admission_is_all_or_nothing() {
        let (store, deployment) = setup(Some(2));
        let runs: Vec<FlowRun> = (0..3).map(|_| enqueue(&store, &deployment)).collect();
        let ids: Vec<Uuid> = runs.iter().map(|r| r.id).collect();

        let outcome = store.admit_runs("pool-a", "default", &ids, None, t0()).unwrap();
        assert_eq!(outcome, AdmitOutcome::CapacityExhausted);
        assert_eq!(store.active_count("pool-a").unwrap(), 0);
        assert_eq!(store.list_pending(None).unwrap().len(), 3);
    }

    #[test]
    fn global_limit_applies_across_pools() {
        let (store, deployment) = setup(None);
        let a = enqueue(&store, &deployment);
        let b = enqueue(&store, &deployment);

        let first = store.admit_runs("pool-a", "default", &[a.id], Some(1), t0()).unwrap();
        assert!(matches!(first, AdmitOutcome::Admitted(_)));
        let second = store.admit_runs("pool-a", "default", &[b.id], Some(1), t0()).unwrap();
        assert_eq!(second, AdmitOutcome::CapacityExhausted);
    }

    #[test]
    fn run_is_claimed_at_most_once() {
        let (store, deployment) = setup(None);
        let run = enqueue(&store, &deployment);
        assert!(matches!(admit(&store, &run), AdmitOutcome::Admitted(_)));
        assert_eq!(
            admit(&store, &run),
            AdmitOutcome::NotClaimable {
                run_id: run.id,
                state: RunState::Pending,
            }
        );
        assert_eq!(store.active_count("pool-a").unwrap(), 1);
    }

    #[test]
    fn paused_queue_admits_nothing() {
        let (store, deployment) = setup(None);
        let run = enqueue(&store, &deployment);
        store.set_queue_paused("pool-a", "default", true).unwrap();
        assert_eq!(admit(&store, &run), AdmitOutcome::Paused);
    }

    #[test]
    fn terminal_transition_releases_capacity_exactly_once() {
        let (store, deployment) = setup(Some(1));
        let run = enqueue(&store, &deployment);
        admit(&store, &run);
        store
            .transition_run(run.id, RunState::Running, TransitionDetail::default(), t0())
            .unwrap();

        let done = store
            .transition_run(run.id, RunState::Completed, TransitionDetail::default(), t0())
            .unwrap();
        assert!(done.changed);
        assert!(done.released_capacity);
        assert_eq!(done.run.end_time, Some(t0()));
        assert_eq!(store.active_count("pool-a").unwrap(), 0);

        // A second report of the same outcome changes nothing.
        let again = store
            .transition_run(run.id, RunState::Completed, TransitionDetail::default(), t0())
            .unwrap();
        assert!(!again.changed);
        assert!(!again.released_capacity);

        let err = store
            .transition_run(run.id, RunState::Failed, TransitionDetail::default(), t0())
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::InvalidTransition {
                from: RunState::Completed,
                to: RunState::Failed
            }
        ));
        assert_eq!(store.capacity_snapshot("pool-a").unwrap().global_active, 0);
    }

    #[test]
    fn cancelling_a_scheduled_run_drops_its_request() {
        let (store, deployment) = setup(None);
        let run = enqueue(&store, &deployment);
        let outcome = store
            .transition_run(run.id, RunState::Cancelled, TransitionDetail::message("user"), t0())
            .unwrap();
        assert!(!outcome.released_capacity);
        assert!(store.list_pending(None).unwrap().is_empty());
        assert_eq!(
            admit(&store, &run),
            AdmitOutcome::NotClaimable {
                run_id: run.id,
                state: RunState::Cancelled,
            }
        );
    }

    #[test]
    fn released_run_can_be_readmitted() {
        let (store, deployment) = setup(Some(1));
        let run = enqueue(&store, &deployment);
        admit(&store, &run);

        assert!(store.release_for_retry(run.id).unwrap());
        assert!(!store.release_for_retry(run.id).unwrap());
        assert_eq!(store.active_count("pool-a").unwrap(), 0);

        let AdmitOutcome::Admitted(runs) = admit(&store, &run) else {
            panic!("readmission should succeed");
        };
        assert!(runs[0].holds_capacity);
        assert_eq!(store.active_count("pool-a").unwrap(), 1);
    }

    #[test]
    fn capacity_snapshot_reports_per_queue_counts() {
        let (store, deployment) = setup(Some(4));
        let run = enqueue(&store, &deployment);
        admit(&store, &run);

        let snapshot = store.capacity_snapshot("pool-a").unwrap();
        assert_eq!(snapshot.pool_active, 1);
        assert_eq!(snapshot.pool_limit, Some(4));
        assert_eq!(snapshot.queue_active.get("default"), Some(&1));
        assert_eq!(snapshot.global_active, 1);
    }

    // ── Flow runs ──────────────────────────────────────────────────

    #[test]
    fn running_sets_start_and_heartbeat() {
        let (store, deployment) = setup(None);
        let run = enqueue(&store, &deployment);
        admit(&store, &run);

        let (state, accepted) = store.record_heartbeat(run.id, t0()).unwrap();
        assert_eq!(state, RunState::Pending);
        assert!(!accepted);

        let started = t0() + Duration::seconds(3);
        let outcome = store
            .transition_run(
                run.id,
                RunState::Running,
                TransitionDetail {
                    backend_handle: Some("pid:42".to_string()),
                    ..TransitionDetail::default()
                },
                started,
            )
            .unwrap();
        assert_eq!(outcome.run.start_time, Some(started));
        assert_eq!(outcome.run.last_heartbeat, Some(started));
        assert_eq!(outcome.run.backend_handle.as_deref(), Some("pid:42"));

        let beat = started + Duration::seconds(30);
        assert_eq!(store.record_heartbeat(run.id, beat).unwrap(), (RunState::Running, true));
        assert_eq!(store.get_run(run.id).unwrap().unwrap().last_heartbeat, Some(beat));
    }

    #[test]
    fn child_outcome_is_recorded_on_parent() {
        let (store, deployment) = setup(None);
        let parent = enqueue(&store, &deployment);
        let child = match store
            .enqueue_run(test_request(&deployment, None), "etl/nightly", Some(parent.id), t0())
            .unwrap()
        {
            EnqueueOutcome::Enqueued(run) => run,
            other => panic!("unexpected {other:?}"),
        };
        assert!(child.linked_as_subflow);

        admit(&store, &child);
        store
            .transition_run(child.id, RunState::Running, TransitionDetail::default(), t0())
            .unwrap();
        store
            .transition_run(
                child.id,
                RunState::Failed,
                TransitionDetail::failure(ErrorKind::ExecutionFailure, "exit code 1"),
                t0(),
            )
            .unwrap();

        let parent = store.get_run(parent.id).unwrap().unwrap();
        assert_eq!(parent.subflow_states.len(), 1);
        assert_eq!(parent.subflow_states[0].run_id, child.id);
        assert_eq!(parent.subflow_states[0].state, RunState::Failed);
    }

    #[test]
    fn list_runs_filters_by_state() {
        let (store, deployment) = setup(None);
        let a = enqueue(&store, &deployment);
        enqueue(&store, &deployment);
        admit(&store, &a);

        assert_eq!(store.list_runs(&[]).unwrap().len(), 2);
        assert_eq!(store.list_runs(&[RunState::Pending]).unwrap().len(), 1);
        assert_eq!(
            store
                .list_runs(&[RunState::Scheduled, RunState::Late])
                .unwrap()
                .len(),
            1
        );
        assert_eq!(store.list_runs_for_deployment(deployment.id).unwrap().len(), 2);
    }

    #[test]
    fn note_submission_counts_attempts() {
        let (store, deployment) = setup(None);
        let run = enqueue(&store, &deployment);
        store.note_submission(run.id, None).unwrap();
        let run = store.note_submission(run.id, Some("job-7")).unwrap();
        assert_eq!(run.submission_attempts, 2);
        assert_eq!(run.backend_handle.as_deref(), Some("job-7"));
    }

    // ── Persistence ────────────────────────────────────────────────

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        let run_id = {
            let store = StateStore::open(&path).unwrap();
            store.put_pool(&test_pool("pool-a", Some(3))).unwrap();
            let (deployment, _) = store
                .upsert_deployment(test_draft("etl", "nightly", "pool-a"), t0())
                .unwrap();
            let run = enqueue(&store, &deployment);
            admit(&store, &run);
            run.id
        };

        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.get_run(run_id).unwrap().unwrap().state, RunState::Pending);
        assert_eq!(store.active_count("pool-a").unwrap(), 1);
        assert_eq!(store.get_pool("pool-a").unwrap().unwrap().concurrency_limit, Some(3));
    }
}
