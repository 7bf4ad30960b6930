//! Dispatcher — drains work queues into execution backends.
//!
//! For each eligible request the dispatcher resolves everything it needs
//! (deployment, pool, backend, code environment, rendered job spec) *before*
//! reserving capacity, so configuration errors fail the run without ever
//! occupying a slot. Admission and submission then follow; a failed
//! submission gives its slot back during the backoff and reclaims it before
//! the next attempt.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use flowplane_core::config::DispatcherConfig;
use flowplane_queue::{CapacityManager, WorkQueues};
use flowplane_state::{
    AdmitOutcome, ErrorKind, FlowRun, RunNotifier, RunRequest, RunState, StateError, StateStore,
    TransitionDetail,
};

use crate::backend::{BackendRegistry, ExecutionBackend, JobSpec};
use crate::error::{DispatchError, DispatchResult};
use crate::job::build_job_spec;
use crate::retrieval::CodeRetriever;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub loop_interval: Duration,
    /// Extra submission attempts after the first.
    pub submission_retries: u32,
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
}

impl From<&DispatcherConfig> for DispatchSettings {
    fn from(config: &DispatcherConfig) -> Self {
        Self {
            loop_interval: config.loop_interval,
            submission_retries: config.submission_retries,
            retry_backoff: config.retry_backoff,
            max_retry_backoff: config.max_retry_backoff,
        }
    }
}

/// What happened to one request.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Accepted by the backend; the run is `Running`.
    Submitted(FlowRun),
    /// No capacity or the queue is paused; the request stays queued.
    Deferred,
    /// The run was no longer waiting (claimed elsewhere, cancelled).
    Skipped,
    /// Unusable configuration; the run failed without taking capacity.
    Rejected(FlowRun),
    /// Every submission attempt failed.
    Failed(FlowRun),
    /// Cancellation arrived while the run was being submitted.
    Cancelled(FlowRun),
}

/// Totals for one pass over every pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub submitted: usize,
    pub deferred: usize,
    pub rejected: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Dispatcher {
    store: StateStore,
    capacity: CapacityManager,
    queues: WorkQueues,
    backends: BackendRegistry,
    retriever: Arc<dyn CodeRetriever>,
    notifier: RunNotifier,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        store: StateStore,
        capacity: CapacityManager,
        queues: WorkQueues,
        backends: BackendRegistry,
        retriever: Arc<dyn CodeRetriever>,
        notifier: RunNotifier,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            capacity,
            queues,
            backends,
            retriever,
            notifier,
            settings,
        }
    }

    /// One pass: for every unpaused pool with room, dispatch its eligible
    /// requests in queue order.
    pub async fn run_once(&self, now: DateTime<Utc>) -> DispatchResult<DispatchReport> {
        let mut report = DispatchReport::default();
        for pool in self.store.list_pools()? {
            if pool.paused {
                continue;
            }
            let available = self.capacity.available(&pool.name)?;
            if available == 0 {
                continue;
            }
            for request in self.queues.peek_eligible(&pool.name, available, now)? {
                match self.dispatch(&request, now).await {
                    Ok(DispatchOutcome::Submitted(_)) => report.submitted += 1,
                    Ok(DispatchOutcome::Rejected(_)) => report.rejected += 1,
                    Ok(DispatchOutcome::Failed(_)) => report.failed += 1,
                    Ok(DispatchOutcome::Deferred) => {
                        report.deferred += 1;
                        // A full queue only holds back its own requests.
                        if self.capacity.available(&pool.name)? == 0 {
                            break;
                        }
                    }
                    Ok(DispatchOutcome::Skipped | DispatchOutcome::Cancelled(_)) => {}
                    Err(e) => {
                        error!(run = %request.flow_run_id, pool = %pool.name, error = %e, "dispatch failed");
                    }
                }
            }
        }
        Ok(report)
    }

    /// Take one queued request through admission and submission.
    pub async fn dispatch(&self, request: &RunRequest, now: DateTime<Utc>) -> DispatchResult<DispatchOutcome> {
        let Some(run) = self.store.get_run(request.flow_run_id)? else {
            warn!(run = %request.flow_run_id, "queued request has no flow run");
            return Ok(DispatchOutcome::Skipped);
        };
        if !run.state.is_waiting() {
            return Ok(DispatchOutcome::Skipped);
        }

        let (backend, job) = match self.prepare(&run).await {
            Ok(prepared) => prepared,
            Err(e) if e.kind() == Some(ErrorKind::ConfigurationError) => {
                let outcome = self.store.transition_run(
                    run.id,
                    RunState::Failed,
                    TransitionDetail::failure(ErrorKind::ConfigurationError, e.to_string()),
                    now,
                )?;
                self.notifier.publish(&outcome);
                return Ok(DispatchOutcome::Rejected(outcome.run));
            }
            Err(e) => return Err(e),
        };

        match self
            .capacity
            .try_admit(&run.pool_name, &run.queue_name, &[run.id], now)?
        {
            AdmitOutcome::Admitted(_) => {}
            AdmitOutcome::NotClaimable { state, .. } => {
                debug!(run = %run.id, ?state, "run claimed elsewhere");
                return Ok(DispatchOutcome::Skipped);
            }
            AdmitOutcome::CapacityExhausted | AdmitOutcome::Paused => {
                return Ok(DispatchOutcome::Deferred);
            }
        }

        self.submit_with_retries(&run, backend.as_ref(), &job, now).await
    }

    /// Resolve the backend and render the job spec. Every error here is a
    /// configuration error except storage failures.
    async fn prepare(&self, run: &FlowRun) -> DispatchResult<(Arc<dyn ExecutionBackend>, JobSpec)> {
        let deployment = self.store.get_deployment(run.deployment_id)?.ok_or_else(|| {
            DispatchError::Configuration(format!("deployment {} no longer exists", run.deployment_key))
        })?;
        let pool = self.store.get_pool(&run.pool_name)?.ok_or_else(|| {
            DispatchError::Configuration(format!("work pool {} no longer exists", run.pool_name))
        })?;
        let backend = self.backends.get(&pool.backend_kind)?;
        let environment = self.retriever.retrieve(&deployment).await?;
        let job = build_job_spec(&pool, &deployment, run, environment)?;
        Ok((backend, job))
    }

    async fn submit_with_retries(
        &self,
        run: &FlowRun,
        backend: &dyn ExecutionBackend,
        job: &JobSpec,
        now: DateTime<Utc>,
    ) -> DispatchResult<DispatchOutcome> {
        let attempts = self.settings.submission_retries.saturating_add(1);
        let mut backoff = self.settings.retry_backoff;
        let mut at = now;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(backoff).await;
                at += chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::zero());
                backoff = backoff.saturating_mul(2).min(self.settings.max_retry_backoff);

                let current = self.current(run)?;
                if current.state != RunState::Pending {
                    return self.settle_interrupted(current, at);
                }
                if self
                    .capacity
                    .admit_run(&run.pool_name, &run.queue_name, run.id, at)?
                    .is_none()
                {
                    last_error = "capacity unavailable for resubmission".to_string();
                    debug!(run = %run.id, attempt, "readmission deferred");
                    continue;
                }
            }

            self.store.note_submission(run.id, None)?;
            match backend.submit(job).await {
                Ok(handle) => return self.mark_running(run, backend, &handle, at).await,
                Err(e) => {
                    warn!(run = %run.id, attempt, attempts, error = %e, "submission failed");
                    last_error = e.to_string();
                    self.store.release_for_retry(run.id)?;
                }
            }
        }

        let current = self.current(run)?;
        if current.state != RunState::Pending {
            return self.settle_interrupted(current, at);
        }
        let outcome = self.store.transition_run(
            run.id,
            RunState::Failed,
            TransitionDetail::failure(
                ErrorKind::SubmissionError,
                format!("submission failed after {attempts} attempts: {last_error}"),
            ),
            at,
        )?;
        self.notifier.publish(&outcome);
        Ok(DispatchOutcome::Failed(outcome.run))
    }

    async fn mark_running(
        &self,
        run: &FlowRun,
        backend: &dyn ExecutionBackend,
        handle: &str,
        at: DateTime<Utc>,
    ) -> DispatchResult<DispatchOutcome> {
        let detail = TransitionDetail {
            message: Some("submitted to backend".to_string()),
            failure: None,
            backend_handle: Some(handle.to_string()),
        };
        match self.store.transition_run(run.id, RunState::Running, detail, at) {
            Ok(outcome) => {
                info!(
                    run = %run.id,
                    deployment = %run.deployment_key,
                    pool = %run.pool_name,
                    handle,
                    "run submitted"
                );
                Ok(DispatchOutcome::Submitted(outcome.run))
            }
            Err(StateError::InvalidTransition { from, .. }) => {
                // Cancelled (or reaped) while the backend was accepting the job.
                self.store.set_backend_handle(run.id, handle)?;
                if let Err(e) = backend.cancel(handle).await {
                    warn!(run = %run.id, handle, error = %e, "cancel after late submission failed; potential orphaned resource");
                }
                if from == RunState::Cancelling {
                    let outcome = self.store.transition_run(
                        run.id,
                        RunState::Cancelled,
                        TransitionDetail::message("cancelled during submission"),
                        at,
                    )?;
                    self.notifier.publish(&outcome);
                    return Ok(DispatchOutcome::Cancelled(outcome.run));
                }
                Ok(DispatchOutcome::Skipped)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The run left `Pending` between attempts.
    fn settle_interrupted(&self, current: FlowRun, at: DateTime<Utc>) -> DispatchResult<DispatchOutcome> {
        if current.state == RunState::Cancelling {
            let outcome = self.store.transition_run(
                current.id,
                RunState::Cancelled,
                TransitionDetail::message("cancelled before submission"),
                at,
            )?;
            self.notifier.publish(&outcome);
            return Ok(DispatchOutcome::Cancelled(outcome.run));
        }
        debug!(run = %current.id, state = ?current.state, "run left pending during submission retries");
        Ok(DispatchOutcome::Skipped)
    }

    fn current(&self, run: &FlowRun) -> DispatchResult<FlowRun> {
        self.store
            .get_run(run.id)?
            .ok_or_else(|| StateError::NotFound(format!("flow run {}", run.id)).into())
    }

    /// Run the dispatch loop until shutdown.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            interval_ms = self.settings.loop_interval.as_millis() as u64,
            backends = ?self.backends.kinds(),
            "dispatcher started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.loop_interval) => {
                    match self.run_once(Utc::now()).await {
                        Ok(report) if report != DispatchReport::default() => {
                            info!(
                                submitted = report.submitted,
                                deferred = report.deferred,
                                rejected = report.rejected,
                                failed = report.failed,
                                "dispatch pass complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "dispatch pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("dispatcher shutting down");
                    break;
                }
            }
        }
    }
}
