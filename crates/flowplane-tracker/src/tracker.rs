//! Run tracker — the authority on flow run lifecycles once they leave the
//! queue.
//!
//! Heartbeats and backend reports move runs forward; the reaper infers the
//! outcomes nobody reported (lost heartbeats, cancellations the backend
//! never confirmed, submissions abandoned mid-flight). Every terminal
//! transition goes through [`StateStore::transition_run`], which releases
//! capacity exactly once, and is then published on the [`RunNotifier`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use flowplane_core::config::TrackerConfig;
use flowplane_dispatch::{BackendRegistry, BackendStatus, ExecutionBackend};
use flowplane_state::{
    DeletionReport, ErrorKind, FlowRun, RunNotifier, RunState, StateError, StateStore,
    TransitionDetail, TransitionOutcome,
};

use crate::error::{TrackerError, TrackerResult};

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub heartbeat_timeout: Duration,
    /// A `Scheduled` run this far past its scheduled time becomes `Late`.
    pub late_after: Duration,
    pub cancellation_grace: Duration,
    pub poll_interval: Duration,
}

impl From<&TrackerConfig> for TrackerSettings {
    fn from(config: &TrackerConfig) -> Self {
        Self {
            heartbeat_timeout: config.heartbeat_timeout,
            late_after: config.late_after,
            cancellation_grace: config.cancellation_grace,
            poll_interval: config.poll_interval,
        }
    }
}

/// A terminal outcome reported by (or on behalf of) a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReportedOutcome {
    Completed,
    Failed { message: String },
    Crashed { message: String },
    Cancelled,
}

impl ReportedOutcome {
    fn target(&self) -> (RunState, TransitionDetail) {
        match self {
            ReportedOutcome::Completed => (RunState::Completed, TransitionDetail::message("completed")),
            ReportedOutcome::Failed { message } => (
                RunState::Failed,
                TransitionDetail::failure(ErrorKind::ExecutionFailure, message.clone()),
            ),
            ReportedOutcome::Crashed { message } => (
                RunState::Crashed,
                TransitionDetail::failure(ErrorKind::ExecutionFailure, message.clone()),
            ),
            ReportedOutcome::Cancelled => (RunState::Cancelled, TransitionDetail::message("cancelled")),
        }
    }

    fn from_status(status: &BackendStatus) -> Option<Self> {
        match status {
            BackendStatus::Completed => Some(ReportedOutcome::Completed),
            BackendStatus::Failed { message } => Some(ReportedOutcome::Failed {
                message: message.clone(),
            }),
            BackendStatus::Crashed { message } => Some(ReportedOutcome::Crashed {
                message: message.clone(),
            }),
            BackendStatus::Cancelled => Some(ReportedOutcome::Cancelled),
            BackendStatus::Pending | BackendStatus::Running | BackendStatus::Unknown => None,
        }
    }
}

/// What one reaper pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Running runs whose heartbeat expired.
    pub crashed: usize,
    /// Cancelling runs the backend never confirmed.
    pub cancelled: usize,
    /// Pending runs whose submission never completed.
    pub abandoned: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub polled: usize,
    pub reconciled: usize,
}

#[derive(Clone)]
pub struct RunTracker {
    store: StateStore,
    backends: BackendRegistry,
    notifier: RunNotifier,
    settings: TrackerSettings,
}

impl RunTracker {
    pub fn new(
        store: StateStore,
        backends: BackendRegistry,
        notifier: RunNotifier,
        settings: TrackerSettings,
    ) -> Self {
        Self {
            store,
            backends,
            notifier,
            settings,
        }
    }

    pub fn notifier(&self) -> &RunNotifier {
        &self.notifier
    }

    fn get_run(&self, run_id: Uuid) -> TrackerResult<FlowRun> {
        self.store
            .get_run(run_id)?
            .ok_or(TrackerError::RunNotFound(run_id))
    }

    fn transition(
        &self,
        run_id: Uuid,
        to: RunState,
        detail: TransitionDetail,
        now: DateTime<Utc>,
    ) -> TrackerResult<TransitionOutcome> {
        let outcome = self
            .store
            .transition_run(run_id, to, detail, now)
            .map_err(|e| match e {
                StateError::NotFound(_) => TrackerError::RunNotFound(run_id),
                other => other.into(),
            })?;
        self.notifier.publish(&outcome);
        Ok(outcome)
    }

    fn backend_for(&self, run: &FlowRun) -> TrackerResult<std::sync::Arc<dyn ExecutionBackend>> {
        let pool = self.store.get_pool(&run.pool_name)?.ok_or_else(|| {
            flowplane_dispatch::DispatchError::Configuration(format!(
                "work pool {} no longer exists",
                run.pool_name
            ))
        })?;
        Ok(self.backends.get(&pool.backend_kind)?)
    }

    // ── Liveness ───────────────────────────────────────────────────

    /// Refresh a run's liveness timestamp.
    pub fn heartbeat(&self, run_id: Uuid, now: DateTime<Utc>) -> TrackerResult<RunState> {
        let (state, accepted) = self.store.record_heartbeat(run_id, now).map_err(|e| match e {
            StateError::NotFound(_) => TrackerError::RunNotFound(run_id),
            other => other.into(),
        })?;
        if !accepted {
            return Err(TrackerError::NotRunning { run_id, state });
        }
        debug!(run = %run_id, "heartbeat recorded");
        Ok(state)
    }

    // ── Cancellation ───────────────────────────────────────────────

    /// Request cancellation. Idempotent: cancelling a run that is already
    /// `Cancelling` or finished returns it unchanged.
    ///
    /// Runs that were never admitted are cancelled outright. Admitted runs
    /// move to `Cancelling` and the backend is asked to stop the job; the
    /// run finishes when the backend confirms or the grace period expires.
    pub async fn cancel(&self, run_id: Uuid, now: DateTime<Utc>) -> TrackerResult<FlowRun> {
        // A concurrent transition can invalidate the state we read; retry
        // against the fresh state a bounded number of times.
        for _ in 0..3 {
            let run = self.get_run(run_id)?;
            let target = match run.state {
                RunState::Cancelling => return Ok(run),
                s if s.is_terminal() => return Ok(run),
                s if s.is_waiting() => RunState::Cancelled,
                _ => RunState::Cancelling,
            };
            let detail = TransitionDetail::message("cancellation requested");
            let outcome = match self.transition(run_id, target, detail, now) {
                Ok(outcome) => outcome,
                Err(TrackerError::State(StateError::InvalidTransition { .. })) => continue,
                Err(e) => return Err(e),
            };
            info!(run = %run_id, from = ?outcome.previous, to = ?target, "cancellation requested");

            if target == RunState::Cancelling
                && let Some(handle) = outcome.run.backend_handle.as_deref()
            {
                match self.backend_for(&outcome.run) {
                    Ok(backend) => {
                        if let Err(e) = backend.cancel(handle).await {
                            warn!(run = %run_id, handle, error = %e, "backend cancel failed; waiting for grace period");
                        }
                    }
                    Err(e) => warn!(run = %run_id, error = %e, "no backend to cancel run"),
                }
            }
            return Ok(outcome.run);
        }
        self.get_run(run_id)
    }

    // ── Outcomes ───────────────────────────────────────────────────

    /// Record a terminal outcome reported for a run. Reports for runs that
    /// already finished are ignored (`changed = false`).
    pub fn report_outcome(
        &self,
        run_id: Uuid,
        reported: &ReportedOutcome,
        now: DateTime<Utc>,
    ) -> TrackerResult<TransitionOutcome> {
        let run = self.get_run(run_id)?;
        if run.state.is_terminal() {
            debug!(run = %run_id, state = ?run.state, ?reported, "outcome for finished run ignored");
            return Ok(TransitionOutcome {
                previous: run.state,
                run,
                changed: false,
                released_capacity: false,
            });
        }
        let (to, detail) = reported.target();
        self.transition(run_id, to, detail, now)
    }

    /// Poll the backend of every submitted, unfinished run. A job the
    /// backend still runs counts as a heartbeat; a finished one is
    /// reconciled. A failure for one run is logged and the pass continues.
    pub async fn poll_backends(&self, now: DateTime<Utc>) -> TrackerResult<PollReport> {
        let mut report = PollReport::default();
        for run in self.store.list_runs(&[RunState::Running, RunState::Cancelling])? {
            let Some(handle) = run.backend_handle.as_deref() else {
                continue;
            };
            let backend = match self.backend_for(&run) {
                Ok(backend) => backend,
                Err(e) => {
                    warn!(run = %run.id, error = %e, "cannot poll run");
                    continue;
                }
            };
            report.polled += 1;
            match self.poll_run(&run, backend.as_ref(), handle, now).await {
                Ok(true) => report.reconciled += 1,
                Ok(false) => {}
                Err(e) => warn!(run = %run.id, handle, error = %e, "polling run failed"),
            }
        }
        Ok(report)
    }

    /// Poll one job and apply what the backend says. Returns whether the
    /// run reached a terminal state.
    async fn poll_run(
        &self,
        run: &FlowRun,
        backend: &dyn ExecutionBackend,
        handle: &str,
        now: DateTime<Utc>,
    ) -> TrackerResult<bool> {
        let status = backend.poll(handle).await?;
        match ReportedOutcome::from_status(&status) {
            Some(outcome) => Ok(self.report_outcome(run.id, &outcome, now)?.changed),
            None if status == BackendStatus::Running => {
                self.store.record_heartbeat(run.id, now)?;
                Ok(false)
            }
            None => {
                debug!(run = %run.id, handle, ?status, "backend status not conclusive");
                Ok(false)
            }
        }
    }

    // ── Timeouts ───────────────────────────────────────────────────

    /// Mark `Scheduled` runs whose time has passed by more than `late_after`.
    pub fn mark_late(&self, now: DateTime<Utc>) -> TrackerResult<usize> {
        let late_after = to_chrono(self.settings.late_after);
        let mut marked = 0;
        for run in self.store.list_runs(&[RunState::Scheduled])? {
            if run.scheduled_time + late_after >= now {
                continue;
            }
            match self.transition(run.id, RunState::Late, TransitionDetail::message("not admitted in time"), now) {
                Ok(_) => marked += 1,
                Err(TrackerError::State(StateError::InvalidTransition { .. })) => {}
                Err(e) => return Err(e),
            }
        }
        if marked > 0 {
            info!(marked, "runs marked late");
        }
        Ok(marked)
    }

    /// Infer outcomes for runs that went silent.
    pub fn reap_expired(&self, now: DateTime<Utc>) -> TrackerResult<ReapReport> {
        let heartbeat_timeout = to_chrono(self.settings.heartbeat_timeout);
        let grace = to_chrono(self.settings.cancellation_grace);
        let mut report = ReapReport::default();

        for run in self
            .store
            .list_runs(&[RunState::Running, RunState::Cancelling, RunState::Pending])?
        {
            let (to, detail) = match run.state {
                RunState::Running => {
                    let last_seen = run.last_heartbeat.unwrap_or(run.state_entered_at);
                    if last_seen + heartbeat_timeout >= now {
                        continue;
                    }
                    warn!(
                        run = %run.id,
                        deployment = %run.deployment_key,
                        last_heartbeat = %last_seen,
                        "heartbeat lost; marking run crashed"
                    );
                    (
                        RunState::Crashed,
                        TransitionDetail::failure(
                            ErrorKind::LivenessTimeout,
                            format!("no heartbeat since {last_seen}"),
                        ),
                    )
                }
                RunState::Cancelling => {
                    if run.state_entered_at + grace >= now {
                        continue;
                    }
                    warn!(
                        run = %run.id,
                        deployment = %run.deployment_key,
                        handle = run.backend_handle.as_deref().unwrap_or("-"),
                        "cancellation not confirmed; potential orphaned resource"
                    );
                    (
                        RunState::Cancelled,
                        TransitionDetail::failure(
                            ErrorKind::CancellationTimeout,
                            "backend did not confirm cancellation",
                        ),
                    )
                }
                _ => {
                    if run.state_entered_at + heartbeat_timeout >= now {
                        continue;
                    }
                    warn!(run = %run.id, attempts = run.submission_attempts, "submission abandoned");
                    (
                        RunState::Failed,
                        TransitionDetail::failure(ErrorKind::SubmissionError, "dispatch abandoned"),
                    )
                }
            };
            let from = run.state;
            match self.transition(run.id, to, detail, now) {
                Ok(outcome) if outcome.changed => match from {
                    RunState::Running => report.crashed += 1,
                    RunState::Cancelling => report.cancelled += 1,
                    _ => report.abandoned += 1,
                },
                Ok(_) => {}
                // Raced with a reported outcome; nothing left to infer.
                Err(TrackerError::State(StateError::InvalidTransition { .. })) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Delete a deployment, cancelling the runs it had not started yet.
    pub fn delete_deployment(&self, deployment_id: Uuid, now: DateTime<Utc>) -> TrackerResult<DeletionReport> {
        let report = self
            .store
            .delete_deployment(deployment_id, now)?
            .ok_or(TrackerError::DeploymentNotFound(deployment_id))?;
        for run in &report.runs_cancelled {
            let previous = run
                .history
                .iter()
                .rev()
                .nth(1)
                .map(|r| r.state)
                .unwrap_or(RunState::Scheduled);
            self.notifier.publish(&TransitionOutcome {
                run: run.clone(),
                previous,
                changed: true,
                released_capacity: false,
            });
        }
        info!(
            deployment = %deployment_id,
            schedules = report.schedules_removed,
            runs_cancelled = report.runs_cancelled.len(),
            "deployment deleted"
        );
        Ok(report)
    }

    // ── Loop ───────────────────────────────────────────────────────

    /// One maintenance pass: late marking, backend polling, reaping.
    pub async fn tick(&self, now: DateTime<Utc>) -> TrackerResult<()> {
        self.mark_late(now)?;
        let polled = self.poll_backends(now).await?;
        let reaped = self.reap_expired(now)?;
        if polled.reconciled > 0 || reaped != ReapReport::default() {
            info!(
                reconciled = polled.reconciled,
                crashed = reaped.crashed,
                cancelled = reaped.cancelled,
                abandoned = reaped.abandoned,
                "tracker pass complete"
            );
        }
        Ok(())
    }

    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            heartbeat_timeout_secs = self.settings.heartbeat_timeout.as_secs(),
            poll_interval_secs = self.settings.poll_interval.as_secs(),
            "run tracker started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "tracker pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("run tracker shutting down");
                    break;
                }
            }
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
