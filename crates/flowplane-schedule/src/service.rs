//! Schedule service — schedule management and the producer loop that turns
//! due occurrences into run requests.
//!
//! Each tick creates runs for occurrences in `(last_fired, now + horizon]`,
//! at most `max_scheduled_runs` per schedule. Occurrences older than
//! `misfire_grace` (at least one loop interval) are skipped rather than
//! backfilled, and resuming a schedule or its deployment moves the cursor
//! to the resume time. Every occurrence is enqueued
//! under the idempotency key `{schedule_id}:{timestamp}`, so several
//! instances ticking the same schedule (or a tick retried after a crash
//! between enqueue and cursor update) never create the same run twice.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use flowplane_queue::{NewRun, RunIntake};
use flowplane_state::{EnqueueOutcome, RunOrigin, ScheduleRecord, ScheduleSpec, StateStore};

use crate::error::{ScheduleError, ScheduleResult};
use crate::evaluator::CompiledSchedule;

/// Days enqueue idempotency keys are kept beyond the lookahead horizon.
const IDEMPOTENCY_RETENTION_DAYS: i64 = 1;

/// Tunables for the producer loop.
#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub loop_interval: Duration,
    pub horizon: Duration,
    pub max_scheduled_runs: usize,
    pub misfire_grace: Duration,
}

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub runs_created: usize,
    pub duplicates: usize,
    pub failures: usize,
    /// Schedules whose missed occurrences fell outside the misfire grace.
    pub skipped: usize,
}

#[derive(Clone)]
pub struct ScheduleService {
    store: StateStore,
    intake: RunIntake,
    settings: ScheduleSettings,
}

impl ScheduleService {
    pub fn new(store: StateStore, intake: RunIntake, settings: ScheduleSettings) -> Self {
        Self {
            store,
            intake,
            settings,
        }
    }

    /// Attach a schedule to a deployment. Malformed expressions, unknown
    /// timezones and empty intervals are rejected here.
    pub fn create_schedule(
        &self,
        deployment_id: Uuid,
        spec: ScheduleSpec,
        active: bool,
        now: DateTime<Utc>,
    ) -> ScheduleResult<ScheduleRecord> {
        CompiledSchedule::compile(&spec)?;
        if self.store.get_deployment(deployment_id)?.is_none() {
            return Err(ScheduleError::DeploymentNotFound(deployment_id));
        }
        let record = ScheduleRecord {
            id: Uuid::new_v4(),
            deployment_id,
            spec,
            active,
            last_fired: None,
            created_at: now,
        };
        self.store.put_schedule(&record)?;
        info!(schedule = %record.id, deployment = %deployment_id, active, "schedule created");
        Ok(record)
    }

    /// Stop producing runs.
    pub fn pause(&self, id: Uuid, now: DateTime<Utc>) -> ScheduleResult<ScheduleRecord> {
        let record = self
            .store
            .set_schedule_active(id, false, now)?
            .ok_or(ScheduleError::ScheduleNotFound(id))?;
        info!(schedule = %id, "schedule paused");
        Ok(record)
    }

    /// Start producing runs again from `now`. Occurrences that fell inside
    /// the paused window are not created.
    pub fn resume(&self, id: Uuid, now: DateTime<Utc>) -> ScheduleResult<ScheduleRecord> {
        let record = self
            .store
            .set_schedule_active(id, true, now)?
            .ok_or(ScheduleError::ScheduleNotFound(id))?;
        info!(schedule = %id, "schedule resumed");
        Ok(record)
    }

    pub fn delete(&self, id: Uuid) -> ScheduleResult<()> {
        if !self.store.delete_schedule(id)? {
            return Err(ScheduleError::ScheduleNotFound(id));
        }
        info!(schedule = %id, "schedule deleted");
        Ok(())
    }

    /// Evaluate every active schedule once.
    pub fn tick(&self, now: DateTime<Utc>) -> ScheduleResult<TickReport> {
        let horizon = chrono::Duration::from_std(self.settings.horizon).unwrap_or(chrono::Duration::zero());
        let until = now + horizon;
        let grace = self.settings.misfire_grace.max(self.settings.loop_interval);
        let floor = now - chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::zero());
        let mut report = TickReport::default();

        for schedule in self.store.list_schedules()? {
            if !schedule.active {
                continue;
            }
            let Some(deployment) = self.store.get_deployment(schedule.deployment_id)? else {
                continue;
            };
            if deployment.paused {
                continue;
            }
            let compiled = match CompiledSchedule::compile(&schedule.spec) {
                Ok(c) => c,
                Err(e) => {
                    warn!(schedule = %schedule.id, error = %e, "stored schedule no longer compiles");
                    continue;
                }
            };

            let cursor = schedule.last_fired.unwrap_or(schedule.created_at);
            let after = if cursor < floor {
                if !compiled.occurrences_between(cursor, floor, 1).is_empty() {
                    warn!(
                        schedule = %schedule.id,
                        cursor = %cursor,
                        resume_from = %floor,
                        "skipping occurrences beyond misfire grace"
                    );
                    report.skipped += 1;
                }
                self.store.advance_schedule(schedule.id, floor)?;
                floor
            } else {
                cursor
            };
            let due = compiled.occurrences_between(after, until, self.settings.max_scheduled_runs);
            for at in due {
                let new_run = NewRun {
                    scheduled_time: Some(at),
                    origin: RunOrigin::Schedule {
                        schedule_id: schedule.id,
                    },
                    idempotency_key: Some(format!("{}:{}", schedule.id, at.timestamp())),
                    ..NewRun::manual(deployment.id)
                };
                match self.intake.submit(new_run, now) {
                    Ok(EnqueueOutcome::Enqueued(_)) => report.runs_created += 1,
                    Ok(EnqueueOutcome::Duplicate(_)) => report.duplicates += 1,
                    Err(e) => {
                        // Leave the cursor behind this occurrence so it is retried.
                        error!(schedule = %schedule.id, at = %at, error = %e, "failed to enqueue scheduled run");
                        report.failures += 1;
                        break;
                    }
                }
                self.store.advance_schedule(schedule.id, at)?;
            }
        }

        let pruned = self
            .store
            .prune_idempotency_keys(now - horizon - chrono::Duration::days(IDEMPOTENCY_RETENTION_DAYS))?;
        if report.runs_created > 0 || report.failures > 0 || report.skipped > 0 {
            info!(
                created = report.runs_created,
                duplicates = report.duplicates,
                failures = report.failures,
                skipped = report.skipped,
                pruned,
                "schedule tick complete"
            );
        } else {
            debug!(duplicates = report.duplicates, pruned, "schedule tick complete");
        }
        Ok(report)
    }

    /// Run the producer loop until shutdown.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            interval_secs = self.settings.loop_interval.as_secs(),
            horizon_secs = self.settings.horizon.as_secs(),
            "schedule service started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.loop_interval) => {
                    if let Err(e) = self.tick(Utc::now()) {
                        error!(error = %e, "schedule tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("schedule service shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use flowplane_state::{DeploymentDraft, JobTemplate, RunState, WorkPool, DEFAULT_QUEUE};
    use serde_json::Map;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn setup(horizon: Duration, max_runs: usize) -> (ScheduleService, StateStore, Uuid) {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_pool(&WorkPool {
                name: "pool".to_string(),
                backend_kind: "process".to_string(),
                concurrency_limit: None,
                paused: false,
                job_template: JobTemplate::default(),
                description: None,
                created_at: t0(),
            })
            .unwrap();
        let draft = DeploymentDraft {
            flow_name: "etl".to_string(),
            name: "minutely".to_string(),
            entrypoint: "etl.py:run".to_string(),
            working_dir: None,
            parameters: Map::new(),
            parameter_schema: None,
            enforce_parameter_schema: false,
            version: None,
            description: None,
            tags: vec![],
            work_pool_name: "pool".to_string(),
            work_queue_name: DEFAULT_QUEUE.to_string(),
            job_variables: Map::new(),
            pull_steps: vec![],
            triggers: vec![],
            paused: false,
        };
        let (deployment, _) = store.upsert_deployment(draft, t0()).unwrap();
        let service = ScheduleService::new(
            store.clone(),
            RunIntake::new(store.clone()),
            ScheduleSettings {
                loop_interval: Duration::from_secs(10),
                horizon,
                max_scheduled_runs: max_runs,
                misfire_grace: Duration::from_secs(3600),
            },
        );
        (service, store, deployment.id)
    }

    fn interval(every_secs: u64) -> ScheduleSpec {
        ScheduleSpec::Interval {
            every_secs,
            anchor: t0(),
        }
    }

    fn scheduled_times(store: &StateStore) -> Vec<DateTime<Utc>> {
        let mut times: Vec<_> = store
            .list_runs(&[])
            .unwrap()
            .into_iter()
            .map(|r| r.scheduled_time)
            .collect();
        times.sort();
        times
    }

    #[test]
    fn tick_creates_due_runs_once() {
        let (service, store, deployment) = setup(Duration::ZERO, 10);
        service.create_schedule(deployment, interval(60), true, t0()).unwrap();

        let report = service.tick(t0() + secs(125)).unwrap();
        assert_eq!(report.runs_created, 2);
        assert_eq!(scheduled_times(&store), vec![t0() + secs(60), t0() + secs(120)]);

        // Same instant again: nothing new.
        let report = service.tick(t0() + secs(125)).unwrap();
        assert_eq!(report, TickReport::default());

        let report = service.tick(t0() + secs(185)).unwrap();
        assert_eq!(report.runs_created, 1);
        assert_eq!(store.list_runs(&[RunState::Scheduled]).unwrap().len(), 3);
    }

    #[test]
    fn lookahead_is_bounded_by_horizon_and_max_runs() {
        let (service, store, deployment) = setup(Duration::from_secs(3600), 5);
        service.create_schedule(deployment, interval(60), true, t0()).unwrap();

        let report = service.tick(t0()).unwrap();
        assert_eq!(report.runs_created, 5);
        let times = scheduled_times(&store);
        assert_eq!(times.first(), Some(&(t0() + secs(60))));
        assert_eq!(times.last(), Some(&(t0() + secs(300))));
        // Future runs are not yet eligible for dispatch.
        assert!(times.iter().all(|t| *t > t0()));
    }

    #[test]
    fn paused_window_is_never_backfilled() {
        let (service, store, deployment) = setup(Duration::ZERO, 10);
        let schedule = service.create_schedule(deployment, interval(60), true, t0()).unwrap();
        service.tick(t0() + secs(60)).unwrap();

        service.pause(schedule.id, t0() + secs(60)).unwrap();
        assert_eq!(service.tick(t0() + secs(200)).unwrap().runs_created, 0);
        assert_eq!(
            store.get_schedule(schedule.id).unwrap().unwrap().last_fired,
            Some(t0() + secs(60))
        );

        let resumed_at = t0() + chrono::Duration::days(1);
        service.resume(schedule.id, resumed_at).unwrap();
        assert_eq!(service.tick(resumed_at).unwrap().runs_created, 0);
        assert_eq!(service.tick(resumed_at + secs(60)).unwrap().runs_created, 1);
        assert_eq!(service.tick(resumed_at + secs(90)).unwrap().runs_created, 0);
        assert_eq!(
            scheduled_times(&store),
            vec![t0() + secs(60), resumed_at + secs(60)]
        );
    }

    #[test]
    fn resumed_deployment_starts_from_resume_time() {
        let (service, store, deployment) = setup(Duration::ZERO, 10);
        service.create_schedule(deployment, interval(60), true, t0()).unwrap();
        store.set_deployment_paused(deployment, true, t0()).unwrap();
        assert_eq!(service.tick(t0() + secs(600)).unwrap().runs_created, 0);

        store.set_deployment_paused(deployment, false, t0() + secs(610)).unwrap();
        let report = service.tick(t0() + secs(660)).unwrap();
        assert_eq!(report.runs_created, 1);
        assert_eq!(scheduled_times(&store), vec![t0() + secs(660)]);
    }

    #[test]
    fn downtime_beyond_misfire_grace_is_skipped() {
        let (service, store, deployment) = setup(Duration::ZERO, 1000);
        service.create_schedule(deployment, interval(60), true, t0()).unwrap();

        let now = t0() + chrono::Duration::days(1);
        let report = service.tick(now).unwrap();
        assert_eq!(report.skipped, 1);
        // Only the last hour (the grace window) is caught up.
        assert_eq!(report.runs_created, 60);
        let times = scheduled_times(&store);
        assert!(times.iter().all(|t| *t > now - secs(3600)));
        assert_eq!(service.tick(now).unwrap().runs_created, 0);
    }

    #[test]
    fn duplicated_producers_are_deduplicated() {
        let (service, store, deployment) = setup(Duration::ZERO, 10);
        let schedule = service.create_schedule(deployment, interval(60), true, t0()).unwrap();
        let twin = service.clone();

        service.tick(t0() + secs(120)).unwrap();
        // A second instance that has not seen the cursor move re-evaluates
        // the same window.
        store.put_schedule(&schedule).unwrap();
        let report = twin.tick(t0() + secs(120)).unwrap();
        assert_eq!(report.runs_created, 0);
        assert_eq!(report.duplicates, 2);
        assert_eq!(store.list_runs(&[]).unwrap().len(), 2);
    }

    #[test]
    fn malformed_schedule_is_rejected_on_create() {
        let (service, store, deployment) = setup(Duration::ZERO, 10);
        let err = service
            .create_schedule(
                deployment,
                ScheduleSpec::Cron {
                    expression: "every tuesday".to_string(),
                    timezone: "UTC".to_string(),
                },
                true,
                t0(),
            )
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidCron { .. }));
        assert!(store.list_schedules().unwrap().is_empty());

        assert!(matches!(
            service.create_schedule(Uuid::new_v4(), interval(60), true, t0()),
            Err(ScheduleError::DeploymentNotFound(_))
        ));
    }

    #[test]
    fn paused_deployment_produces_nothing() {
        let (service, store, deployment) = setup(Duration::ZERO, 10);
        service.create_schedule(deployment, interval(60), true, t0()).unwrap();
        store.set_deployment_paused(deployment, true, t0()).unwrap();
        assert_eq!(service.tick(t0() + secs(600)).unwrap().runs_created, 0);
    }
}
