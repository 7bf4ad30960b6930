//! Event binder — the event-driven producer of run requests.
//!
//! Every enabled trigger of every unpaused deployment is checked against
//! each incoming event. A match is submitted through the same
//! [`RunIntake`] the schedule loop uses, under the idempotency key
//! `{event_id}:{trigger_id}`, so a redelivered event never creates a second
//! run for the same trigger. The same key makes retrying a delivery after a
//! storage failure safe, which [`EventBinder::deliver`] does until the event
//! is handled or the binder shuts down.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use flowplane_queue::{NewRun, QueueError, RunIntake};
use flowplane_state::{EnqueueOutcome, ErrorKind, RunOrigin, StateStore};

use crate::error::TriggerResult;
use crate::event::{matches, render_parameters, Event};

/// What one event produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindReport {
    /// Flow runs created for this delivery.
    pub created: Vec<Uuid>,
    /// Matches already turned into runs by an earlier delivery.
    pub duplicates: usize,
    /// Matches whose run request failed validation.
    pub rejected: usize,
}

pub fn idempotency_key(event_id: Uuid, trigger_id: Uuid) -> String {
    format!("{event_id}:{trigger_id}")
}

/// Errors that concern one deployment's setup rather than the delivery.
fn rejectable(e: &QueueError) -> bool {
    e.kind() == Some(ErrorKind::ConfigurationError)
        || matches!(
            e,
            QueueError::DeploymentNotFound(_) | QueueError::PoolNotFound(_) | QueueError::QueueNotFound(_)
        )
}

const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);
const DEFAULT_MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct EventBinder {
    store: StateStore,
    intake: RunIntake,
    retry_backoff: Duration,
    max_retry_backoff: Duration,
}

impl EventBinder {
    pub fn new(store: StateStore, intake: RunIntake) -> Self {
        Self {
            store,
            intake,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            max_retry_backoff: DEFAULT_MAX_RETRY_BACKOFF,
        }
    }

    /// Backoff between delivery attempts after a storage failure. Doubles
    /// per attempt up to `max`.
    pub fn with_retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_backoff = initial;
        self.max_retry_backoff = max.max(initial);
        self
    }

    /// Create one run request per matching trigger.
    ///
    /// Validation failures are logged and counted; storage failures are
    /// returned so the delivery can be retried without amplification.
    pub fn handle_event(&self, event: &Event, now: DateTime<Utc>) -> TriggerResult<BindReport> {
        event.validate()?;
        let mut report = BindReport::default();

        for deployment in self.store.list_deployments(0, usize::MAX)? {
            if deployment.paused {
                continue;
            }
            for trigger in deployment.triggers.iter().filter(|t| matches(t, event)) {
                let new_run = NewRun {
                    parameters: render_parameters(&trigger.parameters, event)?,
                    origin: RunOrigin::Trigger {
                        trigger_id: trigger.id,
                        event_id: event.id,
                    },
                    idempotency_key: Some(idempotency_key(event.id, trigger.id)),
                    ..NewRun::manual(deployment.id)
                };
                match self.intake.submit(new_run, now) {
                    Ok(EnqueueOutcome::Enqueued(run)) => report.created.push(run.id),
                    Ok(EnqueueOutcome::Duplicate(existing)) => {
                        debug!(event = %event.id, trigger = %trigger.id, run = %existing, "event already handled");
                        report.duplicates += 1;
                    }
                    Err(e) if rejectable(&e) => {
                        warn!(
                            event = %event.id,
                            trigger = %trigger.id,
                            deployment = %deployment.table_key(),
                            error = %e,
                            "triggered run rejected"
                        );
                        report.rejected += 1;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        if !report.created.is_empty() {
            info!(event = %event.id, name = %event.event, runs = report.created.len(), "event triggered runs");
        }
        Ok(report)
    }

    /// Handle one delivery, retrying storage failures with backoff until it
    /// succeeds or shutdown is signalled. Returns `None` if the event was
    /// dropped.
    pub async fn deliver(
        &self,
        event: &Event,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<BindReport> {
        self.retry_transient(event.id, shutdown, || self.handle_event(event, Utc::now()))
            .await
    }

    async fn retry_transient<F>(
        &self,
        event_id: Uuid,
        shutdown: &mut watch::Receiver<bool>,
        mut attempt: F,
    ) -> Option<BindReport>
    where
        F: FnMut() -> TriggerResult<BindReport>,
    {
        let mut backoff = self.retry_backoff;
        let mut attempts: u32 = 1;
        loop {
            let e = match attempt() {
                Ok(report) => return Some(report),
                Err(e) => e,
            };
            if !e.is_transient() {
                error!(event = %event_id, error = %e, "event dropped");
                return None;
            }
            warn!(
                event = %event_id,
                attempts,
                retry_in_ms = backoff.as_millis() as u64,
                error = %e,
                "event handling failed; retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => {
                    error!(event = %event_id, attempts, "shutting down before event was handled");
                    return None;
                }
            }
            backoff = backoff.saturating_mul(2).min(self.max_retry_backoff);
            attempts += 1;
        }
    }

    /// Consume events from `rx` until shutdown or the channel closes.
    pub async fn run(self, mut rx: mpsc::Receiver<Event>, mut shutdown: watch::Receiver<bool>) {
        info!("event binder started");
        loop {
            let event = tokio::select! {
                maybe_event = rx.recv() => match maybe_event {
                    Some(event) => event,
                    None => {
                        info!("event channel closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    info!("event binder shutting down");
                    break;
                }
            };
            self.deliver(&event, &mut shutdown).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TriggerError;
    use chrono::TimeZone;
    use flowplane_state::{DeploymentDraft, JobTemplate, RunState, StateError, TriggerSpec, WorkPool};
    use serde_json::{Map, json};
    use std::collections::BTreeMap;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn setup(parameter_schema: Option<serde_json::Value>, paused: bool) -> (StateStore, EventBinder, Uuid) {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_pool(&WorkPool {
                name: "default".to_string(),
                backend_kind: "process".to_string(),
                concurrency_limit: None,
                paused: false,
                job_template: JobTemplate::default(),
                description: None,
                created_at: t0(),
            })
            .unwrap();
        let trigger_id = Uuid::new_v4();
        store
            .upsert_deployment(draft(parameter_schema, paused, trigger_id), t0())
            .unwrap();
        let binder = EventBinder::new(store.clone(), RunIntake::new(store.clone()));
        (store, binder, trigger_id)
    }

    fn draft(parameter_schema: Option<serde_json::Value>, paused: bool, trigger_id: Uuid) -> DeploymentDraft {
        DeploymentDraft {
            flow_name: "ingest".to_string(),
            name: "on-upload".to_string(),
            entrypoint: "flows/ingest.py:run".to_string(),
            working_dir: None,
            parameters: Map::new(),
            enforce_parameter_schema: parameter_schema.is_some(),
            parameter_schema,
            version: None,
            description: None,
            tags: vec![],
            work_pool_name: "default".to_string(),
            work_queue_name: "default".to_string(),
            job_variables: Map::new(),
            pull_steps: vec![],
            triggers: vec![TriggerSpec {
                id: trigger_id,
                expect: "s3.object.*".to_string(),
                match_resource: BTreeMap::from([("bucket".to_string(), "raw".to_string())]),
                parameters: json!({ "key": "{{ event.payload.key }}" })
                    .as_object()
                    .cloned()
                    .unwrap(),
                enabled: true,
            }],
            paused,
        }
    }

    fn upload(key: &str) -> Event {
        Event {
            id: Uuid::new_v4(),
            event: "s3.object.created".to_string(),
            occurred: t0(),
            resource: BTreeMap::from([("bucket".to_string(), "raw".to_string())]),
            payload: json!({ "key": key }),
        }
    }

    #[test]
    fn matching_event_creates_one_run() {
        let (store, binder, trigger_id) = setup(None, false);
        let event = upload("a.csv");

        let report = binder.handle_event(&event, t0()).unwrap();
        assert_eq!(report.created.len(), 1);

        let run = store.get_run(report.created[0]).unwrap().unwrap();
        assert_eq!(run.state, RunState::Scheduled);
        assert_eq!(run.parameters["key"], json!("a.csv"));
        assert_eq!(
            run.origin,
            RunOrigin::Trigger {
                trigger_id,
                event_id: event.id
            }
        );
    }

    #[test]
    fn redelivery_is_not_amplified() {
        let (store, binder, _) = setup(None, false);
        let event = upload("a.csv");

        binder.handle_event(&event, t0()).unwrap();
        let again = binder.handle_event(&event, t0()).unwrap();
        assert!(again.created.is_empty());
        assert_eq!(again.duplicates, 1);
        assert_eq!(store.list_pending(None).unwrap().len(), 1);

        // A different event is a different run.
        binder.handle_event(&upload("b.csv"), t0()).unwrap();
        assert_eq!(store.list_pending(None).unwrap().len(), 2);
    }

    #[test]
    fn replay_after_redeploy_is_not_amplified() {
        let (store, binder, _) = setup(None, false);
        let mut unnamed = draft(None, false, Uuid::nil());
        store.upsert_deployment(unnamed.clone(), t0()).unwrap();
        let event = upload("a.csv");
        assert_eq!(binder.handle_event(&event, t0()).unwrap().created.len(), 1);

        unnamed.version = Some("2".to_string());
        store.upsert_deployment(unnamed, t0()).unwrap();
        let replay = binder.handle_event(&event, t0()).unwrap();
        assert!(replay.created.is_empty());
        assert_eq!(replay.duplicates, 1);
        assert_eq!(store.list_pending(None).unwrap().len(), 1);
    }

    #[test]
    fn non_matching_and_paused_produce_nothing() {
        let (_, binder, _) = setup(None, false);
        let mut other = upload("a.csv");
        other.resource.insert("bucket".to_string(), "curated".to_string());
        assert_eq!(binder.handle_event(&other, t0()).unwrap(), BindReport::default());

        let (_, paused_binder, _) = setup(None, true);
        assert_eq!(paused_binder.handle_event(&upload("a.csv"), t0()).unwrap(), BindReport::default());
    }

    #[test]
    fn schema_violations_are_counted_not_fatal() {
        let schema = json!({
            "type": "object",
            "properties": { "key": { "type": "string", "pattern": "\\.parquet$" } }
        });
        let (store, binder, _) = setup(Some(schema), false);
        let report = binder.handle_event(&upload("a.csv"), t0()).unwrap();
        assert_eq!(report.rejected, 1);
        assert!(store.list_pending(None).unwrap().is_empty());
    }

    fn locked() -> TriggerError {
        TriggerError::State(StateError::Transaction("database is locked".to_string()))
    }

    #[tokio::test]
    async fn storage_failure_is_retried_until_handled() {
        let (store, binder, _) = setup(None, false);
        let binder = binder.with_retry_backoff(Duration::from_millis(1), Duration::from_millis(4));
        let (_tx, mut shutdown) = watch::channel(false);
        let event = upload("a.csv");

        let mut failures = 3;
        let report = binder
            .retry_transient(event.id, &mut shutdown, || {
                if failures > 0 {
                    failures -= 1;
                    return Err(locked());
                }
                binder.handle_event(&event, t0())
            })
            .await
            .unwrap();
        assert_eq!(failures, 0);
        assert_eq!(report.created.len(), 1);
        assert_eq!(store.list_pending(None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retry_after_partial_write_creates_no_duplicate() {
        let (store, binder, _) = setup(None, false);
        let binder = binder.with_retry_backoff(Duration::from_millis(1), Duration::from_millis(4));
        let (_tx, mut shutdown) = watch::channel(false);
        let event = upload("a.csv");

        // The first attempt enqueues the run, then the delivery fails.
        let mut attempts = 0;
        let report = binder
            .retry_transient(event.id, &mut shutdown, || {
                attempts += 1;
                let report = binder.handle_event(&event, t0())?;
                if attempts == 1 {
                    return Err(locked());
                }
                Ok(report)
            })
            .await
            .unwrap();
        assert_eq!(attempts, 2);
        assert!(report.created.is_empty());
        assert_eq!(report.duplicates, 1);
        assert_eq!(store.list_pending(None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_event_is_not_retried() {
        let (store, binder, _) = setup(None, false);
        let (_tx, mut shutdown) = watch::channel(false);
        let mut event = upload("a.csv");
        event.event = String::new();

        assert!(binder.deliver(&event, &mut shutdown).await.is_none());
        assert!(store.list_pending(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_interrupts_retries() {
        let (_, binder, _) = setup(None, false);
        let binder = binder.with_retry_backoff(Duration::from_secs(60), Duration::from_secs(60));
        let (tx, mut shutdown) = watch::channel(false);
        let event = upload("a.csv");

        tx.send(true).unwrap();
        let result = binder.retry_transient(event.id, &mut shutdown, || Err(locked())).await;
        assert!(result.is_none());
    }
}
