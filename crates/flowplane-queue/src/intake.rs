//! Run intake — the single entry point through which schedules, triggers
//! and manual API calls turn into queued run requests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use flowplane_core::schema::declared_properties;
use flowplane_core::{JsonSchemaValidator, ParameterValidator, SchemaViolation};
use flowplane_state::{EnqueueOutcome, RunOrigin, RunRequest, StateStore};

use crate::error::{QueueError, QueueResult};

/// A request to run a deployment, before it has been resolved and queued.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub deployment_id: Uuid,
    /// Overrides merged over the deployment's default parameters.
    pub parameters: Map<String, Value>,
    /// Per-run infrastructure overrides.
    pub job_variables: Map<String, Value>,
    /// Defaults to "now".
    pub scheduled_time: Option<DateTime<Utc>>,
    pub origin: RunOrigin,
    /// Requests sharing a key produce at most one run.
    pub idempotency_key: Option<String>,
    pub parent_run_id: Option<Uuid>,
}

impl NewRun {
    pub fn manual(deployment_id: Uuid) -> Self {
        Self {
            deployment_id,
            parameters: Map::new(),
            job_variables: Map::new(),
            scheduled_time: None,
            origin: RunOrigin::Manual,
            idempotency_key: None,
            parent_run_id: None,
        }
    }
}

/// Resolves, validates and durably enqueues run requests.
#[derive(Clone)]
pub struct RunIntake {
    store: StateStore,
    validator: Arc<dyn ParameterValidator>,
}

impl RunIntake {
    pub fn new(store: StateStore) -> Self {
        Self::with_validator(store, Arc::new(JsonSchemaValidator))
    }

    pub fn with_validator(store: StateStore, validator: Arc<dyn ParameterValidator>) -> Self {
        Self { store, validator }
    }

    /// Validate and enqueue a run request.
    ///
    /// Parameters are checked against the deployment's schema when
    /// enforcement is on; job-variable overrides must be declared by the
    /// pool's job template. Rejections happen here, before anything is
    /// queued or any capacity is considered.
    pub fn submit(&self, new_run: NewRun, now: DateTime<Utc>) -> QueueResult<EnqueueOutcome> {
        let deployment = self
            .store
            .get_deployment(new_run.deployment_id)?
            .ok_or(QueueError::DeploymentNotFound(new_run.deployment_id))?;

        let mut parameters = deployment.parameters.clone();
        parameters.extend(new_run.parameters);
        if deployment.enforce_parameter_schema
            && let Some(schema) = &deployment.parameter_schema
        {
            self.validator
                .validate(schema, &parameters)
                .map_err(QueueError::InvalidParameters)?;
        }

        let pool = self
            .store
            .get_pool(&deployment.work_pool_name)?
            .ok_or_else(|| QueueError::PoolNotFound(deployment.work_pool_name.clone()))?;
        let unknown = unknown_variables(&pool.job_template.variables, &new_run.job_variables);
        if !unknown.is_empty() {
            return Err(QueueError::InvalidJobVariables(unknown));
        }

        let request = RunRequest {
            id: Uuid::new_v4(),
            flow_run_id: Uuid::new_v4(),
            deployment_id: deployment.id,
            pool_name: deployment.work_pool_name.clone(),
            queue_name: deployment.work_queue_name.clone(),
            parameters,
            job_variables: new_run.job_variables,
            scheduled_time: new_run.scheduled_time.unwrap_or(now),
            created_at: now,
            seq: 0,
            origin: new_run.origin,
            idempotency_key: new_run.idempotency_key,
        };

        let outcome = self
            .store
            .enqueue_run(request, &deployment.table_key(), new_run.parent_run_id, now)
            .map_err(|e| match e {
                flowplane_state::StateError::NotFound(what) => QueueError::QueueNotFound(what),
                other => QueueError::State(other),
            })?;
        match &outcome {
            EnqueueOutcome::Enqueued(run) => info!(
                run = %run.id,
                deployment = %run.deployment_key,
                scheduled_time = %run.scheduled_time,
                "run request accepted"
            ),
            EnqueueOutcome::Duplicate(existing) => {
                debug!(run = %existing, deployment = %deployment.id, "run request deduplicated")
            }
        }
        Ok(outcome)
    }
}

/// Override keys the template's variable schema does not declare.
pub fn unknown_variables(variables_schema: &Value, overrides: &Map<String, Value>) -> Vec<SchemaViolation> {
    let declared = declared_properties(variables_schema);
    overrides
        .keys()
        .filter(|key| !declared.contains(&key.as_str()))
        .map(|key| SchemaViolation {
            path: key.clone(),
            message: "not declared by the work pool job template".to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use flowplane_state::{DeploymentDraft, JobTemplate, WorkPool, DEFAULT_QUEUE};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn setup(enforce: bool) -> (StateStore, Uuid) {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_pool(&WorkPool {
                name: "k8s".to_string(),
                backend_kind: "process".to_string(),
                concurrency_limit: None,
                paused: false,
                job_template: JobTemplate {
                    job_configuration: json!({ "image": "{{ image }}" }),
                    variables: json!({
                        "type": "object",
                        "properties": { "image": { "type": "string" }, "memory": { "type": "string" } }
                    }),
                },
                description: None,
                created_at: t0(),
            })
            .unwrap();
        let draft = DeploymentDraft {
            flow_name: "etl".to_string(),
            name: "daily".to_string(),
            entrypoint: "flows/etl.py:run".to_string(),
            working_dir: None,
            parameters: json!({ "source": "s3://raw", "batch": 10 }).as_object().cloned().unwrap(),
            parameter_schema: Some(json!({
                "type": "object",
                "properties": { "source": { "type": "string" }, "batch": { "type": "integer" } }
            })),
            enforce_parameter_schema: enforce,
            version: None,
            description: None,
            tags: vec![],
            work_pool_name: "k8s".to_string(),
            work_queue_name: DEFAULT_QUEUE.to_string(),
            job_variables: Map::new(),
            pull_steps: vec![],
            triggers: vec![],
            paused: false,
        };
        let (deployment, _) = store.upsert_deployment(draft, t0()).unwrap();
        (store, deployment.id)
    }

    #[test]
    fn overrides_merge_over_defaults() {
        let (store, id) = setup(true);
        let intake = RunIntake::new(store);
        let mut new_run = NewRun::manual(id);
        new_run.parameters.insert("batch".to_string(), json!(50));

        let EnqueueOutcome::Enqueued(run) = intake.submit(new_run, t0()).unwrap() else {
            panic!("expected enqueue");
        };
        assert_eq!(run.parameters["batch"], json!(50));
        assert_eq!(run.parameters["source"], json!("s3://raw"));
        assert_eq!(run.scheduled_time, t0());
        assert_eq!(run.deployment_key, "etl/daily");
    }

    #[test]
    fn schema_violations_are_rejected_when_enforced() {
        let (store, id) = setup(true);
        let intake = RunIntake::new(store.clone());
        let mut new_run = NewRun::manual(id);
        new_run.parameters.insert("batch".to_string(), json!("many"));

        let err = intake.submit(new_run, t0()).unwrap_err();
        assert!(matches!(err, QueueError::InvalidParameters(_)));
        assert_eq!(err.kind(), Some(flowplane_state::ErrorKind::ConfigurationError));
        assert!(store.list_pending(None).unwrap().is_empty());
    }

    #[test]
    fn schema_is_ignored_without_enforcement() {
        let (store, id) = setup(false);
        let intake = RunIntake::new(store);
        let mut new_run = NewRun::manual(id);
        new_run.parameters.insert("batch".to_string(), json!("many"));
        assert!(intake.submit(new_run, t0()).is_ok());
    }

    #[test]
    fn undeclared_job_variable_is_a_configuration_error() {
        let (store, id) = setup(false);
        let intake = RunIntake::new(store.clone());
        let mut new_run = NewRun::manual(id);
        new_run.job_variables.insert("gpu".to_string(), json!(true));
        new_run.job_variables.insert("image".to_string(), json!("etl:2"));

        let err = intake.submit(new_run, t0()).unwrap_err();
        let QueueError::InvalidJobVariables(violations) = &err else {
            panic!("unexpected {err:?}");
        };
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].path, "gpu");
        assert!(store.list_pending(None).unwrap().is_empty());
        assert_eq!(store.active_count("k8s").unwrap(), 0);
    }

    #[test]
    fn unknown_deployment_is_not_found() {
        let (store, _) = setup(false);
        let intake = RunIntake::new(store);
        let err = intake.submit(NewRun::manual(Uuid::new_v4()), t0()).unwrap_err();
        assert!(matches!(err, QueueError::DeploymentNotFound(_)));
    }
}
