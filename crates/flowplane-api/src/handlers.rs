//! REST API handlers.
//!
//! Handlers validate the request shape, delegate to the owning component
//! (store, intake, schedule service, work queues, tracker) and wrap the
//! result in [`ApiResponse`]. Domain errors map to status codes through
//! [`ApiError`].

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use flowplane_queue::NewRun;
use flowplane_state::{
    DeploymentDraft, EnqueueOutcome, JobTemplate, RunOrigin, ScheduleSpec, WorkPool, WorkQueue,
};
use flowplane_tracker::ReportedOutcome;
use flowplane_trigger::Event;

use crate::ApiState;
use crate::response::{ApiError, ApiResponse};

const DEFAULT_PAGE_SIZE: usize = 200;

fn created_or_ok(created: bool) -> StatusCode {
    if created { StatusCode::CREATED } else { StatusCode::OK }
}

// ── Deployments ────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct Page {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

/// GET /api/v1/deployments
pub async fn list_deployments(State(state): State<ApiState>, Query(page): Query<Page>) -> Response {
    let offset = page.offset.unwrap_or(0);
    let limit = page.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    match state.store.list_deployments(offset, limit) {
        Ok(deployments) => ApiResponse::ok(deployments).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// GET /api/v1/deployments/{id}
pub async fn get_deployment(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    match state.store.get_deployment(id) {
        Ok(Some(deployment)) => ApiResponse::ok(deployment).into_response(),
        Ok(None) => ApiError::not_found("deployment not found").into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// A deployment must name a pool and queue that exist and carry well-formed
/// pull steps.
fn validate_draft(state: &ApiState, draft: &DeploymentDraft) -> Result<(), ApiError> {
    if draft.flow_name.trim().is_empty() || draft.name.trim().is_empty() {
        return Err(ApiError::invalid("flow_name and name are required"));
    }
    if draft.entrypoint.trim().is_empty() {
        return Err(ApiError::invalid("entrypoint is required"));
    }
    if state.store.get_pool(&draft.work_pool_name)?.is_none() {
        return Err(ApiError::invalid(format!("work pool {} does not exist", draft.work_pool_name)));
    }
    if state
        .store
        .get_queue(&draft.work_pool_name, &draft.work_queue_name)?
        .is_none()
    {
        return Err(ApiError::invalid(format!(
            "work queue {}/{} does not exist",
            draft.work_pool_name, draft.work_queue_name
        )));
    }
    for step in &draft.pull_steps {
        step.validate().map_err(|e| ApiError::invalid(e.to_string()))?;
    }
    if let Some(schema) = &draft.parameter_schema
        && !schema.is_object()
    {
        return Err(ApiError::invalid("parameter_schema must be a JSON object"));
    }
    Ok(())
}

/// POST /api/v1/deployments
///
/// Creating a deployment whose `{flow}/{name}` already exists updates it in
/// place: `201` for a new deployment, `200` for an update.
pub async fn create_deployment(State(state): State<ApiState>, Json(draft): Json<DeploymentDraft>) -> Response {
    if let Err(e) = validate_draft(&state, &draft) {
        return e.into_response();
    }
    match state.store.upsert_deployment(draft, Utc::now()) {
        Ok((deployment, created)) => (created_or_ok(created), ApiResponse::ok(deployment)).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// DELETE /api/v1/deployments/{id}
///
/// Schedules and not-yet-admitted runs go with the deployment; runs already
/// executing finish normally.
pub async fn delete_deployment(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    match state.tracker.delete_deployment(id, Utc::now()) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

fn set_deployment_paused(state: &ApiState, id: Uuid, paused: bool) -> Response {
    match state.store.set_deployment_paused(id, paused, Utc::now()) {
        Ok(Some(deployment)) => {
            info!(deployment = %deployment.table_key(), paused, "deployment pause flag set");
            ApiResponse::ok(deployment).into_response()
        }
        Ok(None) => ApiError::not_found("deployment not found").into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// POST /api/v1/deployments/{id}/pause
pub async fn pause_deployment(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    set_deployment_paused(&state, id, true)
}

/// POST /api/v1/deployments/{id}/resume
pub async fn resume_deployment(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    set_deployment_paused(&state, id, false)
}

// ── Schedules ──────────────────────────────────────────────────

/// Schedule creation body.
#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub schedule: ScheduleSpec,
    #[serde(default = "active_by_default")]
    pub active: bool,
}

fn active_by_default() -> bool {
    true
}

/// GET /api/v1/deployments/{id}/schedules
pub async fn list_schedules(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    match state.store.get_deployment(id) {
        Ok(Some(_)) => {}
        Ok(None) => return ApiError::not_found("deployment not found").into_response(),
        Err(e) => return ApiError::from(e).into_response(),
    }
    match state.store.list_schedules_for_deployment(id) {
        Ok(schedules) => ApiResponse::ok(schedules).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// POST /api/v1/deployments/{id}/schedules
pub async fn create_schedule(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CreateScheduleRequest>,
) -> Response {
    match state.schedules.create_schedule(id, req.schedule, req.active, Utc::now()) {
        Ok(record) => (StatusCode::CREATED, ApiResponse::ok(record)).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// DELETE /api/v1/schedules/{id}
pub async fn delete_schedule(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    match state.schedules.delete(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// POST /api/v1/schedules/{id}/pause
pub async fn pause_schedule(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    match state.schedules.pause(id, Utc::now()) {
        Ok(record) => ApiResponse::ok(record).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// POST /api/v1/schedules/{id}/resume
pub async fn resume_schedule(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    match state.schedules.resume(id, Utc::now()) {
        Ok(record) => ApiResponse::ok(record).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

// ── Flow runs ──────────────────────────────────────────────────

/// Manual run submission body. Every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct ManualRunRequest {
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub job_variables: Map<String, Value>,
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub parent_run_id: Option<Uuid>,
}

/// GET /api/v1/deployments/{id}/runs
pub async fn list_runs(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    match state.store.get_deployment(id) {
        Ok(Some(_)) => {}
        Ok(None) => return ApiError::not_found("deployment not found").into_response(),
        Err(e) => return ApiError::from(e).into_response(),
    }
    match state.store.list_runs_for_deployment(id) {
        Ok(runs) => ApiResponse::ok(runs).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// POST /api/v1/deployments/{id}/runs
///
/// `201` with the new run, or `200` with the run an earlier request under
/// the same idempotency key created.
pub async fn create_run(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ManualRunRequest>,
) -> Response {
    let new_run = NewRun {
        deployment_id: id,
        parameters: req.parameters,
        job_variables: req.job_variables,
        scheduled_time: req.scheduled_time,
        origin: RunOrigin::Manual,
        idempotency_key: req.idempotency_key,
        parent_run_id: req.parent_run_id,
    };
    match state.intake.submit(new_run, Utc::now()) {
        Ok(EnqueueOutcome::Enqueued(run)) => (StatusCode::CREATED, ApiResponse::ok(run)).into_response(),
        Ok(EnqueueOutcome::Duplicate(existing)) => match state.store.get_run(existing) {
            Ok(Some(run)) => ApiResponse::ok(run).into_response(),
            Ok(None) => ApiError::not_found("flow run not found").into_response(),
            Err(e) => ApiError::from(e).into_response(),
        },
        Err(e) => {
            warn!(deployment = %id, error = %e, "manual run rejected");
            ApiError::from(e).into_response()
        }
    }
}

/// GET /api/v1/runs/{id}
pub async fn get_run(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    match state.store.get_run(id) {
        Ok(Some(run)) => ApiResponse::ok(run).into_response(),
        Ok(None) => ApiError::not_found("flow run not found").into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// POST /api/v1/runs/{id}/cancel
///
/// Idempotent: a run that is already cancelling or finished is returned as is.
pub async fn cancel_run(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    match state.tracker.cancel(id, Utc::now()).await {
        Ok(run) => ApiResponse::ok(run).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// POST /api/v1/runs/{id}/heartbeat
pub async fn heartbeat_run(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    match state.tracker.heartbeat(id, Utc::now()) {
        Ok(run_state) => ApiResponse::ok(json!({ "run_id": id, "state": run_state })).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// POST /api/v1/runs/{id}/outcome
pub async fn report_outcome(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(outcome): Json<ReportedOutcome>,
) -> Response {
    match state.tracker.report_outcome(id, &outcome, Utc::now()) {
        Ok(result) => ApiResponse::ok(json!({ "run": result.run, "changed": result.changed })).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

// ── Work pools & queues ────────────────────────────────────────

/// Work pool creation body.
#[derive(Debug, Deserialize)]
pub struct CreatePoolRequest {
    pub name: String,
    pub backend_kind: String,
    #[serde(default)]
    pub concurrency_limit: Option<u32>,
    #[serde(default)]
    pub job_template: JobTemplate,
    #[serde(default)]
    pub description: Option<String>,
}

/// Pool and queue names are key segments and may not contain `/`.
fn validate_name(what: &str, name: &str) -> Result<(), ApiError> {
    if name.trim().is_empty() || name.contains('/') {
        return Err(ApiError::invalid(format!("invalid {what} name {name:?}")));
    }
    Ok(())
}

/// GET /api/v1/work_pools
pub async fn list_pools(State(state): State<ApiState>) -> Response {
    match state.store.list_pools() {
        Ok(pools) => ApiResponse::ok(pools).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// POST /api/v1/work_pools
///
/// Updating an existing pool keeps its pause flag and creation time.
pub async fn create_pool(State(state): State<ApiState>, Json(req): Json<CreatePoolRequest>) -> Response {
    if let Err(e) = validate_name("work pool", &req.name) {
        return e.into_response();
    }
    if !req.job_template.variables.is_object() || !req.job_template.job_configuration.is_object() {
        return ApiError::invalid("job_template.job_configuration and job_template.variables must be objects")
            .into_response();
    }
    let existing = match state.store.get_pool(&req.name) {
        Ok(existing) => existing,
        Err(e) => return ApiError::from(e).into_response(),
    };
    let pool = WorkPool {
        paused: existing.as_ref().is_some_and(|p| p.paused),
        created_at: existing.as_ref().map_or_else(Utc::now, |p| p.created_at),
        name: req.name,
        backend_kind: req.backend_kind,
        concurrency_limit: req.concurrency_limit,
        job_template: req.job_template,
        description: req.description,
    };
    match state.store.put_pool(&pool) {
        Ok(()) => (created_or_ok(existing.is_none()), ApiResponse::ok(pool)).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// GET /api/v1/work_pools/{name}
pub async fn get_pool(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.store.get_pool(&name) {
        Ok(Some(pool)) => ApiResponse::ok(pool).into_response(),
        Ok(None) => ApiError::not_found("work pool not found").into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// POST /api/v1/work_pools/{name}/pause
pub async fn pause_pool(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.queues.pause_pool(&name) {
        Ok(pool) => ApiResponse::ok(pool).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// POST /api/v1/work_pools/{name}/resume
pub async fn resume_pool(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.queues.resume_pool(&name) {
        Ok(pool) => ApiResponse::ok(pool).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// GET /api/v1/work_pools/{name}/capacity
pub async fn pool_capacity(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.store.get_pool(&name) {
        Ok(Some(_)) => {}
        Ok(None) => return ApiError::not_found("work pool not found").into_response(),
        Err(e) => return ApiError::from(e).into_response(),
    }
    match state.capacity.snapshot(&name) {
        Ok(snapshot) => ApiResponse::ok(json!({
            "pool": name,
            "snapshot": snapshot,
            "global_limit": state.capacity.global_limit(),
        }))
        .into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// Queue creation body. Priority 1 is the highest.
#[derive(Debug, Deserialize)]
pub struct CreateQueueRequest {
    pub name: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub concurrency_limit: Option<u32>,
}

fn default_priority() -> u32 {
    1
}

/// GET /api/v1/work_pools/{name}/queues
pub async fn list_queues(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.store.get_pool(&name) {
        Ok(Some(_)) => {}
        Ok(None) => return ApiError::not_found("work pool not found").into_response(),
        Err(e) => return ApiError::from(e).into_response(),
    }
    match state.store.list_queues(&name) {
        Ok(queues) => ApiResponse::ok(queues).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// POST /api/v1/work_pools/{name}/queues
pub async fn create_queue(
    State(state): State<ApiState>,
    Path(pool): Path<String>,
    Json(req): Json<CreateQueueRequest>,
) -> Response {
    if let Err(e) = validate_name("work queue", &req.name) {
        return e.into_response();
    }
    if req.priority == 0 {
        return ApiError::invalid("priority must be at least 1").into_response();
    }
    let existing = match state.store.get_queue(&pool, &req.name) {
        Ok(existing) => existing,
        Err(e) => return ApiError::from(e).into_response(),
    };
    let queue = WorkQueue {
        paused: existing.as_ref().is_some_and(|q| q.paused),
        created_at: existing.as_ref().map_or_else(Utc::now, |q| q.created_at),
        pool_name: pool,
        name: req.name,
        priority: req.priority,
        concurrency_limit: req.concurrency_limit,
    };
    match state.store.put_queue(&queue) {
        Ok(()) => (created_or_ok(existing.is_none()), ApiResponse::ok(queue)).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// POST /api/v1/work_pools/{name}/queues/{queue}/pause
pub async fn pause_queue(State(state): State<ApiState>, Path((pool, queue)): Path<(String, String)>) -> Response {
    match state.queues.pause_queue(&pool, &queue) {
        Ok(queue) => ApiResponse::ok(queue).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// POST /api/v1/work_pools/{name}/queues/{queue}/resume
pub async fn resume_queue(State(state): State<ApiState>, Path((pool, queue)): Path<(String, String)>) -> Response {
    match state.queues.resume_queue(&pool, &queue) {
        Ok(queue) => ApiResponse::ok(queue).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

// ── Events ─────────────────────────────────────────────────────

/// POST /api/v1/events
///
/// Accepted events are handed to the binder asynchronously (`202`).
pub async fn ingest_event(State(state): State<ApiState>, Json(event): Json<Event>) -> Response {
    if let Err(e) = event.validate() {
        return ApiError::from(e).into_response();
    }
    let event_id = event.id;
    match state.events.send(event).await {
        Ok(()) => (StatusCode::ACCEPTED, ApiResponse::ok(json!({ "event_id": event_id }))).into_response(),
        Err(_) => {
            warn!(event = %event_id, "event binder is not running");
            ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "event binder is not running").into_response()
        }
    }
}
