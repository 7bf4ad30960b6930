//! Domain types for the flowplane state store.
//!
//! These types represent the persisted state of deployments, schedules,
//! work pools and queues, pending run requests, and flow runs. All types
//! are serializable to/from JSON for storage in redb tables.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use flowplane_core::PullStep;

/// Name of the queue every work pool is created with.
pub const DEFAULT_QUEUE: &str = "default";

// ── Deployment ─────────────────────────────────────────────────────

/// A schedulable, triggerable binding of a flow to execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: Uuid,
    pub flow_name: String,
    /// Unique only within `flow_name`.
    pub name: String,
    /// `path/to/file.py:function` style reference to the flow entrypoint.
    pub entrypoint: String,
    /// Root the entrypoint path is relative to.
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Default parameters merged under every run's overrides.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub parameter_schema: Option<Value>,
    #[serde(default)]
    pub enforce_parameter_schema: bool,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub work_pool_name: String,
    #[serde(default = "default_queue_name")]
    pub work_queue_name: String,
    /// Deployment-level infrastructure overrides for the pool job template.
    #[serde(default)]
    pub job_variables: Map<String, Value>,
    #[serde(default)]
    pub pull_steps: Vec<PullStep>,
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
    #[serde(default)]
    pub paused: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Client-supplied fields for creating or updating a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentDraft {
    pub flow_name: String,
    pub name: String,
    pub entrypoint: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub parameter_schema: Option<Value>,
    #[serde(default)]
    pub enforce_parameter_schema: bool,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub work_pool_name: String,
    #[serde(default = "default_queue_name")]
    pub work_queue_name: String,
    #[serde(default)]
    pub job_variables: Map<String, Value>,
    #[serde(default)]
    pub pull_steps: Vec<PullStep>,
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
    #[serde(default)]
    pub paused: bool,
}

fn default_queue_name() -> String {
    DEFAULT_QUEUE.to_string()
}

/// Event-matching rule that creates one run per matching event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerSpec {
    /// Left nil by clients that do not name their triggers; the deployment
    /// then derives a stable id from the trigger's content.
    #[serde(default)]
    pub id: Uuid,
    /// Event name to match; a trailing `*` matches any suffix.
    pub expect: String,
    /// Resource labels that must all be present with equal values.
    #[serde(default)]
    pub match_resource: BTreeMap<String, String>,
    /// Parameter overrides; `"{{ event.<path> }}"` strings are filled from the event.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl TriggerSpec {
    /// Name-based id under the deployment's namespace. Identical matching
    /// rules on the same deployment always get the same id, so redeploying
    /// does not change the `{event_id}:{trigger_id}` dedup key.
    pub fn stable_id(&self, deployment_id: Uuid) -> Uuid {
        let material = serde_json::json!({
            "expect": self.expect,
            "match_resource": self.match_resource,
            "parameters": self.parameters,
        });
        Uuid::new_v5(&deployment_id, material.to_string().as_bytes())
    }
}

impl Deployment {
    /// Build the `{flow}/{deployment}` address.
    pub fn table_key(&self) -> String {
        deployment_key(&self.flow_name, &self.name)
    }

    /// Materialize a draft as a new deployment.
    pub fn from_draft(draft: DeploymentDraft, id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id,
            flow_name: draft.flow_name,
            name: draft.name,
            entrypoint: draft.entrypoint,
            working_dir: draft.working_dir,
            parameters: draft.parameters,
            parameter_schema: draft.parameter_schema,
            enforce_parameter_schema: draft.enforce_parameter_schema,
            version: draft.version,
            description: draft.description,
            tags: draft.tags,
            work_pool_name: draft.work_pool_name,
            work_queue_name: draft.work_queue_name,
            job_variables: draft.job_variables,
            pull_steps: draft.pull_steps,
            triggers: draft
                .triggers
                .into_iter()
                .map(|mut trigger| {
                    if trigger.id.is_nil() {
                        trigger.id = trigger.stable_id(id);
                    }
                    trigger
                })
                .collect(),
            paused: draft.paused,
            created_at: now,
            updated_at: now,
        }
    }
}

impl DeploymentDraft {
    pub fn table_key(&self) -> String {
        deployment_key(&self.flow_name, &self.name)
    }
}

/// Global address of a deployment: `{flow}/{deployment}`.
pub fn deployment_key(flow_name: &str, name: &str) -> String {
    format!("{flow_name}/{name}")
}

// ── Schedule ───────────────────────────────────────────────────────

/// Declarative schedule definition. Compiled by the schedule evaluator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleSpec {
    Cron {
        expression: String,
        /// IANA timezone the expression is evaluated in.
        #[serde(default = "utc_name")]
        timezone: String,
    },
    Interval {
        every_secs: u64,
        anchor: DateTime<Utc>,
    },
}

fn utc_name() -> String {
    "UTC".to_string()
}

/// A schedule attached to a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleRecord {
    pub id: Uuid,
    pub deployment_id: Uuid,
    pub spec: ScheduleSpec,
    /// Paused schedules produce nothing but keep their cursor.
    pub active: bool,
    /// Latest occurrence already turned into a run request.
    pub last_fired: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ── Work pools & queues ────────────────────────────────────────────

/// Named class of execution infrastructure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkPool {
    pub name: String,
    /// Backend adapter kind ("process", "kubernetes", ...).
    pub backend_kind: String,
    /// Max concurrent active runs across all of this pool's queues.
    #[serde(default)]
    pub concurrency_limit: Option<u32>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub job_template: JobTemplate,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Base job template: configuration with `{{ var }}` placeholders plus the
/// schema of variables that may fill them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobTemplate {
    #[serde(default = "empty_object")]
    pub job_configuration: Value,
    #[serde(default = "empty_variables")]
    pub variables: Value,
}

impl Default for JobTemplate {
    fn default() -> Self {
        Self {
            job_configuration: empty_object(),
            variables: empty_variables(),
        }
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn empty_variables() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// Ordered subdivision of a work pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkQueue {
    pub pool_name: String,
    pub name: String,
    /// Lower value drains first; 1 is the highest priority.
    pub priority: u32,
    #[serde(default)]
    pub concurrency_limit: Option<u32>,
    #[serde(default)]
    pub paused: bool,
    pub created_at: DateTime<Utc>,
}

impl WorkQueue {
    pub fn table_key(&self) -> String {
        queue_key(&self.pool_name, &self.name)
    }
}

pub fn queue_key(pool: &str, queue: &str) -> String {
    format!("{pool}/{queue}")
}

// ── Run requests ───────────────────────────────────────────────────

/// What produced a run request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOrigin {
    Schedule { schedule_id: Uuid },
    Trigger { trigger_id: Uuid, event_id: Uuid },
    Manual,
}

/// A pending request to run a deployment, consumed exactly once on admission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRequest {
    pub id: Uuid,
    pub flow_run_id: Uuid,
    pub deployment_id: Uuid,
    pub pool_name: String,
    pub queue_name: String,
    pub parameters: Map<String, Value>,
    pub job_variables: Map<String, Value>,
    /// Earliest time the request may be dispatched.
    pub scheduled_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// FIFO tiebreaker assigned by the store on enqueue.
    #[serde(default)]
    pub seq: u64,
    pub origin: RunOrigin,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl RunRequest {
    pub fn table_key(&self) -> String {
        format!("{}:{:020}", queue_key(&self.pool_name, &self.queue_name), self.seq)
    }
}

/// Result of an enqueue attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Enqueued(FlowRun),
    /// The idempotency key was already used; carries the existing run id.
    Duplicate(Uuid),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct IdempotencyRecord {
    pub flow_run_id: Uuid,
    pub recorded_at: DateTime<Utc>,
}

// ── Flow runs ──────────────────────────────────────────────────────

/// Lifecycle state of a flow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Scheduled,
    /// Scheduled time passed without the run being admitted.
    Late,
    Pending,
    Running,
    Cancelling,
    Completed,
    Failed,
    Crashed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Crashed | RunState::Cancelled
        )
    }

    /// Runs in these states have not been admitted yet.
    pub fn is_waiting(self) -> bool {
        matches!(self, RunState::Scheduled | RunState::Late)
    }

    /// Allowed edges of the run state machine.
    pub fn can_transition_to(self, to: RunState) -> bool {
        use RunState::*;
        match self {
            Scheduled => matches!(to, Late | Pending | Failed | Cancelled),
            Late => matches!(to, Pending | Failed | Cancelled),
            Pending => matches!(to, Running | Cancelling | Failed),
            Running => matches!(to, Completed | Failed | Crashed | Cancelling),
            Cancelling => matches!(to, Cancelled | Completed | Failed | Crashed),
            Completed | Failed | Crashed | Cancelled => false,
        }
    }
}

/// Error taxonomy surfaced to callers and recorded on failed runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigurationError,
    CapacityExhausted,
    SubmissionError,
    ExecutionFailure,
    LivenessTimeout,
    CancellationTimeout,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureInfo {
    pub kind: ErrorKind,
    pub message: String,
}

/// One entry of a run's state history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateRecord {
    pub state: RunState,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Terminal state of a child run, recorded on its parent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubflowOutcome {
    pub run_id: Uuid,
    pub state: RunState,
    pub at: DateTime<Utc>,
}

/// Durable record of one execution attempt of a run request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowRun {
    pub id: Uuid,
    pub deployment_id: Uuid,
    /// `{flow}/{deployment}` at creation time.
    pub deployment_key: String,
    pub request_id: Uuid,
    pub origin: RunOrigin,
    pub pool_name: String,
    pub queue_name: String,
    pub parameters: Map<String, Value>,
    pub job_variables: Map<String, Value>,
    pub state: RunState,
    pub history: Vec<StateRecord>,
    pub scheduled_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub state_entered_at: DateTime<Utc>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Whether this run currently counts against pool/queue/global capacity.
    #[serde(default)]
    pub holds_capacity: bool,
    /// Key of the still-queued request, cleared on admission.
    #[serde(default)]
    pub pending_key: Option<String>,
    #[serde(default)]
    pub backend_handle: Option<String>,
    #[serde(default)]
    pub submission_attempts: u32,
    #[serde(default)]
    pub failure: Option<FailureInfo>,
    #[serde(default)]
    pub parent_run_id: Option<Uuid>,
    #[serde(default)]
    pub linked_as_subflow: bool,
    #[serde(default)]
    pub subflow_states: Vec<SubflowOutcome>,
}

impl FlowRun {
    /// Create the `Scheduled` run that accompanies a new request.
    pub fn scheduled(
        request: &RunRequest,
        deployment_key: &str,
        parent_run_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: request.flow_run_id,
            deployment_id: request.deployment_id,
            deployment_key: deployment_key.to_string(),
            request_id: request.id,
            origin: request.origin.clone(),
            pool_name: request.pool_name.clone(),
            queue_name: request.queue_name.clone(),
            parameters: request.parameters.clone(),
            job_variables: request.job_variables.clone(),
            state: RunState::Scheduled,
            history: vec![StateRecord {
                state: RunState::Scheduled,
                at: now,
                message: None,
            }],
            scheduled_time: request.scheduled_time,
            created_at: now,
            state_entered_at: now,
            start_time: None,
            end_time: None,
            last_heartbeat: None,
            holds_capacity: false,
            pending_key: None,
            backend_handle: None,
            submission_attempts: 0,
            failure: None,
            parent_run_id,
            linked_as_subflow: parent_run_id.is_some(),
            subflow_states: Vec::new(),
        }
    }
}

/// Extra data recorded alongside a state transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionDetail {
    pub message: Option<String>,
    pub failure: Option<FailureInfo>,
    pub backend_handle: Option<String>,
}

impl TransitionDetail {
    pub fn message(msg: impl Into<String>) -> Self {
        Self {
            message: Some(msg.into()),
            ..Self::default()
        }
    }

    pub fn failure(kind: ErrorKind, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        Self {
            message: Some(msg.clone()),
            failure: Some(FailureInfo { kind, message: msg }),
            backend_handle: None,
        }
    }
}

/// What a transition did.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    pub run: FlowRun,
    pub previous: RunState,
    /// False when the run was already in the requested state.
    pub changed: bool,
    /// True when this transition gave back the run's capacity.
    pub released_capacity: bool,
}

/// Result of an admission attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmitOutcome {
    Admitted(Vec<FlowRun>),
    CapacityExhausted,
    /// A run was not in an admittable state (already claimed or cancelled).
    NotClaimable { run_id: Uuid, state: RunState },
    Paused,
}

/// Cascading effects of deleting a deployment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeletionReport {
    pub schedules_removed: u32,
    /// Not-yet-admitted runs that were cancelled with the deployment.
    pub runs_cancelled: Vec<FlowRun>,
}

/// Active-run counts for a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacitySnapshot {
    pub pool_active: u64,
    pub pool_limit: Option<u32>,
    pub queue_active: BTreeMap<String, u64>,
    pub global_active: u64,
}
