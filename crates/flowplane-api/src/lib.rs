//! flowplane-api — REST API for flowplane.
//!
//! Provides axum route handlers for managing deployments, schedules, flow
//! runs, work pools and queues, and for ingesting external events.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/deployments` | List deployments (`?offset=&limit=`) |
//! | POST | `/api/v1/deployments` | Create or update a deployment |
//! | GET | `/api/v1/deployments/{id}` | Get deployment details |
//! | DELETE | `/api/v1/deployments/{id}` | Delete a deployment |
//! | POST | `/api/v1/deployments/{id}/pause` | Stop producing runs |
//! | POST | `/api/v1/deployments/{id}/resume` | Resume producing runs |
//! | GET | `/api/v1/deployments/{id}/schedules` | List schedules |
//! | POST | `/api/v1/deployments/{id}/schedules` | Attach a schedule |
//! | GET | `/api/v1/deployments/{id}/runs` | List flow runs |
//! | POST | `/api/v1/deployments/{id}/runs` | Submit a manual run |
//! | DELETE | `/api/v1/schedules/{id}` | Delete a schedule |
//! | POST | `/api/v1/schedules/{id}/pause` | Pause a schedule |
//! | POST | `/api/v1/schedules/{id}/resume` | Resume a schedule |
//! | GET | `/api/v1/runs/{id}` | Get a flow run |
//! | POST | `/api/v1/runs/{id}/cancel` | Request cancellation |
//! | POST | `/api/v1/runs/{id}/heartbeat` | Record a liveness signal |
//! | POST | `/api/v1/runs/{id}/outcome` | Report a terminal outcome |
//! | GET | `/api/v1/work_pools` | List work pools |
//! | POST | `/api/v1/work_pools` | Create or update a work pool |
//! | GET | `/api/v1/work_pools/{name}` | Get a work pool |
//! | POST | `/api/v1/work_pools/{name}/pause` | Pause a pool |
//! | POST | `/api/v1/work_pools/{name}/resume` | Resume a pool |
//! | GET | `/api/v1/work_pools/{name}/capacity` | Active-run counts |
//! | GET | `/api/v1/work_pools/{name}/queues` | List queues |
//! | POST | `/api/v1/work_pools/{name}/queues` | Create or update a queue |
//! | POST | `/api/v1/work_pools/{name}/queues/{queue}/pause` | Pause a queue |
//! | POST | `/api/v1/work_pools/{name}/queues/{queue}/resume` | Resume a queue |
//! | POST | `/api/v1/events` | Ingest an external event |

pub mod handlers;
pub mod response;

use axum::Router;
use axum::routing::{get, post};
use tokio::sync::mpsc;

use flowplane_queue::{CapacityManager, RunIntake, WorkQueues};
use flowplane_schedule::ScheduleService;
use flowplane_state::StateStore;
use flowplane_tracker::RunTracker;
use flowplane_trigger::Event;

pub use response::{ApiError, ApiResponse};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub intake: RunIntake,
    pub schedules: ScheduleService,
    pub queues: WorkQueues,
    pub capacity: CapacityManager,
    pub tracker: RunTracker,
    /// Feeds the event binder.
    pub events: mpsc::Sender<Event>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/deployments", get(handlers::list_deployments).post(handlers::create_deployment))
        .route("/deployments/{id}", get(handlers::get_deployment).delete(handlers::delete_deployment))
        .route("/deployments/{id}/pause", post(handlers::pause_deployment))
        .route("/deployments/{id}/resume", post(handlers::resume_deployment))
        .route(
            "/deployments/{id}/schedules",
            get(handlers::list_schedules).post(handlers::create_schedule),
        )
        .route("/deployments/{id}/runs", get(handlers::list_runs).post(handlers::create_run))
        .route("/schedules/{id}", axum::routing::delete(handlers::delete_schedule))
        .route("/schedules/{id}/pause", post(handlers::pause_schedule))
        .route("/schedules/{id}/resume", post(handlers::resume_schedule))
        .route("/runs/{id}", get(handlers::get_run))
        .route("/runs/{id}/cancel", post(handlers::cancel_run))
        .route("/runs/{id}/heartbeat", post(handlers::heartbeat_run))
        .route("/runs/{id}/outcome", post(handlers::report_outcome))
        .route("/work_pools", get(handlers::list_pools).post(handlers::create_pool))
        .route("/work_pools/{name}", get(handlers::get_pool))
        .route("/work_pools/{name}/pause", post(handlers::pause_pool))
        .route("/work_pools/{name}/resume", post(handlers::resume_pool))
        .route("/work_pools/{name}/capacity", get(handlers::pool_capacity))
        .route("/work_pools/{name}/queues", get(handlers::list_queues).post(handlers::create_queue))
        .route("/work_pools/{name}/queues/{queue}/pause", post(handlers::pause_queue))
        .route("/work_pools/{name}/queues/{queue}/resume", post(handlers::resume_queue))
        .route("/events", post(handlers::ingest_event))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
