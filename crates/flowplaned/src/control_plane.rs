//! Control plane assembly.
//!
//! Wires every component around one [`StateStore`]:
//! 1. Run intake, shared by the API, the schedule loop and the event binder
//! 2. Schedule service (producer loop)
//! 3. Work queues + capacity manager
//! 4. Dispatcher with the configured execution backends
//! 5. Run tracker (late marking, backend polling, liveness and cancellation reaping)
//! 6. Event binder fed by the `/events` endpoint

use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use flowplane_api::{ApiState, build_router};
use flowplane_core::ControlPlaneConfig;
use flowplane_dispatch::{BackendRegistry, DescriptorRetriever, DispatchSettings, Dispatcher, ProcessBackend};
use flowplane_queue::{CapacityManager, RunIntake, WorkQueues};
use flowplane_schedule::{ScheduleService, ScheduleSettings};
use flowplane_state::{RunNotifier, StateStore};
use flowplane_tracker::{RunTracker, TrackerSettings};
use flowplane_trigger::{Event, EventBinder};

/// Buffered events awaiting the binder.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Every subsystem of a single-process control plane.
pub struct ControlPlane {
    pub store: StateStore,
    pub notifier: RunNotifier,
    pub intake: RunIntake,
    pub schedules: ScheduleService,
    pub queues: WorkQueues,
    pub capacity: CapacityManager,
    pub dispatcher: Dispatcher,
    pub tracker: RunTracker,
    pub binder: EventBinder,
    events_tx: mpsc::Sender<Event>,
    events_rx: Option<mpsc::Receiver<Event>>,
}

impl ControlPlane {
    /// Assemble the control plane over an already opened store.
    pub fn new(store: StateStore, config: &ControlPlaneConfig, backends: BackendRegistry) -> Self {
        let notifier = RunNotifier::default();
        let intake = RunIntake::new(store.clone());
        let schedules = ScheduleService::new(
            store.clone(),
            intake.clone(),
            ScheduleSettings {
                loop_interval: config.scheduler.loop_interval,
                horizon: config.scheduler.horizon,
                max_scheduled_runs: config.scheduler.max_scheduled_runs,
                misfire_grace: config.scheduler.misfire_grace,
            },
        );
        let queues = WorkQueues::new(store.clone(), config.queue.starvation_threshold);
        let capacity = CapacityManager::new(store.clone(), config.capacity.global_limit());
        let retriever = Arc::new(DescriptorRetriever::default());
        let dispatcher = Dispatcher::new(
            store.clone(),
            capacity.clone(),
            queues.clone(),
            backends.clone(),
            retriever,
            notifier.clone(),
            DispatchSettings::from(&config.dispatcher),
        );
        let tracker = RunTracker::new(
            store.clone(),
            backends,
            notifier.clone(),
            TrackerSettings::from(&config.tracker),
        );
        let binder = EventBinder::new(store.clone(), intake.clone())
            .with_retry_backoff(config.dispatcher.retry_backoff, config.dispatcher.max_retry_backoff);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            store,
            notifier,
            intake,
            schedules,
            queues,
            capacity,
            dispatcher,
            tracker,
            binder,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Open the store under `data_dir` and assemble the control plane with
    /// the subprocess backend.
    pub fn open(config: &ControlPlaneConfig) -> anyhow::Result<Self> {
        let data_dir: &Path = &config.server.data_dir;
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("flowplane.redb");
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");

        let backends = BackendRegistry::new().with(Arc::new(ProcessBackend::new()));
        info!(backends = ?backends.kinds(), "execution backends registered");
        Ok(Self::new(store, config, backends))
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            store: self.store.clone(),
            intake: self.intake.clone(),
            schedules: self.schedules.clone(),
            queues: self.queues.clone(),
            capacity: self.capacity.clone(),
            tracker: self.tracker.clone(),
            events: self.events_tx.clone(),
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.api_state())
    }

    /// Start the schedule, dispatch, tracker and binder loops. They stop
    /// once `shutdown` flips to `true`.
    pub fn spawn_loops(&mut self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            tokio::spawn(self.schedules.clone().run(shutdown.clone())),
            tokio::spawn(self.dispatcher.clone().run(shutdown.clone())),
            tokio::spawn(self.tracker.clone().run(shutdown.clone())),
        ];
        match self.events_rx.take() {
            Some(rx) => handles.push(tokio::spawn(self.binder.clone().run(rx, shutdown))),
            None => warn!("event binder already started"),
        }
        handles
    }
}
