//! Terminal-state notifications.
//!
//! Whoever performs a transition hands the resulting [`TransitionOutcome`]
//! to [`RunNotifier::publish`]. Only transitions that actually changed the
//! run into a terminal state are published, and the store guarantees such a
//! transition happens once per run, so subscribers see each outcome once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{FailureInfo, RunState, TransitionOutcome};

/// A run reached a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunNotification {
    pub run_id: Uuid,
    pub deployment_id: Uuid,
    pub parent_run_id: Option<Uuid>,
    pub previous: RunState,
    pub state: RunState,
    pub at: DateTime<Utc>,
    pub failure: Option<FailureInfo>,
}

/// Broadcast fan-out of [`RunNotification`]s.
#[derive(Clone)]
pub struct RunNotifier {
    tx: broadcast::Sender<RunNotification>,
}

impl RunNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunNotification> {
        self.tx.subscribe()
    }

    /// Publish `outcome` if it is a fresh terminal transition. Returns
    /// whether a notification went out.
    pub fn publish(&self, outcome: &TransitionOutcome) -> bool {
        let run = &outcome.run;
        if !outcome.changed || !run.state.is_terminal() {
            return false;
        }
        let notification = RunNotification {
            run_id: run.id,
            deployment_id: run.deployment_id,
            parent_run_id: run.parent_run_id,
            previous: outcome.previous,
            state: run.state,
            at: run.state_entered_at,
            failure: run.failure.clone(),
        };
        match &run.failure {
            Some(failure) => warn!(
                run = %run.id,
                deployment = %run.deployment_key,
                state = ?run.state,
                kind = ?failure.kind,
                message = %failure.message,
                "run finished"
            ),
            None => info!(run = %run.id, deployment = %run.deployment_key, state = ?run.state, "run finished"),
        }
        // No subscribers is fine.
        let _ = self.tx.send(notification);
        true
    }
}

impl Default for RunNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}
