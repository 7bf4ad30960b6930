//! flowplane-queue — run intake, work queue ordering and capacity admission.
//!
//! ```text
//! schedules / triggers / API
//!        │  NewRun
//!        ▼
//!   RunIntake ── validate params + job variables ──▶ StateStore (pending)
//!                                                        │
//!   WorkQueues::peek_eligible ◀──────────────────────────┘
//!        │  ordered RunRequests
//!        ▼
//!   CapacityManager::try_admit ── atomic claim + reserve ──▶ Pending run
//! ```

pub mod capacity;
pub mod error;
pub mod intake;
pub mod queue;

pub use capacity::CapacityManager;
pub use error::{QueueError, QueueResult};
pub use intake::{NewRun, RunIntake};
pub use queue::WorkQueues;
