//! flowplane-trigger — event-driven run creation.
//!
//! ```text
//! event stream ──▶ mpsc::Sender<Event> ──▶ EventBinder::run
//!                                             │ match triggers, render params
//!                                             ▼
//!                                        RunIntake::submit  (key = event:trigger)
//! ```

pub mod binder;
pub mod error;
pub mod event;

pub use binder::{BindReport, EventBinder};
pub use error::{TriggerError, TriggerResult};
pub use event::Event;
