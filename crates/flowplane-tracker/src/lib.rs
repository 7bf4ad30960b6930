//! flowplane-tracker — authoritative lifecycle tracking for flow runs.
//!
//! The [`RunTracker`] accepts heartbeats, cancellation requests and
//! reported outcomes, and runs the maintenance pass that marks late runs,
//! polls backends, and infers crashes and cancellation timeouts.

pub mod error;
pub mod tracker;

pub use error::{TrackerError, TrackerResult};
pub use tracker::{PollReport, ReapReport, ReportedOutcome, RunTracker, TrackerSettings};
