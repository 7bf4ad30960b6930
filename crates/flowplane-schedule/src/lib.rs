//! flowplane-schedule — schedule evaluation and the schedule producer.
//!
//! - [`cron`]: five-field cron expressions evaluated in an IANA timezone
//! - [`evaluator`]: [`CompiledSchedule`], cursor-based occurrence computation
//!   for cron and fixed-interval schedules
//! - [`service`]: schedule management plus the loop that enqueues due
//!   occurrences through [`flowplane_queue::RunIntake`]

pub mod cron;
pub mod error;
pub mod evaluator;
pub mod service;

pub use cron::CronExpr;
pub use error::{ScheduleError, ScheduleResult};
pub use evaluator::CompiledSchedule;
pub use service::{ScheduleService, ScheduleSettings, TickReport};
