//! flowplane-state — embedded state store for the flowplane control plane.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for deployments, schedules, work pools and queues, pending run
//! requests, flow runs, and capacity counters.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{pool}/{queue}`, `{pool}/{queue}:{seq}`) enable prefix
//! scans for related records.
//!
//! Every operation that must be atomic (admitting a run and taking its
//! capacity, a terminal transition and giving it back, enqueueing under an
//! idempotency key) runs inside a single redb write transaction. redb admits
//! one writer at a time, so concurrent callers racing for the same run or
//! the last unit of capacity are serialized and exactly one wins.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod notify;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use notify::{RunNotification, RunNotifier};
pub use store::StateStore;
pub use types::*;
