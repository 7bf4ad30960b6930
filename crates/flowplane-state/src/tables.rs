//! redb table definitions for the flowplane state store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Composite keys follow `{pool}/{queue}` or `{pool}/{queue}:{seq}`
//! so a prefix scan returns one queue's backlog in FIFO order.

use redb::TableDefinition;

/// Deployments keyed by id.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// `{flow}/{deployment}` → deployment id (name uniqueness index).
pub const DEPLOYMENT_NAMES: TableDefinition<&str, &str> = TableDefinition::new("deployment_names");

/// Schedules keyed by id.
pub const SCHEDULES: TableDefinition<&str, &[u8]> = TableDefinition::new("schedules");

/// Work pools keyed by name.
pub const POOLS: TableDefinition<&str, &[u8]> = TableDefinition::new("work_pools");

/// Work queues keyed by `{pool}/{queue}`.
pub const QUEUES: TableDefinition<&str, &[u8]> = TableDefinition::new("work_queues");

/// Pending run requests keyed by `{pool}/{queue}:{seq:020}`.
pub const PENDING: TableDefinition<&str, &[u8]> = TableDefinition::new("pending_requests");

/// Flow runs keyed by id.
pub const RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("flow_runs");

/// Active-run counters: `pool:{name}`, `queue:{pool}/{queue}`, `global`.
pub const CAPACITY: TableDefinition<&str, u64> = TableDefinition::new("capacity");

/// Idempotency keys → the flow run they produced.
pub const IDEMPOTENCY: TableDefinition<&str, &[u8]> = TableDefinition::new("idempotency_keys");

/// Monotonic counters (`pending_seq`).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
