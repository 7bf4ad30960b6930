//! flowplane-dispatch — turns admitted runs into jobs on execution
//! infrastructure.
//!
//! - [`retrieval`]: resolves a deployment's pull steps into an execution environment
//! - [`job`]: renders the pool job template with merged job variables
//! - [`backend`]: the [`ExecutionBackend`] seam and registry
//! - [`process`]: a local subprocess backend
//! - [`dispatcher`]: the admission + submission loop

pub mod backend;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod process;
pub mod retrieval;

pub use backend::{BackendRegistry, BackendStatus, ExecutionBackend, JobSpec};
pub use dispatcher::{DispatchOutcome, DispatchReport, DispatchSettings, Dispatcher};
pub use error::{DispatchError, DispatchResult};
pub use process::ProcessBackend;
pub use retrieval::{CodeRetriever, DescriptorRetriever, ExecutionEnvironment};
