//! Execution backend adapters.
//!
//! An [`ExecutionBackend`] accepts rendered job specs and reports on the jobs
//! it started. Backends are addressed by the work pool's `backend_kind`
//! through a [`BackendRegistry`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{DispatchError, DispatchResult};
use crate::retrieval::ExecutionEnvironment;

/// Everything a backend needs to start one flow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub run_id: Uuid,
    /// `{flow}/{deployment}`.
    pub deployment_key: String,
    pub backend_kind: String,
    /// Pool job template with all variables rendered.
    pub configuration: Value,
    pub environment: ExecutionEnvironment,
    pub parameters: Map<String, Value>,
}

/// What a backend reports about a previously submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStatus {
    Pending,
    Running,
    Completed,
    Failed { message: String },
    /// The job disappeared or died without reporting an outcome.
    Crashed { message: String },
    Cancelled,
    /// The backend has no record of the handle.
    Unknown,
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Pool `backend_kind` this adapter serves.
    fn kind(&self) -> &str;

    /// Start the job and return an opaque handle for later calls.
    async fn submit(&self, job: &JobSpec) -> DispatchResult<String>;

    async fn poll(&self, handle: &str) -> DispatchResult<BackendStatus>;

    /// Request the job stop. Must be safe to call more than once.
    async fn cancel(&self, handle: &str) -> DispatchResult<()>;
}

/// Backends keyed by kind.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn ExecutionBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn ExecutionBackend>) {
        self.backends.insert(backend.kind().to_string(), backend);
    }

    pub fn with(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.register(backend);
        self
    }

    pub fn get(&self, kind: &str) -> DispatchResult<Arc<dyn ExecutionBackend>> {
        self.backends
            .get(kind)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownBackend(kind.to_string()))
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// In-memory backend for tests.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::{BackendStatus, ExecutionBackend, JobSpec};
    use crate::error::{DispatchError, DispatchResult};

    #[derive(Default)]
    struct Inner {
        submitted: Vec<JobSpec>,
        statuses: HashMap<String, BackendStatus>,
        cancelled: Vec<String>,
        fail_next: u32,
        cancel_fails: bool,
        failing_polls: Vec<String>,
        next_handle: u64,
    }

    /// Records every call and lets tests script what the "infrastructure" does.
    pub struct FakeBackend {
        kind: String,
        inner: Mutex<Inner>,
    }

    impl FakeBackend {
        pub fn new(kind: impl Into<String>) -> Self {
            Self {
                kind: kind.into(),
                inner: Mutex::new(Inner::default()),
            }
        }

        /// Make the next `n` submissions fail.
        pub async fn fail_submissions(&self, n: u32) {
            self.inner.lock().await.fail_next = n;
        }

        pub async fn fail_cancellations(&self, fail: bool) {
            self.inner.lock().await.cancel_fails = fail;
        }

        /// Make every poll of `handle` fail.
        pub async fn fail_polls(&self, handle: &str) {
            self.inner.lock().await.failing_polls.push(handle.to_string());
        }

        pub async fn set_status(&self, handle: &str, status: BackendStatus) {
            self.inner
                .lock()
                .await
                .statuses
                .insert(handle.to_string(), status);
        }

        pub async fn submitted(&self) -> Vec<JobSpec> {
            self.inner.lock().await.submitted.clone()
        }

        pub async fn cancelled(&self) -> Vec<String> {
            self.inner.lock().await.cancelled.clone()
        }
    }

    #[async_trait]
    impl ExecutionBackend for FakeBackend {
        fn kind(&self) -> &str {
            &self.kind
        }

        async fn submit(&self, job: &JobSpec) -> DispatchResult<String> {
            let mut inner = self.inner.lock().await;
            if inner.fail_next > 0 {
                inner.fail_next -= 1;
                return Err(DispatchError::Submission(
                    "fake backend rejected job".to_string(),
                ));
            }
            inner.next_handle += 1;
            let handle = format!("fake-{}", inner.next_handle);
            inner.submitted.push(job.clone());
            inner
                .statuses
                .insert(handle.clone(), BackendStatus::Running);
            Ok(handle)
        }

        async fn poll(&self, handle: &str) -> DispatchResult<BackendStatus> {
            let inner = self.inner.lock().await;
            if inner.failing_polls.iter().any(|h| h == handle) {
                return Err(DispatchError::Backend(format!(
                    "fake backend lost track of {handle}"
                )));
            }
            Ok(inner
                .statuses
                .get(handle)
                .cloned()
                .unwrap_or(BackendStatus::Unknown))
        }

        async fn cancel(&self, handle: &str) -> DispatchResult<()> {
            let mut inner = self.inner.lock().await;
            if inner.cancel_fails {
                return Err(DispatchError::Backend(format!(
                    "fake backend could not cancel {handle}"
                )));
            }
            inner.cancelled.push(handle.to_string());
            inner
                .statuses
                .insert(handle.to_string(), BackendStatus::Cancelled);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeBackend;
    use super::*;

    #[test]
    fn unknown_kind_is_a_configuration_error() {
        let registry = BackendRegistry::new().with(Arc::new(FakeBackend::new("process")));
        assert!(registry.get("process").is_ok());
        let err = registry.get("kubernetes").err().unwrap();
        assert_eq!(err.kind(), Some(flowplane_state::ErrorKind::ConfigurationError));
        assert_eq!(registry.kinds(), vec!["process"]);
    }
}
