//! Code/config retrieval.
//!
//! A [`CodeRetriever`] turns a deployment's pull steps into the execution
//! environment a backend needs. Failures are configuration errors: they
//! are reported before any capacity is reserved and never retried.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use flowplane_state::Deployment;

use crate::error::{DispatchError, DispatchResult};

/// Where and how a run's code should be executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEnvironment {
    /// Directory the entrypoint is resolved against.
    pub working_dir: String,
    pub entrypoint: String,
    /// Human-readable pull steps the backend must perform, in order.
    pub steps: Vec<String>,
    /// Extra environment variables implied by the steps.
    pub env: BTreeMap<String, String>,
}

#[async_trait]
pub trait CodeRetriever: Send + Sync {
    async fn retrieve(&self, deployment: &Deployment) -> DispatchResult<ExecutionEnvironment>;
}

/// Resolves pull steps into a descriptor without fetching anything; the
/// backend performs the steps on the execution host.
#[derive(Debug, Clone)]
pub struct DescriptorRetriever {
    base_dir: String,
}

impl DescriptorRetriever {
    pub fn new(base_dir: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

impl Default for DescriptorRetriever {
    fn default() -> Self {
        Self::new("")
    }
}

#[async_trait]
impl CodeRetriever for DescriptorRetriever {
    async fn retrieve(&self, deployment: &Deployment) -> DispatchResult<ExecutionEnvironment> {
        let mut dir = deployment
            .working_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.clone());
        let mut steps = Vec::with_capacity(deployment.pull_steps.len());
        let mut env = BTreeMap::new();

        for step in &deployment.pull_steps {
            step.validate()
                .map_err(|e| DispatchError::Configuration(e.to_string()))?;
            if let flowplane_core::PullStep::GitClone {
                credentials_env: Some(var),
                ..
            } = step
            {
                if std::env::var_os(var).is_none() {
                    return Err(DispatchError::Configuration(format!(
                        "git credentials variable {var} is not set"
                    )));
                }
                env.insert("FLOWPLANE_GIT_CREDENTIALS_ENV".to_string(), var.clone());
            }
            dir = step
                .resulting_directory(&dir)
                .map_err(|e| DispatchError::Configuration(e.to_string()))?;
            steps.push(step.describe());
        }

        if deployment.entrypoint.trim().is_empty() {
            return Err(DispatchError::Configuration(format!(
                "deployment {} has no entrypoint",
                deployment.table_key()
            )));
        }

        debug!(deployment = %deployment.table_key(), working_dir = %dir, steps = steps.len(), "pull steps resolved");
        Ok(ExecutionEnvironment {
            working_dir: dir,
            entrypoint: deployment.entrypoint.clone(),
            steps,
            env,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flowplane_core::PullStep;
    use flowplane_state::DeploymentDraft;
    use serde_json::Map;
    use uuid::Uuid;

    fn deployment(steps: Vec<PullStep>) -> Deployment {
        let draft = DeploymentDraft {
            flow_name: "etl".to_string(),
            name: "daily".to_string(),
            entrypoint: "flows/etl.py:run".to_string(),
            working_dir: None,
            parameters: Map::new(),
            parameter_schema: None,
            enforce_parameter_schema: false,
            version: None,
            description: None,
            tags: vec![],
            work_pool_name: "pool".to_string(),
            work_queue_name: "default".to_string(),
            job_variables: Map::new(),
            pull_steps: steps,
            triggers: vec![],
            paused: false,
        };
        Deployment::from_draft(draft, Uuid::new_v4(), Utc::now())
    }

    #[tokio::test]
    async fn steps_are_resolved_in_order() {
        let retriever = DescriptorRetriever::new("/opt/flows");
        let env = retriever
            .retrieve(&deployment(vec![
                PullStep::GitClone {
                    repository: "https://github.com/acme/pipelines.git".to_string(),
                    branch: Some("main".to_string()),
                    credentials_env: None,
                },
                PullStep::SetWorkingDirectory {
                    directory: "etl".to_string(),
                },
            ]))
            .await
            .unwrap();
        assert_eq!(env.working_dir, "/opt/flows/pipelines-main/etl");
        assert_eq!(env.steps.len(), 2);
        assert_eq!(env.entrypoint, "flows/etl.py:run");
    }

    #[tokio::test]
    async fn invalid_step_is_a_configuration_error() {
        let retriever = DescriptorRetriever::default();
        let err = retriever
            .retrieve(&deployment(vec![PullStep::PullFromStorage {
                url: "ftp://example.com/bundle".to_string(),
                destination: None,
            }]))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Configuration(_)));
        assert_eq!(err.kind(), Some(flowplane_state::ErrorKind::ConfigurationError));
    }

    #[tokio::test]
    async fn missing_credentials_variable_is_rejected() {
        let retriever = DescriptorRetriever::default();
        let err = retriever
            .retrieve(&deployment(vec![PullStep::GitClone {
                repository: "https://github.com/acme/private.git".to_string(),
                branch: None,
                credentials_env: Some("FLOWPLANE_TEST_SURELY_UNSET_TOKEN".to_string()),
            }]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("FLOWPLANE_TEST_SURELY_UNSET_TOKEN"));
    }
}
