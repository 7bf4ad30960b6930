//! Pull steps — declarative code/config retrieval instructions.
//!
//! A deployment lists the steps that must run before its entrypoint can
//! execute. The control plane only validates and describes them; actually
//! performing a clone or download is the job of a code-retrieval collaborator.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum PullStep {
    /// Change into an existing directory on the execution host.
    SetWorkingDirectory { directory: String },
    /// Clone a git repository; the checkout becomes the working directory.
    GitClone {
        repository: String,
        #[serde(default)]
        branch: Option<String>,
        /// Name of an environment variable holding an access token.
        #[serde(default)]
        credentials_env: Option<String>,
    },
    /// Download a bundle from object storage into `destination`.
    PullFromStorage {
        url: String,
        #[serde(default)]
        destination: Option<String>,
    },
}

/// Object-storage location referenced by a `pull_from_storage` step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StorageUri {
    /// s3://bucket/prefix
    S3 { bucket: String, prefix: String },
    /// gs://bucket/prefix
    Gcs { bucket: String, prefix: String },
    /// az://container/prefix
    Azure { container: String, prefix: String },
    /// https://host/path
    Https { url: String },
}

impl StorageUri {
    pub fn parse(uri: &str) -> CoreResult<Self> {
        let bucketed = |rest: &str| -> CoreResult<(String, String)> {
            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(CoreError::InvalidPullStep(format!("missing bucket in {uri}")));
            }
            Ok((bucket.to_string(), prefix.trim_end_matches('/').to_string()))
        };

        if let Some(rest) = uri.strip_prefix("s3://") {
            let (bucket, prefix) = bucketed(rest)?;
            Ok(StorageUri::S3 { bucket, prefix })
        } else if let Some(rest) = uri.strip_prefix("gs://") {
            let (bucket, prefix) = bucketed(rest)?;
            Ok(StorageUri::Gcs { bucket, prefix })
        } else if let Some(rest) = uri.strip_prefix("az://") {
            let (container, prefix) = bucketed(rest)?;
            Ok(StorageUri::Azure { container, prefix })
        } else if uri.starts_with("https://") {
            Ok(StorageUri::Https { url: uri.to_string() })
        } else {
            Err(CoreError::InvalidPullStep(format!(
                "unsupported storage scheme: {uri}"
            )))
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            StorageUri::S3 { .. } => "s3",
            StorageUri::Gcs { .. } => "gs",
            StorageUri::Azure { .. } => "az",
            StorageUri::Https { .. } => "https",
        }
    }

    /// Last path segment, used as the default download directory.
    fn basename(&self) -> &str {
        let path = match self {
            StorageUri::S3 { bucket, prefix } | StorageUri::Gcs { bucket, prefix } => {
                if prefix.is_empty() { bucket.as_str() } else { prefix.as_str() }
            }
            StorageUri::Azure { container, prefix } => {
                if prefix.is_empty() { container.as_str() } else { prefix.as_str() }
            }
            StorageUri::Https { url } => url.as_str(),
        };
        path.rsplit('/').find(|s| !s.is_empty()).unwrap_or(path)
    }
}

impl PullStep {
    /// Check the step is well-formed without touching the network.
    pub fn validate(&self) -> CoreResult<()> {
        match self {
            PullStep::SetWorkingDirectory { directory } => {
                if directory.trim().is_empty() {
                    return Err(CoreError::InvalidPullStep(
                        "set_working_directory requires a directory".to_string(),
                    ));
                }
            }
            PullStep::GitClone { repository, .. } => {
                let supported = ["https://", "http://", "git@", "ssh://", "git://"];
                if !supported.iter().any(|p| repository.starts_with(p)) {
                    return Err(CoreError::InvalidPullStep(format!(
                        "unsupported git repository url: {repository}"
                    )));
                }
            }
            PullStep::PullFromStorage { url, .. } => {
                StorageUri::parse(url)?;
            }
        }
        Ok(())
    }

    /// Directory the step leaves the process in, relative to `base`.
    pub fn resulting_directory(&self, base: &str) -> CoreResult<String> {
        match self {
            PullStep::SetWorkingDirectory { directory } => {
                if directory.starts_with('/') {
                    Ok(directory.clone())
                } else {
                    Ok(join(base, directory))
                }
            }
            PullStep::GitClone { repository, branch, .. } => {
                let name = repository
                    .trim_end_matches('/')
                    .trim_end_matches(".git")
                    .rsplit(['/', ':'])
                    .next()
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        CoreError::InvalidPullStep(format!("cannot derive checkout dir: {repository}"))
                    })?;
                let dir = match branch {
                    Some(b) => format!("{name}-{}", b.replace('/', "-")),
                    None => name.to_string(),
                };
                Ok(join(base, &dir))
            }
            PullStep::PullFromStorage { url, destination } => {
                let dir = match destination {
                    Some(d) => d.clone(),
                    None => StorageUri::parse(url)?.basename().to_string(),
                };
                Ok(join(base, &dir))
            }
        }
    }

    /// Short human-readable description for logs and environment descriptors.
    pub fn describe(&self) -> String {
        match self {
            PullStep::SetWorkingDirectory { directory } => format!("cd {directory}"),
            PullStep::GitClone { repository, branch, .. } => match branch {
                Some(b) => format!("git clone {repository}@{b}"),
                None => format!("git clone {repository}"),
            },
            PullStep::PullFromStorage { url, .. } => format!("pull {url}"),
        }
    }
}

fn join(base: &str, rel: &str) -> String {
    if base.is_empty() {
        rel.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), rel.trim_start_matches("./"))
    }
}
