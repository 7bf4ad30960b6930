//! flowplane-core — shared building blocks for the flowplane control plane.
//!
//! - [`config`]: the `flowplane.toml` daemon configuration
//! - [`duration`]: `"30s"` / `"5m"` style duration strings
//! - [`schema`]: validation of parameter and job-variable mappings
//! - [`pull`]: code-retrieval step descriptors attached to deployments

pub mod config;
pub mod duration;
pub mod error;
pub mod pull;
pub mod schema;

pub use config::ControlPlaneConfig;
pub use error::{CoreError, CoreResult};
pub use pull::PullStep;
pub use schema::{JsonSchemaValidator, ParameterValidator, SchemaViolation};
