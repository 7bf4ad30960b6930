//! Job spec rendering.
//!
//! A pool's job template is a JSON document with `{{ name }}` placeholders.
//! Values come from, lowest precedence first: the variable schema's
//! defaults, the deployment's job variables, the run's job variables, and a
//! handful of built-ins describing the run.

use regex::Regex;
use serde_json::{Map, Value};

use flowplane_core::schema::{ParameterValidator, property_defaults};
use flowplane_core::JsonSchemaValidator;
use flowplane_queue::intake::unknown_variables;
use flowplane_state::{Deployment, FlowRun, WorkPool};

use crate::backend::JobSpec;
use crate::error::{DispatchError, DispatchResult};
use crate::retrieval::ExecutionEnvironment;

const PLACEHOLDER: &str = r"\{\{\s*([A-Za-z_][A-Za-z0-9_.]*)\s*\}\}";

/// Merge the job variables that apply to `run` and check them against the
/// pool's variable schema.
pub fn resolve_variables(
    pool: &WorkPool,
    deployment: &Deployment,
    run: &FlowRun,
) -> DispatchResult<Map<String, Value>> {
    let schema = &pool.job_template.variables;
    let mut unknown = unknown_variables(schema, &deployment.job_variables);
    unknown.extend(unknown_variables(schema, &run.job_variables));
    if !unknown.is_empty() {
        return Err(DispatchError::Configuration(join_violations(&unknown)));
    }

    let mut merged = property_defaults(schema);
    for (k, v) in deployment.job_variables.iter().chain(run.job_variables.iter()) {
        merged.insert(k.clone(), v.clone());
    }

    JsonSchemaValidator
        .validate(schema, &merged)
        .map_err(|violations| DispatchError::Configuration(join_violations(&violations)))?;
    Ok(merged)
}

/// Build the job spec for one admitted run.
pub fn build_job_spec(
    pool: &WorkPool,
    deployment: &Deployment,
    run: &FlowRun,
    environment: ExecutionEnvironment,
) -> DispatchResult<JobSpec> {
    let mut variables = resolve_variables(pool, deployment, run)?;
    let builtins = [
        ("flow_run_id", Value::String(run.id.to_string())),
        ("deployment_name", Value::String(deployment.table_key())),
        ("entrypoint", Value::String(environment.entrypoint.clone())),
        ("working_dir", Value::String(environment.working_dir.clone())),
    ];
    for (name, value) in builtins {
        variables.entry(name).or_insert(value);
    }

    let re = Regex::new(PLACEHOLDER).map_err(|e| DispatchError::Configuration(e.to_string()))?;
    let configuration = render(&re, &pool.job_template.job_configuration, &variables);

    Ok(JobSpec {
        run_id: run.id,
        deployment_key: deployment.table_key(),
        backend_kind: pool.backend_kind.clone(),
        configuration,
        environment,
        parameters: run.parameters.clone(),
    })
}

/// Substitute placeholders throughout `template`.
///
/// A string that is exactly one placeholder takes the variable's JSON value
/// as-is; placeholders embedded in longer strings are spliced in as text.
/// Unset variables render as `null` or an empty string respectively.
pub fn render(re: &Regex, template: &Value, variables: &Map<String, Value>) -> Value {
    match template {
        Value::String(s) => render_string(re, s, variables),
        Value::Array(items) => Value::Array(items.iter().map(|v| render(re, v, variables)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render(re, v, variables)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn render_string(re: &Regex, s: &str, variables: &Map<String, Value>) -> Value {
    if let Some(caps) = re.captures(s)
        && caps.get(0).is_some_and(|m| m.start() == 0 && m.end() == s.len())
    {
        return lookup(variables, &caps[1]).cloned().unwrap_or(Value::Null);
    }
    let rendered = re.replace_all(s, |caps: &regex::Captures<'_>| match lookup(variables, &caps[1]) {
        Some(Value::String(v)) => v.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    });
    Value::String(rendered.into_owned())
}

fn lookup<'a>(variables: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = variables.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

fn join_violations(violations: &[flowplane_core::SchemaViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
