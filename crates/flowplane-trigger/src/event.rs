//! External events and trigger matching.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use flowplane_state::TriggerSpec;

use crate::error::{TriggerError, TriggerResult};

const EVENT_PLACEHOLDER: &str = r"\{\{\s*event\.([A-Za-z0-9_.\-]+)\s*\}\}";

/// An event delivered by the external event stream. Delivery is
/// at-least-once; `id` identifies redeliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    /// Dotted event name, e.g. `s3.object.created`.
    pub event: String,
    #[serde(default = "Utc::now")]
    pub occurred: DateTime<Utc>,
    /// Labels of the resource the event is about.
    #[serde(default)]
    pub resource: BTreeMap<String, String>,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    pub fn validate(&self) -> TriggerResult<()> {
        if self.event.trim().is_empty() {
            return Err(TriggerError::InvalidEvent("event name is empty".to_string()));
        }
        Ok(())
    }
}

/// Whether `trigger` fires for `event`.
///
/// `expect` matches the event name exactly, or as a prefix when it ends in
/// `*`. Every `match_resource` label must be present on the event with an
/// equal value; a `*` value only requires presence.
pub fn matches(trigger: &TriggerSpec, event: &Event) -> bool {
    if !trigger.enabled {
        return false;
    }
    let name_ok = match trigger.expect.strip_suffix('*') {
        Some(prefix) => event.event.starts_with(prefix),
        None => trigger.expect == event.event,
    };
    name_ok
        && trigger.match_resource.iter().all(|(label, expected)| {
            event
                .resource
                .get(label)
                .is_some_and(|actual| expected == "*" || actual == expected)
        })
}

/// Fill `"{{ event.<path> }}"` references in trigger parameters.
///
/// A string that is exactly one reference takes the referenced JSON value;
/// references inside longer strings are spliced in as text. Missing paths
/// render as `null` or an empty string.
pub fn render_parameters(parameters: &Map<String, Value>, event: &Event) -> TriggerResult<Map<String, Value>> {
    let re = Regex::new(EVENT_PLACEHOLDER).map_err(|e| TriggerError::InvalidEvent(e.to_string()))?;
    let context = serde_json::to_value(event).map_err(|e| TriggerError::InvalidEvent(e.to_string()))?;
    Ok(parameters
        .iter()
        .map(|(k, v)| (k.clone(), render(&re, v, &context)))
        .collect())
}

fn render(re: &Regex, value: &Value, context: &Value) -> Value {
    match value {
        Value::String(s) => {
            if let Some(caps) = re.captures(s)
                && caps.get(0).is_some_and(|m| m.start() == 0 && m.end() == s.len())
            {
                return lookup(context, &caps[1]).cloned().unwrap_or(Value::Null);
            }
            let rendered = re.replace_all(s, |caps: &regex::Captures<'_>| match lookup(context, &caps[1]) {
                Some(Value::String(v)) => v.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            });
            Value::String(rendered.into_owned())
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| render(re, v, context)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render(re, v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(context, |current, part| match current {
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => current.get(part),
    })
}
