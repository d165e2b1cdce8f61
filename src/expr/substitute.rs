//! Template Substitution
//!
//! Expands `${path}` references. A default may follow a pipe:
//! `${vars.branch | "main"}`. A backslash escapes a reference: `\${literal}`.
//!
//! Supported paths:
//! - `vars.<name>[.field...]`
//! - `steps.<id>.<output|data|pane|duration|status|agent>[.field...]`
//! - `steps.<group>.<sub>.<field>` through a parallel group's aggregate
//! - `env.<NAME>`, `loop.<field>`
//! - `session`, `run_id`, `timestamp`, `workflow`

use std::env;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;

use super::{ExprError, Substitutor};
use crate::execution::ExecutionState;
use crate::workflow::format_duration;

static VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\$\{([^}]+)\}").expect("variable pattern must compile"));

const ESCAPED: &str = "\\${";
const ESCAPE_PLACEHOLDER: &str = "\u{0}ESC_VAR\u{0}";

/// Default substitutor resolving references against an [`ExecutionState`].
#[derive(Debug, Clone)]
pub struct TemplateSubstitutor {
    session: String,
}

impl TemplateSubstitutor {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
        }
    }

    fn resolve(&self, path: &str, state: &ExecutionState) -> Result<Value, String> {
        let parts: Vec<&str> = path.trim().split('.').collect();
        let (namespace, rest) = match parts.split_first() {
            Some((first, rest)) if !first.is_empty() => (*first, rest),
            _ => return Err("empty variable reference".to_string()),
        };

        match namespace {
            "vars" => resolve_vars(rest, state),
            "steps" => resolve_steps(rest, state),
            "env" => match rest.first() {
                Some(name) => Ok(Value::String(env::var(name).unwrap_or_default())),
                None => Err("env requires a variable name".to_string()),
            },
            "loop" => resolve_loop(rest, state),
            "session" => Ok(Value::String(self.session.clone())),
            "run_id" => Ok(Value::String(state.run_id.clone())),
            "timestamp" => Ok(Value::String(Utc::now().to_rfc3339())),
            "workflow" => Ok(Value::String(state.workflow_id.clone())),
            other => Err(format!("unknown variable namespace: {}", other)),
        }
    }
}

impl Substitutor for TemplateSubstitutor {
    fn substitute(&self, text: &str, state: &ExecutionState) -> Result<String, ExprError> {
        let escaped = text.replace(ESCAPED, ESCAPE_PLACEHOLDER);
        let mut first_error: Option<ExprError> = None;

        let expanded = VAR_PATTERN.replace_all(&escaped, |caps: &Captures| {
            let (path, default) = split_default(&caps[1]);
            match (self.resolve(path, state), default) {
                (Ok(value), _) => format_value(&value),
                (Err(_), Some(default)) => default.to_string(),
                (Err(message), None) => {
                    if first_error.is_none() {
                        first_error = Some(ExprError::Substitution {
                            reference: path.to_string(),
                            message,
                        });
                    }
                    caps[0].to_string()
                }
            }
        });

        match first_error {
            Some(err) => Err(err),
            None => Ok(expanded.replace(ESCAPE_PLACEHOLDER, "${")),
        }
    }
}

/// Lists the paths referenced by `${...}` in a template, defaults stripped.
pub fn variable_references(text: &str) -> Vec<String> {
    let unescaped = text.replace(ESCAPED, "");
    VAR_PATTERN
        .captures_iter(&unescaped)
        .map(|caps| split_default(&caps[1]).0.to_string())
        .collect()
}

/// Splits `path | default` into its parts, stripping quotes from the default.
fn split_default(expr: &str) -> (&str, Option<&str>) {
    let Some((path, default)) = expr.split_once('|') else {
        return (expr.trim(), None);
    };
    let default = default.trim();
    let unquoted = ['"', '\'']
        .iter()
        .find_map(|q| default.strip_prefix(*q).and_then(|d| d.strip_suffix(*q)))
        .unwrap_or(default);
    (path.trim(), Some(unquoted))
}

fn resolve_vars(parts: &[&str], state: &ExecutionState) -> Result<Value, String> {
    let (name, nested) = parts
        .split_first()
        .ok_or_else(|| "vars requires a variable name".to_string())?;
    let value = state
        .variables
        .get(*name)
        .ok_or_else(|| format!("undefined variable: {}", name))?;
    navigate_nested(value, nested)
}

fn resolve_loop(parts: &[&str], state: &ExecutionState) -> Result<Value, String> {
    let (field, nested) = parts
        .split_first()
        .ok_or_else(|| "loop requires a field name".to_string())?;
    let value = state
        .variables
        .get(&format!("loop.{}", field))
        .ok_or_else(|| format!("loop variable not set: {}", field))?;
    navigate_nested(value, nested)
}

fn resolve_steps(parts: &[&str], state: &ExecutionState) -> Result<Value, String> {
    let [step_id, field, nested @ ..] = parts else {
        return Err("steps requires step ID and field".to_string());
    };

    // Published variables win over the raw result
    if let Some(value) = state.variables.get(&format!("steps.{}.{}", step_id, field)) {
        return navigate_nested(value, nested);
    }

    let result = state
        .steps
        .get(*step_id)
        .ok_or_else(|| format!("step not found: {}", step_id))?;
    let no_data = || format!("step {} has no parsed data", step_id);

    match *field {
        "output" if nested.is_empty() => Ok(Value::String(result.output.clone())),
        "output" | "data" => match &result.parsed_data {
            Some(data) => navigate_nested(data, nested),
            None => Err(no_data()),
        },
        "pane" => Ok(Value::String(result.pane_used.clone().unwrap_or_default())),
        "agent" => Ok(Value::String(result.agent_type.clone().unwrap_or_default())),
        "status" => Ok(Value::String(result.status.as_str().to_string())),
        "duration" => {
            let duration = result
                .duration()
                .and_then(|d| d.to_std().ok())
                .unwrap_or_default();
            Ok(Value::String(format_duration(duration)))
        }
        // steps.<group>.<sub>.<field>
        sub => match result.parsed_data.as_ref().and_then(|data| data.get(sub)) {
            Some(entry) => navigate_nested(entry, nested),
            None => Err(format!("unknown step field: {}", sub)),
        },
    }
}

/// Walks maps by key and arrays by numeric index.
pub fn navigate_nested(value: &Value, parts: &[&str]) -> Result<Value, String> {
    let mut current = value;
    for part in parts {
        current = match current {
            Value::Object(map) => map
                .get(*part)
                .ok_or_else(|| format!("field '{}' not found", part))?,
            Value::Array(items) => {
                let index: usize = part
                    .parse()
                    .map_err(|_| format!("invalid array index '{}': must be numeric", part))?;
                items.get(index).ok_or_else(|| {
                    format!("array index {} out of bounds (length: {})", index, items.len())
                })?
            }
            Value::Null => return Err(format!("cannot access '{}' on null value", part)),
            _ => return Err(format!("cannot access field '{}' on a scalar", part)),
        };
    }
    Ok(current.clone())
}

/// Renders a value for insertion into text.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}
