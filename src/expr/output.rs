//! Output Parsing
//!
//! Agents answer in free text, often with prose around the payload, so the
//! JSON mode searches for the first object or array and cuts it out of the
//! surrounding text when needed.

use regex::Regex;
use serde_json::{Map, Value};

use super::{ExprError, OutputParser};
use crate::workflow::{OutputParse, ParseKind};

/// Default output parser covering every [`ParseKind`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredOutputParser;

impl StructuredOutputParser {
    pub fn new() -> Self {
        Self
    }
}

impl OutputParser for StructuredOutputParser {
    fn parse(&self, text: &str, spec: &OutputParse) -> Result<Value, ExprError> {
        let text = text.trim();

        match spec.kind {
            ParseKind::None => Ok(Value::String(text.to_string())),
            ParseKind::FirstLine => Ok(Value::String(
                non_empty_lines(text).next().unwrap_or_default().to_string(),
            )),
            ParseKind::Lines => Ok(Value::Array(
                non_empty_lines(text)
                    .map(|line| Value::String(line.to_string()))
                    .collect(),
            )),
            ParseKind::Json => parse_json(text),
            ParseKind::Yaml => serde_yaml::from_str(text)
                .map_err(|e| ExprError::Parse(format!("failed to parse YAML: {}", e))),
            ParseKind::Regex => parse_regex(text, spec.pattern.as_deref().unwrap_or_default()),
        }
    }
}

fn non_empty_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().map(str::trim).filter(|line| !line.is_empty())
}

fn parse_json(text: &str) -> Result<Value, ExprError> {
    let start = text
        .find(['{', '['])
        .ok_or_else(|| ExprError::Parse("no JSON object or array found in output".to_string()))?;
    let candidate = &text[start..];

    serde_json::from_str(candidate).or_else(|first| {
        serde_json::from_str(extract_json_block(candidate))
            .map_err(|_| ExprError::Parse(format!("failed to parse JSON: {}", first)))
    })
}

/// Cuts the first balanced `{...}` or `[...]` block from the start of `s`.
///
/// Brackets inside string literals are ignored. Returns `s` unchanged when
/// it does not start with a bracket or the block never closes.
pub fn extract_json_block(s: &str) -> &str {
    let bytes = s.as_bytes();
    let (open, close) = match bytes.first() {
        Some(b'{') => (b'{', b'}'),
        Some(b'[') => (b'[', b']'),
        _ => return s,
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            _ if in_string => {}
            _ if c == open => depth += 1,
            _ if c == close => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return &s[..=i];
                }
            }
            _ => {}
        }
    }

    s
}

fn parse_regex(text: &str, pattern: &str) -> Result<Value, ExprError> {
    if pattern.is_empty() {
        return Err(ExprError::Parse("regex pattern is required".to_string()));
    }
    let re = Regex::new(pattern)
        .map_err(|e| ExprError::Parse(format!("invalid regex pattern: {}", e)))?;

    let Some(caps) = re.captures(text) else {
        return Ok(Value::Null);
    };
    let group_text = |m: Option<regex::Match<'_>>| {
        Value::String(m.map(|m| m.as_str().to_string()).unwrap_or_default())
    };

    let names: Vec<&str> = re.capture_names().flatten().collect();
    if !names.is_empty() {
        let map: Map<String, Value> = names
            .into_iter()
            .map(|name| (name.to_string(), group_text(caps.name(name))))
            .collect();
        return Ok(Value::Object(map));
    }

    if caps.len() == 1 {
        return Ok(group_text(caps.get(0)));
    }
    Ok(Value::Array(
        (1..caps.len()).map(|i| group_text(caps.get(i))).collect(),
    ))
}
