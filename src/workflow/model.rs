//! Workflow Data Model
//!
//! Core data structures describing a workflow: steps that send prompts to
//! agents, the policies that govern waiting and failure, and the
//! workflow-wide variables and settings.
//!
//! # Example YAML Format
//!
//! ```yaml
//! schema_version: "2.0"
//! name: review-and-fix
//! vars:
//!   target:
//!     default: src/lib.rs
//! settings:
//!   timeout: 20m
//!   on_error: fail
//! steps:
//!   - id: review
//!     agent: claude
//!     prompt: "Review ${vars.target} and list problems as JSON"
//!     output_var: findings
//!     output_parse:
//!       type: json
//!
//!   - id: fixes
//!     depends_on: [review]
//!     parallel:
//!       - id: fix_codex
//!         agent: codex
//!         prompt: "Fix: ${steps.review.output}"
//!       - id: fix_gemini
//!         agent: gemini
//!         prompt: "Write tests for: ${steps.review.output}"
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema version understood by this crate.
pub const SCHEMA_VERSION: &str = "2.0";

/// How the executor decides that an agent has finished with a prompt.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WaitPolicy {
    /// Poll the readiness detector until the agent is idle
    #[default]
    Completion,
    /// Same as `Completion`
    Idle,
    /// Wait out the step timeout unconditionally
    Time,
    /// Fire and forget
    None,
}

/// What happens when a step fails.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Abort the run (in a group: wait for all sub-steps, then fail)
    #[default]
    Fail,
    /// Inside a group: cancel sub-steps that have not started yet
    FailFast,
    /// Record the failure and keep going
    Continue,
    /// Retry the step up to `retry_count` more times
    Retry,
}

/// Delay growth between retry attempts.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffMode {
    #[default]
    None,
    Linear,
    Exponential,
}

impl BackoffMode {
    /// Delay before the retry that follows `attempt` (1-based).
    ///
    /// * `None` - `base`
    /// * `Linear` - `base * attempt`
    /// * `Exponential` - `base * 2^(attempt - 1)`
    pub fn delay(&self, base: Duration, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            BackoffMode::None => base,
            BackoffMode::Linear => base.saturating_mul(attempt),
            BackoffMode::Exponential => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                base.saturating_mul(factor)
            }
        }
    }
}

/// Strategy used to pick one agent among eligible candidates.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    #[default]
    #[serde(alias = "least_loaded")]
    LeastLoaded,
    #[serde(alias = "first_available")]
    FirstAvailable,
    #[serde(alias = "round_robin")]
    RoundRobin,
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoutingStrategy::LeastLoaded => "least-loaded",
            RoutingStrategy::FirstAvailable => "first-available",
            RoutingStrategy::RoundRobin => "round-robin",
        };
        write!(f, "{}", name)
    }
}

/// Output parsing formats.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParseKind {
    #[default]
    None,
    FirstLine,
    Lines,
    Json,
    Yaml,
    Regex,
}

/// How to turn captured agent output into structured data.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct OutputParse {
    #[serde(rename = "type", default)]
    pub kind: ParseKind,

    /// Regex pattern, required when `kind` is `regex`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl OutputParse {
    pub fn new(kind: ParseKind) -> Self {
        Self { kind, pattern: None }
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self {
            kind: ParseKind::Regex,
            pattern: Some(pattern.into()),
        }
    }

    /// Returns true if parsing is configured at all.
    pub fn is_enabled(&self) -> bool {
        self.kind != ParseKind::None
    }
}

/// Declaration of a workflow variable.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct VarDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Informational type hint (string, number, boolean, ...)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub var_type: Option<String>,
}

/// Workflow-wide settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Settings {
    /// Global timeout for the whole run
    #[serde(default, with = "duration_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// Default on-error policy for steps that don't set one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnError>,
}

/// A single unit of work: deliver a prompt to an agent, or run a group of
/// sub-steps concurrently.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Step {
    /// Unique identifier within the workflow
    pub id: String,

    /// Optional human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Agent type filter (claude, codex, gemini or an alias)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,

    /// Explicit pane index, bypasses routing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane: Option<u32>,

    /// Routing strategy for picking among candidate agents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RoutingStrategy>,

    /// Literal prompt text (may contain `${...}` references)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    /// Prompt read from a file, relative to the workflow file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_file: Option<PathBuf>,

    /// Guard condition; the step is skipped when it evaluates to false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,

    #[serde(default)]
    pub wait: WaitPolicy,

    /// Per-attempt timeout (per-group for parallel steps)
    #[serde(default, with = "duration_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// IDs of steps that must reach a terminal status first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnError>,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default, with = "duration_serde", skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<Duration>,

    #[serde(default)]
    pub retry_backoff: BackoffMode,

    /// Variable that receives this step's output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_var: Option<String>,

    #[serde(default)]
    pub output_parse: OutputParse,

    /// Sub-steps executed concurrently (mutually exclusive with `prompt`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parallel: Vec<Step>,
}

impl Step {
    /// Creates a prompt step.
    ///
    /// # Example
    ///
    /// ```
    /// use paneflow::workflow::{OnError, Step};
    ///
    /// let step = Step::new("review", "Review the diff")
    ///     .with_agent("claude")
    ///     .with_retry(2)
    ///     .depends_on("checkout");
    /// assert_eq!(step.on_error, Some(OnError::Retry));
    /// ```
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Self::bare(id)
        }
    }

    /// Creates a parallel group from a list of sub-steps.
    pub fn group(id: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            parallel: steps,
            ..Self::bare(id)
        }
    }

    fn bare(id: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            name: None,
            agent: None,
            pane: None,
            route: None,
            prompt: None,
            prompt_file: None,
            when: None,
            wait: WaitPolicy::default(),
            timeout: None,
            depends_on: Vec::new(),
            on_error: None,
            retry_count: 0,
            retry_delay: None,
            retry_backoff: BackoffMode::default(),
            output_var: None,
            output_parse: OutputParse::default(),
            parallel: Vec::new(),
        }
    }

    /// Adds a dependency on another step.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_pane(mut self, index: u32) -> Self {
        self.pane = Some(index);
        self
    }

    pub fn with_route(mut self, route: RoutingStrategy) -> Self {
        self.route = Some(route);
        self
    }

    pub fn with_prompt_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.prompt = None;
        self.prompt_file = Some(path.into());
        self
    }

    pub fn with_when(mut self, condition: impl Into<String>) -> Self {
        self.when = Some(condition.into());
        self
    }

    pub fn with_wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = Some(on_error);
        self
    }

    /// Sets the `retry` policy with the given number of extra attempts.
    pub fn with_retry(mut self, retry_count: u32) -> Self {
        self.on_error = Some(OnError::Retry);
        self.retry_count = retry_count;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration, backoff: BackoffMode) -> Self {
        self.retry_delay = Some(delay);
        self.retry_backoff = backoff;
        self
    }

    pub fn with_output(mut self, var: impl Into<String>, parse: OutputParse) -> Self {
        self.output_var = Some(var.into());
        self.output_parse = parse;
        self
    }

    /// Returns true if this step is a parallel group.
    pub fn is_parallel(&self) -> bool {
        !self.parallel.is_empty()
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Maximum number of attempts for this step.
    pub fn max_attempts(&self) -> u32 {
        match self.on_error {
            Some(OnError::Retry) => self.retry_count.saturating_add(1).max(1),
            _ => 1,
        }
    }

    /// Effective on-error policy given the workflow settings.
    pub fn effective_on_error(&self, settings: &Settings) -> OnError {
        self.on_error.or(settings.on_error).unwrap_or_default()
    }
}

/// A complete workflow definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Workflow {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub vars: HashMap<String, VarDef>,

    #[serde(default)]
    pub settings: Settings,

    #[serde(default)]
    pub steps: Vec<Step>,

    /// Directory that relative `prompt_file` paths resolve against
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

fn default_schema_version() -> String {
    SCHEMA_VERSION.to_string()
}

impl Workflow {
    /// Creates a new empty workflow.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema_version: default_schema_version(),
            name: name.into(),
            description: None,
            vars: HashMap::new(),
            settings: Settings::default(),
            steps: Vec::new(),
            base_dir: None,
        }
    }

    /// Creates a workflow from a list of steps.
    pub fn from_steps(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            steps,
            ..Self::new(name)
        }
    }

    /// Adds a top-level step, rejecting duplicate ids.
    pub fn add_step(&mut self, step: Step) -> Result<(), String> {
        if self.get_step(&step.id).is_some() {
            return Err(format!("Step '{}' already exists", step.id));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Declares a variable with a default value.
    pub fn with_var(mut self, name: impl Into<String>, default: Value) -> Self {
        self.vars.insert(
            name.into(),
            VarDef {
                default: Some(default),
                ..VarDef::default()
            },
        );
        self
    }

    /// Gets a step by ID, searching parallel groups too.
    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.all_steps().into_iter().find(|s| s.id == id)
    }

    /// Returns every step, with parallel sub-steps following their group.
    pub fn all_steps(&self) -> Vec<&Step> {
        let mut out = Vec::new();
        for step in &self.steps {
            out.push(step);
            out.extend(step.parallel.iter());
        }
        out
    }

    /// Returns the number of top-level steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Default for Workflow {
    fn default() -> Self {
        Self::new("")
    }
}

/// Maps agent aliases to their canonical type.
///
/// Unknown names are lowercased and passed through.
pub fn normalize_agent_type(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    match lower.as_str() {
        "claude" | "cc" | "claude-code" | "claude_code" => "claude".to_string(),
        "codex" | "cod" | "openai" => "codex".to_string(),
        "gemini" | "gmi" | "google" => "gemini".to_string(),
        _ => lower,
    }
}

/// Parses a duration such as `500ms`, `30s`, `5m`, `1h` or `1h30m`.
///
/// A bare number is taken as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let text = input.trim();
    if text.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("missing unit in duration '{}'", input))?;
        if digits == 0 {
            return Err(format!("invalid duration '{}'", input));
        }
        let value: f64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid number in duration '{}'", input))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let secs = match unit {
            "ms" => value / 1000.0,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            _ => return Err(format!("unknown unit '{}' in duration '{}'", unit, input)),
        };
        total += Duration::from_secs_f64(secs);
    }

    Ok(total)
}

/// Formats a duration the way `parse_duration` reads it.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis % 1000 != 0 {
        return format!("{}ms", millis);
    }
    let secs = duration.as_secs();
    if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Serde adapter for optional durations written as `"30s"` or a number of seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::de::{self, Deserializer};
    use serde::{Deserialize, Serializer};
    use serde_json::Value;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_str(&super::format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let val = Value::deserialize(deserializer)?;
        match val {
            Value::Null => Ok(None),
            Value::Number(n) => n
                .as_f64()
                .filter(|secs| *secs >= 0.0)
                .map(|secs| Some(Duration::from_secs_f64(secs)))
                .ok_or_else(|| de::Error::custom("duration must be a non-negative number")),
            Value::String(s) if s.trim().is_empty() => Ok(None),
            Value::String(s) => super::parse_duration(&s).map(Some).map_err(de::Error::custom),
            _ => Err(de::Error::custom("expected a duration string or number of seconds")),
        }
    }
}
