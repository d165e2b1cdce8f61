//! Execution State
//!
//! Everything a run records about itself: per-step results, live variables,
//! the error log and the overall status. One `ExecutionState` belongs to
//! exactly one run and is never reused.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of a run or of a single step.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl ExecutionStatus {
    /// Returns true for statuses a step or run never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of step and run errors.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed dependency graph
    Dependency,
    /// Guard condition could not be evaluated
    Condition,
    /// Prompt source missing or unreadable
    Prompt,
    /// No eligible agent
    Routing,
    /// Prompt delivery failed
    Send,
    /// Output capture failed
    Capture,
    /// Step, group or run budget exceeded
    Timeout,
    /// Output parsing failed (non-fatal)
    Parse,
    Parallel,
    ParallelFailFast,
    ParallelTimeout,
    Cancelled,
    /// Scheduler invariant violated
    Internal,
}

impl ErrorKind {
    /// Returns true for failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Send | ErrorKind::Capture | ErrorKind::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Dependency => "dependency",
            ErrorKind::Condition => "condition",
            ErrorKind::Prompt => "prompt",
            ErrorKind::Routing => "routing",
            ErrorKind::Send => "send",
            ErrorKind::Capture => "capture",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Parse => "parse",
            ErrorKind::Parallel => "parallel",
            ErrorKind::ParallelFailFast => "parallel_fail_fast",
            ErrorKind::ParallelTimeout => "parallel_timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Error detail attached to a step result.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
    /// Attempt the error occurred on (0 before any attempt)
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            attempt: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn at_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

/// Outcome of one step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepResult {
    pub step_id: String,
    pub status: ExecutionStatus,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl StepResult {
    /// Creates a running result stamped with the current time.
    pub fn started(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: ExecutionStatus::Running,
            attempts: 0,
            started_at: Utc::now(),
            finished_at: None,
            pane_used: None,
            agent_type: None,
            output: String::new(),
            parsed_data: None,
            error: None,
            skip_reason: None,
        }
    }

    /// Creates a skipped result.
    pub fn skipped(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut result = Self::started(step_id);
        result.skip_reason = Some(reason.into());
        result.finish(ExecutionStatus::Skipped)
    }

    /// Creates a cancelled result for a step that never started.
    pub fn cancelled(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut result = Self::started(step_id);
        result.skip_reason = Some(reason.into());
        result.finish(ExecutionStatus::Cancelled)
    }

    /// Stamps a terminal status and finish time.
    pub fn finish(mut self, status: ExecutionStatus) -> Self {
        self.status = status;
        self.finished_at = Some(Utc::now());
        self
    }

    /// Marks the result failed with the given error.
    pub fn fail(mut self, error: StepError) -> Self {
        self.error = Some(error);
        self.finish(ExecutionStatus::Failed)
    }

    /// Wall-clock duration, if finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// Entry in the run's append-only error log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// False for warnings such as parse failures
    pub fatal: bool,
}

impl ExecutionError {
    pub fn fatal(step_id: Option<&str>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            step_id: step_id.map(str::to_string),
            kind,
            message: message.into(),
            timestamp: Utc::now(),
            fatal: true,
        }
    }

    pub fn warning(step_id: Option<&str>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            fatal: false,
            ..Self::fatal(step_id, kind, message)
        }
    }
}

/// Complete state of one workflow run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionState {
    pub run_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub steps: HashMap<String, StepResult>,
    pub variables: HashMap<String, Value>,
    pub errors: Vec<ExecutionError>,
}

impl ExecutionState {
    /// Creates a running state for a fresh run.
    pub fn new(run_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Running,
            started_at: now,
            updated_at: now,
            finished_at: None,
            current_step: None,
            steps: HashMap::new(),
            variables: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Stores a step result.
    ///
    /// A terminal result is final: later writes for the same step are
    /// dropped with a warning and `false` is returned.
    pub fn record_result(&mut self, result: StepResult) -> bool {
        if let Some(existing) = self.steps.get(&result.step_id) {
            if existing.status.is_terminal() {
                warn!(
                    "Ignoring second result for step '{}' ({} -> {})",
                    result.step_id, existing.status, result.status
                );
                return false;
            }
        }
        self.updated_at = Utc::now();
        self.steps.insert(result.step_id.clone(), result);
        true
    }

    /// Appends to the error log.
    pub fn push_error(&mut self, error: ExecutionError) {
        self.updated_at = Utc::now();
        self.errors.push(error);
    }

    /// Publishes a step's output under `steps.<id>.output` / `steps.<id>.data`
    /// and, when given, under the step's output variable.
    pub fn publish_output(&mut self, result: &StepResult, output_var: Option<&str>) {
        let id = &result.step_id;
        self.variables
            .insert(format!("steps.{}.output", id), Value::String(result.output.clone()));
        if let Some(data) = &result.parsed_data {
            self.variables.insert(format!("steps.{}.data", id), data.clone());
        }
        if let Some(var) = output_var {
            let value = result
                .parsed_data
                .clone()
                .unwrap_or_else(|| Value::String(result.output.clone()));
            self.variables.insert(var.to_string(), value);
        }
        self.updated_at = Utc::now();
    }

    /// Number of step results in a terminal status.
    pub fn terminal_count(&self) -> usize {
        self.steps.values().filter(|r| r.status.is_terminal()).count()
    }

    /// Stamps the final status and finish time.
    pub fn finish(&mut self, status: ExecutionStatus) {
        let now = Utc::now();
        self.status = status;
        self.current_step = None;
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    /// Returns the first fatal error, if any.
    pub fn first_fatal(&self) -> Option<&ExecutionError> {
        self.errors.iter().find(|e| e.fatal)
    }
}

/// Generates a run identifier: `run-YYYYMMDD-HHMMSS-<8 hex>`.
pub fn generate_run_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("run-{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Skipped.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Pending.is_terminal());
    }

    #[test]
    fn test_record_result_is_write_once() {
        let mut state = ExecutionState::new("run-1", "wf");

        assert!(state.record_result(StepResult::started("a")));
        assert!(state.record_result(StepResult::started("a").finish(ExecutionStatus::Completed)));
        assert!(!state.record_result(StepResult::started("a").finish(ExecutionStatus::Failed)));

        assert_eq!(state.steps["a"].status, ExecutionStatus::Completed);
        assert_eq!(state.terminal_count(), 1);
    }

    #[test]
    fn test_publish_output() {
        let mut state = ExecutionState::new("run-1", "wf");
        let mut result = StepResult::started("review").finish(ExecutionStatus::Completed);
        result.output = "raw text".to_string();
        result.parsed_data = Some(serde_json::json!({"ok": true}));

        state.publish_output(&result, Some("findings"));

        assert_eq!(state.variables["steps.review.output"], "raw text");
        assert_eq!(state.variables["steps.review.data"]["ok"], true);
        assert_eq!(state.variables["findings"]["ok"], true);
    }

    #[test]
    fn test_skipped_and_cancelled_constructors() {
        let skipped = StepResult::skipped("a", "condition false");
        assert_eq!(skipped.status, ExecutionStatus::Skipped);
        assert_eq!(skipped.attempts, 0);
        assert!(skipped.finished_at.is_some());

        let cancelled = StepResult::cancelled("b", "run cancelled");
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        assert_eq!(cancelled.skip_reason.as_deref(), Some("run cancelled"));
    }

    #[test]
    fn test_finish_stamps_time() {
        let mut state = ExecutionState::new("run-1", "wf");
        state.current_step = Some("a".to_string());
        state.finish(ExecutionStatus::Failed);

        assert_eq!(state.status, ExecutionStatus::Failed);
        assert!(state.finished_at.is_some());
        assert!(state.current_step.is_none());
    }

    #[test]
    fn test_error_log() {
        let mut state = ExecutionState::new("run-1", "wf");
        state.push_error(ExecutionError::warning(Some("a"), ErrorKind::Parse, "bad json"));
        state.push_error(ExecutionError::fatal(None, ErrorKind::Timeout, "too slow"));

        assert_eq!(state.errors.len(), 2);
        assert_eq!(state.first_fatal().unwrap().kind, ErrorKind::Timeout);
    }

    #[test]
    fn test_generate_run_id_format() {
        let id = generate_run_id();
        let parts: Vec<&str> = id.split('-').collect();

        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "run");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert_eq!(parts[3].len(), 8);
        assert!(parts[3].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(generate_run_id(), id);
    }

    #[test]
    fn test_serialization_names() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::ParallelFailFast).unwrap(),
            "\"parallel_fail_fast\""
        );
        assert_eq!(ErrorKind::ParallelTimeout.to_string(), "parallel_timeout");
        assert_eq!(serde_json::to_string(&ExecutionStatus::Skipped).unwrap(), "\"skipped\"");
    }
}
